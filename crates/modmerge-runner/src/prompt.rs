use modmerge_core::Messages;
use modmerge_engine::{ConflictRecord, ConflictType, UserChoice};

/// Operator-facing side of a merge run: notifications plus the conflict
/// prompt. Implementations decide how (or whether) to show them.
pub trait MergeReporter: Send + Sync {
    fn success(&self, message: &str);

    fn warning(&self, message: &str);

    fn error(&self, message: &str);

    /// Decide one conflict. Returning [`Aborted`] stops the run.
    fn choose(&self, record: &ConflictRecord) -> anyhow::Result<UserChoice>;
}

/// One-line description of a conflict for prompts and logs.
pub fn describe(messages: &Messages, record: &ConflictRecord) -> String {
    let location = record.location();
    match (record.conflict_type, &record.mod_node) {
        (ConflictType::Modification, Some(modded)) => messages.t(
            "CONFLICT_MODIFICATION",
            &[
                &record.file_name,
                &record.base_source,
                &record.mod_source,
                &location,
                &record.base_node.line(),
                &modded.line(),
            ],
        ),
        _ => messages.t(
            "CONFLICT_REMOVAL",
            &[
                &record.file_name,
                &record.mod_source,
                &location,
                &record.base_source,
                &record.base_node.line(),
            ],
        ),
    }
}

/// Prompt label for `choice`, naming the side it keeps.
pub fn choice_label(messages: &Messages, record: &ConflictRecord, choice: UserChoice) -> String {
    let (key, side) = match choice {
        UserChoice::BaseMod => ("CHOICE_BASE", &record.base_source),
        UserChoice::MergeMod => ("CHOICE_MERGE", &record.mod_source),
        UserChoice::UseAllBase => ("CHOICE_ALL_BASE", &record.base_source),
        UserChoice::UseAllMerge => ("CHOICE_ALL_MERGE", &record.mod_source),
    };
    format!("{}. {}", choice.order(), messages.t(key, &[side]))
}

/// The operator cancelled the run from a prompt.
#[derive(Debug, thiserror::Error)]
#[error("merge aborted by the operator")]
pub struct Aborted;

/// Answers every conflict with the same choice and sends notifications to
/// the log.
#[derive(Debug, Clone, Copy)]
pub struct BatchPolicy {
    choice: UserChoice,
}

impl BatchPolicy {
    pub fn new(choice: UserChoice) -> Self {
        Self { choice }
    }

    pub fn keep_base() -> Self {
        Self::new(UserChoice::UseAllBase)
    }

    pub fn take_mod() -> Self {
        Self::new(UserChoice::UseAllMerge)
    }
}

impl MergeReporter for BatchPolicy {
    fn success(&self, message: &str) {
        tracing::info!("{}", message);
    }

    fn warning(&self, message: &str) {
        tracing::warn!("{}", message);
    }

    fn error(&self, message: &str) {
        tracing::error!("{}", message);
    }

    fn choose(&self, record: &ConflictRecord) -> anyhow::Result<UserChoice> {
        tracing::debug!(
            file = %record.file_name,
            signature = %record.signature,
            choice = %self.choice,
            "Batch resolution"
        );
        Ok(self.choice)
    }
}
