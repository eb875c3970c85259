use modmerge_core::Messages;
use modmerge_engine::{ConflictRecord, UserChoice};
use modmerge_runner::prompt::{choice_label, describe};
use modmerge_runner::{Aborted, MergeReporter};

/// Console reporter that asks the operator about every conflict.
pub struct InteractivePrompt {
    messages: Messages,
}

impl InteractivePrompt {
    pub fn new(messages: Messages) -> Self {
        Self { messages }
    }
}

impl MergeReporter for InteractivePrompt {
    fn success(&self, message: &str) {
        println!("  {}", message);
    }

    fn warning(&self, message: &str) {
        println!("! {}", message);
    }

    fn error(&self, message: &str) {
        eprintln!("x {}", message);
    }

    fn choose(&self, record: &ConflictRecord) -> anyhow::Result<UserChoice> {
        println!();
        println!("{}", describe(&self.messages, record));
        println!("{}", record.unified_diff());

        let labels: Vec<String> = UserChoice::ALL
            .iter()
            .map(|choice| choice_label(&self.messages, record, *choice))
            .collect();
        let picked = dialoguer::Select::new()
            .with_prompt(self.messages.t("CHOICE_PROMPT", &[]))
            .items(&labels)
            .default(0)
            .interact_opt()?;

        // Esc / q
        let Some(index) = picked else {
            return Err(Aborted.into());
        };
        UserChoice::from_order(index + 1).ok_or_else(|| anyhow::anyhow!("no choice #{}", index + 1))
    }
}

/// Console reporter for unattended runs.
pub struct QuietPrompt {
    policy: modmerge_runner::BatchPolicy,
}

impl QuietPrompt {
    pub fn new(choice: UserChoice) -> Self {
        Self {
            policy: modmerge_runner::BatchPolicy::new(choice),
        }
    }
}

impl MergeReporter for QuietPrompt {
    fn success(&self, message: &str) {
        println!("  {}", message);
    }

    fn warning(&self, message: &str) {
        println!("! {}", message);
    }

    fn error(&self, message: &str) {
        eprintln!("x {}", message);
    }

    fn choose(&self, record: &ConflictRecord) -> anyhow::Result<UserChoice> {
        self.policy.choose(record)
    }
}
