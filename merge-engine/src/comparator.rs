//! Signature-level comparison of a base tree against a mod tree.
//!
//! Children are matched by signature. A construct present on both sides with
//! different content is a [`ConflictType::Modification`], one missing from
//! the mod is a [`ConflictType::Removal`], and one only the mod has is an
//! [`Addition`], which is never a conflict. Containers whose header matches
//! are compared child by child, so a conflict is reported once, at the
//! shallowest node that differs.

use std::fmt;

use similar::{ChangeTag, TextDiff};

use crate::types::{ChildMap, ScriptNode, ScriptTree};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConflictType {
    Modification,
    Removal,
}

impl ConflictType {
    pub fn as_str(&self) -> &str {
        match self {
            ConflictType::Modification => "MODIFICATION",
            ConflictType::Removal => "REMOVAL",
        }
    }
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator decision for a conflict. The `UseAll*` variants also become the
/// default for every later conflict of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UserChoice {
    BaseMod,
    MergeMod,
    UseAllBase,
    UseAllMerge,
}

impl UserChoice {
    pub const ALL: [UserChoice; 4] = [
        UserChoice::BaseMod,
        UserChoice::MergeMod,
        UserChoice::UseAllBase,
        UserChoice::UseAllMerge,
    ];

    /// Map the 1-based number shown in prompts to a choice.
    pub fn from_order(order: usize) -> Option<Self> {
        order
            .checked_sub(1)
            .and_then(|i| Self::ALL.get(i))
            .copied()
    }

    pub fn order(&self) -> usize {
        match self {
            UserChoice::BaseMod => 1,
            UserChoice::MergeMod => 2,
            UserChoice::UseAllBase => 3,
            UserChoice::UseAllMerge => 4,
        }
    }

    pub fn applies_to_all(&self) -> bool {
        matches!(self, UserChoice::UseAllBase | UserChoice::UseAllMerge)
    }

    /// Whether the mod side wins.
    pub fn takes_mod(&self) -> bool {
        matches!(self, UserChoice::MergeMod | UserChoice::UseAllMerge)
    }

    pub fn as_str(&self) -> &str {
        match self {
            UserChoice::BaseMod => "BASE_MOD",
            UserChoice::MergeMod => "MERGE_MOD",
            UserChoice::UseAllBase => "USE_ALL_BASE",
            UserChoice::UseAllMerge => "USE_ALL_MERGE",
        }
    }
}

impl fmt::Display for UserChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a conflicting change stands relative to the unmodified game file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeStatus {
    /// Only the mod side departs from vanilla.
    Novel,
    /// The mod side matches vanilla; only the base side changed.
    Redundant,
    /// Both sides depart from vanilla, or there is nothing to compare with.
    Conflicting,
}

/// Names used to label records.
#[derive(Debug, Clone, Default)]
pub struct SourceNames {
    pub file_name: String,
    pub base_source: String,
    pub mod_source: String,
}

#[derive(Debug, Clone)]
pub struct ConflictRecord {
    pub file_name: String,
    pub base_source: String,
    pub mod_source: String,
    pub signature: String,
    /// Signatures from the root down to this node.
    pub path: Vec<String>,
    pub base_node: ScriptNode,
    /// `None` for removals.
    pub mod_node: Option<ScriptNode>,
    pub conflict_type: ConflictType,
    pub resolution: Option<UserChoice>,
}

impl ConflictRecord {
    pub fn location(&self) -> String {
        self.path.join(" > ")
    }

    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }

    /// Compare both sides with the vanilla node at the same path.
    ///
    /// Without a vanilla node, a removal means the base side added the
    /// construct, which is kept as redundant; a modification is a conflict.
    pub fn triage(&self, vanilla: Option<&ScriptTree>) -> ChangeStatus {
        let original = vanilla.and_then(|tree| tree.find(&self.path));
        match (original, &self.mod_node) {
            (None, None) => ChangeStatus::Redundant,
            (None, Some(_)) => ChangeStatus::Conflicting,
            (Some(original), None) => {
                if self.base_node.same_content(original) {
                    ChangeStatus::Novel
                } else {
                    ChangeStatus::Conflicting
                }
            }
            (Some(original), Some(modded)) => {
                if self.base_node.same_content(original) {
                    ChangeStatus::Novel
                } else if modded.same_content(original) {
                    ChangeStatus::Redundant
                } else {
                    ChangeStatus::Conflicting
                }
            }
        }
    }

    /// Line diff from the base text to the mod text; removals diff against
    /// nothing.
    pub fn unified_diff(&self) -> String {
        let old = self.base_node.text();
        let new = self.mod_node.as_ref().map(|n| n.text()).unwrap_or("");
        let diff = TextDiff::from_lines(old, new);
        let mut out = String::new();
        for change in diff.iter_all_changes() {
            let sign = match change.tag() {
                ChangeTag::Delete => '-',
                ChangeTag::Insert => '+',
                ChangeTag::Equal => ' ',
            };
            out.push(sign);
            out.push_str(change.value());
            if change.missing_newline() {
                out.push('\n');
            }
        }
        out
    }
}

/// Text only the mod has, and where it goes in the base text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Addition {
    pub signature: String,
    pub parent_path: Vec<String>,
    /// Byte offset in the base text.
    pub offset: usize,
    pub text: String,
}

#[derive(Debug, Clone, Default)]
pub struct TreeDiff {
    pub conflicts: Vec<ConflictRecord>,
    pub additions: Vec<Addition>,
}

impl TreeDiff {
    pub fn is_empty(&self) -> bool {
        self.conflicts.is_empty() && self.additions.is_empty()
    }

    pub fn unresolved(&self) -> impl Iterator<Item = &ConflictRecord> {
        self.conflicts.iter().filter(|c| !c.is_resolved())
    }
}

/// Conflict records between `base` and `modded`.
pub fn compare(base: &ScriptTree, modded: &ScriptTree, names: &SourceNames) -> Vec<ConflictRecord> {
    diff(base, modded, names).conflicts
}

/// Conflicts plus pure additions between `base` and `modded`.
pub fn diff(base: &ScriptTree, modded: &ScriptTree, names: &SourceNames) -> TreeDiff {
    let mut out = TreeDiff::default();
    let mut path = Vec::new();
    diff_container(base.root(), modded.root(), &mut path, names, &mut out);
    tracing::debug!(
        file = %names.file_name,
        conflicts = out.conflicts.len(),
        additions = out.additions.len(),
        "Compared script trees"
    );
    out
}

fn diff_container(
    base: &ScriptNode,
    modded: &ScriptNode,
    path: &mut Vec<String>,
    names: &SourceNames,
    out: &mut TreeDiff,
) {
    let (Some(base_children), Some(mod_children)) = (base.children(), modded.children()) else {
        return;
    };

    for child in base_children.iter() {
        path.push(child.signature().to_string());
        match mod_children.get(child.signature()) {
            None => out
                .conflicts
                .push(record(names, path, child, None, ConflictType::Removal)),
            Some(twin) if child.same_content(twin) => {}
            Some(twin)
                if child.is_container() && twin.is_container() && child.header_matches(twin) =>
            {
                diff_container(child, twin, path, names, out)
            }
            Some(twin) => out.conflicts.push(record(
                names,
                path,
                child,
                Some(twin),
                ConflictType::Modification,
            )),
        }
        path.pop();
    }

    for (i, child) in mod_children.iter().enumerate() {
        if base_children.contains(child.signature()) {
            continue;
        }
        let (offset, text) = placement(base, base_children, modded, mod_children, i);
        out.additions.push(Addition {
            signature: child.signature().to_string(),
            parent_path: path.clone(),
            offset,
            text,
        });
    }
}

fn record(
    names: &SourceNames,
    path: &[String],
    base: &ScriptNode,
    modded: Option<&ScriptNode>,
    conflict_type: ConflictType,
) -> ConflictRecord {
    ConflictRecord {
        file_name: names.file_name.clone(),
        base_source: names.base_source.clone(),
        mod_source: names.mod_source.clone(),
        signature: base.signature().to_string(),
        path: path.to_vec(),
        base_node: base.clone(),
        mod_node: modded.cloned(),
        conflict_type,
        resolution: None,
    }
}

/// Insertion offset in the base text and the text to insert for the mod
/// child at `index`.
///
/// Statements and `elseif`/`else` clauses are placed separately: a clause
/// never lands inside an `if` body and a statement never lands between
/// clauses. The child goes after its nearest preceding sibling that the base
/// also has. Failing that it opens the base body (after `{`), follows the
/// base `if` body for clauses, or precedes the first top-level construct.
fn placement(
    base: &ScriptNode,
    base_children: &ChildMap,
    modded: &ScriptNode,
    mod_children: &ChildMap,
    index: usize,
) -> (usize, String) {
    let Some(child) = mod_children.at(index) else {
        return (0, String::new());
    };
    let clause = child.kind().is_clause();
    let same_lane = |n: &ScriptNode| n.kind().is_clause() == clause;
    let mod_text = modded.source().text();
    let child_span = child.span();

    let previous_in_mod = (0..index)
        .rev()
        .filter_map(|j| mod_children.at(j))
        .find(|n| same_lane(n));
    let anchor_in_base = (0..index)
        .rev()
        .filter_map(|j| mod_children.at(j))
        .filter(|n| same_lane(n))
        .find_map(|n| base_children.get(n.signature()));

    // Leading gap: whatever separated the child from what precedes it in the mod.
    let gap_start = match previous_in_mod {
        Some(previous) => Some(previous.span().end),
        None => lane_start(modded, clause).map(|tok| modded.source().byte_range(tok..tok + 1).end),
    };

    let offset = match anchor_in_base {
        Some(anchor) => Some(anchor.span().end),
        None => lane_start(base, clause).map(|tok| base.source().byte_range(tok..tok + 1).end),
    };

    match (offset, gap_start) {
        (Some(offset), Some(gap_start)) => (offset, mod_text[gap_start..child_span.end].to_string()),
        (Some(offset), None) => (offset, format!("\n{}", child.text())),
        (None, _) => {
            // Top level with nothing to follow: put it before the first base
            // construct, trailing separator included.
            let offset = base_children
                .iter()
                .find(|n| same_lane(n))
                .map(|n| n.span().start)
                .unwrap_or(base.source().text().len());
            let next_start = ((index + 1)..mod_children.len())
                .filter_map(|j| mod_children.at(j))
                .find(|n| same_lane(n))
                .map(|n| n.span().start);
            let text = match next_start {
                Some(next) => mod_text[child_span.start..next].to_string(),
                None => format!("{}\n", child.text()),
            };
            (offset, text)
        }
    }
}

/// Token after which the first node of a lane sits: the body `{` for
/// statements, the body `}` for clauses. `None` at the root.
fn lane_start(container: &ScriptNode, clause: bool) -> Option<usize> {
    let (open, close) = container.braces()?;
    Some(if clause { close } else { open })
}

/// Resolution state for one merge run.
#[derive(Debug, Default)]
pub struct ResolutionSession {
    run_default: Option<UserChoice>,
}

impl ResolutionSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run_default(&self) -> Option<UserChoice> {
        self.run_default
    }

    /// Resolve `record` with the run default, if one was chosen.
    pub fn adopt_default(&self, record: &mut ConflictRecord) -> bool {
        match self.run_default {
            Some(choice) => {
                apply_resolution(record, choice);
                true
            }
            None => false,
        }
    }

    pub fn apply(&mut self, record: &mut ConflictRecord, choice: UserChoice) {
        apply_resolution(record, choice);
        if choice.applies_to_all() {
            self.run_default = Some(choice);
        }
    }
}

/// Record `choice` on `record`.
pub fn apply_resolution(record: &mut ConflictRecord, choice: UserChoice) {
    if let Some(previous) = record.resolution {
        tracing::debug!(
            signature = %record.signature,
            previous = %previous,
            choice = %choice,
            "Conflict resolved twice, keeping the latest choice"
        );
    }
    record.resolution = Some(choice);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn names() -> SourceNames {
        SourceNames {
            file_name: "player.scr".into(),
            base_source: "Mod1".into(),
            mod_source: "Mod2".into(),
        }
    }

    #[test]
    fn test_one_modification() {
        let base = parse("A(\"x\"); B(\"y\");").unwrap();
        let modded = parse("A(\"x\"); B(\"z\");").unwrap();
        let conflicts = compare(&base, &modded, &names());
        assert_eq!(conflicts.len(), 1);
        let record = &conflicts[0];
        assert_eq!(record.signature, "funCall:B");
        assert_eq!(record.conflict_type, ConflictType::Modification);
        assert_eq!(record.mod_node.as_ref().unwrap().text(), "B(\"z\");");
        assert_eq!(record.file_name, "player.scr");
        assert_eq!(record.mod_source, "Mod2");
    }

    #[test]
    fn test_one_removal() {
        let base = parse("A(); B();").unwrap();
        let modded = parse("A();").unwrap();
        let conflicts = compare(&base, &modded, &names());
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].signature, "funCall:B");
        assert_eq!(conflicts[0].conflict_type, ConflictType::Removal);
        assert!(conflicts[0].mod_node.is_none());
    }

    #[test]
    fn test_identical_and_reformatted_trees_have_no_conflicts() {
        let base = parse("sub main() { int x = 1; f(1, 2); }").unwrap();
        let modded = parse("sub main()\n{\n    int x = 1; // same\n    f( 1,2 );\n}\n").unwrap();
        assert!(diff(&base, &modded, &names()).is_empty());
    }

    #[test]
    fn test_conflict_reported_at_deepest_changed_node() {
        let base = parse("sub main() { if (a) { f(1); g(); } h(); }").unwrap();
        let modded = parse("sub main() { if (a) { f(2); g(); } h(); }").unwrap();
        let conflicts = compare(&base, &modded, &names());
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].path, vec!["sub:main", "if", "funCall:f"]);
        assert_eq!(conflicts[0].location(), "sub:main > if > funCall:f");
    }

    #[test]
    fn test_header_change_is_one_conflict_at_container() {
        let base = parse("sub main() { if (a > 1) { f(); } }").unwrap();
        let modded = parse("sub main() { if (a > 2) { f(); } }").unwrap();
        let conflicts = compare(&base, &modded, &names());
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].signature, "if");
    }

    #[test]
    fn test_type_change_is_addition_plus_removal() {
        let base = parse("sub main() { int x = 1; }").unwrap();
        let modded = parse("sub main() { float x = 1; }").unwrap();
        let result = diff(&base, &modded, &names());

        assert_eq!(result.conflicts.len(), 1);
        assert_eq!(result.conflicts[0].signature, "variable:int:x");
        assert_eq!(result.conflicts[0].conflict_type, ConflictType::Removal);
        assert_eq!(result.additions.len(), 1);
        assert_eq!(result.additions[0].signature, "variable:float:x");
        assert_eq!(result.additions[0].parent_path, vec!["sub:main"]);
    }

    #[test]
    fn test_addition_placement() {
        let base_src = "sub main() {\n    a();\n    c();\n}\n";
        let base = parse(base_src).unwrap();
        let modded = parse("sub main() {\n    a();\n    b();\n    c();\n}\n").unwrap();
        let result = diff(&base, &modded, &names());
        assert_eq!(result.additions.len(), 1);
        let addition = &result.additions[0];
        assert_eq!(addition.offset, base_src.find("a();").unwrap() + 4);
        assert_eq!(addition.text, "\n    b();");
    }

    #[test]
    fn test_clause_is_placed_after_if_body() {
        let base_src = "if (a) { f(); }\n";
        let base = parse(base_src).unwrap();
        let modded = parse("if (a) { f(); } else { g(); }\n").unwrap();
        let result = diff(&base, &modded, &names());
        assert!(result.conflicts.is_empty());
        assert_eq!(result.additions.len(), 1);
        assert_eq!(result.additions[0].offset, base_src.find('}').unwrap() + 1);
        assert_eq!(result.additions[0].text, " else { g(); }");
    }

    #[test]
    fn test_user_choice_order() {
        assert_eq!(UserChoice::from_order(1), Some(UserChoice::BaseMod));
        assert_eq!(UserChoice::from_order(4), Some(UserChoice::UseAllMerge));
        assert_eq!(UserChoice::from_order(0), None);
        assert_eq!(UserChoice::from_order(5), None);
        for choice in UserChoice::ALL {
            assert_eq!(UserChoice::from_order(choice.order()), Some(choice));
        }
    }

    #[test]
    fn test_session_default_applies_to_later_records() {
        let base = parse("A(1); B(1); C(1);").unwrap();
        let modded = parse("A(2); B(2); C(2);").unwrap();
        let mut conflicts = compare(&base, &modded, &names());
        assert_eq!(conflicts.len(), 3);

        let mut session = ResolutionSession::new();
        assert!(!session.adopt_default(&mut conflicts[0]));
        session.apply(&mut conflicts[0], UserChoice::BaseMod);
        assert_eq!(session.run_default(), None);

        session.apply(&mut conflicts[1], UserChoice::UseAllMerge);
        assert!(session.adopt_default(&mut conflicts[2]));
        assert_eq!(conflicts[2].resolution, Some(UserChoice::UseAllMerge));
        assert!(conflicts.iter().all(|c| c.is_resolved()));
    }

    #[test]
    fn test_triage_against_vanilla() {
        let vanilla = parse("A(1); B(1); C(1); D(1);").unwrap();
        let merged = parse("A(1); B(5); C(5); D(1);").unwrap();
        let modded = parse("A(2); B(1); C(6);").unwrap();
        let conflicts = compare(&merged, &modded, &names());

        let status = |sig: &str| {
            conflicts
                .iter()
                .find(|c| c.signature == sig)
                .unwrap()
                .triage(Some(&vanilla))
        };
        assert_eq!(status("funCall:A"), ChangeStatus::Novel);
        assert_eq!(status("funCall:B"), ChangeStatus::Redundant);
        assert_eq!(status("funCall:C"), ChangeStatus::Conflicting);
        // Mod deleted an untouched vanilla construct.
        assert_eq!(status("funCall:D"), ChangeStatus::Novel);
    }

    #[test]
    fn test_triage_without_vanilla() {
        let merged = parse("A(1); B(1);").unwrap();
        let modded = parse("A(2);").unwrap();
        let conflicts = compare(&merged, &modded, &names());
        let removal = conflicts.iter().find(|c| c.signature == "funCall:B").unwrap();
        let change = conflicts.iter().find(|c| c.signature == "funCall:A").unwrap();
        assert_eq!(removal.triage(None), ChangeStatus::Redundant);
        assert_eq!(change.triage(None), ChangeStatus::Conflicting);
    }

    #[test]
    fn test_unified_diff() {
        let base = parse("sub main() {\n  f(1);\n}").unwrap();
        let modded = parse("sub main() {\n  f(2);\n}").unwrap();
        let conflicts = compare(&base, &modded, &names());
        assert_eq!(conflicts[0].unified_diff(), "-f(1);\n+f(2);\n");
    }
}
