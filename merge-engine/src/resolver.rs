//! Turning a resolved [`TreeDiff`] back into script text.
//!
//! Only the spans the mod side wins are rewritten; everything else in the
//! base text, comments and formatting included, is carried over untouched.

use std::ops::Range;

use thiserror::Error;

use crate::comparator::{ConflictType, TreeDiff};
use crate::types::ScriptTree;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MergeError {
    #[error("conflict at {signature} in {file_name} has no resolution")]
    Unresolved { file_name: String, signature: String },
    #[error("overlapping edits at byte {offset}")]
    Overlap { offset: usize },
}

#[derive(Debug)]
struct Edit {
    span: Range<usize>,
    replacement: String,
}

/// Apply every resolution and addition in `diff` to the text of `base`.
///
/// Fails if any conflict is still unresolved. Two edits touching the same
/// bytes are a bug in the diff and are rejected rather than guessed at.
pub fn materialize(base: &ScriptTree, diff: &TreeDiff) -> Result<String, MergeError> {
    let mut edits = Vec::with_capacity(diff.conflicts.len() + diff.additions.len());

    for record in &diff.conflicts {
        let Some(choice) = record.resolution else {
            return Err(MergeError::Unresolved {
                file_name: record.file_name.clone(),
                signature: record.signature.clone(),
            });
        };
        if !choice.takes_mod() {
            continue;
        }
        let replacement = match (record.conflict_type, &record.mod_node) {
            (ConflictType::Modification, Some(node)) => node.text().to_string(),
            _ => String::new(),
        };
        edits.push(Edit {
            span: record.base_node.span(),
            replacement,
        });
    }

    for addition in &diff.additions {
        edits.push(Edit {
            span: addition.offset..addition.offset,
            replacement: addition.text.clone(),
        });
    }

    // Stable: additions sharing an offset keep the order the mod had them in.
    edits.sort_by_key(|e| (e.span.start, e.span.end));

    let text = base.text();
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for edit in &edits {
        if edit.span.start < cursor {
            return Err(MergeError::Overlap {
                offset: edit.span.start,
            });
        }
        out.push_str(&text[cursor..edit.span.start]);
        out.push_str(&edit.replacement);
        cursor = edit.span.end;
    }
    out.push_str(&text[cursor..]);
    Ok(out)
}
