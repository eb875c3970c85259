use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use modmerge_engine::ConflictRecord;
use serde::{Deserialize, Serialize};
use tokio::fs;

/// What happened to one output file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum FileAction {
    /// Only one mod ships the file.
    Copied { source: String },
    /// Every mod ships the same bytes.
    Identical { source: String },
    /// Not a script; the last mod's copy is used.
    LastWins { source: String },
    /// Script merged structurally. `conflicts` counts records, automatic ones included.
    Merged { conflicts: usize },
    /// A side failed to parse; the last mod's copy is used.
    ParseFallback { source: String, reason: String },
    /// Merging failed. `fallback` names the mod whose copy was staged in
    /// its place, if any.
    Failed {
        reason: String,
        fallback: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileReport {
    pub entry_name: String,
    /// Mod archives shipping the file, in merge order.
    pub sources: Vec<String>,
    #[serde(flatten)]
    pub action: FileAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictReport {
    pub file_name: String,
    pub signature: String,
    pub location: String,
    pub conflict_type: String,
    pub base_source: String,
    pub mod_source: String,
    pub base_line: usize,
    pub mod_line: Option<usize>,
    pub choice: String,
    /// Decided by vanilla triage or a run default rather than a prompt.
    pub automatic: bool,
}

impl ConflictReport {
    pub fn from_record(record: &ConflictRecord, automatic: bool) -> Self {
        Self {
            file_name: record.file_name.clone(),
            signature: record.signature.clone(),
            location: record.location(),
            conflict_type: record.conflict_type.to_string(),
            base_source: record.base_source.clone(),
            mod_source: record.mod_source.clone(),
            base_line: record.base_node.line(),
            mod_line: record.mod_node.as_ref().map(|n| n.line()),
            choice: record
                .resolution
                .map(|c| c.to_string())
                .unwrap_or_default(),
            automatic,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeSummary {
    pub processed: usize,
    pub copied: usize,
    pub merged: usize,
    pub merged_with_conflicts: usize,
    pub failed: usize,
}

impl MergeSummary {
    pub fn record(&mut self, action: &FileAction) {
        self.processed += 1;
        match action {
            FileAction::Copied { .. }
            | FileAction::Identical { .. }
            | FileAction::LastWins { .. }
            | FileAction::ParseFallback { .. } => self.copied += 1,
            FileAction::Merged { conflicts: 0 } => self.merged += 1,
            FileAction::Merged { .. } => self.merged_with_conflicts += 1,
            FileAction::Failed { .. } => self.failed += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeReport {
    pub base: String,
    pub mods: Vec<String>,
    pub output: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub files: Vec<FileReport>,
    pub conflicts: Vec<ConflictReport>,
    pub summary: MergeSummary,
}

impl MergeReport {
    pub fn new(base: &Path, mods: &[PathBuf], output: &Path) -> Self {
        Self {
            base: base.display().to_string(),
            mods: mods.iter().map(|m| m.display().to_string()).collect(),
            output: output.display().to_string(),
            started_at: Utc::now(),
            finished_at: None,
            files: Vec::new(),
            conflicts: Vec::new(),
            summary: MergeSummary::default(),
        }
    }

    pub fn push_file(&mut self, entry_name: &str, sources: Vec<String>, action: FileAction) {
        self.summary.record(&action);
        self.files.push(FileReport {
            entry_name: entry_name.to_string(),
            sources,
            action,
        });
    }

    /// `<output>.report.json`
    pub fn path_for(output: &Path) -> PathBuf {
        let mut name = output.as_os_str().to_owned();
        name.push(".report.json");
        PathBuf::from(name)
    }

    /// Write as pretty JSON. Uses tmp+rename for atomicity.
    pub async fn write(&self, path: &Path) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = path.with_file_name(format!(".{}.tmp", file_name));
        fs::write(&tmp, &content).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_counts() {
        let mut summary = MergeSummary::default();
        summary.record(&FileAction::Copied { source: "a".into() });
        summary.record(&FileAction::Merged { conflicts: 0 });
        summary.record(&FileAction::Merged { conflicts: 2 });
        summary.record(&FileAction::Failed {
            reason: "x".into(),
            fallback: Some("Mod2.pak".into()),
        });
        summary.record(&FileAction::ParseFallback {
            source: "b".into(),
            reason: "y".into(),
        });
        assert_eq!(
            summary,
            MergeSummary {
                processed: 5,
                copied: 2,
                merged: 1,
                merged_with_conflicts: 1,
                failed: 1,
            }
        );
    }

    #[test]
    fn test_report_path() {
        assert_eq!(
            MergeReport::path_for(Path::new("/out/merged.pak")),
            PathBuf::from("/out/merged.pak.report.json")
        );
    }

    #[tokio::test]
    async fn test_write_report() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("merged.pak");
        let mut report = MergeReport::new(Path::new("data0.pak"), &[PathBuf::from("m1.pak")], &output);
        report.push_file(
            "scripts/a.scr",
            vec!["m1.pak".into()],
            FileAction::Copied {
                source: "m1.pak".into(),
            },
        );
        let path = MergeReport::path_for(&output);
        report.write(&path).await.unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["files"][0]["action"], "copied");
        assert_eq!(json["files"][0]["entry_name"], "scripts/a.scr");
        assert_eq!(json["summary"]["copied"], 1);
    }
}
