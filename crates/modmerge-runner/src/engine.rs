use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use chrono::Utc;
use modmerge_core::config::MergeSettings;
use modmerge_core::{Messages, PathCorrection, RunWorkspace, Settings};
use modmerge_engine::{
    ChangeStatus, ConflictRecord, ResolutionSession, ScriptTree, SourceNames, Syntax, UserChoice,
    apply_resolution, diff, materialize,
};
use modmerge_pak::{ArchiveFormat, ArchiveIndex, EntryLocation, PathLookup, identical, pack_to_file};
use tokio::task::JoinSet;

use crate::base::BaseArchive;
use crate::prompt::{Aborted, MergeReporter};
use crate::report::{ConflictReport, FileAction, MergeReport};

#[derive(Debug, Clone)]
pub struct MergeRequest {
    pub base: PathBuf,
    /// Merge order: later mods are merged over earlier ones.
    pub mods: Vec<PathBuf>,
    pub output: PathBuf,
    /// Leave the run workspace on disk after the run.
    pub keep_temp: bool,
}

/// One file as shipped by one mod.
#[derive(Debug, Clone)]
struct ModFile {
    source: String,
    path: PathBuf,
}

/// Drives one merge from archives on disk to the packed output and report.
pub struct MergeRun {
    settings: Settings,
    messages: Arc<Messages>,
    reporter: Arc<dyn MergeReporter>,
}

impl MergeRun {
    pub fn new(settings: Settings, messages: Messages, reporter: Arc<dyn MergeReporter>) -> Self {
        Self {
            settings,
            messages: Arc::new(messages),
            reporter,
        }
    }

    pub async fn run(&self, request: &MergeRequest) -> anyhow::Result<MergeReport> {
        if !request.base.is_file() {
            let text = self
                .messages
                .t("BASE_NOT_FOUND", &[&request.base.display()]);
            self.reporter.error(&text);
            anyhow::bail!("{}", text);
        }
        if request.mods.is_empty() {
            anyhow::bail!("no mod archives to merge");
        }
        // Reject unknown formats before anything is extracted.
        ArchiveFormat::detect(&request.base)?;
        for path in &request.mods {
            ArchiveFormat::detect(path)?;
        }
        ArchiveFormat::detect(&request.output)?;

        let workspace = RunWorkspace::new(self.settings.temp_root()).await?;
        tracing::info!(root = %workspace.root.display(), "Run workspace created");

        let result = self.run_in(&workspace, request).await;

        if request.keep_temp {
            tracing::info!(root = %workspace.root.display(), "Keeping run workspace");
        } else if let Err(e) = workspace.cleanup().await {
            tracing::warn!(error = %e, "Failed to remove run workspace");
        }
        result
    }

    async fn run_in(
        &self,
        workspace: &RunWorkspace,
        request: &MergeRequest,
    ) -> anyhow::Result<MergeReport> {
        let report = MergeReport::new(&request.base, &request.mods, &request.output);
        self.reporter.success(&self.messages.t(
            "MOD_LIST",
            &[&request.mods.len(), &archive_name(&request.base)],
        ));

        let base = self.load_base(workspace, &request.base).await?;
        let mods = self.extract_mods(workspace, &request.mods).await?;
        let files = self.collect_files(&base, &mods);

        let merger = FileMerger {
            merge: self.settings.merge.clone(),
            messages: Arc::clone(&self.messages),
            reporter: Arc::clone(&self.reporter),
            base,
            staging: workspace.merged.clone(),
            session: ResolutionSession::new(),
        };
        let mut report =
            tokio::task::spawn_blocking(move || merger.merge_all(files, report)).await??;

        let staging = workspace.merged.clone();
        let output = request.output.clone();
        tokio::task::spawn_blocking(move || pack_to_file(&staging, &output))
            .await?
            .with_context(|| format!("packing {}", request.output.display()))?;
        self.reporter.success(
            &self
                .messages
                .t("PACK_CREATED", &[&request.output.display()]),
        );

        report.finished_at = Some(Utc::now());
        let report_path = MergeReport::path_for(&request.output);
        report.write(&report_path).await?;
        self.reporter.success(
            &self
                .messages
                .t("REPORT_WRITTEN", &[&report_path.display()]),
        );

        let summary = report.summary;
        self.reporter.success(&self.messages.t(
            "SUMMARY",
            &[
                &summary.processed,
                &summary.copied,
                &summary.merged,
                &summary.merged_with_conflicts,
                &summary.failed,
            ],
        ));
        Ok(report)
    }

    async fn load_base(
        &self,
        workspace: &RunWorkspace,
        path: &Path,
    ) -> anyhow::Result<Arc<BaseArchive>> {
        let started = Instant::now();
        let archive = path.to_path_buf();
        let cache_dir = workspace.base_cache.clone();
        let cache = self.settings.cache.clone();
        let base = tokio::task::spawn_blocking(move || BaseArchive::load(&archive, &cache_dir, &cache))
            .await?
            .with_context(|| format!("loading base archive {}", path.display()))?;

        self.reporter.success(&self.messages.t(
            "BASE_INDEXED",
            &[
                &base.index().len(),
                &archive_name(path),
                &started.elapsed().as_millis(),
            ],
        ));
        self.report_duplicates(base.index());
        Ok(Arc::new(base))
    }

    /// Extract every mod into its own directory, concurrently. The result
    /// keeps mod order.
    async fn extract_mods(
        &self,
        workspace: &RunWorkspace,
        mods: &[PathBuf],
    ) -> anyhow::Result<Vec<ArchiveIndex>> {
        let mut tasks = JoinSet::new();
        for (i, path) in mods.iter().enumerate() {
            let path = path.clone();
            let dest = workspace.mod_dir(i + 1);
            tasks.spawn_blocking(move || {
                let index = ArchiveIndex::extract_all(&path, &dest)
                    .with_context(|| format!("extracting mod {}", path.display()));
                (i, index)
            });
        }

        let mut slots: Vec<Option<ArchiveIndex>> = mods.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            let (i, index) = joined?;
            let index = index?;
            self.reporter.success(&self.messages.t(
                "MOD_EXTRACTED",
                &[&index.len(), &archive_name(index.source())],
            ));
            self.report_duplicates(&index);
            slots[i] = Some(index);
        }
        Ok(slots.into_iter().flatten().collect())
    }

    fn report_duplicates(&self, index: &ArchiveIndex) {
        for duplicate in index.duplicates() {
            self.reporter.warning(&self.messages.t(
                "DUPLICATE_ENTRY",
                &[
                    &duplicate.entry_name,
                    &archive_name(index.source()),
                    &duplicate.kept.join(" > "),
                ],
            ));
        }
    }

    /// Output path -> the mods shipping it, in mod order.
    fn collect_files(
        &self,
        base: &BaseArchive,
        mods: &[ArchiveIndex],
    ) -> BTreeMap<String, Vec<ModFile>> {
        let mut files: BTreeMap<String, Vec<ModFile>> = BTreeMap::new();
        for index in mods {
            let source = archive_name(index.source());
            for entry in index.entries() {
                let EntryLocation::Extracted(path) = &entry.location else {
                    continue;
                };
                let target = self.correct_path(base, &entry.entry_name);
                files.entry(target).or_default().push(ModFile {
                    source: source.clone(),
                    path: path.clone(),
                });
            }
        }
        files
    }

    fn correct_path(&self, base: &BaseArchive, entry_name: &str) -> String {
        match base.lookup(entry_name) {
            PathLookup::Exact => entry_name.to_string(),
            PathLookup::Suggested(canonical) => {
                self.reporter.warning(
                    &self
                        .messages
                        .t("PATH_SUGGESTION", &[&entry_name, &canonical]),
                );
                match self.settings.merge.path_correction {
                    PathCorrection::Smart => {
                        self.reporter.success(
                            &self
                                .messages
                                .t("PATH_CORRECTED", &[&canonical, &entry_name]),
                        );
                        canonical
                    }
                    PathCorrection::Keep => entry_name.to_string(),
                }
            }
            PathLookup::Unknown => {
                self.reporter
                    .warning(&self.messages.t("PATH_UNKNOWN", &[&entry_name]));
                entry_name.to_string()
            }
        }
    }
}

/// Per-file merging into the staging directory. Runs on the blocking pool
/// since it reads files and may wait on the operator.
struct FileMerger {
    merge: MergeSettings,
    messages: Arc<Messages>,
    reporter: Arc<dyn MergeReporter>,
    base: Arc<BaseArchive>,
    staging: PathBuf,
    session: ResolutionSession,
}

impl FileMerger {
    fn merge_all(
        mut self,
        files: BTreeMap<String, Vec<ModFile>>,
        mut report: MergeReport,
    ) -> anyhow::Result<MergeReport> {
        for (entry_name, sources) in files {
            let names = sources.iter().map(|s| s.source.clone()).collect();
            let action = match self.merge_file(&entry_name, &sources, &mut report) {
                Ok(action) => action,
                Err(e) if e.is::<Aborted>() => return Err(e),
                Err(e) => {
                    let reason = format!("{:#}", e);
                    tracing::error!(file = %entry_name, error = %reason, "File merge failed");
                    let fallback = self.stage_last(&entry_name, &sources);
                    match &fallback {
                        Some(source) => self.reporter.error(&self.messages.t(
                            "FILE_FAILED_FALLBACK",
                            &[&entry_name, &reason, source],
                        )),
                        None => self
                            .reporter
                            .error(&self.messages.t("FILE_FAILED", &[&entry_name, &reason])),
                    }
                    FileAction::Failed { reason, fallback }
                }
            };
            report.push_file(&entry_name, names, action);
        }
        Ok(report)
    }

    fn merge_file(
        &mut self,
        entry_name: &str,
        sources: &[ModFile],
        report: &mut MergeReport,
    ) -> anyhow::Result<FileAction> {
        let target = self.staging_path(entry_name);
        let (first, rest) = sources
            .split_first()
            .with_context(|| format!("no mod ships {}", entry_name))?;

        if rest.is_empty() {
            copy_file(&first.path, &target)?;
            self.reporter
                .success(&self.messages.t("FILE_COPIED", &[&entry_name]));
            return Ok(FileAction::Copied {
                source: first.source.clone(),
            });
        }

        let mut all_identical = true;
        for other in rest {
            if !identical(&first.path, &other.path)? {
                all_identical = false;
                break;
            }
        }
        if all_identical {
            copy_file(&first.path, &target)?;
            self.reporter
                .success(&self.messages.t("FILE_IDENTICAL", &[&entry_name]));
            return Ok(FileAction::Identical {
                source: first.source.clone(),
            });
        }

        let Some(syntax) = self.syntax(entry_name) else {
            let last = rest.last().unwrap_or(first);
            copy_file(&last.path, &target)?;
            self.reporter.warning(
                &self
                    .messages
                    .t("FILE_NOT_SCRIPT", &[&entry_name, &last.source]),
            );
            return Ok(FileAction::LastWins {
                source: last.source.clone(),
            });
        };

        self.merge_structured(entry_name, sources, &target, syntax, report)
    }

    fn syntax(&self, entry_name: &str) -> Option<Syntax> {
        if self.merge.is_xml(entry_name) {
            Some(Syntax::Xml)
        } else if self.merge.is_script(entry_name) {
            Some(Syntax::Script)
        } else {
            None
        }
    }

    /// Fold every mod into the first one, resolving each conflict by vanilla
    /// triage, the run default or the operator. Conflict reports reach the
    /// run report only once the merged file is written.
    fn merge_structured(
        &mut self,
        entry_name: &str,
        sources: &[ModFile],
        target: &Path,
        syntax: Syntax,
        report: &mut MergeReport,
    ) -> anyhow::Result<FileAction> {
        let mut trees = Vec::with_capacity(sources.len());
        for source in sources {
            match read_tree(&source.path, syntax)? {
                Ok(tree) => trees.push(tree),
                Err(reason) => return self.parse_fallback(entry_name, sources, source, target, reason),
            }
        }

        let vanilla = match self.base.tree(entry_name, syntax) {
            Ok(tree) => tree,
            Err(e) => {
                tracing::warn!(
                    file = %entry_name,
                    error = %format!("{:#}", e),
                    "Base script unusable, every difference needs a decision"
                );
                None
            }
        };

        let mut trees = trees.into_iter();
        let Some(mut merged) = trees.next() else {
            anyhow::bail!("no mod ships {}", entry_name);
        };
        let mut merged_label = sources[0].source.clone();
        let mut pending = Vec::new();

        for (source, modded) in sources[1..].iter().zip(trees) {
            let names = SourceNames {
                file_name: entry_name.to_string(),
                base_source: merged_label.clone(),
                mod_source: source.source.clone(),
            };
            let mut result = diff(&merged, &modded, &names);
            for record in &mut result.conflicts {
                let automatic = self.resolve(record, vanilla.as_deref())?;
                pending.push(ConflictReport::from_record(record, automatic));
            }

            let text = materialize(&merged, &result)?;
            merged = match syntax.parse(&text) {
                Ok(tree) => tree,
                Err(e) => {
                    return self.parse_fallback(entry_name, sources, source, target, e.to_string());
                }
            };
            merged_label = format!("{} + {}", merged_label, source.source);
        }

        write_file(target, merged.text().as_bytes())?;
        let conflicts = pending.len();
        report.conflicts.extend(pending);
        if conflicts == 0 {
            self.reporter.success(
                &self
                    .messages
                    .t("FILE_MERGED", &[&entry_name, &sources.len()]),
            );
        } else {
            self.reporter.success(&self.messages.t(
                "FILE_MERGED_WITH_CONFLICTS",
                &[&entry_name, &conflicts],
            ));
        }
        Ok(FileAction::Merged { conflicts })
    }

    /// Settle one record. Returns whether it was decided without the operator.
    fn resolve(
        &mut self,
        record: &mut ConflictRecord,
        vanilla: Option<&ScriptTree>,
    ) -> anyhow::Result<bool> {
        if self.merge.auto_merge_novel {
            match record.triage(vanilla) {
                ChangeStatus::Novel => {
                    apply_resolution(record, UserChoice::MergeMod);
                    return Ok(true);
                }
                ChangeStatus::Redundant => {
                    apply_resolution(record, UserChoice::BaseMod);
                    return Ok(true);
                }
                ChangeStatus::Conflicting => {}
            }
        }
        if self.session.adopt_default(record) {
            return Ok(true);
        }
        let choice = self.reporter.choose(record)?;
        self.session.apply(record, choice);
        Ok(false)
    }

    fn parse_fallback(
        &self,
        entry_name: &str,
        sources: &[ModFile],
        failed: &ModFile,
        target: &Path,
        reason: String,
    ) -> anyhow::Result<FileAction> {
        let last = sources.last().unwrap_or(failed);
        copy_file(&last.path, target)?;
        let subject = format!("{} ({})", entry_name, failed.source);
        self.reporter.warning(
            &self
                .messages
                .t("FILE_PARSE_FAILED", &[&subject, &reason, &last.source]),
        );
        Ok(FileAction::ParseFallback {
            source: last.source.clone(),
            reason,
        })
    }

    /// Stage the last mod's copy of a file whose merge failed. Returns the
    /// mod it came from, or `None` when even the copy fails.
    fn stage_last(&self, entry_name: &str, sources: &[ModFile]) -> Option<String> {
        let last = sources.last()?;
        match copy_file(&last.path, &self.staging_path(entry_name)) {
            Ok(()) => Some(last.source.clone()),
            Err(e) => {
                tracing::error!(
                    file = %entry_name,
                    error = %format!("{:#}", e),
                    "Could not stage the last mod's copy"
                );
                None
            }
        }
    }

    fn staging_path(&self, entry_name: &str) -> PathBuf {
        entry_name
            .split('/')
            .fold(self.staging.clone(), |path, part| path.join(part))
    }
}

/// Parse a script or XML file. The inner error is the reason it cannot be
/// parsed; the outer one is an I/O failure.
fn read_tree(path: &Path, syntax: Syntax) -> anyhow::Result<Result<ScriptTree, String>> {
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let parsed = match String::from_utf8(bytes) {
        Ok(text) => syntax.parse(&text).map_err(|e| e.to_string()),
        Err(_) => Err("not valid UTF-8".to_string()),
    };
    Ok(parsed)
}

fn copy_file(from: &Path, to: &Path) -> anyhow::Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(from, to).with_context(|| format!("copying {}", from.display()))?;
    Ok(())
}

fn write_file(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

fn archive_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::BatchPolicy;
    use crate::tests::{Recorder, write_zip};
    use modmerge_core::config::CacheSettings;

    const VANILLA: &[u8] = b"sub main() {\n    int x = 1;\n    speed(1.0);\n    jump(2);\n}\n";
    const MOD1: &[u8] = b"sub main() {\n    int x = 2;\n    speed(2.0);\n    jump(2);\n}\n";
    const MOD2: &[u8] =
        b"sub main() {\n    int x = 3;\n    speed(1.0);\n    jump(5);\n    crouch();\n}\n";

    struct Fixture {
        dir: tempfile::TempDir,
        request: MergeRequest,
        settings: Settings,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("data0.pak");
        let mod1 = dir.path().join("Mod1.pak");
        let mod2 = dir.path().join("Mod2.pak");
        write_zip(
            &base,
            &[
                ("data/scripts/player.scr", VANILLA),
                ("data/readme.txt", b"vanilla".as_slice()),
                ("data/textures/a.dds", b"DDS0".as_slice()),
            ],
        );
        write_zip(
            &mod1,
            &[
                ("data/scripts/player.scr", MOD1),
                ("data/readme.txt", b"same".as_slice()),
                ("data/textures/a.dds", b"DDS1".as_slice()),
                ("data/new.scr", b"extra();".as_slice()),
            ],
        );
        write_zip(
            &mod2,
            &[
                ("scripts/player.scr", MOD2),
                ("data/readme.txt", b"same".as_slice()),
                ("data/textures/a.dds", b"DDS2".as_slice()),
            ],
        );

        let settings = Settings {
            temp_root: Some(dir.path().join("tmp")),
            ..Settings::default()
        };
        let request = MergeRequest {
            base,
            mods: vec![mod1, mod2],
            output: dir.path().join("out").join("merged.pak"),
            keep_temp: false,
        };
        Fixture {
            dir,
            request,
            settings,
        }
    }

    fn read_output(fx: &Fixture, entry: &str) -> Vec<u8> {
        let index = ArchiveIndex::index(&fx.request.output, &fx.dir.path().join("check")).unwrap();
        index.get(entry).unwrap().read().unwrap()
    }

    #[tokio::test]
    async fn test_end_to_end_merge() {
        let fx = fixture();
        let recorder = Arc::new(Recorder::new(UserChoice::MergeMod));
        let run = MergeRun::new(fx.settings.clone(), Messages::default(), recorder.clone());
        let report = run.run(&fx.request).await.unwrap();

        // Only `x` differs from vanilla on both sides.
        assert_eq!(recorder.prompted(), vec!["variable:int:x".to_string()]);
        assert_eq!(
            String::from_utf8(read_output(&fx, "data/scripts/player.scr")).unwrap(),
            "sub main() {\n    int x = 3;\n    speed(2.0);\n    jump(5);\n    crouch();\n}\n"
        );
        assert_eq!(read_output(&fx, "data/readme.txt"), b"same");
        assert_eq!(read_output(&fx, "data/textures/a.dds"), b"DDS2");
        assert_eq!(read_output(&fx, "data/new.scr"), b"extra();");

        assert_eq!(report.summary.processed, 4);
        assert_eq!(report.summary.copied, 3);
        assert_eq!(report.summary.merged_with_conflicts, 1);
        assert_eq!(report.conflicts.len(), 3);
        let automatic = report.conflicts.iter().filter(|c| c.automatic).count();
        assert_eq!(automatic, 2);

        let player = report
            .files
            .iter()
            .find(|f| f.entry_name == "data/scripts/player.scr")
            .unwrap();
        assert_eq!(player.sources, vec!["Mod1.pak", "Mod2.pak"]);

        assert!(MergeReport::path_for(&fx.request.output).is_file());
        let warnings = recorder.warnings();
        assert!(warnings.iter().any(|w| w.contains("scripts/player.scr")));
        assert!(warnings.iter().any(|w| w.contains("data/new.scr")));

        // Workspace is gone.
        let leftovers = fs::read_dir(fx.dir.path().join("tmp")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_without_triage_every_record_uses_policy() {
        let mut fx = fixture();
        fx.settings.merge.auto_merge_novel = false;
        let run = MergeRun::new(
            fx.settings.clone(),
            Messages::default(),
            Arc::new(BatchPolicy::take_mod()),
        );
        let report = run.run(&fx.request).await.unwrap();

        assert_eq!(
            String::from_utf8(read_output(&fx, "data/scripts/player.scr")).unwrap(),
            "sub main() {\n    int x = 3;\n    speed(1.0);\n    jump(5);\n    crouch();\n}\n"
        );
        assert!(report
            .conflicts
            .iter()
            .all(|c| c.choice == "USE_ALL_MERGE"));
    }

    #[tokio::test]
    async fn test_path_correction_keep() {
        let mut fx = fixture();
        fx.settings.merge.path_correction = PathCorrection::Keep;
        let run = MergeRun::new(
            fx.settings.clone(),
            Messages::default(),
            Arc::new(BatchPolicy::keep_base()),
        );
        let report = run.run(&fx.request).await.unwrap();

        assert_eq!(read_output(&fx, "scripts/player.scr"), MOD2);
        assert_eq!(read_output(&fx, "data/scripts/player.scr"), MOD1);
        assert_eq!(report.summary.processed, 5);
    }

    #[tokio::test]
    async fn test_parse_failure_uses_last_mod() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("data0.pak");
        let mod1 = dir.path().join("Mod1.pak");
        let mod2 = dir.path().join("Mod2.pak");
        write_zip(&base, &[("a.scr", b"f(1);".as_slice())]);
        write_zip(&mod1, &[("a.scr", b"f(2".as_slice())]);
        write_zip(&mod2, &[("a.scr", b"f(3);".as_slice())]);
        let settings = Settings {
            temp_root: Some(dir.path().join("tmp")),
            ..Settings::default()
        };
        let output = dir.path().join("merged.zip");
        let request = MergeRequest {
            base,
            mods: vec![mod1, mod2],
            output: output.clone(),
            keep_temp: false,
        };
        let recorder = Arc::new(Recorder::new(UserChoice::BaseMod));
        let run = MergeRun::new(settings, Messages::default(), recorder.clone());
        let report = run.run(&request).await.unwrap();

        assert!(matches!(
            report.files[0].action,
            FileAction::ParseFallback { ref source, .. } if source == "Mod2.pak"
        ));
        assert!(recorder.prompted().is_empty());
        assert!(recorder.warnings().iter().any(|w| w.contains("Mod1.pak")));
        let index = ArchiveIndex::index(&output, &dir.path().join("check")).unwrap();
        assert_eq!(index.get("a.scr").unwrap().read().unwrap(), b"f(3);");
    }

    #[tokio::test]
    async fn test_xml_merges_by_element() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("data0.pak");
        let mod1 = dir.path().join("Mod1.pak");
        let mod2 = dir.path().join("Mod2.pak");
        let skills = |props: &str| {
            format!("<skills>\n  <skill id=\"Jump\">\n{}  </skill>\n</skills>\n", props)
        };
        let height = |v: &str| format!("    <prop n=\"Height\" v=\"{}\"/>\n", v);
        let boost = "    <prop n=\"Boost\" v=\"1\"/>\n";

        write_zip(&base, &[("data/skills.xml", skills(&height("1.5")).as_bytes())]);
        write_zip(&mod1, &[("data/skills.xml", skills(&height("3.0")).as_bytes())]);
        let mod2_props = format!("{}{}", height("1.5"), boost);
        write_zip(&mod2, &[("data/skills.xml", skills(&mod2_props).as_bytes())]);

        let settings = Settings {
            temp_root: Some(dir.path().join("tmp")),
            ..Settings::default()
        };
        let output = dir.path().join("merged.pak");
        let request = MergeRequest {
            base,
            mods: vec![mod1, mod2],
            output: output.clone(),
            keep_temp: false,
        };
        let recorder = Arc::new(Recorder::new(UserChoice::BaseMod));
        let run = MergeRun::new(settings, Messages::default(), recorder.clone());
        let report = run.run(&request).await.unwrap();

        // Mod2 left Height at vanilla, so Mod1's change stands without a prompt.
        assert!(recorder.prompted().is_empty());
        assert_eq!(report.files[0].action, FileAction::Merged { conflicts: 1 });
        assert_eq!(
            report.conflicts[0].location,
            "element:skills:0 > element:skill:Jump > element:prop:0"
        );
        let index = ArchiveIndex::index(&output, &dir.path().join("check")).unwrap();
        let merged = index.get("data/skills.xml").unwrap().read().unwrap();
        let expected_props = format!("{}{}", height("3.0"), boost);
        assert_eq!(String::from_utf8(merged).unwrap(), skills(&expected_props));
    }

    fn file_merger(dir: &Path, recorder: Arc<Recorder>) -> FileMerger {
        let base_path = dir.join("data0.pak");
        write_zip(&base_path, &[("a.scr", b"f(1);".as_slice())]);
        let base =
            BaseArchive::load(&base_path, &dir.join("base_cache"), &CacheSettings::default())
                .unwrap();
        FileMerger {
            merge: MergeSettings::default(),
            messages: Arc::new(Messages::default()),
            reporter: recorder,
            base: Arc::new(base),
            staging: dir.join("merged"),
            session: ResolutionSession::new(),
        }
    }

    /// A mod's extracted copy of `name`; `None` leaves it missing on disk.
    fn mod_file(dir: &Path, source: &str, name: &str, bytes: Option<&[u8]>) -> ModFile {
        let path = dir.join(source).join(name);
        if let Some(bytes) = bytes {
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, bytes).unwrap();
        }
        ModFile {
            source: source.to_string(),
            path,
        }
    }

    fn empty_report() -> MergeReport {
        MergeReport::new(Path::new("data0.pak"), &[], Path::new("merged.pak"))
    }

    #[test]
    fn test_failed_merge_ships_last_mod_copy() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder::new(UserChoice::MergeMod));
        let merger = file_merger(dir.path(), recorder.clone());
        let staging = merger.staging.clone();

        // Mod1's copy is unreadable, so the identity check fails.
        let mut files = BTreeMap::new();
        files.insert(
            "a.scr".to_string(),
            vec![
                mod_file(dir.path(), "Mod1.pak", "a.scr", None),
                mod_file(dir.path(), "Mod2.pak", "a.scr", Some(b"f(3);".as_slice())),
            ],
        );
        let report = merger.merge_all(files, empty_report()).unwrap();

        assert!(matches!(
            &report.files[0].action,
            FileAction::Failed { fallback: Some(source), .. } if source == "Mod2.pak"
        ));
        assert_eq!(report.summary.failed, 1);
        assert!(recorder.errors()[0].contains("Mod2.pak"));

        let output = dir.path().join("out.pak");
        pack_to_file(&staging, &output).unwrap();
        let index = ArchiveIndex::index(&output, &dir.path().join("check")).unwrap();
        assert_eq!(index.get("a.scr").unwrap().read().unwrap(), b"f(3);");
    }

    #[test]
    fn test_conflicts_of_unwritten_file_are_not_reported() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder::new(UserChoice::MergeMod));
        let merger = file_merger(dir.path(), recorder.clone());
        // A directory in the way makes both the merged write and the fallback fail.
        fs::create_dir_all(merger.staging.join("a.scr")).unwrap();

        let mut files = BTreeMap::new();
        files.insert(
            "a.scr".to_string(),
            vec![
                mod_file(dir.path(), "Mod1.pak", "a.scr", Some(b"f(2);".as_slice())),
                mod_file(dir.path(), "Mod2.pak", "a.scr", Some(b"f(3);".as_slice())),
            ],
        );
        let report = merger.merge_all(files, empty_report()).unwrap();

        assert_eq!(recorder.prompted(), vec!["funCall:f".to_string()]);
        assert!(report.conflicts.is_empty());
        assert!(matches!(
            report.files[0].action,
            FileAction::Failed { fallback: None, .. }
        ));
    }

    #[tokio::test]
    async fn test_abort_stops_the_run() {
        let fx = fixture();
        let recorder = Arc::new(Recorder::aborting());
        let run = MergeRun::new(fx.settings.clone(), Messages::default(), recorder);
        let err = run.run(&fx.request).await.unwrap_err();
        assert!(err.is::<Aborted>());
        assert!(!fx.request.output.exists());
    }

    #[tokio::test]
    async fn test_missing_base_fails_before_any_work() {
        let fx = fixture();
        let mut request = fx.request.clone();
        request.base = fx.dir.path().join("absent.pak");
        let recorder = Arc::new(Recorder::new(UserChoice::BaseMod));
        let run = MergeRun::new(fx.settings.clone(), Messages::default(), recorder.clone());

        let err = run.run(&request).await.unwrap_err();
        assert!(err.to_string().contains("absent.pak"));
        assert_eq!(recorder.errors().len(), 1);
        assert!(!fx.dir.path().join("tmp").exists());
    }

    #[tokio::test]
    async fn test_unsupported_output_is_rejected() {
        let fx = fixture();
        let mut request = fx.request.clone();
        request.output = fx.dir.path().join("merged.rar");
        let run = MergeRun::new(
            fx.settings.clone(),
            Messages::default(),
            Arc::new(BatchPolicy::keep_base()),
        );
        assert!(run.run(&request).await.is_err());
        assert!(!fx.dir.path().join("tmp").exists());
    }

    #[tokio::test]
    async fn test_keep_temp_leaves_workspace() {
        let mut fx = fixture();
        fx.request.keep_temp = true;
        let run = MergeRun::new(
            fx.settings.clone(),
            Messages::default(),
            Arc::new(BatchPolicy::keep_base()),
        );
        run.run(&fx.request).await.unwrap();

        let roots: Vec<_> = fs::read_dir(fx.dir.path().join("tmp"))
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(roots.len(), 1);
        assert!(roots[0].join("mod_1").join("data").join("new.scr").is_file());
        assert!(roots[0].join("mod_2").join("scripts").join("player.scr").is_file());
    }
}
