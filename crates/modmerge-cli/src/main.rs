mod prompt;

use clap::{Parser, Subcommand, ValueEnum};
use modmerge_core::config::Settings;
use modmerge_core::logging::init_logging;
use modmerge_core::{Messages, PathCorrection, RunWorkspace};
use modmerge_engine::{SourceNames, Syntax, UserChoice};
use modmerge_pak::ArchiveIndex;
use modmerge_runner::{MergeReporter, MergeRequest, MergeRun};
use prompt::{InteractivePrompt, QuietPrompt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(
    name = "modmerge",
    about = "Merge game mod archives script construct by script construct"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the data directory (settings and logs)
    #[arg(long, default_value = ".modmerge")]
    data_dir: PathBuf,

    /// Settings file [default: <data-dir>/settings.json]
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(long, short)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Merge mods over a base archive
    Merge {
        /// Base (vanilla) archive
        #[arg(long)]
        base: PathBuf,
        /// Output archive; its extension picks the format
        #[arg(long)]
        output: PathBuf,
        /// How to settle conflicts that need a decision
        #[arg(long, value_enum, default_value_t = Policy::Prompt)]
        policy: Policy,
        /// Keep extracted files after the run
        #[arg(long)]
        keep_temp: bool,
        /// Mod archives, lowest priority first
        #[arg(required = true)]
        mods: Vec<PathBuf>,
    },
    /// List every file of an archive with its provenance
    Index {
        archive: PathBuf,
    },
    /// Print the signature tree of a script or XML file
    Tree {
        script: PathBuf,
    },
    /// Print the conflicts between two versions of a script or XML file
    Compare {
        base: PathBuf,
        modded: PathBuf,
    },
    /// Run interactive setup wizard
    Setup,
}

#[derive(Clone, Copy, ValueEnum)]
enum Policy {
    /// Ask for every conflict
    Prompt,
    /// Keep the earlier mod's version
    Base,
    /// Take the later mod's version
    Mod,
}

fn settings_path(cli: &Cli) -> PathBuf {
    cli.config
        .clone()
        .unwrap_or_else(|| cli.data_dir.join("settings.json"))
}

fn load_messages(settings: &Settings) -> anyhow::Result<Messages> {
    let messages = Messages::new(settings.language().as_deref());
    match &settings.messages_file {
        Some(path) => messages.with_overrides(path),
        None => Ok(messages),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load_or_default(&settings_path(&cli))?;

    match &cli.command {
        Commands::Setup => cmd_setup(&cli, settings).await,
        Commands::Merge {
            base,
            output,
            policy,
            keep_temp,
            mods,
        } => {
            let request = MergeRequest {
                base: base.clone(),
                mods: mods.clone(),
                output: output.clone(),
                keep_temp: *keep_temp,
            };
            cmd_merge(&cli, settings, request, *policy).await
        }
        Commands::Index { archive } => cmd_index(&settings, archive).await,
        Commands::Tree { script } => cmd_tree(&settings, script),
        Commands::Compare { base, modded } => cmd_compare(&settings, base, modded),
    }
}

async fn cmd_merge(
    cli: &Cli,
    settings: Settings,
    request: MergeRequest,
    policy: Policy,
) -> anyhow::Result<()> {
    let _guard = init_logging(&cli.data_dir.join("logs"), cli.verbose)?;
    let messages = load_messages(&settings)?;

    let reporter: Arc<dyn MergeReporter> = match policy {
        Policy::Prompt => Arc::new(InteractivePrompt::new(messages.clone())),
        Policy::Base => Arc::new(QuietPrompt::new(UserChoice::UseAllBase)),
        Policy::Mod => Arc::new(QuietPrompt::new(UserChoice::UseAllMerge)),
    };

    tracing::info!(
        base = %request.base.display(),
        mods = request.mods.len(),
        output = %request.output.display(),
        "Starting merge"
    );
    let run = MergeRun::new(settings, messages, reporter);
    let report = run.run(&request).await?;

    if report.summary.failed > 0 {
        tracing::warn!(failed = report.summary.failed, "Some files could not be merged");
    }
    Ok(())
}

async fn cmd_index(settings: &Settings, archive: &Path) -> anyhow::Result<()> {
    let workspace = RunWorkspace::new(settings.temp_root()).await?;
    let scratch = workspace.base_cache.clone();
    let path = archive.to_path_buf();
    let result = tokio::task::spawn_blocking(move || ArchiveIndex::index(&path, &scratch)).await?;
    workspace.cleanup().await?;
    let index = result?;

    for entry in index.entries() {
        println!(
            "{:>10}  {}  [{}]",
            entry.size,
            entry.entry_name,
            entry.provenance.join(" > ")
        );
    }
    for duplicate in index.duplicates() {
        println!(
            "duplicate {}: [{}] replaced by [{}]",
            duplicate.entry_name,
            duplicate.replaced.join(" > "),
            duplicate.kept.join(" > ")
        );
    }
    println!();
    println!("{} files", index.len());
    Ok(())
}

fn cmd_tree(settings: &Settings, script: &Path) -> anyhow::Result<()> {
    let tree = parse_file(settings, script)?;
    print!("{}", tree.outline());
    Ok(())
}

fn cmd_compare(settings: &Settings, base: &Path, modded: &Path) -> anyhow::Result<()> {
    let messages = load_messages(settings)?;
    let base_tree = parse_file(settings, base)?;
    let mod_tree = parse_file(settings, modded)?;
    let names = SourceNames {
        file_name: file_label(modded),
        base_source: base.display().to_string(),
        mod_source: modded.display().to_string(),
    };

    let result = modmerge_engine::diff(&base_tree, &mod_tree, &names);
    for record in &result.conflicts {
        println!("{}", modmerge_runner::prompt::describe(&messages, record));
        println!("{}", record.unified_diff());
    }
    for addition in &result.additions {
        let parent = if addition.parent_path.is_empty() {
            "<root>".to_string()
        } else {
            addition.parent_path.join(" > ")
        };
        println!("+ {} (in {})", addition.signature, parent);
    }
    println!(
        "{} conflict(s), {} addition(s)",
        result.conflicts.len(),
        result.additions.len()
    );
    Ok(())
}

fn parse_file(settings: &Settings, path: &Path) -> anyhow::Result<modmerge_engine::ScriptTree> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("reading {}: {}", path.display(), e))?;
    let syntax = if settings.merge.is_xml(&path.to_string_lossy()) {
        Syntax::Xml
    } else {
        Syntax::Script
    };
    syntax
        .parse(&text)
        .map_err(|e| anyhow::anyhow!("{}: {}", path.display(), e))
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

async fn cmd_setup(cli: &Cli, mut settings: Settings) -> anyhow::Result<()> {
    let path = settings_path(cli);

    println!();
    println!("ModMerge - Setup Wizard");
    println!("=======================");
    println!();

    let languages = vec!["en", "zh"];
    let current = settings
        .language
        .as_deref()
        .and_then(|l| languages.iter().position(|c| *c == l))
        .unwrap_or(0);
    let language_idx = dialoguer::Select::new()
        .with_prompt("Message language")
        .items(&languages)
        .default(current)
        .interact()?;
    settings.language = Some(languages[language_idx].to_string());

    settings.merge.auto_merge_novel = dialoguer::Confirm::new()
        .with_prompt("Take changes only one side made without asking?")
        .default(settings.merge.auto_merge_novel)
        .interact()?;

    let corrections = vec!["smart (use the base's path)", "keep (use the mod's path)"];
    let correction_idx = dialoguer::Select::new()
        .with_prompt("Mod files at a different path than the base")
        .items(&corrections)
        .default(match settings.merge.path_correction {
            PathCorrection::Smart => 0,
            PathCorrection::Keep => 1,
        })
        .interact()?;
    settings.merge.path_correction = if correction_idx == 0 {
        PathCorrection::Smart
    } else {
        PathCorrection::Keep
    };

    let extensions: String = dialoguer::Input::new()
        .with_prompt("Script extensions (comma separated)")
        .default(settings.merge.script_extensions.join(","))
        .interact_text()?;
    settings.merge.script_extensions = extensions
        .split(',')
        .map(|e| e.trim().trim_start_matches('.').to_string())
        .filter(|e| !e.is_empty())
        .collect();

    settings.cache.max_trees = dialoguer::Input::new()
        .with_prompt("Parsed scripts kept in memory")
        .default(settings.cache.max_trees)
        .interact_text()?;

    settings.save(&path)?;
    println!();
    println!("Configuration saved to {}", path.display());
    Ok(())
}
