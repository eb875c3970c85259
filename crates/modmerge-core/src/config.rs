use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub merge: MergeSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    /// Shared root for extraction and cache directories. Defaults to the OS temp dir.
    #[serde(default)]
    pub temp_root: Option<PathBuf>,
    /// Message catalog language (`en`, `zh`).
    #[serde(default)]
    pub language: Option<String>,
    /// JSON file with extra or overriding catalog entries.
    #[serde(default)]
    pub messages_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathCorrection {
    /// Rewrite a mod path to the base's canonical path for the same file name.
    #[default]
    Smart,
    /// Keep the mod's path as shipped.
    Keep,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeSettings {
    #[serde(default = "default_auto_merge_novel")]
    pub auto_merge_novel: bool,
    #[serde(default)]
    pub path_correction: PathCorrection,
    #[serde(default = "default_script_extensions")]
    pub script_extensions: Vec<String>,
    #[serde(default = "default_xml_extensions")]
    pub xml_extensions: Vec<String>,
}

impl Default for MergeSettings {
    fn default() -> Self {
        Self {
            auto_merge_novel: default_auto_merge_novel(),
            path_correction: PathCorrection::default(),
            script_extensions: default_script_extensions(),
            xml_extensions: default_xml_extensions(),
        }
    }
}

impl MergeSettings {
    /// Whether `entry_name` should go through the script parser.
    pub fn is_script(&self, entry_name: &str) -> bool {
        has_extension(&self.script_extensions, entry_name)
    }

    /// Whether `entry_name` should be merged element by element.
    pub fn is_xml(&self, entry_name: &str) -> bool {
        has_extension(&self.xml_extensions, entry_name)
    }
}

fn has_extension(known: &[String], entry_name: &str) -> bool {
    let Some((_, ext)) = entry_name.rsplit_once('.') else {
        return false;
    };
    known.iter().any(|k| k.eq_ignore_ascii_case(ext))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_max_trees")]
    pub max_trees: usize,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_trees: default_max_trees(),
            ttl_secs: default_ttl_secs(),
        }
    }
}

fn default_auto_merge_novel() -> bool {
    true
}
fn default_script_extensions() -> Vec<String> {
    vec!["scr".into(), "def".into(), "loot".into()]
}
fn default_xml_extensions() -> Vec<String> {
    vec!["xml".into()]
}
fn default_max_trees() -> usize {
    64
}
fn default_ttl_secs() -> u64 {
    600
}

impl Settings {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let settings: Settings = serde_json::from_str(&content)?;
        Ok(settings)
    }

    /// Load `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn temp_root(&self) -> PathBuf {
        self.temp_root.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// Configured catalog language, then `MODMERGE_LANG`.
    pub fn language(&self) -> Option<String> {
        self.language
            .clone()
            .or_else(|| std::env::var("MODMERGE_LANG").ok())
            .filter(|l| !l.is_empty())
    }
}
