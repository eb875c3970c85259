//! Operator-facing message catalog.
//!
//! Messages are looked up by key and rendered by substituting `{}`
//! placeholders in order. Lookup goes localized catalog, then the default
//! English catalog, then the raw key.

use std::collections::HashMap;
use std::fmt::Display;
use std::path::Path;

const DEFAULT_CATALOG: &[(&str, &str)] = &[
    ("BASE_NOT_FOUND", "Base archive not found: {}"),
    ("BASE_INDEXED", "Indexed {} files from {} in {} ms"),
    ("MOD_EXTRACTED", "Extracted {} files from {}"),
    ("MOD_LIST", "Merging {} mod(s) over {}"),
    ("DUPLICATE_ENTRY", "Duplicate entry {} in {}, the copy from {} wins"),
    ("PATH_SUGGESTION", "{} does not match the base layout, the base ships it as {}"),
    ("PATH_CORRECTED", "Using corrected path {} for {}"),
    ("PATH_UNKNOWN", "{} is not part of the base archive, keeping it as an addition"),
    ("FILE_COPIED", "Copied {}"),
    ("FILE_IDENTICAL", "{} is identical in all mods"),
    ("FILE_NOT_SCRIPT", "{} cannot be merged, using the copy from {}"),
    ("FILE_MERGED", "Merged {} ({} mods)"),
    ("FILE_MERGED_WITH_CONFLICTS", "Merged {} with {} conflict(s) resolved"),
    ("FILE_PARSE_FAILED", "Could not parse {}: {}, using the copy from {}"),
    ("FILE_FAILED", "Failed to process {}: {}"),
    ("FILE_FAILED_FALLBACK", "Failed to merge {}: {}, using the copy from {}"),
    ("PACK_CREATED", "Merged archive written to {}"),
    ("REPORT_WRITTEN", "Resolution report written to {}"),
    ("CONFLICT_MODIFICATION", "{}: {} and {} both change {} (line {} / line {})"),
    ("CONFLICT_REMOVAL", "{}: {} removes {} defined by {} (line {})"),
    ("CHOICE_BASE", "Keep the version from {}"),
    ("CHOICE_MERGE", "Use the version from {}"),
    ("CHOICE_ALL_BASE", "Keep {} for all remaining conflicts"),
    ("CHOICE_ALL_MERGE", "Use {} for all remaining conflicts"),
    ("CHOICE_PROMPT", "Choose a resolution"),
    (
        "SUMMARY",
        "Processed {} files: {} copied, {} merged, {} merged with conflicts, {} failed",
    ),
];

const ZH_CATALOG: &[(&str, &str)] = &[
    ("BASE_NOT_FOUND", "基准压缩包不存在：{}"),
    ("BASE_INDEXED", "已索引 {} 个文件（{}），耗时 {} 毫秒"),
    ("MOD_EXTRACTED", "已解压 {} 个文件（来自 {}）"),
    ("DUPLICATE_ENTRY", "检测到重复文件 {}（{}），使用来自 {} 的版本"),
    ("PATH_SUGGESTION", "{} 与基准路径不一致，基准路径为 {}"),
    ("PATH_CORRECTED", "使用修正后的路径 {}（原路径 {}）"),
    ("FILE_MERGED", "已合并 {}（{} 个模组）"),
    ("FILE_MERGED_WITH_CONFLICTS", "已合并 {}，解决了 {} 个冲突"),
    ("FILE_FAILED_FALLBACK", "合并 {} 失败：{}，使用来自 {} 的版本"),
    ("CHOICE_BASE", "保留 {} 的版本"),
    ("CHOICE_MERGE", "使用 {} 的版本"),
    ("CHOICE_ALL_BASE", "剩余冲突全部保留 {}"),
    ("CHOICE_ALL_MERGE", "剩余冲突全部使用 {}"),
    ("CHOICE_PROMPT", "请选择解决方案"),
];

#[derive(Debug, Clone)]
pub struct Messages {
    default: HashMap<String, String>,
    local: HashMap<String, String>,
}

impl Default for Messages {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Messages {
    /// Build the catalog for `language`. Unknown languages use English only.
    pub fn new(language: Option<&str>) -> Self {
        let local = match language.map(|l| l.to_ascii_lowercase()) {
            Some(lang) if lang.starts_with("zh") => to_map(ZH_CATALOG),
            _ => HashMap::new(),
        };
        Self {
            default: to_map(DEFAULT_CATALOG),
            local,
        }
    }

    /// Merge entries from a JSON object file into the localized catalog.
    pub fn with_overrides(mut self, path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let overrides: HashMap<String, String> = serde_json::from_str(&content)?;
        self.local.extend(overrides);
        Ok(self)
    }

    pub fn t(&self, key: &str, args: &[&dyn Display]) -> String {
        let template = self
            .local
            .get(key)
            .filter(|text| !text.is_empty())
            .or_else(|| self.default.get(key).filter(|text| !text.is_empty()));
        match template {
            Some(template) => format_placeholders(template, args),
            None => key.to_string(),
        }
    }
}

fn to_map(entries: &[(&str, &str)]) -> HashMap<String, String> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Replace each `{}` with the next argument; extra placeholders stay as `{}`.
fn format_placeholders(template: &str, args: &[&dyn Display]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    let mut next = 0;
    while let Some(pos) = rest.find("{}") {
        out.push_str(&rest[..pos]);
        match args.get(next) {
            Some(arg) => out.push_str(&arg.to_string()),
            None => out.push_str("{}"),
        }
        next += 1;
        rest = &rest[pos + 2..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substitutes_in_order() {
        let messages = Messages::default();
        let text = messages.t("BASE_INDEXED", &[&3, &"data0.pak", &12]);
        assert_eq!(text, "Indexed 3 files from data0.pak in 12 ms");
    }

    #[test]
    fn test_missing_key_returns_key() {
        let messages = Messages::new(Some("zh"));
        assert_eq!(messages.t("NO_SUCH_KEY", &[&1]), "NO_SUCH_KEY");
    }

    #[test]
    fn test_falls_back_to_default_catalog() {
        let messages = Messages::new(Some("zh"));
        // Not translated, comes from the English catalog.
        assert_eq!(messages.t("FILE_COPIED", &[&"a.scr"]), "Copied a.scr");
        assert_eq!(messages.t("CHOICE_BASE", &[&"Mod1"]), "保留 Mod1 的版本");
    }

    #[test]
    fn test_surplus_placeholders_survive() {
        assert_eq!(format_placeholders("{} and {}", &[&"a"]), "a and {}");
        assert_eq!(format_placeholders("no args", &[&"a"]), "no args");
    }

    #[test]
    fn test_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("messages.json");
        std::fs::write(&path, r#"{"FILE_COPIED": "copy -> {}"}"#).unwrap();
        let messages = Messages::default().with_overrides(&path).unwrap();
        assert_eq!(messages.t("FILE_COPIED", &[&"x"]), "copy -> x");
    }
}
