use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use modmerge_core::config::CacheSettings;
use modmerge_engine::{ScriptTree, Syntax};
use modmerge_pak::{ArchiveIndex, ContentCache, PakError, PathLookup, TreeCache};

/// The vanilla archive every mod is merged against.
///
/// Regular files stay packed; their bytes are pulled through the content
/// cache on demand and parsed trees are kept in a bounded cache.
pub struct BaseArchive {
    index: ArchiveIndex,
    content: ContentCache,
    trees: TreeCache<ScriptTree>,
}

impl BaseArchive {
    /// Index `path`, using `cache_dir` for nested containers and cached content.
    pub fn load(path: &Path, cache_dir: &Path, cache: &CacheSettings) -> Result<Self, PakError> {
        if !path.is_file() {
            return Err(PakError::NotFound(path.to_path_buf()));
        }
        let started = Instant::now();
        let index = ArchiveIndex::index(path, &cache_dir.join("nested"))?;
        tracing::info!(
            archive = %path.display(),
            entries = index.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Base archive indexed"
        );
        Ok(Self {
            index,
            content: ContentCache::new(cache_dir.join("content")),
            trees: TreeCache::new(cache.max_trees, Duration::from_secs(cache.ttl_secs)),
        })
    }

    pub fn source(&self) -> &Path {
        self.index.source()
    }

    pub fn index(&self) -> &ArchiveIndex {
        &self.index
    }

    pub fn lookup(&self, entry_name: &str) -> PathLookup {
        self.index.lookup_path(entry_name)
    }

    /// Text of a base file, `None` when the base does not ship it.
    pub fn text(&self, entry_name: &str) -> anyhow::Result<Option<String>> {
        let Some(entry) = self.index.get(entry_name) else {
            return Ok(None);
        };
        let text = self
            .content
            .text(entry)
            .with_context(|| format!("reading {} from the base archive", entry_name))?;
        Ok(Some(text))
    }

    /// Parsed tree of a base file, shared through the tree cache.
    pub fn tree(
        &self,
        entry_name: &str,
        syntax: Syntax,
    ) -> anyhow::Result<Option<Arc<ScriptTree>>> {
        let Some(entry) = self.index.get(entry_name) else {
            return Ok(None);
        };
        let tree = self.trees.get_or_compute(entry_name, || -> anyhow::Result<ScriptTree> {
            let text = self.content.text(entry)?;
            let tree = syntax
                .parse(&text)
                .with_context(|| format!("parsing base {}", entry_name))?;
            Ok(tree)
        })?;
        Ok(Some(tree))
    }
}
