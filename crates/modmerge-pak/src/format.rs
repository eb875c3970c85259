use std::fmt;
use std::path::Path;

use crate::error::{PakError, Result};

/// Container families understood by the indexer and the writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    /// `.pak` and `.zip`: central directory, random access per entry.
    Zip,
    /// `.7z`: solid blocks, entries are read sequentially.
    SevenZ,
}

impl ArchiveFormat {
    pub fn from_name(name: &str) -> Option<Self> {
        let (_, ext) = name.rsplit_once('.')?;
        match ext.to_ascii_lowercase().as_str() {
            "pak" | "zip" => Some(ArchiveFormat::Zip),
            "7z" => Some(ArchiveFormat::SevenZ),
            _ => None,
        }
    }

    /// Pick the format from `path`'s extension. No I/O happens here.
    pub fn detect(path: &Path) -> Result<Self> {
        path.file_name()
            .and_then(|n| n.to_str())
            .and_then(Self::from_name)
            .ok_or_else(|| PakError::UnsupportedFormat(path.to_path_buf()))
    }

    pub fn as_str(&self) -> &str {
        match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::SevenZ => "7z",
        }
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether an entry with this name is itself a container to recurse into.
pub fn is_container_name(name: &str) -> bool {
    ArchiveFormat::from_name(name).is_some()
}
