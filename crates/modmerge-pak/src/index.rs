//! Recursive container indexing.
//!
//! An [`ArchiveIndex`] maps every regular file reachable from a container,
//! including files inside containers nested at any depth, to where its bytes
//! live. Keys are canonical internal paths (forward slashes, no leading
//! separator). Directory entries are never indexed.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use sevenz_rust::{Password, SevenZReader};
use zip::read::ZipArchive;

use crate::error::{PakError, Result};
use crate::format::{is_container_name, ArchiveFormat};

static NEXT_NESTED_ID: AtomicU64 = AtomicU64::new(0);

/// Upper bound on buffer space reserved from an entry's declared size.
const PREALLOC_LIMIT: u64 = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryLocation {
    /// Bytes were materialized to this file.
    Extracted(PathBuf),
    /// Bytes are still inside `container` under the raw entry name.
    Packed { container: PathBuf, entry: String },
}

impl EntryLocation {
    pub fn read(&self) -> Result<Vec<u8>> {
        match self {
            EntryLocation::Extracted(path) => Ok(fs::read(path)?),
            EntryLocation::Packed { container, entry } => read_packed(container, entry),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Lowercased base name, for case-insensitive lookups.
    pub file_name: String,
    /// Canonical path inside the archive. Unique per index.
    pub entry_name: String,
    /// Container names from the outermost one down to the one holding this entry.
    pub provenance: Vec<String>,
    pub location: EntryLocation,
    pub size: u64,
}

impl ArchiveEntry {
    pub fn read(&self) -> Result<Vec<u8>> {
        self.location.read()
    }
}

/// Same canonical path reached twice; the later one replaced the earlier one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateEntry {
    pub entry_name: String,
    pub replaced: Vec<String>,
    pub kept: Vec<String>,
}

/// Result of matching a mod path against a base index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathLookup {
    Exact,
    /// No exact match, but the base ships a file at this canonical path
    /// that matches case-insensitively by path or by file name.
    Suggested(String),
    Unknown,
}

#[derive(Debug, Clone)]
pub struct ArchiveIndex {
    source: PathBuf,
    entries: BTreeMap<String, ArchiveEntry>,
    by_file_name: HashMap<String, String>,
    duplicates: Vec<DuplicateEntry>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Leave regular files packed; only nested containers hit the disk.
    Index,
    /// Materialize every regular file under the destination.
    Extract,
}

impl ArchiveIndex {
    /// Index `path` without extracting regular files. Nested containers are
    /// written under `scratch` so they can be opened in turn.
    pub fn index(path: &Path, scratch: &Path) -> Result<Self> {
        Self::build(path, scratch, Mode::Index)
    }

    /// Extract every regular file of `path` under `dest`, mirroring internal paths.
    ///
    /// Files written before a failure are left in place.
    pub fn extract_all(path: &Path, dest: &Path) -> Result<Self> {
        Self::build(path, dest, Mode::Extract)
    }

    fn build(path: &Path, dir: &Path, mode: Mode) -> Result<Self> {
        let format = ArchiveFormat::detect(path)?;
        if !path.is_file() {
            return Err(PakError::NotFound(path.to_path_buf()));
        }
        fs::create_dir_all(dir)?;

        let top = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut walker = Walker {
            mode,
            index: ArchiveIndex {
                source: path.to_path_buf(),
                entries: BTreeMap::new(),
                by_file_name: HashMap::new(),
                duplicates: Vec::new(),
            },
        };
        walker.walk(path, format, &[top], dir)?;

        tracing::debug!(
            archive = %path.display(),
            entries = walker.index.entries.len(),
            duplicates = walker.index.duplicates.len(),
            "Indexed archive"
        );
        Ok(walker.index)
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, entry_name: &str) -> Option<&ArchiveEntry> {
        self.entries.get(entry_name)
    }

    /// Entries ordered by canonical path.
    pub fn entries(&self) -> impl Iterator<Item = &ArchiveEntry> {
        self.entries.values()
    }

    pub fn duplicates(&self) -> &[DuplicateEntry] {
        &self.duplicates
    }

    /// Last indexed entry whose base name matches `file_name` case-insensitively.
    pub fn find_by_file_name(&self, file_name: &str) -> Option<&ArchiveEntry> {
        self.by_file_name
            .get(&file_name.to_lowercase())
            .and_then(|entry_name| self.entries.get(entry_name))
    }

    pub fn lookup_path(&self, entry_name: &str) -> PathLookup {
        if self.entries.contains_key(entry_name) {
            return PathLookup::Exact;
        }
        let lower = entry_name.to_lowercase();
        if let Some(found) = self.entries.keys().find(|k| k.to_lowercase() == lower) {
            return PathLookup::Suggested(found.clone());
        }
        match self.find_by_file_name(base_name(entry_name)) {
            Some(entry) => PathLookup::Suggested(entry.entry_name.clone()),
            None => PathLookup::Unknown,
        }
    }

    fn register(&mut self, entry: ArchiveEntry) {
        let lower = entry.file_name.clone();
        let entry_name = entry.entry_name.clone();
        let kept = entry.provenance.clone();

        if let Some(previous) = self.entries.insert(entry_name.clone(), entry) {
            tracing::warn!(
                entry = %entry_name,
                replaced = %previous.provenance.join(" > "),
                kept = %kept.join(" > "),
                "Duplicate archive entry, keeping the last one"
            );
            self.duplicates.push(DuplicateEntry {
                entry_name: entry_name.clone(),
                replaced: previous.provenance,
                kept,
            });
        }

        if let Some(other) = self.by_file_name.insert(lower, entry_name.clone()) {
            if other != entry_name {
                tracing::debug!(
                    file = %base_name(&entry_name),
                    previous = %other,
                    current = %entry_name,
                    "File name shipped at several paths, name lookups use the last one"
                );
            }
        }
    }
}

struct Walker {
    mode: Mode,
    index: ArchiveIndex,
}

impl Walker {
    fn walk(
        &mut self,
        container: &Path,
        format: ArchiveFormat,
        provenance: &[String],
        dest: &Path,
    ) -> Result<()> {
        match format {
            ArchiveFormat::Zip => self.walk_zip(container, provenance, dest),
            ArchiveFormat::SevenZ => self.walk_7z(container, provenance, dest),
        }
    }

    fn walk_zip(&mut self, container: &Path, provenance: &[String], dest: &Path) -> Result<()> {
        let mut archive = open_zip(container)?;
        for i in 0..archive.len() {
            let mut file = archive
                .by_index(i)
                .map_err(|e| PakError::malformed(container, e))?;
            if file.is_dir() {
                continue;
            }
            let raw = file.name().to_string();
            let size = file.size();
            self.visit(container, provenance, dest, &raw, size, &mut file)?;
        }
        Ok(())
    }

    fn walk_7z(&mut self, container: &Path, provenance: &[String], dest: &Path) -> Result<()> {
        let mut reader = SevenZReader::open(container, Password::empty())
            .map_err(|e| PakError::malformed(container, e))?;

        let mut failure: Option<PakError> = None;
        reader
            .for_each_entries(|entry, data| {
                if entry.is_directory() {
                    return Ok(true);
                }
                let raw = entry.name().to_string();
                let outcome = self
                    .visit(container, provenance, dest, &raw, entry.size(), data)
                    .and_then(|_| io::copy(data, &mut io::sink()).map_err(PakError::from));
                match outcome {
                    Ok(_) => Ok(true),
                    Err(e) => {
                        failure = Some(e);
                        Ok(false)
                    }
                }
            })
            .map_err(|e| PakError::malformed(container, e))?;

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn visit(
        &mut self,
        container: &Path,
        provenance: &[String],
        dest: &Path,
        raw: &str,
        size: u64,
        data: &mut dyn Read,
    ) -> Result<()> {
        let entry_name = normalize_entry_name(raw).ok_or_else(|| {
            PakError::malformed(container, format!("unsafe entry name {:?}", raw))
        })?;

        if is_container_name(&entry_name) {
            let nested_dir = allocate_nested_dir(dest, &entry_name);
            let nested_file = nested_dir
                .join("source")
                .join(sanitize_name(base_name(&entry_name)));
            write_entry(&nested_file, size, data)?;

            let format = ArchiveFormat::detect(&nested_file)?;
            let mut chain = provenance.to_vec();
            chain.push(entry_name);
            return self.walk(&nested_file, format, &chain, &nested_dir.join("files"));
        }

        let location = match self.mode {
            Mode::Extract => {
                let path = join_entry(dest, &entry_name);
                write_entry(&path, size, data)?;
                EntryLocation::Extracted(path)
            }
            Mode::Index => EntryLocation::Packed {
                container: container.to_path_buf(),
                entry: raw.to_string(),
            },
        };

        self.index.register(ArchiveEntry {
            file_name: base_name(&entry_name).to_lowercase(),
            entry_name,
            provenance: provenance.to_vec(),
            location,
            size,
        });
        Ok(())
    }
}

/// Read an entry to its end. The size recorded in the container only sizes
/// the initial buffer, since a corrupt header can claim anything.
fn read_declared<R: Read + ?Sized>(reader: &mut R, declared: u64) -> io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(declared.min(PREALLOC_LIMIT) as usize);
    reader.read_to_end(&mut buf)?;
    Ok(buf)
}

fn open_zip(path: &Path) -> Result<ZipArchive<BufReader<File>>> {
    let file = File::open(path)?;
    ZipArchive::new(BufReader::new(file)).map_err(|e| PakError::malformed(path, e))
}

fn read_packed(container: &Path, entry: &str) -> Result<Vec<u8>> {
    match ArchiveFormat::detect(container)? {
        ArchiveFormat::Zip => {
            let mut archive = open_zip(container)?;
            let mut file = archive
                .by_name(entry)
                .map_err(|_| PakError::MissingEntry(entry.to_string()))?;
            let declared = file.size();
            Ok(read_declared(&mut file, declared)?)
        }
        ArchiveFormat::SevenZ => {
            let mut reader = SevenZReader::open(container, Password::empty())
                .map_err(|e| PakError::malformed(container, e))?;
            let mut found: Option<io::Result<Vec<u8>>> = None;
            reader
                .for_each_entries(|candidate, data| {
                    if candidate.name() != entry {
                        return Ok(true);
                    }
                    found = Some(read_declared(data, candidate.size()));
                    Ok(false)
                })
                .map_err(|e| PakError::malformed(container, e))?;
            match found {
                Some(bytes) => Ok(bytes?),
                None => Err(PakError::MissingEntry(entry.to_string())),
            }
        }
    }
}

/// Forward slashes, no empty or `.` segments. `None` for empty names and
/// names escaping the root.
fn normalize_entry_name(raw: &str) -> Option<String> {
    let mut parts = Vec::new();
    for part in raw.split(['/', '\\']) {
        match part {
            "" | "." => continue,
            ".." => return None,
            p => parts.push(p),
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

fn join_entry(dest: &Path, entry_name: &str) -> PathBuf {
    entry_name
        .split('/')
        .fold(dest.to_path_buf(), |path, part| path.join(part))
}

fn base_name(entry_name: &str) -> &str {
    entry_name.rsplit('/').next().unwrap_or(entry_name)
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Fresh directory name for one nested container. Never reused within a
/// process, so concurrent recursions cannot overwrite each other.
fn allocate_nested_dir(parent: &Path, entry_name: &str) -> PathBuf {
    let id = NEXT_NESTED_ID.fetch_add(1, Ordering::Relaxed);
    let millis = chrono::Utc::now().timestamp_millis();
    parent.join(format!(
        "_nested_{}_{}_{}",
        millis,
        id,
        sanitize_name(base_name(entry_name))
    ))
}

fn write_entry(path: &Path, size: u64, data: &mut dyn Read) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = File::create(path)?;
    if size == 0 {
        return Ok(());
    }
    let mut out = BufWriter::new(file);
    io::copy(data, &mut out)?;
    out.flush()?;
    Ok(())
}
