use std::fs::{self, File};
use std::io::{self, BufReader, Cursor, Read, Write};
use std::path::{Path, PathBuf};

use sevenz_rust::{SevenZArchiveEntry, SevenZWriter};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::{PakError, Result};
use crate::format::ArchiveFormat;

const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Pack every regular file under `source_dir` into a container.
///
/// Entry names are paths relative to `source_dir` joined with `/`.
/// Zero-byte files become zero-length entries.
pub fn pack(source_dir: &Path, format: ArchiveFormat) -> Result<Vec<u8>> {
    let files = collect_files(source_dir)?;
    match format {
        ArchiveFormat::Zip => pack_zip(source_dir, &files),
        ArchiveFormat::SevenZ => pack_7z(source_dir, &files),
    }
}

/// Pack `source_dir` into `output`, choosing the format from its extension.
pub fn pack_to_file(source_dir: &Path, output: &Path) -> Result<()> {
    let format = ArchiveFormat::detect(output)?;
    let bytes = pack(source_dir, format)?;
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(output, bytes)?;
    tracing::info!(output = %output.display(), format = %format, "Packed archive");
    Ok(())
}

/// Byte-for-byte identity of two files: sizes first, then SHA-256 digests.
pub fn identical(a: &Path, b: &Path) -> Result<bool> {
    if fs::metadata(a)?.len() != fs::metadata(b)?.len() {
        return Ok(false);
    }
    Ok(file_digest(a)? == file_digest(b)?)
}

/// Hex SHA-256 of a file, streamed through a fixed-size buffer.
pub fn file_digest(path: &Path) -> Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// `(relative name, absolute path)` for each regular file, sorted by name.
fn collect_files(source_dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(source_dir).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            io::Error::new(io::ErrorKind::Other, format!("walking {}: {}", source_dir.display(), e))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(source_dir).map_err(|e| {
            io::Error::new(io::ErrorKind::Other, e.to_string())
        })?;
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        files.push((name, entry.path().to_path_buf()));
    }
    Ok(files)
}

fn pack_zip(source_dir: &Path, files: &[(String, PathBuf)]) -> Result<Vec<u8>> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    for (name, path) in files {
        writer
            .start_file(name.as_str(), options)
            .map_err(|e| PakError::malformed(source_dir, e))?;
        let mut file = File::open(path)?;
        io::copy(&mut file, &mut writer)?;
    }
    let cursor = writer
        .finish()
        .map_err(|e| PakError::malformed(source_dir, e))?;
    Ok(cursor.into_inner())
}

fn pack_7z(source_dir: &Path, files: &[(String, PathBuf)]) -> Result<Vec<u8>> {
    let mut writer =
        SevenZWriter::new(Cursor::new(Vec::new())).map_err(|e| PakError::malformed(source_dir, e))?;
    for (name, path) in files {
        let entry = SevenZArchiveEntry::from_path(path, name.clone());
        let file = File::open(path)?;
        writer
            .push_archive_entry(entry, Some(file))
            .map_err(|e| PakError::malformed(source_dir, e))?;
    }
    let mut cursor = writer
        .finish()
        .map_err(|e| PakError::malformed(source_dir, e))?;
    cursor.flush()?;
    Ok(cursor.into_inner())
}
