//! Archive unpacking and product name reconciliation

use flate2::read::GzDecoder;
use std::collections::BTreeSet;
use std::ffi::OsString;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use zip::ZipArchive;

use super::request::{compression_suffix, strip_compression_suffix};

/// Archive errors
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// No unpacker for this suffix
    #[error("Unsupported compression format: {0}")]
    Unsupported(String),

    /// Archive could not be read
    #[error("Corrupt archive {archive}: {message}")]
    Corrupt {
        /// Archive path
        archive: PathBuf,
        /// Decoder message
        message: String,
    },

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Unpacks a downloaded archive into a directory
pub trait Unpacker: Send + Sync {
    /// Unpack `archive` into `dest`, returning the single top-level result.
    ///
    /// Archives with several top-level entries are unpacked into a directory
    /// named after the archive.
    fn unpack(&self, archive: &Path, dest: &Path) -> Result<PathBuf, ArchiveError>;
}

/// Handles `.zip`, `.tar`, `.tar.gz`/`.tgz` and single-file `.gz`
#[derive(Debug, Default, Clone, Copy)]
pub struct ArchiveUnpacker;

impl Unpacker for ArchiveUnpacker {
    fn unpack(&self, archive: &Path, dest: &Path) -> Result<PathBuf, ArchiveError> {
        let name = archive
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let stem = strip_compression_suffix(&name).to_string();
        let suffix = compression_suffix(&name).ok_or_else(|| ArchiveError::Unsupported(name.clone()))?;
        debug!(archive = %archive.display(), suffix, "Unpacking");

        match suffix {
            ".zip" => unpack_zip(archive, dest, &stem),
            ".tar" => unpack_tar(archive, dest, &stem, |file| Ok(file)),
            ".tar.gz" | ".tgz" => unpack_tar(archive, dest, &stem, |file| Ok(GzDecoder::new(file))),
            ".gz" => unpack_gz(archive, dest, &stem),
            other => Err(ArchiveError::Unsupported(other.to_string())),
        }
    }
}

fn corrupt(archive: &Path, err: impl ToString) -> ArchiveError {
    ArchiveError::Corrupt {
        archive: archive.to_path_buf(),
        message: err.to_string(),
    }
}

fn first_component(path: &Path) -> Option<OsString> {
    path.components().find_map(|c| match c {
        Component::Normal(part) => Some(part.to_os_string()),
        _ => None,
    })
}

/// Destination and returned path for the given set of top-level names
fn layout(roots: BTreeSet<OsString>, dest: &Path, stem: &str) -> (PathBuf, PathBuf) {
    if roots.len() == 1 {
        if let Some(root) = roots.into_iter().next() {
            return (dest.to_path_buf(), dest.join(root));
        }
    }
    let wrapped = dest.join(stem);
    (wrapped.clone(), wrapped)
}

fn unpack_zip(archive: &Path, dest: &Path, stem: &str) -> Result<PathBuf, ArchiveError> {
    let file = File::open(archive)?;
    let mut zip = ZipArchive::new(BufReader::new(file)).map_err(|e| corrupt(archive, e))?;

    let mut roots = BTreeSet::new();
    for index in 0..zip.len() {
        let entry = zip.by_index(index).map_err(|e| corrupt(archive, e))?;
        let path = entry
            .enclosed_name()
            .ok_or_else(|| corrupt(archive, format!("unsafe entry path {}", entry.name())))?;
        if let Some(root) = first_component(path) {
            roots.insert(root);
        }
    }

    let (extract_dir, result) = layout(roots, dest, stem);
    std::fs::create_dir_all(&extract_dir)?;
    zip.extract(&extract_dir).map_err(|e| corrupt(archive, e))?;
    Ok(result)
}

fn unpack_tar<R, F>(archive: &Path, dest: &Path, stem: &str, open: F) -> Result<PathBuf, ArchiveError>
where
    R: io::Read,
    F: Fn(BufReader<File>) -> io::Result<R>,
{
    let reader = open(BufReader::new(File::open(archive)?))?;
    let mut listing = tar::Archive::new(reader);
    let mut roots = BTreeSet::new();
    for entry in listing.entries().map_err(|e| corrupt(archive, e))? {
        let entry = entry.map_err(|e| corrupt(archive, e))?;
        let path = entry.path().map_err(|e| corrupt(archive, e))?;
        if let Some(root) = first_component(&path) {
            roots.insert(root);
        }
    }

    let (extract_dir, result) = layout(roots, dest, stem);
    std::fs::create_dir_all(&extract_dir)?;
    let reader = open(BufReader::new(File::open(archive)?))?;
    tar::Archive::new(reader)
        .unpack(&extract_dir)
        .map_err(|e| corrupt(archive, e))?;
    Ok(result)
}

fn unpack_gz(archive: &Path, dest: &Path, stem: &str) -> Result<PathBuf, ArchiveError> {
    let mut decoder = GzDecoder::new(BufReader::new(File::open(archive)?));
    std::fs::create_dir_all(dest)?;
    let output = dest.join(stem);
    let mut out = File::create(&output)?;
    io::copy(&mut decoder, &mut out).map_err(|e| corrupt(archive, e))?;
    Ok(output)
}

/// Positional character difference between two names, counting the length
/// difference as differing positions
pub fn name_difference(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let differing = a.iter().zip(b.iter()).filter(|(x, y)| x != y).count();
    differing + a.len().abs_diff(b.len())
}
