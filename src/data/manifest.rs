//! Cache entries and the manifest that persists them.
//!
//! One entry per line, modality paths then the label path, separated by
//! tabs. The file is replaced atomically so a crash never leaves a partial
//! manifest behind. A JSON key next to the manifest records the settings the
//! cache was generated with.

use crate::error::{Error, Result};
use crate::transforms::Normalization;
use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Paths of one cached sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Cropped modality files in channel order.
    pub modalities: Vec<PathBuf>,
    /// Cropped label file.
    pub label: PathBuf,
}

impl CacheEntry {
    /// All paths, label last.
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.modalities
            .iter()
            .map(PathBuf::as_path)
            .chain(std::iter::once(self.label.as_path()))
    }
}

/// Manifest file name for a split of a dataset.
pub fn manifest_name(dataset: &str, mode: &str, samples: usize) -> String {
    format!("{}-list-{mode}-samples-{samples}.txt", dataset.to_ascii_lowercase())
}

fn encode_line(entry: &CacheEntry) -> io::Result<String> {
    let mut fields = Vec::with_capacity(entry.modalities.len() + 1);
    for path in entry.paths() {
        let s = path.to_str().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("non UTF-8 path {}", path.display()),
            )
        })?;
        if s.contains(['\t', '\n', '\r']) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("path contains a tab or newline: {s:?}"),
            ));
        }
        fields.push(s);
    }
    Ok(fields.join("\t"))
}

/// Write `entries` to `path` via a temporary file and rename.
pub fn write_manifest(path: &Path, entries: &[CacheEntry]) -> Result<()> {
    let wrap = |source: io::Error| Error::ManifestWrite {
        path: path.to_path_buf(),
        source,
    };

    let mut content = String::new();
    for entry in entries {
        content.push_str(&encode_line(entry).map_err(wrap)?);
        content.push('\n');
    }

    write_atomic(path, content.as_bytes()).map_err(wrap)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    let result = (|| {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        std::fs::rename(&tmp, path)
    })();
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

/// Settings that determine the content of a generated cache.
///
/// A manifest is only reused when its stored key equals the current one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestKey {
    /// Crop extent `[D, H, W]`.
    pub crop_size: [usize; 3],
    /// Expected full-volume shape.
    pub full_vol_dim: [usize; 3],
    /// Foreground threshold.
    pub threshold: f32,
    /// Intensity normalization mode.
    pub normalization: Normalization,
    /// Crops per subject.
    pub samples: usize,
    /// Subject ids of the split, in order.
    pub subjects: Vec<String>,
}

/// `<manifest stem>.json`
pub fn key_path(manifest: &Path) -> PathBuf {
    manifest.with_extension("json")
}

/// Store the generation key of `manifest`.
pub fn write_key(manifest: &Path, key: &ManifestKey) -> Result<()> {
    let path = key_path(manifest);
    let bytes = serde_json::to_vec_pretty(key).map_err(|e| Error::ManifestWrite {
        path: path.clone(),
        source: e.into(),
    })?;
    write_atomic(&path, &bytes).map_err(|source| Error::ManifestWrite { path, source })
}

/// Load the generation key of `manifest`; `None` when absent or unreadable
/// as a key.
pub fn read_key(manifest: &Path) -> Result<Option<ManifestKey>> {
    let path = key_path(manifest);
    if !path.is_file() {
        return Ok(None);
    }
    let bytes = std::fs::read(&path)?;
    Ok(serde_json::from_slice(&bytes).ok())
}

/// Reload a manifest whose entries each hold `modalities` modality paths.
///
/// Lines with the wrong number of fields are reported as
/// [`Error::CorruptCache`] with their zero-based position.
pub fn read_manifest(path: &Path, modalities: usize) -> Result<Vec<CacheEntry>> {
    let content = std::fs::read_to_string(path)?;
    content
        .lines()
        .filter(|line| !line.is_empty())
        .enumerate()
        .map(|(index, line)| {
            let mut fields: Vec<PathBuf> = line.split('\t').map(PathBuf::from).collect();
            if fields.len() != modalities + 1 {
                return Err(Error::corrupt_cache(
                    index,
                    path,
                    format!(
                        "expected {} paths, found {}",
                        modalities + 1,
                        fields.len()
                    ),
                ));
            }
            let label = fields.pop().unwrap_or_default();
            Ok(CacheEntry {
                modalities: fields,
                label,
            })
        })
        .collect()
}
