use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::time::SystemTime;

use tracing::debug;

use crate::config::StorePaths;
use crate::error::Result;
use crate::hash::ContentHash;

/// Line prefix identifying a file record; all other lines are ignored.
const RECORD_MARKER: &str = "md5 ";

/// Filename of the scanner's inventory, both on the remote host and in the
/// durable per-host meta directory.
pub const MANIFEST_FILE_NAME: &str = "quick.txt";

/// One file as observed on a host at scan time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub hash: ContentHash,
    /// Last-modified timestamp as fixed-precision text (`YYYYMMDDHHMMSS`).
    pub mtime: String,
    pub size: u64,
    /// Path relative to the scanned remote root. May contain spaces.
    pub path: String,
}

/// A host's complete file inventory at its most recent successful scan.
///
/// Holds the verbatim raw bytes it was parsed from: persistence copies
/// those bytes, never a re-serialization, to preserve provenance.
#[derive(Debug, Clone)]
pub struct Manifest {
    pub entries: Vec<ManifestEntry>,
    raw: Vec<u8>,
}

impl Manifest {
    /// Parse scanner output. Lines not starting with the record marker are
    /// ignored (comments, other record types); malformed record lines are
    /// silently skipped, never fatal.
    pub fn parse(raw: &[u8]) -> Self {
        let text = String::from_utf8_lossy(raw);
        let mut entries = Vec::new();
        for line in text.lines() {
            if !line.starts_with(RECORD_MARKER) {
                continue;
            }
            // marker, hash, mtime, size, path — path captured greedily
            let mut fields = line.trim_end().splitn(5, ' ');
            let (Some(_marker), Some(hash), Some(mtime), Some(size), Some(path)) = (
                fields.next(),
                fields.next(),
                fields.next(),
                fields.next(),
                fields.next(),
            ) else {
                continue;
            };
            let Ok(hash) = ContentHash::parse_hex(hash) else {
                continue;
            };
            let Ok(size) = size.parse::<u64>() else {
                continue;
            };
            entries.push(ManifestEntry {
                hash,
                mtime: mtime.to_string(),
                size,
                path: path.to_string(),
            });
        }
        Self {
            entries,
            raw: raw.to_vec(),
        }
    }

    pub fn load(path: &std::path::Path) -> Result<Self> {
        Ok(Self::parse(&fs::read(path)?))
    }

    /// Write the raw manifest verbatim into the host's durable meta
    /// location, atomically replacing any prior manifest for that host.
    pub fn persist(&self, paths: &StorePaths, hostname: &str) -> Result<()> {
        let dir = paths.host_meta_dir(hostname);
        fs::create_dir_all(&dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(&self.raw)?;
        tmp.persist(dir.join(MANIFEST_FILE_NAME)).map_err(|e| e.error)?;
        debug!(host = hostname, entries = self.entries.len(), "manifest persisted");
        Ok(())
    }

    /// Load the persisted manifest for a host, if one exists.
    pub fn load_persisted(paths: &StorePaths, hostname: &str) -> Result<Option<Self>> {
        let path = paths.host_meta_dir(hostname).join(MANIFEST_FILE_NAME);
        match fs::read(&path) {
            Ok(raw) => Ok(Some(Self::parse(&raw))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// A persisted manifest discovered under `meta/`, with the metadata the
/// collector's staleness policy needs.
#[derive(Debug)]
pub struct PersistedManifest {
    pub hostname: String,
    pub path: PathBuf,
    pub modified: SystemTime,
}

/// Enumerate every host with a persisted manifest.
pub fn persisted_manifests(paths: &StorePaths) -> Result<Vec<PersistedManifest>> {
    let mut found = Vec::new();
    let dir = match fs::read_dir(&paths.meta_dir) {
        Ok(dir) => dir,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
        Err(e) => return Err(e.into()),
    };
    for entry in dir {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let manifest_path = entry.path().join(MANIFEST_FILE_NAME);
        let Ok(meta) = fs::metadata(&manifest_path) else {
            continue;
        };
        found.push(PersistedManifest {
            hostname: entry.file_name().to_string_lossy().into_owned(),
            path: manifest_path,
            modified: meta.modified()?,
        });
    }
    found.sort_by(|a, b| a.hostname.cmp(&b.hostname));
    Ok(found)
}
