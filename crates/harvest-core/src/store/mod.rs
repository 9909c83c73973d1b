pub mod lock;

use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;
use walkdir::WalkDir;

use crate::config::StorePaths;
use crate::error::Result;
use crate::hash::ContentHash;

/// Sharded content-addressed blob store.
///
/// Blobs live at `hash/<2-hex>/<30-hex>`; the key invariant
/// `digest(contents) == key` is enforced by the integrity sweep, not by a
/// real-time guard on reads.
pub struct BlobStore {
    paths: StorePaths,
}

/// Result of a commit attempt for a single blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Stored,
    AlreadyPresent,
}

impl BlobStore {
    pub fn new(paths: StorePaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }

    /// Create the `hash/`, `meta/` and `temp/` directories. The only
    /// startup-fatal condition in the engine besides lock contention.
    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [
            &self.paths.hash_dir,
            &self.paths.meta_dir,
            &self.paths.temp_dir,
        ] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn blob_path(&self, hash: &ContentHash) -> PathBuf {
        self.paths
            .hash_dir
            .join(hash.shard_prefix())
            .join(hash.shard_suffix())
    }

    pub fn exists(&self, hash: &ContentHash) -> bool {
        self.blob_path(hash).is_file()
    }

    /// Move the file at `source` into the shard path for `hash`.
    ///
    /// Content addressing makes a second commit of the same hash redundant:
    /// it is reported as `AlreadyPresent` and the source file is discarded.
    /// Same-filesystem commits are a single atomic rename; cross-device
    /// commits fall back to copying into a temp file inside the target
    /// shard directory and renaming, so readers never see a partial blob.
    pub fn commit(&self, hash: &ContentHash, source: &Path) -> Result<CommitOutcome> {
        let dest = self.blob_path(hash);
        if dest.is_file() {
            let _ = fs::remove_file(source);
            return Ok(CommitOutcome::AlreadyPresent);
        }
        let shard_dir = dest.parent().unwrap_or(&self.paths.hash_dir);
        fs::create_dir_all(shard_dir)?;

        if fs::rename(source, &dest).is_err() {
            // Staging may live on a different filesystem; stage the copy
            // next to the destination and rename within the shard.
            let mut tmp = tempfile::NamedTempFile::new_in(shard_dir)?;
            let mut reader = fs::File::open(source)?;
            std::io::copy(&mut reader, &mut tmp)?;
            tmp.persist(&dest).map_err(|e| e.error)?;
            fs::remove_file(source)?;
        }
        Ok(CommitOutcome::Stored)
    }

    /// Remove a blob. Deleting an absent blob is not an error.
    pub fn delete(&self, hash: &ContentHash) -> Result<()> {
        match fs::remove_file(self.blob_path(hash)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Re-read a blob's full content and recompute its digest.
    pub fn verify(&self, hash: &ContentHash) -> Result<bool> {
        let recomputed = ContentHash::compute_file(&self.blob_path(hash))?;
        Ok(recomputed == *hash)
    }

    /// Recursive byte total of all blobs, skipping symbolic links.
    pub fn total_size(&self) -> Result<u64> {
        let mut total = 0u64;
        for entry in WalkDir::new(&self.paths.hash_dir) {
            let entry = entry.map_err(std::io::Error::from)?;
            if entry.path_is_symlink() || !entry.file_type().is_file() {
                continue;
            }
            total += entry.metadata().map_err(std::io::Error::from)?.len();
        }
        Ok(total)
    }

    /// Walk every blob in the store, calling `f` with its key and size.
    ///
    /// Files whose shard path does not parse back into a hash are not blobs;
    /// they are logged and left alone — deleting unknown files is not this
    /// store's business.
    pub fn for_each_blob<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&ContentHash, u64) -> Result<()>,
    {
        if !self.paths.hash_dir.is_dir() {
            return Ok(());
        }
        for shard in fs::read_dir(&self.paths.hash_dir)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                warn!(path = %shard.path().display(), "foreign file in hash root, skipping");
                continue;
            }
            let prefix = shard.file_name().to_string_lossy().into_owned();
            for blob in fs::read_dir(shard.path())? {
                let blob = blob?;
                if !blob.file_type()?.is_file() {
                    continue;
                }
                let suffix = blob.file_name().to_string_lossy().into_owned();
                match ContentHash::parse_hex(&format!("{prefix}{suffix}")) {
                    Ok(hash) => {
                        let size = blob.metadata()?.len();
                        f(&hash, size)?;
                    }
                    Err(_) => {
                        warn!(path = %blob.path().display(), "foreign file in shard, skipping");
                    }
                }
            }
        }
        Ok(())
    }
}
