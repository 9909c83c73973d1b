use std::path::{Path, PathBuf};

use crate::error::{HarvestError, Result};
use crate::hash::ContentHash;
use crate::store::BlobStore;

/// Copy the blob for `hash` out of the store into `dest_dir/<full-hex>`.
pub fn run(store: &BlobStore, hash: &ContentHash, dest_dir: &Path) -> Result<PathBuf> {
    let blob = store.blob_path(hash);
    if !blob.is_file() {
        return Err(HarvestError::BlobNotFound(hash.to_hex()));
    }
    std::fs::create_dir_all(dest_dir)?;
    let dest = dest_dir.join(hash.to_hex());
    std::fs::copy(&blob, &dest)?;
    Ok(dest)
}
