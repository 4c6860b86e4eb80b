//! Torrent metadata generation with an on-disk hash cache.
//!
//! [`generate`] turns a file on disk into a [`MetadataInfo`], either by
//! hashing the file piece by piece or by loading a previously computed
//! `.mdcache` sidecar. The sidecar is the raw concatenation of the SHA-1
//! digests with no header; it is valid only when it is at least as new as
//! the file and exactly `piece_count * 20` bytes long.
//!
//! [`Metadata`] is the bencoded document handed to BitTorrent clients. Its
//! dictionary keys (`piece length` included, space and all) follow BEP-3.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error};

use crate::hash::{self, PIECE_LENGTH};

/// Suffix appended to a served file's path to form its hash cache path.
pub const CACHE_SUFFIX: &str = ".mdcache";

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The byte count consumed by the hash engine disagrees with the size
    /// observed by `stat`, and not in the recoverable grew-while-reading
    /// way. Something is wrong with the file or the filesystem.
    #[error("hashed {read} bytes of a {size} byte file: {path}")]
    LengthMismatch { path: PathBuf, read: u64, size: u64 },

    #[error("file name is not valid unicode: {0}")]
    InvalidFileName(PathBuf),
}

/// The `info` dictionary of a torrent document. Immutable once published.
///
/// Fields are declared in bencode key order so the encoded dictionary is
/// sorted as BEP-3 requires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataInfo {
    /// File size in bytes as hashed.
    pub length: u64,
    /// Base filename.
    pub name: String,
    /// Piece size in bytes, always [`PIECE_LENGTH`].
    #[serde(rename = "piece length")]
    pub piece_length: u32,
    /// Concatenated 20-byte SHA-1 digests in piece order.
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,
}

impl MetadataInfo {
    pub fn piece_count(&self) -> usize {
        self.pieces.len() / 20
    }
}

/// A complete torrent document: tracker URL plus info dictionary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub announce: String,
    pub info: MetadataInfo,
}

/// Generates metadata for the file at `path`.
///
/// Returns `Ok(None)` in two benign cases: the file is empty, or it changed
/// size while being hashed. Both mean "nothing to publish this round"; the
/// next filesystem notification retries.
pub fn generate(path: &Path) -> Result<Option<MetadataInfo>, MetadataError> {
    let stat = fs::metadata(path)?;
    let size = stat.len();

    // Zero-length files show up when a writer has created but not yet
    // filled the file. Not an error; just nothing to serve yet.
    if size == 0 {
        return Ok(None);
    }

    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| MetadataError::InvalidFileName(path.to_path_buf()))?
        .to_string();

    let cache = cache_path(path);
    let piece_count = size.div_ceil(PIECE_LENGTH) as usize;

    let pieces = match load_cache(&cache, &stat, piece_count) {
        Some(pieces) => {
            debug!(path = %cache.display(), bytes = pieces.len(), "loaded hash cache");
            pieces
        }
        None => {
            let mut file = fs::File::open(path)?;
            let Some(hashes) = hash::hash_pieces(&mut file, size)? else {
                debug!(path = %path.display(), "file grew while hashing, skipping");
                return Ok(None);
            };
            if hashes.bytes_read != size {
                return Err(MetadataError::LengthMismatch {
                    path: path.to_path_buf(),
                    read: hashes.bytes_read,
                    size,
                });
            }

            let pieces = hashes.concat();
            if let Err(err) = fs::write(&cache, &pieces) {
                // The cache is an optimization; losing it costs a re-hash.
                error!(path = %cache.display(), %err, "failed to write hash cache");
            }
            pieces
        }
    };

    Ok(Some(MetadataInfo {
        name,
        piece_length: PIECE_LENGTH as u32,
        pieces,
        length: size,
    }))
}

/// Returns the hash cache path for a served file: the file's own path with
/// [`CACHE_SUFFIX`] appended.
pub fn cache_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(CACHE_SUFFIX);
    PathBuf::from(os)
}

/// Loads the cached pieces if the cache is usable: present, no older than
/// the file, and of exactly the expected length.
fn load_cache(cache: &Path, file_stat: &fs::Metadata, piece_count: usize) -> Option<Vec<u8>> {
    let cache_stat = fs::metadata(cache).ok()?;
    let file_mtime = file_stat.modified().ok()?;
    let cache_mtime = cache_stat.modified().ok()?;

    if cache_mtime < file_mtime {
        debug!(path = %cache.display(), "hash cache older than file, ignoring");
        return None;
    }

    let bytes = match fs::read(cache) {
        Ok(bytes) => bytes,
        Err(err) => {
            debug!(path = %cache.display(), %err, "failed to read hash cache");
            return None;
        }
    };

    if bytes.len() != piece_count * 20 {
        error!(
            path = %cache.display(),
            len = bytes.len(),
            expected = piece_count * 20,
            "hash cache length does not match file, ignoring"
        );
        return None;
    }

    Some(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn empty_file_produces_nothing() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "empty.bin", b"");

        assert!(generate(&path).unwrap().is_none());
        assert!(!cache_path(&path).exists());
    }

    #[test]
    fn small_file_metadata() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "greeting.txt", b"testing");

        let info = generate(&path).unwrap().unwrap();
        assert_eq!(info.name, "greeting.txt");
        assert_eq!(info.piece_length, PIECE_LENGTH as u32);
        assert_eq!(info.length, 7);
        assert_eq!(info.piece_count(), 1);
        assert_eq!(
            info.pieces,
            vec![
                0xdc, 0x72, 0x4a, 0xf1, 0x8f, 0xbd, 0xd4, 0xe5, 0x91, 0x89, 0xf5, 0xfe, 0x76,
                0x8a, 0x5f, 0x83, 0x11, 0x52, 0x70, 0x50,
            ]
        );

        // The sidecar holds exactly the concatenated digests.
        assert_eq!(fs::read(cache_path(&path)).unwrap(), info.pieces);
    }

    #[test]
    fn piece_count_scales_with_size() {
        let dir = TempDir::new().unwrap();

        let path = write_file(&dir, "one.bin", &vec![1u8; PIECE_LENGTH as usize]);
        assert_eq!(generate(&path).unwrap().unwrap().piece_count(), 1);

        let path = write_file(&dir, "two.bin", &vec![1u8; PIECE_LENGTH as usize + 1]);
        let info = generate(&path).unwrap().unwrap();
        assert_eq!(info.piece_count(), 2);
        assert_eq!(info.pieces.len(), 40);
    }

    #[test]
    fn second_run_uses_cache() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "data.bin", &vec![42u8; 1000]);

        let first = generate(&path).unwrap().unwrap();
        let second = generate(&path).unwrap().unwrap();
        assert_eq!(first.pieces, second.pieces);

        // Prove the cache is actually consulted: plant digests that no hash
        // run would produce and watch them come back.
        fs::write(cache_path(&path), vec![0xeeu8; 20]).unwrap();
        let planted = generate(&path).unwrap().unwrap();
        assert_eq!(planted.pieces, vec![0xeeu8; 20]);
    }

    #[test]
    fn wrong_length_cache_is_rehashed() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "data.bin", &vec![42u8; 1000]);

        let real = generate(&path).unwrap().unwrap();
        fs::write(cache_path(&path), vec![0u8; 13]).unwrap();

        let again = generate(&path).unwrap().unwrap();
        assert_eq!(again.pieces, real.pieces);
        // And the bogus sidecar was replaced with the real digests.
        assert_eq!(fs::read(cache_path(&path)).unwrap(), real.pieces);
    }

    #[test]
    fn pieces_length_invariant() {
        let dir = TempDir::new().unwrap();
        for size in [1u64, 500, PIECE_LENGTH - 1, PIECE_LENGTH, PIECE_LENGTH + 7] {
            let path = write_file(&dir, &format!("f{}.bin", size), &vec![9u8; size as usize]);
            let info = generate(&path).unwrap().unwrap();
            let expected = info.length.div_ceil(PIECE_LENGTH) as usize * 20;
            assert_eq!(info.pieces.len(), expected);
        }
    }
}
