//! Piece hashing for torrent metadata.
//!
//! A file is split into fixed-size pieces and each piece is hashed with
//! SHA-1. The concatenated digests become the `pieces` byte string of the
//! torrent info dictionary.

use std::io::{self, Read};

use sha1::{Digest, Sha1};

/// Piece size in bytes (256 KiB).
///
/// This is the common default for torrents of a few gigabytes: the metadata
/// document stays around 1 MiB for an 8 GiB file. Changing it would
/// invalidate every existing hash cache, so it is fixed.
pub const PIECE_LENGTH: u64 = 262144;

/// The digests produced by hashing a byte source, in piece order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceHashes {
    /// One 20-byte SHA-1 digest per piece.
    pub digests: Vec<[u8; 20]>,
    /// Total bytes consumed from the source.
    pub bytes_read: u64,
}

impl PieceHashes {
    /// Concatenates the digests into the `pieces` wire format.
    pub fn concat(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.digests.len() * 20);
        for digest in &self.digests {
            out.extend_from_slice(digest);
        }
        out
    }
}

/// Hashes `source` into [`PIECE_LENGTH`]-sized pieces.
///
/// `declared_len` is the file size observed before hashing started. Reading
/// halts once that many bytes have been consumed or the source hits
/// end-of-stream, whichever comes first; a short final piece is hashed over
/// exactly the bytes read.
///
/// Returns `Ok(None)` when the source turns out to hold more bytes than
/// declared, meaning the file changed while we were reading it. The caller
/// is expected to drop this round and wait for the next notification.
pub fn hash_pieces<R: Read>(source: &mut R, declared_len: u64) -> io::Result<Option<PieceHashes>> {
    let mut digests = Vec::with_capacity(declared_len.div_ceil(PIECE_LENGTH) as usize);
    let mut buf = vec![0u8; PIECE_LENGTH as usize];
    let mut bytes_read: u64 = 0;

    loop {
        if bytes_read > declared_len {
            // The final read overshot the declared size: the file grew
            // under us. Bail with nothing; the caller re-checks the file.
            return Ok(None);
        }

        let want = (declared_len - bytes_read).min(PIECE_LENGTH) as usize;
        if want == 0 {
            break;
        }

        let n = read_at_least(source, &mut buf, want)?;
        if n == 0 {
            break;
        }

        let mut hasher = Sha1::new();
        hasher.update(&buf[..n]);
        digests.push(hasher.finalize().into());
        bytes_read += n as u64;
    }

    Ok(Some(PieceHashes { digests, bytes_read }))
}

/// Reads until at least `min` bytes are in `buf` or the source is
/// exhausted. May fill past `min`, up to the full buffer; that overshoot is
/// how a growing file is detected in the caller's accounting.
fn read_at_least<R: Read>(source: &mut R, buf: &mut [u8], min: usize) -> io::Result<usize> {
    let mut filled = 0;
    while filled < min {
        match source.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn empty_source() {
        let mut source = Cursor::new(Vec::new());
        let hashes = hash_pieces(&mut source, 0).unwrap().unwrap();
        assert_eq!(hashes.bytes_read, 0);
        assert!(hashes.digests.is_empty());
    }

    #[test]
    fn one_piece() {
        let data = b"testing";
        let mut source = Cursor::new(data.to_vec());
        let hashes = hash_pieces(&mut source, data.len() as u64).unwrap().unwrap();

        assert_eq!(hashes.bytes_read, 7);
        assert_eq!(hashes.digests.len(), 1);
        assert_eq!(
            hashes.digests[0],
            [
                0xdc, 0x72, 0x4a, 0xf1, 0x8f, 0xbd, 0xd4, 0xe5, 0x91, 0x89, 0xf5, 0xfe, 0x76,
                0x8a, 0x5f, 0x83, 0x11, 0x52, 0x70, 0x50,
            ]
        );
    }

    #[test]
    fn two_pieces() {
        // 1.5x the piece length so the input stays under three pieces.
        let repeats = (PIECE_LENGTH as usize / 7) * 3 / 2;
        let data = b"testing".repeat(repeats);
        assert_eq!(data.len(), 393211);

        let mut source = Cursor::new(data.clone());
        let hashes = hash_pieces(&mut source, data.len() as u64).unwrap().unwrap();

        assert_eq!(hashes.bytes_read, data.len() as u64);
        assert_eq!(hashes.digests.len(), 2);
        assert_eq!(
            hashes.digests[0],
            [
                0xf7, 0xda, 0x4c, 0xb3, 0xbc, 0x7d, 0x37, 0x35, 0xcf, 0x2e, 0x26, 0x2c, 0xef,
                0x05, 0xd5, 0xde, 0xb0, 0xa5, 0x3e, 0xe8,
            ]
        );
        assert_eq!(
            hashes.digests[1],
            [
                0x22, 0x36, 0xb0, 0xae, 0x9c, 0xe3, 0x6b, 0xa5, 0x09, 0x5e, 0x3f, 0xbe, 0xd8,
                0xd8, 0xcd, 0xaf, 0xb7, 0x72, 0xb7, 0xc9,
            ]
        );
    }

    #[test]
    fn exact_piece_boundary() {
        let data = vec![0xabu8; PIECE_LENGTH as usize];
        let mut source = Cursor::new(data.clone());
        let hashes = hash_pieces(&mut source, data.len() as u64).unwrap().unwrap();
        assert_eq!(hashes.digests.len(), 1);

        let data = vec![0xabu8; PIECE_LENGTH as usize + 1];
        let mut source = Cursor::new(data.clone());
        let hashes = hash_pieces(&mut source, data.len() as u64).unwrap().unwrap();
        assert_eq!(hashes.digests.len(), 2);
        assert_eq!(hashes.bytes_read, PIECE_LENGTH + 1);
    }

    #[test]
    fn grown_source_is_unstable() {
        // Declared 10 bytes but the source now holds 20: the tail read
        // overshoots and the engine reports instability instead of hashes.
        let mut source = Cursor::new(vec![0u8; 20]);
        assert!(hash_pieces(&mut source, 10).unwrap().is_none());
    }

    #[test]
    fn truncated_source_stops_at_eof() {
        // Declared 100 bytes but only 50 exist; the engine hashes what it
        // saw and reports the shortfall through bytes_read.
        let mut source = Cursor::new(vec![7u8; 50]);
        let hashes = hash_pieces(&mut source, 100).unwrap().unwrap();
        assert_eq!(hashes.bytes_read, 50);
        assert_eq!(hashes.digests.len(), 1);
    }

    #[test]
    fn concat_joins_digests_in_order() {
        let data = vec![1u8; PIECE_LENGTH as usize + 10];
        let mut source = Cursor::new(data.clone());
        let hashes = hash_pieces(&mut source, data.len() as u64).unwrap().unwrap();

        let joined = hashes.concat();
        assert_eq!(joined.len(), 40);
        assert_eq!(&joined[..20], &hashes.digests[0]);
        assert_eq!(&joined[20..], &hashes.digests[1]);
    }
}
