use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::error::FabricError;
use crate::swarm::magnet::encode_hex;

// ── Unit metadata ───────────────────────────────────────────────────────────

/// Describes one distribution unit: a single file split into fixed-size
/// pieces, each pinned by a SHA-1 hash.
///
/// The unit's info hash is the SHA-1 of this structure's serialized form,
/// so a leech can verify received metadata against the magnet link before
/// accepting it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitMetadata {
    pub name: String,
    pub length: u64,
    pub piece_size: u32,
    pub piece_hashes: Vec<[u8; 20]>,
}

impl UnitMetadata {
    pub fn info_hash(&self) -> [u8; 20] {
        let encoded = bincode::serialize(self).unwrap_or_default();
        Sha1::digest(&encoded).into()
    }

    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Length of piece `index`; the final piece may be short.
    pub fn piece_len(&self, index: u32) -> usize {
        let start = index as u64 * self.piece_size as u64;
        let end = (start + self.piece_size as u64).min(self.length);
        end.saturating_sub(start) as usize
    }
}

// ── Distribution unit ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored,
    /// Piece was already present; ignored.
    Duplicate,
    /// Bad index, wrong length, or hash mismatch; dropped.
    Rejected,
}

/// The local replica of a distribution unit, held in memory.
///
/// A seeded unit starts complete; a unit built from received metadata
/// starts empty and fills as verified pieces arrive. All access goes
/// through the owning manager's lock, so the unit itself is plain data.
#[derive(Debug)]
pub struct DistributionUnit {
    metadata: UnitMetadata,
    info_hash: [u8; 20],
    data: Vec<u8>,
    have: Vec<bool>,
    downloaded: u64,
}

impl DistributionUnit {
    /// Build a complete unit from file contents, hashing every piece.
    pub fn seed(name: String, data: Vec<u8>, piece_size: usize) -> Result<Self, FabricError> {
        if data.is_empty() {
            return Err(FabricError::NoVideoFile);
        }
        let piece_hashes: Vec<[u8; 20]> = data
            .chunks(piece_size)
            .map(|chunk| Sha1::digest(chunk).into())
            .collect();
        let metadata = UnitMetadata {
            name,
            length: data.len() as u64,
            piece_size: piece_size as u32,
            piece_hashes,
        };
        let info_hash = metadata.info_hash();
        let have = vec![true; metadata.piece_count()];
        let downloaded = metadata.length;
        Ok(Self {
            metadata,
            info_hash,
            data,
            have,
            downloaded,
        })
    }

    /// Build an empty replica from metadata received off the wire.
    pub fn from_metadata(metadata: UnitMetadata) -> Self {
        let info_hash = metadata.info_hash();
        let have = vec![false; metadata.piece_count()];
        let data = vec![0u8; metadata.length as usize];
        Self {
            metadata,
            info_hash,
            data,
            have,
            downloaded: 0,
        }
    }

    pub fn metadata(&self) -> &UnitMetadata {
        &self.metadata
    }

    pub fn info_hash(&self) -> [u8; 20] {
        self.info_hash
    }

    pub fn info_hash_hex(&self) -> String {
        encode_hex(&self.info_hash)
    }

    pub fn has_piece(&self, index: u32) -> bool {
        self.have.get(index as usize).copied().unwrap_or(false)
    }

    pub fn bitfield(&self) -> Vec<bool> {
        self.have.clone()
    }

    pub fn is_complete(&self) -> bool {
        self.have.iter().all(|&h| h)
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded
    }

    /// Completion fraction in `0.0..=1.0`.
    pub fn percent(&self) -> f64 {
        if self.metadata.length == 0 {
            return 1.0;
        }
        self.downloaded as f64 / self.metadata.length as f64
    }

    pub fn missing_pieces(&self) -> impl Iterator<Item = u32> + '_ {
        self.have
            .iter()
            .enumerate()
            .filter(|(_, &h)| !h)
            .map(|(i, _)| i as u32)
    }

    /// Verify and store a received piece.
    pub fn store_piece(&mut self, index: u32, piece: &[u8]) -> StoreOutcome {
        let i = index as usize;
        if i >= self.metadata.piece_count() || piece.len() != self.metadata.piece_len(index) {
            return StoreOutcome::Rejected;
        }
        if self.have[i] {
            return StoreOutcome::Duplicate;
        }
        let digest: [u8; 20] = Sha1::digest(piece).into();
        if digest != self.metadata.piece_hashes[i] {
            return StoreOutcome::Rejected;
        }
        let start = i * self.metadata.piece_size as usize;
        self.data[start..start + piece.len()].copy_from_slice(piece);
        self.have[i] = true;
        self.downloaded += piece.len() as u64;
        StoreOutcome::Stored
    }

    pub fn read_piece(&self, index: u32) -> Option<Vec<u8>> {
        if !self.has_piece(index) {
            return None;
        }
        let start = index as usize * self.metadata.piece_size as usize;
        let len = self.metadata.piece_len(index);
        Some(self.data[start..start + len].to_vec())
    }

    /// Whether every piece covering the inclusive byte range is present.
    pub fn range_available(&self, start: u64, end: u64) -> bool {
        if start > end || end >= self.metadata.length {
            return false;
        }
        let first = (start / self.metadata.piece_size as u64) as u32;
        let last = (end / self.metadata.piece_size as u64) as u32;
        (first..=last).all(|i| self.has_piece(i))
    }

    /// Copy out an inclusive byte range. The caller must have checked
    /// availability; bounds are still validated.
    pub fn read_range(&self, start: u64, end: u64) -> Result<Bytes, FabricError> {
        if start > end || end >= self.metadata.length {
            return Err(FabricError::RangeOutOfBounds {
                start,
                end,
                length: self.metadata.length,
            });
        }
        Ok(Bytes::copy_from_slice(
            &self.data[start as usize..=end as usize],
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn seed_is_complete_and_hash_is_stable() {
        let unit = DistributionUnit::seed("clip.mp4".into(), payload(1000), 256).unwrap();
        assert!(unit.is_complete());
        assert_eq!(unit.metadata().piece_count(), 4);
        assert_eq!(unit.metadata().piece_len(3), 232);
        // Same content, same hash.
        let again = DistributionUnit::seed("clip.mp4".into(), payload(1000), 256).unwrap();
        assert_eq!(unit.info_hash(), again.info_hash());
        // Different name changes the hash.
        let renamed = DistributionUnit::seed("other.mp4".into(), payload(1000), 256).unwrap();
        assert_ne!(unit.info_hash(), renamed.info_hash());
    }

    #[test]
    fn leech_fills_from_verified_pieces() {
        let seed = DistributionUnit::seed("clip.mp4".into(), payload(1000), 256).unwrap();
        let mut leech = DistributionUnit::from_metadata(seed.metadata().clone());
        assert!(!leech.is_complete());
        assert_eq!(leech.percent(), 0.0);

        for index in 0..4 {
            let piece = seed.read_piece(index).unwrap();
            assert_eq!(leech.store_piece(index, &piece), StoreOutcome::Stored);
            assert_eq!(leech.store_piece(index, &piece), StoreOutcome::Duplicate);
        }
        assert!(leech.is_complete());
        assert_eq!(leech.percent(), 1.0);
        assert_eq!(
            leech.read_range(0, 999).unwrap(),
            seed.read_range(0, 999).unwrap()
        );
    }

    #[test]
    fn corrupt_piece_is_rejected() {
        let seed = DistributionUnit::seed("clip.mp4".into(), payload(1000), 256).unwrap();
        let mut leech = DistributionUnit::from_metadata(seed.metadata().clone());
        let mut piece = seed.read_piece(0).unwrap();
        piece[0] ^= 0xff;
        assert_eq!(leech.store_piece(0, &piece), StoreOutcome::Rejected);
        assert!(!leech.has_piece(0));
        // Wrong length and bad index are rejected too.
        assert_eq!(leech.store_piece(1, &[0u8; 10]), StoreOutcome::Rejected);
        assert_eq!(leech.store_piece(99, &[0u8; 256]), StoreOutcome::Rejected);
    }

    #[test]
    fn range_availability_tracks_covering_pieces() {
        let seed = DistributionUnit::seed("clip.mp4".into(), payload(1000), 256).unwrap();
        let mut leech = DistributionUnit::from_metadata(seed.metadata().clone());
        leech.store_piece(1, &seed.read_piece(1).unwrap());
        // Entirely inside piece 1.
        assert!(leech.range_available(256, 511));
        // Spills into missing piece 2.
        assert!(!leech.range_available(256, 512));
        // Out of bounds.
        assert!(!leech.range_available(0, 1000));
        assert!(matches!(
            leech.read_range(990, 1005),
            Err(FabricError::RangeOutOfBounds { length: 1000, .. })
        ));
    }
}
