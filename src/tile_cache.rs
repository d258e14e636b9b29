//! Content-addressed tile store shared by every band of a page.
//!
//! Tiles are keyed by a SHA-256 of their header and bits and referenced from
//! instructions by a 12-bit index. Each entry remembers which bands already
//! received its bits. Eviction is strict least-recently-used.

use std::collections::HashMap;

use bandlist_format::MAX_TILE_INDEX;
use sha2::{Digest, Sha256};

use crate::error::ClistError;

pub const MAX_TILES: usize = MAX_TILE_INDEX as usize + 1;

/// Per-entry bookkeeping charged against the cache capacity.
const ENTRY_OVERHEAD: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileBitmap {
    pub width: u32,
    pub height: u32,
    pub depth: u8,
    pub raster: u32,
    pub data: Vec<u8>,
}

impl TileBitmap {
    /// Builds a tile with rows packed to whole bytes.
    pub fn new(width: u32, height: u32, depth: u8, data: Vec<u8>) -> Result<Self, ClistError> {
        if width == 0 || height == 0 {
            return Err(ClistError::InvalidTile(format!(
                "empty tile {width}x{height}"
            )));
        }
        if !matches!(depth, 1 | 2 | 4 | 8 | 16 | 24 | 32) {
            return Err(ClistError::InvalidTile(format!("unsupported depth {depth}")));
        }
        let raster = (width as u64 * depth as u64).div_ceil(8);
        let expected = raster * height as u64;
        if data.len() as u64 != expected {
            return Err(ClistError::InvalidTile(format!(
                "expected {expected} bytes for {width}x{height}x{depth}, got {}",
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            depth,
            raster: raster as u32,
            data,
        })
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    fn key(&self) -> TileKey {
        let mut hasher = Sha256::new();
        hasher.update(self.width.to_le_bytes());
        hasher.update(self.height.to_le_bytes());
        hasher.update([self.depth]);
        hasher.update(self.raster.to_le_bytes());
        hasher.update(&self.data);
        TileKey(hasher.finalize().into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct TileKey([u8; 32]);

#[derive(Debug, Clone, Default)]
struct BandMask {
    words: Vec<u64>,
}

impl BandMask {
    fn new(nbands: u32) -> Self {
        Self {
            words: vec![0; (nbands as usize).div_ceil(64)],
        }
    }

    fn contains(&self, band: u32) -> bool {
        self.words
            .get(band as usize / 64)
            .is_some_and(|word| word & (1u64 << (band % 64)) != 0)
    }

    fn insert(&mut self, band: u32) {
        if let Some(word) = self.words.get_mut(band as usize / 64) {
            *word |= 1u64 << (band % 64);
        }
    }
}

#[derive(Debug, Clone)]
struct TileEntry {
    key: TileKey,
    bytes: usize,
    last_used: u64,
    uses: u64,
    known: BandMask,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TileStats {
    pub found: u64,
    pub added: u64,
    pub evicted: u64,
    pub resets: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileLookup {
    pub index: u16,
    pub added: bool,
    pub evicted: Vec<u16>,
}

#[derive(Debug)]
pub struct TileCache {
    capacity: usize,
    used: usize,
    nbands: u32,
    by_key: HashMap<TileKey, u16>,
    slots: Vec<Option<TileEntry>>,
    free: Vec<u16>,
    tick: u64,
    generation: u32,
    stats: TileStats,
}

impl TileCache {
    pub fn new(capacity: usize, nbands: u32) -> Self {
        let mut cache = Self {
            capacity,
            used: 0,
            nbands,
            by_key: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            tick: 0,
            generation: 0,
            stats: TileStats::default(),
        };
        cache.clear_entries(nbands);
        cache
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn stats(&self) -> TileStats {
        self.stats
    }

    fn cost(tile: &TileBitmap) -> usize {
        tile.byte_len() + ENTRY_OVERHEAD
    }

    /// Finds `tile` or inserts it, evicting least recently used entries to
    /// make room. The returned entry is marked most recently used.
    pub fn lookup_or_insert(&mut self, tile: &TileBitmap) -> Result<TileLookup, ClistError> {
        let cost = Self::cost(tile);
        if cost > self.capacity {
            return Err(ClistError::TileTooLarge {
                bytes: tile.byte_len(),
                capacity: self.capacity,
            });
        }
        self.tick += 1;
        let key = tile.key();
        if let Some(&index) = self.by_key.get(&key) {
            if let Some(entry) = self.slots[index as usize].as_mut() {
                entry.last_used = self.tick;
                entry.uses += 1;
            }
            self.stats.found += 1;
            return Ok(TileLookup {
                index,
                added: false,
                evicted: Vec::new(),
            });
        }

        let mut evicted = Vec::new();
        while self.used + cost > self.capacity || self.free.is_empty() {
            match self.evict_lru() {
                Some(index) => evicted.push(index),
                None => break,
            }
        }
        let Some(index) = self.free.pop() else {
            return Err(ClistError::TileTooLarge {
                bytes: tile.byte_len(),
                capacity: self.capacity,
            });
        };
        self.slots[index as usize] = Some(TileEntry {
            key,
            bytes: cost,
            last_used: self.tick,
            uses: 1,
            known: BandMask::new(self.nbands),
        });
        self.by_key.insert(key, index);
        self.used += cost;
        self.stats.added += 1;
        Ok(TileLookup {
            index,
            added: true,
            evicted,
        })
    }

    fn evict_lru(&mut self) -> Option<u16> {
        let (index, _) = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|entry| (idx, entry.last_used)))
            .min_by_key(|(_, last_used)| *last_used)?;
        let entry = self.slots[index].take()?;
        self.by_key.remove(&entry.key);
        self.used -= entry.bytes;
        let index = index as u16;
        self.free.push(index);
        self.stats.evicted += 1;
        Some(index)
    }

    pub fn band_knows(&self, index: u16, band: u32) -> bool {
        self.slots
            .get(index as usize)
            .and_then(Option::as_ref)
            .is_some_and(|entry| entry.known.contains(band))
    }

    /// Records that `band` received the bits for `index`.
    pub fn mark_known(&mut self, index: u16, band: u32) {
        if let Some(entry) = self.slots.get_mut(index as usize).and_then(Option::as_mut) {
            entry.known.insert(band);
        }
    }

    pub fn uses(&self, index: u16) -> u64 {
        self.slots
            .get(index as usize)
            .and_then(Option::as_ref)
            .map_or(0, |entry| entry.uses)
    }

    /// Drops every entry. Indices restart from zero and no band is assumed to
    /// hold any bits.
    pub fn reset(&mut self, nbands: u32) {
        self.clear_entries(nbands);
        self.generation = self.generation.wrapping_add(1);
        self.stats.resets += 1;
    }

    fn clear_entries(&mut self, nbands: u32) {
        self.nbands = nbands;
        self.by_key.clear();
        self.slots.clear();
        self.slots.resize_with(MAX_TILES, || None);
        self.free = (0..MAX_TILES as u16).rev().collect();
        self.used = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tile(seed: u8) -> TileBitmap {
        TileBitmap::new(8, 4, 1, vec![seed, seed ^ 0xff, seed, seed ^ 0xff]).unwrap()
    }

    #[test]
    fn identical_bits_share_one_entry() {
        let mut cache = TileCache::new(4096, 4);
        let first = cache.lookup_or_insert(&tile(1)).unwrap();
        let again = cache.lookup_or_insert(&tile(1)).unwrap();
        assert!(first.added);
        assert!(!again.added);
        assert_eq!(first.index, again.index);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.uses(first.index), 2);
        assert_eq!(cache.stats().found, 1);
    }

    #[test]
    fn eviction_is_least_recently_used() {
        let per_tile = 4 + ENTRY_OVERHEAD;
        let mut cache = TileCache::new(per_tile * 2, 1);
        let a = cache.lookup_or_insert(&tile(1)).unwrap().index;
        let b = cache.lookup_or_insert(&tile(2)).unwrap().index;
        cache.lookup_or_insert(&tile(1)).unwrap();
        let c = cache.lookup_or_insert(&tile(3)).unwrap();
        assert_eq!(c.evicted, vec![b]);
        assert_eq!(c.index, b);
        assert!(cache.used() <= cache.capacity());
        let again = cache.lookup_or_insert(&tile(1)).unwrap();
        assert_eq!(again.index, a);
        assert!(!again.added);
        assert_eq!(cache.stats().evicted, 1);
    }

    #[test]
    fn band_masks_reset_with_the_entry() {
        let per_tile = 4 + ENTRY_OVERHEAD;
        let mut cache = TileCache::new(per_tile, 70);
        let a = cache.lookup_or_insert(&tile(1)).unwrap().index;
        cache.mark_known(a, 0);
        cache.mark_known(a, 69);
        assert!(cache.band_knows(a, 69));
        assert!(!cache.band_knows(a, 68));
        let b = cache.lookup_or_insert(&tile(2)).unwrap();
        assert_eq!(b.index, a);
        assert!(!cache.band_knows(b.index, 0));
    }

    #[test]
    fn reset_bumps_generation_and_forgets_bands() {
        let mut cache = TileCache::new(4096, 2);
        let a = cache.lookup_or_insert(&tile(1)).unwrap().index;
        cache.mark_known(a, 1);
        let generation = cache.generation();
        cache.reset(2);
        assert_eq!(cache.generation(), generation + 1);
        assert!(cache.is_empty());
        assert!(!cache.band_knows(a, 1));
        assert_eq!(cache.used(), 0);
        assert!(cache.lookup_or_insert(&tile(1)).unwrap().added);
    }

    #[test]
    fn oversized_and_malformed_tiles_are_rejected() {
        let mut cache = TileCache::new(16, 1);
        assert!(matches!(
            cache.lookup_or_insert(&tile(1)),
            Err(ClistError::TileTooLarge { .. })
        ));
        assert!(TileBitmap::new(8, 2, 1, vec![0; 3]).is_err());
        assert!(TileBitmap::new(8, 2, 3, vec![0; 6]).is_err());
        assert_eq!(TileBitmap::new(3, 2, 4, vec![0; 4]).unwrap().raster, 2);
    }
}
