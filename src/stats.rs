//! Opt-in per-page instrumentation, passed to `begin_page` and handed back
//! with the completed page.

use std::collections::BTreeMap;

use bandlist_format::{op, op_name};

use crate::debug::DebugLogger;
use crate::encode::ColorTier;
use crate::tile_cache::TileLookup;
use crate::types::Target;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpStats {
    /// Indexed by leading opcode byte.
    pub op_counts: Vec<u64>,
    pub op_sizes: Vec<u64>,
    pub ext_counts: BTreeMap<u8, u64>,
    pub same_band: u64,
    pub other_band: u64,
    pub range_ops: u64,
    /// Indexed by `ColorTier::index`.
    pub color_tiers: [u64; 4],
    pub tiles_found: u64,
    pub tiles_added: u64,
    pub tiles_evicted: u64,
    pub tile_resets: u64,
    pub flushes: u64,
    last_band: Option<u32>,
}

impl Default for OpStats {
    fn default() -> Self {
        Self {
            op_counts: vec![0; 256],
            op_sizes: vec![0; 256],
            ext_counts: BTreeMap::new(),
            same_band: 0,
            other_band: 0,
            range_ops: 0,
            color_tiers: [0; 4],
            tiles_found: 0,
            tiles_added: 0,
            tiles_evicted: 0,
            tile_resets: 0,
            flushes: 0,
            last_band: None,
        }
    }
}

impl OpStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&mut self, target: Target, bytes: &[u8]) {
        let Some(&code) = bytes.first() else {
            return;
        };
        self.op_counts[code as usize] += 1;
        self.op_sizes[code as usize] += bytes.len() as u64;
        if code == op::EXTEND {
            if let Some(&ext_op) = bytes.get(1) {
                *self.ext_counts.entry(ext_op).or_insert(0) += 1;
            }
        }
        match target {
            Target::Band(band) => {
                if self.last_band == Some(band) {
                    self.same_band += 1;
                } else {
                    self.other_band += 1;
                }
                self.last_band = Some(band);
            }
            Target::Range(_) => {
                self.range_ops += 1;
                self.last_band = None;
            }
        }
    }

    pub(crate) fn record_tier(&mut self, tier: ColorTier) {
        self.color_tiers[tier.index()] += 1;
    }

    pub(crate) fn record_tile(&mut self, lookup: &TileLookup) {
        if lookup.added {
            self.tiles_added += 1;
        } else {
            self.tiles_found += 1;
        }
        self.tiles_evicted += lookup.evicted.len() as u64;
    }

    pub fn instruction_count(&self) -> u64 {
        self.op_counts.iter().sum()
    }

    /// Counts and byte totals grouped by operation name, skipping unused ops.
    pub fn by_name(&self) -> BTreeMap<&'static str, (u64, u64)> {
        let mut out: BTreeMap<&'static str, (u64, u64)> = BTreeMap::new();
        for (code, (&count, &size)) in self.op_counts.iter().zip(&self.op_sizes).enumerate() {
            if count == 0 {
                continue;
            }
            let entry = out.entry(op_name(code as u8)).or_insert((0, 0));
            entry.0 += count;
            entry.1 += size;
        }
        out
    }

    pub fn emit(&self, logger: &DebugLogger, page: usize) {
        let mut fields: Vec<(String, u64)> = Vec::new();
        for (name, (count, size)) in self.by_name() {
            fields.push((format!("op.{name}.count"), count));
            fields.push((format!("op.{name}.bytes"), size));
        }
        for (ext_op, count) in &self.ext_counts {
            fields.push((format!("ext.{ext_op:#04x}"), *count));
        }
        let tiers = ["inline_delta", "packed_delta", "literal", "no_color"];
        for (name, count) in tiers.iter().zip(self.color_tiers) {
            fields.push((format!("color.{name}"), count));
        }
        fields.extend([
            ("band.same".to_string(), self.same_band),
            ("band.other".to_string(), self.other_band),
            ("band.range".to_string(), self.range_ops),
            ("tile.found".to_string(), self.tiles_found),
            ("tile.added".to_string(), self.tiles_added),
            ("tile.evicted".to_string(), self.tiles_evicted),
            ("tile.reset".to_string(), self.tile_resets),
            ("flushes".to_string(), self.flushes),
        ]);
        let borrowed: Vec<(&str, u64)> = fields
            .iter()
            .map(|(key, value)| (key.as_str(), *value))
            .collect();
        logger.log_event("clist.op_stats", page, &borrowed);
        for (key, value) in &borrowed {
            logger.increment(&format!("clist.{key}"), *value);
        }
    }
}
