use std::path::PathBuf;

use bandlist_format::BLOCK_RECORD_LEN;

use crate::arena::MIN_BUFFER_SIZE;
use crate::error::ClistError;
use crate::types::BandLayout;

pub const DEFAULT_COLOR_DEPTH: u8 = 24;
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;
pub const DEFAULT_TILE_CACHE_SIZE: usize = 256 * 1024;
pub const MIN_TILE_CACHE_SIZE: usize = 1024;
pub const DEFAULT_BAND_HEIGHT: u32 = 64;

/// Bounds the append/flush/recover loop of a single operation.
pub const MAX_RECOVERY_ATTEMPTS: usize = 16;

pub const ENV_SPOOL_DIR: &str = "BANDLIST_SPOOL_DIR";
pub const ENV_BUFFER_SIZE: &str = "BANDLIST_BUFFER_SIZE";
pub const ENV_TILE_CACHE_SIZE: &str = "BANDLIST_TILE_CACHE_SIZE";
pub const ENV_BAND_HEIGHT: &str = "BANDLIST_BAND_HEIGHT";

#[derive(Debug, Clone, PartialEq)]
pub struct ClistConfig {
    /// Bits per color value, 1..=64.
    pub color_depth: u8,
    /// Command buffer bytes shared by every band list.
    pub buffer_size: usize,
    pub tile_cache_size: usize,
    pub band_height: u32,
    /// Spool storage held back so a flush can still land under pressure.
    /// `None` sizes it from the page, see [`ClistConfig::reservations_for`].
    pub data_reserve: Option<u64>,
    pub block_reserve: Option<u64>,
    /// Allow soft recovery by draining already spooled bands.
    pub partial_rendering: bool,
    pub ignore_low_memory_warnings: bool,
    /// Directory for file-backed spools. `None` keeps spools in memory.
    pub spool_dir: Option<PathBuf>,
    pub debug_path: Option<PathBuf>,
    pub perf_path: Option<PathBuf>,
}

impl Default for ClistConfig {
    fn default() -> Self {
        Self {
            color_depth: DEFAULT_COLOR_DEPTH,
            buffer_size: DEFAULT_BUFFER_SIZE,
            tile_cache_size: DEFAULT_TILE_CACHE_SIZE,
            band_height: DEFAULT_BAND_HEIGHT,
            data_reserve: None,
            block_reserve: None,
            partial_rendering: true,
            ignore_low_memory_warnings: false,
            spool_dir: None,
            debug_path: None,
            perf_path: None,
        }
    }
}

fn env_number<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ClistError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ClistError::InvalidConfiguration(format!("{key}={raw} is not a number"))),
        Err(_) => Ok(None),
    }
}

impl ClistConfig {
    /// Applies `BANDLIST_*` environment overrides on top of `self`.
    pub fn with_env_overrides(mut self) -> Result<Self, ClistError> {
        if let Some(dir) = std::env::var_os(ENV_SPOOL_DIR).filter(|dir| !dir.is_empty()) {
            self.spool_dir = Some(PathBuf::from(dir));
        }
        if let Some(size) = env_number(ENV_BUFFER_SIZE)? {
            self.buffer_size = size;
        }
        if let Some(size) = env_number(ENV_TILE_CACHE_SIZE)? {
            self.tile_cache_size = size;
        }
        if let Some(height) = env_number(ENV_BAND_HEIGHT)? {
            self.band_height = height;
        }
        Ok(self)
    }

    /// Data and block file reservations for a page laid out as `layout`.
    ///
    /// The data file keeps room for one full command buffer plus an end
    /// marker for every band and the range list. The block file keeps room
    /// for a record per band, one range record and the page terminator.
    /// Nothing is held back when partial rendering is off.
    pub fn reservations_for(&self, layout: &BandLayout) -> (u64, u64) {
        if !self.partial_rendering {
            return (0, 0);
        }
        let nbands = layout.nbands as u64;
        let data = self
            .data_reserve
            .unwrap_or(self.buffer_size as u64 + nbands + 1);
        let blocks = self
            .block_reserve
            .unwrap_or(BLOCK_RECORD_LEN as u64 * (nbands + 2));
        (data, blocks)
    }

    pub fn validate(&self) -> Result<(), ClistError> {
        if self.color_depth == 0 || self.color_depth > 64 {
            return Err(ClistError::InvalidConfiguration(format!(
                "color_depth must be 1..=64, got {}",
                self.color_depth
            )));
        }
        if self.buffer_size < MIN_BUFFER_SIZE {
            return Err(ClistError::InvalidConfiguration(format!(
                "buffer_size must be at least {MIN_BUFFER_SIZE}, got {}",
                self.buffer_size
            )));
        }
        if self.tile_cache_size < MIN_TILE_CACHE_SIZE {
            return Err(ClistError::InvalidConfiguration(format!(
                "tile_cache_size must be at least {MIN_TILE_CACHE_SIZE}, got {}",
                self.tile_cache_size
            )));
        }
        if self.band_height == 0 {
            return Err(ClistError::InvalidConfiguration(
                "band_height must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
