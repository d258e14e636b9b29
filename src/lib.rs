mod arena;
mod config;
mod debug;
mod encode;
mod error;
mod metrics;
mod perf;
mod recovery;
mod spool;
mod state;
mod stats;
mod tile_cache;
mod types;
mod writer;

use std::sync::Arc;

use rayon::prelude::*;

pub use arena::{BLOCK_OVERHEAD, BufferFull, CommandBuffer, ListId, MIN_BUFFER_SIZE};
pub use bandlist_format::{
    BandReplay, Command, FORMAT_ID, FORMAT_VERSION, ReplayState, SpoolReader,
    format_fingerprint_sha256,
};
pub use config::{
    ClistConfig, DEFAULT_BAND_HEIGHT, DEFAULT_BUFFER_SIZE, DEFAULT_COLOR_DEPTH,
    DEFAULT_TILE_CACHE_SIZE, ENV_BAND_HEIGHT, ENV_BUFFER_SIZE, ENV_SPOOL_DIR, ENV_TILE_CACHE_SIZE,
    MAX_RECOVERY_ATTEMPTS, MIN_TILE_CACHE_SIZE,
};
pub use debug::DebugLogger;
pub use encode::ColorTier;
pub use error::{
    ClistError, ErrorClass, FATAL, IO_ERROR, LIMIT_CHECK, RANGE_CHECK, Status, TYPE_CHECK,
    VM_ERROR, status_code,
};
pub use metrics::{DocumentMetrics, PageMetrics};
pub use perf::{DEFAULT_PERF_LOG, PerfLogger};
pub use recovery::{BandConsumer, PartialPage, RecoveryController, RecoveryState};
pub use spool::{
    FileSpool, MemoryBudget, MemorySpool, SpoolBackend, SpoolFile, SpoolPair, SpoolStore,
    WriteStatus,
};
pub use state::{BandState, BandStateTable, StateField, StateValue};
pub use stats::OpStats;
pub use tile_cache::{MAX_TILES, TileBitmap, TileCache, TileLookup, TileStats};
pub use types::{
    BandLayout, BandRange, ColorIndex, LogicalOp, NO_COLOR, PageGeometry, Rect, Target, TilePhase,
};
pub use writer::{ClistWriter, ClistWriterBuilder, CompletedPage};

/// Spool store and loggers opened once and shared by every writer of a batch.
struct SharedParts {
    backend: Option<SpoolBackend>,
    debug: Option<Arc<DebugLogger>>,
    perf: Option<Arc<PerfLogger>>,
}

fn open_shared_parts(config: &ClistConfig) -> Result<SharedParts, ClistError> {
    config.validate()?;
    let backend = match &config.spool_dir {
        Some(dir) => Some(SpoolBackend::directory(dir)?),
        None => None,
    };
    let debug = match &config.debug_path {
        Some(path) => Some(Arc::new(DebugLogger::new(path)?)),
        None => None,
    };
    let perf = match &config.perf_path {
        Some(path) => Some(Arc::new(PerfLogger::new(path)?)),
        None => None,
    };
    Ok(SharedParts {
        backend,
        debug,
        perf,
    })
}

/// Records independent documents in parallel, one writer per document.
///
/// Writers share the spool directory (so file names never collide) and the
/// debug and perf logs named by `config`. Results come back in input order.
pub fn record_documents<D, T, F>(
    config: &ClistConfig,
    documents: &[D],
    record: F,
) -> Vec<Result<T, ClistError>>
where
    D: Sync,
    T: Send,
    F: Fn(&mut ClistWriter, &D) -> Result<T, ClistError> + Sync,
{
    let shared = match open_shared_parts(config) {
        Ok(shared) => shared,
        Err(err) => {
            log::error!("cannot start batch of {} documents: {err}", documents.len());
            return documents.iter().map(|_| Err(err.latched())).collect();
        }
    };

    let mut results: Vec<(usize, Result<T, ClistError>)> = documents
        .par_iter()
        .enumerate()
        .map(|(idx, document)| {
            let mut builder = ClistWriterBuilder::from_config(config.clone());
            if let Some(backend) = shared.backend.clone() {
                builder = builder.spool_backend(backend);
            }
            if let Some(debug) = shared.debug.clone() {
                builder = builder.debug_logger(debug);
            }
            if let Some(perf) = shared.perf.clone() {
                builder = builder.perf_logger(perf);
            }
            let res = builder
                .build()
                .and_then(|mut writer| record(&mut writer, document));
            if let Err(err) = &res {
                log::warn!("document {idx}: {err}");
            }
            (idx, res)
        })
        .collect();
    results.sort_by_key(|(idx, _)| *idx);

    if let Some(debug) = shared.debug.as_deref() {
        debug.emit_summary("batch");
        debug.flush();
    }
    if let Some(perf) = shared.perf.as_deref() {
        perf.flush();
    }
    results.into_iter().map(|(_, res)| res).collect()
}
