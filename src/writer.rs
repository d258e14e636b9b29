//! Page recording: state deltas and instructions go into per-band and
//! band-range lists in the command buffer, which is flushed to the page's
//! spool pair whenever it fills up.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use bandlist_format::{BLOCK_RECORD_LEN, CmdBlock, FORMAT_ID, FORMAT_VERSION, ext, op};

use crate::arena::{CommandBuffer, ListId};
use crate::config::ClistConfig;
use crate::debug::DebugLogger;
use crate::encode::{self, ColorTier, Instruction};
use crate::error::{ClistError, Status};
use crate::metrics::{DocumentMetrics, PageMetrics};
use crate::perf::{DEFAULT_PERF_LOG, PerfLogger};
use crate::recovery::{BandConsumer, RecoveryController};
use crate::spool::{MemoryBudget, SpoolBackend, SpoolPair, WriteStatus};
use crate::state::{BandState, BandStateTable, StateField, StateValue, check_value};
use crate::stats::OpStats;
use crate::tile_cache::{TileBitmap, TileCache};
use crate::types::{
    BandLayout, BandRange, ColorIndex, LogicalOp, PageGeometry, Rect, Target, TilePhase,
};

pub(crate) struct PageRecord {
    pub(crate) number: usize,
    pub(crate) layout: BandLayout,
    pub(crate) spool: Option<SpoolPair>,
    pub(crate) stats: Option<OpStats>,
    pub(crate) metrics: PageMetrics,
    pub(crate) started: Instant,
    /// Something besides the page header was recorded since the last reset.
    pub(crate) dirty: bool,
}

/// A terminated page: every band ends with `end_page` and the block file
/// ends with the page terminator.
#[derive(Debug)]
pub struct CompletedPage {
    pub page_number: usize,
    pub layout: BandLayout,
    pub status: Status,
    pub spool: SpoolPair,
    pub metrics: PageMetrics,
    pub stats: Option<OpStats>,
}

pub struct ClistWriter {
    pub(crate) config: ClistConfig,
    pub(crate) backend: SpoolBackend,
    pub(crate) consumer: Option<Box<dyn BandConsumer>>,
    pub(crate) debug: Option<Arc<DebugLogger>>,
    pub(crate) perf: Option<Arc<PerfLogger>>,
    pub(crate) arena: CommandBuffer,
    pub(crate) states: BandStateTable,
    pub(crate) tiles: TileCache,
    pub(crate) recovery: RecoveryController,
    pub(crate) page: Option<PageRecord>,
    pages_begun: usize,
    metrics: DocumentMetrics,
}

pub struct ClistWriterBuilder {
    config: ClistConfig,
    backend: Option<SpoolBackend>,
    consumer: Option<Box<dyn BandConsumer>>,
    debug: Option<Arc<DebugLogger>>,
    perf: Option<Arc<PerfLogger>>,
}

impl ClistWriterBuilder {
    pub fn new() -> Self {
        Self::from_config(ClistConfig::default())
    }

    pub fn from_config(config: ClistConfig) -> Self {
        Self {
            config,
            backend: None,
            consumer: None,
            debug: None,
            perf: None,
        }
    }

    pub fn color_depth(mut self, depth: u8) -> Self {
        self.config.color_depth = depth;
        self
    }

    pub fn buffer_size(mut self, bytes: usize) -> Self {
        self.config.buffer_size = bytes;
        self
    }

    pub fn tile_cache_size(mut self, bytes: usize) -> Self {
        self.config.tile_cache_size = bytes;
        self
    }

    pub fn band_height(mut self, rows: u32) -> Self {
        self.config.band_height = rows;
        self
    }

    /// Fixed spool reservations in place of the page-sized defaults.
    pub fn reservations(mut self, data: u64, blocks: u64) -> Self {
        self.config.data_reserve = Some(data);
        self.config.block_reserve = Some(blocks);
        self
    }

    pub fn partial_rendering(mut self, enabled: bool) -> Self {
        self.config.partial_rendering = enabled;
        self
    }

    pub fn ignore_low_memory_warnings(mut self, enabled: bool) -> Self {
        self.config.ignore_low_memory_warnings = enabled;
        self
    }

    /// Spool pages to files in `dir` instead of memory.
    pub fn spool_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.spool_dir = Some(dir.into());
        self
    }

    pub fn memory_budget(mut self, budget: MemoryBudget) -> Self {
        self.backend = Some(SpoolBackend::Memory(budget));
        self
    }

    pub fn spool_backend(mut self, backend: SpoolBackend) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn consumer(mut self, consumer: impl BandConsumer + 'static) -> Self {
        self.consumer = Some(Box::new(consumer));
        self
    }

    /// JSONL log of page, flush and recovery events.
    pub fn debug_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.debug_path = Some(path.into());
        self
    }

    /// Shares an open debug log instead of creating one from a path.
    pub fn debug_logger(mut self, logger: Arc<DebugLogger>) -> Self {
        self.debug = Some(logger);
        self
    }

    pub fn perf_logger(mut self, logger: Arc<PerfLogger>) -> Self {
        self.perf = Some(logger);
        self
    }

    pub fn perf_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.perf_path = Some(path.into());
        self
    }

    /// Toggle perf logging, using the default file name when no path is set.
    pub fn perf_enabled(mut self, enabled: bool) -> Self {
        self.config.perf_path = match (enabled, self.config.perf_path.take()) {
            (false, _) => None,
            (true, Some(path)) => Some(path),
            (true, None) => Some(PathBuf::from(DEFAULT_PERF_LOG)),
        };
        self
    }

    pub fn build(self) -> Result<ClistWriter, ClistError> {
        self.config.validate()?;
        let backend = match (self.backend, &self.config.spool_dir) {
            (Some(backend), _) => backend,
            (None, Some(dir)) => SpoolBackend::directory(dir)?,
            (None, None) => SpoolBackend::default(),
        };
        let debug = match (self.debug, &self.config.debug_path) {
            (Some(logger), _) => Some(logger),
            (None, Some(path)) => Some(Arc::new(DebugLogger::new(path)?)),
            (None, None) => None,
        };
        let perf = match (self.perf, &self.config.perf_path) {
            (Some(logger), _) => Some(logger),
            (None, Some(path)) => Some(Arc::new(PerfLogger::new(path)?)),
            (None, None) => None,
        };
        Ok(ClistWriter {
            arena: CommandBuffer::new(self.config.buffer_size, 0),
            states: BandStateTable::new(0),
            tiles: TileCache::new(self.config.tile_cache_size, 0),
            config: self.config,
            backend,
            consumer: self.consumer,
            debug,
            perf,
            recovery: RecoveryController::new(),
            page: None,
            pages_begun: 0,
            metrics: DocumentMetrics::default(),
        })
    }
}

impl Default for ClistWriterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Splits a page-clipped rectangle into one piece per band it crosses.
fn band_slices(layout: &BandLayout, rect: Rect) -> Vec<(u32, Rect)> {
    let top = rect.y as u32;
    let bottom = top + rect.height;
    (layout.band_of_row(top)..=layout.band_of_row(bottom - 1))
        .map(|band| {
            let (band_top, band_bottom) = layout.band_rows(band);
            let y0 = top.max(band_top);
            let y1 = bottom.min(band_bottom);
            (band, Rect::new(rect.x, y0 as i32, rect.width, y1 - y0))
        })
        .collect()
}

fn write_runs(
    spool: &mut SpoolPair,
    arena: &CommandBuffer,
    runs: &[(ListId, i32, i32)],
    end: u8,
    terminate: bool,
) -> Result<(), ClistError> {
    for &(id, band_min, band_max) in runs {
        let record = CmdBlock {
            band_min,
            band_max,
            pos: spool.data.position() as i64,
        };
        spool.blocks.write_all(&record.to_bytes())?;
        for (_, chunk) in arena.chunks(id) {
            spool.data.write_all(chunk)?;
        }
        // Range runs never end the page; every band gets its own marker.
        let marker = if id == ListId::Range { op::END_RUN } else { end };
        spool.data.write_all(&[marker])?;
    }
    if terminate {
        let terminator = CmdBlock::terminator(spool.data.position() as i64);
        spool.blocks.write_all(&terminator.to_bytes())?;
    }
    Ok(())
}

impl ClistWriter {
    pub fn builder() -> ClistWriterBuilder {
        ClistWriterBuilder::new()
    }

    pub fn config(&self) -> &ClistConfig {
        &self.config
    }

    pub fn layout(&self) -> Option<BandLayout> {
        self.page.as_ref().map(|page| page.layout)
    }

    /// Number of the page in progress, or of the last page begun.
    pub fn page_number(&self) -> usize {
        self.page
            .as_ref()
            .map(|page| page.number)
            .unwrap_or(self.pages_begun)
    }

    pub fn metrics(&self) -> &DocumentMetrics {
        &self.metrics
    }

    pub fn recovery(&self) -> &RecoveryController {
        &self.recovery
    }

    pub fn tile_cache(&self) -> &TileCache {
        &self.tiles
    }

    pub fn command_buffer(&self) -> &CommandBuffer {
        &self.arena
    }

    pub fn band_state(&self, band: u32) -> Result<&BandState, ClistError> {
        self.states.band(band)
    }

    pub fn has_changed(
        &self,
        band: u32,
        field: StateField,
        value: &StateValue,
    ) -> Result<bool, ClistError> {
        self.states.has_changed(band, field, value)
    }

    pub(crate) fn page_is_dirty(&self) -> bool {
        self.page.as_ref().is_some_and(|page| page.dirty)
    }

    fn current_layout(&self) -> Result<BandLayout, ClistError> {
        self.layout().ok_or(ClistError::NoPage)
    }

    /// Spool reservations for the page in progress.
    pub fn reservations(&self) -> Result<(u64, u64), ClistError> {
        Ok(self.config.reservations_for(&self.current_layout()?))
    }

    fn stats_mut(&mut self) -> Option<&mut OpStats> {
        self.page.as_mut().and_then(|page| page.stats.as_mut())
    }

    fn record_tier(&mut self, tier: Option<ColorTier>) {
        if let (Some(tier), Some(stats)) = (tier, self.stats_mut()) {
            stats.record_tier(tier);
        }
    }

    /// Starts recording a page. Band state, tile cache and command buffer
    /// start from defaults and a fresh spool pair is opened.
    pub fn begin_page(
        &mut self,
        geometry: PageGeometry,
        stats: Option<OpStats>,
    ) -> Result<Status, ClistError> {
        if self.page.is_some() {
            return Err(ClistError::PageInProgress);
        }
        self.recovery.check()?;
        let layout = BandLayout::new(geometry, self.config.band_height)?;
        self.arena.reset(layout.nbands);
        self.states.reset(layout.nbands);
        self.tiles.reset(layout.nbands);
        let mut spool = self.backend.open_pair()?;
        let (data_reserve, block_reserve) = self.config.reservations_for(&layout);
        spool.set_reservations(data_reserve, block_reserve)?;

        self.pages_begun += 1;
        let number = self.pages_begun;
        self.page = Some(PageRecord {
            number,
            layout,
            spool: Some(spool),
            stats,
            metrics: PageMetrics {
                page_number: number,
                ..PageMetrics::default()
            },
            started: Instant::now(),
            dirty: false,
        });
        if let Err(err) = self.put_page_header() {
            if let Some(spool) = self.page.take().and_then(|page| page.spool) {
                let _ = spool.discard();
            }
            return Err(err);
        }

        log::debug!(
            "page {number}: {}x{} in {} bands of {} rows",
            geometry.width,
            geometry.height,
            layout.nbands,
            layout.band_height
        );
        if let Some(debug) = self.debug.as_deref() {
            debug.log_json(&format!(
                "{{\"type\":\"clist.format\",\"page\":{},\"id\":\"{}\",\"version\":\"{}\",\"fingerprint\":\"{}\"}}",
                number,
                FORMAT_ID,
                FORMAT_VERSION,
                bandlist_format::format_fingerprint_sha256()
            ));
            debug.log_event(
                "clist.begin_page",
                number,
                &[
                    ("width", geometry.width as u64),
                    ("height", geometry.height as u64),
                    ("nbands", layout.nbands as u64),
                    ("band_height", layout.band_height as u64),
                    ("depth", self.config.color_depth as u64),
                ],
            );
        }
        Ok(Status::Ok)
    }

    pub(crate) fn put_page_header(&mut self) -> Result<(), ClistError> {
        let layout = self.current_layout()?;
        let mut out = Instruction::new();
        encode::put_page_params(&mut out, &layout, self.config.color_depth);
        self.put_bytes(Target::Range(layout.full_range()), &out, false)
    }

    /// Appends one encoded instruction. A full buffer is flushed and the
    /// append retried once; an instruction that cannot fit an empty buffer
    /// is a protocol error.
    pub(crate) fn put_bytes(
        &mut self,
        target: Target,
        bytes: &[u8],
        content: bool,
    ) -> Result<(), ClistError> {
        self.recovery.check()?;
        let layout = self.current_layout()?;
        let id = match target {
            Target::Band(band) => {
                layout.check_band(band)?;
                ListId::Band(band)
            }
            Target::Range(range) => {
                layout.check_range(range)?;
                ListId::Range
            }
        };
        if bytes.len() > self.arena.max_instruction() {
            return Err(ClistError::InstructionTooLarge {
                size: bytes.len(),
                capacity: self.arena.capacity(),
            });
        }
        if let Target::Range(range) = target {
            if self.arena.needs_range_switch(range) {
                log::debug!(
                    "switching to bands {}..={}, flushing first",
                    range.min,
                    range.max
                );
                let written = self.flush_lists(op::END_RUN)?;
                self.check_low_memory(written)?;
            }
            self.arena.set_range_bounds(range);
        }
        if self.arena.append(id, bytes).is_err() {
            let written = self.flush_lists(op::END_RUN)?;
            self.check_low_memory(written)?;
            if let Target::Range(range) = target {
                self.arena.set_range_bounds(range);
            }
            let capacity = self.arena.capacity();
            self.arena
                .append(id, bytes)
                .map_err(|_| ClistError::InstructionTooLarge {
                    size: bytes.len(),
                    capacity,
                })?;
        }
        if let Some(page) = self.page.as_mut() {
            page.metrics.instruction_count += 1;
            page.dirty |= content;
            if let Some(stats) = page.stats.as_mut() {
                stats.record(target, bytes);
            }
        }
        Ok(())
    }

    /// Counts a write that fell into the spool reserve. Unless warnings are
    /// ignored it becomes a retryable memory error so recovery runs.
    fn note_low_memory(&mut self, written: WriteStatus) -> bool {
        if written != WriteStatus::LowMemory {
            return false;
        }
        let page_number = self.page_number();
        if let Some(page) = self.page.as_mut() {
            page.metrics.low_memory_warnings += 1;
        }
        log::warn!("page {page_number}: spool write used its memory reserve");
        if let Some(debug) = self.debug.as_deref() {
            debug.increment("clist.low_memory", 1);
        }
        !self.config.ignore_low_memory_warnings
    }

    fn check_low_memory(&mut self, written: WriteStatus) -> Result<(), ClistError> {
        if self.note_low_memory(written) {
            return Err(ClistError::VmError {
                context: "writing into the spool reserve",
                retryable: true,
            });
        }
        Ok(())
    }

    /// Writes the range list, then each band list in index order, to the
    /// spool and empties the command buffer. With `END_PAGE` every band gets
    /// a run and the page terminator follows. Storage for the whole flush is
    /// secured before any byte is written.
    pub(crate) fn flush_lists(&mut self, end: u8) -> Result<WriteStatus, ClistError> {
        let started = Instant::now();
        let Some(page) = self.page.as_mut() else {
            return Err(ClistError::NoPage);
        };
        let Some(spool) = page.spool.as_mut() else {
            return Err(ClistError::NoPage);
        };
        let mut runs: Vec<(ListId, i32, i32)> = Vec::new();
        if let Some(range) = self.arena.range_bounds() {
            if !self.arena.list_is_empty(ListId::Range) {
                runs.push((ListId::Range, range.min as i32, range.max as i32));
            }
        }
        for band in 0..self.arena.band_count() {
            if end != op::END_RUN || !self.arena.list_is_empty(ListId::Band(band)) {
                runs.push((ListId::Band(band), band as i32, band as i32));
            }
        }
        let terminate = end == op::END_PAGE;
        if runs.is_empty() && !terminate {
            return Ok(WriteStatus::Ok);
        }

        let data_len: u64 = runs
            .iter()
            .map(|(id, _, _)| self.arena.payload_len(*id) as u64 + 1)
            .sum();
        let records = runs.len() + usize::from(terminate);
        let status = spool
            .data
            .grow(data_len)?
            .merge(spool.blocks.grow((records * BLOCK_RECORD_LEN) as u64)?);
        if let Err(err) = write_runs(spool, &self.arena, &runs, end, terminate) {
            self.recovery.latch(&err);
            return Err(err);
        }

        let blocks = self.arena.block_count() as u64;
        let first_block = self.arena.next_block_id() - blocks;
        self.arena.clear();
        page.metrics.flush_count += 1;
        if let Some(stats) = page.stats.as_mut() {
            stats.flushes += 1;
        }
        let number = page.number;
        log::debug!(
            "page {number}: flushed {} runs, {data_len} bytes, blocks {first_block}..{}",
            runs.len(),
            first_block + blocks
        );
        if let Some(debug) = self.debug.as_deref() {
            debug.log_event(
                "clist.flush",
                number,
                &[
                    ("end", end as u64),
                    ("runs", runs.len() as u64),
                    ("data_bytes", data_len),
                    ("first_block", first_block),
                    ("blocks", blocks),
                ],
            );
            debug.increment("clist.flush", 1);
        }
        if let Some(perf) = self.perf.as_deref() {
            perf.log_since("clist.flush", Some(number), started);
        }
        Ok(status)
    }

    pub fn set_band_state(
        &mut self,
        band: u32,
        field: StateField,
        value: StateValue,
    ) -> Result<Status, ClistError> {
        self.recovery.check()?;
        check_value(field, value)?;
        let (_, status) = self.with_recovery(|w| w.put_band_state(band, field, value))?;
        Ok(status)
    }

    /// Emits `value` for `band` unless the band already holds it, then
    /// commits it.
    fn put_band_state(
        &mut self,
        band: u32,
        field: StateField,
        value: StateValue,
    ) -> Result<(), ClistError> {
        self.current_layout()?.check_band(band)?;
        let prev = self.states.get(band, field)?;
        if prev == value {
            return Ok(());
        }
        let mut out = Instruction::new();
        let tier = encode::put_state(&mut out, field, value, Some(prev), self.config.color_depth)?;
        self.put_bytes(Target::Band(band), &out, true)?;
        self.states.commit(band, field, value)?;
        self.record_tier(tier);
        Ok(())
    }

    pub fn set_range_state(
        &mut self,
        range: BandRange,
        field: StateField,
        value: StateValue,
    ) -> Result<Status, ClistError> {
        self.recovery.check()?;
        check_value(field, value)?;
        let (_, status) = self.with_recovery(|w| w.put_range_state(range, field, value))?;
        Ok(status)
    }

    /// Deltas against the value every band in `range` shares; when they
    /// disagree the value is sent in full.
    fn put_range_state(
        &mut self,
        range: BandRange,
        field: StateField,
        value: StateValue,
    ) -> Result<(), ClistError> {
        self.current_layout()?.check_range(range)?;
        let common = self.states.common(range, field)?;
        if common == Some(value) {
            return Ok(());
        }
        let mut out = Instruction::new();
        let tier = encode::put_state(&mut out, field, value, common, self.config.color_depth)?;
        self.put_bytes(Target::Range(range), &out, true)?;
        self.states.commit_range(range, field, value)?;
        self.record_tier(tier);
        Ok(())
    }

    /// Installs `lop` for `band`. The default operation just disables lop.
    pub fn update_lop(&mut self, band: u32, lop: LogicalOp) -> Result<Status, ClistError> {
        self.recovery.check()?;
        let (_, status) = self.with_recovery(|w| {
            if lop.is_default() {
                w.put_band_state(band, StateField::LopEnabled, StateValue::Flag(false))
            } else {
                w.put_band_state(band, StateField::LogicalOp, StateValue::Lop(lop))?;
                w.put_band_state(band, StateField::LopEnabled, StateValue::Flag(true))
            }
        })?;
        Ok(status)
    }

    /// Records a caller-defined instruction as an extended op. Opcodes below
    /// `ext::FIRST_USER` belong to the format itself.
    pub fn append_instruction(
        &mut self,
        target: Target,
        opcode: u8,
        payload: &[u8],
    ) -> Result<Status, ClistError> {
        self.recovery.check()?;
        if opcode < ext::FIRST_USER {
            return Err(ClistError::ReservedOpcode(opcode));
        }
        let mut out = Vec::with_capacity(encode::extended_len(payload.len()));
        encode::put_extended(&mut out, opcode, payload);
        let (_, status) = self.with_recovery(|w| w.put_bytes(target, &out, true))?;
        Ok(status)
    }

    pub fn fill_rect(&mut self, rect: Rect, color: ColorIndex) -> Result<Status, ClistError> {
        self.recovery.check()?;
        let layout = self.current_layout()?;
        encode::check_color(color, self.config.color_depth)?;
        let Some(rect) = rect.clip_to(layout.geometry) else {
            return Ok(Status::Ok);
        };
        let mut status = Status::Ok;
        for (band, piece) in band_slices(&layout, rect) {
            let (_, band_status) = self.with_recovery(|w| {
                w.put_band_state(band, StateField::LopEnabled, StateValue::Flag(false))?;
                w.put_band_state(band, StateField::FillColor, StateValue::Color(color))?;
                let mut out = Instruction::new();
                encode::put_rect(&mut out, op::FILL_RECT, piece);
                w.put_bytes(Target::Band(band), &out, true)
            })?;
            status = status.merge(band_status);
        }
        Ok(status)
    }

    pub fn tile_rect(
        &mut self,
        rect: Rect,
        tile: &TileBitmap,
        colors: [ColorIndex; 2],
        phase: TilePhase,
    ) -> Result<Status, ClistError> {
        self.recovery.check()?;
        let layout = self.current_layout()?;
        for color in colors {
            encode::check_color(color, self.config.color_depth)?;
        }
        let Some(rect) = rect.clip_to(layout.geometry) else {
            return Ok(Status::Ok);
        };
        let mut status = Status::Ok;
        for (band, piece) in band_slices(&layout, rect) {
            let (_, band_status) =
                self.with_recovery(|w| w.put_tile_rect(band, piece, tile, colors, phase))?;
            status = status.merge(band_status);
        }
        Ok(status)
    }

    fn put_tile_rect(
        &mut self,
        band: u32,
        piece: Rect,
        tile: &TileBitmap,
        colors: [ColorIndex; 2],
        phase: TilePhase,
    ) -> Result<(), ClistError> {
        let lookup = self.tiles.lookup_or_insert(tile)?;
        if let Some(stats) = self.stats_mut() {
            stats.record_tile(&lookup);
        }
        if !lookup.evicted.is_empty() {
            log::debug!("tile cache evicted {} entries", lookup.evicted.len());
        }
        if !self.tiles.band_knows(lookup.index, band) {
            let mut bits = Vec::with_capacity(encode::tile_bits_len(tile));
            encode::put_tile_bits(&mut bits, lookup.index, tile);
            self.put_bytes(Target::Band(band), &bits, true)?;
            self.tiles.mark_known(lookup.index, band);
        }
        self.put_band_state(band, StateField::LopEnabled, StateValue::Flag(false))?;
        self.put_band_state(band, StateField::TileColor0, StateValue::Color(colors[0]))?;
        self.put_band_state(band, StateField::TileColor1, StateValue::Color(colors[1]))?;
        self.put_band_state(band, StateField::TilePhase, StateValue::Phase(phase))?;
        let current = self.states.band(band)?.tile_index;
        if current != Some(lookup.index) {
            let mut out = Instruction::new();
            encode::put_tile_index(&mut out, lookup.index, current);
            self.put_bytes(Target::Band(band), &out, true)?;
            self.states.set_tile_index(band, Some(lookup.index))?;
        }
        let mut out = Instruction::new();
        encode::put_rect(&mut out, op::TILE_RECT, piece);
        self.put_bytes(Target::Band(band), &out, true)
    }

    /// Flushes every non-empty list, ending each run with `end_run`.
    pub fn flush(&mut self) -> Result<Status, ClistError> {
        self.recovery.check()?;
        self.current_layout()?;
        let (_, status) = self.with_recovery(|w| {
            let written = w.flush_lists(op::END_RUN)?;
            w.check_low_memory(written)
        })?;
        Ok(status)
    }

    /// Terminates the page and hands back its spool with the page's metrics.
    pub fn end_page(&mut self) -> Result<CompletedPage, ClistError> {
        self.recovery.check()?;
        self.current_layout()?;
        let started = Instant::now();
        let (written, mut status) = self.with_recovery(|w| w.flush_lists(op::END_PAGE))?;
        if self.note_low_memory(written) {
            status = status.merge(Status::RecoveredLowMemory);
        }
        let mut page = self.page.take().ok_or(ClistError::NoPage)?;
        let mut spool = page.spool.take().ok_or(ClistError::NoPage)?;
        spool.release_reservations();

        page.metrics.data_bytes += spool.data_len();
        page.metrics.block_bytes += spool.block_len();
        page.metrics.record_ms = page.started.elapsed().as_secs_f64() * 1000.0;
        if page.metrics.soft_recoveries + page.metrics.hard_recoveries > 0 {
            status = status.merge(Status::RecoveredLowMemory);
        }
        self.metrics.push(page.metrics.clone());

        let number = page.number;
        log::debug!(
            "page {number}: ended with {} instructions in {} flushes",
            page.metrics.instruction_count,
            page.metrics.flush_count
        );
        if let Some(debug) = self.debug.as_deref() {
            debug.log_event(
                "clist.end_page",
                number,
                &[
                    ("status", status.code() as u64),
                    ("instructions", page.metrics.instruction_count as u64),
                    ("flushes", page.metrics.flush_count as u64),
                    ("data_bytes", page.metrics.data_bytes),
                    ("block_bytes", page.metrics.block_bytes),
                ],
            );
            if let Some(stats) = page.stats.as_ref() {
                stats.emit(debug, number);
            }
            debug.emit_summary(&format!("page {number}"));
            debug.flush();
        }
        if let Some(perf) = self.perf.as_deref() {
            perf.log_since("clist.end_page", Some(number), started);
            perf.log_counts(
                "clist.page",
                Some(number),
                &[
                    ("instructions", page.metrics.instruction_count as u64),
                    ("flushes", page.metrics.flush_count as u64),
                    ("soft_recoveries", page.metrics.soft_recoveries as u64),
                    ("hard_recoveries", page.metrics.hard_recoveries as u64),
                ],
            );
            perf.flush();
        }
        Ok(CompletedPage {
            page_number: number,
            layout: page.layout,
            status,
            spool,
            metrics: page.metrics,
            stats: page.stats,
        })
    }

    /// Drops the page in progress and its spool files without terminating
    /// it. Clears any latched error.
    pub fn abort_page(&mut self) -> Result<(), ClistError> {
        let page = self.page.take();
        self.arena.clear();
        self.recovery.clear();
        let Some(page) = page else {
            return Ok(());
        };
        log::warn!("page {}: aborted", page.number);
        if let Some(debug) = self.debug.as_deref() {
            debug.log_event("clist.abort_page", page.number, &[]);
        }
        match page.spool {
            Some(spool) => spool.discard(),
            None => Ok(()),
        }
    }
}
