//! Block directory parsing and per-band replay.
//!
//! The writer's contract ends at the two spool files; this module is the
//! independent view of them that band consumers and tests decode through.

use std::collections::BTreeMap;

use crate::block::{BLOCK_RECORD_LEN, CmdBlock};
use crate::color::{
    NO_COLOR, NO_COLOR_NIBBLE, apply_packed_delta, color_bytes, delta_len, depth_mask,
    literal_value, unpack_delta,
};
use crate::varint::{get_w, unzigzag};
use crate::{DEFAULT_LOP, FormatError, MAX_TILE_INDEX, ext, op};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    EndRun,
    EndPage,
    SetColor { slot: u8, tile: bool, color: u64 },
    SetTilePhase { x: i64, y: i64 },
    SetTileBits {
        index: u16,
        width: u64,
        height: u64,
        depth: u8,
        raster: u64,
        data: Vec<u8>,
    },
    SetTileIndex(u16),
    SetLop(u32),
    EnableLop,
    DisableLop,
    EnableClip,
    DisableClip,
    FillRect { x: i64, y: i64, width: u64, height: u64 },
    TileRect { x: i64, y: i64, width: u64, height: u64 },
    PageParams {
        width: u64,
        height: u64,
        band_height: u64,
        depth: u8,
    },
    Extended { op: u8, payload: Vec<u8> },
}

/// What a reader knows about one band after replaying its runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayState {
    pub colors: [u64; 2],
    pub tile_colors: [u64; 2],
    pub tile_phase: (i64, i64),
    pub lop: u32,
    pub lop_enabled: bool,
    pub clip_enabled: bool,
    pub tile_index: Option<u16>,
    pub depth: Option<u8>,
    pub tiles: BTreeMap<u16, Vec<u8>>,
}

impl Default for ReplayState {
    fn default() -> Self {
        Self {
            colors: [NO_COLOR; 2],
            tile_colors: [NO_COLOR; 2],
            tile_phase: (0, 0),
            lop: DEFAULT_LOP,
            lop_enabled: false,
            clip_enabled: false,
            tile_index: None,
            depth: None,
            tiles: BTreeMap::new(),
        }
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    at: usize,
    base: usize,
}

impl<'a> Cursor<'a> {
    fn offset(&self) -> usize {
        self.base + self.at
    }

    fn byte(&mut self) -> Result<u8, FormatError> {
        let value = *self
            .bytes
            .get(self.at)
            .ok_or(FormatError::Truncated(self.offset()))?;
        self.at += 1;
        Ok(value)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], FormatError> {
        let end = self
            .at
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(FormatError::Truncated(self.offset()))?;
        let slice = &self.bytes[self.at..end];
        self.at = end;
        Ok(slice)
    }

    fn w(&mut self) -> Result<u64, FormatError> {
        let (value, used) = get_w(&self.bytes[self.at..], self.offset())?;
        self.at += used;
        Ok(value)
    }

    fn zw(&mut self) -> Result<i64, FormatError> {
        self.w().map(unzigzag)
    }

    fn at_end(&self) -> bool {
        self.at == self.bytes.len()
    }
}

/// Decodes instruction runs for a single band, carrying state across runs.
#[derive(Debug, Clone, Default)]
pub struct BandDecoder {
    state: ReplayState,
}

impl BandDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_depth(depth: u8) -> Self {
        let mut decoder = Self::default();
        decoder.state.depth = Some(depth);
        decoder
    }

    pub fn state(&self) -> &ReplayState {
        &self.state
    }

    pub fn into_state(self) -> ReplayState {
        self.state
    }

    /// Decodes one run, which must end with exactly one end marker. `base`
    /// is the run's offset in the data file, used in error positions.
    pub fn decode_run(
        &mut self,
        run: &[u8],
        base: usize,
        out: &mut Vec<Command>,
    ) -> Result<Command, FormatError> {
        let mut cur = Cursor {
            bytes: run,
            at: 0,
            base,
        };
        let mut tile_color = false;
        loop {
            let at = cur.offset();
            let code = cur.byte()?;
            let is_color = matches!(code >> 4, 0x1 | 0x2 | 0x4 | 0x5)
                || matches!(code, op::DELTA_COLOR0 | op::DELTA_COLOR1);
            if tile_color && !is_color {
                return Err(FormatError::Malformed {
                    at,
                    reason: "set_tile_color not followed by a color",
                });
            }
            let command = match code {
                op::END_RUN | op::END_PAGE => {
                    if !cur.at_end() {
                        return Err(FormatError::Malformed {
                            at,
                            reason: "bytes after end of run",
                        });
                    }
                    let end = if code == op::END_RUN {
                        Command::EndRun
                    } else {
                        Command::EndPage
                    };
                    out.push(end.clone());
                    return Ok(end);
                }
                op::SET_TILE_PHASE => {
                    let x = cur.zw()?;
                    let y = cur.zw()?;
                    self.state.tile_phase = (x, y);
                    Command::SetTilePhase { x, y }
                }
                op::SET_TILE_BITS => {
                    let index = cur.w()?;
                    if index > MAX_TILE_INDEX as u64 {
                        return Err(FormatError::Malformed {
                            at,
                            reason: "tile index exceeds 12 bits",
                        });
                    }
                    let width = cur.w()?;
                    let height = cur.w()?;
                    let depth = cur.byte()?;
                    let raster = cur.w()?;
                    let len = raster
                        .checked_mul(height)
                        .and_then(|len| usize::try_from(len).ok())
                        .ok_or(FormatError::Malformed {
                            at,
                            reason: "tile size overflows",
                        })?;
                    let data = cur.take(len)?.to_vec();
                    let index = index as u16;
                    self.state.tiles.insert(index, data.clone());
                    Command::SetTileBits {
                        index,
                        width,
                        height,
                        depth,
                        raster,
                        data,
                    }
                }
                op::SET_TILE_COLOR => {
                    tile_color = true;
                    continue;
                }
                op::SET_MISC => {
                    let lsb = cur.byte()? as u32 & 0x3f;
                    let msb = cur.w()?;
                    let lop = u32::try_from(msb << 6)
                        .map_err(|_| FormatError::Malformed {
                            at,
                            reason: "logical operation out of range",
                        })?
                        | lsb;
                    self.state.lop = lop;
                    Command::SetLop(lop)
                }
                op::ENABLE_LOP => {
                    self.state.lop_enabled = true;
                    Command::EnableLop
                }
                op::DISABLE_LOP => {
                    self.state.lop_enabled = false;
                    Command::DisableLop
                }
                op::ENABLE_CLIP => {
                    self.state.clip_enabled = true;
                    Command::EnableClip
                }
                op::DISABLE_CLIP => {
                    self.state.clip_enabled = false;
                    Command::DisableClip
                }
                op::DELTA_COLOR0 | op::DELTA_COLOR1 => {
                    let slot = (code - op::DELTA_COLOR0) as usize;
                    let depth = self.depth(at)?;
                    let num_bytes = color_bytes(depth);
                    let packed = cur.take(delta_len(num_bytes))?;
                    let prev = self.color_slot(tile_color, slot);
                    if prev == NO_COLOR {
                        return Err(FormatError::Malformed {
                            at,
                            reason: "color delta without a previous color",
                        });
                    }
                    let color = apply_packed_delta(prev, unpack_delta(packed, num_bytes), depth);
                    self.set_color(tile_color, slot, color, depth, at)?
                }
                0x10..=0x2f => {
                    let slot = ((code >> 4) - 1) as usize;
                    let nibble = code & 0x0f;
                    let depth = self.depth(at)?;
                    let color = if nibble == NO_COLOR_NIBBLE {
                        NO_COLOR
                    } else {
                        let num_bytes = color_bytes(depth);
                        let dropped = nibble as usize;
                        if dropped > num_bytes {
                            return Err(FormatError::Malformed {
                                at,
                                reason: "dropped bytes exceed color depth",
                            });
                        }
                        literal_value(cur.take(num_bytes - dropped)?, nibble)
                    };
                    self.set_color(tile_color, slot, color, depth, at)?
                }
                0x40..=0x5f => {
                    let slot = ((code >> 4) - 4) as usize;
                    let delta = (code & 0x0f) as i64 - 8;
                    let depth = self.depth(at)?;
                    let prev = self.color_slot(tile_color, slot);
                    if prev == NO_COLOR {
                        return Err(FormatError::Malformed {
                            at,
                            reason: "color delta without a previous color",
                        });
                    }
                    let color = prev.wrapping_add(delta as u64);
                    self.set_color(tile_color, slot, color, depth, at)?
                }
                op::FILL_RECT | op::TILE_RECT => {
                    let x = cur.zw()?;
                    let y = cur.zw()?;
                    let width = cur.w()?;
                    let height = cur.w()?;
                    if code == op::FILL_RECT {
                        Command::FillRect { x, y, width, height }
                    } else {
                        Command::TileRect { x, y, width, height }
                    }
                }
                0xb0..=0xbf => {
                    let delta = (code & 0x0f) as i32 - 8;
                    let current = self.state.tile_index.ok_or(FormatError::Malformed {
                        at,
                        reason: "tile index delta without a current tile",
                    })?;
                    let index = current as i32 + delta;
                    if !(0..=MAX_TILE_INDEX as i32).contains(&index) {
                        return Err(FormatError::Malformed {
                            at,
                            reason: "tile index delta out of range",
                        });
                    }
                    self.state.tile_index = Some(index as u16);
                    Command::SetTileIndex(index as u16)
                }
                0xc0..=0xcf => {
                    let index = (((code & 0x0f) as u16) << 8) | cur.byte()? as u16;
                    self.state.tile_index = Some(index);
                    Command::SetTileIndex(index)
                }
                op::EXTEND => {
                    let ext_op = cur.byte()?;
                    let len = usize::try_from(cur.w()?).map_err(|_| FormatError::Malformed {
                        at,
                        reason: "extended payload too large",
                    })?;
                    let payload = cur.take(len)?;
                    if ext_op == ext::PAGE_PARAMS {
                        self.page_params(payload, cur.offset() - len)?
                    } else {
                        Command::Extended {
                            op: ext_op,
                            payload: payload.to_vec(),
                        }
                    }
                }
                other => return Err(FormatError::UnknownOpcode { op: other, at }),
            };
            tile_color = false;
            out.push(command);
        }
    }

    fn page_params(&mut self, payload: &[u8], base: usize) -> Result<Command, FormatError> {
        let mut cur = Cursor {
            bytes: payload,
            at: 0,
            base,
        };
        let width = cur.w()?;
        let height = cur.w()?;
        let band_height = cur.w()?;
        let depth = cur.w()?;
        if depth == 0 || depth > 64 || !cur.at_end() {
            return Err(FormatError::Malformed {
                at: base,
                reason: "bad page parameters",
            });
        }
        let depth = depth as u8;
        self.state.depth = Some(depth);
        Ok(Command::PageParams {
            width,
            height,
            band_height,
            depth,
        })
    }

    fn depth(&self, at: usize) -> Result<u8, FormatError> {
        self.state.depth.ok_or(FormatError::Malformed {
            at,
            reason: "color before page parameters",
        })
    }

    fn color_slot(&self, tile: bool, slot: usize) -> u64 {
        if tile {
            self.state.tile_colors[slot]
        } else {
            self.state.colors[slot]
        }
    }

    fn set_color(
        &mut self,
        tile: bool,
        slot: usize,
        color: u64,
        depth: u8,
        at: usize,
    ) -> Result<Command, FormatError> {
        if color != NO_COLOR && color > depth_mask(depth) {
            return Err(FormatError::Malformed {
                at,
                reason: "color exceeds depth",
            });
        }
        if tile {
            self.state.tile_colors[slot] = color;
        } else {
            self.state.colors[slot] = color;
        }
        Ok(Command::SetColor {
            slot: slot as u8,
            tile,
            color,
        })
    }
}

/// A directory record resolved to its byte extent in the data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunEntry {
    pub block: CmdBlock,
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PageDirectory {
    pub runs: Vec<RunEntry>,
    pub end: usize,
}

impl PageDirectory {
    pub fn band_count(&self) -> usize {
        self.runs
            .iter()
            .map(|run| run.block.band_max as usize + 1)
            .max()
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BandReplay {
    pub commands: Vec<Command>,
    pub state: ReplayState,
    pub ended_page: bool,
}

pub struct SpoolReader<'a> {
    data: &'a [u8],
    pages: Vec<PageDirectory>,
}

impl<'a> SpoolReader<'a> {
    /// Parses the block file and checks every record against the data file.
    /// A directory that does not end with a terminator is truncated.
    pub fn new(data: &'a [u8], blocks: &[u8]) -> Result<Self, FormatError> {
        if blocks.len() % BLOCK_RECORD_LEN != 0 {
            return Err(FormatError::Truncated(blocks.len()));
        }
        let mut pages = Vec::new();
        let mut pending: Vec<CmdBlock> = Vec::new();
        let mut floor = 0usize;
        for (index, record) in blocks.chunks_exact(BLOCK_RECORD_LEN).enumerate() {
            let block = CmdBlock::from_bytes(record)?;
            let pos = usize::try_from(block.pos)
                .ok()
                .filter(|pos| *pos <= data.len() && *pos >= floor)
                .ok_or(FormatError::BadOffset {
                    pos: block.pos,
                    len: data.len(),
                })?;
            if block.is_terminator() {
                let mut runs = Vec::with_capacity(pending.len());
                for (idx, run) in pending.iter().enumerate() {
                    let end = pending
                        .get(idx + 1)
                        .map(|next| next.pos as usize)
                        .unwrap_or(pos);
                    let start = run.pos as usize;
                    if end <= start || !matches!(data[end - 1], op::END_RUN | op::END_PAGE) {
                        return Err(FormatError::MissingRunEnd { pos: run.pos });
                    }
                    runs.push(RunEntry {
                        block: *run,
                        start,
                        end,
                    });
                }
                pages.push(PageDirectory { runs, end: pos });
                pending.clear();
            } else {
                if block.band_min < 0 || block.band_max < block.band_min {
                    return Err(FormatError::BadRecord {
                        index,
                        band_min: block.band_min,
                        band_max: block.band_max,
                    });
                }
                pending.push(block);
            }
            floor = pos;
        }
        if !pending.is_empty() || pages.is_empty() {
            return Err(FormatError::MissingTerminator);
        }
        Ok(Self { data, pages })
    }

    pub fn pages(&self) -> &[PageDirectory] {
        &self.pages
    }

    pub fn run_bytes(&self, run: &RunEntry) -> &'a [u8] {
        &self.data[run.start..run.end]
    }

    /// Replays every run that applies to `band`, in directory order.
    pub fn replay_band(&self, page: usize, band: i32) -> Result<BandReplay, FormatError> {
        let directory = self
            .pages
            .get(page)
            .ok_or(FormatError::MissingTerminator)?;
        let mut decoder = BandDecoder::new();
        let mut commands = Vec::new();
        let mut ended_page = false;
        for run in directory.runs.iter().filter(|run| run.block.covers(band)) {
            let end = decoder.decode_run(self.run_bytes(run), run.start, &mut commands)?;
            ended_page |= end == Command::EndPage;
        }
        Ok(BandReplay {
            commands,
            state: decoder.into_state(),
            ended_page,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::varint::{put_w, zigzag};

    fn page_params(width: u64, height: u64, band_height: u64, depth: u64) -> Vec<u8> {
        let mut payload = Vec::new();
        put_w(&mut payload, width);
        put_w(&mut payload, height);
        put_w(&mut payload, band_height);
        put_w(&mut payload, depth);
        let mut out = vec![op::EXTEND, ext::PAGE_PARAMS];
        put_w(&mut out, payload.len() as u64);
        out.extend(payload);
        out
    }

    struct Spool {
        data: Vec<u8>,
        blocks: Vec<u8>,
    }

    impl Spool {
        fn new() -> Self {
            Self {
                data: Vec::new(),
                blocks: Vec::new(),
            }
        }

        fn run(&mut self, band_min: i32, band_max: i32, body: &[u8], end: u8) {
            let block = CmdBlock {
                band_min,
                band_max,
                pos: self.data.len() as i64,
            };
            self.blocks.extend_from_slice(&block.to_bytes());
            self.data.extend_from_slice(body);
            self.data.push(end);
        }

        fn terminate(&mut self) {
            let end = CmdBlock::terminator(self.data.len() as i64);
            self.blocks.extend_from_slice(&end.to_bytes());
        }
    }

    #[test]
    fn replays_range_then_band_runs_in_directory_order() {
        let mut spool = Spool::new();
        spool.run(0, 3, &page_params(200, 400, 100, 24), op::END_RUN);
        spool.run(2, 2, &[op::SET_COLOR1, 0x11, 0x22, 0x33], op::END_RUN);
        spool.run(2, 2, &[op::INLINE_DELTA_COLOR1 + 9], op::END_PAGE);
        spool.terminate();

        let reader = SpoolReader::new(&spool.data, &spool.blocks).unwrap();
        assert_eq!(reader.pages().len(), 1);
        assert_eq!(reader.pages()[0].band_count(), 4);
        let replay = reader.replay_band(0, 2).unwrap();
        let colors: Vec<u64> = replay
            .commands
            .iter()
            .filter_map(|cmd| match cmd {
                Command::SetColor { color, .. } => Some(*color),
                _ => None,
            })
            .collect();
        assert_eq!(colors, vec![0x112233, 0x112234]);
        assert!(replay.ended_page);
        assert_eq!(replay.state.colors[1], 0x112234);

        let untouched = reader.replay_band(0, 1).unwrap();
        assert_eq!(untouched.state.colors, [NO_COLOR; 2]);
        assert!(!untouched.ended_page);
    }

    #[test]
    fn missing_terminator_is_truncation() {
        let mut spool = Spool::new();
        spool.run(0, 0, &page_params(10, 10, 10, 8), op::END_RUN);
        assert!(matches!(
            SpoolReader::new(&spool.data, &spool.blocks),
            Err(FormatError::MissingTerminator)
        ));
        assert!(matches!(
            SpoolReader::new(&[], &[]),
            Err(FormatError::MissingTerminator)
        ));
    }

    #[test]
    fn offsets_past_the_data_file_are_rejected() {
        let mut spool = Spool::new();
        spool.run(0, 0, &[op::ENABLE_CLIP], op::END_RUN);
        spool.blocks.extend_from_slice(&CmdBlock::terminator(64).to_bytes());
        assert!(matches!(
            SpoolReader::new(&spool.data, &spool.blocks),
            Err(FormatError::BadOffset { pos: 64, .. })
        ));
    }

    #[test]
    fn decodes_state_opcodes() {
        let mut body = page_params(64, 64, 16, 8);
        body.push(op::SET_TILE_PHASE);
        put_w(&mut body, zigzag(-3));
        put_w(&mut body, zigzag(5));
        body.extend_from_slice(&[op::SET_MISC, 0x3a]);
        put_w(&mut body, 0x1fa >> 6);
        body.extend_from_slice(&[op::ENABLE_LOP, op::ENABLE_CLIP]);
        body.extend_from_slice(&[op::SET_TILE_BITS, 0x05, 0x02, 0x02, 0x01, 0x01, 0xc0, 0x40]);
        body.extend_from_slice(&[op::SET_TILE_INDEX, 0x05, op::DELTA_TILE_INDEX + 10]);
        body.extend_from_slice(&[op::SET_TILE_COLOR, op::SET_COLOR0 + NO_COLOR_NIBBLE]);
        body.extend_from_slice(&[op::SET_TILE_COLOR, op::SET_COLOR1, 0x80]);

        let mut decoder = BandDecoder::new();
        let mut out = Vec::new();
        decoder.decode_run(&[body, vec![op::END_RUN]].concat(), 0, &mut out).unwrap();
        let state = decoder.state();
        assert_eq!(state.depth, Some(8));
        assert_eq!(state.tile_phase, (-3, 5));
        assert_eq!(state.lop, 0x1fa);
        assert!(state.lop_enabled && state.clip_enabled);
        assert_eq!(state.tile_index, Some(7));
        assert_eq!(state.tiles.get(&5), Some(&vec![0xc0, 0x40]));
        assert_eq!(state.tile_colors, [NO_COLOR, 0x80]);
        assert_eq!(state.colors, [NO_COLOR; 2]);
    }

    #[test]
    fn trailing_bytes_after_end_marker_are_malformed() {
        let mut decoder = BandDecoder::with_depth(8);
        let mut out = Vec::new();
        let err = decoder
            .decode_run(&[op::END_RUN, op::ENABLE_CLIP], 0, &mut out)
            .unwrap_err();
        assert!(matches!(err, FormatError::Malformed { at: 0, .. }));
        let err = decoder.decode_run(&[0x91], 10, &mut out).unwrap_err();
        assert_eq!(err, FormatError::UnknownOpcode { op: 0x91, at: 10 });
    }
}
