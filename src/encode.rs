use bandlist_format::color::{
    NO_COLOR_NIBBLE, color_bytes, delta_len, depth_mask, inline_delta, literal_parts, pack_delta,
    packed_delta,
};
use bandlist_format::{ext, op, put_w, zigzag};
use smallvec::SmallVec;

use crate::error::ClistError;
use crate::state::{StateField, StateValue};
use crate::tile_cache::TileBitmap;
use crate::types::{BandLayout, ColorIndex, LogicalOp, NO_COLOR, Rect, TilePhase};

pub type Instruction = SmallVec<[u8; 32]>;

/// Which of the four color encodings was used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorTier {
    InlineDelta,
    PackedDelta,
    Literal,
    NoColor,
}

impl ColorTier {
    pub fn index(self) -> usize {
        match self {
            ColorTier::InlineDelta => 0,
            ColorTier::PackedDelta => 1,
            ColorTier::Literal => 2,
            ColorTier::NoColor => 3,
        }
    }
}

/// Shallower colors always go out as literals.
pub const INLINE_DELTA_MIN_DEPTH: u8 = 4;

pub fn check_color(color: ColorIndex, depth: u8) -> Result<(), ClistError> {
    if color != NO_COLOR && color > depth_mask(depth) {
        return Err(ClistError::ColorOutOfRange { color, depth });
    }
    Ok(())
}

/// Appends the shortest encoding of `color` against `prev`. Emits nothing
/// and returns `None` when the value is unchanged.
pub fn put_color(
    out: &mut Instruction,
    slot: usize,
    tile: bool,
    color: ColorIndex,
    prev: ColorIndex,
    depth: u8,
) -> Result<Option<ColorTier>, ClistError> {
    check_color(color, depth)?;
    if color == prev {
        return Ok(None);
    }
    if tile {
        out.push(op::SET_TILE_COLOR);
    }
    let slot = slot.min(1) as u8;
    let set_op = op::SET_COLOR0 + slot * 0x10;
    if color == NO_COLOR {
        out.push(set_op + NO_COLOR_NIBBLE);
        return Ok(Some(ColorTier::NoColor));
    }
    if depth >= INLINE_DELTA_MIN_DEPTH {
        if let Some(delta) = inline_delta(prev, color) {
            out.push(op::INLINE_DELTA_COLOR0 + slot * 0x10 + (delta + 8) as u8);
            return Ok(Some(ColorTier::InlineDelta));
        }
    }
    let (dropped, bytes, len) = literal_parts(color, depth);
    let num_bytes = color_bytes(depth);
    if delta_len(num_bytes) < len {
        if let Some(delta) = packed_delta(prev, color, depth) {
            let (packed, packed_len) = pack_delta(delta, num_bytes);
            out.push(op::DELTA_COLOR0 + slot);
            out.extend_from_slice(&packed[..packed_len]);
            return Ok(Some(ColorTier::PackedDelta));
        }
    }
    out.push(set_op + dropped);
    out.extend_from_slice(&bytes[..len]);
    Ok(Some(ColorTier::Literal))
}

pub fn put_tile_phase(out: &mut Instruction, phase: TilePhase) {
    out.push(op::SET_TILE_PHASE);
    put_w(out, zigzag(phase.x as i64));
    put_w(out, zigzag(phase.y as i64));
}

pub fn put_lop(out: &mut Instruction, lop: LogicalOp) {
    out.push(op::SET_MISC);
    out.push((lop.0 & 0x3f) as u8);
    put_w(out, (lop.0 >> 6) as u64);
}

pub fn put_lop_enabled(out: &mut Instruction, enabled: bool) {
    out.push(if enabled { op::ENABLE_LOP } else { op::DISABLE_LOP });
}

pub fn put_clip_enabled(out: &mut Instruction, enabled: bool) {
    out.push(if enabled {
        op::ENABLE_CLIP
    } else {
        op::DISABLE_CLIP
    });
}

fn color_slot(field: StateField) -> Option<(usize, bool)> {
    match field {
        StateField::FillColor => Some((1, false)),
        StateField::StrokeColor => Some((0, false)),
        StateField::TileColor0 => Some((0, true)),
        StateField::TileColor1 => Some((1, true)),
        _ => None,
    }
}

/// Encodes a state change for `field`. `prev` is the value the reader holds,
/// or `None` when it is not known, in which case the value is always sent.
pub fn put_state(
    out: &mut Instruction,
    field: StateField,
    value: StateValue,
    prev: Option<StateValue>,
    depth: u8,
) -> Result<Option<ColorTier>, ClistError> {
    if let (Some((slot, tile)), StateValue::Color(color)) = (color_slot(field), value) {
        return match prev {
            Some(StateValue::Color(prev)) => put_color(out, slot, tile, color, prev, depth),
            _ if color == NO_COLOR => {
                if tile {
                    out.push(op::SET_TILE_COLOR);
                }
                out.push(op::SET_COLOR0 + slot as u8 * 0x10 + NO_COLOR_NIBBLE);
                Ok(Some(ColorTier::NoColor))
            }
            _ => put_color(out, slot, tile, color, NO_COLOR, depth),
        };
    }
    match (field, value) {
        (StateField::TilePhase, StateValue::Phase(phase)) => put_tile_phase(out, phase),
        (StateField::LogicalOp, StateValue::Lop(lop)) => put_lop(out, lop),
        (StateField::LopEnabled, StateValue::Flag(on)) => put_lop_enabled(out, on),
        (StateField::ClipEnabled, StateValue::Flag(on)) => put_clip_enabled(out, on),
        (field, value) => return Err(ClistError::StateTypeMismatch { field, value }),
    }
    Ok(None)
}

pub fn put_rect(out: &mut Instruction, opcode: u8, rect: Rect) {
    out.push(opcode);
    put_w(out, zigzag(rect.x as i64));
    put_w(out, zigzag(rect.y as i64));
    put_w(out, rect.width as u64);
    put_w(out, rect.height as u64);
}

pub fn put_tile_bits(out: &mut Vec<u8>, index: u16, tile: &TileBitmap) {
    out.push(op::SET_TILE_BITS);
    put_w(out, index as u64);
    put_w(out, tile.width as u64);
    put_w(out, tile.height as u64);
    out.push(tile.depth);
    put_w(out, tile.raster as u64);
    out.extend_from_slice(&tile.data);
}

pub fn tile_bits_len(tile: &TileBitmap) -> usize {
    1 + bandlist_format::size_w(bandlist_format::MAX_TILE_INDEX as u64)
        + bandlist_format::size_w(tile.width as u64)
        + bandlist_format::size_w(tile.height as u64)
        + 1
        + bandlist_format::size_w(tile.raster as u64)
        + tile.data.len()
}

/// Selects tile `index`, as a delta from `prev` when it fits the low nibble.
pub fn put_tile_index(out: &mut Instruction, index: u16, prev: Option<u16>) {
    if let Some(prev) = prev {
        let delta = index as i32 - prev as i32;
        if (-8..=7).contains(&delta) && delta != 0 {
            out.push(op::DELTA_TILE_INDEX + (delta + 8) as u8);
            return;
        }
    }
    out.push(op::SET_TILE_INDEX + ((index >> 8) & 0x0f) as u8);
    out.push(index as u8);
}

pub fn put_extended<E: Extend<u8>>(out: &mut E, ext_op: u8, payload: &[u8]) {
    out.extend([op::EXTEND, ext_op]);
    put_w(out, payload.len() as u64);
    out.extend(payload.iter().copied());
}

pub fn extended_len(payload_len: usize) -> usize {
    2 + bandlist_format::size_w(payload_len as u64) + payload_len
}

pub fn put_page_params(out: &mut Instruction, layout: &BandLayout, depth: u8) {
    let mut payload: SmallVec<[u8; 16]> = SmallVec::new();
    put_w(&mut payload, layout.geometry.width as u64);
    put_w(&mut payload, layout.geometry.height as u64);
    put_w(&mut payload, layout.band_height as u64);
    put_w(&mut payload, depth as u64);
    put_extended(out, ext::PAGE_PARAMS, &payload);
}

#[cfg(test)]
mod tests {
    use super::*;
    use bandlist_format::{BandDecoder, Command};

    fn decode(depth: u8, prev: Option<(usize, bool, u64)>, bytes: &[u8]) -> u64 {
        let mut decoder = BandDecoder::with_depth(depth);
        let mut out = Vec::new();
        if let Some((slot, tile, color)) = prev {
            let mut seed = Instruction::new();
            put_color(&mut seed, slot, tile, color, NO_COLOR, depth).unwrap();
            seed.push(op::END_RUN);
            decoder.decode_run(&seed, 0, &mut out).unwrap();
        }
        let mut run = bytes.to_vec();
        run.push(op::END_RUN);
        out.clear();
        decoder.decode_run(&run, 0, &mut out).unwrap();
        match out.first() {
            Some(Command::SetColor { color, .. }) => *color,
            other => panic!("expected a color, got {other:?}"),
        }
    }

    #[test]
    fn one_unit_change_is_a_single_inline_byte() {
        let mut out = Instruction::new();
        let tier = put_color(&mut out, 1, false, 0x112234, 0x112233, 24).unwrap();
        assert_eq!(tier, Some(ColorTier::InlineDelta));
        assert_eq!(out.as_slice(), &[0x59]);
    }

    #[test]
    fn shallow_depths_skip_inline_delta() {
        let mut out = Instruction::new();
        let tier = put_color(&mut out, 0, false, 2, 1, 2).unwrap();
        assert_eq!(tier, Some(ColorTier::Literal));
        assert_eq!(out.as_slice(), &[op::SET_COLOR0, 0x02]);

        out.clear();
        let tier = put_color(&mut out, 0, false, 9, 8, 4).unwrap();
        assert_eq!(tier, Some(ColorTier::InlineDelta));
        assert_eq!(out.as_slice(), &[op::INLINE_DELTA_COLOR0 + 9]);
    }

    #[test]
    fn unchanged_color_emits_nothing() {
        let mut out = Instruction::new();
        assert_eq!(put_color(&mut out, 0, true, 5, 5, 8).unwrap(), None);
        assert!(out.is_empty());
    }

    #[test]
    fn tiers_are_tried_in_order() {
        let mut out = Instruction::new();
        let tier = put_color(&mut out, 0, false, 0x1f2a30, 0x112233, 24).unwrap();
        assert_eq!(tier, Some(ColorTier::PackedDelta));
        assert_eq!(out.len(), 3);
        assert_eq!(out[0], op::DELTA_COLOR0);

        out.clear();
        let tier = put_color(&mut out, 1, false, 0xa00000, 0x112233, 24).unwrap();
        assert_eq!(tier, Some(ColorTier::Literal));
        assert_eq!(out.as_slice(), &[op::SET_COLOR1 + 2, 0xa0]);

        out.clear();
        let tier = put_color(&mut out, 1, true, NO_COLOR, 0x112233, 24).unwrap();
        assert_eq!(tier, Some(ColorTier::NoColor));
        assert_eq!(out.as_slice(), &[op::SET_TILE_COLOR, op::SET_COLOR1 + 15]);
    }

    #[test]
    fn packed_delta_is_skipped_when_not_shorter() {
        // The literal drops the zero low byte, so it is as short as the delta.
        let mut out = Instruction::new();
        let tier = put_color(&mut out, 0, false, 0x0300, 0x0100, 16).unwrap();
        assert_eq!(tier, Some(ColorTier::Literal));
        assert_eq!(out.as_slice(), &[op::SET_COLOR0 + 1, 0x03]);
    }

    #[test]
    fn every_tier_decodes_back_across_depths() {
        let cases: &[(u8, u64, u64)] = &[
            (1, 0, 1),
            (4, 3, 10),
            (8, 0x10, 0xf0),
            (8, 0x40, 0x3c),
            (16, 0x1234, 0x1537),
            (16, 0x1234, 0xff00),
            (24, 0x112233, 0x112234),
            (24, 0x112233, 0x1f2a30),
            (24, 0x800000, 0x7ee20f),
            (24, 0x000001, 0xffffff),
            (32, 0x1122_3344, 0x1821_3a40),
            (32, 0, 0x8000_0000),
            (40, 0x11_2233_4455, 0x1f_1a36_4b52),
            (48, 0x1122_3344_5566, 0x1823_3a40_5c61),
            (56, 0x11_2233_4455_6677, 0x1a_413b_3c57_5e7d),
            (64, 0x1122_3344_5566_7788, 0x1629_2b3e_5c68_7481),
            (64, 0x1122_3344_5566_7788, 0x1122_3344_5566_7780),
            (64, 0, u64::MAX - 1),
        ];
        for &(depth, prev, color) in cases {
            for (slot, tile) in [(0, false), (1, false), (0, true), (1, true)] {
                let mut out = Instruction::new();
                put_color(&mut out, slot, tile, color, prev, depth).unwrap();
                assert_eq!(
                    decode(depth, Some((slot, tile, prev)), &out),
                    color,
                    "depth {depth} {prev:#x} -> {color:#x} slot {slot} tile {tile}"
                );
            }
        }
    }

    #[test]
    fn colors_beyond_depth_are_rejected() {
        let mut out = Instruction::new();
        let err = put_color(&mut out, 0, false, 0x100, NO_COLOR, 8).unwrap_err();
        assert!(matches!(err, ClistError::ColorOutOfRange { color: 0x100, depth: 8 }));
        assert!(out.is_empty());
    }

    #[test]
    fn unknown_baseline_always_sends_the_value() {
        let mut out = Instruction::new();
        let tier = put_state(
            &mut out,
            StateField::TileColor1,
            StateValue::Color(NO_COLOR),
            None,
            24,
        )
        .unwrap();
        assert_eq!(tier, Some(ColorTier::NoColor));
        assert_eq!(out.as_slice(), &[op::SET_TILE_COLOR, op::SET_COLOR1 + 15]);

        out.clear();
        let tier = put_state(&mut out, StateField::FillColor, StateValue::Color(7), None, 8).unwrap();
        assert_eq!(tier, Some(ColorTier::Literal));
        assert_eq!(out.as_slice(), &[op::SET_COLOR1, 7]);

        out.clear();
        let err = put_state(&mut out, StateField::ClipEnabled, StateValue::Color(1), None, 8);
        assert!(matches!(err, Err(ClistError::StateTypeMismatch { .. })));
    }

    #[test]
    fn tile_index_prefers_nibble_delta() {
        let mut out = Instruction::new();
        put_tile_index(&mut out, 0x123, None);
        assert_eq!(out.as_slice(), &[0xc1, 0x23]);
        out.clear();
        put_tile_index(&mut out, 0x125, Some(0x123));
        assert_eq!(out.as_slice(), &[op::DELTA_TILE_INDEX + 10]);
        out.clear();
        put_tile_index(&mut out, 0x200, Some(0x123));
        assert_eq!(out.as_slice(), &[0xc2, 0x00]);
    }

    #[test]
    fn lop_splits_low_six_bits() {
        let mut out = Instruction::new();
        put_lop(&mut out, LogicalOp(0x1fa));
        assert_eq!(out.as_slice(), &[op::SET_MISC, 0x3a, 0x07]);
    }
}
