//! Color operand encodings.
//!
//! A packed delta stores every byte of `color - prev` as a signed 4-bit
//! quantity. Colors with an odd byte count spend the spare nibble on the top
//! three bytes instead, which get 5, 6 and 5 bits. The offsets bias each field
//! so the packed value is unsigned.

pub const NO_COLOR: u64 = u64::MAX;

/// Low nibble of `set_colorN` that stands for [`NO_COLOR`].
pub const NO_COLOR_NIBBLE: u8 = 15;

/// Largest magnitude carried in the low nibble of an inline delta op.
pub const INLINE_DELTA_LIMIT: i64 = 7;

pub const DELTA_OFFSETS: [u64; 9] = [
    0,
    0,
    0x0808,
    0x10_2010,
    0x0808_0808,
    0x10_2010_0808,
    0x0808_0808_0808,
    0x10_2010_0808_0808,
    0x0808_0808_0808_0808,
];

pub const DELTA_MASKS: [u64; 9] = [
    0,
    0,
    0x0f0f,
    0x1f_3f1f,
    0x0f0f_0f0f,
    0x1f_3f1f_0f0f,
    0x0f0f_0f0f_0f0f,
    0x1f_3f1f_0f0f_0f0f,
    0x0f0f_0f0f_0f0f_0f0f,
];

pub fn color_bytes(depth: u8) -> usize {
    (depth as usize).div_ceil(8).min(8)
}

pub fn depth_mask(depth: u8) -> u64 {
    if depth >= 64 {
        u64::MAX
    } else {
        (1u64 << depth) - 1
    }
}

pub fn delta_len(num_bytes: usize) -> usize {
    num_bytes.div_ceil(2)
}

/// Signed inline delta, when both values are real colors within the limit.
pub fn inline_delta(prev: u64, color: u64) -> Option<i8> {
    if prev == NO_COLOR || color == NO_COLOR || prev == color {
        return None;
    }
    let diff = color.wrapping_sub(prev) as i64;
    (-INLINE_DELTA_LIMIT..=INLINE_DELTA_LIMIT)
        .contains(&diff)
        .then_some(diff as i8)
}

/// Biased packed delta taking `prev` to `color`, if every field fits.
pub fn packed_delta(prev: u64, color: u64, depth: u8) -> Option<u64> {
    if prev == NO_COLOR || color == NO_COLOR {
        return None;
    }
    let num_bytes = color_bytes(depth);
    if num_bytes < 2 {
        return None;
    }
    let offset = DELTA_OFFSETS[num_bytes];
    let mask = DELTA_MASKS[num_bytes];
    let delta = color.wrapping_sub(prev).wrapping_add(offset) & mask;
    (prev.wrapping_add(delta).wrapping_sub(offset) == color).then_some(delta)
}

pub fn apply_packed_delta(prev: u64, delta: u64, depth: u8) -> u64 {
    let offset = DELTA_OFFSETS[color_bytes(depth)];
    prev.wrapping_add(delta).wrapping_sub(offset)
}

/// Lays a packed delta out in wire order. Returns the buffer and its used
/// length, `(num_bytes + 1) / 2`.
pub fn pack_delta(delta: u64, num_bytes: usize) -> ([u8; 4], usize) {
    let len = delta_len(num_bytes);
    let mut out = [0u8; 4];
    let mut idx = len;
    let mut rest = delta;
    if num_bytes >= 3 && num_bytes % 2 == 1 {
        let data = delta >> ((num_bytes - 3) * 8);
        out[idx - 1] = (((data >> 13) & 0xf8) + ((data >> 11) & 0x07)) as u8;
        out[idx - 2] = (((data >> 3) & 0xe0) + (data & 0x1f)) as u8;
        idx -= 2;
    }
    while idx > 0 {
        out[idx - 1] = ((rest >> 4) + rest) as u8;
        rest >>= 16;
        idx -= 1;
    }
    (out, len)
}

pub fn unpack_delta(bytes: &[u8], num_bytes: usize) -> u64 {
    let pair = |b: u8| ((((b & 0xf0) as u64) << 4) + (b & 0x0f) as u64);
    let mut delta = 0u64;
    if num_bytes % 2 == 0 {
        for &b in bytes {
            delta = (delta << 16) | pair(b);
        }
        return delta;
    }
    let plain = bytes.len().saturating_sub(2);
    for &b in &bytes[..plain] {
        delta = (delta << 16) | pair(b);
    }
    if bytes.len() >= 2 {
        let shift = (num_bytes - 3) * 8;
        let low = bytes[plain];
        let high = bytes[plain + 1];
        delta |= ((((low & 0xe0) as u64) << 3) + (low & 0x1f) as u64) << shift;
        delta |= ((((high & 0xf8) as u64) << 2) + (high & 0x07) as u64) << (shift + 11);
    }
    delta
}

/// Literal form: the count of dropped low zero bytes and the remaining bytes,
/// most significant first.
pub fn literal_parts(color: u64, depth: u8) -> (u8, [u8; 8], usize) {
    let num_bytes = color_bytes(depth);
    let mut dropped = 0usize;
    let mut data = color;
    if color == 0 {
        dropped = num_bytes;
    } else {
        while data & 0xff == 0 {
            dropped += 1;
            data >>= 8;
        }
    }
    let len = num_bytes - dropped;
    let mut out = [0u8; 8];
    for slot in out[..len].iter_mut().rev() {
        *slot = data as u8;
        data >>= 8;
    }
    (dropped as u8, out, len)
}

pub fn literal_value(bytes: &[u8], dropped: u8) -> u64 {
    let value = bytes.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64);
    value.checked_shl(dropped as u32 * 8).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_delta_reproduces_the_target_color() {
        let cases: &[(u8, u64, u64)] = &[
            (16, 0x1234, 0x1537),
            (24, 0x112233, 0x1f2a30),
            (24, 0x800000, 0x7ee20f),
            (32, 0x1122_3344, 0x1821_3a40),
            (40, 0x11_2233_4455, 0x1f_1a36_4b52),
            (48, 0x1122_3344_5566, 0x1823_3a40_5c61),
            (56, 0x11_2233_4455_6677, 0x1a_413b_3c57_5e7d),
            (64, 0x1122_3344_5566_7788, 0x1629_2b3e_5c68_7481),
        ];
        for &(depth, prev, color) in cases {
            let num_bytes = color_bytes(depth);
            let delta = packed_delta(prev, color, depth)
                .unwrap_or_else(|| panic!("depth {depth}: {prev:#x} -> {color:#x} should pack"));
            let (bytes, len) = pack_delta(delta, num_bytes);
            assert_eq!(len, num_bytes.div_ceil(2));
            let unpacked = unpack_delta(&bytes[..len], num_bytes);
            assert_eq!(unpacked, delta, "depth {depth}");
            assert_eq!(apply_packed_delta(prev, unpacked, depth), color, "depth {depth}");
        }
    }

    #[test]
    fn packed_delta_rejects_wide_component_changes() {
        assert_eq!(packed_delta(0x0000, 0x0080, 16), None);
        assert_eq!(packed_delta(0x000000, 0x400000, 24), None);
        assert_eq!(packed_delta(NO_COLOR, 0x10, 16), None);
        assert_eq!(packed_delta(0x10, 0x11, 8), None);
    }

    #[test]
    fn inline_delta_range_is_symmetric() {
        assert_eq!(inline_delta(0x112233, 0x112234), Some(1));
        assert_eq!(inline_delta(0x112233, 0x11222c), Some(-7));
        assert_eq!(inline_delta(0x112233, 0x11223b), None);
        assert_eq!(inline_delta(5, 5), None);
        assert_eq!(inline_delta(NO_COLOR, 1), None);
        assert_eq!(inline_delta(0, NO_COLOR), None);
    }

    #[test]
    fn literal_drops_low_zero_bytes() {
        let (dropped, bytes, len) = literal_parts(0x12_0000, 24);
        assert_eq!((dropped, &bytes[..len]), (2, &[0x12u8][..]));
        assert_eq!(literal_value(&bytes[..len], dropped), 0x12_0000);

        let (dropped, _, len) = literal_parts(0, 32);
        assert_eq!((dropped, len), (4, 0));
        assert_eq!(literal_value(&[], 8), 0);

        let (dropped, bytes, len) = literal_parts(0xab_cdef, 24);
        assert_eq!((dropped, &bytes[..len]), (0, &[0xab, 0xcd, 0xef][..]));
    }

    #[test]
    fn depth_helpers() {
        assert_eq!(color_bytes(1), 1);
        assert_eq!(color_bytes(24), 3);
        assert_eq!(color_bytes(64), 8);
        assert_eq!(depth_mask(8), 0xff);
        assert_eq!(depth_mask(64), u64::MAX);
    }
}
