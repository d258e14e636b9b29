use crate::FormatError;

pub const MAX_VARINT_LEN: usize = 10;

/// Number of bytes `put_w` emits for `value`.
pub fn size_w(mut value: u64) -> usize {
    let mut size = 1;
    while value > 0x7f {
        value >>= 7;
        size += 1;
    }
    size
}

/// Appends `value` 7 bits at a time, low group first. Every byte except the
/// last carries the 0x80 continuation bit.
pub fn put_w<E: Extend<u8>>(out: &mut E, mut value: u64) {
    let mut buf = [0u8; MAX_VARINT_LEN];
    let mut len = 0;
    while value > 0x7f {
        buf[len] = (value as u8 & 0x7f) | 0x80;
        value >>= 7;
        len += 1;
    }
    buf[len] = value as u8;
    len += 1;
    out.extend(buf[..len].iter().copied());
}

/// Reads one varint from the front of `input`, returning the value and the
/// number of bytes consumed. `at` is only used for error offsets.
pub fn get_w(input: &[u8], at: usize) -> Result<(u64, usize), FormatError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for (idx, &byte) in input.iter().enumerate() {
        let bits = (byte & 0x7f) as u64;
        if shift >= 64 || (shift == 63 && bits > 1) {
            return Err(FormatError::BadVarint(at));
        }
        value |= bits << shift;
        if byte & 0x80 == 0 {
            return Ok((value, idx + 1));
        }
        shift += 7;
    }
    Err(FormatError::Truncated(at + input.len()))
}

pub fn zigzag(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

pub fn unzigzag(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}
