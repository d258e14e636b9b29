use crate::FormatError;

/// Band value marking a page terminator record.
pub const BAND_END: i32 = -1;

pub const BLOCK_RECORD_LEN: usize = 16;

/// One block directory record: the bands a run applies to and the data file
/// offset at which the run begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CmdBlock {
    pub band_min: i32,
    pub band_max: i32,
    pub pos: i64,
}

impl CmdBlock {
    pub fn band(band: i32, pos: i64) -> Self {
        Self {
            band_min: band,
            band_max: band,
            pos,
        }
    }

    pub fn terminator(pos: i64) -> Self {
        Self {
            band_min: BAND_END,
            band_max: BAND_END,
            pos,
        }
    }

    pub fn is_terminator(&self) -> bool {
        self.band_min == BAND_END && self.band_max == BAND_END
    }

    pub fn covers(&self, band: i32) -> bool {
        !self.is_terminator() && self.band_min <= band && band <= self.band_max
    }

    pub fn to_bytes(&self) -> [u8; BLOCK_RECORD_LEN] {
        let mut out = [0u8; BLOCK_RECORD_LEN];
        out[0..4].copy_from_slice(&self.band_min.to_le_bytes());
        out[4..8].copy_from_slice(&self.band_max.to_le_bytes());
        out[8..16].copy_from_slice(&self.pos.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FormatError> {
        let record: &[u8; BLOCK_RECORD_LEN] = bytes
            .get(..BLOCK_RECORD_LEN)
            .and_then(|slice| slice.try_into().ok())
            .ok_or(FormatError::Truncated(bytes.len()))?;
        let mut band_min = [0u8; 4];
        let mut band_max = [0u8; 4];
        let mut pos = [0u8; 8];
        band_min.copy_from_slice(&record[0..4]);
        band_max.copy_from_slice(&record[4..8]);
        pos.copy_from_slice(&record[8..16]);
        Ok(Self {
            band_min: i32::from_le_bytes(band_min),
            band_max: i32::from_le_bytes(band_max),
            pos: i64::from_le_bytes(pos),
        })
    }
}
