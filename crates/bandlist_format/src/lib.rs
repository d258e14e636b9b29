use sha2::{Digest, Sha256};
use std::sync::OnceLock;
use thiserror::Error;

pub mod block;
pub mod color;
pub mod reader;
pub mod varint;

pub use block::{BAND_END, BLOCK_RECORD_LEN, CmdBlock};
pub use color::NO_COLOR;
pub use reader::{BandDecoder, BandReplay, Command, PageDirectory, ReplayState, RunEntry, SpoolReader};
pub use varint::{get_w, put_w, size_w, unzigzag, zigzag};

pub const FORMAT_ID: &str = "bandlist.spool";
pub const FORMAT_VERSION: &str = "1";

/// Opcode bytes. The high nibble selects the family; families flagged in
/// [`OP_DEFS`] carry an operand in the low nibble.
pub mod op {
    pub const END_RUN: u8 = 0x00;
    pub const SET_TILE_PHASE: u8 = 0x02;
    pub const SET_TILE_BITS: u8 = 0x03;
    pub const SET_TILE_COLOR: u8 = 0x05;
    pub const SET_MISC: u8 = 0x06;
    pub const ENABLE_LOP: u8 = 0x07;
    pub const DISABLE_LOP: u8 = 0x08;
    pub const END_PAGE: u8 = 0x0b;
    pub const DELTA_COLOR0: u8 = 0x0c;
    pub const DELTA_COLOR1: u8 = 0x0d;
    pub const SET_COLOR0: u8 = 0x10;
    pub const SET_COLOR1: u8 = 0x20;
    pub const FILL_RECT: u8 = 0x30;
    pub const INLINE_DELTA_COLOR0: u8 = 0x40;
    pub const INLINE_DELTA_COLOR1: u8 = 0x50;
    pub const TILE_RECT: u8 = 0x60;
    pub const DELTA_TILE_INDEX: u8 = 0xb0;
    pub const SET_TILE_INDEX: u8 = 0xc0;
    pub const ENABLE_CLIP: u8 = 0xd7;
    pub const DISABLE_CLIP: u8 = 0xd8;
    pub const EXTEND: u8 = 0xdf;
}

/// Sub-opcodes following [`op::EXTEND`].
pub mod ext {
    pub const PAGE_PARAMS: u8 = 0x01;
    /// First sub-opcode available to callers; lower values are reserved.
    pub const FIRST_USER: u8 = 0x10;
}

/// Largest tile index; `set_tile_index` carries 12 bits.
pub const MAX_TILE_INDEX: u16 = 0x0fff;

/// Default logical operation (source copy); a band with this value has its
/// logical operation disabled.
pub const DEFAULT_LOP: u32 = 0xf0;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("stream truncated at offset {0}")]
    Truncated(usize),
    #[error("block directory ends without a page terminator")]
    MissingTerminator,
    #[error("block record {index} has invalid band range {band_min}..={band_max}")]
    BadRecord {
        index: usize,
        band_min: i32,
        band_max: i32,
    },
    #[error("run offset {pos} is outside the data file ({len} bytes)")]
    BadOffset { pos: i64, len: usize },
    #[error("run starting at {pos} does not end with a run marker")]
    MissingRunEnd { pos: i64 },
    #[error("unknown opcode {op:#04x} at offset {at}")]
    UnknownOpcode { op: u8, at: usize },
    #[error("malformed varint at offset {0}")]
    BadVarint(usize),
    #[error("malformed stream at offset {at}: {reason}")]
    Malformed { at: usize, reason: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpDef {
    pub code: u8,
    pub name: &'static str,
    pub nibble_operand: bool,
    pub operands: &'static str,
}

pub const OP_DEFS: [OpDef; 21] = [
    OpDef { code: op::END_RUN, name: "end_run", nibble_operand: false, operands: "" },
    OpDef { code: op::SET_TILE_PHASE, name: "set_tile_phase", nibble_operand: false, operands: "x:z# y:z#" },
    OpDef { code: op::SET_TILE_BITS, name: "set_tile_bits", nibble_operand: false, operands: "index# width# height# depth:1 raster# bits" },
    OpDef { code: op::SET_TILE_COLOR, name: "set_tile_color", nibble_operand: false, operands: "" },
    OpDef { code: op::SET_MISC, name: "set_misc", nibble_operand: false, operands: "lop_lsb:1 lop_msb#" },
    OpDef { code: op::ENABLE_LOP, name: "enable_lop", nibble_operand: false, operands: "" },
    OpDef { code: op::DISABLE_LOP, name: "disable_lop", nibble_operand: false, operands: "" },
    OpDef { code: op::END_PAGE, name: "end_page", nibble_operand: false, operands: "" },
    OpDef { code: op::DELTA_COLOR0, name: "delta_color0", nibble_operand: false, operands: "packed:(n+1)/2" },
    OpDef { code: op::DELTA_COLOR1, name: "delta_color1", nibble_operand: false, operands: "packed:(n+1)/2" },
    OpDef { code: op::SET_COLOR0, name: "set_color0", nibble_operand: true, operands: "bytes:n-dropped" },
    OpDef { code: op::SET_COLOR1, name: "set_color1", nibble_operand: true, operands: "bytes:n-dropped" },
    OpDef { code: op::FILL_RECT, name: "fill_rect", nibble_operand: false, operands: "x:z# y:z# w# h#" },
    OpDef { code: op::INLINE_DELTA_COLOR0, name: "inline_delta_color0", nibble_operand: true, operands: "" },
    OpDef { code: op::INLINE_DELTA_COLOR1, name: "inline_delta_color1", nibble_operand: true, operands: "" },
    OpDef { code: op::TILE_RECT, name: "tile_rect", nibble_operand: false, operands: "x:z# y:z# w# h#" },
    OpDef { code: op::DELTA_TILE_INDEX, name: "delta_tile_index", nibble_operand: true, operands: "" },
    OpDef { code: op::SET_TILE_INDEX, name: "set_tile_index", nibble_operand: true, operands: "index_lo:1" },
    OpDef { code: op::ENABLE_CLIP, name: "enable_clip", nibble_operand: false, operands: "" },
    OpDef { code: op::DISABLE_CLIP, name: "disable_clip", nibble_operand: false, operands: "" },
    OpDef { code: op::EXTEND, name: "extend", nibble_operand: false, operands: "ext_op:1 len# payload" },
];

pub fn op_def(byte: u8) -> Option<&'static OpDef> {
    OP_DEFS.iter().find(|def| def.code == byte).or_else(|| {
        OP_DEFS
            .iter()
            .find(|def| def.nibble_operand && def.code == byte & 0xf0)
    })
}

pub fn op_name(byte: u8) -> &'static str {
    op_def(byte).map(|def| def.name).unwrap_or("unknown")
}

fn hex_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        use std::fmt::Write;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

static FORMAT_FINGERPRINT: OnceLock<String> = OnceLock::new();

pub fn op_table_json() -> serde_json::Value {
    serde_json::Value::Array(
        OP_DEFS
            .iter()
            .map(|def| {
                serde_json::json!({
                    "code": def.code,
                    "name": def.name,
                    "nibble_operand": def.nibble_operand,
                    "operands": def.operands,
                })
            })
            .collect(),
    )
}

/// Stable hash of the opcode table and record layout. Writers log it so a
/// reader can refuse spools written against a different table.
pub fn format_fingerprint_sha256() -> String {
    FORMAT_FINGERPRINT
        .get_or_init(|| {
            let payload = serde_json::json!({
                "id": FORMAT_ID,
                "version": FORMAT_VERSION,
                "block_record_len": BLOCK_RECORD_LEN,
                "band_end": BAND_END,
                "ops": op_table_json(),
                "extended": { "page_params": ext::PAGE_PARAMS, "first_user": ext::FIRST_USER },
            });
            hex_sha256(payload.to_string().as_bytes())
        })
        .clone()
}
