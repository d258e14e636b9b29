//! Command buffer shared by every band list of a page.
//!
//! Blocks live in a slot vector and lists link them by generation-checked
//! handles. Bytes for all blocks share one fixed-capacity byte arena; a block
//! only grows while its list is the one being appended to, so each block's
//! bytes stay contiguous.

use crate::types::BandRange;

/// Bookkeeping charged against the arena for every new physical block.
pub const BLOCK_OVERHEAD: usize = 16;

/// Smallest buffer that can hold any single state instruction.
pub const MIN_BUFFER_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockHandle {
    slot: u32,
    generation: u32,
}

#[derive(Debug, Clone)]
struct Block {
    id: u64,
    start: usize,
    len: usize,
    next: Option<BlockHandle>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CmdList {
    head: Option<BlockHandle>,
    tail: Option<BlockHandle>,
}

impl CmdList {
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListId {
    Range,
    Band(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferFull {
    pub needed: usize,
    pub remaining: usize,
}

#[derive(Debug)]
pub struct CommandBuffer {
    bytes: Vec<u8>,
    capacity: usize,
    charged: usize,
    blocks: Vec<Block>,
    generation: u32,
    next_id: u64,
    range_list: CmdList,
    range_bounds: Option<BandRange>,
    band_lists: Vec<CmdList>,
    current: Option<ListId>,
}

impl CommandBuffer {
    pub fn new(capacity: usize, nbands: u32) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
            capacity,
            charged: 0,
            blocks: Vec::new(),
            generation: 0,
            next_id: 0,
            range_list: CmdList::default(),
            range_bounds: None,
            band_lists: vec![CmdList::default(); nbands as usize],
            current: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.charged
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn next_block_id(&self) -> u64 {
        self.next_id
    }

    /// Largest payload that could ever fit in a fresh buffer.
    pub fn max_instruction(&self) -> usize {
        self.capacity.saturating_sub(BLOCK_OVERHEAD)
    }

    pub fn range_bounds(&self) -> Option<BandRange> {
        self.range_bounds
    }

    pub fn current(&self) -> Option<ListId> {
        self.current
    }

    /// True when appending to `range` must flush first: some other list is
    /// current, or the range list holds different bounds.
    pub fn needs_range_switch(&self, range: BandRange) -> bool {
        match self.current {
            None => false,
            Some(ListId::Range) => self.range_bounds != Some(range),
            Some(ListId::Band(_)) => true,
        }
    }

    fn list(&self, id: ListId) -> Option<&CmdList> {
        match id {
            ListId::Range => Some(&self.range_list),
            ListId::Band(band) => self.band_lists.get(band as usize),
        }
    }

    fn list_mut(&mut self, id: ListId) -> Option<&mut CmdList> {
        match id {
            ListId::Range => Some(&mut self.range_list),
            ListId::Band(band) => self.band_lists.get_mut(band as usize),
        }
    }

    fn block(&self, handle: BlockHandle) -> Option<&Block> {
        if handle.generation != self.generation {
            return None;
        }
        self.blocks.get(handle.slot as usize)
    }

    /// Appends one instruction to `id`. Either every byte lands or nothing
    /// does. Consecutive appends to the same list grow its tail block.
    pub fn append(&mut self, id: ListId, payload: &[u8]) -> Result<(), BufferFull> {
        let coalesce = self.current == Some(id)
            && self
                .list(id)
                .and_then(|list| list.tail)
                .and_then(|tail| self.block(tail))
                .is_some_and(|block| block.start + block.len == self.bytes.len());
        let needed = if coalesce {
            payload.len()
        } else {
            payload.len() + BLOCK_OVERHEAD
        };
        let remaining = self.remaining();
        if needed > remaining || self.list(id).is_none() {
            return Err(BufferFull { needed, remaining });
        }

        let start = self.bytes.len();
        self.bytes.extend_from_slice(payload);
        self.charged += needed;
        if coalesce {
            if let Some(tail) = self.list(id).and_then(|list| list.tail) {
                self.blocks[tail.slot as usize].len += payload.len();
            }
        } else {
            let handle = BlockHandle {
                slot: self.blocks.len() as u32,
                generation: self.generation,
            };
            self.blocks.push(Block {
                id: self.next_id,
                start,
                len: payload.len(),
                next: None,
            });
            self.next_id += 1;
            let previous_tail = self.list(id).and_then(|list| list.tail);
            if let Some(prev) = previous_tail {
                self.blocks[prev.slot as usize].next = Some(handle);
            }
            if let Some(list) = self.list_mut(id) {
                if list.head.is_none() {
                    list.head = Some(handle);
                }
                list.tail = Some(handle);
            }
        }
        self.current = Some(id);
        Ok(())
    }

    pub fn set_range_bounds(&mut self, range: BandRange) {
        self.range_bounds = Some(range);
    }

    pub fn list_is_empty(&self, id: ListId) -> bool {
        self.list(id).is_none_or(CmdList::is_empty)
    }

    /// Byte chunks of `id`'s blocks in list order, with their block ids.
    pub fn chunks(&self, id: ListId) -> Vec<(u64, &[u8])> {
        let mut out = Vec::new();
        let mut cursor = self.list(id).and_then(|list| list.head);
        while let Some(handle) = cursor {
            let Some(block) = self.block(handle) else {
                break;
            };
            out.push((block.id, &self.bytes[block.start..block.start + block.len]));
            cursor = block.next;
        }
        out
    }

    pub fn payload_len(&self, id: ListId) -> usize {
        self.chunks(id).iter().map(|(_, bytes)| bytes.len()).sum()
    }

    pub fn band_count(&self) -> u32 {
        self.band_lists.len() as u32
    }

    /// Empties every list and invalidates outstanding handles. Block ids keep
    /// counting so they stay unique within a page.
    pub fn clear(&mut self) {
        self.bytes.clear();
        self.blocks.clear();
        self.charged = 0;
        self.generation = self.generation.wrapping_add(1);
        self.range_list = CmdList::default();
        self.range_bounds = None;
        for list in &mut self.band_lists {
            *list = CmdList::default();
        }
        self.current = None;
    }

    /// Clears and resizes for a new page or a hard reset.
    pub fn reset(&mut self, nbands: u32) {
        self.clear();
        self.next_id = 0;
        self.band_lists.resize(nbands as usize, CmdList::default());
    }
}
