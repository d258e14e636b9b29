use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::ClistError;

/// Outcome of growing a spool file. `LowMemory` means the growth only fit by
/// consuming the file's reserve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum WriteStatus {
    #[default]
    Ok,
    LowMemory,
}

impl WriteStatus {
    pub fn merge(self, other: WriteStatus) -> WriteStatus {
        self.max(other)
    }
}

/// Append-only backing store for one of the two spool files.
pub trait SpoolFile: Send {
    /// Secures room for `additional` more bytes without writing anything.
    fn grow(&mut self, additional: u64) -> Result<WriteStatus, ClistError>;

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), ClistError>;

    fn position(&self) -> u64;

    /// Holds back `bytes` of storage that later growth may fall into.
    fn set_reservation(&mut self, bytes: u64) -> Result<(), ClistError>;

    /// Gives back the reserve and any secured but unused room.
    fn release_reservation(&mut self);

    fn contents(&mut self) -> Result<Vec<u8>, ClistError>;

    fn path(&self) -> Option<&Path> {
        None
    }

    fn discard(self: Box<Self>) -> Result<(), ClistError>;
}

#[derive(Debug)]
struct BudgetState {
    limit: u64,
    used: u64,
}

/// Byte budget shared by memory spools, standing in for the memory a
/// process is allowed to spend on band lists.
#[derive(Clone, Debug)]
pub struct MemoryBudget {
    inner: Arc<Mutex<BudgetState>>,
}

impl MemoryBudget {
    pub fn new(limit: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BudgetState { limit, used: 0 })),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(u64::MAX)
    }

    /// The counters stay consistent across a panic, so a poisoned lock is
    /// taken over.
    fn state(&self) -> MutexGuard<'_, BudgetState> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            log::warn!("memory budget lock was poisoned, reusing its counters");
            poisoned.into_inner()
        })
    }

    pub fn limit(&self) -> u64 {
        self.state().limit
    }

    pub fn used(&self) -> u64 {
        self.state().used
    }

    pub fn available(&self) -> u64 {
        let state = self.state();
        state.limit.saturating_sub(state.used)
    }

    /// Takes all of `bytes` or nothing.
    pub fn try_allocate(&self, bytes: u64) -> bool {
        let mut state = self.state();
        if state.limit.saturating_sub(state.used) < bytes {
            return false;
        }
        state.used += bytes;
        true
    }

    /// Takes as much of `bytes` as is free and returns the amount granted.
    pub fn allocate_up_to(&self, bytes: u64) -> u64 {
        let mut state = self.state();
        let granted = bytes.min(state.limit.saturating_sub(state.used));
        state.used += granted;
        granted
    }

    pub fn release(&self, bytes: u64) {
        let mut state = self.state();
        state.used = state.used.saturating_sub(bytes);
    }
}

pub struct MemorySpool {
    budget: MemoryBudget,
    buf: Vec<u8>,
    charged: u64,
    reserve: u64,
}

impl MemorySpool {
    pub fn new(budget: MemoryBudget) -> Self {
        Self {
            budget,
            buf: Vec::new(),
            charged: 0,
            reserve: 0,
        }
    }

    pub fn reserve(&self) -> u64 {
        self.reserve
    }
}

impl SpoolFile for MemorySpool {
    fn grow(&mut self, additional: u64) -> Result<WriteStatus, ClistError> {
        let need = (self.buf.len() as u64 + additional).saturating_sub(self.charged);
        if need == 0 {
            return Ok(WriteStatus::Ok);
        }
        let granted = self.budget.allocate_up_to(need);
        if granted == need {
            self.charged += need;
            return Ok(WriteStatus::Ok);
        }
        let short = need - granted;
        if short <= self.reserve {
            self.reserve -= short;
            self.charged += need;
            return Ok(WriteStatus::LowMemory);
        }
        self.budget.release(granted);
        Err(ClistError::VmError {
            context: "growing a memory spool",
            retryable: true,
        })
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), ClistError> {
        if self.buf.len() as u64 + bytes.len() as u64 > self.charged {
            self.grow(bytes.len() as u64)?;
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    fn position(&self) -> u64 {
        self.buf.len() as u64
    }

    fn set_reservation(&mut self, bytes: u64) -> Result<(), ClistError> {
        if bytes > self.reserve {
            let need = bytes - self.reserve;
            if !self.budget.try_allocate(need) {
                return Err(ClistError::VmError {
                    context: "reserving spool memory",
                    retryable: true,
                });
            }
        } else {
            self.budget.release(self.reserve - bytes);
        }
        self.reserve = bytes;
        Ok(())
    }

    fn release_reservation(&mut self) {
        let slack = self.charged - self.buf.len() as u64;
        self.budget.release(self.reserve + slack);
        self.reserve = 0;
        self.charged = self.buf.len() as u64;
    }

    fn contents(&mut self) -> Result<Vec<u8>, ClistError> {
        Ok(self.buf.clone())
    }

    fn discard(self: Box<Self>) -> Result<(), ClistError> {
        Ok(())
    }
}

impl Drop for MemorySpool {
    fn drop(&mut self) {
        self.budget.release(self.charged + self.reserve);
    }
}

#[derive(Debug, Default)]
struct SpoolCounters {
    files: AtomicU64,
    bytes: AtomicU64,
}

pub struct FileSpool {
    path: PathBuf,
    writer: BufWriter<File>,
    position: u64,
    counters: Arc<SpoolCounters>,
}

impl SpoolFile for FileSpool {
    fn grow(&mut self, _additional: u64) -> Result<WriteStatus, ClistError> {
        Ok(WriteStatus::Ok)
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), ClistError> {
        self.writer.write_all(bytes)?;
        self.position += bytes.len() as u64;
        self.counters
            .bytes
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn set_reservation(&mut self, _bytes: u64) -> Result<(), ClistError> {
        Ok(())
    }

    fn release_reservation(&mut self) {}

    fn contents(&mut self) -> Result<Vec<u8>, ClistError> {
        self.writer.flush()?;
        Ok(fs::read(&self.path)?)
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }

    fn discard(self: Box<Self>) -> Result<(), ClistError> {
        let FileSpool { path, writer, .. } = *self;
        drop(writer);
        fs::remove_file(&path)?;
        Ok(())
    }
}

/// Directory of file-backed spool pairs, named by a per-store counter.
#[derive(Debug)]
pub struct SpoolStore {
    dir: PathBuf,
    counter: AtomicU64,
    counters: Arc<SpoolCounters>,
}

impl SpoolStore {
    pub fn new(dir: impl AsRef<Path>) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            counter: AtomicU64::new(0),
            counters: Arc::new(SpoolCounters::default()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn open_pair(&self) -> io::Result<SpoolPair> {
        let id = self.counter.fetch_add(1, Ordering::Relaxed);
        let data = self.create(format!("bandlist_{id}.cfile"))?;
        let blocks = self.create(format!("bandlist_{id}.bfile"))?;
        Ok(SpoolPair::new(Box::new(data), Box::new(blocks)))
    }

    fn create(&self, name: String) -> io::Result<FileSpool> {
        let path = self.dir.join(name);
        let file = File::create(&path)?;
        self.counters.files.fetch_add(1, Ordering::Relaxed);
        Ok(FileSpool {
            path,
            writer: BufWriter::new(file),
            position: 0,
            counters: Arc::clone(&self.counters),
        })
    }

    /// Files created and bytes written through this store.
    pub fn metrics(&self) -> (u64, u64) {
        (
            self.counters.files.load(Ordering::Relaxed),
            self.counters.bytes.load(Ordering::Relaxed),
        )
    }
}

/// The data file and block file of one page.
pub struct SpoolPair {
    pub(crate) data: Box<dyn SpoolFile>,
    pub(crate) blocks: Box<dyn SpoolFile>,
}

impl SpoolPair {
    pub fn new(data: Box<dyn SpoolFile>, blocks: Box<dyn SpoolFile>) -> Self {
        Self { data, blocks }
    }

    pub fn in_memory(budget: &MemoryBudget) -> Self {
        Self::new(
            Box::new(MemorySpool::new(budget.clone())),
            Box::new(MemorySpool::new(budget.clone())),
        )
    }

    pub fn data_len(&self) -> u64 {
        self.data.position()
    }

    pub fn block_len(&self) -> u64 {
        self.blocks.position()
    }

    pub fn data_path(&self) -> Option<&Path> {
        self.data.path()
    }

    pub fn block_path(&self) -> Option<&Path> {
        self.blocks.path()
    }

    /// Reads both files back, data first.
    pub fn read_back(&mut self) -> Result<(Vec<u8>, Vec<u8>), ClistError> {
        Ok((self.data.contents()?, self.blocks.contents()?))
    }

    pub(crate) fn set_reservations(&mut self, data: u64, blocks: u64) -> Result<(), ClistError> {
        self.data.set_reservation(data)?;
        self.blocks.set_reservation(blocks)
    }

    pub(crate) fn release_reservations(&mut self) {
        self.data.release_reservation();
        self.blocks.release_reservation();
    }

    /// Deletes the backing storage of both files.
    pub fn discard(self) -> Result<(), ClistError> {
        let data = self.data.discard();
        let blocks = self.blocks.discard();
        data.and(blocks)
    }
}

impl fmt::Debug for SpoolPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpoolPair")
            .field("data_len", &self.data_len())
            .field("block_len", &self.block_len())
            .field("data_path", &self.data_path())
            .finish()
    }
}

/// Where a writer opens the spool pair of each page.
#[derive(Clone, Debug)]
pub enum SpoolBackend {
    Memory(MemoryBudget),
    Directory(Arc<SpoolStore>),
}

impl Default for SpoolBackend {
    fn default() -> Self {
        SpoolBackend::Memory(MemoryBudget::unlimited())
    }
}

impl SpoolBackend {
    pub fn directory(dir: impl AsRef<Path>) -> io::Result<Self> {
        Ok(SpoolBackend::Directory(Arc::new(SpoolStore::new(dir)?)))
    }

    pub fn open_pair(&self) -> Result<SpoolPair, ClistError> {
        match self {
            SpoolBackend::Memory(budget) => Ok(SpoolPair::in_memory(budget)),
            SpoolBackend::Directory(store) => Ok(store.open_pair()?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "bandlist_spool_{name}_{}_{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or(0)
        ))
    }

    #[test]
    fn memory_spool_warns_when_growth_uses_the_reserve() {
        let budget = MemoryBudget::new(100);
        let mut spool = MemorySpool::new(budget.clone());
        spool.set_reservation(40).unwrap();
        assert_eq!(budget.used(), 40);

        assert_eq!(spool.grow(50).unwrap(), WriteStatus::Ok);
        spool.write_all(&[1; 50]).unwrap();
        assert_eq!(budget.available(), 10);

        assert_eq!(spool.grow(30).unwrap(), WriteStatus::LowMemory);
        assert_eq!(spool.reserve(), 20);
        assert_eq!(budget.used(), 100);
        spool.write_all(&[2; 30]).unwrap();
        assert_eq!(spool.position(), 80);
    }

    #[test]
    fn budget_keeps_enforcing_after_a_panicking_holder() {
        let budget = MemoryBudget::new(100);
        assert!(budget.try_allocate(40));
        let shared = budget.clone();
        let joined = std::thread::spawn(move || {
            let _state = shared.inner.lock().unwrap();
            panic!("holder panicked");
        })
        .join();
        assert!(joined.is_err());
        assert!(budget.inner.is_poisoned());

        assert_eq!((budget.limit(), budget.used()), (100, 40));
        assert!(!budget.try_allocate(61));
        assert_eq!(budget.allocate_up_to(100), 60);
        budget.release(30);
        assert_eq!(budget.available(), 30);
    }

    #[test]
    fn memory_spool_refuses_growth_beyond_budget_and_reserve() {
        let budget = MemoryBudget::new(64);
        let mut spool = MemorySpool::new(budget.clone());
        spool.set_reservation(8).unwrap();
        let err = spool.grow(100).unwrap_err();
        assert!(err.is_recoverable_vm());
        assert_eq!(budget.used(), 8);
        assert_eq!(spool.position(), 0);
        assert!(spool.set_reservation(200).is_err());
        assert_eq!(spool.reserve(), 8);
    }

    #[test]
    fn dropping_a_memory_spool_returns_its_memory() {
        let budget = MemoryBudget::new(1000);
        {
            let mut pair = SpoolPair::in_memory(&budget);
            pair.set_reservations(100, 50).unwrap();
            pair.data.write_all(&[0; 30]).unwrap();
            assert_eq!(budget.used(), 180);
            pair.release_reservations();
            assert_eq!(budget.used(), 30);
        }
        assert_eq!(budget.used(), 0);
    }

    #[test]
    fn file_store_names_pairs_and_counts_bytes() {
        let dir = temp_dir("store");
        let store = SpoolStore::new(&dir).unwrap();
        let mut pair = store.open_pair().unwrap();
        pair.data.write_all(b"abc").unwrap();
        pair.blocks.write_all(&[0; 16]).unwrap();
        assert_eq!(
            pair.data_path().and_then(|p| p.file_name()).and_then(|n| n.to_str()),
            Some("bandlist_0.cfile")
        );
        assert_eq!(
            pair.block_path().and_then(|p| p.file_name()).and_then(|n| n.to_str()),
            Some("bandlist_0.bfile")
        );
        let (data, blocks) = pair.read_back().unwrap();
        assert_eq!(data, b"abc");
        assert_eq!(blocks.len(), 16);
        assert_eq!(store.metrics(), (2, 19));

        let data_path = pair.data_path().map(Path::to_path_buf).unwrap();
        pair.discard().unwrap();
        assert!(!data_path.exists());
        let _ = fs::remove_dir_all(&dir);
    }
}
