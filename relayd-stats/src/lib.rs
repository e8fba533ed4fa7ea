//! Stat primitives shared by every subsystem.
//!
//! Stats are backed by fixed-layout [`RawStatData`] slots so the same code
//! can run over heap memory (tests, single-generation runs) or a
//! process-shared memory region (hot restart). A slot carries a reference
//! count, a fixed truncating name buffer, and the value fields; allocators
//! hand out stable references that stay valid for the life of the process.
//!
//! The consumer-facing API is [`Store`] / [`Scope`]: ask for a counter,
//! gauge, or timespan by name and get a cheap cloneable handle. When the
//! backing region is full, handles degrade to no-ops rather than failing the
//! caller.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::warn;

/// Maximum stored stat name length; longer names are truncated and compared
/// against the truncated form.
pub const MAX_NAME_SIZE: usize = 127;

/// One stat slot. Laid out flat (`repr(C)`) because arrays of these live in
/// the cross-generation shared-memory region; any layout change must bump
/// that region's version stamp.
#[repr(C)]
pub struct RawStatData {
    pub value: AtomicU64,
    /// Delta since the last flush latch.
    pub pending_increment: AtomicU64,
    pub ref_count: AtomicU64,
    name: [u8; MAX_NAME_SIZE + 1],
}

impl RawStatData {
    /// A slot is live iff its name is set; `ref_count > 0` exactly then.
    pub fn initialized(&self) -> bool {
        self.name[0] != 0
    }

    /// Claim a zeroed slot. Requires the allocator's lock.
    pub fn initialize(&mut self, name: &str) {
        debug_assert!(!self.initialized());
        let bytes = name.as_bytes();
        let len = bytes.len().min(MAX_NAME_SIZE);
        self.name[..len].copy_from_slice(&bytes[..len]);
        self.name[len] = 0;
        self.ref_count.store(1, Ordering::Relaxed);
    }

    /// Name comparison against the possibly-truncated stored form.
    pub fn matches(&self, name: &str) -> bool {
        let bytes = name.as_bytes();
        let len = bytes.len().min(MAX_NAME_SIZE);
        self.name[..len] == bytes[..len] && self.name[len] == 0
    }

    pub fn name(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(0);
        std::str::from_utf8(&self.name[..len]).unwrap_or("")
    }

    pub fn zero(&mut self) {
        self.value.store(0, Ordering::Relaxed);
        self.pending_increment.store(0, Ordering::Relaxed);
        self.ref_count.store(0, Ordering::Relaxed);
        self.name = [0; MAX_NAME_SIZE + 1];
    }
}

/// Stable reference to a slot. The pointee must outlive the process's use of
/// stats, which both allocators guarantee (leaked heap slots, or a mapping
/// that lives until exit).
#[derive(Clone, Copy)]
pub struct StatDataRef(*const RawStatData);

impl StatDataRef {
    /// Caller guarantees `data` stays valid and never moves.
    pub unsafe fn new(data: *const RawStatData) -> StatDataRef {
        StatDataRef(data)
    }

    fn get(&self) -> &RawStatData {
        // Validity is the allocator's invariant, established at construction.
        unsafe { &*self.0 }
    }

    /// The underlying slot pointer, for allocators that need to zero it.
    pub fn raw(&self) -> *const RawStatData {
        self.0
    }
}

// Slots are plain atomics in memory that outlives every handle.
unsafe impl Send for StatDataRef {}
unsafe impl Sync for StatDataRef {}

/// Slot allocator. The heap variant backs isolated stores; the hot-restart
/// shared-memory region provides another implementation.
pub trait RawStatAllocator: Send + Sync {
    /// Find or claim a slot for `name`. `None` when the region is full;
    /// callers degrade by skipping the stat.
    fn alloc(&self, name: &str) -> Option<StatDataRef>;

    /// Drop one reference; the slot zeroes when the count reaches zero.
    fn free(&self, data: StatDataRef);
}

/// Heap-backed allocator. Slots are leaked on purpose: handles hold raw
/// references and stats live for the duration of the process anyway.
#[derive(Default)]
pub struct HeapRawStatAllocator {
    slots: Mutex<HashMap<String, StatDataRef>>,
}

impl RawStatAllocator for HeapRawStatAllocator {
    fn alloc(&self, name: &str) -> Option<StatDataRef> {
        let mut slots = self.slots.lock().unwrap();
        if let Some(existing) = slots.get(name) {
            existing.get().ref_count.fetch_add(1, Ordering::Relaxed);
            return Some(*existing);
        }

        let mut data = Box::new(RawStatData {
            value: AtomicU64::new(0),
            pending_increment: AtomicU64::new(0),
            ref_count: AtomicU64::new(0),
            name: [0; MAX_NAME_SIZE + 1],
        });
        data.initialize(name);
        let data_ref = unsafe { StatDataRef::new(Box::leak(data)) };
        slots.insert(name.to_string(), data_ref);
        Some(data_ref)
    }

    fn free(&self, data: StatDataRef) {
        let mut slots = self.slots.lock().unwrap();
        if data.get().ref_count.fetch_sub(1, Ordering::Relaxed) == 1 {
            let name = data.get().name().to_string();
            slots.remove(&name);
            // The allocation itself is leaked; only the registry entry goes.
        }
    }
}

/// Monotonic counter handle. No-op when the backing region was full.
#[derive(Clone)]
pub struct Counter {
    data: Option<StatDataRef>,
}

impl Counter {
    pub fn inc(&self) {
        self.add(1);
    }

    pub fn add(&self, amount: u64) {
        if let Some(data) = &self.data {
            data.get().value.fetch_add(amount, Ordering::Relaxed);
            data.get()
                .pending_increment
                .fetch_add(amount, Ordering::Relaxed);
        }
    }

    pub fn value(&self) -> u64 {
        self.data
            .as_ref()
            .map_or(0, |d| d.get().value.load(Ordering::Relaxed))
    }

    /// Read and clear the delta accumulated since the previous latch; the
    /// flush timer uses this.
    pub fn latch(&self) -> u64 {
        self.data
            .as_ref()
            .map_or(0, |d| d.get().pending_increment.swap(0, Ordering::Relaxed))
    }
}

/// Up/down gauge handle.
#[derive(Clone)]
pub struct Gauge {
    data: Option<StatDataRef>,
}

impl Gauge {
    pub fn inc(&self) {
        self.add(1);
    }

    pub fn dec(&self) {
        self.sub(1);
    }

    pub fn add(&self, amount: u64) {
        if let Some(data) = &self.data {
            data.get().value.fetch_add(amount, Ordering::Relaxed);
        }
    }

    pub fn sub(&self, amount: u64) {
        if let Some(data) = &self.data {
            data.get().value.fetch_sub(amount, Ordering::Relaxed);
        }
    }

    pub fn set(&self, value: u64) {
        if let Some(data) = &self.data {
            data.get().value.store(value, Ordering::Relaxed);
        }
    }

    pub fn value(&self) -> u64 {
        self.data
            .as_ref()
            .map_or(0, |d| d.get().value.load(Ordering::Relaxed))
    }
}

/// Millisecond timing stat: `value` accumulates milliseconds,
/// `pending_increment` counts samples.
#[derive(Clone)]
pub struct TimerStat {
    data: Option<StatDataRef>,
}

impl TimerStat {
    pub fn record_ms(&self, ms: u64) {
        if let Some(data) = &self.data {
            data.get().value.fetch_add(ms, Ordering::Relaxed);
            data.get().pending_increment.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Begin a span that records into this stat when completed.
    pub fn span(&self) -> Timespan {
        Timespan {
            timer: self.clone(),
            start: Instant::now(),
        }
    }

    pub fn total_ms(&self) -> u64 {
        self.data
            .as_ref()
            .map_or(0, |d| d.get().value.load(Ordering::Relaxed))
    }

    pub fn sample_count(&self) -> u64 {
        self.data
            .as_ref()
            .map_or(0, |d| d.get().pending_increment.load(Ordering::Relaxed))
    }
}

/// In-flight timing measurement. Records only on [`Timespan::complete`];
/// a span dropped unfinished (a failed connect, say) reports nothing.
pub struct Timespan {
    timer: TimerStat,
    start: Instant,
}

impl Timespan {
    pub fn complete(self) {
        self.timer.record_ms(self.start.elapsed().as_millis() as u64);
    }
}

struct StoreInner {
    allocator: Arc<dyn RawStatAllocator>,
    /// Name cache so repeated lookups skip the allocator scan.
    known: Mutex<HashMap<String, StatDataRef>>,
    exhausted_logged: std::sync::atomic::AtomicBool,
}

/// Root stat store. Cheap to clone and share across workers.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    pub fn new(allocator: Arc<dyn RawStatAllocator>) -> Store {
        Store {
            inner: Arc::new(StoreInner {
                allocator,
                known: Mutex::new(HashMap::new()),
                exhausted_logged: std::sync::atomic::AtomicBool::new(false),
            }),
        }
    }

    /// Heap-backed store for tests and tooling.
    pub fn isolated() -> Store {
        Store::new(Arc::new(HeapRawStatAllocator::default()))
    }

    pub fn counter(&self, name: &str) -> Counter {
        Counter {
            data: self.slot(name),
        }
    }

    pub fn gauge(&self, name: &str) -> Gauge {
        Gauge {
            data: self.slot(name),
        }
    }

    pub fn timer(&self, name: &str) -> TimerStat {
        TimerStat {
            data: self.slot(name),
        }
    }

    pub fn scope(&self, prefix: &str) -> Scope {
        Scope {
            store: self.clone(),
            prefix: prefix.to_string(),
        }
    }

    /// Snapshot of every known stat and its current value, for the periodic
    /// flush log and the admin surface.
    pub fn snapshot(&self) -> Vec<(String, u64)> {
        let known = self.inner.known.lock().unwrap();
        let mut entries: Vec<(String, u64)> = known
            .iter()
            .map(|(name, data)| (name.clone(), data.get().value.load(Ordering::Relaxed)))
            .collect();
        entries.sort();
        entries
    }

    /// Bytes of slot memory referenced by this store.
    pub fn memory_used(&self) -> u64 {
        let known = self.inner.known.lock().unwrap();
        (known.len() * std::mem::size_of::<RawStatData>()) as u64
    }

    fn slot(&self, name: &str) -> Option<StatDataRef> {
        let mut known = self.inner.known.lock().unwrap();
        if let Some(existing) = known.get(name) {
            return Some(*existing);
        }
        match self.inner.allocator.alloc(name) {
            Some(data) => {
                known.insert(name.to_string(), data);
                Some(data)
            }
            None => {
                if !self
                    .inner
                    .exhausted_logged
                    .swap(true, Ordering::Relaxed)
                {
                    warn!(stat = name, "stat slots exhausted; further stats unreported");
                }
                None
            }
        }
    }
}

/// Prefixing view over a [`Store`].
#[derive(Clone)]
pub struct Scope {
    store: Store,
    prefix: String,
}

impl Scope {
    pub fn counter(&self, name: &str) -> Counter {
        self.store.counter(&self.prefixed(name))
    }

    pub fn gauge(&self, name: &str) -> Gauge {
        self.store.gauge(&self.prefixed(name))
    }

    pub fn timer(&self, name: &str) -> TimerStat {
        self.store.timer(&self.prefixed(name))
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn prefixed(&self, name: &str) -> String {
        let mut full = String::with_capacity(self.prefix.len() + name.len());
        let _ = write!(full, "{}{}", self.prefix, name);
        full
    }
}
