//! A cursor that resolves addresses to values through a pool of fetch workers.  The wrapped
//! cursor yields `(user_key, address)`; resolving an address may hit disk, and doing that inline
//! would serialize fetch latency into the scan.  Instead, every advance tops up a window of
//! prefetch tasks, and only `value()` blocks, and only until its own slot is filled.  The
//! consumer observes entries in exactly the wrapped cursor's order.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use biometrics::{Collector, Counter};
use keyvalint::{Cursor, KeyRef};

use super::manager::FetchValue;
use super::Error;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static PREFETCH_TASKS: Counter = Counter::new("vlogtk.concurrent_cursor.tasks");
static PREFETCH_BATCHES: Counter = Counter::new("vlogtk.concurrent_cursor.batches");
static CURSOR_QUIESCE: Counter = Counter::new("vlogtk.concurrent_cursor.quiesce");

/// Register the biometrics for this module.
pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&PREFETCH_TASKS);
    collector.register_counter(&PREFETCH_BATCHES);
    collector.register_counter(&CURSOR_QUIESCE);
}

///////////////////////////////////////////// Constants ////////////////////////////////////////////

/// The number of slots in the prefetch ring.  The consumer's window never exceeds this.
pub const CURSOR_RING_SIZE: u64 = 1024;

// How many entries ahead of the consumer each top-up runs.
const PREFETCH_BATCH: u64 = 256;

// The task queue starts at this capacity and doubles as needed.
const TASK_QUEUE_CAPACITY: usize = 512;

// Logical indices start mid-range so that walking backward cannot underflow.
const INDEX_BIAS: u64 = 1 << 63;

// Slot sequences are logical indices, which live near INDEX_BIAS; zero marks "prefetching".
const SEQ_PREFETCHING: u64 = 0;

/// Clamp for [PrefetchOptions::workers].
pub const CLAMP_MIN_WORKERS: usize = 1;
/// Clamp for [PrefetchOptions::workers].
pub const CLAMP_MAX_WORKERS: usize = 256;

////////////////////////////////////////// PrefetchOptions /////////////////////////////////////////

/// Options for the concurrent cursor.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PrefetchOptions {
    pub(crate) workers: usize,
}

impl PrefetchOptions {
    /// Set the number of fetch workers.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.clamp(CLAMP_MIN_WORKERS, CLAMP_MAX_WORKERS);
        self
    }
}

impl Default for PrefetchOptions {
    fn default() -> Self {
        Self { workers: 32 }
    }
}

///////////////////////////////////////////// WorkSlot /////////////////////////////////////////////

#[derive(Default)]
struct FetchResult {
    value: Vec<u8>,
    status: Option<Error>,
}

// The worker-facing half of a ring slot.  `seq` publishes the result (release on write, acquire
// on read); `busy` is true from dispatch until the worker finishes, and re-dispatch waits on it.
struct WorkSlot {
    seq: AtomicU64,
    busy: AtomicBool,
    result: UnsafeCell<FetchResult>,
}

impl WorkSlot {
    fn new() -> Self {
        Self {
            seq: AtomicU64::new(SEQ_PREFETCHING),
            busy: AtomicBool::new(false),
            result: UnsafeCell::new(FetchResult::default()),
        }
    }
}

// SAFETY(rescrv):  result is written only by the worker holding the slot's outstanding task
// (busy covers dispatch through completion) and read only by the consumer after it observes the
// task's seq.  The dispatch protocol never allows two outstanding tasks against one slot.
unsafe impl Sync for WorkSlot {}

//////////////////////////////////////////// SharedState ///////////////////////////////////////////

struct Task {
    slot: usize,
    seq: u64,
    addr: Vec<u8>,
}

struct SharedState<F: FetchValue> {
    slots: Vec<WorkSlot>,
    queue: Mutex<VecDeque<Task>>,
    wake_workers: Condvar,
    closing: AtomicBool,
    completed_tasks: AtomicU64,
    data_size: AtomicU64,
    fetch: F,
}

fn worker<F: FetchValue>(shared: &SharedState<F>) {
    loop {
        let task = {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                if let Some(task) = queue.pop_front() {
                    break task;
                }
                if shared.closing.load(Ordering::Acquire) {
                    return;
                }
                queue = shared.wake_workers.wait(queue).unwrap();
            }
        };
        let result = match shared.fetch.fetch_value(&task.addr) {
            Ok(value) => FetchResult {
                value,
                status: None,
            },
            Err(err) => FetchResult {
                value: Vec::new(),
                status: Some(err),
            },
        };
        let value_len = result.value.len() as u64;
        let slot = &shared.slots[task.slot];
        // SAFETY(rescrv):  This worker holds the slot's only outstanding task.
        unsafe {
            *slot.result.get() = result;
        }
        slot.seq.store(task.seq, Ordering::Release);
        slot.busy.store(false, Ordering::Release);
        shared.data_size.fetch_add(value_len, Ordering::Release);
        shared.completed_tasks.fetch_add(1, Ordering::Relaxed);
    }
}

////////////////////////////////////////// ConcurrentCursor ////////////////////////////////////////

// The consumer-facing half of a ring slot.  Written synchronously at dispatch, so valid() and
// key() never block.
#[derive(Default)]
struct ConsumerSlot {
    valid: bool,
    key: Vec<u8>,
    timestamp: u64,
}

/// A cursor that prefetches values through a worker pool while preserving the wrapped cursor's
/// order.  `valid()` and `key()` never block; `value()` blocks only for its own slot.
pub struct ConcurrentCursor<C: Cursor, E: Debug + From<Error>, F: FetchValue> {
    cursor: C,
    shared: Arc<SharedState<F>>,
    consumer: Vec<ConsumerSlot>,
    front: u64,
    back: u64,
    cur: u64,
    tot_tasks: u64,
    workers: Vec<JoinHandle<()>>,
    _phantom_e: std::marker::PhantomData<E>,
}

impl<E, C, F> ConcurrentCursor<C, E, F>
where
    E: Debug + From<Error>,
    C: Cursor<Error = E>,
    F: FetchValue + Send + Sync + 'static,
{
    /// Create a new concurrent cursor over `cursor`, resolving addresses through `fetch`.
    pub fn new(options: PrefetchOptions, cursor: C, fetch: F) -> Self {
        let shared = Arc::new(SharedState {
            slots: (0..CURSOR_RING_SIZE).map(|_| WorkSlot::new()).collect(),
            queue: Mutex::new(VecDeque::with_capacity(TASK_QUEUE_CAPACITY)),
            wake_workers: Condvar::new(),
            closing: AtomicBool::new(false),
            completed_tasks: AtomicU64::new(0),
            data_size: AtomicU64::new(0),
            fetch,
        });
        let workers = (0..options.workers)
            .map(|_| {
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || worker(&shared))
            })
            .collect();
        let consumer = (0..CURSOR_RING_SIZE).map(|_| ConsumerSlot::default()).collect();
        Self {
            cursor,
            shared,
            consumer,
            front: INDEX_BIAS,
            back: INDEX_BIAS,
            cur: INDEX_BIAS,
            tot_tasks: 0,
            workers,
            _phantom_e: std::marker::PhantomData,
        }
    }
}

impl<E: Debug + From<Error>, C: Cursor<Error = E>, F: FetchValue> ConcurrentCursor<C, E, F> {
    /// Whether the cursor rests on an entry.  Never blocks.
    pub fn valid(&self) -> bool {
        self.consumer[(self.cur % CURSOR_RING_SIZE) as usize].valid
    }

    /// The fetch status of the current entry.  Blocks until the entry's fetch completes.
    pub fn status(&self) -> Result<(), Error> {
        let index = (self.cur % CURSOR_RING_SIZE) as usize;
        if !self.consumer[index].valid {
            return Ok(());
        }
        let result = self.await_slot(index);
        match &result.status {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// The total bytes of keys and values pulled through the cursor.  Quiesces in-flight fetches
    /// first; a benchmark hook, not a hot path.
    pub fn data_size(&self) -> u64 {
        self.quiesce();
        self.shared.data_size.load(Ordering::Acquire)
    }

    fn await_slot(&self, index: usize) -> &FetchResult {
        let wslot = &self.shared.slots[index];
        while wslot.seq.load(Ordering::Acquire) != self.cur {
            std::hint::spin_loop();
        }
        // SAFETY(rescrv):  seq equals our logical index, so the fetch completed and published
        // before this read, and re-dispatch of the slot requires &mut self.
        unsafe { &*wslot.result.get() }
    }

    fn quiesce(&self) {
        while self.shared.completed_tasks.load(Ordering::Acquire) != self.tot_tasks {
            std::hint::spin_loop();
        }
    }

    fn after_seek(&mut self) {
        CURSOR_QUIESCE.click();
        self.quiesce();
        self.front = INDEX_BIAS;
        self.back = INDEX_BIAS;
        self.cur = INDEX_BIAS;
        self.tot_tasks = 0;
        self.shared.completed_tasks.store(0, Ordering::Release);
        self.shared.data_size.store(0, Ordering::Release);
        let slot = (self.back % CURSOR_RING_SIZE) as usize;
        self.back += 1;
        self.get_value(slot, self.cur);
    }

    // Capture the wrapped cursor's position into a slot and, if it carries an address, enqueue
    // the fetch.  Returns false when the wrapped cursor is exhausted.
    fn get_value(&mut self, slot: usize, seq: u64) -> bool {
        let wslot = &self.shared.slots[slot];
        // Never re-dispatch a slot with an outstanding fetch.
        while wslot.busy.load(Ordering::Acquire) {
            std::hint::spin_loop();
        }
        wslot.seq.store(SEQ_PREFETCHING, Ordering::Release);
        let Some(kr) = self.cursor.key() else {
            self.consumer[slot].valid = false;
            return false;
        };
        let key_len = kr.key.len() as u64;
        let timestamp = kr.timestamp;
        let cslot = &mut self.consumer[slot];
        cslot.valid = true;
        cslot.key.clear();
        cslot.key.extend_from_slice(kr.key);
        cslot.timestamp = timestamp;
        self.shared.data_size.fetch_add(key_len, Ordering::Relaxed);
        let Some(addr) = self.cursor.value() else {
            // No address to resolve; the slot is immediately ready with the empty value.
            // SAFETY(rescrv):  busy is false, so no worker owns the slot.
            unsafe {
                *wslot.result.get() = FetchResult::default();
            }
            wslot.seq.store(seq, Ordering::Release);
            return true;
        };
        let addr = addr.to_vec();
        self.tot_tasks += 1;
        wslot.busy.store(true, Ordering::Release);
        PREFETCH_TASKS.click();
        {
            let mut queue = self.shared.queue.lock().unwrap();
            queue.push_back(Task { slot, seq, addr });
            self.shared.wake_workers.notify_one();
        }
        true
    }
}

impl<E: Debug + From<Error>, C: Cursor<Error = E>, F: FetchValue> Cursor
    for ConcurrentCursor<C, E, F>
{
    type Error = E;

    fn seek_to_first(&mut self) -> Result<(), E> {
        self.cursor.seek_to_first()?;
        self.after_seek();
        Ok(())
    }

    fn seek_to_last(&mut self) -> Result<(), E> {
        self.cursor.seek_to_last()?;
        self.after_seek();
        Ok(())
    }

    fn seek(&mut self, key: &[u8]) -> Result<(), E> {
        self.cursor.seek(key)?;
        self.after_seek();
        Ok(())
    }

    fn next(&mut self) -> Result<(), E> {
        self.cur += 1;
        if self.cur == self.back {
            PREFETCH_BATCHES.click();
            for seq in self.cur..self.cur + PREFETCH_BATCH {
                self.cursor.next()?;
                let slot = (self.back % CURSOR_RING_SIZE) as usize;
                self.back += 1;
                if !self.get_value(slot, seq) {
                    break;
                }
            }
            while self.back - self.front > CURSOR_RING_SIZE {
                self.front += 1;
            }
        }
        Ok(())
    }

    fn prev(&mut self) -> Result<(), E> {
        if self.cur == self.front {
            PREFETCH_BATCHES.click();
            for delta in 0..PREFETCH_BATCH {
                let seq = self.cur - 1 - delta;
                self.cursor.prev()?;
                self.front -= 1;
                let slot = (self.front % CURSOR_RING_SIZE) as usize;
                if !self.get_value(slot, seq) {
                    break;
                }
            }
            while self.back - self.front > CURSOR_RING_SIZE {
                self.back -= 1;
            }
        }
        self.cur -= 1;
        Ok(())
    }

    fn key(&self) -> Option<KeyRef> {
        let cslot = &self.consumer[(self.cur % CURSOR_RING_SIZE) as usize];
        if cslot.valid {
            Some(KeyRef {
                key: &cslot.key,
                timestamp: cslot.timestamp,
            })
        } else {
            None
        }
    }

    fn value(&self) -> Option<&[u8]> {
        let index = (self.cur % CURSOR_RING_SIZE) as usize;
        if !self.consumer[index].valid {
            return None;
        }
        Some(&self.await_slot(index).value)
    }
}

impl<C: Cursor, E: Debug + From<Error>, F: FetchValue> Drop for ConcurrentCursor<C, E, F> {
    fn drop(&mut self) {
        // Drain in-flight fetches so no worker touches the ring while it is freed, then close.
        while self.shared.completed_tasks.load(Ordering::Acquire) != self.tot_tasks {
            std::hint::spin_loop();
        }
        {
            let _queue = self.shared.queue.lock().unwrap();
            self.shared.closing.store(true, Ordering::Release);
            self.shared.wake_workers.notify_all();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
