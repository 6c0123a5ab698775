//! A single append-only value log:  a write-buffered append path, a random-access fetch path with
//! an in-buffer fast path, and a tiny direct-mapped value cache.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::RwLock;

use biometrics::{Collector, Counter};
use zerror::Z;

use super::{
    corruption, frame_header, logic_error, parse_payload, Error, IoToZ, VlogOptions,
    VLOG_HEADER_SIZE, WRITE_BUFFER_SIZE,
};

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static VLOG_OPEN: Counter = Counter::new("vlogtk.vlog.open");
static VLOG_APPEND: Counter = Counter::new("vlogtk.vlog.append");
static VLOG_APPEND_BYPASS: Counter = Counter::new("vlogtk.vlog.append.bypass");
static VLOG_FLUSH: Counter = Counter::new("vlogtk.vlog.flush");
static VLOG_SYNC: Counter = Counter::new("vlogtk.vlog.sync");
static FETCH_IN_BUFFER: Counter = Counter::new("vlogtk.vlog.fetch.in_buffer");
static FETCH_FROM_FILE: Counter = Counter::new("vlogtk.vlog.fetch.from_file");
static VALUE_CACHE_HIT: Counter = Counter::new("vlogtk.vlog.value_cache.hit");
static VALUE_CACHE_INSERT: Counter = Counter::new("vlogtk.vlog.value_cache.insert");

/// Register the biometrics for this module.
pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&VLOG_OPEN);
    collector.register_counter(&VLOG_APPEND);
    collector.register_counter(&VLOG_APPEND_BYPASS);
    collector.register_counter(&VLOG_FLUSH);
    collector.register_counter(&VLOG_SYNC);
    collector.register_counter(&FETCH_IN_BUFFER);
    collector.register_counter(&FETCH_FROM_FILE);
    collector.register_counter(&VALUE_CACHE_HIT);
    collector.register_counter(&VALUE_CACHE_INSERT);
}

///////////////////////////////////////////// Constants ////////////////////////////////////////////

// Fetches at or below this size parse out of a stack buffer.
const SCRATCH_SIZE: usize = 1 << 16;

////////////////////////////////////////////// Mutable /////////////////////////////////////////////

// The rwlock protects the write buffer and the head offset together:  a reader deciding whether an
// offset is in the buffer must see head and buffer move in lockstep.
struct Mutable {
    dest: File,
    buffer: Box<[u8; WRITE_BUFFER_SIZE]>,
    size: usize,
    head: u64,
}

impl Mutable {
    // Write the buffered frames to the file.  head and size are updated only after the bytes have
    // been handed to the file, so a failed flush leaves the buffer logically intact and retry is
    // safe.
    fn flush(&mut self) -> Result<(), Error> {
        if self.size == 0 {
            return Ok(());
        }
        VLOG_FLUSH.click();
        self.dest.write_all(&self.buffer[..self.size]).as_z()?;
        self.head += self.size as u64;
        self.size = 0;
        Ok(())
    }

    // Append directly to the file, durably, bypassing the buffer.
    fn synced_append(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.dest.write_all(buf).as_z()?;
        self.dest.sync_data().as_z()?;
        self.head += buf.len() as u64;
        Ok(())
    }

    fn buffered_copy(&mut self, header: &[u8; VLOG_HEADER_SIZE], payload: &[u8]) {
        let size = self.size;
        self.buffer[size..size + VLOG_HEADER_SIZE].copy_from_slice(header);
        self.buffer[size + VLOG_HEADER_SIZE..size + VLOG_HEADER_SIZE + payload.len()]
            .copy_from_slice(payload);
        self.size += VLOG_HEADER_SIZE + payload.len();
    }
}

//////////////////////////////////////////////// Vlog //////////////////////////////////////////////

/// One append-only value log.  Owns the write buffer, the appendable file, the random-access
/// handle, and the value cache; the manager routes to it by file number.
pub struct Vlog {
    number: u64,
    path: PathBuf,
    mutable: RwLock<Mutable>,
    file: File,
    cache: Option<ValueCache>,
    count: AtomicU64,
}

impl Vlog {
    /// Open the vlog at `path`, creating it if necessary.  A pre-existing file is appended to; its
    /// current length becomes the head.
    pub fn open<P: AsRef<Path>>(
        options: &VlogOptions,
        path: P,
        number: u64,
    ) -> Result<Self, Error> {
        VLOG_OPEN.click();
        let path = path.as_ref().to_path_buf();
        let dest = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .as_z()
            .with_info("path", &path)?;
        let file = OpenOptions::new()
            .read(true)
            .open(&path)
            .as_z()
            .with_info("path", &path)?;
        let head = file.metadata().as_z()?.len();
        let mutable = RwLock::new(Mutable {
            dest,
            buffer: Box::new([0u8; WRITE_BUFFER_SIZE]),
            size: 0,
            head,
        });
        let cache = if options.value_cache {
            Some(ValueCache::new())
        } else {
            None
        };
        Ok(Self {
            number,
            path,
            mutable,
            file,
            cache,
            count: AtomicU64::new(0),
        })
    }

    /// This vlog's file number.
    pub fn number(&self) -> u64 {
        self.number
    }

    /// The path this vlog was opened at.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The offset at which the next framed record will begin.
    pub fn head(&self) -> u64 {
        let mutable = self.mutable.read().unwrap();
        mutable.head + mutable.size as u64
    }

    /// Append one framed record and return the offset of its payload.  Small records coalesce in
    /// the write buffer; records that can never fit the buffer bypass it with durable appends.
    pub fn append(&self, payload: &[u8]) -> Result<u64, Error> {
        VLOG_APPEND.click();
        let header = frame_header(payload);
        let framed = VLOG_HEADER_SIZE + payload.len();
        let mut mutable = self.mutable.write().unwrap();
        if mutable.size + framed > WRITE_BUFFER_SIZE {
            mutable.flush()?;
            if framed > WRITE_BUFFER_SIZE {
                VLOG_APPEND_BYPASS.click();
                let offset = mutable.head + VLOG_HEADER_SIZE as u64;
                mutable.synced_append(&header)?;
                mutable.synced_append(payload)?;
                return Ok(offset);
            }
        }
        let offset = mutable.head + (mutable.size + VLOG_HEADER_SIZE) as u64;
        mutable.buffered_copy(&header, payload);
        Ok(offset)
    }

    /// Flush buffered frames to the file.
    pub fn flush(&self) -> Result<(), Error> {
        let mut mutable = self.mutable.write().unwrap();
        mutable.flush()
    }

    /// Flush buffered frames and force them to durable storage.
    pub fn sync(&self) -> Result<(), Error> {
        VLOG_SYNC.click();
        let mut mutable = self.mutable.write().unwrap();
        mutable.flush()?;
        mutable.dest.sync_data().as_z()?;
        Ok(())
    }

    /// Fetch the value of the payload of `size` bytes at `offset`.  Payloads still sitting in the
    /// write buffer are served from it under the shared lock; everything else is a positional
    /// read.
    pub fn get(&self, offset: u64, size: u64) -> Result<Vec<u8>, Error> {
        if let Some(cache) = &self.cache {
            if let Some(value) = cache.lookup(offset) {
                VALUE_CACHE_HIT.click();
                return Ok(value);
            }
        }
        let size = size as usize;
        {
            let mutable = self.mutable.read().unwrap();
            if offset >= mutable.head {
                FETCH_IN_BUFFER.click();
                let start = (offset - mutable.head) as usize;
                if start + size > mutable.size {
                    return Err(logic_error("address runs past the write buffer")
                        .with_info("offset", offset)
                        .with_info("size", size));
                }
                let (_, value) = parse_payload(&mutable.buffer[start..start + size])?;
                return Ok(value.to_vec());
            }
        }
        FETCH_FROM_FILE.click();
        let mut stack = [0u8; SCRATCH_SIZE];
        let mut heap = Vec::new();
        let scratch: &mut [u8] = if size <= SCRATCH_SIZE {
            &mut stack[..size]
        } else {
            heap.resize(size, 0);
            &mut heap[..]
        };
        self.file.read_exact_at(scratch, offset).map_err(|err| {
            if err.kind() == std::io::ErrorKind::UnexpectedEof {
                corruption("short vlog read")
                    .with_info("offset", offset)
                    .with_info("size", size)
            } else {
                Error::from(err)
            }
        })?;
        let (_, value) = parse_payload(scratch)?;
        if let Some(cache) = &self.cache {
            cache.insert(offset, value);
        }
        Ok(value.to_vec())
    }

    /// Record that one payload in this vlog has been superseded.  Informational only.
    pub fn add_drop_count(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// The number of superseded payloads recorded against this vlog.
    pub fn drop_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub(crate) fn set_drop_count(&self, count: u64) {
        self.count.store(count, Ordering::Relaxed);
    }
}

//////////////////////////////////////////// ValueCache ////////////////////////////////////////////

const VALUE_CACHE_LINES: usize = 1 << 16;
const VALUE_CACHE_VALUE_SIZE: usize = 61;
const VALUE_CACHE_VALID: u8 = 0x80;

// One direct-mapped 64-byte line.  The length byte is written last (release) and checked first
// (acquire); everything in between is relaxed.  A torn line reads as a miss.
struct CacheLine {
    len_and_valid: AtomicU8,
    tag: [AtomicU8; 2],
    data: [AtomicU8; VALUE_CACHE_VALUE_SIZE],
}

impl CacheLine {
    fn new() -> Self {
        Self {
            len_and_valid: AtomicU8::new(0),
            tag: std::array::from_fn(|_| AtomicU8::new(0)),
            data: std::array::from_fn(|_| AtomicU8::new(0)),
        }
    }
}

// A tiny opportunistic cache of parsed values, direct-mapped on the low sixteen bits of the
// payload offset with a tag on the next sixteen.  Offsets are only distinguished by their low
// thirty-two bits.
struct ValueCache {
    lines: Box<[CacheLine]>,
}

impl ValueCache {
    fn new() -> Self {
        let lines = (0..VALUE_CACHE_LINES).map(|_| CacheLine::new()).collect();
        Self { lines }
    }

    fn line(&self, offset: u64) -> &CacheLine {
        &self.lines[(offset & 0xffff) as usize]
    }

    fn tag(offset: u64) -> [u8; 2] {
        (((offset >> 16) & 0xffff) as u16).to_le_bytes()
    }

    fn lookup(&self, offset: u64) -> Option<Vec<u8>> {
        let line = self.line(offset);
        let tag = Self::tag(offset);
        let len_and_valid = line.len_and_valid.load(Ordering::Acquire);
        if len_and_valid & VALUE_CACHE_VALID == 0 {
            return None;
        }
        if line.tag[0].load(Ordering::Relaxed) != tag[0]
            || line.tag[1].load(Ordering::Relaxed) != tag[1]
        {
            return None;
        }
        let length = (len_and_valid & !VALUE_CACHE_VALID) as usize;
        let mut value = vec![0u8; length];
        for (i, b) in value.iter_mut().enumerate() {
            *b = line.data[i].load(Ordering::Relaxed);
        }
        // A concurrent insert may have torn the line out from under us.
        if line.len_and_valid.load(Ordering::Acquire) != len_and_valid
            || line.tag[0].load(Ordering::Relaxed) != tag[0]
            || line.tag[1].load(Ordering::Relaxed) != tag[1]
        {
            return None;
        }
        Some(value)
    }

    fn insert(&self, offset: u64, value: &[u8]) {
        if value.len() > VALUE_CACHE_VALUE_SIZE {
            return;
        }
        VALUE_CACHE_INSERT.click();
        let line = self.line(offset);
        let tag = Self::tag(offset);
        // Invalidate first so a racing lookup falls back to a miss.
        line.len_and_valid.store(0, Ordering::Release);
        for (i, b) in value.iter().enumerate() {
            line.data[i].store(*b, Ordering::Relaxed);
        }
        line.tag[0].store(tag[0], Ordering::Relaxed);
        line.tag[1].store(tag[1], Ordering::Relaxed);
        line.len_and_valid
            .store(VALUE_CACHE_VALID | value.len() as u8, Ordering::Release);
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::fs::remove_dir_all;
    use std::path::PathBuf;

    use super::super::{encode_payload, VlogOptions};
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("vlogtk_vlog_{}_{}", name, std::process::id()));
        let _ = remove_dir_all(&path);
        std::fs::create_dir_all(&path).unwrap();
        path
    }

    fn open_vlog(dir: &Path, number: u64) -> Vlog {
        Vlog::open(
            &VlogOptions::default(),
            dir.join(format!("{:06}.vlog", number)),
            number,
        )
        .unwrap()
    }

    fn file_len(vlog: &Vlog) -> u64 {
        std::fs::metadata(vlog.path()).unwrap().len()
    }

    #[test]
    fn small_append_stays_in_buffer() {
        let dir = scratch_dir("small_append");
        let vlog = open_vlog(&dir, 7);
        let payload = encode_payload("foo".as_bytes(), "bar".as_bytes());
        let offset = vlog.append(&payload).unwrap();
        assert_eq!(12, offset);
        assert_eq!(21, vlog.head());
        // Nothing has been flushed, so the fetch must be a buffer hit.
        assert_eq!(0, file_len(&vlog));
        let value = vlog.get(offset, payload.len() as u64).unwrap();
        assert_eq!("bar".as_bytes(), &value);
        assert_eq!(0, file_len(&vlog));
    }

    #[test]
    fn buffer_overflow_triggers_flush() {
        let dir = scratch_dir("overflow_flush");
        let vlog = open_vlog(&dir, 1);
        // Payload length 100, so every frame is 112 bytes and thirty-six of them fill 4032 of the
        // 4096-byte buffer.  The thirty-seventh forces the flush.
        let value = vec![b'v'; 91];
        let payload = encode_payload("sixkey".as_bytes(), &value);
        assert_eq!(100, payload.len());
        let mut offsets = Vec::new();
        for _ in 0..37 {
            offsets.push(vlog.append(&payload).unwrap());
        }
        assert_eq!(4032, file_len(&vlog));
        assert_eq!(37 * 112, vlog.head());
        // Flushed records come off the file; the freshest comes out of the buffer.
        for offset in offsets.iter() {
            let got = vlog.get(*offset, payload.len() as u64).unwrap();
            assert_eq!(&value, &got);
        }
    }

    #[test]
    fn oversize_payload_bypasses_buffer() {
        let dir = scratch_dir("oversize_bypass");
        let vlog = open_vlog(&dir, 1);
        let value = vec![b'x'; 4985];
        let payload = encode_payload("largekey".as_bytes(), &value);
        assert_eq!(5000, payload.len());
        let offset = vlog.append(&payload).unwrap();
        assert_eq!(12, offset);
        assert_eq!(5012, vlog.head());
        // The buffer was never involved:  every byte is on the file already.
        assert_eq!(5012, file_len(&vlog));
        let got = vlog.get(offset, payload.len() as u64).unwrap();
        assert_eq!(&value, &got);
    }

    #[test]
    fn mixed_sizes_interleave() {
        let dir = scratch_dir("mixed_sizes");
        let vlog = open_vlog(&dir, 1);
        let small = encode_payload("k".as_bytes(), "small".as_bytes());
        let big_value = vec![b'B'; WRITE_BUFFER_SIZE];
        let big = encode_payload("k".as_bytes(), &big_value);
        let small_offset_1 = vlog.append(&small).unwrap();
        let big_offset = vlog.append(&big).unwrap();
        let small_offset_2 = vlog.append(&small).unwrap();
        assert_eq!(
            "small".as_bytes(),
            &vlog.get(small_offset_1, small.len() as u64).unwrap()
        );
        assert_eq!(&big_value, &vlog.get(big_offset, big.len() as u64).unwrap());
        assert_eq!(
            "small".as_bytes(),
            &vlog.get(small_offset_2, small.len() as u64).unwrap()
        );
    }

    #[test]
    fn corrupt_type_byte_fails_fetch() {
        let dir = scratch_dir("corrupt_type_byte");
        let vlog = open_vlog(&dir, 1);
        // Disable the cache's help by corrupting before the first fetch.
        let payload = encode_payload("foo".as_bytes(), "bar".as_bytes());
        let offset = vlog.append(&payload).unwrap();
        // Still buffered:  fetch succeeds.
        assert!(vlog.get(offset, payload.len() as u64).is_ok());
        vlog.sync().unwrap();
        // Flip the payload's type byte on disk.
        let file = OpenOptions::new().write(true).open(vlog.path()).unwrap();
        file.write_all_at(&[0x02], offset).unwrap();
        let err = vlog.get(offset, payload.len() as u64);
        assert!(matches!(err, Err(Error::Corruption { .. })));
    }

    #[test]
    fn short_read_is_corruption() {
        let dir = scratch_dir("short_read");
        let vlog = open_vlog(&dir, 1);
        let payload = encode_payload("foo".as_bytes(), "bar".as_bytes());
        let offset = vlog.append(&payload).unwrap();
        vlog.sync().unwrap();
        // Ask for more bytes than the file holds.
        let err = vlog.get(offset, 1024);
        assert!(matches!(err, Err(Error::Corruption { .. })));
    }

    #[test]
    fn sync_empties_buffer() {
        let dir = scratch_dir("sync_empties");
        let vlog = open_vlog(&dir, 1);
        let payload = encode_payload("k".as_bytes(), "v".as_bytes());
        vlog.append(&payload).unwrap();
        let head_before = vlog.head();
        vlog.sync().unwrap();
        assert_eq!(head_before, vlog.head());
        assert_eq!(head_before, file_len(&vlog));
    }

    #[test]
    fn reopen_resumes_at_file_length() {
        let dir = scratch_dir("reopen_resumes");
        let payload = encode_payload("k".as_bytes(), "v".as_bytes());
        let first_head;
        {
            let vlog = open_vlog(&dir, 1);
            vlog.append(&payload).unwrap();
            vlog.sync().unwrap();
            first_head = vlog.head();
        }
        let vlog = open_vlog(&dir, 1);
        assert_eq!(first_head, vlog.head());
        let offset = vlog.append(&payload).unwrap();
        assert_eq!(first_head + 12, offset);
        assert_eq!("v".as_bytes(), &vlog.get(offset, payload.len() as u64).unwrap());
    }

    #[test]
    fn drop_counts_accumulate() {
        let dir = scratch_dir("drop_counts");
        let vlog = open_vlog(&dir, 1);
        assert_eq!(0, vlog.drop_count());
        vlog.add_drop_count();
        vlog.add_drop_count();
        assert_eq!(2, vlog.drop_count());
    }

    mod properties {
        use std::sync::atomic::AtomicUsize;

        use proptest::prelude::*;

        use super::*;

        static CASE: AtomicUsize = AtomicUsize::new(0);

        proptest! {
            // Every recorded (offset, size) pair fetches back to exactly the payload that was
            // appended, whether it sits in the buffer, behind a flush, or past the bypass path.
            #[test]
            fn append_fetch_round_trip(
                entries in prop::collection::vec(
                    (
                        prop::collection::vec(any::<u8>(), 0..64usize),
                        prop::collection::vec(any::<u8>(), 0..6000usize),
                    ),
                    1..24usize,
                )
            ) {
                let case = CASE.fetch_add(1, Ordering::Relaxed);
                let dir = scratch_dir(&format!("property_{}", case));
                let vlog = open_vlog(&dir, 1);
                let mut addrs = Vec::new();
                for (key, value) in entries.iter() {
                    let payload = encode_payload(key, value);
                    let offset = vlog.append(&payload).unwrap();
                    addrs.push((offset, payload.len() as u64));
                    // Everything appended so far is immediately fetchable.
                    let (last_offset, last_size) = addrs[addrs.len() - 1];
                    prop_assert_eq!(value, &vlog.get(last_offset, last_size).unwrap());
                }
                for (i, (offset, size)) in addrs.iter().enumerate() {
                    prop_assert_eq!(&entries[i].1, &vlog.get(*offset, *size).unwrap());
                }
                vlog.sync().unwrap();
                for (i, (offset, size)) in addrs.iter().enumerate() {
                    prop_assert_eq!(&entries[i].1, &vlog.get(*offset, *size).unwrap());
                }
            }
        }
    }

    mod value_cache {
        use super::*;

        #[test]
        fn insert_then_lookup() {
            let cache = ValueCache::new();
            cache.insert(0x1234, "hello".as_bytes());
            assert_eq!(Some("hello".as_bytes().to_vec()), cache.lookup(0x1234));
        }

        #[test]
        fn tag_mismatch_is_a_miss() {
            let cache = ValueCache::new();
            cache.insert(0x1234, "hello".as_bytes());
            // Same line, different tag.
            assert_eq!(None, cache.lookup(0x1234 + (1 << 16)));
        }

        #[test]
        fn oversize_values_are_not_cached() {
            let cache = ValueCache::new();
            let value = vec![b'x'; VALUE_CACHE_VALUE_SIZE + 1];
            cache.insert(0x1234, &value);
            assert_eq!(None, cache.lookup(0x1234));
        }

        #[test]
        fn last_insert_wins() {
            let cache = ValueCache::new();
            cache.insert(0x1234, "one".as_bytes());
            cache.insert(0x1234 + (1 << 16), "two".as_bytes());
            assert_eq!(None, cache.lookup(0x1234));
            assert_eq!(
                Some("two".as_bytes().to_vec()),
                cache.lookup(0x1234 + (1 << 16))
            );
        }
    }
}
