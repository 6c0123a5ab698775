//! A cursor that resolves internal entries down to one visible entry per user key.  The inner
//! cursor yields `(user_key, sequence) -> address` entries ordered by key ascending and sequence
//! descending; this cursor exposes, for a fixed snapshot sequence, the newest entry at or below
//! the snapshot, and hides keys whose newest such entry is a deletion.  The value is the packed
//! address, not the user value; see [crate::ConcurrentCursor] for resolution.

use std::cmp::Ordering;
use std::fmt::Debug;

use guacamole::Guacamole;
use keyvalint::{compare_bytes, Cursor, KeyRef};

use super::Error;

///////////////////////////////////////////// Constants ////////////////////////////////////////////

/// Roughly how many bytes of internal entries are read between read samples.
pub const READ_BYTES_PERIOD: u64 = 1 << 20;

///////////////////////////////////////////// ReadSample ///////////////////////////////////////////

/// A hook the LSM uses to drive read-triggered compaction.  Charged with the internal key each
/// time a sampling period elapses.  Not required for correctness.
pub trait ReadSample {
    /// Record that the iterator read past `key`.
    fn record_read_sample(&mut self, key: KeyRef<'_>);
}

impl ReadSample for () {
    fn record_read_sample(&mut self, _: KeyRef<'_>) {}
}

///////////////////////////////////////////// Direction ////////////////////////////////////////////

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Direction {
    // The inner cursor is positioned at the exact entry that yields key()/value().
    Forward,
    // The inner cursor is positioned just before the group of entries for key(); the yielded
    // entry is saved.
    Reverse,
}

//////////////////////////////////////////// SavedEntry ////////////////////////////////////////////

#[derive(Clone, Debug)]
struct SavedEntry {
    key: Vec<u8>,
    timestamp: u64,
    addr: Vec<u8>,
}

/////////////////////////////////////////// AddressCursor //////////////////////////////////////////

/// A snapshot-resolving cursor over internal entries.
pub struct AddressCursor<C: Cursor, E: Debug + From<Error>, S: ReadSample = ()> {
    cursor: C,
    snapshot: u64,
    direction: Direction,
    skip_key: Option<Vec<u8>>,
    saved: Option<SavedEntry>,
    sample: S,
    guac: Guacamole,
    bytes_until_read_sampling: u64,
    _phantom_e: std::marker::PhantomData<E>,
}

impl<E: Debug + From<Error>, C: Cursor<Error = E>> AddressCursor<C, E, ()> {
    /// Create a new address cursor at the given snapshot, without a read-sampling hook.
    pub fn new(cursor: C, snapshot: u64) -> Result<Self, E> {
        Self::with_sample(cursor, snapshot, (), 0)
    }
}

impl<E: Debug + From<Error>, C: Cursor<Error = E>, S: ReadSample> AddressCursor<C, E, S> {
    /// Create a new address cursor with a read-sampling hook.  `seed` seeds the sampling period.
    pub fn with_sample(mut cursor: C, snapshot: u64, sample: S, seed: u64) -> Result<Self, E> {
        cursor.seek_to_first()?;
        let mut guac = Guacamole::new(seed);
        let bytes_until_read_sampling = random_period(&mut guac);
        Ok(Self {
            cursor,
            snapshot,
            direction: Direction::Forward,
            skip_key: None,
            saved: None,
            sample,
            guac,
            bytes_until_read_sampling,
            _phantom_e: std::marker::PhantomData,
        })
    }

    /// The snapshot sequence this cursor resolves at.
    pub fn snapshot(&self) -> u64 {
        self.snapshot
    }

    fn charge(&mut self, key: &[u8], timestamp: u64, bytes: usize) {
        let bytes = bytes as u64;
        while self.bytes_until_read_sampling < bytes {
            self.bytes_until_read_sampling += random_period(&mut self.guac);
            self.sample.record_read_sample(KeyRef { key, timestamp });
        }
        self.bytes_until_read_sampling -= bytes;
    }

    // Advance the inner cursor until it rests on an entry to yield:  visible at the snapshot, not
    // a deletion, and not hidden by the skip key.
    fn find_next_user_entry(&mut self) -> Result<(), E> {
        loop {
            let (key, timestamp, is_deletion, bytes) = match self.cursor.key() {
                Some(kr) => {
                    let value_len = self.cursor.value().map(<[u8]>::len).unwrap_or(0);
                    (
                        kr.key.to_vec(),
                        kr.timestamp,
                        self.cursor.value().is_none(),
                        kr.key.len() + value_len,
                    )
                }
                None => {
                    self.skip_key = None;
                    return Ok(());
                }
            };
            self.charge(&key, timestamp, bytes);
            if timestamp <= self.snapshot {
                if is_deletion {
                    // Everything older for this key is hidden by the deletion.
                    self.skip_key = Some(key);
                } else {
                    let hidden = match &self.skip_key {
                        Some(skip) => compare_bytes(&key, skip) != Ordering::Greater,
                        None => false,
                    };
                    if !hidden {
                        self.skip_key = None;
                        return Ok(());
                    }
                }
            }
            self.cursor.next()?;
        }
    }

    // Scan the inner cursor backward, remembering the newest visible value entry for the user key
    // under consideration, until the user key changes.  Leaves the inner cursor just before the
    // group of the yielded key.
    fn find_prev_user_entry(&mut self) -> Result<(), E> {
        if self.cursor.key().is_none() {
            // Step off the end sentinel; a front sentinel stays put.
            self.cursor.prev()?;
        }
        let mut saved: Option<SavedEntry> = None;
        loop {
            let (key, timestamp, value) = match self.cursor.key() {
                Some(kr) => (
                    kr.key.to_vec(),
                    kr.timestamp,
                    self.cursor.value().map(|v| v.to_vec()),
                ),
                None => break,
            };
            let bytes = key.len() + value.as_ref().map(Vec::len).unwrap_or(0);
            self.charge(&key, timestamp, bytes);
            if timestamp <= self.snapshot {
                if let Some(saved) = saved.as_ref() {
                    if compare_bytes(&key, &saved.key) == Ordering::Less {
                        break;
                    }
                }
                saved = match value {
                    Some(addr) => Some(SavedEntry {
                        key,
                        timestamp,
                        addr,
                    }),
                    None => None,
                };
            }
            self.cursor.prev()?;
        }
        self.saved = saved;
        if self.saved.is_none() {
            self.direction = Direction::Forward;
        }
        Ok(())
    }
}

impl<E: Debug + From<Error>, C: Cursor<Error = E>, S: ReadSample> Cursor
    for AddressCursor<C, E, S>
{
    type Error = E;

    fn seek_to_first(&mut self) -> Result<(), E> {
        self.direction = Direction::Forward;
        self.skip_key = None;
        self.saved = None;
        self.cursor.seek_to_first()
    }

    fn seek_to_last(&mut self) -> Result<(), E> {
        self.direction = Direction::Reverse;
        self.skip_key = None;
        self.saved = None;
        self.cursor.seek_to_last()
    }

    fn seek(&mut self, key: &[u8]) -> Result<(), E> {
        self.direction = Direction::Forward;
        self.skip_key = None;
        self.saved = None;
        self.cursor.seek(key)?;
        self.find_next_user_entry()
    }

    fn prev(&mut self) -> Result<(), E> {
        if self.direction == Direction::Forward {
            // The inner cursor is at the current entry.  Walk it back until the user key changes
            // so the reverse scan starts just before the current group.
            if let Some(kr) = self.cursor.key() {
                let saved_key = kr.key.to_vec();
                loop {
                    self.cursor.prev()?;
                    match self.cursor.key() {
                        Some(kr) => {
                            if compare_bytes(kr.key, &saved_key) == Ordering::Less {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
            self.direction = Direction::Reverse;
        }
        self.find_prev_user_entry()
    }

    fn next(&mut self) -> Result<(), E> {
        if self.direction == Direction::Reverse {
            // The inner cursor is just before the current group; step into it and skip the
            // remainder of the current key.
            self.direction = Direction::Forward;
            self.skip_key = self.saved.take().map(|saved| saved.key);
            self.cursor.next()?;
        } else {
            match self.cursor.key() {
                Some(kr) => {
                    self.skip_key = Some(kr.key.to_vec());
                }
                None => {
                    self.skip_key = None;
                }
            }
            self.cursor.next()?;
        }
        self.find_next_user_entry()
    }

    fn key(&self) -> Option<KeyRef> {
        match self.direction {
            Direction::Forward => self.cursor.key(),
            Direction::Reverse => self.saved.as_ref().map(|saved| KeyRef {
                key: &saved.key,
                timestamp: saved.timestamp,
            }),
        }
    }

    fn value(&self) -> Option<&[u8]> {
        match self.direction {
            Direction::Forward => self.cursor.value(),
            Direction::Reverse => self.saved.as_ref().map(|saved| saved.addr.as_slice()),
        }
    }
}

fn random_period(guac: &mut Guacamole) -> u64 {
    let mut buf = [0u8; 8];
    guac.generate(&mut buf);
    u64::from_le_bytes(buf) % (2 * READ_BYTES_PERIOD)
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
