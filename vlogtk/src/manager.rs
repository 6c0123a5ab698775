//! Routing of appends and fetches to the right vlog.  The manager owns every open vlog, keyed by
//! file number, and designates one of them to receive new records.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use biometrics::{Collector, Counter};
use indicio::{clue, INFO};
use zerror::Z;
use zerror_core::ErrorCore;

use super::vlog::Vlog;
use super::{
    corruption, logic_error, Error, IoToZ, ValueAddress, VlogOptions, COLLECTOR,
};

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static MANAGER_ADD_VLOG: Counter = Counter::new("vlogtk.manager.add_vlog");
static MANAGER_ROTATE: Counter = Counter::new("vlogtk.manager.rotate");
static MANAGER_ADD_RECORD: Counter = Counter::new("vlogtk.manager.add_record");
static MANAGER_FETCH: Counter = Counter::new("vlogtk.manager.fetch");

/// Register the biometrics for this module.
pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&MANAGER_ADD_VLOG);
    collector.register_counter(&MANAGER_ROTATE);
    collector.register_counter(&MANAGER_ADD_RECORD);
    collector.register_counter(&MANAGER_FETCH);
}

///////////////////////////////////////////// Constants ////////////////////////////////////////////

// Drop counts persist as fixed64 words of (count << 16) | file_number, so file numbers must fit
// sixteen bits.
const MAX_PERSISTED_FILE_NUMBER: u64 = 0xffff;

#[allow(non_snake_case)]
fn VLOG_FILE<P: AsRef<Path>>(root: P, file_number: u64) -> PathBuf {
    root.as_ref().join(format!("{:06}.vlog", file_number))
}

/////////////////////////////////////////// VlogManager ////////////////////////////////////////////

#[derive(Default)]
struct State {
    vlogs: BTreeMap<u64, Arc<Vlog>>,
    current: Option<Arc<Vlog>>,
}

/// VlogManager owns the set of open vlogs and routes appends to the current one and fetches to
/// whichever vlog an address names.
pub struct VlogManager {
    options: VlogOptions,
    root: PathBuf,
    state: Mutex<State>,
}

impl VlogManager {
    /// Create a manager rooted at `root`, creating the directory if necessary.
    pub fn new<P: AsRef<Path>>(options: VlogOptions, root: P) -> Result<Self, Error> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)
            .as_z()
            .with_info("root", &root)?;
        Ok(Self {
            options,
            root,
            state: Mutex::new(State::default()),
        })
    }

    /// Open the vlog with the given file number and make it current.  The prior current's buffer
    /// is flushed before the rotation; re-adding an open number flushes the old entry and then
    /// replaces it.
    pub fn add_vlog(&self, file_number: u64) -> Result<(), Error> {
        MANAGER_ADD_VLOG.click();
        let mut state = self.state.lock().unwrap();
        // Flush an already-open vlog with this number before reopening it, so the replacement's
        // head observes every byte the old entry had buffered.
        if let Some(old) = state.vlogs.get(&file_number) {
            old.flush()?;
        }
        let vlog = Arc::new(Vlog::open(
            &self.options,
            VLOG_FILE(&self.root, file_number),
            file_number,
        )?);
        if let Some(current) = state.current.as_ref() {
            MANAGER_ROTATE.click();
            current.flush()?;
        }
        state.vlogs.insert(file_number, Arc::clone(&vlog));
        state.current = Some(vlog);
        clue!(COLLECTOR, INFO, {
            add_vlog: file_number,
        });
        Ok(())
    }

    /// Select which open vlog receives new records.  Used at recovery time.
    pub fn set_current(&self, file_number: u64) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let vlog = state
            .vlogs
            .get(&file_number)
            .cloned()
            .ok_or_else(|| vlog_not_found(file_number))?;
        state.current = Some(vlog);
        clue!(COLLECTOR, INFO, {
            set_current: file_number,
        });
        Ok(())
    }

    fn current(&self) -> Result<Arc<Vlog>, Error> {
        let state = self.state.lock().unwrap();
        state
            .current
            .clone()
            .ok_or_else(|| logic_error("no current vlog"))
    }

    fn vlog(&self, file_number: u64) -> Option<Arc<Vlog>> {
        let state = self.state.lock().unwrap();
        state.vlogs.get(&file_number).cloned()
    }

    /// The offset at which the next framed record will begin in the current vlog.
    pub fn current_head(&self) -> Result<u64, Error> {
        Ok(self.current()?.head())
    }

    /// Append one payload to the current vlog and return its address.
    pub fn add_record(&self, payload: &[u8]) -> Result<ValueAddress, Error> {
        MANAGER_ADD_RECORD.click();
        let vlog = self.current()?;
        let offset = vlog.append(payload)?;
        Ok(ValueAddress {
            file_number: vlog.number(),
            offset,
            size: payload.len() as u64,
        })
    }

    /// Flush the current vlog's buffer and force it to durable storage.
    pub fn sync(&self) -> Result<(), Error> {
        self.current()?.sync()
    }

    /// Fetch the value a packed address points at.  A successful `add_record` is immediately
    /// fetchable from the same process, even while the payload is still buffered.
    pub fn fetch(&self, addr: &[u8]) -> Result<Vec<u8>, Error> {
        MANAGER_FETCH.click();
        let (addr, _) = ValueAddress::unpack(addr)?;
        let vlog = self
            .vlog(addr.file_number)
            .ok_or_else(|| vlog_not_found(addr.file_number))?;
        vlog.get(addr.offset, addr.size)
    }

    /// Record that one payload in the named vlog has been superseded.  A no-op for vlogs that are
    /// not open.
    pub fn add_drop_count(&self, file_number: u64) {
        if let Some(vlog) = self.vlog(file_number) {
            vlog.add_drop_count();
        }
    }

    /// The superseded-payload count recorded against the named vlog.
    pub fn drop_count(&self, file_number: u64) -> Option<u64> {
        self.vlog(file_number).map(|vlog| vlog.drop_count())
    }

    /// The open vlog numbers, ascending.
    pub fn vlog_numbers(&self) -> Vec<u64> {
        let state = self.state.lock().unwrap();
        state.vlogs.keys().copied().collect()
    }

    /// Encode the drop counts for manifest persistence, or None when no vlogs are open.
    pub fn encode_drop_counts(&self) -> Result<Option<Vec<u8>>, Error> {
        let state = self.state.lock().unwrap();
        if state.vlogs.is_empty() {
            return Ok(None);
        }
        let mut buf = Vec::with_capacity(8 * state.vlogs.len());
        for (file_number, vlog) in state.vlogs.iter() {
            if *file_number > MAX_PERSISTED_FILE_NUMBER {
                return Err(logic_error("vlog file number overflows the drop-count encoding")
                    .with_info("file_number", file_number));
            }
            let word = (vlog.drop_count() << 16) | file_number;
            buf.extend_from_slice(&word.to_le_bytes());
        }
        Ok(Some(buf))
    }

    /// Decode a drop-count blob, restoring counts for vlogs that are still open.  Entries for
    /// since-removed vlogs are ignored.
    pub fn decode_drop_counts(&self, buf: &[u8]) -> Result<(), Error> {
        if buf.len() % 8 != 0 {
            return Err(corruption("drop-count blob is not a multiple of eight bytes"));
        }
        let state = self.state.lock().unwrap();
        for chunk in buf.chunks_exact(8) {
            let word = u64::from_le_bytes(chunk.try_into().expect("chunk is eight bytes"));
            let file_number = word & MAX_PERSISTED_FILE_NUMBER;
            let count = word >> 16;
            if let Some(vlog) = state.vlogs.get(&file_number) {
                vlog.set_drop_count(count);
            }
        }
        Ok(())
    }
}

fn vlog_not_found(file_number: u64) -> Error {
    Error::VlogNotFound {
        core: ErrorCore::default(),
        file_number,
    }
}

///////////////////////////////////////////// FetchValue ///////////////////////////////////////////

/// The seam between the prefetching cursor and the vlog subsystem:  resolve a packed address to
/// value bytes.
pub trait FetchValue {
    /// Fetch the value the packed address points at.
    fn fetch_value(&self, addr: &[u8]) -> Result<Vec<u8>, Error>;
}

impl FetchValue for VlogManager {
    fn fetch_value(&self, addr: &[u8]) -> Result<Vec<u8>, Error> {
        self.fetch(addr)
    }
}

impl<F: FetchValue> FetchValue for Arc<F> {
    fn fetch_value(&self, addr: &[u8]) -> Result<Vec<u8>, Error> {
        F::fetch_value(self, addr)
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
