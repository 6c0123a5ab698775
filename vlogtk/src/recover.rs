//! Sequential recovery scan over a vlog.  After a crash the LSM replays a vlog from its last
//! known-durable offset, reinserting each record's address; the scan stops cleanly at the
//! truncated tail the buffered writer can leave behind.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom};
use std::path::Path;

use biometrics::{Collector, Counter};
use indicio::{clue, WARNING};
use zerror::Z;
use zerror_core::ErrorCore;

use super::{
    corruption, decode_frame_header, parse_payload, Error, IoToZ, ValueAddress, VlogOptions,
    COLLECTOR, MAX_RECORD_SIZE, VLOG_HEADER_SIZE,
};

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static RECOVER_RECORDS: Counter = Counter::new("vlogtk.recover.records");
static RECOVER_TRUNCATED: Counter = Counter::new("vlogtk.recover.truncated");

/// Register the biometrics for this module.
pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&RECOVER_RECORDS);
    collector.register_counter(&RECOVER_TRUNCATED);
}

///////////////////////////////////////////// Constants ////////////////////////////////////////////

const RECOVERY_BUFFER_SIZE: usize = 1 << 15;

///////////////////////////////////////////// VlogRecord ///////////////////////////////////////////

/// One record pulled off a vlog by the recovery scan.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VlogRecord {
    /// The file offset of the record's payload.
    pub offset: u64,
    /// The payload's length in bytes.
    pub length: u64,
    /// The user key of the record.
    pub key: Vec<u8>,
    /// The user value of the record.
    pub value: Vec<u8>,
}

impl VlogRecord {
    /// The address this record would be stored under in the given vlog.
    pub fn address(&self, file_number: u64) -> ValueAddress {
        ValueAddress {
            file_number,
            offset: self.offset,
            size: self.length,
        }
    }
}

///////////////////////////////////////////// VlogReader ///////////////////////////////////////////

/// A sequential reader over a vlog's framed records.
pub struct VlogReader {
    input: BufReader<File>,
    offset: u64,
    verify_checksums: bool,
}

impl VlogReader {
    /// Open the vlog at `path` for a sequential scan from offset zero.
    pub fn open<P: AsRef<Path>>(options: &VlogOptions, path: P) -> Result<Self, Error> {
        let file = OpenOptions::new()
            .read(true)
            .open(path.as_ref())
            .as_z()
            .with_info("path", path.as_ref())?;
        let input = BufReader::with_capacity(RECOVERY_BUFFER_SIZE, file);
        Ok(Self {
            input,
            offset: 0,
            verify_checksums: options.verify_checksums,
        })
    }

    /// Resume scanning at a known offset.  The offset must name a frame header.
    pub fn jump_to(&mut self, offset: u64) -> Result<(), Error> {
        self.input.seek(SeekFrom::Start(offset)).as_z()?;
        self.offset = offset;
        Ok(())
    }

    /// Return the next record, or None once the log is exhausted.  A final record cut short by a
    /// crash ends the scan as if the log ended before it.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<Option<VlogRecord>, Error> {
        let mut header = [0u8; VLOG_HEADER_SIZE];
        match self.input.read_exact(&mut header) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
                return Ok(None);
            }
            Err(err) => {
                return Err(err.into());
            }
        }
        let (expected, length) = decode_frame_header(&header)?;
        if length > MAX_RECORD_SIZE {
            return Err(corruption("record length exceeds MAX_RECORD_SIZE")
                .with_info("length", length)
                .with_info("offset", self.offset));
        }
        let mut payload = vec![0u8; length as usize];
        match self.input.read_exact(&mut payload) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
                RECOVER_TRUNCATED.click();
                clue!(COLLECTOR, WARNING, {
                    truncated_record: self.offset,
                });
                return Ok(None);
            }
            Err(err) => {
                return Err(err.into());
            }
        }
        if self.verify_checksums {
            let returned = crc32c::crc32c(&payload);
            if returned != expected {
                return Err(Error::Crc32cFailure {
                    core: ErrorCore::default(),
                    expected,
                    returned,
                }
                .with_info("offset", self.offset));
            }
        }
        let (key, value) = parse_payload(&payload)?;
        let record = VlogRecord {
            offset: self.offset + VLOG_HEADER_SIZE as u64,
            length,
            key: key.to_vec(),
            value: value.to_vec(),
        };
        self.offset += VLOG_HEADER_SIZE as u64 + length;
        RECOVER_RECORDS.click();
        Ok(Some(record))
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
