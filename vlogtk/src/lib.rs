//! vlogtk provides the value half of a key-value-separated LSM tree.  Values live in append-only
//! value logs ("vlogs") and the tree stores varint-packed value addresses.  This crate provides
//! the framed record codec, the write-buffered append path, the random-access fetch path, a
//! recovery scan, and cursors that resolve addresses at a snapshot and prefetch values in
//! parallel.

use std::fmt::{Debug, Display, Formatter};

use biometrics::{Collector, Counter};
use buffertk::{stack_pack, v64, Packable, Unpackable};
use prototk_derive::Message;
use tatl::{HeyListen, Stationary};
use zerror::{iotoz, Z};
use zerror_core::ErrorCore;

pub mod address_cursor;
pub mod concurrent_cursor;
pub mod manager;
pub mod recover;
pub mod reference;
pub mod vlog;

pub use address_cursor::{AddressCursor, ReadSample};
pub use concurrent_cursor::{ConcurrentCursor, PrefetchOptions};
pub use manager::{FetchValue, VlogManager};
pub use recover::{VlogReader, VlogRecord};
pub use vlog::Vlog;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static CORRUPTION: Counter = Counter::new("vlogtk.corruption");
static CORRUPTION_MONITOR: Stationary = Stationary::new("vlogtk.corruption", &CORRUPTION);

/// Register this crate's biometrics.
pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&CORRUPTION);
    concurrent_cursor::register_biometrics(collector);
    manager::register_biometrics(collector);
    recover::register_biometrics(collector);
    vlog::register_biometrics(collector);
}

/// Register this crate's monitors.
pub fn register_monitors(hey_listen: &mut HeyListen) {
    hey_listen.register_stationary(&CORRUPTION_MONITOR);
}

/// The indicio collector for this crate.
pub static COLLECTOR: indicio::Collector = indicio::Collector::new();

///////////////////////////////////////////// Constants ////////////////////////////////////////////

/// The number of bytes in a vlog frame header:  a masked crc32c over the payload followed by the
/// payload length, both little-endian.
pub const VLOG_HEADER_SIZE: usize = 12;

/// The fixed size of a vlog's user-space write buffer.  Frames that fit coalesce here before
/// hitting the file; frames that don't bypass the buffer entirely.
pub const WRITE_BUFFER_SIZE: usize = 4096;

/// The payload tag for a value record.  No other tag is accepted.
pub const TYPE_VALUE: u8 = 0x01;

/// Records larger than this are assumed to be corruption on the recovery path.
pub const MAX_RECORD_SIZE: u64 = 1 << 30;

/////////////////////////////////////////////// Error //////////////////////////////////////////////

/// Error captures the ways a vlog operation can fail.
#[derive(Clone, Debug, Message)]
pub enum Error {
    #[prototk(475136, message)]
    Success {
        #[prototk(1, message)]
        core: ErrorCore,
    },
    #[prototk(475137, message)]
    Corruption {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        context: String,
    },
    #[prototk(475138, message)]
    Crc32cFailure {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, fixed32)]
        expected: u32,
        #[prototk(3, fixed32)]
        returned: u32,
    },
    #[prototk(475139, message)]
    VlogNotFound {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, uint64)]
        file_number: u64,
    },
    #[prototk(475140, message)]
    UnpackError {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, message)]
        error: prototk::Error,
        #[prototk(3, string)]
        context: String,
    },
    #[prototk(475141, message)]
    SystemError {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        what: String,
    },
    #[prototk(475142, message)]
    LogicError {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, string)]
        context: String,
    },
}

impl Error {
    fn core(&self) -> &ErrorCore {
        match self {
            Error::Success { core, .. } => core,
            Error::Corruption { core, .. } => core,
            Error::Crc32cFailure { core, .. } => core,
            Error::VlogNotFound { core, .. } => core,
            Error::UnpackError { core, .. } => core,
            Error::SystemError { core, .. } => core,
            Error::LogicError { core, .. } => core,
        }
    }

    fn core_mut(&mut self) -> &mut ErrorCore {
        match self {
            Error::Success { core, .. } => core,
            Error::Corruption { core, .. } => core,
            Error::Crc32cFailure { core, .. } => core,
            Error::VlogNotFound { core, .. } => core,
            Error::UnpackError { core, .. } => core,
            Error::SystemError { core, .. } => core,
            Error::LogicError { core, .. } => core,
        }
    }
}

impl Default for Error {
    fn default() -> Self {
        Error::Success {
            core: ErrorCore::default(),
        }
    }
}

impl Display for Error {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            Error::Success { core: _ } => fmt.debug_struct("Success").finish(),
            Error::Corruption { core: _, context } => fmt
                .debug_struct("Corruption")
                .field("context", context)
                .finish(),
            Error::Crc32cFailure {
                core: _,
                expected,
                returned,
            } => fmt
                .debug_struct("Crc32cFailure")
                .field("expected", expected)
                .field("returned", returned)
                .finish(),
            Error::VlogNotFound {
                core: _,
                file_number,
            } => fmt
                .debug_struct("VlogNotFound")
                .field("file_number", file_number)
                .finish(),
            Error::UnpackError {
                core: _,
                error,
                context,
            } => fmt
                .debug_struct("UnpackError")
                .field("error", error)
                .field("context", context)
                .finish(),
            Error::SystemError { core: _, what } => fmt
                .debug_struct("SystemError")
                .field("what", what)
                .finish(),
            Error::LogicError { core: _, context } => fmt
                .debug_struct("LogicError")
                .field("context", context)
                .finish(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(what: std::io::Error) -> Error {
        Error::SystemError {
            core: ErrorCore::default(),
            what: format!("{:?}", what),
        }
    }
}

impl From<buffertk::Error> for Error {
    fn from(error: buffertk::Error) -> Error {
        let err: prototk::Error = error.into();
        Error::from(err)
    }
}

impl From<prototk::Error> for Error {
    fn from(error: prototk::Error) -> Error {
        Error::UnpackError {
            core: ErrorCore::default(),
            error,
            context: "From<prototk::Error>".to_owned(),
        }
    }
}

impl Z for Error {
    type Error = Self;

    fn long_form(&self) -> String {
        format!("{}", self) + "\n" + &self.core().long_form()
    }

    fn with_info<X: Debug>(mut self, name: &str, value: X) -> Self::Error {
        self.core_mut().set_info(name, value);
        self
    }

    fn with_lazy_info<F: FnOnce() -> String>(mut self, name: &str, value: F) -> Self::Error {
        self.core_mut().set_lazy_info(name, value);
        self
    }
}

iotoz! {Error}

pub(crate) fn corruption(context: &str) -> Error {
    CORRUPTION.click();
    Error::Corruption {
        core: ErrorCore::default(),
        context: context.to_owned(),
    }
}

pub(crate) fn logic_error(context: &str) -> Error {
    Error::LogicError {
        core: ErrorCore::default(),
        context: context.to_owned(),
    }
}

//////////////////////////////////////////// crc masking ///////////////////////////////////////////

const CRC_MASK_DELTA: u32 = 0xa282ead8;

/// Mask a crc32c for storage.  Storing crcs of byte strings that themselves embed crcs makes
/// undetected corruption more likely, so the stored form is rotated and offset.
pub fn mask_crc(crc: u32) -> u32 {
    ((crc >> 15) | (crc << 17)).wrapping_add(CRC_MASK_DELTA)
}

/// Invert [mask_crc].
pub fn unmask_crc(masked: u32) -> u32 {
    let rot = masked.wrapping_sub(CRC_MASK_DELTA);
    (rot >> 17) | (rot << 15)
}

///////////////////////////////////////////// framing //////////////////////////////////////////////

/// Construct the 12-byte frame header for a payload.
pub fn frame_header(payload: &[u8]) -> [u8; VLOG_HEADER_SIZE] {
    let mut header = [0u8; VLOG_HEADER_SIZE];
    let crc = mask_crc(crc32c::crc32c(payload));
    header[0..4].copy_from_slice(&crc.to_le_bytes());
    header[4..12].copy_from_slice(&(payload.len() as u64).to_le_bytes());
    header
}

/// Frame a payload as it appears in a vlog: `masked crc32c (4 LE) || length (8 LE) || payload`.
pub fn frame_record(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(VLOG_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&frame_header(payload));
    frame.extend_from_slice(payload);
    frame
}

/// Split a frame header into the expected (unmasked) crc32c and the payload length.
pub fn decode_frame_header(header: &[u8]) -> Result<(u32, u64), Error> {
    if header.len() < VLOG_HEADER_SIZE {
        return Err(corruption("vlog frame header is short"));
    }
    let crc = u32::from_le_bytes(header[0..4].try_into().expect("slice is four bytes"));
    let length = u64::from_le_bytes(header[4..12].try_into().expect("slice is eight bytes"));
    Ok((unmask_crc(crc), length))
}

////////////////////////////////////////////// payload /////////////////////////////////////////////

/// Encode a payload: `0x01 || varint(len(key)) || key || varint(len(value)) || value`.
pub fn encode_payload(key: &[u8], value: &[u8]) -> Vec<u8> {
    let key_sz: v64 = key.len().into();
    let value_sz: v64 = value.len().into();
    let mut payload =
        Vec::with_capacity(1 + key_sz.pack_sz() + key.len() + value_sz.pack_sz() + value.len());
    payload.push(TYPE_VALUE);
    stack_pack(key_sz).append_to_vec(&mut payload);
    payload.extend_from_slice(key);
    stack_pack(value_sz).append_to_vec(&mut payload);
    payload.extend_from_slice(value);
    payload
}

/// Decode a payload into its key and value.  The payload must be consumed exactly.
pub fn parse_payload(payload: &[u8]) -> Result<(&[u8], &[u8]), Error> {
    if payload.first() != Some(&TYPE_VALUE) {
        return Err(corruption("failed to decode value from vlog"));
    }
    let (key, payload) = parse_length_prefixed(&payload[1..])?;
    let (value, payload) = parse_length_prefixed(payload)?;
    if !payload.is_empty() {
        return Err(corruption("failed to decode value from vlog"));
    }
    Ok((key, value))
}

fn parse_length_prefixed(buf: &[u8]) -> Result<(&[u8], &[u8]), Error> {
    let (length, buf) =
        v64::unpack(buf).map_err(|_| corruption("failed to decode value from vlog"))?;
    let length: usize = length.into();
    if buf.len() < length {
        return Err(corruption("failed to decode value from vlog"));
    }
    Ok((&buf[..length], &buf[length..]))
}

/////////////////////////////////////////// ValueAddress ///////////////////////////////////////////

/// The location of one framed payload:  which vlog, the offset of the payload within it, and the
/// payload's size in bytes.  Addresses point at payloads, never at frame headers.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ValueAddress {
    /// The number of the vlog holding the payload.
    pub file_number: u64,
    /// The file offset of the payload.  The frame header sits at `offset - 12`.
    pub offset: u64,
    /// The size of the payload in bytes.
    pub size: u64,
}

impl ValueAddress {
    /// Pack the address as three concatenated varints, no framing.
    pub fn pack(&self) -> Vec<u8> {
        let file_number: v64 = self.file_number.into();
        let offset: v64 = self.offset.into();
        let size: v64 = self.size.into();
        stack_pack(file_number).pack(offset).pack(size).to_vec()
    }

    /// Unpack an address, consuming exactly the bytes the three varints occupy.  Returns the
    /// address and whatever trails it.
    pub fn unpack(buf: &[u8]) -> Result<(Self, &[u8]), Error> {
        let (file_number, buf) =
            v64::unpack(buf).map_err(|_| corruption("failed to decode value address"))?;
        let (offset, buf) =
            v64::unpack(buf).map_err(|_| corruption("failed to decode value address"))?;
        let (size, buf) =
            v64::unpack(buf).map_err(|_| corruption("failed to decode value address"))?;
        let address = ValueAddress {
            file_number: file_number.into(),
            offset: offset.into(),
            size: size.into(),
        };
        Ok((address, buf))
    }
}

//////////////////////////////////////////// VlogOptions ///////////////////////////////////////////

/// Options for opening vlogs.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VlogOptions {
    pub(crate) value_cache: bool,
    pub(crate) verify_checksums: bool,
}

impl VlogOptions {
    /// Enable or disable the per-vlog direct-mapped value cache.
    pub fn value_cache(mut self, value_cache: bool) -> Self {
        self.value_cache = value_cache;
        self
    }

    /// Enable or disable checksum verification on the recovery path.
    pub fn verify_checksums(mut self, verify_checksums: bool) -> Self {
        self.verify_checksums = verify_checksums;
        self
    }
}

impl Default for VlogOptions {
    fn default() -> Self {
        Self {
            value_cache: true,
            verify_checksums: true,
        }
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u64_is_usize() {
        assert_eq!(u64::BITS, usize::BITS);
    }

    mod masking {
        use super::*;

        #[test]
        fn round_trip() {
            let crc = crc32c::crc32c("foo".as_bytes());
            assert_ne!(crc, mask_crc(crc));
            assert_ne!(crc, mask_crc(mask_crc(crc)));
            assert_eq!(crc, unmask_crc(mask_crc(crc)));
            assert_eq!(crc, unmask_crc(unmask_crc(mask_crc(mask_crc(crc)))));
        }

        #[test]
        fn round_trip_exhaustive_boundaries() {
            for crc in [0u32, 1, 0x7fffffff, 0x80000000, 0xa282ead8, u32::MAX] {
                assert_eq!(crc, unmask_crc(mask_crc(crc)));
            }
        }
    }

    mod checksums {
        // Tests of crc32c borrowed from the LevelDB library.  Used to track upstream.
        //
        // Copyright (c) 2011 The LevelDB Authors. All rights reserved.
        // Use of this source code is governed by a BSD-style license that can be
        // found in the LICENSE file. See the AUTHORS file for names of contributors.

        #[test]
        fn standard_results() {
            // From rfc3720 section B.4.
            let buf: [u8; 32] = [0u8; 32];
            assert_eq!(0x8a9136aa, crc32c::crc32c(&buf));

            let buf: [u8; 32] = [0xffu8; 32];
            assert_eq!(0x62a8ab43, crc32c::crc32c(&buf));

            let mut buf: [u8; 32] = [0; 32];
            for (i, b) in buf.iter_mut().enumerate() {
                *b = i as u8;
            }
            assert_eq!(0x46dd794e, crc32c::crc32c(&buf));
        }
    }

    mod framing {
        use super::*;

        #[test]
        fn frame_layout() {
            let payload: &[u8] = &[1, 2, 3, 4, 5];
            let frame = frame_record(payload);
            assert_eq!(VLOG_HEADER_SIZE + payload.len(), frame.len());
            let expected_crc = mask_crc(crc32c::crc32c(payload));
            assert_eq!(expected_crc.to_le_bytes(), frame[0..4]);
            assert_eq!(5u64.to_le_bytes(), frame[4..12]);
            assert_eq!(payload, &frame[12..]);
        }

        #[test]
        fn header_round_trip() {
            let payload: &[u8] = &[42u8; 137];
            let header = frame_header(payload);
            let (crc, length) = decode_frame_header(&header).unwrap();
            assert_eq!(crc32c::crc32c(payload), crc);
            assert_eq!(137, length);
        }

        #[test]
        fn short_header() {
            assert!(decode_frame_header(&[0u8; 11]).is_err());
        }
    }

    mod payload {
        use super::*;

        #[test]
        fn layout() {
            let payload = encode_payload("foo".as_bytes(), "bar".as_bytes());
            let exp: &[u8] = &[
                1, // TYPE_VALUE
                3, b'f', b'o', b'o', // key
                3, b'b', b'a', b'r', // value
            ];
            assert_eq!(exp, &payload);
        }

        #[test]
        fn round_trip() {
            let payload = encode_payload("some key".as_bytes(), "some value".as_bytes());
            let (key, value) = parse_payload(&payload).unwrap();
            assert_eq!("some key".as_bytes(), key);
            assert_eq!("some value".as_bytes(), value);
        }

        #[test]
        fn empty_key_and_value() {
            let payload = encode_payload(&[], &[]);
            let exp: &[u8] = &[1, 0, 0];
            assert_eq!(exp, &payload);
            let (key, value) = parse_payload(&payload).unwrap();
            assert!(key.is_empty());
            assert!(value.is_empty());
        }

        #[test]
        fn bad_type_byte() {
            let mut payload = encode_payload("k".as_bytes(), "v".as_bytes());
            payload[0] = 0x02;
            assert!(parse_payload(&payload).is_err());
        }

        #[test]
        fn truncated_value() {
            let payload = encode_payload("k".as_bytes(), "v".as_bytes());
            assert!(parse_payload(&payload[..payload.len() - 1]).is_err());
        }

        #[test]
        fn trailing_garbage() {
            let mut payload = encode_payload("k".as_bytes(), "v".as_bytes());
            payload.push(0xff);
            assert!(parse_payload(&payload).is_err());
        }
    }

    mod address {
        use super::*;

        #[test]
        fn pack_small() {
            let addr = ValueAddress {
                file_number: 7,
                offset: 12,
                size: 9,
            };
            let exp: &[u8] = &[7, 12, 9];
            assert_eq!(exp, &addr.pack());
        }

        #[test]
        fn round_trip() {
            let addr = ValueAddress {
                file_number: 300,
                offset: 1 << 40,
                size: 65536,
            };
            let buf = addr.pack();
            let (got, rem) = ValueAddress::unpack(&buf).unwrap();
            assert_eq!(addr, got);
            assert!(rem.is_empty());
        }

        #[test]
        fn trailing_bytes_are_returned() {
            let addr = ValueAddress {
                file_number: 1,
                offset: 2,
                size: 3,
            };
            let mut buf = addr.pack();
            buf.extend_from_slice(&[0xde, 0xad]);
            let (got, rem) = ValueAddress::unpack(&buf).unwrap();
            assert_eq!(addr, got);
            assert_eq!(&[0xde, 0xad], rem);
        }

        #[test]
        fn garbage() {
            // A lone continuation bit runs off the end of the buffer.
            assert!(ValueAddress::unpack(&[0x80]).is_err());
        }
    }
}
