//! On-disk layout of the journal header.
//!
//! Every multi-byte integer is stored big-endian. The header is laid out as
//! follows:
//!
//! ```text
//! +---------------------------+ 0
//! | Envelope (56 bytes)       |  magic, version, geometry, creation time
//! +---------------------------+ 56
//! | State slot 0 (72 bytes)   |
//! +---------------------------+ 128
//! | State slot 1 (72 bytes)   |
//! +---------------------------+ 200
//! | User data                 |  user_data_size bytes
//! +---------------------------+
//! ```
//!
//! A state slot is:
//!
//! ```text
//! committed_transaction_id: u64 | num_pages: u32 | seal: u32 |
//! modification_time: i64 | confirmed_records | unconfirmed_records |
//! fill_pages | pre_fill_pages            (each list: first, last, count: u32)
//! ```
//!
//! The seal word holds the CRC-32 of the rest of the slot when the slot is
//! the committed one, and its complement when the slot is a working copy.

use super::error::{HeaderError, HeaderResult};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISO_HDLC};
use std::ops::Range;

/// Signature at the start of every journal header ("JRNL").
pub const MAGIC: u32 = 0x4A52_4E4C;

/// Current header format version.
pub const FORMAT_VERSION: u32 = 1;

/// Marks an absent page or record handle.
pub const INVALID_HANDLE: u32 = u32::MAX;

pub const ENVELOPE_SIZE: usize = 56;
pub const STATE_SIZE: usize = 72;
pub const USER_DATA_OFFSET: usize = ENVELOPE_SIZE + 2 * STATE_SIZE;

const SEAL_OFFSET: usize = 12;

static SEAL_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Head, tail and length of a linked list of pages or records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListDescriptor {
    pub first: u32,
    pub last: u32,
    pub count: u32,
}

impl ListDescriptor {
    pub const EMPTY: ListDescriptor = ListDescriptor {
        first: INVALID_HANDLE,
        last: INVALID_HANDLE,
        count: 0,
    };

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

impl Default for ListDescriptor {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// The logical state of the journal held in one slot of the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeaderState {
    pub committed_transaction_id: u64,
    pub num_pages: u32,
    pub modification_time: i64,
    pub confirmed_records: ListDescriptor,
    pub unconfirmed_records: ListDescriptor,
    pub fill_pages: ListDescriptor,
    pub pre_fill_pages: ListDescriptor,
}

/// Immutable header fields written once when the journal is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub version: u32,
    pub header_size: u32,
    pub pages_per_set: u32,
    pub blocks_per_page: u32,
    pub block_size: u32,
    pub free_block_threshold: u32,
    pub page_header_size: u32,
    pub page_data_size: u32,
    pub alignment: u32,
    pub creation_time: i64,
    pub user_data_size: u32,
}

/// How a state slot is sealed when written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Seal {
    /// The durable record of the last commit.
    Committed,
    /// The mutable working copy; never chosen by recovery.
    Working,
}

pub fn state_range(slot: usize) -> Range<usize> {
    debug_assert!(slot < 2);
    let start = ENVELOPE_SIZE + slot * STATE_SIZE;
    start..start + STATE_SIZE
}

pub fn user_data_range(user_data_size: u32) -> Range<usize> {
    USER_DATA_OFFSET..USER_DATA_OFFSET + user_data_size as usize
}

pub fn check_len(buf: &[u8], required: usize) -> HeaderResult<()> {
    if buf.len() < required {
        return Err(HeaderError::BufferTooSmall {
            required,
            actual: buf.len(),
        });
    }
    Ok(())
}

pub fn encode_envelope(envelope: &Envelope, buf: &mut [u8]) -> HeaderResult<()> {
    check_len(buf, ENVELOPE_SIZE)?;
    let mut w = &mut buf[..ENVELOPE_SIZE];
    w.write_u32::<BigEndian>(MAGIC)?;
    w.write_u32::<BigEndian>(envelope.version)?;
    w.write_u32::<BigEndian>(envelope.header_size)?;
    w.write_u32::<BigEndian>(envelope.pages_per_set)?;
    w.write_u32::<BigEndian>(envelope.blocks_per_page)?;
    w.write_u32::<BigEndian>(envelope.block_size)?;
    w.write_u32::<BigEndian>(envelope.free_block_threshold)?;
    w.write_u32::<BigEndian>(envelope.page_header_size)?;
    w.write_u32::<BigEndian>(envelope.page_data_size)?;
    w.write_u32::<BigEndian>(envelope.alignment)?;
    w.write_i64::<BigEndian>(envelope.creation_time)?;
    w.write_u32::<BigEndian>(envelope.user_data_size)?;
    w.write_u32::<BigEndian>(0)?;
    Ok(())
}

pub fn decode_envelope(buf: &[u8]) -> HeaderResult<Envelope> {
    check_len(buf, ENVELOPE_SIZE)?;
    let mut r = &buf[..ENVELOPE_SIZE];
    let magic = r.read_u32::<BigEndian>()?;
    if magic != MAGIC {
        return Err(HeaderError::BadMagic { found: magic });
    }
    let version = r.read_u32::<BigEndian>()?;
    if version != FORMAT_VERSION {
        return Err(HeaderError::UnsupportedVersion { found: version });
    }

    Ok(Envelope {
        version,
        header_size: r.read_u32::<BigEndian>()?,
        pages_per_set: r.read_u32::<BigEndian>()?,
        blocks_per_page: r.read_u32::<BigEndian>()?,
        block_size: r.read_u32::<BigEndian>()?,
        free_block_threshold: r.read_u32::<BigEndian>()?,
        page_header_size: r.read_u32::<BigEndian>()?,
        page_data_size: r.read_u32::<BigEndian>()?,
        alignment: r.read_u32::<BigEndian>()?,
        creation_time: r.read_i64::<BigEndian>()?,
        user_data_size: r.read_u32::<BigEndian>()?,
    })
}

fn write_list(w: &mut &mut [u8], list: &ListDescriptor) -> HeaderResult<()> {
    w.write_u32::<BigEndian>(list.first)?;
    w.write_u32::<BigEndian>(list.last)?;
    w.write_u32::<BigEndian>(list.count)?;
    Ok(())
}

fn read_list(r: &mut &[u8]) -> HeaderResult<ListDescriptor> {
    Ok(ListDescriptor {
        first: r.read_u32::<BigEndian>()?,
        last: r.read_u32::<BigEndian>()?,
        count: r.read_u32::<BigEndian>()?,
    })
}

/// Encodes a state slot into exactly `STATE_SIZE` bytes at the start of `buf`.
pub fn encode_state(state: &HeaderState, seal: Seal, buf: &mut [u8]) -> HeaderResult<()> {
    check_len(buf, STATE_SIZE)?;
    let slot = &mut buf[..STATE_SIZE];
    {
        let mut w = &mut slot[..];
        w.write_u64::<BigEndian>(state.committed_transaction_id)?;
        w.write_u32::<BigEndian>(state.num_pages)?;
        w.write_u32::<BigEndian>(0)?;
        w.write_i64::<BigEndian>(state.modification_time)?;
        write_list(&mut w, &state.confirmed_records)?;
        write_list(&mut w, &state.unconfirmed_records)?;
        write_list(&mut w, &state.fill_pages)?;
        write_list(&mut w, &state.pre_fill_pages)?;
    }

    let crc = SEAL_CRC.checksum(slot);
    let word = match seal {
        Seal::Committed => crc,
        Seal::Working => !crc,
    };
    let mut w = &mut slot[SEAL_OFFSET..SEAL_OFFSET + 4];
    w.write_u32::<BigEndian>(word)?;
    Ok(())
}

/// Decodes a state slot and reports whether it carries a valid committed
/// seal.
pub fn decode_state(buf: &[u8]) -> HeaderResult<(HeaderState, bool)> {
    check_len(buf, STATE_SIZE)?;
    let mut r = &buf[..STATE_SIZE];
    let committed_transaction_id = r.read_u64::<BigEndian>()?;
    let num_pages = r.read_u32::<BigEndian>()?;
    let seal = r.read_u32::<BigEndian>()?;
    let state = HeaderState {
        committed_transaction_id,
        num_pages,
        modification_time: r.read_i64::<BigEndian>()?,
        confirmed_records: read_list(&mut r)?,
        unconfirmed_records: read_list(&mut r)?,
        fill_pages: read_list(&mut r)?,
        pre_fill_pages: read_list(&mut r)?,
    };

    let mut digest = SEAL_CRC.digest();
    digest.update(&buf[..SEAL_OFFSET]);
    digest.update(&[0u8; 4]);
    digest.update(&buf[SEAL_OFFSET + 4..STATE_SIZE]);
    Ok((state, digest.finalize() == seal))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> HeaderState {
        HeaderState {
            committed_transaction_id: 0x0102_0304_0506_0708,
            num_pages: 12,
            modification_time: -5,
            confirmed_records: ListDescriptor {
                first: 1,
                last: 9,
                count: 4,
            },
            unconfirmed_records: ListDescriptor::EMPTY,
            fill_pages: ListDescriptor {
                first: 3,
                last: 3,
                count: 1,
            },
            pre_fill_pages: ListDescriptor::EMPTY,
        }
    }

    fn sample_envelope() -> Envelope {
        Envelope {
            version: FORMAT_VERSION,
            header_size: 4096,
            pages_per_set: 256,
            blocks_per_page: 64,
            block_size: 128,
            free_block_threshold: 2,
            page_header_size: 32,
            page_data_size: 8192,
            alignment: 8,
            creation_time: 1_700_000_000,
            user_data_size: 8,
        }
    }

    #[test]
    fn test_layout_constants() {
        assert_eq!(state_range(0), 56..128);
        assert_eq!(state_range(1), 128..200);
        assert_eq!(USER_DATA_OFFSET, 200);
        assert_eq!(user_data_range(8), 200..208);
    }

    #[test]
    fn test_envelope_is_big_endian() -> HeaderResult<()> {
        let mut buf = [0u8; ENVELOPE_SIZE];
        encode_envelope(&sample_envelope(), &mut buf)?;

        assert_eq!(&buf[0..4], b"JRNL");
        assert_eq!(&buf[8..12], &4096u32.to_be_bytes());
        assert_eq!(decode_envelope(&buf)?, sample_envelope());
        Ok(())
    }

    #[test]
    fn test_envelope_rejects_bad_magic_and_version() -> HeaderResult<()> {
        let mut buf = [0u8; ENVELOPE_SIZE];
        assert!(matches!(
            decode_envelope(&buf),
            Err(HeaderError::BadMagic { found: 0 })
        ));

        encode_envelope(&sample_envelope(), &mut buf)?;
        buf[4..8].copy_from_slice(&99u32.to_be_bytes());
        assert!(matches!(
            decode_envelope(&buf),
            Err(HeaderError::UnsupportedVersion { found: 99 })
        ));
        Ok(())
    }

    #[test]
    fn test_short_buffer_is_rejected() {
        let mut buf = [0u8; 10];
        assert!(matches!(
            encode_state(&HeaderState::default(), Seal::Committed, &mut buf),
            Err(HeaderError::BufferTooSmall {
                required: STATE_SIZE,
                actual: 10
            })
        ));
        assert!(decode_envelope(&buf).is_err());
    }

    #[test]
    fn test_committed_seal_verifies() -> HeaderResult<()> {
        let mut buf = [0u8; STATE_SIZE];
        encode_state(&sample_state(), Seal::Committed, &mut buf)?;

        assert_eq!(&buf[0..8], &0x0102_0304_0506_0708u64.to_be_bytes());
        let (state, sealed) = decode_state(&buf)?;
        assert!(sealed);
        assert_eq!(state, sample_state());
        Ok(())
    }

    #[test]
    fn test_working_seal_does_not_verify() -> HeaderResult<()> {
        let mut buf = [0u8; STATE_SIZE];
        encode_state(&sample_state(), Seal::Working, &mut buf)?;

        let (state, sealed) = decode_state(&buf)?;
        assert!(!sealed);
        assert_eq!(state, sample_state());
        Ok(())
    }

    #[test]
    fn test_torn_slot_does_not_verify() -> HeaderResult<()> {
        let mut buf = [0u8; STATE_SIZE];
        encode_state(&sample_state(), Seal::Committed, &mut buf)?;
        buf[40] ^= 0x10;

        let (_, sealed) = decode_state(&buf)?;
        assert!(!sealed);

        let zeroed = [0u8; STATE_SIZE];
        let (_, sealed) = decode_state(&zeroed)?;
        assert!(!sealed);
        Ok(())
    }
}
