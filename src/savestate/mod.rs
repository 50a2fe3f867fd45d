//! The savestate file.
//!
//! ```text
//! offset 0   preamble, 64 bytes, little endian
//! offset 64  payload: page chunks in pagemap order
//!            pagemap: one flag byte per page, plus a u32 length for
//!                     compressed pages
//!            meta:    bincode encoded `SavestateMeta`
//! ```
//!
//! Every section is covered by a CRC32 stored in the preamble.

pub mod savestate_reader;
pub mod savestate_writer;

use crate::{
    address_space::memory_region::MemoryRegion, error::Result, file_handles::FileHandle,
};
use libc::pid_t;
use serde::{Deserialize, Serialize};
use std::{
    convert::TryInto,
    path::{Path, PathBuf},
};

pub use savestate_reader::SavestateFile;
pub use savestate_writer::SavestateWriter;

pub const SAVESTATE_MAGIC: [u8; 8] = *b"RWNDSAVE";
pub const SAVESTATE_VERSION: u32 = 1;
pub const PREAMBLE_SIZE: usize = 64;

bitflags! {
    pub struct SavestateFlags: u32 {
        /// Pages may be `Unchanged` and refer to the parent generation.
        const INCREMENTAL = 0x1;
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Preamble {
    pub magic: [u8; 8],
    pub version: u32,
    pub flags: u32,
    pub payload_len: u64,
    pub pagemap_len: u64,
    pub meta_len: u64,
    pub payload_crc: u32,
    pub pagemap_crc: u32,
    pub meta_crc: u32,
    pub reserved: [u8; 12],
}

assert_eq_size!(Preamble, [u8; PREAMBLE_SIZE]);

impl Preamble {
    pub fn to_bytes(&self) -> [u8; PREAMBLE_SIZE] {
        let mut b = [0u8; PREAMBLE_SIZE];
        b[0..8].copy_from_slice(&self.magic);
        b[8..12].copy_from_slice(&self.version.to_le_bytes());
        b[12..16].copy_from_slice(&self.flags.to_le_bytes());
        b[16..24].copy_from_slice(&self.payload_len.to_le_bytes());
        b[24..32].copy_from_slice(&self.pagemap_len.to_le_bytes());
        b[32..40].copy_from_slice(&self.meta_len.to_le_bytes());
        b[40..44].copy_from_slice(&self.payload_crc.to_le_bytes());
        b[44..48].copy_from_slice(&self.pagemap_crc.to_le_bytes());
        b[48..52].copy_from_slice(&self.meta_crc.to_le_bytes());
        b[52..64].copy_from_slice(&self.reserved);
        b
    }

    pub fn from_bytes(b: &[u8; PREAMBLE_SIZE]) -> Preamble {
        let u32_at = |o: usize| u32::from_le_bytes(b[o..o + 4].try_into().unwrap_or_default());
        let u64_at = |o: usize| u64::from_le_bytes(b[o..o + 8].try_into().unwrap_or_default());
        let mut magic = [0u8; 8];
        magic.copy_from_slice(&b[0..8]);
        let mut reserved = [0u8; 12];
        reserved.copy_from_slice(&b[52..64]);
        Preamble {
            magic,
            version: u32_at(8),
            flags: u32_at(12),
            payload_len: u64_at(16),
            pagemap_len: u64_at(24),
            meta_len: u64_at(32),
            payload_crc: u32_at(40),
            pagemap_crc: u32_at(44),
            meta_crc: u32_at(48),
            reserved,
        }
    }

    pub fn flags(&self) -> SavestateFlags {
        SavestateFlags::from_bits_truncate(self.flags)
    }
}

/// Where the `Unchanged` pages of a savestate live.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ParentRef {
    pub generation: u64,
    pub path: PathBuf,
    /// Guards against the parent file having been replaced.
    pub payload_crc: u32,
}

/// Signal mask and machine context of a frozen thread, as raw bytes.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ThreadState {
    pub tid: pid_t,
    pub is_checkpoint_thread: bool,
    pub sigmask: Vec<u8>,
    pub registers: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SavestateHeader {
    pub generation: u64,
    pub parent: Option<ParentRef>,
    /// Number of ancestors; 0 for a full snapshot.
    pub chain_depth: u32,
    pub pid: pid_t,
    /// Seconds since the epoch.
    pub created: u64,
    pub page_size: u32,
    /// Compressed chunks per brotli stream.
    pub block_pages: u32,
    pub threads: Vec<ThreadState>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SavestateMeta {
    pub header: SavestateHeader,
    /// Captured and layout-only regions, in address order.
    pub regions: Vec<MemoryRegion>,
    pub handles: Vec<FileHandle>,
}

impl SavestateMeta {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<SavestateMeta> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// `<path>.incomplete`
pub fn incomplete_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".incomplete");
    PathBuf::from(s)
}
