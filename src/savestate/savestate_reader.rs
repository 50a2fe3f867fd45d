use super::{Preamble, SavestateFlags, SavestateMeta, PREAMBLE_SIZE, SAVESTATE_MAGIC, SAVESTATE_VERSION};
use crate::error::{CheckpointError, Result};
use std::{
    convert::TryInto,
    fs,
    ops::Range,
    path::{Path, PathBuf},
};

/// A savestate read fully into memory with its preamble, section lengths and
/// checksums verified.
pub struct SavestateFile {
    path: PathBuf,
    preamble: Preamble,
    bytes: Vec<u8>,
    meta: SavestateMeta,
}

impl SavestateFile {
    pub fn open(path: &Path) -> Result<SavestateFile> {
        let bytes = fs::read(path)?;
        let corrupt = |reason: String| CheckpointError::corrupt(path, reason);

        if bytes.len() < PREAMBLE_SIZE {
            return Err(corrupt(format!("only {} bytes long", bytes.len())));
        }
        let preamble_bytes: &[u8; PREAMBLE_SIZE] = bytes[..PREAMBLE_SIZE]
            .try_into()
            .map_err(|_| corrupt("short preamble".into()))?;
        let preamble = Preamble::from_bytes(preamble_bytes);
        if preamble.magic != SAVESTATE_MAGIC {
            return Err(corrupt("not a savestate".into()));
        }
        if preamble.version != SAVESTATE_VERSION {
            return Err(corrupt(format!(
                "format version {} (expected {})",
                preamble.version, SAVESTATE_VERSION
            )));
        }

        let body = (bytes.len() - PREAMBLE_SIZE) as u64;
        let expected = preamble
            .payload_len
            .checked_add(preamble.pagemap_len)
            .and_then(|n| n.checked_add(preamble.meta_len));
        if expected != Some(body) {
            return Err(corrupt(format!(
                "sections add up to {:?} bytes but the file holds {}",
                expected, body
            )));
        }

        let (payload, pagemap, meta_range) = sections(&preamble);
        if crc32fast::hash(&bytes[payload]) != preamble.payload_crc {
            return Err(corrupt("payload checksum mismatch".into()));
        }
        if crc32fast::hash(&bytes[pagemap]) != preamble.pagemap_crc {
            return Err(corrupt("pagemap checksum mismatch".into()));
        }
        if crc32fast::hash(&bytes[meta_range.clone()]) != preamble.meta_crc {
            return Err(corrupt("meta checksum mismatch".into()));
        }
        let meta = SavestateMeta::decode(&bytes[meta_range])
            .map_err(|e| corrupt(format!("undecodable meta: {}", e)))?;
        if meta.header.parent.is_some() != preamble.flags().contains(SavestateFlags::INCREMENTAL) {
            return Err(corrupt("parent reference disagrees with flags".into()));
        }
        Ok(SavestateFile {
            path: path.to_owned(),
            preamble,
            bytes,
            meta,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn preamble(&self) -> &Preamble {
        &self.preamble
    }

    pub fn meta(&self) -> &SavestateMeta {
        &self.meta
    }

    pub fn generation(&self) -> u64 {
        self.meta.header.generation
    }

    /// The whole file.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn payload(&self) -> &[u8] {
        &self.bytes[sections(&self.preamble).0]
    }

    pub fn pagemap(&self) -> &[u8] {
        &self.bytes[sections(&self.preamble).1]
    }
}

/// Byte ranges of payload, pagemap and meta. Only valid once the lengths
/// have been checked against the file size.
fn sections(preamble: &Preamble) -> (Range<usize>, Range<usize>, Range<usize>) {
    let payload_end = PREAMBLE_SIZE + preamble.payload_len as usize;
    let pagemap_end = payload_end + preamble.pagemap_len as usize;
    let meta_end = pagemap_end + preamble.meta_len as usize;
    (
        PREAMBLE_SIZE..payload_end,
        payload_end..pagemap_end,
        pagemap_end..meta_end,
    )
}
