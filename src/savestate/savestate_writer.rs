use super::{
    incomplete_path, Preamble, SavestateFlags, SavestateMeta, PREAMBLE_SIZE, SAVESTATE_MAGIC,
    SAVESTATE_VERSION,
};
use crate::{
    error::Result,
    log::LogLevel::{LogDebug, LogWarn},
    util::pwrite_all_fallible,
};
use crc32fast::Hasher;
use nix::fcntl::{flock, FlockArg};
use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufWriter, Seek, SeekFrom, Write},
    os::unix::io::AsRawFd,
    path::{Path, PathBuf},
};

/// Writes a savestate to `<path>.incomplete` and renames it to `<path>` in
/// `finalize()`. A writer dropped before that removes the partial file, so a
/// file at `<path>` is always complete.
pub struct SavestateWriter {
    path: PathBuf,
    incomplete: PathBuf,
    out: Option<BufWriter<File>>,
    payload_len: u64,
    payload_crc: Hasher,
    finalized: bool,
}

impl SavestateWriter {
    pub fn create(path: &Path) -> Result<SavestateWriter> {
        let incomplete = incomplete_path(path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&incomplete)?;
        // Two savers racing for the same path would interleave their sections.
        flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock)?;

        let mut out = BufWriter::new(file);
        out.write_all(&[0u8; PREAMBLE_SIZE])?;
        log!(LogDebug, "Writing savestate to {:?}", incomplete);
        Ok(SavestateWriter {
            path: path.to_owned(),
            incomplete,
            out: Some(out),
            payload_len: 0,
            payload_crc: Hasher::new(),
            finalized: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn payload_len(&self) -> u64 {
        self.payload_len
    }

    pub fn write_payload(&mut self, chunk: &[u8]) -> Result<()> {
        if let Some(out) = self.out.as_mut() {
            out.write_all(chunk)?;
            self.payload_crc.update(chunk);
            self.payload_len += chunk.len() as u64;
        }
        Ok(())
    }

    /// Append the pagemap and meta sections, fill in the preamble, sync and
    /// rename into place. Returns the payload CRC and the file size.
    pub fn finalize(
        mut self,
        pagemap: &[u8],
        meta: &SavestateMeta,
        flags: SavestateFlags,
    ) -> Result<(u32, u64)> {
        let meta_bytes = meta.encode()?;
        let mut out = match self.out.take() {
            Some(out) => out,
            None => unreachable!(),
        };
        out.write_all(pagemap)?;
        out.write_all(&meta_bytes)?;
        let mut file = out.into_inner().map_err(io::Error::from)?;

        let payload_crc = self.payload_crc.clone().finalize();
        let preamble = Preamble {
            magic: SAVESTATE_MAGIC,
            version: SAVESTATE_VERSION,
            flags: flags.bits(),
            payload_len: self.payload_len,
            pagemap_len: pagemap.len() as u64,
            meta_len: meta_bytes.len() as u64,
            payload_crc,
            pagemap_crc: crc32fast::hash(pagemap),
            meta_crc: crc32fast::hash(&meta_bytes),
            reserved: [0; 12],
        };
        pwrite_all_fallible(file.as_raw_fd(), &preamble.to_bytes(), 0)?;
        let size = file.seek(SeekFrom::End(0))?;
        file.sync_all()?;
        fs::rename(&self.incomplete, &self.path)?;
        self.finalized = true;
        // The lock goes away with the descriptor.
        drop(file);
        log!(
            LogDebug,
            "Savestate {:?} complete: {} payload bytes, {} total",
            self.path,
            self.payload_len,
            size
        );
        Ok((payload_crc, size))
    }
}

impl Drop for SavestateWriter {
    fn drop(&mut self) {
        if !self.finalized {
            if let Err(e) = fs::remove_file(&self.incomplete) {
                log!(LogWarn, "Could not remove {:?}: {}", self.incomplete, e);
            }
        }
    }
}
