pub mod kernel_map_iterator;
pub mod memory_range;
pub mod memory_region;

use crate::{
    address_space::{
        kernel_map_iterator::KernelMapIterator,
        memory_range::MemoryRange,
        memory_region::{Backing, MemoryRegion, Prot},
    },
    error::{CheckpointError, Result},
    log::LogLevel::{LogDebug, LogWarn},
    remote_ptr::RemotePtr,
    scoped_fd::ScopedFd,
};
use libc::pid_t;
use nix::{
    fcntl::OFlag,
    sys::mman::{mmap, mprotect, munmap, MapFlags, ProtFlags},
    unistd::getpid,
};
use std::ptr;

/// Read the memory map of `pid`.
///
/// If `sentinel` is given and no region of the first read contains it, the
/// subject raced us with mmap/munmap and the table is read exactly once more.
pub fn read_regions(pid: pid_t, sentinel: Option<RemotePtr>) -> Result<Vec<MemoryRegion>> {
    read_regions_with(sentinel, || read_regions_once(pid))
}

fn read_regions_with<F>(sentinel: Option<RemotePtr>, mut read_once: F) -> Result<Vec<MemoryRegion>>
where
    F: FnMut() -> Result<Vec<MemoryRegion>>,
{
    let mut regions = read_once()?;
    if let Some(addr) = sentinel {
        if !regions.iter().any(|r| r.contains_ptr(addr)) {
            log!(LogDebug, "Sentinel {} missing from the memory map, reading again", addr);
            regions = read_once()?;
        }
    }
    Ok(regions)
}

fn read_regions_once(pid: pid_t) -> Result<Vec<MemoryRegion>> {
    let mut regions: Vec<MemoryRegion> = KernelMapIterator::new_from_pid(pid)?.collect();
    if regions.is_empty() {
        return Err(CheckpointError::MapsUnreadable(pid));
    }
    MemoryRegion::classify(&mut regions);
    Ok(regions)
}

/// The operations the page store needs from the subject's memory. The only
/// real implementation is `LocalAddressSpace`; tests substitute recorders.
pub trait AddressSpace {
    /// Current layout, see `read_regions()`.
    fn regions(&self, sentinel: Option<RemotePtr>) -> Result<Vec<MemoryRegion>>;

    /// Copy `buf.len()` bytes starting at `addr`. The range must be readable.
    fn read(&self, addr: RemotePtr, buf: &mut [u8]) -> Result<()>;

    /// The range must currently be writable.
    fn write(&mut self, addr: RemotePtr, data: &[u8]) -> Result<()>;

    /// Establish a fresh mapping with the layout of `region` but protection
    /// `prot`, replacing anything mapped there.
    fn map(&mut self, region: &MemoryRegion, prot: Prot) -> Result<()>;

    fn unmap(&mut self, range: MemoryRange) -> Result<()>;

    fn protect(&mut self, range: MemoryRange, prot: Prot) -> Result<()>;
}

/// The address space of the current process.
pub struct LocalAddressSpace {
    pid: pid_t,
}

impl LocalAddressSpace {
    pub fn new() -> LocalAddressSpace {
        LocalAddressSpace {
            pid: getpid().as_raw(),
        }
    }

    pub fn pid(&self) -> pid_t {
        self.pid
    }

    fn map_file(&self, region: &MemoryRegion, path: &str, offset: u64, prot: Prot) -> Result<()> {
        let oflag = if region.is_shared() && prot.contains(Prot::WRITE) {
            OFlag::O_RDWR
        } else {
            OFlag::O_RDONLY
        };
        let fd = ScopedFd::open_path(path, oflag)?;
        unsafe {
            mmap(
                region.start().as_void_ptr(),
                region.size(),
                prot.to_prot_flags(),
                region.map_flags() | MapFlags::MAP_FIXED,
                fd.as_raw(),
                offset as libc::off_t,
            )?;
        }
        Ok(())
    }
}

impl Default for LocalAddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressSpace for LocalAddressSpace {
    fn regions(&self, sentinel: Option<RemotePtr>) -> Result<Vec<MemoryRegion>> {
        read_regions(self.pid, sentinel)
    }

    fn read(&self, addr: RemotePtr, buf: &mut [u8]) -> Result<()> {
        // The caller checked the range against a fresh map of a suspended
        // process, so nothing can unmap it under us.
        unsafe { ptr::copy_nonoverlapping(addr.as_ptr::<u8>(), buf.as_mut_ptr(), buf.len()) };
        Ok(())
    }

    fn write(&mut self, addr: RemotePtr, data: &[u8]) -> Result<()> {
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), addr.as_mut_ptr::<u8>(), data.len()) };
        Ok(())
    }

    fn map(&mut self, region: &MemoryRegion, prot: Prot) -> Result<()> {
        log!(
            LogDebug,
            "mmap({}, {:#x}, {:?}) for `{}'",
            region.start(),
            region.size(),
            prot,
            region.fsname()
        );
        if let Backing::File { path, offset, .. } = region.backing() {
            match self.map_file(region, path, *offset, prot) {
                Ok(()) => return Ok(()),
                // The contents are in the savestate anyway, so an anonymous
                // mapping is a fine substitute for a vanished file.
                Err(e) if region.has_contents() => {
                    log!(LogWarn, "Could not map `{}' ({}), using anonymous memory", path, e);
                }
                Err(e) => return Err(e),
            }
        }

        let flags = region.map_flags() | MapFlags::MAP_FIXED | MapFlags::MAP_ANONYMOUS;
        unsafe {
            mmap(
                region.start().as_void_ptr(),
                region.size(),
                prot.to_prot_flags(),
                flags,
                -1,
                0,
            )?;
        }
        Ok(())
    }

    fn unmap(&mut self, range: MemoryRange) -> Result<()> {
        log!(LogDebug, "munmap({})", range);
        unsafe { munmap(range.start().as_void_ptr(), range.size())? };
        Ok(())
    }

    fn protect(&mut self, range: MemoryRange, prot: Prot) -> Result<()> {
        log!(LogDebug, "mprotect({}, {:?})", range, prot);
        let flags: ProtFlags = prot.to_prot_flags();
        unsafe { mprotect(range.start().as_void_ptr(), range.size(), flags)? };
        Ok(())
    }
}
