//! Per-page dirty tracking through the kernel's soft-dirty bit.
//!
//! Each 64-bit entry of /proc/<pid>/pagemap describes one virtual page:
//! bit 63 is "present", bit 62 is "swapped" and bit 55 is "soft-dirty".
//! Writing `4` to /proc/<pid>/clear_refs clears every soft-dirty bit of the
//! process, after which the kernel sets the bit again on the first write to
//! a page.

use crate::{
    address_space::memory_range::MemoryRange,
    error::Result,
    log::LogLevel::{LogDebug, LogInfo, LogWarn},
    remote_ptr::RemotePtr,
    scoped_fd::ScopedFd,
    util::{page_size, pread_all_fallible},
};
use bit_field::BitField;
use libc::pid_t;
use nix::{
    fcntl::OFlag,
    sys::mman::{mmap, munmap, MapFlags, ProtFlags},
    unistd::getpid,
};
use std::{
    convert::TryInto,
    fs::OpenOptions,
    io::{self, Write},
    ptr,
};

const PAGEMAP_ENTRY_SIZE: usize = 8;
const PM_SOFT_DIRTY_BIT: usize = 55;
const PM_SWAPPED_BIT: usize = 62;
const PM_PRESENT_BIT: usize = 63;
/// Entries read from the pagemap per pread.
const PAGEMAP_BATCH: usize = 512;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DirtyTracking {
    SoftDirty,
    /// Every page is reported dirty, so only full snapshots make sense.
    Unsupported,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PagemapEntry(u64);

impl PagemapEntry {
    pub fn is_present(self) -> bool {
        self.0.get_bit(PM_PRESENT_BIT)
    }
    pub fn is_swapped(self) -> bool {
        self.0.get_bit(PM_SWAPPED_BIT)
    }
    pub fn is_soft_dirty(self) -> bool {
        self.0.get_bit(PM_SOFT_DIRTY_BIT)
    }

    /// A page that is not backed by anything reads as zero; calling it dirty
    /// keeps the answer conservative.
    pub fn is_clean(self) -> bool {
        !self.is_soft_dirty() && (self.is_present() || self.is_swapped())
    }
}

pub struct DirtyPageTracker {
    pid: pid_t,
    pagemap: ScopedFd,
    tracking: DirtyTracking,
}

impl DirtyPageTracker {
    /// Probes for soft-dirty support. Note that a successful probe clears the
    /// soft-dirty bits of the whole process.
    pub fn new(pid: pid_t) -> DirtyPageTracker {
        let pagemap = match ScopedFd::open_path(format!("/proc/{}/pagemap", pid).as_str(), OFlag::O_RDONLY)
        {
            Ok(fd) => fd,
            Err(e) => {
                log!(LogWarn, "Cannot open /proc/{}/pagemap: {}", pid, e);
                return Self::unsupported(pid);
            }
        };

        let mut tracker = DirtyPageTracker {
            pid,
            pagemap,
            tracking: DirtyTracking::SoftDirty,
        };
        match tracker.probe() {
            Ok(true) => log!(LogInfo, "Soft-dirty page tracking available"),
            Ok(false) => {
                log!(LogWarn, "Kernel does not maintain soft-dirty bits, every page will be saved");
                tracker.tracking = DirtyTracking::Unsupported;
            }
            Err(e) => {
                log!(LogWarn, "Soft-dirty probe failed ({}), every page will be saved", e);
                tracker.tracking = DirtyTracking::Unsupported;
            }
        }
        tracker
    }

    pub fn unsupported(pid: pid_t) -> DirtyPageTracker {
        DirtyPageTracker {
            pid,
            pagemap: ScopedFd::new(),
            tracking: DirtyTracking::Unsupported,
        }
    }

    pub fn tracking(&self) -> DirtyTracking {
        self.tracking
    }

    fn probe(&self) -> Result<bool> {
        if self.pid != getpid().as_raw() {
            // The capability is a kernel property; test it on ourselves.
            return Ok(DirtyPageTracker::new(getpid().as_raw()).tracking == DirtyTracking::SoftDirty);
        }

        let len = page_size();
        let addr = unsafe {
            mmap(
                ptr::null_mut(),
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
                -1,
                0,
            )?
        };
        let page = RemotePtr::from_ptr(addr);
        let result = self.probe_page(page);
        unsafe { munmap(addr, len).unwrap_or(()) };
        result
    }

    fn probe_page(&self, page: RemotePtr) -> Result<bool> {
        let p = page.as_mut_ptr::<u8>();
        unsafe { ptr::write_volatile(p, 1) };
        self.clear_refs()?;
        let entry = self.entry(page)?;
        if !entry.is_present() || entry.is_soft_dirty() {
            log!(LogDebug, "Probe page not clean after clear: {:#x}", entry.0);
            return Ok(false);
        }
        unsafe { ptr::write_volatile(p, 2) };
        let entry = self.entry(page)?;
        if !entry.is_soft_dirty() {
            log!(LogDebug, "Probe page not dirty after write: {:#x}", entry.0);
            return Ok(false);
        }
        Ok(true)
    }

    fn entry(&self, addr: RemotePtr) -> Result<PagemapEntry> {
        let mut entries = self.read_entries(addr, 1)?;
        Ok(entries.pop().unwrap_or(PagemapEntry(0)))
    }

    fn read_entries(&self, start: RemotePtr, count: usize) -> Result<Vec<PagemapEntry>> {
        let mut buf = vec![0u8; count * PAGEMAP_ENTRY_SIZE];
        let offset = (start.as_usize() / page_size() * PAGEMAP_ENTRY_SIZE) as u64;
        let nread = pread_all_fallible(self.pagemap.as_raw(), &mut buf, offset)?;
        Ok(buf[..nread - nread % PAGEMAP_ENTRY_SIZE]
            .chunks_exact(PAGEMAP_ENTRY_SIZE)
            .map(|c| PagemapEntry(u64::from_le_bytes(c.try_into().unwrap_or([0xff; 8]))))
            .collect())
    }

    /// One answer per page of `range`, true meaning dirty. There are no false
    /// negatives: anything not provably clean is dirty.
    pub fn dirty_pages(&self, range: MemoryRange) -> Result<Vec<bool>> {
        let npages = range.size() / page_size();
        if self.tracking == DirtyTracking::Unsupported {
            return Ok(vec![true; npages]);
        }

        let mut result = Vec::with_capacity(npages);
        let mut addr = range.start();
        while result.len() < npages {
            let batch = (npages - result.len()).min(PAGEMAP_BATCH);
            let entries = self.read_entries(addr, batch)?;
            result.extend(entries.iter().map(|e| !e.is_clean()));
            // Short read: report the remainder of the batch dirty.
            result.resize(result.len() + batch - entries.len(), true);
            addr += batch * page_size();
        }
        Ok(result)
    }

    fn clear_refs(&self) -> io::Result<()> {
        let mut f = OpenOptions::new()
            .write(true)
            .open(format!("/proc/{}/clear_refs", self.pid))?;
        f.write_all(b"4")
    }

    /// Start a new tracking interval. A no-op when degraded.
    pub fn clear(&self) -> Result<()> {
        if self.tracking == DirtyTracking::SoftDirty {
            self.clear_refs()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{address_space::test::ScratchMapping, util::soft_dirty_test_guard};

    #[test]
    fn entry_bits() {
        let mut raw = 0u64;
        raw.set_bit(PM_PRESENT_BIT, true);
        assert!(PagemapEntry(raw).is_clean());
        raw.set_bit(PM_SOFT_DIRTY_BIT, true);
        assert!(!PagemapEntry(raw).is_clean());

        let mut swapped = 0u64;
        swapped.set_bit(PM_SWAPPED_BIT, true);
        assert!(PagemapEntry(swapped).is_clean());
        // Neither present nor swapped
        assert!(!PagemapEntry(0).is_clean());
    }

    #[test]
    fn degraded_reports_everything_dirty() {
        let tracker = DirtyPageTracker::unsupported(getpid().as_raw());
        let scratch = ScratchMapping::new(4);
        assert_eq!(tracker.dirty_pages(scratch.range).unwrap(), vec![true; 4]);
        tracker.clear().unwrap();
    }

    #[test]
    fn writes_are_seen() {
        let _guard = soft_dirty_test_guard();
        let tracker = DirtyPageTracker::new(getpid().as_raw());
        let scratch = ScratchMapping::new(4);
        let bytes = scratch.bytes_mut();
        for i in 0..4 {
            bytes[i * page_size()] = 1;
        }
        tracker.clear().unwrap();
        bytes[2 * page_size() + 7] = 9;

        let dirty = tracker.dirty_pages(scratch.range).unwrap();
        match tracker.tracking() {
            DirtyTracking::SoftDirty => assert_eq!(dirty, vec![false, false, true, false]),
            DirtyTracking::Unsupported => assert_eq!(dirty, vec![true; 4]),
        }
    }

    #[test]
    fn untouched_pages_are_dirty() {
        let _guard = soft_dirty_test_guard();
        let tracker = DirtyPageTracker::new(getpid().as_raw());
        let scratch = ScratchMapping::new(2);
        tracker.clear().unwrap();
        // Never faulted in, so not present.
        assert_eq!(tracker.dirty_pages(scratch.range).unwrap(), vec![true, true]);
    }
}
