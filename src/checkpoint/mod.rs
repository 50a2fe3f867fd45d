//! Sequencing of a save or a load.
//!
//! Save: suspend, scan descriptors, freeze handles, read the layout, query
//! and clear the dirty bits, stream pages, finalize, re-inject pipes, resume.
//! Load: suspend, open and verify the chain, close descriptors the savestate
//! does not know, rewrite memory, restore descriptors, clear dirty bits,
//! resume. Everything before the first change to the subject is recoverable;
//! anything after it goes through the fatal hook.
//!
//! Neither direction may capture memory the checkpointer itself runs on: its
//! stack, its buffers and the parked threads' signal frames. Region scopes
//! that reach into those are rejected before anything is written.

pub mod generation;

pub use crate::page_store::SizeInfo;

use crate::{
    address_space::{
        memory_range::MemoryRange,
        memory_region::{MemoryRegion, Prot, RegionKind},
        AddressSpace,
        LocalAddressSpace,
    },
    config::CheckpointConfig,
    dirty_pages::{DirtyPageTracker, DirtyTracking},
    error::{CheckpointError, Result},
    file_handles::FileHandleRegistry,
    log::{
        hold_output,
        LogLevel::{LogDebug, LogError, LogInfo, LogWarn},
    },
    page_store::{GenerationChain, Page, PageWriter},
    remote_ptr::RemotePtr,
    savestate::{SavestateFlags, SavestateHeader, SavestateMeta, SavestateWriter},
    threads::{ThreadCoordinator, ThreadRegistry},
    util::page_size,
};
use generation::{resolve_path, GenerationInfo, Generations};
use nix::unistd::getpid;
use std::{
    path::Path,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

/// Log output kept in memory while threads are frozen.
const HELD_LOG_BYTES: usize = 64 << 10;
/// Stack the checkpointer may use below `save()` and `load()`.
const STACK_RESERVE: usize = 256 << 10;

pub type ProgressCallback = Box<dyn FnMut(&SizeInfo) + Send>;
pub type FatalHook = Box<dyn Fn(&CheckpointError) + Send>;

fn abort_on_corruption(e: &CheckpointError) {
    fatal!("Subject memory could not be restored: {}", e);
}

/// Drives saves and loads from the checkpoint thread.
pub struct Checkpointer {
    config: CheckpointConfig,
    handles: Arc<FileHandleRegistry>,
    coordinator: ThreadCoordinator,
    space: Box<dyn AddressSpace + Send>,
    tracker: DirtyPageTracker,
    generations: Generations,
    progress: Option<ProgressCallback>,
    fatal_hook: FatalHook,
}

impl Checkpointer {
    pub fn new(
        config: CheckpointConfig,
        handles: Arc<FileHandleRegistry>,
        threads: Arc<ThreadRegistry>,
    ) -> Result<Checkpointer> {
        Self::with_address_space(config, handles, threads, Box::new(LocalAddressSpace::new()))
    }

    /// Like `new()`, with the memory accesses going through `space`.
    pub fn with_address_space(
        config: CheckpointConfig,
        handles: Arc<FileHandleRegistry>,
        threads: Arc<ThreadRegistry>,
        space: Box<dyn AddressSpace + Send>,
    ) -> Result<Checkpointer> {
        handles.set_suspend_signal(config.suspend_signal);
        let coordinator = ThreadCoordinator::new(threads, &config)?;
        let pid = getpid().as_raw();
        let tracker = if config.incremental {
            DirtyPageTracker::new(pid)
        } else {
            DirtyPageTracker::unsupported(pid)
        };
        Ok(Checkpointer {
            config,
            handles,
            coordinator,
            space,
            tracker,
            generations: Generations::new(),
            progress: None,
            fatal_hook: Box::new(abort_on_corruption),
        })
    }

    /// Called after every saved region with the totals so far.
    pub fn set_progress_callback<F: FnMut(&SizeInfo) + Send + 'static>(&mut self, callback: F) {
        self.progress = Some(Box::new(callback));
    }

    /// Called when a load fails after memory has been modified. The default
    /// aborts the process.
    pub fn set_fatal_hook<F: Fn(&CheckpointError) + Send + 'static>(&mut self, hook: F) {
        self.fatal_hook = Box::new(hook);
    }

    pub fn dirty_tracking(&self) -> DirtyTracking {
        self.tracker.tracking()
    }

    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    /// The generation memory currently derives from.
    pub fn last_generation(&self) -> Option<u64> {
        self.generations.last().map(|g| g.generation)
    }

    /// Threads that were slow to suspend since creation.
    pub fn excused_threads(&self) -> u64 {
        self.coordinator.excused_total()
    }

    /// Write a savestate of the subject to `path`.
    pub fn save(&mut self, path: &Path) -> Result<SizeInfo> {
        let mark = 0u8;
        let stack = RemotePtr::from_ptr(&mark);
        let _held = hold_output(HELD_LOG_BYTES);
        self.coordinator.suspend_all()?;
        let result = self.save_suspended(path, stack);
        if let Err(e) = &result {
            log!(LogWarn, "Saving {:?} failed: {}", path, e);
            // The dirty bits may already be gone.
            self.generations.forget();
            self.handles.restore();
        }
        let resumed = self.coordinator.resume_all();
        let info = result?;
        resumed?;
        Ok(info)
    }

    fn save_suspended(&mut self, path: &Path, stack: RemotePtr) -> Result<SizeInfo> {
        if self.config.scan_descriptors {
            match self.handles.scan_existing() {
                Ok(n) if n > 0 => log!(LogDebug, "Picked up {} unregistered descriptor(s)", n),
                Ok(_) => (),
                Err(e) => log!(LogWarn, "Descriptor scan failed: {}", e),
            }
        }
        self.handles.begin_tracking(self.config.pipe_drain_limit);

        let regions = self.current_regions()?;
        let generation = self.generations.next_id();
        // A generation never replaces a file its parent chain still needs.
        let target = resolve_path(path);
        let parent = match self.tracker.tracking() {
            DirtyTracking::SoftDirty => self
                .generations
                .parent_for_next(self.config.max_chain_depth, &target)
                .cloned(),
            DirtyTracking::Unsupported => None,
        };

        let parent_regions: &[MemoryRegion] = match &parent {
            Some(p) => &p.regions,
            None => &[],
        };
        let mut pages = PageWriter::new(
            SavestateWriter::create(path)?,
            self.config.block_pages,
            self.config.brotli_quality,
            parent_regions,
        )?;
        self.check_working_set(&regions, stack, &pages.buffers())?;

        // Query everything first, then start a new interval before a single
        // page is read: whatever changes from here on is dirty next time.
        let mut dirty: Vec<Vec<bool>> = Vec::with_capacity(regions.len());
        for region in &regions {
            if parent.is_some() && region.has_contents() {
                dirty.push(self.tracker.dirty_pages(region.range())?);
            } else {
                dirty.push(Vec::new());
            }
        }
        self.tracker.clear()?;

        for (region, dirty) in regions.iter().zip(&dirty) {
            if !region.has_contents() {
                continue;
            }
            pages.save_region(&*self.space, region, dirty)?;
            if let Some(progress) = self.progress.as_mut() {
                progress(&pages.info());
            }
        }

        let meta = SavestateMeta {
            header: SavestateHeader {
                generation,
                parent: parent.as_ref().map(GenerationInfo::parent_ref),
                chain_depth: parent.as_ref().map_or(0, |p| p.chain_depth + 1),
                pid: getpid().as_raw(),
                created: SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map_or(0, |d| d.as_secs()),
                page_size: page_size() as u32,
                block_pages: self.config.block_pages,
                threads: self.coordinator.thread_states(),
            },
            regions,
            handles: self.handles.snapshot(),
        };
        let flags = if parent.is_some() {
            SavestateFlags::INCREMENTAL
        } else {
            SavestateFlags::empty()
        };
        let (info, payload_crc) = pages.finish(&meta, flags)?;
        self.handles.restore();

        log!(
            LogInfo,
            "Saved generation {} to {:?}: {} pages, {} zero, {} unchanged, {} bytes",
            generation,
            path,
            info.pages_total,
            info.zero_pages,
            info.unchanged_pages,
            info.file_bytes
        );
        let mut chain = vec![resolve_path(path)];
        if let Some(p) = parent {
            chain.extend(p.chain);
        }
        self.generations.record(GenerationInfo {
            generation,
            path: chain[0].clone(),
            payload_crc,
            chain_depth: meta.header.chain_depth,
            regions: meta.regions,
            chain,
        });
        Ok(info)
    }

    /// Rewind the subject to the savestate at `path`.
    pub fn load(&mut self, path: &Path) -> Result<()> {
        let mark = 0u8;
        let stack = RemotePtr::from_ptr(&mark);
        let _held = hold_output(HELD_LOG_BYTES);
        self.coordinator.suspend_all()?;
        let result = self.load_suspended(path, stack);
        let resumed = self.coordinator.resume_all();
        result?;
        resumed
    }

    fn load_suspended(&mut self, path: &Path, stack: RemotePtr) -> Result<()> {
        let mut chain = GenerationChain::open(path)?;
        if chain.page_size() != page_size() {
            return Err(CheckpointError::Unsupported(format!(
                "savestate page size {} differs from {}",
                chain.page_size(),
                page_size()
            )));
        }
        let pid = getpid().as_raw();
        if chain.newest().meta().header.pid != pid {
            return Err(CheckpointError::Unsupported(format!(
                "savestate was taken by process {}, this is {}",
                chain.newest().meta().header.pid,
                pid
            )));
        }
        if self.config.verify_before_load {
            chain.verify()?;
        }
        let meta = chain.newest().meta().clone();
        let current = self.current_regions()?;
        let buffers = chain.buffers();
        self.check_working_set(&current, stack, &buffers)?;
        self.check_working_set(&meta.regions, stack, &buffers)?;

        // The subject changes from here on.
        self.handles.close_untracked(&meta.handles);
        self.handles.replace_with(meta.handles.clone());
        if let Err(e) = self.restore_memory(&mut chain, &current, &meta.regions) {
            log!(LogError, "Restoring memory from {:?} failed: {}", path, e);
            self.generations.forget();
            (self.fatal_hook)(&e);
            return Err(CheckpointError::SubjectCorrupted(Box::new(e)));
        }
        self.handles.restore();
        let staged = self.coordinator.stage_sigmasks(&meta.header.threads);
        log!(LogDebug, "Restoring the signal mask of {} thread(s)", staged);

        if let Err(e) = self.tracker.clear() {
            // Bits left set only make the next save larger.
            log!(LogWarn, "Could not clear soft-dirty bits: {}", e);
        }
        self.generations.record(GenerationInfo::from_chain(&chain));
        log!(LogInfo, "Loaded generation {} from {:?}", meta.header.generation, path);
        Ok(())
    }

    /// The in-scope layout right now.
    fn current_regions(&self) -> Result<Vec<MemoryRegion>> {
        let marker = 0u8;
        let sentinel = RemotePtr::from_ptr(&marker);
        let regions = self.space.regions(Some(sentinel))?;
        Ok(self.config.region_scope.filter(regions))
    }

    /// Fail if any of `regions` overlaps the stack below `stack`, one of
    /// `buffers` or the memory the frozen threads are parked in.
    fn check_working_set(
        &self,
        regions: &[MemoryRegion],
        stack: RemotePtr,
        buffers: &[MemoryRange],
    ) -> Result<()> {
        let top = stack.floor_page() + 2 * page_size();
        let bottom = RemotePtr::from(top.as_usize().saturating_sub(STACK_RESERVE));
        let mut working = vec![MemoryRange::from_range(bottom, top)];
        working.extend_from_slice(buffers);
        working.extend(self.coordinator.working_set());
        for region in regions.iter().filter(|r| r.kind() != RegionKind::Special) {
            if let Some(w) = working.iter().find(|w| region.intersects(w)) {
                return Err(CheckpointError::Unsupported(format!(
                    "{} overlaps {}, which the checkpointer needs while threads are frozen",
                    region.str(),
                    w
                )));
            }
        }
        Ok(())
    }

    fn restore_memory(
        &mut self,
        chain: &mut GenerationChain,
        current: &[MemoryRegion],
        saved: &[MemoryRegion],
    ) -> Result<()> {
        let saved_ranges: Vec<MemoryRange> = saved.iter().map(|r| r.range()).collect();

        for region in current.iter().filter(|r| r.kind() != RegionKind::Special) {
            for piece in region.range().subtract(&saved_ranges) {
                log!(LogDebug, "Unmapping {}", piece);
                self.space.unmap(piece)?;
            }
        }

        for region in saved.iter().filter(|r| r.kind() != RegionKind::Special) {
            let in_place = current.iter().any(|c| c.same_layout(region));
            if !region.has_contents() {
                if !in_place {
                    log!(LogDebug, "Mapping layout-only {}", region.str());
                    self.space.map(region, region.prot())?;
                }
                continue;
            }

            if !in_place {
                log!(LogDebug, "Mapping {}", region.str());
                self.space.map(region, Prot::READ | Prot::WRITE)?;
            } else if !region.is_writable() {
                self.space.protect(region.range(), region.prot() | Prot::WRITE)?;
            }
            // A fresh anonymous mapping is already zero.
            let skip_zero = !in_place && !region.is_file_backed();
            self.restore_pages(chain, region, skip_zero)?;
            if !in_place || !region.is_writable() {
                self.space.protect(region.range(), region.prot())?;
            }
        }
        Ok(())
    }

    fn restore_pages(
        &mut self,
        chain: &mut GenerationChain,
        region: &MemoryRegion,
        skip_zero: bool,
    ) -> Result<()> {
        let ps = page_size();
        let zero = vec![0u8; ps];
        let mut addr = region.start();
        while addr < region.end() {
            match chain.page(addr)? {
                Page::Zero if skip_zero => (),
                Page::Zero => self.space.write(addr, &zero)?,
                Page::Data(data) => self.space.write(addr, data)?,
            }
            addr += ps;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        address_space::{memory_region::Backing, test::ScratchMapping},
        savestate::{incomplete_path, SavestateFile},
        threads::RegisteredThread,
        util::soft_dirty_test_guard,
    };
    use nix::{
        fcntl::OFlag,
        sys::stat::Mode,
        unistd::{lseek, read, write, Whence},
    };
    use rand::{Rng, SeedableRng};
    use std::{
        fs,
        hint::black_box,
        sync::{
            atomic::{AtomicBool, AtomicU64, Ordering},
            Mutex,
        },
        thread,
        time::Duration,
    };

    struct Fixture {
        checkpointer: Checkpointer,
        handles: Arc<FileHandleRegistry>,
        threads: Arc<ThreadRegistry>,
        _me: RegisteredThread,
    }

    fn fixture(scratch: &ScratchMapping) -> Fixture {
        fixture_with_space(scratch, Box::new(LocalAddressSpace::new()))
    }

    fn fixture_with_space(scratch: &ScratchMapping, space: Box<dyn AddressSpace + Send>) -> Fixture {
        fixture_for(CheckpointConfig::with_ranges(vec![scratch.range]), space)
    }

    fn fixture_for(config: CheckpointConfig, space: Box<dyn AddressSpace + Send>) -> Fixture {
        let handles = Arc::new(FileHandleRegistry::new());
        let threads = Arc::new(ThreadRegistry::new());
        let me = threads.register_checkpoint_thread().unwrap();
        let checkpointer =
            Checkpointer::with_address_space(config, handles.clone(), threads.clone(), space).unwrap();
        Fixture {
            checkpointer,
            handles,
            threads,
            _me: me,
        }
    }

    fn fill_random(bytes: &mut [u8], seed: u64) {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        for b in bytes {
            *b = rng.gen();
        }
    }

    /// A registered thread that keeps writing its own counter.
    struct Worker {
        stop: Arc<AtomicBool>,
        count: Arc<AtomicU64>,
        handle: thread::JoinHandle<()>,
    }

    fn spawn_worker(threads: &Arc<ThreadRegistry>) -> Worker {
        let stop = Arc::new(AtomicBool::new(false));
        let count = Arc::new(AtomicU64::new(0));
        let (t, s, c) = (threads.clone(), stop.clone(), count.clone());
        let handle = thread::spawn(move || {
            let _reg = t.register();
            while !s.load(Ordering::SeqCst) {
                c.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_micros(200));
            }
        });
        while count.load(Ordering::SeqCst) == 0 {
            thread::yield_now();
        }
        Worker {
            stop,
            count,
            handle,
        }
    }

    impl Worker {
        fn finish(self) -> u64 {
            self.stop.store(true, Ordering::SeqCst);
            self.handle.join().unwrap();
            self.count.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn save_and_load_round_trip() {
        let _guard = soft_dirty_test_guard();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("g1.state");
        let scratch = ScratchMapping::new(16);
        let ps = page_size();
        fill_random(&mut scratch.bytes_mut()[..8 * ps], 11);
        // Pages 8..16 stay zero.
        let mut f = fixture(&scratch);
        let worker = spawn_worker(&f.threads);

        let reported = Arc::new(Mutex::new(Vec::new()));
        let r = reported.clone();
        f.checkpointer
            .set_progress_callback(move |info| r.lock().unwrap().push(info.pages_total));
        let info = f.checkpointer.save(&path).unwrap();
        assert_eq!(info.pages_total, 16);
        assert_eq!(info.zero_pages, 8);
        assert_eq!(info.unchanged_pages, 0);
        assert_eq!(*reported.lock().unwrap(), vec![16]);
        assert!(path.exists());
        assert!(!incomplete_path(&path).exists());
        assert_eq!(f.checkpointer.last_generation(), Some(1));

        let expected = scratch.bytes_mut().to_vec();
        fill_random(scratch.bytes_mut(), 12);
        assert_ne!(scratch.bytes_mut(), &expected[..]);

        f.checkpointer.load(&path).unwrap();
        assert_eq!(scratch.bytes_mut(), &expected[..]);

        let header = SavestateFile::open(&path).unwrap().meta().header.clone();
        assert_eq!(header.threads.len(), 2);
        assert_eq!(header.threads.iter().filter(|t| t.is_checkpoint_thread).count(), 1);
        assert!(worker.finish() > 0);
    }

    #[test]
    fn incremental_saves_rewind_to_any_generation() {
        let _guard = soft_dirty_test_guard();
        let dir = tempfile::tempdir().unwrap();
        let (g1, g2, g3) = (
            dir.path().join("g1.state"),
            dir.path().join("g2.state"),
            dir.path().join("g3.state"),
        );
        let scratch = ScratchMapping::new(8);
        let ps = page_size();
        fill_random(scratch.bytes_mut(), 21);
        let mut f = fixture(&scratch);

        f.checkpointer.save(&g1).unwrap();
        let state1 = scratch.bytes_mut().to_vec();
        scratch.bytes_mut()[3 * ps + 5] ^= 0xff;
        let info2 = f.checkpointer.save(&g2).unwrap();
        let state2 = scratch.bytes_mut().to_vec();

        let header2 = SavestateFile::open(&g2).unwrap().meta().header.clone();
        if f.checkpointer.dirty_tracking() == DirtyTracking::SoftDirty {
            assert_eq!(header2.chain_depth, 1);
            assert_eq!(header2.parent.as_ref().map(|p| p.generation), Some(1));
            assert!(info2.unchanged_pages >= 6, "{:?}", info2);
        } else {
            assert_eq!(header2.chain_depth, 0);
            assert_eq!(info2.unchanged_pages, 0);
        }

        fill_random(scratch.bytes_mut(), 22);
        f.checkpointer.load(&g2).unwrap();
        assert_eq!(scratch.bytes_mut(), &state2[..]);
        f.checkpointer.load(&g1).unwrap();
        assert_eq!(scratch.bytes_mut(), &state1[..]);

        // A save after loading g1 builds on g1.
        scratch.bytes_mut()[ps] = 7;
        f.checkpointer.save(&g3).unwrap();
        let state3 = scratch.bytes_mut().to_vec();
        let header3 = SavestateFile::open(&g3).unwrap().meta().header.clone();
        assert_eq!(header3.generation, 3);
        if f.checkpointer.dirty_tracking() == DirtyTracking::SoftDirty {
            assert_eq!(header3.parent.map(|p| p.generation), Some(1));
        }
        fill_random(scratch.bytes_mut(), 23);
        f.checkpointer.load(&g3).unwrap();
        assert_eq!(scratch.bytes_mut(), &state3[..]);
    }

    #[test]
    fn chain_depth_is_bounded() {
        let _guard = soft_dirty_test_guard();
        let dir = tempfile::tempdir().unwrap();
        let scratch = ScratchMapping::new(2);
        let mut f = fixture(&scratch);
        f.checkpointer.config.max_chain_depth = 3;
        let mut depths = Vec::new();
        for i in 0..5 {
            scratch.bytes_mut()[0] = i as u8 + 1;
            let path = dir.path().join(format!("g{}.state", i));
            f.checkpointer.save(&path).unwrap();
            depths.push(SavestateFile::open(&path).unwrap().meta().header.chain_depth);
        }
        if f.checkpointer.dirty_tracking() == DirtyTracking::SoftDirty {
            assert_eq!(depths, vec![0, 1, 2, 0, 1]);
        } else {
            assert_eq!(depths, vec![0; 5]);
        }
    }

    #[test]
    fn layout_is_restored() {
        let _guard = soft_dirty_test_guard();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("layout.state");
        let scratch = ScratchMapping::new(4);
        let ps = page_size();
        fill_random(scratch.bytes_mut(), 31);
        let mut space = LocalAddressSpace::new();
        // Page 1 is a hole, page 3 is read-only.
        space
            .unmap(MemoryRange::new_range(scratch.page(1), ps))
            .unwrap();
        space
            .protect(MemoryRange::new_range(scratch.page(3), ps), Prot::READ)
            .unwrap();
        let page0 = scratch.bytes_mut()[..ps].to_vec();
        let page2 = scratch.bytes_mut()[2 * ps..3 * ps].to_vec();
        let page3 = scratch.bytes_mut()[3 * ps..].to_vec();

        let mut f = fixture(&scratch);
        f.checkpointer.save(&path).unwrap();

        // Fill the hole, drop page 2 and scribble on the read-only page.
        let hole = MemoryRegion::new(
            MemoryRange::new_range(scratch.page(1), ps),
            Prot::READ | Prot::WRITE,
            false,
            Backing::Anonymous,
        );
        space.map(&hole, Prot::READ | Prot::WRITE).unwrap();
        space
            .unmap(MemoryRange::new_range(scratch.page(2), ps))
            .unwrap();
        space
            .protect(MemoryRange::new_range(scratch.page(3), ps), Prot::READ | Prot::WRITE)
            .unwrap();
        scratch.bytes_mut()[3 * ps] ^= 1;
        space
            .protect(MemoryRange::new_range(scratch.page(3), ps), Prot::READ)
            .unwrap();

        f.checkpointer.load(&path).unwrap();
        let regions = space.regions(None).unwrap();
        let at = |p: RemotePtr| regions.iter().find(|r| r.contains_ptr(p)).cloned();
        assert!(at(scratch.page(1)).is_none());
        assert_eq!(at(scratch.page(2)).unwrap().prot(), Prot::READ | Prot::WRITE);
        assert_eq!(at(scratch.page(3)).unwrap().prot(), Prot::READ);
        let bytes = scratch.bytes_mut();
        assert_eq!(&bytes[..ps], &page0[..]);
        assert_eq!(&bytes[2 * ps..3 * ps], &page2[..]);
        assert_eq!(&bytes[3 * ps..], &page3[..]);
    }

    #[test]
    fn only_the_checkpoint_thread_may_save() {
        let _guard = soft_dirty_test_guard();
        let dir = tempfile::tempdir().unwrap();
        let scratch = ScratchMapping::new(1);
        let f = fixture(&scratch);
        let path = dir.path().join("x.state");
        let mut checkpointer = f.checkpointer;
        let result = thread::spawn(move || {
            let r = checkpointer.save(&path);
            (r, path)
        })
        .join()
        .unwrap();
        assert!(matches!(result.0, Err(CheckpointError::NotCheckpointThread(_))));
        assert!(!result.1.exists());
    }

    #[test]
    fn file_offsets_survive_a_rewind() {
        let _guard = soft_dirty_test_guard();
        let dir = tempfile::tempdir().unwrap();
        let scratch = ScratchMapping::new(1);
        let mut f = fixture(&scratch);
        let data_path = dir.path().join("data");
        let fd = nix::fcntl::open(
            data_path.as_path(),
            OFlag::O_RDWR | OFlag::O_CREAT,
            Mode::from_bits_truncate(0o600),
        )
        .unwrap();
        let bytes: Vec<u8> = (0..100u8).collect();
        write(fd, &bytes).unwrap();
        f.handles.open(&data_path, fd).unwrap();
        lseek(fd, 37, Whence::SeekSet).unwrap();

        let path = dir.path().join("fd.state");
        f.checkpointer.save(&path).unwrap();
        assert_eq!(lseek(fd, 0, Whence::SeekCur).unwrap(), 37);
        lseek(fd, 90, Whence::SeekSet).unwrap();

        f.checkpointer.load(&path).unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(read(fd, &mut buf).unwrap(), 3);
        assert_eq!(buf, [37, 38, 39]);
        nix::unistd::close(fd).unwrap();
    }

    #[test]
    fn pipe_contents_survive_a_rewind() {
        let _guard = soft_dirty_test_guard();
        let dir = tempfile::tempdir().unwrap();
        let scratch = ScratchMapping::new(1);
        let mut f = fixture(&scratch);
        let (r, w) = f.handles.open_pipe(OFlag::O_NONBLOCK).unwrap();
        write(w, b"queued").unwrap();

        let path = dir.path().join("pipe.state");
        f.checkpointer.save(&path).unwrap();
        // Saving does not disturb the reader.
        let mut buf = [0u8; 16];
        assert_eq!(read(r, &mut buf).unwrap(), 6);
        assert_eq!(&buf[..6], b"queued");
        write(w, b"later").unwrap();

        f.checkpointer.load(&path).unwrap();
        let n = read(r, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"queued");
        for fd in [r, w].iter() {
            f.handles.close(*fd);
            nix::unistd::close(*fd).unwrap_or(());
        }
    }

    #[test]
    fn sigmask_is_restored_on_load() {
        let _guard = soft_dirty_test_guard();
        let dir = tempfile::tempdir().unwrap();
        let scratch = ScratchMapping::new(1);
        let mut f = fixture(&scratch);

        let block_now = Arc::new(AtomicBool::new(false));
        let blocked = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(AtomicBool::new(false));
        let (t, b, bl, s) = (f.threads.clone(), block_now.clone(), blocked.clone(), stop.clone());
        let extra = nix::sys::signal::Signal::SIGPWR;
        let handle = thread::spawn(move || {
            let _reg = t.register();
            while !s.load(Ordering::SeqCst) {
                if b.swap(false, Ordering::SeqCst) {
                    let mut set = nix::sys::signal::SigSet::empty();
                    set.add(extra);
                    set.thread_block().unwrap();
                }
                let mask = nix::sys::signal::SigSet::thread_get_mask().unwrap();
                bl.store(mask.contains(extra), Ordering::SeqCst);
                thread::sleep(Duration::from_micros(200));
            }
        });
        thread::sleep(Duration::from_millis(10));

        let path = dir.path().join("mask.state");
        f.checkpointer.save(&path).unwrap();
        block_now.store(true, Ordering::SeqCst);
        while !blocked.load(Ordering::SeqCst) {
            thread::yield_now();
        }

        f.checkpointer.load(&path).unwrap();
        thread::sleep(Duration::from_millis(10));
        let start = std::time::Instant::now();
        while blocked.load(Ordering::SeqCst) && start.elapsed() < Duration::from_secs(2) {
            thread::yield_now();
        }
        assert!(!blocked.load(Ordering::SeqCst));
        stop.store(true, Ordering::SeqCst);
        handle.join().unwrap();
    }

    /// Forwards to the real address space and logs every change.
    struct RecordingSpace {
        inner: LocalAddressSpace,
        changes: Arc<Mutex<Vec<String>>>,
        fail_writes: bool,
        maps_unreadable: Arc<AtomicBool>,
    }

    impl AddressSpace for RecordingSpace {
        fn regions(&self, sentinel: Option<RemotePtr>) -> Result<Vec<MemoryRegion>> {
            if self.maps_unreadable.load(Ordering::SeqCst) {
                return Err(CheckpointError::MapsUnreadable(self.inner.pid()));
            }
            self.inner.regions(sentinel)
        }
        fn read(&self, addr: RemotePtr, buf: &mut [u8]) -> Result<()> {
            self.inner.read(addr, buf)
        }
        fn write(&mut self, addr: RemotePtr, data: &[u8]) -> Result<()> {
            self.changes.lock().unwrap().push(format!("write {}", addr));
            if self.fail_writes {
                return Err(CheckpointError::Os(nix::errno::Errno::EFAULT));
            }
            self.inner.write(addr, data)
        }
        fn map(&mut self, region: &MemoryRegion, prot: Prot) -> Result<()> {
            self.changes.lock().unwrap().push(format!("map {}", region.start()));
            self.inner.map(region, prot)
        }
        fn unmap(&mut self, range: MemoryRange) -> Result<()> {
            self.changes.lock().unwrap().push(format!("unmap {}", range));
            self.inner.unmap(range)
        }
        fn protect(&mut self, range: MemoryRange, prot: Prot) -> Result<()> {
            self.changes.lock().unwrap().push(format!("protect {}", range));
            self.inner.protect(range, prot)
        }
    }

    struct Recorder {
        changes: Arc<Mutex<Vec<String>>>,
        maps_unreadable: Arc<AtomicBool>,
    }

    fn recording_fixture(scratch: &ScratchMapping, fail_writes: bool) -> (Fixture, Recorder) {
        let recorder = Recorder {
            changes: Arc::new(Mutex::new(Vec::new())),
            maps_unreadable: Arc::new(AtomicBool::new(false)),
        };
        let space = RecordingSpace {
            inner: LocalAddressSpace::new(),
            changes: recorder.changes.clone(),
            fail_writes,
            maps_unreadable: recorder.maps_unreadable.clone(),
        };
        (fixture_with_space(scratch, Box::new(space)), recorder)
    }

    /// Replace the first compressed chunk's bytes, keeping every checksum
    /// consistent, so only decompression can notice.
    fn spoil_first_chunk(path: &Path) {
        use crate::savestate::{Preamble, PREAMBLE_SIZE};
        let mut bytes = fs::read(path).unwrap();
        let mut pre_bytes = [0u8; PREAMBLE_SIZE];
        pre_bytes.copy_from_slice(&bytes[..PREAMBLE_SIZE]);
        let mut pre = Preamble::from_bytes(&pre_bytes);
        let payload = PREAMBLE_SIZE..PREAMBLE_SIZE + pre.payload_len as usize;
        for b in &mut bytes[payload.clone()][..8] {
            *b = 0xff;
        }
        pre.payload_crc = crc32fast::hash(&bytes[payload]);
        bytes[..PREAMBLE_SIZE].copy_from_slice(&pre.to_bytes());
        fs::write(path, bytes).unwrap();
    }

    #[test]
    fn corruption_is_caught_before_memory_changes() {
        let _guard = soft_dirty_test_guard();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.state");
        let scratch = ScratchMapping::new(4);
        for (i, b) in scratch.bytes_mut().iter_mut().enumerate() {
            *b = (i % 13) as u8;
        }
        let (mut f, rec) = recording_fixture(&scratch, false);
        let changes = rec.changes;
        f.checkpointer.save(&path).unwrap();
        spoil_first_chunk(&path);

        fill_random(scratch.bytes_mut(), 41);
        let before = scratch.bytes_mut().to_vec();
        match f.checkpointer.load(&path) {
            Err(e @ CheckpointError::Corrupt { .. }) => assert!(e.is_recoverable()),
            other => panic!("unexpected {:?}", other),
        }
        assert!(changes.lock().unwrap().is_empty());
        assert_eq!(scratch.bytes_mut(), &before[..]);

        // Truncation is caught too.
        let len = fs::metadata(&path).unwrap().len();
        let file = fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 10).unwrap();
        assert!(matches!(
            f.checkpointer.load(&path),
            Err(CheckpointError::Corrupt { .. })
        ));
        assert!(changes.lock().unwrap().is_empty());
        // The subject keeps running normally.
        assert_eq!(f.threads.phase(), crate::threads::Phase::Idle);
    }

    #[test]
    fn failure_after_mutation_calls_the_fatal_hook() {
        let _guard = soft_dirty_test_guard();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("g.state");
        let scratch = ScratchMapping::new(2);
        fill_random(scratch.bytes_mut(), 51);
        let (mut f, rec) = recording_fixture(&scratch, true);
        let changes = rec.changes;
        f.checkpointer.save(&path).unwrap();

        let hook_calls = Arc::new(AtomicU64::new(0));
        let calls = hook_calls.clone();
        f.checkpointer.set_fatal_hook(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
        });
        match f.checkpointer.load(&path) {
            Err(e @ CheckpointError::SubjectCorrupted(_)) => assert!(!e.is_recoverable()),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
        assert!(!changes.lock().unwrap().is_empty());
        assert_eq!(f.checkpointer.last_generation(), None);
        assert_eq!(f.threads.phase(), crate::threads::Phase::Idle);
    }

    #[test]
    fn failed_save_leaves_no_file_and_forces_a_full_snapshot() {
        let _guard = soft_dirty_test_guard();
        let dir = tempfile::tempdir().unwrap();
        let scratch = ScratchMapping::new(2);
        let mut f = fixture(&scratch);
        f.checkpointer.save(&dir.path().join("g1.state")).unwrap();
        let bad = dir.path().join("no-such-dir").join("g2.state");
        assert!(f.checkpointer.save(&bad).is_err());
        assert!(!bad.exists());
        assert_eq!(f.checkpointer.last_generation(), None);

        let g3 = dir.path().join("g3.state");
        f.checkpointer.save(&g3).unwrap();
        let header = SavestateFile::open(&g3).unwrap().meta().header.clone();
        assert!(header.parent.is_none());
        assert_eq!(header.generation, 3);
        assert_eq!(f.threads.phase(), crate::threads::Phase::Idle);
    }

    #[test]
    fn unreadable_maps_on_load_leave_the_subject_alone() {
        let _guard = soft_dirty_test_guard();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("g.state");
        let scratch = ScratchMapping::new(2);
        fill_random(scratch.bytes_mut(), 61);
        let (mut f, rec) = recording_fixture(&scratch, false);
        f.checkpointer.save(&path).unwrap();

        // Opened after the save, so a successful load would close it.
        let data_path = dir.path().join("later");
        let fd = nix::fcntl::open(
            data_path.as_path(),
            OFlag::O_RDWR | OFlag::O_CREAT,
            Mode::from_bits_truncate(0o600),
        )
        .unwrap();
        f.handles.open(&data_path, fd).unwrap();

        let hook_calls = Arc::new(AtomicU64::new(0));
        let calls = hook_calls.clone();
        f.checkpointer.set_fatal_hook(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
        });
        fill_random(scratch.bytes_mut(), 62);
        let before = scratch.bytes_mut().to_vec();
        rec.maps_unreadable.store(true, Ordering::SeqCst);
        match f.checkpointer.load(&path) {
            Err(e @ CheckpointError::MapsUnreadable(_)) => assert!(e.is_recoverable()),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(hook_calls.load(Ordering::SeqCst), 0);
        assert!(rec.changes.lock().unwrap().is_empty());
        assert_eq!(scratch.bytes_mut(), &before[..]);
        assert!(nix::fcntl::fcntl(fd, nix::fcntl::FcntlArg::F_GETFD).is_ok());
        assert!(f.handles.get(fd).is_some());
        assert_eq!(f.checkpointer.last_generation(), Some(1));
        assert_eq!(f.threads.phase(), crate::threads::Phase::Idle);

        rec.maps_unreadable.store(false, Ordering::SeqCst);
        f.checkpointer.load(&path).unwrap();
        assert!(f.handles.get(fd).is_none());
    }

    #[test]
    fn unreadable_maps_abort_the_save() {
        let _guard = soft_dirty_test_guard();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("g.state");
        let scratch = ScratchMapping::new(2);
        let (mut f, rec) = recording_fixture(&scratch, false);
        let worker = spawn_worker(&f.threads);

        rec.maps_unreadable.store(true, Ordering::SeqCst);
        assert!(matches!(
            f.checkpointer.save(&path),
            Err(CheckpointError::MapsUnreadable(_))
        ));
        assert!(!path.exists());
        assert!(!incomplete_path(&path).exists());
        assert_eq!(f.threads.phase(), crate::threads::Phase::Idle);
        let count = worker.count.load(Ordering::SeqCst);
        let start = std::time::Instant::now();
        while worker.count.load(Ordering::SeqCst) == count && start.elapsed() < Duration::from_secs(2) {
            thread::yield_now();
        }
        assert!(worker.count.load(Ordering::SeqCst) > count);

        rec.maps_unreadable.store(false, Ordering::SeqCst);
        f.checkpointer.save(&path).unwrap();
        assert!(worker.finish() > count);
    }

    /// Whole pages inside `bytes`, at least one page away from its ends.
    fn inner_pages(bytes: &[u8]) -> MemoryRange {
        let ps = page_size();
        let outer = MemoryRange::of_slice(bytes);
        let start = outer.start().ceil_page() + ps;
        let end = outer.end().floor_page() - ps;
        assert!(start < end, "buffer too small for page size {}", ps);
        MemoryRange::from_range(start, end)
    }

    fn bytes_of(range: MemoryRange) -> Vec<u8> {
        unsafe { std::slice::from_raw_parts(range.start().as_ptr::<u8>(), range.size()).to_vec() }
    }

    #[test]
    fn heap_and_stack_buffers_round_trip() {
        let _guard = soft_dirty_test_guard();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffers.state");
        let mut heap = vec![0u8; 16 * page_size()];
        let mut stack = [0u8; 64 << 10];
        fill_random(&mut heap, 71);
        fill_random(&mut stack, 72);
        black_box((&mut heap, &mut stack));
        // Callee frames sit below `stack`, so skip a few pages at its low end.
        let heap_pages = inner_pages(&heap);
        let stack_pages = {
            let r = inner_pages(&stack);
            MemoryRange::from_range(r.start() + 2 * page_size(), r.end())
        };
        let config = CheckpointConfig::with_ranges(vec![heap_pages, stack_pages]);
        let mut f = fixture_for(config, Box::new(LocalAddressSpace::new()));

        f.checkpointer.save(&path).unwrap();
        let (heap_saved, stack_saved) = (bytes_of(heap_pages), bytes_of(stack_pages));
        fill_random(&mut heap, 73);
        fill_random(&mut stack, 74);
        black_box((&mut heap, &mut stack));
        assert_ne!(bytes_of(heap_pages), heap_saved);

        f.checkpointer.load(&path).unwrap();
        black_box((&mut heap, &mut stack));
        assert_eq!(bytes_of(heap_pages), heap_saved);
        assert_eq!(bytes_of(stack_pages), stack_saved);
    }

    #[test]
    fn the_checkpointer_will_not_capture_its_own_memory() {
        let _guard = soft_dirty_test_guard();
        let dir = tempfile::tempdir().unwrap();
        let scratch = ScratchMapping::new(2);
        let config = CheckpointConfig {
            region_scope: crate::config::RegionScope::Exclude(Vec::new()),
            scan_descriptors: false,
            ..Default::default()
        };
        let mut f = fixture_for(config, Box::new(LocalAddressSpace::new()));
        let worker = spawn_worker(&f.threads);
        let path = dir.path().join("everything.state");
        assert!(matches!(
            f.checkpointer.save(&path),
            Err(CheckpointError::Unsupported(_))
        ));
        assert!(!path.exists());
        assert!(!incomplete_path(&path).exists());
        assert_eq!(f.threads.phase(), crate::threads::Phase::Idle);
        assert!(worker.finish() > 0);
        drop(f);

        // A savestate taken with a narrow scope is refused under a wide one.
        fill_random(scratch.bytes_mut(), 75);
        let (mut narrow, rec) = recording_fixture(&scratch, false);
        let narrow_path = dir.path().join("narrow.state");
        narrow.checkpointer.save(&narrow_path).unwrap();
        narrow.checkpointer.config.region_scope = crate::config::RegionScope::Exclude(Vec::new());
        assert!(matches!(
            narrow.checkpointer.load(&narrow_path),
            Err(CheckpointError::Unsupported(_))
        ));
        assert!(rec.changes.lock().unwrap().is_empty());
        assert_eq!(narrow.threads.phase(), crate::threads::Phase::Idle);
    }

    #[test]
    fn saving_again_to_the_same_path() {
        let _guard = soft_dirty_test_guard();
        let dir = tempfile::tempdir().unwrap();
        let slot = dir.path().join("slot.state");
        let scratch = ScratchMapping::new(4);
        fill_random(scratch.bytes_mut(), 81);
        let mut f = fixture(&scratch);

        f.checkpointer.save(&slot).unwrap();
        scratch.bytes_mut()[5] ^= 0xff;
        f.checkpointer.save(&slot).unwrap();
        let state2 = scratch.bytes_mut().to_vec();
        let header = SavestateFile::open(&slot).unwrap().meta().header.clone();
        assert_eq!(header.generation, 2);
        assert!(header.parent.is_none());

        fill_random(scratch.bytes_mut(), 82);
        f.checkpointer.load(&slot).unwrap();
        assert_eq!(scratch.bytes_mut(), &state2[..]);

        // Another file may still build on the slot.
        let next = dir.path().join("next.state");
        scratch.bytes_mut()[7] ^= 0xff;
        f.checkpointer.save(&next).unwrap();
        let state3 = scratch.bytes_mut().to_vec();
        if f.checkpointer.dirty_tracking() == DirtyTracking::SoftDirty {
            let header = SavestateFile::open(&next).unwrap().meta().header.clone();
            assert_eq!(header.parent.map(|p| p.generation), Some(2));
        }
        fill_random(scratch.bytes_mut(), 83);
        f.checkpointer.load(&next).unwrap();
        assert_eq!(scratch.bytes_mut(), &state3[..]);

        // Saving over an ancestor of the last generation starts a new chain.
        f.checkpointer.save(&slot).unwrap();
        let header = SavestateFile::open(&slot).unwrap().meta().header.clone();
        assert!(header.parent.is_none());
        f.checkpointer.load(&slot).unwrap();
        assert_eq!(scratch.bytes_mut(), &state3[..]);
    }
}
