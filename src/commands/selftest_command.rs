use super::{
    exit_result::ExitResult,
    rewind_options::{RewindOptions, RewindSubCommand},
    RewindCommand,
};
use crate::{
    address_space::memory_range::MemoryRange,
    checkpoint::Checkpointer,
    config::CheckpointConfig,
    file_handles::FileHandleRegistry,
    log::LogLevel::LogInfo,
    remote_ptr::RemotePtr,
    threads::ThreadRegistry,
    util::{page_size, tmp_dir},
};
use nix::{
    fcntl::OFlag,
    sys::mman::{mmap, munmap, MapFlags, ProtFlags},
    unistd::{close, getpid, read, write},
};
use std::{
    error::Error,
    fs,
    path::PathBuf,
    ptr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

const PIPE_MESSAGE: &[u8] = b"rewind selftest";

pub struct SelftestCommand {
    pages: usize,
    threads: usize,
    rounds: usize,
    dir: Option<PathBuf>,
    full: bool,
}

impl SelftestCommand {
    pub fn new(options: &RewindOptions) -> SelftestCommand {
        match options.cmd.clone() {
            RewindSubCommand::Selftest {
                pages,
                threads,
                rounds,
                dir,
                full,
            } => SelftestCommand {
                pages,
                threads,
                rounds,
                dir,
                full,
            },
            _ => panic!("Unexpected RewindSubCommand variant. Not a `Selftest` variant!"),
        }
    }
}

/// Anonymous memory the self test saves and restores.
struct Scratch {
    range: MemoryRange,
}

impl Scratch {
    fn new(pages: usize) -> nix::Result<Scratch> {
        let len = pages * page_size();
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
        Ok(Scratch {
            range: MemoryRange::new_range(RemotePtr::from_ptr(addr), len),
        })
    }

    #[allow(clippy::mut_from_ref)]
    fn bytes(&self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.range.start().as_mut_ptr(), self.range.size()) }
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        unsafe { munmap(self.range.start().as_void_ptr(), self.range.size()).unwrap_or(()) };
    }
}

/// Every fourth page stays zero.
fn fill(bytes: &mut [u8], seed: usize) {
    for (i, page) in bytes.chunks_mut(page_size()).enumerate() {
        if i % 4 == 3 {
            page.iter_mut().for_each(|b| *b = 0);
            continue;
        }
        for (j, b) in page.iter_mut().enumerate() {
            *b = (i.wrapping_mul(31) ^ j.wrapping_mul(7) ^ (j >> 5) ^ seed.wrapping_mul(13)) as u8;
        }
    }
}

/// Change one byte in every third page.
fn disturb(bytes: &mut [u8], round: usize) {
    let ps = page_size();
    for i in (round % 3..bytes.len() / ps).step_by(3) {
        bytes[i * ps + round % ps] ^= 0x5a;
    }
}

struct Workers {
    stop: Arc<AtomicBool>,
    counts: Vec<Arc<AtomicU64>>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl Workers {
    fn spawn(threads: &Arc<ThreadRegistry>, n: usize) -> Workers {
        let stop = Arc::new(AtomicBool::new(false));
        let mut counts = Vec::new();
        let mut handles = Vec::new();
        for _ in 0..n {
            let count = Arc::new(AtomicU64::new(0));
            let (t, s, c) = (threads.clone(), stop.clone(), count.clone());
            handles.push(thread::spawn(move || {
                let _reg = t.register();
                while !s.load(Ordering::SeqCst) {
                    c.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_micros(500));
                }
            }));
            counts.push(count);
        }
        while counts.iter().any(|c| c.load(Ordering::SeqCst) == 0) {
            thread::yield_now();
        }
        Workers {
            stop,
            counts,
            handles,
        }
    }

    fn snapshot(&self) -> Vec<u64> {
        self.counts.iter().map(|c| c.load(Ordering::SeqCst)).collect()
    }

    fn join(self) {
        self.stop.store(true, Ordering::SeqCst);
        for h in self.handles {
            h.join().unwrap_or(());
        }
    }
}

/// Run the test and return one line per round.
fn run_selftest(
    pages: usize,
    nthreads: usize,
    rounds: usize,
    dir: &std::path::Path,
    full: bool,
) -> Result<Vec<String>, Box<dyn Error>> {
    let handles = Arc::new(FileHandleRegistry::new());
    let threads = Arc::new(ThreadRegistry::new());
    let _me = threads.register_checkpoint_thread()?;
    let scratch = Scratch::new(pages)?;
    let config = CheckpointConfig {
        incremental: !full,
        ..CheckpointConfig::with_ranges(vec![scratch.range])
    };
    let mut checkpointer = Checkpointer::new(config, handles.clone(), threads.clone())?;
    log!(LogInfo, "Self test with {:?} dirty tracking", checkpointer.dirty_tracking());

    let workers = Workers::spawn(&threads, nthreads);
    let (r, w) = handles.open_pipe(OFlag::O_NONBLOCK)?;
    write(w, PIPE_MESSAGE)?;
    fill(scratch.bytes(), 0);

    let mut lines = Vec::new();
    let result = (|| -> Result<(), Box<dyn Error>> {
        for round in 0..rounds {
            let path = dir.join(format!("selftest-{}.state", round));
            let info = checkpointer.save(&path)?;
            let expected = scratch.bytes().to_vec();

            fill(scratch.bytes(), round + 100);
            write(w, b"noise")?;
            checkpointer.load(&path)?;

            if scratch.bytes() != &expected[..] {
                return Err(format!("round {}: memory differs after load", round).into());
            }
            let mut buf = [0u8; 64];
            let n = read(r, &mut buf)?;
            if &buf[..n] != PIPE_MESSAGE {
                return Err(format!("round {}: pipe holds {:?}", round, &buf[..n]).into());
            }
            write(w, PIPE_MESSAGE)?;

            let before = workers.snapshot();
            thread::sleep(Duration::from_millis(20));
            if workers.snapshot().iter().zip(&before).any(|(a, b)| a <= b) {
                return Err(format!("round {}: a worker did not resume", round).into());
            }

            lines.push(format!(
                "round {}: generation {}, {} pages, {} zero, {} unchanged, {} raw, {} compressed, {} bytes",
                round,
                checkpointer.last_generation().unwrap_or(0),
                info.pages_total,
                info.zero_pages,
                info.unchanged_pages,
                info.raw_pages,
                info.compressed_pages,
                info.file_bytes
            ));
            disturb(scratch.bytes(), round);
        }
        Ok(())
    })();

    workers.join();
    for fd in [r, w].iter() {
        handles.close(*fd);
        close(*fd).unwrap_or(());
    }
    result.map(|()| lines)
}

impl RewindCommand for SelftestCommand {
    fn run(&mut self) -> ExitResult<()> {
        let (dir, owned) = match &self.dir {
            Some(d) => (d.clone(), false),
            None => (
                tmp_dir().join(format!("rewind-selftest-{}", getpid())),
                true,
            ),
        };
        if let Err(e) = fs::create_dir_all(&dir) {
            return ExitResult::err_from(e, 1);
        }
        let result = run_selftest(self.pages, self.threads, self.rounds, &dir, self.full);
        if owned {
            fs::remove_dir_all(&dir).unwrap_or(());
        }
        match result {
            Ok(lines) => {
                for line in lines {
                    println!("{}", line);
                }
                println!("ok");
                ExitResult::Ok(())
            }
            Err(e) => ExitResult::Err(e, 1),
        }
    }
}
