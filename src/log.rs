use crate::kernel_metadata::errno_name;
use backtrace::Backtrace;
use nix::errno::errno;
use std::{
    collections::HashMap,
    env,
    env::var_os,
    fs::{File, OpenOptions},
    io::{self, BufWriter, Result, Write},
    path::Path,
    sync::{Mutex, MutexGuard, PoisonError},
};

#[derive(Clone)]
struct LogModule {
    name: String,
    level: LogLevel,
}

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub enum LogLevel {
    LogFatal,
    LogError,
    LogWarn,
    LogInfo,
    LogDebug,
}

pub use LogLevel::*;

struct LogGlobals {
    level_map: HashMap<String, LogLevel>,
    log_modules_cache: HashMap<String, LogModule>,
    /// Possibly buffered
    log_file: Box<dyn Write + Send>,
    default_level: LogLevel,
    /// Output kept back while a `HeldOutput` is alive.
    held: Option<Vec<u8>>,
    hold_depth: usize,
}

extern "C" fn flush_log_buffer() {
    // Never panic here: this runs from atexit() and from the abort path.
    if let Ok(mut lock) = LOG_GLOBALS.lock() {
        if let Some(held) = lock.held.take() {
            lock.log_file.write_all(&held).unwrap_or(());
        }
        lock.log_file.flush().unwrap_or(());
    }
}

lazy_static! {
    static ref LOG_GLOBALS: Mutex<LogGlobals> = {
        let maybe_filename = var_os("REWIND_LOG_FILE");
        let maybe_append_filename = var_os("REWIND_APPEND_LOG_FILE");
        let mut f: Box<dyn Write + Send> = if let Some(filename) = maybe_filename {
            match File::create(&filename) {
                Ok(file) => Box::new(file),
                Err(e) => {
                    eprintln!("Could not create `{:?}' named in REWIND_LOG_FILE: {:?}. Logging to stderr.", filename, e);
                    Box::new(io::stderr())
                }
            }
        } else if let Some(append_filename) = maybe_append_filename {
            match OpenOptions::new().append(true).create(true).open(&append_filename) {
                Ok(file) => Box::new(file),
                Err(e) => {
                    eprintln!("Could not append to `{:?}' named in REWIND_APPEND_LOG_FILE: {:?}. Logging to stderr.", append_filename, e);
                    Box::new(io::stderr())
                }
            }
        } else {
            Box::new(io::stderr())
        };

        if let Ok(buf_size) = env::var("REWIND_LOG_BUFFER") {
            match buf_size.parse::<usize>() {
                Ok(log_buffer_size) => f = Box::new(BufWriter::with_capacity(log_buffer_size, f)),
                Err(_) => eprintln!("Ignoring REWIND_LOG_BUFFER=`{}': not a number", buf_size),
            }
        }

        let ret = unsafe {
            libc::atexit(flush_log_buffer)
        };
        assert_eq!(ret, 0);

        let (default_level, level_map) = match env::var("REWIND_LOG") {
            Ok(rewind_log) => init_log_levels(&rewind_log),
            Err(_) => (LogError, HashMap::new())
        };

        Mutex::new(LogGlobals {
            level_map,
            log_modules_cache: HashMap::new(),
            log_file: f,
            default_level,
            held: None,
            hold_depth: 0,
        })
    };
}

fn log_level_string_to_level(log_level_string: &str) -> LogLevel {
    match log_level_string {
        "fatal" => LogFatal,
        "error" => LogError,
        "warn" => LogWarn,
        "info" => LogInfo,
        "debug" => LogDebug,
        _ => LogWarn,
    }
}

/// Parses `REWIND_LOG`, e.g. `all:warn,coordinator:debug`.
fn init_log_levels(rewind_log: &str) -> (LogLevel, HashMap<String, LogLevel>) {
    let mut hm: HashMap<String, LogLevel> = HashMap::new();
    let mut default_level = LogDebug;
    for mod_colon_level in rewind_log.split(',') {
        let res: Vec<&str> = mod_colon_level.splitn(2, ':').collect();
        if res.len() == 2 {
            let mod_name = res[0].trim();
            let log_level_string = res[1].trim();
            if mod_name == "all" {
                default_level = log_level_string_to_level(log_level_string);
            } else {
                hm.insert(
                    mod_name.to_owned(),
                    log_level_string_to_level(log_level_string),
                );
            }
        }
    }
    (default_level, hm)
}

/// Given a module name, what is its log level?
fn get_log_level(module_name: &str, l: &MutexGuard<LogGlobals>) -> LogLevel {
    // We DONT lowercase here as filenames are usually case sensitive on Linux.
    match l.level_map.get(module_name) {
        Some(log_level) => *log_level,
        None => l.default_level,
    }
}

/// Given a filename what is the corresponding module name?
fn filename_to_module_name(filename: &str) -> String {
    // Note: DONT lowercase this.
    Path::new(filename)
        .file_stem()
        .map_or_else(String::new, |s| s.to_string_lossy().to_string())
}

fn get_log_module(filename: &str, l: &mut MutexGuard<LogGlobals>) -> LogModule {
    if let Some(log_module) = l.log_modules_cache.get(filename) {
        return log_module.to_owned();
    }

    let name = filename_to_module_name(filename);
    let level = get_log_level(&name, l);
    let m = LogModule { level, name };
    l.log_modules_cache.insert(filename.to_owned(), m.clone());
    m
}

/// Change the level of every module. Mostly useful from tests and the CLI.
pub fn set_all_logging(level: LogLevel) {
    let mut l = LOG_GLOBALS.lock().unwrap_or_else(PoisonError::into_inner);
    l.default_level = level;
    l.level_map.clear();
    l.log_modules_cache.clear();
}

pub fn set_logging(module_name: &str, level: LogLevel) {
    let mut l = LOG_GLOBALS.lock().unwrap_or_else(PoisonError::into_inner);
    l.level_map.insert(module_name.to_owned(), level);
    l.log_modules_cache.clear();
}

/// Keeps log lines in memory until dropped. Holds nest; the outermost one
/// writes everything out.
pub struct HeldOutput(());

/// Stop writing to the log file or stderr until the guard goes away. Other
/// threads may be frozen while holding the stderr lock, so the checkpoint
/// thread holds its output while they are. `capacity` bytes are reserved up
/// front.
pub fn hold_output(capacity: usize) -> HeldOutput {
    let mut l = LOG_GLOBALS.lock().unwrap_or_else(PoisonError::into_inner);
    l.hold_depth += 1;
    if l.held.is_none() {
        l.held = Some(Vec::with_capacity(capacity));
    }
    HeldOutput(())
}

impl Drop for HeldOutput {
    fn drop(&mut self) {
        let mut l = LOG_GLOBALS.lock().unwrap_or_else(PoisonError::into_inner);
        l.hold_depth = l.hold_depth.saturating_sub(1);
        if l.hold_depth == 0 {
            if let Some(held) = l.held.take() {
                l.log_file.write_all(&held).unwrap_or(());
            }
        }
    }
}

fn log_name(level: LogLevel) -> &'static str {
    match level {
        LogFatal => "FATAL",
        LogError => "ERROR",
        LogWarn => "WARN",
        LogInfo => "INFO",
        LogDebug => "DEBUG",
    }
}

pub struct NewLineTerminatingOstream {
    enabled: bool,
    message: Vec<u8>,
    lock: MutexGuard<'static, LogGlobals>,
}

impl NewLineTerminatingOstream {
    fn new(
        level: LogLevel,
        filename: &str,
        line: u32,
        module_path: &str,
        always_enabled: bool,
    ) -> Option<NewLineTerminatingOstream> {
        // Capture errno before anything below gets a chance to clobber it.
        let err = errno();
        let mut lock = match LOG_GLOBALS.lock() {
            Ok(lock) => lock,
            Err(poisoned) => poisoned.into_inner(),
        };
        let m = get_log_module(filename, &mut lock);
        let enabled = always_enabled || level <= m.level;
        if !enabled {
            return None;
        }

        let mut stream = NewLineTerminatingOstream {
            message: Vec::new(),
            enabled,
            lock,
        };
        if level == LogDebug {
            write!(stream, "[{}] ", m.name).unwrap_or(());
        } else {
            write_prefix_with_errno(&mut stream, level, filename, line, module_path, err);
        }

        Some(stream)
    }
}

/// Low level. Use is_logging!() macro instead.
pub fn is_logging(level: LogLevel, filename: &str, _line: u32, _func_name: &str) -> bool {
    let mut lock = LOG_GLOBALS.lock().unwrap_or_else(PoisonError::into_inner);
    let m = get_log_module(filename, &mut lock);
    level <= m.level
}

impl Drop for NewLineTerminatingOstream {
    fn drop(&mut self) {
        if self.enabled {
            self.write(b"\n").unwrap_or(0);
            // Flushes self.message *to* the log file, not the log file itself.
            self.flush().unwrap_or(());
        }
    }
}

impl Write for NewLineTerminatingOstream {
    fn flush(&mut self) -> Result<()> {
        if !self.message.is_empty() && self.enabled {
            match self.lock.held.as_mut() {
                Some(held) => held.extend_from_slice(&self.message),
                None => self.lock.log_file.write_all(&self.message)?,
            }
        }
        self.message.clear();
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.enabled {
            self.message.extend_from_slice(buf);
        }

        // Pretend these were written even if the stream is disabled, otherwise
        // write!() turns it into a WriteZero error.
        Ok(buf.len())
    }
}

pub fn write_prefix(
    stream: &mut dyn Write,
    level: LogLevel,
    filename: &str,
    line: u32,
    module_path: &str,
) {
    write_prefix_with_errno(stream, level, filename, line, module_path, errno())
}

fn write_prefix_with_errno(
    stream: &mut dyn Write,
    level: LogLevel,
    filename: &str,
    line: u32,
    _module_path: &str,
    err: i32,
) {
    write!(stream, "[{} {}:{}", log_name(level), filename, line).unwrap_or(());
    if level <= LogWarn && err != 0 {
        write!(stream, " errno: {}", errno_name(err)).unwrap_or(());
    }
    write!(stream, "] ").unwrap_or(());
}

/// This is almost always not the method you want. Use log!() macro instead
pub fn log(
    log_level: LogLevel,
    filename: &str,
    line: u32,
    module_path: &str,
    always_enabled: bool,
) -> Option<NewLineTerminatingOstream> {
    NewLineTerminatingOstream::new(log_level, filename, line, module_path, always_enabled)
}

/// Outputs to (possibly write buffered) log file (or stderr if no log file was specified)
/// After this program continues normally.
#[macro_export]
macro_rules! log {
    ($log_level:expr, $($args:tt)+) => {
        {
            use std::io::Write;
            let maybe_stream = $crate::log::log(
                $log_level,
                file!(),
                line!(),
                module_path!(),
                false
            );
            match maybe_stream {
                Some(mut stream) => write!(stream, $($args)+).unwrap_or(()),
                None => ()
            }
        }
    };
}

#[macro_export]
macro_rules! is_logging {
    ($log_level:expr) => {
        $crate::log::is_logging($log_level, file!(), line!(), module_path!())
    };
}

/// Outputs to (possibly write buffered) log file (or stderr if no log file was specified)
/// Prints out the backtrace to stderr and aborts.
#[macro_export]
macro_rules! fatal {
    ($($args:tt)+) => {
        {
            {
                use std::io::Write;
                let maybe_stream = $crate::log::log(
                    $crate::log::LogFatal,
                    file!(),
                    line!(),
                    module_path!(),
                    true
                );
                match maybe_stream {
                   Some(mut stream) => write!(stream, $($args)+).unwrap_or(()),
                   None => ()
                }
            }
            $crate::log::notifying_abort(backtrace::Backtrace::new());
        }
    };
}

/// Output to stderr always. No backtrace -- simply exit.
#[macro_export]
macro_rules! clean_fatal {
    ($($args:tt)+) => {
        {
            use std::io::stderr;
            $crate::log::write_prefix(&mut stderr(), $crate::log::LogLevel::LogFatal, file!(), line!(), module_path!());
            eprintln!($($args)+);
            std::process::exit(1);
        }
    };
}

/// Dump the stacktrace and abort.
pub fn notifying_abort(bt: Backtrace) -> ! {
    flush_log_buffer();
    dump_rewind_stack(bt);
    std::process::abort();
}

fn dump_rewind_stack(bt: Backtrace) {
    eprintln!("=== Start rewind backtrace:");
    eprintln!("{:?}", bt);
    eprintln!("=== End rewind backtrace");
}
