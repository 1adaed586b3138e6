//! Buffering-system configuration.
//!
//! Every knob has a default and a valid range; out-of-range values revert to
//! the default with a warning on stderr rather than failing construction.
//! A configuration can be built programmatically with the chainable setters
//! or loaded from a `buffering.conf` text file (`key=value` lines, `#`
//! comments, unknown keys ignored).

use std::fmt;
use std::fs;
use std::path::Path;

/// Default location of the configuration file, relative to the working
/// directory.
pub const CONFIG_FILE: &str = "buffering.conf";

const DEFAULT_PAGE_FACTOR: u32 = 1;
const DEFAULT_BUFFER_EXP: u32 = 20;
const DEFAULT_FANOUT: u32 = 64;
const DEFAULT_QUEUE_FACTOR: u32 = 8;
const DEFAULT_NUM_FLUSHERS: u32 = 2;
const DEFAULT_GUTTER_BYTES: usize = 32 * 1024;
const DEFAULT_WQ_BATCH_PER_ELM: usize = 1;

/// Page size reported by the OS, used as the write-granularity unit.
fn os_page_size() -> u32 {
    // SAFETY: sysconf with a valid name has no preconditions.
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page <= 0 {
        // Unqueryable page size; fall back to the conventional 4 KiB.
        4096
    } else {
        page as u32
    }
}

/// Validated parameters of a guttering system.
///
/// Construct with [`GutterConfig::default`] and the chainable setters, or
/// from a configuration file:
///
/// ```
/// use gutters::GutterConfig;
///
/// let conf = GutterConfig::default().fanout(32).queue_factor(4);
/// println!("{conf}");
/// ```
#[derive(Clone, Debug)]
pub struct GutterConfig {
    pub(crate) page_size: u32,
    pub(crate) buffer_size: u32,
    pub(crate) fanout: u32,
    pub(crate) queue_factor: u32,
    pub(crate) num_flushers: u32,
    pub(crate) gutter_bytes: usize,
    pub(crate) wq_batch_per_elm: usize,
}

impl Default for GutterConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_FACTOR * os_page_size(),
            buffer_size: 1 << DEFAULT_BUFFER_EXP,
            fanout: DEFAULT_FANOUT,
            queue_factor: DEFAULT_QUEUE_FACTOR,
            num_flushers: DEFAULT_NUM_FLUSHERS,
            gutter_bytes: DEFAULT_GUTTER_BYTES,
            wq_batch_per_elm: DEFAULT_WQ_BATCH_PER_ELM,
        }
    }
}

impl GutterConfig {
    /// Write granularity as a multiple of the OS page size. Range `[1, 50]`.
    pub fn page_factor(mut self, page_factor: u32) -> Self {
        let factor = if !(1..=50).contains(&page_factor) {
            eprintln!("WARNING: page_factor out of bounds [1,50] using default({DEFAULT_PAGE_FACTOR})");
            DEFAULT_PAGE_FACTOR
        } else {
            page_factor
        };
        self.page_size = factor * os_page_size();
        self
    }

    /// Internal-node buffer size as `2^buffer_exp` bytes. Range `[10, 30]`.
    ///
    /// Consumed by the disk-backed tree variant; carried here so one
    /// configuration file drives either backend.
    pub fn buffer_exp(mut self, buffer_exp: u32) -> Self {
        let exp = if !(10..=30).contains(&buffer_exp) {
            eprintln!("WARNING: buffer_exp out of bounds [10,30] using default({DEFAULT_BUFFER_EXP})");
            DEFAULT_BUFFER_EXP
        } else {
            buffer_exp
        };
        self.buffer_size = 1 << exp;
        self
    }

    /// Branching factor of per-vertex groupings. Range `[2, 2048]`.
    pub fn fanout(mut self, fanout: u32) -> Self {
        self.fanout = if !(2..=2048).contains(&fanout) {
            eprintln!("WARNING: fanout out of bounds [2,2048] using default({DEFAULT_FANOUT})");
            DEFAULT_FANOUT
        } else {
            fanout
        };
        self
    }

    /// Work-queue slots per worker. Range `[1, 1024]`.
    pub fn queue_factor(mut self, queue_factor: u32) -> Self {
        self.queue_factor = if !(1..=1024).contains(&queue_factor) {
            eprintln!("WARNING: queue_factor out of bounds [1,1024] using default({DEFAULT_QUEUE_FACTOR})");
            DEFAULT_QUEUE_FACTOR
        } else {
            queue_factor
        };
        self
    }

    /// Background flusher threads (disk-backed variant only). Range `[1, 20]`.
    pub fn num_flushers(mut self, num_flushers: u32) -> Self {
        self.num_flushers = if !(1..=20).contains(&num_flushers) {
            eprintln!("WARNING: num_flushers out of bounds [1,20] using default({DEFAULT_NUM_FLUSHERS})");
            DEFAULT_NUM_FLUSHERS
        } else {
            num_flushers
        };
        self
    }

    /// Leaf gutter capacity in bytes. Must be at least 1.
    pub fn gutter_bytes(mut self, gutter_bytes: usize) -> Self {
        self.gutter_bytes = if gutter_bytes < 1 {
            eprintln!("WARNING: gutter_bytes must be at least 1, using default(32 KiB)");
            DEFAULT_GUTTER_BYTES
        } else {
            gutter_bytes
        };
        self
    }

    /// Batches packed per work-queue slot. Must be at least 1.
    pub fn wq_batch_per_elm(mut self, wq_batch_per_elm: usize) -> Self {
        self.wq_batch_per_elm = if wq_batch_per_elm < 1 {
            eprintln!("WARNING: wq_batch_per_elm must be at least 1, using default(1)");
            DEFAULT_WQ_BATCH_PER_ELM
        } else {
            wq_batch_per_elm
        };
        self
    }

    /// Loads `buffering.conf` from the working directory, falling back to
    /// defaults (with a warning) when it does not exist.
    pub fn from_default_file() -> Self {
        Self::from_file(CONFIG_FILE)
    }

    /// Parses a configuration file.
    ///
    /// One `key=value` per line; `#` starts a comment; blank lines are
    /// allowed; unknown keys are ignored. Unreadable files and malformed or
    /// out-of-range values warn on stderr and leave the default in place.
    pub fn from_file(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(_) => {
                eprintln!(
                    "WARNING: Could not open buffering configuration file {}! Using default settings.",
                    path.display()
                );
                return Self::default();
            }
        };

        let mut conf = Self::default();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                eprintln!("WARNING: ignoring malformed configuration line: {line}");
                continue;
            };
            let (key, value) = (key.trim(), value.trim());

            match key {
                "page_factor" => match value.parse() {
                    Ok(v) => conf = conf.page_factor(v),
                    Err(_) => warn_unparsable(key, value),
                },
                "buffer_exp" => match value.parse() {
                    Ok(v) => conf = conf.buffer_exp(v),
                    Err(_) => warn_unparsable(key, value),
                },
                "fanout" => match value.parse() {
                    Ok(v) => conf = conf.fanout(v),
                    Err(_) => warn_unparsable(key, value),
                },
                "queue_factor" => match value.parse() {
                    Ok(v) => conf = conf.queue_factor(v),
                    Err(_) => warn_unparsable(key, value),
                },
                "num_flushers" => match value.parse() {
                    Ok(v) => conf = conf.num_flushers(v),
                    Err(_) => warn_unparsable(key, value),
                },
                "gutter_bytes" => match value.parse() {
                    Ok(v) => conf = conf.gutter_bytes(v),
                    Err(_) => warn_unparsable(key, value),
                },
                "wq_batch_per_elm" => match value.parse() {
                    Ok(v) => conf = conf.wq_batch_per_elm(v),
                    Err(_) => warn_unparsable(key, value),
                },
                _ => {} // unknown keys are reserved for other backends
            }
        }
        conf
    }
}

impl fmt::Display for GutterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "GutteringSystem Configuration:")?;
        writeln!(f, " Background threads = {}", self.num_flushers)?;
        writeln!(
            f,
            " Updates per batch  = {}",
            self.gutter_bytes / std::mem::size_of::<crate::NodeId>()
        )?;
        writeln!(f, " WQ elements factor = {}", self.queue_factor)?;
        writeln!(f, " WQ batches per elm = {}", self.wq_batch_per_elm)?;
        writeln!(f, " GutterTree params:")?;
        writeln!(f, "  Write granularity = {}", self.page_size)?;
        writeln!(f, "  Buffer size (KiB) = {}", self.buffer_size / 1024)?;
        write!(f, "  Fanout            = {}", self.fanout)
    }
}

fn warn_unparsable(key: &str, value: &str) {
    eprintln!("WARNING: could not parse {key}={value}, keeping default");
}
