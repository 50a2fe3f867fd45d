//! Page contents of captured regions: one pagemap entry per page and a
//! payload of raw or brotli compressed chunks.
//!
//! Compressed chunks form blocks. A block is a run of `Compressed` entries
//! that share one brotli stream; the stream is restarted after `block_pages`
//! compressed pages and after every `Raw` page. `Zero` and `Unchanged`
//! entries never touch the stream.

pub mod brotli_stream;
pub mod page_reader;
pub mod page_writer;
pub mod pagemap;

use serde::Serialize;

pub use page_reader::{GenerationChain, Page};
pub use page_writer::PageWriter;

/// What a save produced.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct SizeInfo {
    pub pages_total: u64,
    pub zero_pages: u64,
    pub unchanged_pages: u64,
    pub raw_pages: u64,
    pub compressed_pages: u64,
    /// Bytes of page chunks written so far.
    pub payload_bytes: u64,
    /// Size of the finished savestate file.
    pub file_bytes: u64,
}
