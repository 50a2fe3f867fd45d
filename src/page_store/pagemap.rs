use std::convert::TryInto;

/// On-disk flag byte of a pagemap entry.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PageFlag {
    Zero = 0,
    Unchanged = 1,
    Raw = 2,
    Compressed = 3,
}

/// How one page of a captured region is stored. Entries appear in address
/// order across all captured regions, and the n-th entry with a payload owns
/// the n-th payload chunk.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PagemapEntry {
    Zero,
    /// Same contents as in the parent generation.
    Unchanged,
    /// A page sized chunk, stored verbatim.
    Raw,
    /// A brotli chunk of the given length.
    Compressed(u32),
}

impl PagemapEntry {
    pub fn flag(self) -> PageFlag {
        match self {
            PagemapEntry::Zero => PageFlag::Zero,
            PagemapEntry::Unchanged => PageFlag::Unchanged,
            PagemapEntry::Raw => PageFlag::Raw,
            PagemapEntry::Compressed(_) => PageFlag::Compressed,
        }
    }

    /// Number of payload bytes this entry owns.
    pub fn payload_len(self, page_size: usize) -> usize {
        match self {
            PagemapEntry::Zero | PagemapEntry::Unchanged => 0,
            PagemapEntry::Raw => page_size,
            PagemapEntry::Compressed(len) => len as usize,
        }
    }
}

#[derive(Default)]
pub struct PagemapWriter {
    buf: Vec<u8>,
    entries: usize,
}

impl PagemapWriter {
    pub fn new() -> PagemapWriter {
        Default::default()
    }

    pub fn push(&mut self, entry: PagemapEntry) {
        self.buf.push(entry.flag() as u8);
        if let PagemapEntry::Compressed(len) = entry {
            self.buf.extend_from_slice(&len.to_le_bytes());
        }
        self.entries += 1;
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Decodes a pagemap stream. Yields `Err` with a description on malformed
/// input and stops afterwards.
pub struct PagemapReader<'a> {
    buf: &'a [u8],
    failed: bool,
}

impl<'a> PagemapReader<'a> {
    pub fn new(buf: &'a [u8]) -> PagemapReader<'a> {
        PagemapReader { buf, failed: false }
    }
}

impl<'a> Iterator for PagemapReader<'a> {
    type Item = Result<PagemapEntry, String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let (&flag, rest) = self.buf.split_first()?;
        let entry = match flag {
            f if f == PageFlag::Zero as u8 => PagemapEntry::Zero,
            f if f == PageFlag::Unchanged as u8 => PagemapEntry::Unchanged,
            f if f == PageFlag::Raw as u8 => PagemapEntry::Raw,
            f if f == PageFlag::Compressed as u8 => {
                if rest.len() < 4 {
                    self.failed = true;
                    return Some(Err("truncated chunk length".into()));
                }
                let len = u32::from_le_bytes(rest[..4].try_into().unwrap_or_default());
                self.buf = &rest[4..];
                return Some(Ok(PagemapEntry::Compressed(len)));
            }
            f => {
                self.failed = true;
                return Some(Err(format!("unknown page flag {}", f)));
            }
        };
        self.buf = rest;
        Some(Ok(entry))
    }
}
