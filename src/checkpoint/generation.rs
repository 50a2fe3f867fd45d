use crate::{
    address_space::memory_region::MemoryRegion,
    page_store::GenerationChain,
    savestate::ParentRef,
};
use std::{
    fs,
    path::{Path, PathBuf},
};

/// The generation the subject's memory currently derives from.
#[derive(Clone, Debug)]
pub struct GenerationInfo {
    pub generation: u64,
    /// Absolute.
    pub path: PathBuf,
    pub payload_crc: u32,
    pub chain_depth: u32,
    pub regions: Vec<MemoryRegion>,
    /// Files a child of this generation would depend on: `path` first, then
    /// every ancestor's.
    pub chain: Vec<PathBuf>,
}

impl GenerationInfo {
    /// The newest generation of a chain that was just loaded.
    pub fn from_chain(chain: &GenerationChain) -> GenerationInfo {
        let newest = chain.newest();
        let header = &newest.meta().header;
        let chain: Vec<PathBuf> = chain.files().map(|f| resolve_path(f.path())).collect();
        GenerationInfo {
            generation: header.generation,
            path: chain[0].clone(),
            payload_crc: newest.preamble().payload_crc,
            chain_depth: header.chain_depth,
            regions: newest.meta().regions.clone(),
            chain,
        }
    }

    pub fn parent_ref(&self) -> ParentRef {
        ParentRef {
            generation: self.generation,
            path: self.path.clone(),
            payload_crc: self.payload_crc,
        }
    }
}

/// `path` made absolute with symlinks resolved, also when the file itself
/// does not exist yet.
pub fn resolve_path(path: &Path) -> PathBuf {
    if let Ok(p) = fs::canonicalize(path) {
        return p;
    }
    let dir = match path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d,
        _ => Path::new("."),
    };
    match (fs::canonicalize(dir), path.file_name()) {
        (Ok(dir), Some(name)) => dir.join(name),
        _ => path.to_owned(),
    }
}

/// Generation ids and the parent of the next save.
#[derive(Debug)]
pub struct Generations {
    next: u64,
    last: Option<GenerationInfo>,
}

impl Default for Generations {
    fn default() -> Self {
        Self::new()
    }
}

impl Generations {
    pub fn new() -> Generations {
        Generations {
            next: 1,
            last: None,
        }
    }

    pub fn next_id(&mut self) -> u64 {
        let id = self.next;
        self.next += 1;
        id
    }

    pub fn last(&self) -> Option<&GenerationInfo> {
        self.last.as_ref()
    }

    /// The generation a save to `target` (resolved) may refer to, if any:
    /// the last one saved or loaded, as long as its file is still there, the
    /// chain stays shorter than `max_chain_depth` and writing `target` does
    /// not replace a file of the chain.
    pub fn parent_for_next(&self, max_chain_depth: u32, target: &Path) -> Option<&GenerationInfo> {
        self.last.as_ref().filter(|g| {
            g.chain_depth + 1 < max_chain_depth
                && g.path.exists()
                && !g.chain.iter().any(|p| p == target)
        })
    }

    pub fn record(&mut self, info: GenerationInfo) {
        self.next = self.next.max(info.generation + 1);
        self.last = Some(info);
    }

    /// Memory no longer matches any generation; the next save is full.
    pub fn forget(&mut self) {
        self.last = None;
    }
}
