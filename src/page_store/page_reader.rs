use super::{
    brotli_stream::BrotliDecoder,
    pagemap::{PagemapEntry, PagemapReader},
};
use crate::{
    address_space::memory_range::{MemoryRange, MemoryRangeKey},
    error::{CheckpointError, Result},
    log::LogLevel::LogDebug,
    remote_ptr::RemotePtr,
    savestate::{SavestateFile, SavestateFlags},
};
use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
};

/// Decoded blocks kept around while loading.
const BLOCK_CACHE_SIZE: usize = 8;

/// Contents of one page.
#[derive(Debug, Eq, PartialEq)]
pub enum Page<'a> {
    Zero,
    Data(&'a [u8]),
}

#[derive(Copy, Clone, Debug)]
struct IndexedEntry {
    addr: RemotePtr,
    entry: PagemapEntry,
    /// Payload offset of the chunk, if the entry has one.
    offset: usize,
    /// Block and position within it, for `Compressed` entries.
    block: usize,
    slot: usize,
}

/// Address lookup and chunk offsets for one savestate.
struct PageIndex {
    /// Captured region -> index of its first entry.
    regions: BTreeMap<MemoryRangeKey, usize>,
    entries: Vec<IndexedEntry>,
    /// Entry indices of each block, in stream order.
    blocks: Vec<Vec<usize>>,
}

impl PageIndex {
    fn build(file: &SavestateFile) -> Result<PageIndex> {
        let corrupt = |reason: String| CheckpointError::corrupt(file.path(), reason);
        let header = &file.meta().header;
        let ps = header.page_size as usize;
        if ps == 0 || !ps.is_power_of_two() {
            return Err(corrupt(format!("page size {}", ps)));
        }
        let block_pages = header.block_pages.max(1) as usize;
        let incremental = file.preamble().flags().contains(SavestateFlags::INCREMENTAL);

        let mut regions = BTreeMap::new();
        let mut addrs = Vec::new();
        for r in file.meta().regions.iter().filter(|r| r.has_contents()) {
            if r.size() % ps != 0 || r.start().as_usize() % ps != 0 {
                return Err(corrupt(format!("region {} is not page aligned", r.range())));
            }
            if regions
                .insert(MemoryRangeKey(r.range()), addrs.len())
                .is_some()
            {
                return Err(corrupt(format!("region {} overlaps another", r.range())));
            }
            addrs.extend((0..r.size() / ps).map(|i| r.start() + i * ps));
        }

        let mut entries = Vec::with_capacity(addrs.len());
        let mut blocks: Vec<Vec<usize>> = Vec::new();
        let mut need_new_block = true;
        let mut offset = 0usize;
        for (i, entry) in PagemapReader::new(file.pagemap()).enumerate() {
            let entry = entry.map_err(|e| corrupt(format!("pagemap: {}", e)))?;
            let addr = match addrs.get(i) {
                Some(&a) => a,
                None => {
                    return Err(corrupt(format!(
                        "pagemap has more entries than the {} captured pages",
                        addrs.len()
                    )))
                }
            };
            let (mut block, mut slot) = (0, 0);
            match entry {
                PagemapEntry::Unchanged if !incremental => {
                    return Err(corrupt(format!("unchanged page at {} without a parent", addr)));
                }
                PagemapEntry::Compressed(_) => {
                    if need_new_block || blocks.last().map_or(true, |b| b.len() == block_pages) {
                        blocks.push(Vec::new());
                        need_new_block = false;
                    }
                    block = blocks.len() - 1;
                    slot = blocks[block].len();
                    blocks[block].push(i);
                }
                PagemapEntry::Raw => need_new_block = true,
                _ => (),
            }
            entries.push(IndexedEntry {
                addr,
                entry,
                offset,
                block,
                slot,
            });
            offset += entry.payload_len(ps);
        }

        if entries.len() != addrs.len() {
            return Err(corrupt(format!(
                "pagemap has {} entries for {} captured pages",
                entries.len(),
                addrs.len()
            )));
        }
        if offset != file.payload().len() {
            return Err(corrupt(format!(
                "chunks add up to {} bytes but the payload holds {}",
                offset,
                file.payload().len()
            )));
        }
        Ok(PageIndex {
            regions,
            entries,
            blocks,
        })
    }

    fn lookup(&self, addr: RemotePtr, ps: usize) -> Option<&IndexedEntry> {
        let key = MemoryRangeKey(MemoryRange::new_range(addr.floor_page(), 1));
        let (region, first) = self.regions.get_key_value(&key)?;
        self.entries.get(first + (addr - region.start()) / ps)
    }
}

struct Generation {
    file: SavestateFile,
    index: PageIndex,
}

impl Generation {
    fn page_size(&self) -> usize {
        self.file.meta().header.page_size as usize
    }

    fn decode_block(&self, block: usize) -> Result<Vec<u8>> {
        let ps = self.page_size();
        let members = &self.index.blocks[block];
        let payload = self.file.payload();
        let mut out = vec![0u8; members.len() * ps];
        let mut decoder = BrotliDecoder::new()?;
        for (slot, &i) in members.iter().enumerate() {
            let e = &self.index.entries[i];
            let chunk = &payload[e.offset..e.offset + e.entry.payload_len(ps)];
            decoder
                .decompress_chunk(chunk, &mut out[slot * ps..(slot + 1) * ps])
                .map_err(|reason| {
                    CheckpointError::corrupt(
                        self.file.path(),
                        format!("page at {}: {}", e.addr, reason),
                    )
                })?;
        }
        Ok(out)
    }
}

/// A savestate together with all the ancestors its `Unchanged` pages refer
/// to, newest first.
pub struct GenerationChain {
    gens: Vec<Generation>,
    cache: HashMap<(usize, usize), Vec<u8>>,
    page_buf: Vec<u8>,
}

impl GenerationChain {
    /// Open `path` and its parents, checking everything that can be checked
    /// without decompressing: checksums, chunk lengths, entry counts and
    /// that every `Unchanged` page is captured by the parent.
    pub fn open(path: &Path) -> Result<GenerationChain> {
        let mut gens: Vec<Generation> = Vec::new();
        let mut file = SavestateFile::open(path)?;
        loop {
            let index = PageIndex::build(&file)?;
            let parent = file.meta().header.parent.clone();
            gens.push(Generation { file, index });
            let child = &gens[gens.len() - 1].file;
            let parent = match parent {
                Some(p) => p,
                None => break,
            };
            let corrupt = |reason: String| CheckpointError::corrupt(child.path(), reason);
            if !parent.path.exists() {
                return Err(corrupt(format!(
                    "parent generation {} at {:?} is missing",
                    parent.generation, parent.path
                )));
            }
            let pfile = SavestateFile::open(&parent.path)?;
            if pfile.generation() != parent.generation {
                return Err(corrupt(format!(
                    "{:?} holds generation {} instead of {}",
                    parent.path,
                    pfile.generation(),
                    parent.generation
                )));
            }
            if pfile.preamble().payload_crc != parent.payload_crc {
                return Err(corrupt(format!("{:?} was replaced", parent.path)));
            }
            let (ph, ch) = (&pfile.meta().header, &child.meta().header);
            if ph.page_size != ch.page_size {
                return Err(corrupt("parent has a different page size".into()));
            }
            if ph.chain_depth + 1 != ch.chain_depth {
                return Err(corrupt(format!(
                    "chain depth {} but parent has depth {}",
                    ch.chain_depth, ph.chain_depth
                )));
            }
            file = pfile;
        }

        for pair in gens.windows(2) {
            let (child, parent) = (&pair[0], &pair[1]);
            let ps = child.page_size();
            for e in &child.index.entries {
                if e.entry == PagemapEntry::Unchanged && parent.index.lookup(e.addr, ps).is_none() {
                    return Err(CheckpointError::corrupt(
                        child.file.path(),
                        format!("unchanged page at {} is not in the parent", e.addr),
                    ));
                }
            }
        }

        log!(LogDebug, "Opened {:?} with {} generation(s)", path, gens.len());
        let page_buf = vec![0u8; gens[0].page_size()];
        Ok(GenerationChain {
            gens,
            cache: HashMap::new(),
            page_buf,
        })
    }

    /// Decompress every block of every generation once.
    pub fn verify(&self) -> Result<()> {
        for gen in &self.gens {
            for block in 0..gen.index.blocks.len() {
                gen.decode_block(block)?;
            }
        }
        Ok(())
    }

    pub fn newest(&self) -> &SavestateFile {
        &self.gens[0].file
    }

    /// Every file of the chain, newest first.
    pub fn files(&self) -> impl Iterator<Item = &SavestateFile> {
        self.gens.iter().map(|g| &g.file)
    }

    pub fn page_size(&self) -> usize {
        self.gens[0].page_size()
    }

    /// The memory holding the savestates and the decoded pages.
    pub fn buffers(&self) -> Vec<MemoryRange> {
        self.gens
            .iter()
            .map(|g| MemoryRange::of_slice(g.file.bytes()))
            .chain(self.cache.values().map(|b| MemoryRange::of_slice(b)))
            .chain(std::iter::once(MemoryRange::of_slice(&self.page_buf)))
            .collect()
    }

    /// The contents of the page at `addr`, which must lie in a captured
    /// region of the newest generation.
    pub fn page(&mut self, addr: RemotePtr) -> Result<Page<'_>> {
        let mut gen = 0;
        loop {
            let g = &self.gens[gen];
            let e = match g.index.lookup(addr, g.page_size()) {
                Some(e) => *e,
                None => {
                    return Err(CheckpointError::corrupt(
                        g.file.path(),
                        format!("no page at {}", addr),
                    ))
                }
            };
            let ps = g.page_size();
            match e.entry {
                PagemapEntry::Zero => return Ok(Page::Zero),
                PagemapEntry::Unchanged => {
                    gen += 1;
                    if gen == self.gens.len() {
                        return Err(CheckpointError::corrupt(
                            g.file.path(),
                            format!("unchanged page at {} has no parent", addr),
                        ));
                    }
                }
                PagemapEntry::Raw => {
                    self.page_buf
                        .copy_from_slice(&g.file.payload()[e.offset..e.offset + ps]);
                    return Ok(Page::Data(&self.page_buf));
                }
                PagemapEntry::Compressed(_) => {
                    let key = (gen, e.block);
                    if !self.cache.contains_key(&key) {
                        let data = g.decode_block(e.block)?;
                        if self.cache.len() >= BLOCK_CACHE_SIZE {
                            self.cache.clear();
                        }
                        self.cache.insert(key, data);
                    }
                    if let Some(data) = self.cache.get(&key) {
                        self.page_buf
                            .copy_from_slice(&data[e.slot * ps..(e.slot + 1) * ps]);
                    }
                    return Ok(Page::Data(&self.page_buf));
                }
            }
        }
    }
}
