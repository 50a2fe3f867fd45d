use super::{
    brotli_stream::BrotliEncoder,
    pagemap::{PagemapEntry, PagemapWriter},
    SizeInfo,
};
use crate::{
    address_space::{
        memory_range::{MemoryRange, MemoryRangeKey},
        memory_region::MemoryRegion,
        AddressSpace,
    },
    error::Result,
    log::LogLevel::LogDebug,
    remote_ptr::RemotePtr,
    savestate::{SavestateFlags, SavestateMeta, SavestateWriter},
    util::{is_zeroed, page_size},
};
use std::collections::BTreeSet;

/// Streams the pages of captured regions into a savestate.
///
/// Regions must be saved in address order, since that is the order the
/// reader expects the pagemap in.
pub struct PageWriter {
    out: SavestateWriter,
    pagemap: PagemapWriter,
    encoder: BrotliEncoder,
    block_pages: u32,
    /// Compressed chunks in the current stream.
    in_block: u32,
    /// Captured ranges of the parent generation.
    parent_coverage: BTreeSet<MemoryRangeKey>,
    page: Vec<u8>,
    chunk: Vec<u8>,
    info: SizeInfo,
}

impl PageWriter {
    /// `parent_regions` is the region table of the parent generation, empty
    /// for a full snapshot. Only its captured regions can satisfy an
    /// `Unchanged` page.
    pub fn new(
        out: SavestateWriter,
        block_pages: u32,
        quality: u32,
        parent_regions: &[MemoryRegion],
    ) -> Result<PageWriter> {
        let parent_coverage = parent_regions
            .iter()
            .filter(|r| r.has_contents())
            .map(|r| MemoryRangeKey(r.range()))
            .collect();
        Ok(PageWriter {
            out,
            pagemap: PagemapWriter::new(),
            encoder: BrotliEncoder::new(quality)?,
            block_pages: block_pages.max(1),
            in_block: 0,
            parent_coverage,
            page: vec![0u8; page_size()],
            chunk: Vec::with_capacity(2 * page_size()),
            info: SizeInfo::default(),
        })
    }

    pub fn info(&self) -> SizeInfo {
        self.info
    }

    /// Where pages are copied to while they are being saved.
    pub fn buffers(&self) -> Vec<MemoryRange> {
        vec![
            MemoryRange::of_slice(&self.page),
            MemoryRange::new_range(RemotePtr::from_ptr(self.chunk.as_ptr()), self.chunk.capacity()),
        ]
    }

    /// Save every page of `region`. `dirty[i]` is the tracker's answer for
    /// page `i`; a missing answer counts as dirty.
    pub fn save_region(
        &mut self,
        space: &dyn AddressSpace,
        region: &MemoryRegion,
        dirty: &[bool],
    ) -> Result<()> {
        let npages = region.size() / page_size();
        log!(
            LogDebug,
            "Saving {} pages of {} ({})",
            npages,
            region.range(),
            region.kind()
        );
        for i in 0..npages {
            let addr = region.start() + i * page_size();
            let clean = !dirty.get(i).copied().unwrap_or(true);
            self.save_page(space, addr, clean)?;
        }
        Ok(())
    }

    fn save_page(&mut self, space: &dyn AddressSpace, addr: RemotePtr, clean: bool) -> Result<()> {
        self.info.pages_total += 1;
        if clean && self.in_parent(addr) {
            self.pagemap.push(PagemapEntry::Unchanged);
            self.info.unchanged_pages += 1;
            return Ok(());
        }

        space.read(addr, &mut self.page)?;
        if is_zeroed(&self.page) {
            self.pagemap.push(PagemapEntry::Zero);
            self.info.zero_pages += 1;
            return Ok(());
        }

        if self.in_block == self.block_pages {
            self.encoder.reset()?;
            self.in_block = 0;
        }
        self.chunk.clear();
        let len = self.encoder.compress_flush(&self.page, &mut self.chunk)?;
        if len >= page_size() {
            // The encoder has consumed a chunk the reader will never see, so
            // the stream cannot continue.
            self.out.write_payload(&self.page)?;
            self.encoder.reset()?;
            self.in_block = 0;
            self.pagemap.push(PagemapEntry::Raw);
            self.info.raw_pages += 1;
            self.info.payload_bytes += page_size() as u64;
        } else {
            self.out.write_payload(&self.chunk)?;
            self.in_block += 1;
            self.pagemap.push(PagemapEntry::Compressed(len as u32));
            self.info.compressed_pages += 1;
            self.info.payload_bytes += len as u64;
        }
        Ok(())
    }

    fn in_parent(&self, addr: RemotePtr) -> bool {
        self.parent_coverage
            .contains(&MemoryRangeKey(MemoryRange::new_range(addr, page_size())))
    }

    /// Write the remaining sections and move the file into place. Returns the
    /// final size information and the payload CRC.
    pub fn finish(self, meta: &SavestateMeta, flags: SavestateFlags) -> Result<(SizeInfo, u32)> {
        let mut info = self.info;
        let pagemap = self.pagemap.into_bytes();
        let (payload_crc, file_bytes) = self.out.finalize(&pagemap, meta, flags)?;
        info.file_bytes = file_bytes;
        Ok((info, payload_crc))
    }
}
