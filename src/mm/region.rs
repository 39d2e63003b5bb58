use crate::error::{VmaError, VmaResult};
use crate::mm::range::{InsertMode, RangeAllocator};
use crate::utils::{GTT_PAGE_SIZE_4K, GTT_PAGE_SIZE_64K, align_up, lock};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

/// System memory is handed out in chunks of at most this size, so larger
/// objects end up scattered like real page allocations.
const SYSTEM_SEGMENT: u64 = 256 << 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// Host memory, CPU-visible through struct pages.
    System,
    /// Device-local memory, CPU-visible only as io memory.
    Local,
}

#[derive(Debug)]
struct RegionState {
    mm: RangeAllocator,
    blocks: BTreeMap<u64, Weak<Block>>,
}

/// A memory tier: a DMA address range plus the bytes behind it.
pub struct MemoryRegion {
    id: RegionId,
    kind: RegionKind,
    name: &'static str,
    base: u64,
    size: u64,
    min_page_size: u64,
    state: Mutex<RegionState>,
}

impl fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("name", &self.name)
            .field("base", &format_args!("0x{:x}", self.base))
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl MemoryRegion {
    pub(crate) fn new(id: RegionId, kind: RegionKind, name: &'static str, base: u64, size: u64) -> Arc<Self> {
        let min_page_size = match kind {
            RegionKind::System => GTT_PAGE_SIZE_4K,
            RegionKind::Local => GTT_PAGE_SIZE_64K,
        };
        Arc::new(Self {
            id,
            kind,
            name,
            base,
            size,
            min_page_size,
            state: Mutex::new(RegionState {
                mm: RangeAllocator::new(base, size, false),
                blocks: BTreeMap::new(),
            }),
        })
    }

    #[must_use]
    pub const fn id(&self) -> RegionId {
        self.id
    }

    #[must_use]
    pub const fn kind(&self) -> RegionKind {
        self.kind
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub const fn min_page_size(&self) -> u64 {
        self.min_page_size
    }

    /// GPU bindings of this memory use local-memory PTEs, and CPU access
    /// goes through io mappings.
    #[must_use]
    pub const fn is_local(&self) -> bool {
        matches!(self.kind, RegionKind::Local)
    }

    /// Objects placed here are backed by a page vector populated on demand.
    #[must_use]
    pub const fn uses_tt(&self) -> bool {
        matches!(self.kind, RegionKind::System)
    }

    #[must_use]
    pub const fn contains(&self, dma: u64) -> bool {
        dma >= self.base && dma - self.base < self.size
    }

    /// Bytes not currently allocated.
    #[must_use]
    pub fn available(&self) -> u64 {
        let state = lock(&self.state);
        self.size - state.mm.iter().map(|n| n.size).sum::<u64>()
    }

    /// Allocates zeroed backing for `size` bytes.
    pub fn alloc(self: &Arc<Self>, size: u64) -> VmaResult<Vec<Arc<Block>>> {
        let size = align_up(size, self.min_page_size);
        let segment = match self.kind {
            RegionKind::System => SYSTEM_SEGMENT,
            RegionKind::Local => size,
        };

        let mut blocks = Vec::new();
        let mut left = size;
        while left > 0 {
            let len = left.min(segment);
            let node = {
                let mut state = lock(&self.state);
                state
                    .mm
                    .insert(len, self.min_page_size, 0, self.base, self.base + self.size, InsertMode::Low)
                    .map_err(|_| VmaError::OutOfMemory)?
            };

            let block = Arc::new(Block {
                region: self.clone(),
                start: node.start,
                size: len,
                data: Mutex::new(vec![0; usize::try_from(len).map_err(|_| VmaError::TooBig)?]),
            });
            lock(&self.state)
                .blocks
                .insert(node.start, Arc::downgrade(&block));
            blocks.push(block);
            left -= len;
        }

        log::trace!("{}: allocated {} bytes in {} blocks", self.name, size, blocks.len());
        Ok(blocks)
    }

    fn lookup(&self, dma: u64) -> Option<(Arc<Block>, u64)> {
        // The upgraded reference may be the last one; drop the lock before
        // it can be released.
        let weak = lock(&self.state).blocks.range(..=dma).next_back()?.1.clone();
        let block = weak.upgrade()?;
        (dma < block.start + block.size).then(|| {
            let offset = dma - block.start;
            (block, offset)
        })
    }

    fn release(&self, start: u64) {
        let mut state = lock(&self.state);
        state.blocks.remove(&start);
        state.mm.remove(start);
    }
}

/// A contiguous allocation inside a region. The range returns to the
/// region when the last reference drops.
pub struct Block {
    region: Arc<MemoryRegion>,
    start: u64,
    size: u64,
    data: Mutex<Vec<u8>>,
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("region", &self.region.name)
            .field("start", &format_args!("0x{:x}", self.start))
            .field("size", &self.size)
            .finish()
    }
}

impl Block {
    #[must_use]
    pub const fn start(&self) -> u64 {
        self.start
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn region(&self) -> &Arc<MemoryRegion> {
        &self.region
    }

    fn span(&self, offset: u64, len: usize) -> VmaResult<std::ops::Range<usize>> {
        let start = usize::try_from(offset).map_err(|_| VmaError::InvalidArgument("offset"))?;
        let end = start + len;
        if offset + len as u64 > self.size {
            return Err(VmaError::InvalidArgument("access past end of block"));
        }
        Ok(start..end)
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> VmaResult<()> {
        let span = self.span(offset, buf.len())?;
        buf.copy_from_slice(&lock(&self.data)[span]);
        Ok(())
    }

    fn write(&self, offset: u64, data: &[u8]) -> VmaResult<()> {
        let span = self.span(offset, data.len())?;
        lock(&self.data)[span].copy_from_slice(data);
        Ok(())
    }

    fn fill(&self, offset: u64, len: usize, value: u8) -> VmaResult<()> {
        let span = self.span(offset, len)?;
        lock(&self.data)[span].fill(value);
        Ok(())
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        self.region.release(self.start);
    }
}

/// Every region of a device, addressable by DMA address.
#[derive(Debug)]
pub struct Memory {
    regions: Vec<Arc<MemoryRegion>>,
}

impl Memory {
    pub const SYSTEM_DMA_BASE: u64 = 1 << 32;
    pub const LOCAL_DMA_BASE: u64 = 1 << 40;

    #[must_use]
    pub fn new(system_size: u64, local_size: u64) -> Self {
        let mut regions = vec![MemoryRegion::new(
            RegionId(0),
            RegionKind::System,
            "smem",
            Self::SYSTEM_DMA_BASE,
            system_size,
        )];
        if local_size > 0 {
            regions.push(MemoryRegion::new(
                RegionId(1),
                RegionKind::Local,
                "lmem0",
                Self::LOCAL_DMA_BASE,
                local_size,
            ));
        }
        Self { regions }
    }

    #[must_use]
    pub fn regions(&self) -> &[Arc<MemoryRegion>] {
        &self.regions
    }

    #[must_use]
    pub fn region(&self, id: RegionId) -> Option<&Arc<MemoryRegion>> {
        self.regions.get(id.0)
    }

    #[must_use]
    pub fn system(&self) -> &Arc<MemoryRegion> {
        &self.regions[0]
    }

    #[must_use]
    pub fn local(&self) -> Option<&Arc<MemoryRegion>> {
        self.regions.iter().find(|r| r.is_local())
    }

    fn resolve(&self, dma: u64) -> VmaResult<(Arc<Block>, u64)> {
        self.regions
            .iter()
            .find(|r| r.contains(dma))
            .and_then(|r| r.lookup(dma))
            .ok_or(VmaError::InvalidArgument("unbacked dma address"))
    }

    /// Splits `[dma, dma + len)` into per-block pieces.
    fn for_each_piece<F>(&self, dma: u64, len: usize, mut f: F) -> VmaResult<()>
    where
        F: FnMut(&Block, u64, std::ops::Range<usize>) -> VmaResult<()>,
    {
        let mut done = 0;
        while done < len {
            let (block, offset) = self.resolve(dma + done as u64)?;
            let chunk = (len - done).min(usize::try_from(block.size - offset).unwrap_or(usize::MAX));
            f(&block, offset, done..done + chunk)?;
            done += chunk;
        }
        Ok(())
    }

    pub fn read(&self, dma: u64, buf: &mut [u8]) -> VmaResult<()> {
        self.for_each_piece(dma, buf.len(), |block, offset, span| block.read(offset, &mut buf[span]))
    }

    pub fn write(&self, dma: u64, data: &[u8]) -> VmaResult<()> {
        self.for_each_piece(dma, data.len(), |block, offset, span| block.write(offset, &data[span]))
    }

    pub fn fill(&self, dma: u64, len: usize, value: u8) -> VmaResult<()> {
        self.for_each_piece(dma, len, |block, offset, span| block.fill(offset, span.len(), value))
    }

    pub fn copy(&self, src: u64, dst: u64, len: usize) -> VmaResult<()> {
        let mut bounce = vec![0; len];
        self.read(src, &mut bounce)?;
        self.write(dst, &bounce)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_allocations_are_segmented() {
        let mem = Memory::new(16 << 20, 0);
        let blocks = mem.system().alloc(SYSTEM_SEGMENT * 2 + GTT_PAGE_SIZE_4K).unwrap();
        assert_eq!(blocks.len(), 3);
        assert!(mem.local().is_none());
    }

    #[test]
    fn local_allocations_round_to_min_page() {
        let mem = Memory::new(1 << 20, 4 << 20);
        let lmem = mem.local().unwrap();
        let blocks = lmem.alloc(GTT_PAGE_SIZE_4K).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].size(), GTT_PAGE_SIZE_64K);
    }

    #[test]
    fn freed_blocks_return_space() {
        let mem = Memory::new(1 << 20, 0);
        let smem = mem.system();
        let before = smem.available();
        let blocks = smem.alloc(64 << 10).unwrap();
        assert_eq!(smem.available(), before - (64 << 10));
        drop(blocks);
        assert_eq!(smem.available(), before);
        assert_eq!(smem.alloc(2 << 20).err(), Some(VmaError::OutOfMemory));
    }

    #[test]
    fn dma_access_round_trips() {
        let mem = Memory::new(1 << 20, 1 << 20);
        let blocks = mem.local().unwrap().alloc(1 << 16).unwrap();
        let dma = blocks[0].start() + 100;
        mem.write(dma, b"hello").unwrap();
        let mut buf = [0; 5];
        mem.read(dma, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        let other = mem.system().alloc(4096).unwrap();
        mem.copy(dma, other[0].start(), 5).unwrap();
        mem.read(other[0].start(), &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }
}
