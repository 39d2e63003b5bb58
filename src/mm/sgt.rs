use crate::mm::region::Block;
use crate::utils::{GTT_PAGE_SIZE_2M, GTT_PAGE_SIZE_4K, GTT_PAGE_SIZE_64K, is_aligned, pages};
use std::sync::Arc;

/// DMA address of padding entries. PTEs for it point at scratch.
pub const SCRATCH_DMA: u64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgEntry {
    pub dma: u64,
    pub len: u64,
}

impl SgEntry {
    #[must_use]
    pub const fn is_padding(&self) -> bool {
        self.dma == SCRATCH_DMA
    }

    /// Largest GTT page size both the address and the length are aligned to.
    const fn page_size(&self) -> u64 {
        if is_aligned(self.dma, GTT_PAGE_SIZE_2M) && is_aligned(self.len, GTT_PAGE_SIZE_2M) {
            GTT_PAGE_SIZE_2M
        } else if is_aligned(self.dma, GTT_PAGE_SIZE_64K) && is_aligned(self.len, GTT_PAGE_SIZE_64K) {
            GTT_PAGE_SIZE_64K
        } else {
            GTT_PAGE_SIZE_4K
        }
    }
}

/// Page size breakdown of a table: every GTT page size some entry could be
/// mapped with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageSizes {
    pub phys: u64,
    pub sg: u64,
}

/// A reference-counted scatter-gather table.
///
/// Tables built from blocks keep the backing alive; tables synthesised for a
/// view keep the table they were built from alive instead.
#[derive(Debug)]
pub struct SgTable {
    entries: Vec<SgEntry>,
    page_sizes: PageSizes,
    _blocks: Vec<Arc<Block>>,
    _parent: Option<Arc<SgTable>>,
}

impl SgTable {
    #[must_use]
    pub fn from_blocks(blocks: Vec<Arc<Block>>) -> Arc<Self> {
        let mut entries: Vec<SgEntry> = Vec::with_capacity(blocks.len());
        for block in &blocks {
            match entries.last_mut() {
                Some(last) if last.dma + last.len == block.start() => last.len += block.size(),
                _ => entries.push(SgEntry {
                    dma: block.start(),
                    len: block.size(),
                }),
            }
        }

        let sizes = entries.iter().fold(0, |acc, e| acc | e.page_size());
        Arc::new(Self {
            entries,
            page_sizes: PageSizes {
                phys: sizes,
                sg: sizes,
            },
            _blocks: blocks,
            _parent: None,
        })
    }

    /// A table of `entries` borrowing its pages from `parent`.
    #[must_use]
    pub fn derived(entries: Vec<SgEntry>, parent: &Arc<Self>) -> Arc<Self> {
        Arc::new(Self {
            entries,
            page_sizes: parent.page_sizes,
            _blocks: Vec::new(),
            _parent: Some(parent.clone()),
        })
    }

    #[must_use]
    pub fn entries(&self) -> &[SgEntry] {
        &self.entries
    }

    #[must_use]
    pub const fn page_sizes(&self) -> PageSizes {
        self.page_sizes
    }

    #[must_use]
    pub fn len_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.len).sum()
    }

    #[must_use]
    pub fn num_pages(&self) -> usize {
        pages(self.len_bytes())
    }

    /// DMA address of page `n` and the bytes left in its entry from there.
    #[must_use]
    pub fn dma_address_len(&self, n: usize) -> Option<(u64, u64)> {
        let mut offset = n as u64 * GTT_PAGE_SIZE_4K;
        for entry in &self.entries {
            if offset < entry.len {
                let dma = if entry.is_padding() { SCRATCH_DMA } else { entry.dma + offset };
                return Some((dma, entry.len - offset));
            }
            offset -= entry.len;
        }
        None
    }

    #[must_use]
    pub fn dma_address(&self, n: usize) -> Option<u64> {
        self.dma_address_len(n).map(|(dma, _)| dma)
    }

    /// DMA address of every 4K page in order; padding yields `SCRATCH_DMA`.
    pub fn page_addresses(&self) -> impl Iterator<Item = u64> + '_ {
        self.entries.iter().flat_map(|e| {
            (0..e.len / GTT_PAGE_SIZE_4K).map(move |i| {
                if e.is_padding() {
                    SCRATCH_DMA
                } else {
                    e.dma + i * GTT_PAGE_SIZE_4K
                }
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::region::Memory;

    #[test]
    fn contiguous_blocks_merge() {
        let mem = Memory::new(4 << 20, 4 << 20);
        let sgt = SgTable::from_blocks(mem.system().alloc(1 << 20).unwrap());
        assert_eq!(sgt.entries().len(), 1);
        assert_eq!(sgt.num_pages(), 256);
        assert_eq!(sgt.dma_address(1), Some(Memory::SYSTEM_DMA_BASE + GTT_PAGE_SIZE_4K));
    }

    #[test]
    fn local_tables_advertise_64k() {
        let mem = Memory::new(1 << 20, 4 << 20);
        let sgt = SgTable::from_blocks(mem.local().unwrap().alloc(1 << 20).unwrap());
        assert_ne!(sgt.page_sizes().sg & GTT_PAGE_SIZE_64K, 0);
    }

    #[test]
    fn derived_tables_report_padding() {
        let mem = Memory::new(1 << 20, 0);
        let parent = SgTable::from_blocks(mem.system().alloc(8192).unwrap());
        let view = SgTable::derived(
            vec![
                SgEntry {
                    dma: parent.dma_address(1).unwrap(),
                    len: GTT_PAGE_SIZE_4K,
                },
                SgEntry {
                    dma: SCRATCH_DMA,
                    len: GTT_PAGE_SIZE_4K,
                },
            ],
            &parent,
        );
        let pages: Vec<_> = view.page_addresses().collect();
        assert_eq!(pages, vec![parent.dma_address(1).unwrap(), SCRATCH_DMA]);
    }
}
