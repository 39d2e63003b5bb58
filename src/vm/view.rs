//! Alternative page arrangements of an object inside the GGTT.

use crate::error::{VmaError, VmaResult};
use crate::mm::sgt::SCRATCH_DMA;
use crate::mm::{SgEntry, SgTable};
use crate::utils::{GTT_PAGE_SIZE_4K, PAGE_SHIFT, roundup};
use std::sync::Arc;

/// One colour plane of a rotated or remapped view, in pages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PlaneInfo {
    pub offset: u32,
    pub width: u32,
    pub height: u32,
    pub src_stride: u32,
    pub dst_stride: u32,
}

impl PlaneInfo {
    const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RotationInfo {
    pub planes: [PlaneInfo; 2],
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RemappedInfo {
    pub planes: [PlaneInfo; 2],
    /// Each plane starts at a multiple of this many pages, if nonzero.
    pub plane_alignment: u32,
}

/// How an object's pages are laid out in a mapping.
///
/// Views compare by kind first and then by their parameters, which gives
/// the total order the per-object registry is keyed on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GgttView {
    #[default]
    Normal,
    /// `size` pages starting at page `offset`.
    Partial { offset: u64, size: u64 },
    Rotated(RotationInfo),
    Remapped(RemappedInfo),
}

impl GgttView {
    #[must_use]
    pub const fn is_normal(&self) -> bool {
        matches!(self, Self::Normal)
    }

    /// Size in bytes of a mapping of this view of an `obj_size` object.
    #[must_use]
    pub fn size(&self, obj_size: u64) -> u64 {
        let pages = match self {
            Self::Normal => return obj_size,
            Self::Partial { size, .. } => *size,
            Self::Rotated(info) => info
                .planes
                .iter()
                .map(|p| u64::from(p.dst_stride) * u64::from(p.width))
                .sum(),
            Self::Remapped(info) => info.planes.iter().fold(0, |acc, p| {
                let plane = u64::from(p.dst_stride) * u64::from(p.height);
                if plane == 0 {
                    return acc;
                }
                let acc = if info.plane_alignment > 0 {
                    roundup(acc, u64::from(info.plane_alignment))
                } else {
                    acc
                };
                acc + plane
            }),
        };
        pages << PAGE_SHIFT
    }

    /// Checks the view against an object of `obj_pages` pages.
    pub fn validate(&self, obj_pages: u64) -> VmaResult<()> {
        match self {
            Self::Partial { offset, size } => {
                if *size == 0 || offset.checked_add(*size).is_none_or(|end| end > obj_pages) {
                    return Err(VmaError::InvalidArgument("partial view outside object"));
                }
            }
            Self::Rotated(info) => {
                for p in info.planes.iter().filter(|p| !p.is_empty()) {
                    if p.src_stride < p.width || p.dst_stride < p.height {
                        return Err(VmaError::InvalidArgument("plane stride too small"));
                    }
                }
            }
            Self::Remapped(info) => {
                for p in info.planes.iter().filter(|p| !p.is_empty()) {
                    if p.src_stride < p.width || p.dst_stride < p.width {
                        return Err(VmaError::InvalidArgument("plane stride too small"));
                    }
                }
            }
            Self::Normal => {}
        }
        Ok(())
    }
}

/// Accumulates view entries, merging contiguous runs.
#[derive(Default)]
struct Builder {
    entries: Vec<SgEntry>,
}

impl Builder {
    fn push(&mut self, dma: u64, len: u64) {
        if let Some(last) = self.entries.last_mut() {
            let contiguous = if dma == SCRATCH_DMA {
                last.is_padding()
            } else {
                !last.is_padding() && last.dma + last.len == dma
            };
            if contiguous {
                last.len += len;
                return;
            }
        }
        self.entries.push(SgEntry { dma, len });
    }

    fn pad(&mut self, pages: u64) {
        if pages > 0 {
            self.push(SCRATCH_DMA, pages * GTT_PAGE_SIZE_4K);
        }
    }

    fn page(&mut self, src: &SgTable, idx: u64) -> VmaResult<()> {
        let dma = usize::try_from(idx)
            .ok()
            .and_then(|n| src.dma_address(n))
            .ok_or(VmaError::InvalidArgument("view reaches past the object"))?;
        self.push(dma, GTT_PAGE_SIZE_4K);
        Ok(())
    }

    /// Copies `count` pages from `idx`, an entry run at a time.
    fn run(&mut self, src: &SgTable, mut idx: u64, count: u64) -> VmaResult<()> {
        let mut left = count * GTT_PAGE_SIZE_4K;
        while left > 0 {
            let (dma, len) = usize::try_from(idx)
                .ok()
                .and_then(|n| src.dma_address_len(n))
                .ok_or(VmaError::InvalidArgument("view reaches past the object"))?;
            let len = len.min(left);
            self.push(dma, len);
            idx += len / GTT_PAGE_SIZE_4K;
            left -= len;
        }
        Ok(())
    }
}

fn rotate(b: &mut Builder, src: &SgTable, p: &PlaneInfo) -> VmaResult<()> {
    let (offset, height) = (u64::from(p.offset), u64::from(p.height));
    let (src_stride, dst_stride) = (u64::from(p.src_stride), u64::from(p.dst_stride));
    for column in 0..u64::from(p.width) {
        // Columns are emitted bottom-up.
        for row in (0..height).rev() {
            b.page(src, offset + row * src_stride + column)?;
        }
        b.pad(dst_stride.saturating_sub(height));
    }
    Ok(())
}

fn remap(b: &mut Builder, src: &SgTable, p: &PlaneInfo) -> VmaResult<()> {
    let (width, src_stride, dst_stride) = (u64::from(p.width), u64::from(p.src_stride), u64::from(p.dst_stride));
    let mut offset = u64::from(p.offset);
    for _ in 0..p.height {
        b.run(src, offset, width)?;
        offset += src_stride;
        b.pad(dst_stride.saturating_sub(width));
    }
    Ok(())
}

/// Builds the page list `view` maps, borrowing pages from `pages`.
pub fn build_pages(view: &GgttView, pages: &Arc<SgTable>) -> VmaResult<Arc<SgTable>> {
    let mut b = Builder::default();
    match view {
        GgttView::Normal => return Ok(pages.clone()),
        GgttView::Partial { offset, size } => b.run(pages, *offset, *size)?,
        GgttView::Rotated(info) => {
            for plane in info.planes.iter().filter(|p| !p.is_empty()) {
                rotate(&mut b, pages, plane)?;
            }
        }
        GgttView::Remapped(info) => {
            let mut gtt_offset = 0;
            for plane in info.planes.iter().filter(|p| !p.is_empty()) {
                if info.plane_alignment > 0 {
                    let aligned = roundup(gtt_offset, u64::from(info.plane_alignment));
                    b.pad(aligned - gtt_offset);
                    gtt_offset = aligned;
                }
                remap(&mut b, pages, plane)?;
                gtt_offset += u64::from(plane.dst_stride) * u64::from(plane.height);
            }
        }
    }
    Ok(SgTable::derived(b.entries, pages))
}
