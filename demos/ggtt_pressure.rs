use std::sync::Arc;
use vma_rs::gem::{GemObject, ObjectParams};
use vma_rs::gt::Gt;
use vma_rs::sync::WaitCtx;
use vma_rs::vm::{GgttView, PinFlags, Vma};
use vma_rs::{DeviceConfig, VmaError};

const MB: u64 = 1 << 20;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== GGTT Pressure ===");

    let gt = Gt::new(DeviceConfig::new().ggtt(32 * MB, 16 * MB))?;
    let ctx = WaitCtx::uninterruptible();
    println!("[+] GGTT: {}MiB, {}MiB mappable", gt.ggtt().total() >> 20, gt.ggtt().mappable_end() >> 20);

    // 1. Keep pinning 4MiB objects into the mappable aperture
    let mut pinned: Vec<Arc<Vma>> = Vec::new();
    let mut objects = Vec::new();
    for i in 0..8 {
        let obj = GemObject::new(&gt, ObjectParams::new(4 * MB))?;
        let vma = Vma::instance(&obj, gt.ggtt(), &GgttView::Normal)?;
        match vma.ggtt_pin(None, &ctx, 0, PinFlags::MAPPABLE) {
            Ok(()) => {
                println!("    #{i} pinned at 0x{:08x}", vma.offset().unwrap_or_default());
                pinned.push(vma);
            }
            Err(VmaError::NoSpace) => println!("    #{i} no space left"),
            Err(err) => return Err(err.into()),
        }
        objects.push(obj);
    }

    // 2. Release half; the next pin evicts them
    for vma in pinned.drain(..2) {
        vma.unpin();
    }
    let obj = GemObject::new(&gt, ObjectParams::new(8 * MB))?;
    let vma = Vma::instance(&obj, gt.ggtt(), &GgttView::Normal)?;
    vma.ggtt_pin(None, &ctx, 0, PinFlags::MAPPABLE | PinFlags::NOEVICT)?;
    println!("[+] 8MiB object pinned at 0x{:08x} after eviction", vma.offset().unwrap_or_default());

    vma.unpin();
    for vma in pinned {
        vma.unpin();
    }
    gt.wait_for_idle(&ctx)?;
    println!("[+] {} ranges still bound", gt.ggtt().bound_ranges().len());
    Ok(())
}
