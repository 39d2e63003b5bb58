use vma_rs::gem::{GemObject, ObjectParams};
use vma_rs::gt::Gt;
use vma_rs::mm::RegionId;
use vma_rs::sync::WaitCtx;
use vma_rs::{DeviceConfig, FailureModes};

const SMEM: RegionId = RegionId(0);
const LMEM: RegionId = RegionId(1);

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Migration Round Trip ===");

    let modes = [
        ("accelerated", FailureModes::new(false, false)),
        ("gpu failure", FailureModes::new(true, false)),
        ("no work item", FailureModes::new(false, true)),
        ("both", FailureModes::new(true, true)),
    ];

    for (label, modes) in modes {
        let gt = Gt::new(DeviceConfig::new().local_memory(64 << 20).failure_modes(modes))?;
        let ctx = WaitCtx::uninterruptible();

        // 1. An object allowed in both regions, starting in system memory
        let obj = GemObject::new(&gt, ObjectParams::new(1 << 20).placements(&[SMEM, LMEM]))?;
        let pattern: Vec<u8> = (0..obj.size()).map(|i| (i % 251) as u8).collect();
        obj.write(&ctx, 0, &pattern)?;

        // 2. Into local memory and back
        obj.migrate(&ctx, LMEM)?;
        obj.wait_moving(&ctx)?;
        println!("[+] {label}: now in {}", obj.resident_region().name());
        obj.migrate(&ctx, SMEM)?;
        obj.wait_moving(&ctx)?;

        // 3. Verify
        let mut back = vec![0u8; pattern.len()];
        obj.read(&ctx, 0, &mut back)?;
        let blitter = gt.migrate().ok_or("no migration engine")?;
        println!(
            "    contents {}, {} blit copies, {} blit clears",
            if back == pattern { "intact" } else { "CORRUPTED" },
            blitter.copies(),
            blitter.clears(),
        );
    }

    Ok(())
}
