//! RISC program synthesis.
//!
//! The device's co-processor runs a tiny instruction stream out of host
//! memory: one SYNC, then a long run of WRITEs that fill each DMA page in
//! sequence, then a JUMP back to the first WRITE for an infinite loop.
//! Each WRITE moves one FIFO burst (`CDT_BUF_LEN` bytes) to a PCI target
//! address; the last WRITE of a page bumps the GP counter, the last WRITE
//! of the ring resets it, and every `irq_period`-th page raises IRQ1.

use super::dma::{DmaGeometry, DmaRing};
use super::regs::CDT_BUF_LEN;

pub const RISC_SYNC: u32 = 0x8000_0000;
pub const RISC_WRITE: u32 = 0x1000_0000;
pub const RISC_JUMP: u32 = 0x7000_0000;
pub const RISC_SOL: u32 = 0x0800_0000;
pub const RISC_EOL: u32 = 0x0400_0000;
pub const RISC_IRQ1: u32 = 0x0100_0000;
pub const RISC_CNT_INC: u32 = 0x0001_0000;
pub const RISC_CNT_RESET: u32 = 0x0003_0000;

/// Encodes the instruction stream as little-endian dwords.
///
/// `instr_bus_addr` is the bus address the stream will live at (the JUMP
/// target is computed from it); `page_addrs` are the bus addresses of the
/// DMA pages in ring order.
pub fn encode_program(geometry: &DmaGeometry, instr_bus_addr: u32, page_addrs: &[u32]) -> Vec<u32> {
    let writes_per_page = geometry.writes_per_page();
    let page_count = geometry.page_count();
    debug_assert_eq!(page_addrs.len() as u32, page_count);

    let mut program = Vec::with_capacity(1 + (page_count * writes_per_page * 2) as usize + 2);
    program.push(RISC_SYNC | RISC_CNT_RESET);

    for (page_idx, &page_addr) in page_addrs.iter().enumerate() {
        let mut target = page_addr;
        for write_idx in 0..writes_per_page {
            let mut instr = RISC_WRITE | RISC_SOL | RISC_EOL | CDT_BUF_LEN;

            if write_idx == writes_per_page - 1 {
                // Count the page as done once its final burst lands.
                instr |= RISC_CNT_INC;

                // Wrap the counter together with the ring.
                if page_idx as u32 == page_count - 1 {
                    instr |= RISC_CNT_RESET;
                }

                if (page_idx as u32 + 1) % geometry.irq_period_in_pages == 0 {
                    instr |= RISC_IRQ1;
                }
            }

            program.push(instr);
            program.push(target);
            target += CDT_BUF_LEN;
        }
    }

    // +4 skips the SYNC so the loop never re-syncs.
    program.push(RISC_JUMP);
    program.push(instr_bus_addr + 4);

    program
}

/// Synthesizes the program for `ring` and copies it into the instruction
/// buffer.
pub fn build_program(ring: &DmaRing) -> usize {
    let page_addrs: Vec<u32> = ring.pages.iter().map(|p| p.bus_addr).collect();
    let program = encode_program(&ring.geometry, ring.instr.bus_addr, &page_addrs);
    debug_assert!(program.len() * 4 <= ring.instr.len());

    // SAFETY: the instruction buffer is pinned and sized by
    // DmaGeometry::risc_program_bytes, which this program fits by
    // construction.
    unsafe {
        let dst = ring.instr.as_ptr();
        for (i, word) in program.iter().enumerate() {
            std::ptr::copy_nonoverlapping(word.to_le_bytes().as_ptr(), dst.add(i * 4), 4);
        }
    }
    program.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> DmaGeometry {
        DmaGeometry {
            page_size: 4096,
            ring_bytes: 16 * 4096,
            irq_period_in_pages: 4,
        }
    }

    fn fake_pages(geometry: &DmaGeometry) -> Vec<u32> {
        (0..geometry.page_count())
            .map(|i| 0x0100_0000 + i * geometry.page_size as u32)
            .collect()
    }

    #[test]
    fn program_shape() {
        let g = geometry();
        let pages = fake_pages(&g);
        let program = encode_program(&g, 0x00A0_0000, &pages);

        // SYNC + 16 pages * 2 writes * 2 dwords + JUMP pair.
        assert_eq!(program.len(), 1 + 16 * 2 * 2 + 2);
        assert_eq!(program[0], RISC_SYNC | RISC_CNT_RESET);
        assert_eq!(program[program.len() - 2], RISC_JUMP);
        assert_eq!(program[program.len() - 1], 0x00A0_0000 + 4);
    }

    #[test]
    fn writes_target_successive_bursts() {
        let g = geometry();
        let pages = fake_pages(&g);
        let program = encode_program(&g, 0, &pages);

        for (page_idx, &page_addr) in pages.iter().enumerate() {
            for write_idx in 0..2usize {
                let at = 1 + (page_idx * 2 + write_idx) * 2;
                let instr = program[at];
                let target = program[at + 1];
                assert_eq!(instr & 0xF000_0000, RISC_WRITE);
                assert_ne!(instr & RISC_SOL, 0);
                assert_ne!(instr & RISC_EOL, 0);
                assert_eq!(instr & 0xFFFF, CDT_BUF_LEN);
                assert_eq!(target, page_addr + write_idx as u32 * CDT_BUF_LEN);
            }
        }
    }

    #[test]
    fn counter_and_irq_placement() {
        let g = geometry();
        let pages = fake_pages(&g);
        let program = encode_program(&g, 0, &pages);

        for page_idx in 0..16u32 {
            let first = program[1 + (page_idx as usize * 2) * 2];
            let last = program[1 + (page_idx as usize * 2 + 1) * 2];

            // Only the final write of a page touches the counter.
            assert_eq!(first & RISC_CNT_RESET, 0);
            assert_ne!(last & RISC_CNT_INC, 0);

            // The counter resets on the ring's final page only.
            if page_idx == 15 {
                assert_eq!(last & RISC_CNT_RESET, RISC_CNT_RESET);
            } else {
                assert_eq!(last & RISC_CNT_RESET, RISC_CNT_INC);
            }

            // IRQ1 on every irq_period-th page.
            if (page_idx + 1) % 4 == 0 {
                assert_ne!(last & RISC_IRQ1, 0, "page {page_idx} must interrupt");
            } else {
                assert_eq!(last & RISC_IRQ1, 0, "page {page_idx} must not interrupt");
            }
            assert_eq!(first & RISC_IRQ1, 0);
        }
    }
}
