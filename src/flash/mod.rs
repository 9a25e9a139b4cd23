//! Geometry-driven flash base: sector masking, erase/write orchestration and
//! the burn-a-data-vector algorithm shared by every concrete flash device.

use crate::block::BlockBuffer;
use crate::dv::DataVector;
use crate::elf::{segments_to_dv, Segment};
use crate::error::{Error, Result};

pub mod h7;

#[derive(Debug, Clone, Copy)]
pub struct FlashGeometry {
    pub base_addr: u32,
    pub sector_size: u32,
    pub nsectors: u32,
}

impl FlashGeometry {
    pub fn flash_size(&self) -> u32 {
        self.sector_size * self.nsectors
    }
}

/// Bitmask of every sector touched by `[addr, addr+length)`.
pub fn mask_for_alp(geom: &FlashGeometry, addr: u32, length: u32) -> Result<u64> {
    let sector_mask = geom.sector_size - 1;
    let begin = addr & !sector_mask;
    let end = (addr + length + sector_mask) & !sector_mask;
    let nsectors = (end - begin) / geom.sector_size;
    let fbit = (begin - geom.base_addr) / geom.sector_size;

    if fbit >= geom.nsectors || fbit + nsectors > geom.nsectors {
        return Err(Error::Range { addr, len: length as usize });
    }
    if nsectors == 0 {
        return Ok(0);
    }
    Ok(((1u64 << nsectors) - 1) << fbit)
}

/// Upper bound on the window checked at a time when trimming a block's
/// trailing all-erased tail before programming. The actual trim unit used is
/// the largest multiple of the device's program granule that does not exceed
/// this (falling back to one granule if the granule itself exceeds it), so
/// the trim unit is always a multiple of the granule, never the reverse.
const MAX_TRIM_WINDOW: usize = 64;

pub trait FlashDevice {
    fn geometry(&self) -> &FlashGeometry;

    /// Minimum number of bytes a single `write` call must be padded to.
    fn program_granule(&self) -> usize;

    fn erase_sector(&self, n: u32) -> Result<()>;

    fn read(&self, addr: u32, len: usize) -> Result<Vec<u8>>;

    /// Writes already-erased flash. `data.len()` must be a multiple of
    /// [`FlashDevice::program_granule`].
    fn write(&self, addr: u32, data: &[u8]) -> Result<()>;

    fn erase_sectors(&self, mask: u64) -> Result<()> {
        for i in 0..self.geometry().nsectors {
            if mask & (1 << i) != 0 {
                self.erase_sector(i)?;
            }
        }
        Ok(())
    }

    fn erase(&self, addr: u32, length: u32) -> Result<()> {
        self.erase_sectors(mask_for_alp(self.geometry(), addr, length)?)
    }

    fn erase_all(&self) -> Result<()> {
        let geom = *self.geometry();
        self.erase(geom.base_addr, geom.flash_size())
    }

    fn read_all(&self) -> Result<Vec<u8>> {
        let geom = *self.geometry();
        self.read(geom.base_addr, geom.flash_size() as usize)
    }

    /// Burns a data vector, erasing only the sectors it touches, preserving
    /// everything else. Data between data-vector elements that falls inside a
    /// touched sector is erased; out-of-range writes are silently dropped.
    fn burn_dv(&self, dv: &DataVector) -> Result<()> {
        let geom = *self.geometry();
        let mut bd = BlockBuffer::new(
            geom.sector_size,
            geom.base_addr / geom.sector_size,
            geom.nsectors,
        );
        for alp in dv {
            bd.write(alp.addr, &alp.data);
        }

        let mut mask = 0u64;
        for block in bd.blocks() {
            mask |= mask_for_alp(&geom, block.addr, block.data.len() as u32)?;
        }
        self.erase_sectors(mask)?;

        let granule = self.program_granule().max(1);
        let trim_chunk = (MAX_TRIM_WINDOW / granule).max(1) * granule;

        let mut written = Vec::new();
        let mut total = 0usize;
        for block in bd.blocks() {
            let mut data = block.data.clone();
            while data.len() >= trim_chunk && data[data.len() - trim_chunk..].iter().all(|&b| b == 0xFF) {
                data.truncate(data.len() - trim_chunk);
            }
            let padded_len = (data.len() + granule - 1) / granule * granule;
            data.resize(padded_len, 0);
            self.write(block.addr, &data)?;
            total += data.len();
            written.push((block.addr, data));
        }
        log::info!("wrote {total} bytes");

        for (addr, data) in &written {
            let mem = self.read(*addr, data.len())?;
            if mem != *data {
                return Err(Error::VerifyMismatch { addr: *addr });
            }
        }
        log::info!("verified {total} bytes");
        Ok(())
    }

    /// Lifts the `PT_LOAD` segments of an ELF image into a data vector and
    /// burns it. Segments outside the flash's range are dropped by
    /// [`FlashDevice::burn_dv`], not rejected here.
    fn burn_elf(&self, segments: &[Segment]) -> Result<()> {
        self.burn_dv(&segments_to_dv(segments))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dv::Alp;
    use std::cell::RefCell;

    fn geom() -> FlashGeometry {
        FlashGeometry { base_addr: 0x0800_0000, sector_size: 128 * 1024, nsectors: 8 }
    }

    #[test]
    fn mask_for_alp_is_popcount_equal_to_sectors_spanned() {
        let g = geom();
        let mask = mask_for_alp(&g, g.base_addr, 0).unwrap();
        assert_eq!(mask, 0);

        let mask = mask_for_alp(&g, g.base_addr, 1).unwrap();
        assert_eq!(mask, 0b1);

        let mask = mask_for_alp(&g, g.base_addr + g.sector_size - 1, 2).unwrap();
        assert_eq!(mask, 0b11);
    }

    #[test]
    fn mask_for_alp_rejects_out_of_range() {
        let g = geom();
        let err = mask_for_alp(&g, g.base_addr + g.flash_size(), 4).unwrap_err();
        assert!(matches!(err, Error::Range { .. }));
    }

    /// A `FlashDevice` whose register protocol is entirely RAM: just enough
    /// to drive `burn_dv`'s trim/pad math for a granule that doesn't evenly
    /// relate to `MAX_TRIM_WINDOW`.
    struct FakeDevice {
        geom: FlashGeometry,
        granule: usize,
        mem: RefCell<Vec<u8>>,
    }

    impl FakeDevice {
        fn new(geom: FlashGeometry, granule: usize) -> Self {
            Self { mem: RefCell::new(vec![0xFFu8; geom.flash_size() as usize]), geom, granule }
        }
    }

    impl FlashDevice for FakeDevice {
        fn geometry(&self) -> &FlashGeometry {
            &self.geom
        }
        fn program_granule(&self) -> usize {
            self.granule
        }
        fn erase_sector(&self, n: u32) -> Result<()> {
            let start = (n * self.geom.sector_size) as usize;
            let end = start + self.geom.sector_size as usize;
            self.mem.borrow_mut()[start..end].fill(0xFF);
            Ok(())
        }
        fn read(&self, addr: u32, len: usize) -> Result<Vec<u8>> {
            let off = (addr - self.geom.base_addr) as usize;
            Ok(self.mem.borrow()[off..off + len].to_vec())
        }
        fn write(&self, addr: u32, data: &[u8]) -> Result<()> {
            let off = (addr - self.geom.base_addr) as usize;
            self.mem.borrow_mut()[off..off + data.len()].copy_from_slice(data);
            Ok(())
        }
    }

    #[test]
    fn burn_dv_rounds_the_trim_to_a_granule_that_does_not_divide_the_trim_window() {
        let geom = FlashGeometry { base_addr: 0x0800_0000, sector_size: 256, nsectors: 4 };
        let granule = 48usize;
        let device = FakeDevice::new(geom, granule);

        let dv = vec![Alp::new(geom.base_addr, vec![0xABu8; 10])];
        device.burn_dv(&dv).unwrap();

        let written = device.read(geom.base_addr, 48).unwrap();
        assert_eq!(&written[..10], &[0xABu8; 10][..]);
        assert!(written[16..].iter().all(|&b| b == 0), "tail past the last granule must be zero-padded, not erased 0xFF");
        assert_eq!(written.len() % granule, 0);
    }
}
