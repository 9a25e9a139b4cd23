//! Dual-bank flash driver for the STM32H7 series: per-bank unlock/lock,
//! sector erase, and bulk program/read through the AHB-AP.

use crate::error::{Error, Result};
use crate::flash::{FlashDevice, FlashGeometry};
use crate::probe::MemoryAccess;
use crate::target::Target;

const PROGRAM_GRANULE: usize = 32;
const SR_ERROR_MASK: u32 = 0x0FEE_0000;
const CCR_CLEAR_ALL: u32 = 0x0FEF_0000;

mod reg {
    pub const KEYR: u32 = 0x004;
    pub const CR: u32 = 0x00C;
    pub const SR: u32 = 0x010;
    pub const CCR: u32 = 0x014;
}

/// One of the two (or, on smaller parts, one) banked register windows, each
/// with its own unlock key, control/status registers and busy bit.
#[derive(Clone, Copy)]
struct FlashBank<'a, M: MemoryAccess> {
    mem: &'a M,
    base: u32,
    ap_num: u8,
}

impl<'a, M: MemoryAccess> FlashBank<'a, M> {
    fn read_reg(&self, off: u32) -> Result<u32> {
        self.mem.read_32(self.base + off, self.ap_num)
    }

    fn write_reg(&self, off: u32, v: u32) -> Result<()> {
        self.mem.write_32(v, self.base + off, self.ap_num)
    }

    fn clear_errors(&self) -> Result<()> {
        self.write_reg(reg::CCR, CCR_CLEAR_ALL)
    }

    fn check_errors(&self) -> Result<()> {
        let sr = self.read_reg(reg::SR)?;
        if sr & SR_ERROR_MASK != 0 {
            return Err(Error::FlashError { sr });
        }
        Ok(())
    }

    fn wait_prg_idle(&self) -> Result<()> {
        loop {
            if self.read_reg(reg::SR)? & 7 == 0 {
                return Ok(());
            }
        }
    }

    fn pg_unlock(&self) -> Result<()> {
        let v = self.read_reg(reg::CR)?;
        if v & 1 != 0 {
            self.write_reg(reg::KEYR, 0x4567_0123)?;
            self.write_reg(reg::KEYR, 0xCDEF_89AB)?;
            if self.read_reg(reg::CR)? & 1 != 0 {
                return Err(Error::Protocol("flash bank rejected its unlock key sequence".into()));
            }
        }
        let v = self.read_reg(reg::CR)?;
        if v & 2 == 0 {
            self.write_reg(reg::CR, v | 2)?;
        }
        Ok(())
    }

    fn pg_lock(&self) -> Result<()> {
        let v = self.read_reg(reg::CR)?;
        self.write_reg(reg::CR, (v & !2) | 1)
    }
}

/// Scoped bank unlock: unlocks on construction, relocks on every exit path
/// including an early `?` return, the same shape as [`std::sync::MutexGuard`].
struct BankUnlockGuard<'a, M: MemoryAccess> {
    bank: FlashBank<'a, M>,
}

impl<'a, M: MemoryAccess> BankUnlockGuard<'a, M> {
    fn new(bank: FlashBank<'a, M>) -> Result<Self> {
        bank.pg_unlock()?;
        Ok(Self { bank })
    }
}

impl<'a, M: MemoryAccess> Drop for BankUnlockGuard<'a, M> {
    fn drop(&mut self) {
        if let Err(e) = self.bank.pg_lock() {
            log::error!("failed to relock flash bank at 0x{:08x}: {e}", self.bank.base);
        }
    }
}

pub struct H7Flash<'a, T: Target, M: MemoryAccess> {
    mem: &'a M,
    target: &'a T,
    ap_num: u8,
    geometry: FlashGeometry,
    banks: Vec<FlashBank<'a, M>>,
    sectors_per_bank: u32,
    bank_size: u32,
}

impl<'a, T: Target, M: MemoryAccess> std::fmt::Debug for H7Flash<'a, T, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H7Flash").field("geometry", &self.geometry).finish_non_exhaustive()
    }
}

impl<'a, T: Target, M: MemoryAccess> H7Flash<'a, T, M> {
    pub fn new(mem: &'a M, target: &'a T, dev_base: u32, mem_base: u32, ap_num: u8) -> Self {
        const SECTOR_SIZE: u32 = 128 * 1024;
        let flash_size = target.flash_size();
        let nsectors = flash_size / SECTOR_SIZE;
        let nbanks = if flash_size == 128 * 1024 { 1 } else { 2 };
        let sectors_per_bank = nsectors / nbanks;
        let bank_size = SECTOR_SIZE * sectors_per_bank;

        let banks = (0..nbanks)
            .map(|i| FlashBank { mem, base: dev_base + 0x100 * i, ap_num })
            .collect();

        Self {
            mem,
            target,
            ap_num,
            geometry: FlashGeometry { base_addr: mem_base, sector_size: SECTOR_SIZE, nsectors },
            banks,
            sectors_per_bank,
            bank_size,
        }
    }
}

impl<'a, T: Target, M: MemoryAccess> FlashDevice for H7Flash<'a, T, M> {
    fn geometry(&self) -> &FlashGeometry {
        &self.geometry
    }

    fn program_granule(&self) -> usize {
        PROGRAM_GRANULE
    }

    fn erase_sector(&self, n: u32) -> Result<()> {
        if n >= self.geometry.nsectors {
            return Err(Error::Range { addr: self.geometry.base_addr, len: 0 });
        }
        let addr = self.geometry.base_addr + n * self.geometry.sector_size;
        log::debug!("erasing sector {n} [0x{addr:08x}, 0x{:08x})", addr + self.geometry.sector_size);

        let bank = self.banks[(n / self.sectors_per_bank) as usize];
        let _guard = BankUnlockGuard::new(bank)?;
        bank.clear_errors()?;
        let v = bank.read_reg(reg::CR)?;
        let v = v | ((n % self.sectors_per_bank) << 8) | (1 << 7) | (1 << 2);
        bank.write_reg(reg::CR, v)?;
        bank.wait_prg_idle()?;
        bank.check_errors()
    }

    fn read(&self, addr: u32, len: usize) -> Result<Vec<u8>> {
        self.mem.read_bulk(addr, len, self.ap_num)
    }

    fn write(&self, addr: u32, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if !self.target.is_halted() {
            return Err(Error::Protocol("target must be halted to program flash".into()));
        }
        let granule = PROGRAM_GRANULE as u32;
        if data.len() % PROGRAM_GRANULE != 0 || addr % granule != 0 {
            return Err(Error::Alignment { addr, required: granule });
        }
        let end = addr + data.len() as u32 - 1;
        if (addr - self.geometry.base_addr) / self.bank_size != (end - self.geometry.base_addr) / self.bank_size {
            return Err(Error::Range { addr, len: data.len() });
        }
        if addr < self.geometry.base_addr
            || addr + data.len() as u32 > self.geometry.base_addr + self.geometry.flash_size()
        {
            return Err(Error::Range { addr, len: data.len() });
        }

        log::info!("flashing [0x{addr:08x}, 0x{:08x})", addr + data.len() as u32);
        let bank = self.banks[((addr - self.geometry.base_addr) / self.bank_size) as usize];
        let _guard = BankUnlockGuard::new(bank)?;
        bank.clear_errors()?;
        self.mem.write_bulk(data, addr, self.ap_num)?;
        bank.wait_prg_idle()?;
        bank.check_errors()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dv::Alp;
    use std::cell::RefCell;
    use std::collections::HashMap as Map;

    /// An in-memory stand-in for a connected probe: flash-array bytes plus
    /// one bank's worth of KEYR/CR/SR/CCR register state, enough to drive
    /// the unlock/erase/program sequence without real hardware. CR starts
    /// locked (bit 0 set) and only clears it on the correct two-word KEYR
    /// sequence, mirroring the real bank's unlock protocol.
    struct FakeMcu {
        flash: RefCell<Vec<u8>>,
        dev_base: u32,
        mem_base: u32,
        regs: RefCell<Map<u32, u32>>,
        keyr_armed: RefCell<Map<u32, bool>>,
    }

    impl FakeMcu {
        fn new(mem_base: u32, dev_base: u32, flash_size: usize) -> Self {
            Self {
                flash: RefCell::new(vec![0xFFu8; flash_size]),
                dev_base,
                mem_base,
                regs: RefCell::new(Map::new()),
                keyr_armed: RefCell::new(Map::new()),
            }
        }

        fn bank_base(&self, addr: u32) -> u32 {
            let rel = addr - self.dev_base;
            self.dev_base + (rel / 0x100) * 0x100
        }
    }

    impl MemoryAccess for FakeMcu {
        fn read_32(&self, addr: u32, _ap_num: u8) -> Result<u32> {
            if addr >= self.dev_base {
                let bank_base = self.bank_base(addr);
                let off = (addr - self.dev_base) % 0x100;
                if off == reg::CR {
                    return Ok(*self.regs.borrow().get(&(bank_base + reg::CR)).unwrap_or(&1));
                }
                return Ok(*self.regs.borrow().get(&addr).unwrap_or(&0));
            }
            let off = (addr - self.mem_base) as usize;
            let flash = self.flash.borrow();
            Ok(u32::from_le_bytes(flash[off..off + 4].try_into().unwrap()))
        }

        fn write_32(&self, v: u32, addr: u32, _ap_num: u8) -> Result<()> {
            if addr >= self.dev_base {
                let bank_base = self.bank_base(addr);
                let off = (addr - self.dev_base) % 0x100;
                if off == reg::KEYR {
                    let mut armed = self.keyr_armed.borrow_mut();
                    let seen_first = *armed.get(&bank_base).unwrap_or(&false);
                    if !seen_first && v == 0x4567_0123 {
                        armed.insert(bank_base, true);
                    } else if seen_first && v == 0xCDEF_89AB {
                        armed.insert(bank_base, false);
                        let mut regs = self.regs.borrow_mut();
                        let cr = *regs.get(&(bank_base + reg::CR)).unwrap_or(&1);
                        regs.insert(bank_base + reg::CR, cr & !1);
                    } else {
                        armed.insert(bank_base, false);
                    }
                    return Ok(());
                }
                self.regs.borrow_mut().insert(addr, v);
                return Ok(());
            }
            let off = (addr - self.mem_base) as usize;
            let mut flash = self.flash.borrow_mut();
            flash[off..off + 4].copy_from_slice(&v.to_le_bytes());
            Ok(())
        }

        fn read_16(&self, _addr: u32, _ap_num: u8) -> Result<u16> {
            unimplemented!("not exercised by the flash pipeline")
        }
        fn write_16(&self, _v: u16, _addr: u32, _ap_num: u8) -> Result<()> {
            unimplemented!("not exercised by the flash pipeline")
        }
        fn read_8(&self, _addr: u32, _ap_num: u8) -> Result<u8> {
            unimplemented!("not exercised by the flash pipeline")
        }
        fn write_8(&self, _v: u8, _addr: u32, _ap_num: u8) -> Result<()> {
            unimplemented!("not exercised by the flash pipeline")
        }

        fn read_bulk(&self, addr: u32, size: usize, _ap_num: u8) -> Result<Vec<u8>> {
            let off = (addr - self.mem_base) as usize;
            Ok(self.flash.borrow()[off..off + size].to_vec())
        }

        fn write_bulk(&self, data: &[u8], addr: u32, _ap_num: u8) -> Result<()> {
            let off = (addr - self.mem_base) as usize;
            self.flash.borrow_mut()[off..off + data.len()].copy_from_slice(data);
            Ok(())
        }
    }

    struct AlwaysHalted(u32);

    impl Target for AlwaysHalted {
        fn aps(&self) -> &Map<u8, crate::ap::Ap> {
            unimplemented!("geometry-only fake, no live APs")
        }
        fn cpus(&self) -> &[crate::target::Cpu] {
            &[]
        }
        fn is_halted(&self) -> bool {
            true
        }
        fn flash_size(&self) -> u32 {
            self.0
        }
    }

    #[test]
    fn erase_sector_then_write_then_read_round_trips() {
        const MEM_BASE: u32 = 0x0800_0000;
        const DEV_BASE: u32 = 0x5200_2000;
        const FLASH_SIZE: usize = 128 * 1024;

        let mcu = FakeMcu::new(MEM_BASE, DEV_BASE, FLASH_SIZE);
        let target = AlwaysHalted(FLASH_SIZE as u32);
        let flash = H7Flash::new(&mcu, &target, DEV_BASE, MEM_BASE, 0);

        flash.erase_sector(0).unwrap();
        assert!(flash.read(MEM_BASE, 64).unwrap().iter().all(|&b| b == 0xFF));

        let data = vec![0xAAu8; 64];
        flash.write(MEM_BASE, &data).unwrap();
        assert_eq!(flash.read(MEM_BASE, 64).unwrap(), data);
    }

    #[test]
    fn burn_dv_erases_writes_and_verifies_through_the_fake() {
        const MEM_BASE: u32 = 0x0800_0000;
        const DEV_BASE: u32 = 0x5200_2000;
        const FLASH_SIZE: usize = 128 * 1024;

        let mcu = FakeMcu::new(MEM_BASE, DEV_BASE, FLASH_SIZE);
        let target = AlwaysHalted(FLASH_SIZE as u32);
        let flash = H7Flash::new(&mcu, &target, DEV_BASE, MEM_BASE, 0);

        let dv = vec![Alp::new(MEM_BASE, b"ABCD".to_vec())];
        flash.burn_dv(&dv).unwrap();

        let back = flash.read(MEM_BASE, 4).unwrap();
        assert_eq!(back, b"ABCD");
    }

    #[test]
    fn dual_bank_geometry_splits_sectors_evenly() {
        let flash_size = 2 * 1024 * 1024u32;
        let nbanks = if flash_size == 128 * 1024 { 1 } else { 2 };
        let nsectors = flash_size / (128 * 1024);
        let sectors_per_bank = nsectors / nbanks;
        assert_eq!(nbanks, 2);
        assert_eq!(nsectors, 16);
        assert_eq!(sectors_per_bank, 8);
    }

    #[test]
    fn single_bank_geometry_for_128k_part() {
        let flash_size = 128 * 1024u32;
        let nbanks = if flash_size == 128 * 1024 { 1 } else { 2 };
        assert_eq!(nbanks, 1);
    }
}
