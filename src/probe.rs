//! Top-level probe handle: ties the transport, mode and capability layers
//! together, tracks registered Access Ports, and makes the offload decision
//! for every memory access.

use std::collections::HashMap;

use crate::ap::{Ap, ApKind, ApRegisterAccess};
use crate::capability::{self, Capabilities, Features};
use crate::cdb;
use crate::error::{Error, Result};
use crate::mode;
use crate::segment::{frame_word_aligned, split_at_page_boundaries};
use crate::transport::ProbeTransport;
use crate::usb::UsbTransport;

/// If there is no AP registered for `ap_num` there is no local state to
/// maintain, so the probe is trusted to offload. Otherwise only an AHB-AP is
/// safe to offload: any other kind of AP has its CSW's upper bits clobbered
/// by the probe's firmware, which can clear `CSW.DbgSwEnable`.
fn should_offload_kind(kind: Option<ApKind>) -> bool {
    matches!(kind, None | Some(ApKind::Ahb))
}

/// The memory-access surface a flash driver needs, factored out of `Probe` so
/// the flash pipeline can be exercised against an in-memory fake in tests
/// without a real USB device.
pub trait MemoryAccess {
    fn read_32(&self, addr: u32, ap_num: u8) -> Result<u32>;
    fn write_32(&self, v: u32, addr: u32, ap_num: u8) -> Result<()>;
    fn read_16(&self, addr: u32, ap_num: u8) -> Result<u16>;
    fn write_16(&self, v: u16, addr: u32, ap_num: u8) -> Result<()>;
    fn read_8(&self, addr: u32, ap_num: u8) -> Result<u8>;
    fn write_8(&self, v: u8, addr: u32, ap_num: u8) -> Result<()>;
    fn read_bulk(&self, addr: u32, size: usize, ap_num: u8) -> Result<Vec<u8>>;
    fn write_bulk(&self, data: &[u8], addr: u32, ap_num: u8) -> Result<()>;
}

#[derive(Debug)]
pub struct Probe {
    transport: ProbeTransport,
    capabilities: Capabilities,
    aps: HashMap<u8, Ap>,
}

impl Probe {
    /// Runs the mode-connect sequence and derives feature support from the
    /// probe's reported firmware version.
    pub fn connect(usb: UsbTransport) -> Result<Self> {
        let transport = ProbeTransport::new(usb);
        mode::connect(&transport)?;

        let version = transport.exec_cdb(&cdb::Version2)?;
        let capabilities = capability::derive(version);
        log::info!(
            "connected: features={:?}, max_rw8={}",
            capabilities.features,
            capabilities.max_rw8
        );

        Ok(Self { transport, capabilities, aps: HashMap::new() })
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Negotiates the SWD clock, picking the highest supported frequency not
    /// exceeding `requested_hz`.
    pub fn set_tck_freq(&self, requested_hz: u32) -> Result<u32> {
        if !self.capabilities.features.contains(Features::SWD_SET_FREQ) {
            return Err(Error::Protocol(
                "probe firmware does not support frequency selection".into(),
            ));
        }
        let freqs = self.transport.exec_cdb(&cdb::GetComFreqs)?;
        let chosen = capability::pick_frequency(&freqs, requested_hz)?;
        capability::apply_frequency(&self.transport, chosen)
    }

    pub fn get_voltage(&self) -> Result<f64> {
        if !self.capabilities.features.contains(Features::VOLTAGE) {
            return Err(Error::Protocol(
                "probe firmware does not report target voltage".into(),
            ));
        }
        let (vref_adc, target_adc) = self.transport.exec_cdb(&cdb::ReadVoltage)?;
        Ok(2.4 * target_adc as f64 / vref_adc as f64)
    }

    pub fn assert_srst(&self) -> Result<()> {
        self.transport.exec_with_retry(&cdb::SetSrst { assert: true })
    }

    pub fn deassert_srst(&self) -> Result<()> {
        self.transport.exec_with_retry(&cdb::SetSrst { assert: false })
    }

    /// Registers an AP's kind so the offload decision can be made without a
    /// round trip, opening it on the probe first if the firmware requires an
    /// explicit init command.
    pub fn register_ap(&mut self, apsel: u8, kind: ApKind) -> Result<()> {
        if self.capabilities.features.contains(Features::OPEN_AP) {
            self.transport.exec_with_retry(&cdb::OpenAp { apsel })?;
        }
        self.aps.insert(apsel, Ap::new(apsel, kind));
        Ok(())
    }

    fn ap_kind(&self, ap_num: u8) -> Option<ApKind> {
        self.aps.get(&ap_num).map(|ap| ap.kind)
    }

    pub fn read_32(&self, addr: u32, ap_num: u8) -> Result<u32> {
        if addr % 4 != 0 {
            return Err(Error::Alignment { addr, required: 4 });
        }
        if should_offload_kind(self.ap_kind(ap_num)) {
            self.transport.exec_with_retry(&cdb::Read32 { addr, ap_num })
        } else {
            self.aps[&ap_num].read_32(self, addr)
        }
    }

    pub fn write_32(&self, v: u32, addr: u32, ap_num: u8) -> Result<()> {
        if addr % 4 != 0 {
            return Err(Error::Alignment { addr, required: 4 });
        }
        if should_offload_kind(self.ap_kind(ap_num)) {
            self.transport.exec_with_retry(&cdb::Write32 { addr, value: v, ap_num })
        } else {
            self.aps[&ap_num].write_32(self, v, addr)
        }
    }

    pub fn read_16(&self, addr: u32, ap_num: u8) -> Result<u16> {
        if addr % 2 != 0 {
            return Err(Error::Alignment { addr, required: 2 });
        }
        if should_offload_kind(self.ap_kind(ap_num)) {
            if !self.capabilities.features.contains(Features::BULK_READ_16) {
                return Err(Error::Protocol("probe firmware lacks the 16-bit bulk read command".into()));
            }
            let bytes = self.transport.exec_with_retry(&cdb::BulkRead16 { addr, n: 1, ap_num })?;
            Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
        } else {
            self.aps[&ap_num].read_16(self, addr)
        }
    }

    pub fn write_16(&self, v: u16, addr: u32, ap_num: u8) -> Result<()> {
        if addr % 2 != 0 {
            return Err(Error::Alignment { addr, required: 2 });
        }
        if should_offload_kind(self.ap_kind(ap_num)) {
            self.transport
                .exec_with_retry(&cdb::BulkWrite16 { addr, data: v.to_le_bytes().to_vec(), ap_num })
        } else {
            self.aps[&ap_num].write_16(self, v, addr)
        }
    }

    /// Some firmwares return a minimum of two bytes for a one-byte bulk read;
    /// the low byte is the value actually read (see DESIGN.md).
    pub fn read_8(&self, addr: u32, ap_num: u8) -> Result<u8> {
        if should_offload_kind(self.ap_kind(ap_num)) {
            let bytes = self.transport.exec_with_retry(&cdb::BulkRead8 { addr, n: 1, ap_num })?;
            Ok(bytes[0])
        } else {
            self.aps[&ap_num].read_8(self, addr)
        }
    }

    pub fn write_8(&self, v: u8, addr: u32, ap_num: u8) -> Result<()> {
        if should_offload_kind(self.ap_kind(ap_num)) {
            self.transport
                .exec_with_retry(&cdb::BulkWrite8 { addr, data: vec![v], ap_num })
        } else {
            self.aps[&ap_num].write_8(self, v, addr)
        }
    }

    /// Bulk-reads `[addr, addr+size)`, splitting at 1 KiB page boundaries
    /// (the TAR auto-increment window) and framing a word-aligned middle
    /// within each page so only `read_8`/`read_32` calls ever hit the wire.
    pub fn read_bulk(&self, addr: u32, size: usize, ap_num: u8) -> Result<Vec<u8>> {
        if !should_offload_kind(self.ap_kind(ap_num)) {
            return self.aps[&ap_num].read_bulk(self, addr, size);
        }

        let mut out = Vec::with_capacity(size);
        for (seg_addr, seg_len) in split_at_page_boundaries(addr, size as u32) {
            out.extend(self.read_bulk_segment(seg_addr, seg_len, ap_num)?);
        }
        Ok(out)
    }

    fn read_bulk_segment(&self, addr: u32, len: u32, ap_num: u8) -> Result<Vec<u8>> {
        let (head_len, mid_addr, mid_len, tail_len) = frame_word_aligned(addr, len);
        let mut out = Vec::with_capacity(len as usize);

        let mut cursor = addr;
        for _ in 0..head_len {
            out.push(self.read_8(cursor, ap_num)?);
            cursor += 1;
        }

        if mid_len > 0 {
            let words = self.transport.exec_with_retry(&cdb::BulkRead32 {
                addr: mid_addr,
                n: (mid_len / 4) as u16,
                ap_num,
            })?;
            out.extend_from_slice(&words);
        }

        let mut tail_cursor = mid_addr + mid_len;
        for _ in 0..tail_len {
            out.push(self.read_8(tail_cursor, ap_num)?);
            tail_cursor += 1;
        }

        Ok(out)
    }

    /// Bulk-writes `data` at `addr`. Only the word-aligned middle is
    /// offloaded as a single 32-bit bulk write; misaligned head/tail bytes go
    /// through `write_8`.
    pub fn write_bulk(&self, data: &[u8], addr: u32, ap_num: u8) -> Result<()> {
        if !should_offload_kind(self.ap_kind(ap_num)) {
            return self.aps[&ap_num].write_bulk(self, data, addr);
        }

        let mut offset = 0usize;
        for (seg_addr, seg_len) in split_at_page_boundaries(addr, data.len() as u32) {
            let seg = &data[offset..offset + seg_len as usize];
            self.write_bulk_segment(seg, seg_addr, ap_num)?;
            offset += seg_len as usize;
        }
        Ok(())
    }

    fn write_bulk_segment(&self, data: &[u8], addr: u32, ap_num: u8) -> Result<()> {
        let (head_len, mid_addr, mid_len, _tail_len) = frame_word_aligned(addr, data.len() as u32);

        let mut cursor = addr;
        for &b in &data[..head_len as usize] {
            self.write_8(b, cursor, ap_num)?;
            cursor += 1;
        }

        let mid_start = head_len as usize;
        let mid_end = mid_start + mid_len as usize;
        if mid_len > 0 {
            self.transport.exec_with_retry(&cdb::BulkWrite32 {
                addr: mid_addr,
                data: data[mid_start..mid_end].to_vec(),
                ap_num,
            })?;
        }

        let mut tail_cursor = mid_addr + mid_len;
        for &b in &data[mid_end..] {
            self.write_8(b, tail_cursor, ap_num)?;
            tail_cursor += 1;
        }

        Ok(())
    }
}

impl ApRegisterAccess for Probe {
    fn read_ap_reg(&self, apsel: u8, addr: u8) -> Result<u32> {
        self.transport.exec_with_retry(&cdb::ReadApReg { apsel, addr })
    }

    fn write_ap_reg(&self, apsel: u8, addr: u8, value: u32) -> Result<()> {
        self.transport.exec_with_retry(&cdb::WriteApReg { apsel, addr, value })
    }
}

impl MemoryAccess for Probe {
    fn read_32(&self, addr: u32, ap_num: u8) -> Result<u32> {
        Probe::read_32(self, addr, ap_num)
    }

    fn write_32(&self, v: u32, addr: u32, ap_num: u8) -> Result<()> {
        Probe::write_32(self, v, addr, ap_num)
    }

    fn read_16(&self, addr: u32, ap_num: u8) -> Result<u16> {
        Probe::read_16(self, addr, ap_num)
    }

    fn write_16(&self, v: u16, addr: u32, ap_num: u8) -> Result<()> {
        Probe::write_16(self, v, addr, ap_num)
    }

    fn read_8(&self, addr: u32, ap_num: u8) -> Result<u8> {
        Probe::read_8(self, addr, ap_num)
    }

    fn write_8(&self, v: u8, addr: u32, ap_num: u8) -> Result<()> {
        Probe::write_8(self, v, addr, ap_num)
    }

    fn read_bulk(&self, addr: u32, size: usize, ap_num: u8) -> Result<Vec<u8>> {
        Probe::read_bulk(self, addr, size, ap_num)
    }

    fn write_bulk(&self, data: &[u8], addr: u32, ap_num: u8) -> Result<()> {
        Probe::write_bulk(self, data, addr, ap_num)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unregistered_ap_is_always_offloaded() {
        assert!(should_offload_kind(None));
    }

    #[test]
    fn only_ahb_ap_is_offloaded_when_registered() {
        assert!(should_offload_kind(Some(ApKind::Ahb)));
        assert!(!should_offload_kind(Some(ApKind::Apb)));
        assert!(!should_offload_kind(Some(ApKind::Other)));
    }
}
