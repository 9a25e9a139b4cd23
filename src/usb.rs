//! Raw bulk IN/OUT transport to the STLink's vendor USB endpoints.

use std::time::Duration;

use rusb::{DeviceHandle, GlobalContext};

use crate::error::{Error, Result};

/// STLink V3E vendor IDs.
pub const VENDOR_ID: u16 = 0x0483;
pub const PRODUCT_ID_V3E: u16 = 0x374E;

const EP_IN: u8 = 0x81;
const EP_OUT: u8 = 0x01;

/// Maximum size of data the probe can return in a single data-in phase.
pub const MAX_DATA_IN: usize = 4096;

pub struct UsbTransport {
    handle: DeviceHandle<GlobalContext>,
}

impl std::fmt::Debug for UsbTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsbTransport").finish_non_exhaustive()
    }
}

impl UsbTransport {
    pub fn open_first() -> Result<Self> {
        let handle = rusb::open_device_with_vid_pid(VENDOR_ID, PRODUCT_ID_V3E)
            .ok_or(rusb::Error::NoDevice)?;
        Ok(Self { handle })
    }

    pub fn from_handle(handle: DeviceHandle<GlobalContext>) -> Self {
        Self { handle }
    }

    pub fn write(&mut self, data: &[u8], timeout: Duration) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let n = self.handle.write_bulk(EP_OUT, data, timeout)?;
        if n != data.len() {
            log::error!("short USB write: wrote {} of {} bytes", n, data.len());
            return Err(Error::UsbIo(rusb::Error::Io));
        }
        Ok(())
    }

    pub fn read(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        if len > MAX_DATA_IN {
            return Err(Error::Protocol(format!(
                "data-in phase of {len} bytes exceeds the probe's {MAX_DATA_IN}-byte cap"
            )));
        }
        let mut buf = vec![0u8; len];
        let n = self.handle.read_bulk(EP_IN, &mut buf, timeout)?;
        if n != len {
            log::error!("short USB read: read {} of {} bytes", n, len);
            return Err(Error::UsbIo(rusb::Error::Io));
        }
        Ok(buf)
    }
}
