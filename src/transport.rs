//! Executes a [`Cdb`](crate::cdb::Cdb) by driving its command/data/status
//! phases over the USB transport, and retries transient WAIT statuses.

use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use crate::cdb::{Cdb, CdbFlags};
use crate::error::{Error, Result};
use crate::status::StatusCode;
use crate::usb::UsbTransport;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_RETRIES: u32 = 10;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Serializes every command issued to one probe's USB endpoints.
///
/// Only one command is ever outstanding on the wire at a time; the mutex is
/// the whole of the concurrency story this crate needs (§5 of the design
/// notes), since USB bulk transfers on a single probe cannot be interleaved.
pub struct ProbeTransport {
    usb: Mutex<UsbTransport>,
}

impl std::fmt::Debug for ProbeTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeTransport").finish_non_exhaustive()
    }
}

impl ProbeTransport {
    pub fn new(usb: UsbTransport) -> Self {
        Self { usb: Mutex::new(usb) }
    }

    /// Executes one CDB to completion, translating an embedded non-OK status
    /// byte (or a follow-up status-phase query) into `Error::CmdStatus`.
    pub fn exec_cdb<C: Cdb>(&self, cmd: &C) -> Result<C::Response> {
        let mut usb = self.usb.lock().unwrap();
        self.exec_cdb_locked(&mut usb, cmd, DEFAULT_TIMEOUT)
    }

    fn exec_cdb_locked<C: Cdb>(
        &self,
        usb: &mut UsbTransport,
        cmd: &C,
        timeout: Duration,
    ) -> Result<C::Response> {
        let raw = cmd.encode();
        log::trace!("exec_cdb: {:02x?}", raw);
        usb.write(&raw, timeout)?;

        if C::FLAGS.contains(CdbFlags::HAS_DATA_OUT_PHASE) {
            usb.write(cmd.data_out(), timeout)?;
        }

        let rsp = if C::FLAGS.contains(CdbFlags::HAS_DATA_IN_PHASE) {
            let buf = usb.read(cmd.rsp_len(), timeout)?;
            if C::FLAGS.contains(CdbFlags::HAS_EMBEDDED_STATUS) {
                let status = StatusCode::from_byte(buf[0]);
                if status != StatusCode::Ok {
                    return Err(Error::CmdStatus(status));
                }
            }
            cmd.decode(&buf)
        } else {
            cmd.decode(&[])
        };

        if C::FLAGS.contains(CdbFlags::HAS_STATUS_PHASE) {
            let (status, fault_addr) = self.query_last_xfer_status(usb, timeout)?;
            if status != StatusCode::Ok {
                log::debug!("status phase reported fault at 0x{fault_addr:08x}");
                return Err(Error::CmdStatus(status));
            }
        }

        Ok(rsp)
    }

    fn query_last_xfer_status(
        &self,
        usb: &mut UsbTransport,
        timeout: Duration,
    ) -> Result<(StatusCode, u32)> {
        let cmd = crate::cdb::LastXferStatus12;
        let raw = cmd.encode();
        usb.write(&raw, timeout)?;
        let buf = usb.read(cmd.rsp_len(), timeout)?;
        Ok(cmd.decode(&buf))
    }

    /// Executes a CDB, retrying while the probe returns `SWD_AP_WAIT` or
    /// `SWD_DP_WAIT`. Any other error propagates immediately.
    pub fn exec_with_retry<C: Cdb>(&self, cmd: &C) -> Result<C::Response> {
        let mut usb = self.usb.lock().unwrap();
        for attempt in 0..DEFAULT_RETRIES {
            match self.exec_cdb_locked(&mut usb, cmd, DEFAULT_TIMEOUT) {
                Ok(v) => return Ok(v),
                Err(Error::CmdStatus(status)) if status.is_retryable() => {
                    log::debug!("retrying after {:?} (attempt {})", status, attempt + 1);
                    thread::sleep(DEFAULT_RETRY_DELAY);
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::MaxRetries)
    }
}
