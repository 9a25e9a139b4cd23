//! Probe mode lifecycle: DFU / MASS / DEBUG / SWIM / BOOTLOADER, and the
//! linear connect sequence that lands the probe in DEBUG (SWD) mode.

use crate::cdb;
use crate::error::{Error, Result};
use crate::transport::ProbeTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Dfu,
    Mass,
    Debug,
    Swim,
    Bootloader,
}

impl Mode {
    pub fn from_byte(b: u8) -> Self {
        match b {
            cdb::MODE_DFU => Mode::Dfu,
            cdb::MODE_MASS => Mode::Mass,
            cdb::MODE_DEBUG => Mode::Debug,
            cdb::MODE_SWIM => Mode::Swim,
            _ => Mode::Bootloader,
        }
    }
}

fn leave(transport: &ProbeTransport, mode: Mode) -> Result<()> {
    match mode {
        Mode::Dfu => transport.exec_cdb(&cdb::LeaveDfuMode),
        Mode::Debug => transport.exec_cdb(&cdb::LeaveDebugMode),
        Mode::Swim => transport.exec_cdb(&cdb::LeaveSwimMode),
        Mode::Mass | Mode::Bootloader => Ok(()),
    }
}

/// Leaves whatever mode the probe is currently in, enters SWD, and confirms
/// the probe ends up in DEBUG mode.
pub fn connect(transport: &ProbeTransport) -> Result<Mode> {
    let current = transport.exec_cdb(&cdb::GetCurrentMode)?;
    log::debug!("probe reports current mode {:?}", current);
    leave(transport, current)?;

    transport.exec_with_retry(&cdb::SwdConnect)?;

    let mode = transport.exec_cdb(&cdb::GetCurrentMode)?;
    if mode != Mode::Debug {
        log::error!("probe ended up in {:?} instead of DEBUG after SWD connect", mode);
        return Err(Error::ModeViolation);
    }
    log::info!("probe connected in DEBUG mode");
    Ok(mode)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_byte_maps_known_values() {
        assert_eq!(Mode::from_byte(0x00), Mode::Dfu);
        assert_eq!(Mode::from_byte(0x01), Mode::Mass);
        assert_eq!(Mode::from_byte(0x02), Mode::Debug);
        assert_eq!(Mode::from_byte(0x03), Mode::Swim);
        assert_eq!(Mode::from_byte(0x04), Mode::Bootloader);
    }

    #[test]
    fn unrecognized_byte_falls_back_to_bootloader() {
        assert_eq!(Mode::from_byte(0xFF), Mode::Bootloader);
    }
}
