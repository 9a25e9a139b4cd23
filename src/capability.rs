//! Feature derivation from the probe's firmware version, and SWD clock
//! negotiation.

use crate::cdb::{self, VersionInfo};
use crate::error::{Error, Result};
use crate::status::StatusCode;
use crate::transport::ProbeTransport;

bitflags::bitflags! {
    pub struct Features: u16 {
        const RW_STATUS_12  = 1 << 0;
        const SWD_SET_FREQ  = 1 << 1;
        const BULK_READ_16  = 1 << 2;
        const BULK_WRITE_16 = 1 << 3;
        const VOLTAGE       = 1 << 4;
        const AP            = 1 << 5;
        const OPEN_AP       = 1 << 6;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    pub features: Features,
    pub max_rw8: usize,
}

/// Table-driven feature/limit derivation keyed by `(ver_stlink, ver_jtag)`.
pub fn derive(version: VersionInfo) -> Capabilities {
    match version.ver_stlink {
        3 => Capabilities {
            features: Features::RW_STATUS_12
                | Features::SWD_SET_FREQ
                | Features::BULK_READ_16
                | Features::BULK_WRITE_16
                | Features::VOLTAGE
                | Features::AP
                | Features::OPEN_AP,
            max_rw8: 512,
        },
        2 if version.ver_jtag >= 32 => Capabilities {
            features: Features::VOLTAGE | Features::AP | Features::SWD_SET_FREQ,
            max_rw8: 64,
        },
        _ => Capabilities {
            features: Features::VOLTAGE,
            max_rw8: 64,
        },
    }
}

/// Picks the highest supported frequency not exceeding `requested_hz` from a
/// descending kHz table. Pure and host-testable, independent of hardware.
pub fn pick_frequency(freqs_khz_desc: &[u32], requested_hz: u32) -> Result<u32> {
    let requested_khz = requested_hz / 1000;
    freqs_khz_desc
        .iter()
        .copied()
        .find(|&f| f <= requested_khz)
        .map(|f| f * 1000)
        .ok_or(Error::FrequencyTooLow { requested_hz })
}

/// Issues the live `SetComFreq` CDB for the frequency already chosen by
/// [`pick_frequency`], treating status `0x08` as a second, defensive
/// detection of the same "too low" condition (see DESIGN.md).
pub fn apply_frequency(transport: &ProbeTransport, chosen_hz: u32) -> Result<u32> {
    let cmd = cdb::SetComFreq {
        freq_khz: chosen_hz / 1000,
        is_jtag: false,
    };
    match transport.exec_with_retry(&cmd) {
        Ok(actual_khz) => Ok(actual_khz * 1000),
        Err(Error::CmdStatus(StatusCode::Other(0x08))) => {
            log::warn!(
                "probe firmware rejected {} kHz as too low despite matching the cached SWD clock table",
                chosen_hz / 1000
            );
            Err(Error::FrequencyTooLow { requested_hz: chosen_hz })
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v3_gets_the_full_feature_set() {
        let caps = derive(VersionInfo {
            ver_stlink: 3,
            ver_jtag: 10,
            ver_swim: 0,
            ver_msd: 0,
            ver_bridge: 0,
        });
        assert!(caps.features.contains(Features::BULK_READ_16));
        assert!(caps.features.contains(Features::AP));
        assert_eq!(caps.max_rw8, 512);
    }

    #[test]
    fn v2_lacks_bulk_16() {
        let caps = derive(VersionInfo {
            ver_stlink: 2,
            ver_jtag: 40,
            ver_swim: 0,
            ver_msd: 0,
            ver_bridge: 0,
        });
        assert!(!caps.features.contains(Features::BULK_READ_16));
        assert!(caps.features.contains(Features::VOLTAGE));
    }

    #[test]
    fn picks_highest_frequency_not_exceeding_request() {
        let freqs = [4000, 1800, 950, 480];
        assert_eq!(pick_frequency(&freqs, 2_000_000).unwrap(), 1_800_000);
        assert_eq!(pick_frequency(&freqs, 4_000_000).unwrap(), 4_000_000);
    }

    #[test]
    fn below_minimum_frequency_fails() {
        let freqs = [4000, 1800, 950, 480];
        let err = pick_frequency(&freqs, 100_000).unwrap_err();
        assert!(matches!(err, Error::FrequencyTooLow { requested_hz: 100_000 }));
    }
}
