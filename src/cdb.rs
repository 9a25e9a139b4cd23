//! 16-byte Command Descriptor Blocks sent to the probe's OUT endpoint.
//!
//! Each wire command is its own type implementing [`Cdb`], rather than one
//! struct keyed by an opcode byte, so that a command's flags, payload shape
//! and response decoding are checked together by the compiler.

use crate::mode::Mode;

bitflags::bitflags! {
    pub struct CdbFlags: u8 {
        const HAS_DATA_OUT_PHASE  = 1 << 0;
        const HAS_DATA_IN_PHASE   = 1 << 1;
        const HAS_EMBEDDED_STATUS = 1 << 2;
        const HAS_STATUS_PHASE    = 1 << 3;
    }
}

/// A single STLink vendor command.
pub trait Cdb {
    /// What `decode` produces once the response (if any) has been read.
    type Response;

    const FLAGS: CdbFlags;

    /// The 16-byte command block written to the OUT endpoint.
    fn encode(&self) -> [u8; 16];

    /// Payload written to the OUT endpoint after the command, when
    /// [`CdbFlags::HAS_DATA_OUT_PHASE`] is set.
    fn data_out(&self) -> &[u8] {
        &[]
    }

    /// Number of bytes to read from the IN endpoint, when
    /// [`CdbFlags::HAS_DATA_IN_PHASE`] is set. Varies per instance for the
    /// bulk commands, hence a method rather than an associated constant.
    fn rsp_len(&self) -> usize {
        0
    }

    fn decode(&self, rsp: &[u8]) -> Self::Response;
}

mod opcode {
    pub const GET_VERSION: u8 = 0xF1;
    pub const DEBUG_COMMAND: u8 = 0xF2;
    pub const DFU_COMMAND: u8 = 0xF3;
    pub const SWIM_COMMAND: u8 = 0xF4;
    pub const GET_CURRENT_MODE: u8 = 0xF5;
    pub const GET_TARGET_VOLTAGE: u8 = 0xF7;

    pub const DFU_EXIT: u8 = 0x07;
    pub const SWIM_EXIT: u8 = 0x01;

    pub const DEBUG_ENTER_SWD: u8 = 0xA3;
    pub const DEBUG_EXIT: u8 = 0x21;
    pub const DEBUG_READ_ID_CODES: u8 = 0x31;
    pub const DEBUG_READMEM_8BIT: u8 = 0x0C;
    pub const DEBUG_WRITEMEM_8BIT: u8 = 0x0D;
    pub const DEBUG_READMEM_16BIT: u8 = 0x47;
    pub const DEBUG_WRITEMEM_16BIT: u8 = 0x48;
    pub const DEBUG_READMEM_32BIT: u8 = 0x07;
    pub const DEBUG_WRITEMEM_32BIT: u8 = 0x08;
    pub const DEBUG_READALLREGS_STATUS: u8 = 0x3B;
    pub const DEBUG_DRIVE_NRST: u8 = 0x3C;
    pub const DEBUG_SWD_SET_FREQ: u8 = 0x43;
    pub const DEBUG_GET_COM_FREQ: u8 = 0x4A;
    pub const DEBUG_READ_DAP_REG: u8 = 0x45;
    pub const DEBUG_WRITE_DAP_REG: u8 = 0x46;
    pub const DEBUG_INIT_AP: u8 = 0x4B;
}

pub const MODE_DFU: u8 = 0x00;
pub const MODE_MASS: u8 = 0x01;
pub const MODE_DEBUG: u8 = 0x02;
pub const MODE_SWIM: u8 = 0x03;
pub const MODE_BOOTLOADER: u8 = 0x04;

fn cdb2(byte0: u8, byte1: u8) -> [u8; 16] {
    let mut b = [0u8; 16];
    b[0] = byte0;
    b[1] = byte1;
    b
}

fn put_u32_le(buf: &mut [u8], offset: usize, v: u32) {
    buf[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
}

fn get_u32_le(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
}

// ---------------------------------------------------------------------
// Mode management
// ---------------------------------------------------------------------

#[derive(Debug)]
pub struct GetCurrentMode;

impl Cdb for GetCurrentMode {
    type Response = Mode;
    const FLAGS: CdbFlags = CdbFlags::HAS_DATA_IN_PHASE;

    fn encode(&self) -> [u8; 16] {
        cdb2(opcode::GET_CURRENT_MODE, 0)
    }

    fn rsp_len(&self) -> usize {
        2
    }

    fn decode(&self, rsp: &[u8]) -> Mode {
        Mode::from_byte(rsp[0])
    }
}

#[derive(Debug)]
pub struct LeaveDfuMode;

impl Cdb for LeaveDfuMode {
    type Response = ();
    const FLAGS: CdbFlags = CdbFlags::empty();

    fn encode(&self) -> [u8; 16] {
        cdb2(opcode::DFU_COMMAND, opcode::DFU_EXIT)
    }

    fn decode(&self, _rsp: &[u8]) {}
}

#[derive(Debug)]
pub struct LeaveDebugMode;

impl Cdb for LeaveDebugMode {
    type Response = ();
    const FLAGS: CdbFlags = CdbFlags::empty();

    fn encode(&self) -> [u8; 16] {
        cdb2(opcode::DEBUG_COMMAND, opcode::DEBUG_EXIT)
    }

    fn decode(&self, _rsp: &[u8]) {}
}

#[derive(Debug)]
pub struct LeaveSwimMode;

impl Cdb for LeaveSwimMode {
    type Response = ();
    const FLAGS: CdbFlags = CdbFlags::empty();

    fn encode(&self) -> [u8; 16] {
        cdb2(opcode::SWIM_COMMAND, opcode::SWIM_EXIT)
    }

    fn decode(&self, _rsp: &[u8]) {}
}

#[derive(Debug)]
pub struct SwdConnect;

impl Cdb for SwdConnect {
    type Response = ();
    const FLAGS: CdbFlags = CdbFlags::from_bits_truncate(
        CdbFlags::HAS_DATA_IN_PHASE.bits() | CdbFlags::HAS_EMBEDDED_STATUS.bits(),
    );

    fn encode(&self) -> [u8; 16] {
        cdb2(opcode::DEBUG_COMMAND, opcode::DEBUG_ENTER_SWD)
    }

    fn rsp_len(&self) -> usize {
        2
    }

    fn decode(&self, _rsp: &[u8]) {}
}

// ---------------------------------------------------------------------
// Version / capability
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct VersionInfo {
    pub ver_stlink: u8,
    pub ver_jtag: u8,
    pub ver_swim: u8,
    pub ver_msd: u8,
    pub ver_bridge: u8,
}

#[derive(Debug)]
pub struct Version2;

impl Cdb for Version2 {
    type Response = VersionInfo;
    const FLAGS: CdbFlags = CdbFlags::HAS_DATA_IN_PHASE;

    fn encode(&self) -> [u8; 16] {
        cdb2(opcode::GET_VERSION, 0x80)
    }

    fn rsp_len(&self) -> usize {
        12
    }

    fn decode(&self, rsp: &[u8]) -> VersionInfo {
        VersionInfo {
            ver_stlink: rsp[0],
            ver_swim: rsp[1],
            ver_jtag: rsp[2],
            ver_msd: rsp[3],
            ver_bridge: rsp[4],
        }
    }
}

#[derive(Debug)]
pub struct ReadIdCodes;

impl Cdb for ReadIdCodes {
    type Response = u32;
    const FLAGS: CdbFlags = CdbFlags::from_bits_truncate(
        CdbFlags::HAS_DATA_IN_PHASE.bits() | CdbFlags::HAS_EMBEDDED_STATUS.bits(),
    );

    fn encode(&self) -> [u8; 16] {
        cdb2(opcode::DEBUG_COMMAND, opcode::DEBUG_READ_ID_CODES)
    }

    fn rsp_len(&self) -> usize {
        12
    }

    fn decode(&self, rsp: &[u8]) -> u32 {
        get_u32_le(rsp, 4)
    }
}

/// Supported SWD clock frequencies, descending, in kHz.
#[derive(Debug)]
pub struct GetComFreqs;

const MAX_FREQS: usize = 10;

impl Cdb for GetComFreqs {
    type Response = Vec<u32>;
    const FLAGS: CdbFlags = CdbFlags::from_bits_truncate(
        CdbFlags::HAS_DATA_IN_PHASE.bits() | CdbFlags::HAS_EMBEDDED_STATUS.bits(),
    );

    fn encode(&self) -> [u8; 16] {
        cdb2(opcode::DEBUG_COMMAND, opcode::DEBUG_GET_COM_FREQ)
    }

    fn rsp_len(&self) -> usize {
        4 + MAX_FREQS * 4
    }

    fn decode(&self, rsp: &[u8]) -> Vec<u32> {
        let count = (rsp[2] as usize).min(MAX_FREQS);
        (0..count)
            .map(|i| get_u32_le(rsp, 4 + i * 4))
            .collect()
    }
}

#[derive(Debug)]
pub struct SetComFreq {
    pub freq_khz: u32,
    pub is_jtag: bool,
}

impl Cdb for SetComFreq {
    type Response = u32;
    const FLAGS: CdbFlags = CdbFlags::from_bits_truncate(
        CdbFlags::HAS_DATA_IN_PHASE.bits() | CdbFlags::HAS_EMBEDDED_STATUS.bits(),
    );

    fn encode(&self) -> [u8; 16] {
        let mut b = cdb2(opcode::DEBUG_COMMAND, opcode::DEBUG_SWD_SET_FREQ);
        b[2] = u8::from(self.is_jtag);
        put_u32_le(&mut b, 4, self.freq_khz);
        b
    }

    fn rsp_len(&self) -> usize {
        8
    }

    fn decode(&self, rsp: &[u8]) -> u32 {
        get_u32_le(rsp, 4)
    }
}

#[derive(Debug)]
pub struct ReadVoltage;

impl Cdb for ReadVoltage {
    type Response = (u32, u32);
    const FLAGS: CdbFlags = CdbFlags::HAS_DATA_IN_PHASE;

    fn encode(&self) -> [u8; 16] {
        cdb2(opcode::GET_TARGET_VOLTAGE, 0)
    }

    fn rsp_len(&self) -> usize {
        8
    }

    fn decode(&self, rsp: &[u8]) -> (u32, u32) {
        (get_u32_le(rsp, 0), get_u32_le(rsp, 4))
    }
}

/// Queries the status of the previous data phase, for CDBs that don't embed
/// their own status byte (`HAS_STATUS_PHASE`).
#[derive(Debug)]
pub struct LastXferStatus12;

impl Cdb for LastXferStatus12 {
    type Response = (crate::status::StatusCode, u32);
    const FLAGS: CdbFlags = CdbFlags::HAS_DATA_IN_PHASE;

    fn encode(&self) -> [u8; 16] {
        cdb2(opcode::DEBUG_COMMAND, opcode::DEBUG_READALLREGS_STATUS)
    }

    fn rsp_len(&self) -> usize {
        12
    }

    fn decode(&self, rsp: &[u8]) -> (crate::status::StatusCode, u32) {
        (
            crate::status::StatusCode::from_byte(rsp[0]),
            get_u32_le(rsp, 4),
        )
    }
}

#[derive(Debug)]
pub struct SetSrst {
    pub assert: bool,
}

impl Cdb for SetSrst {
    type Response = ();
    const FLAGS: CdbFlags = CdbFlags::from_bits_truncate(
        CdbFlags::HAS_DATA_IN_PHASE.bits() | CdbFlags::HAS_EMBEDDED_STATUS.bits(),
    );

    fn encode(&self) -> [u8; 16] {
        let mut b = cdb2(opcode::DEBUG_COMMAND, opcode::DEBUG_DRIVE_NRST);
        b[2] = u8::from(!self.assert); // 0 = assert reset, 1 = release, per probe convention
        b
    }

    fn rsp_len(&self) -> usize {
        2
    }

    fn decode(&self, _rsp: &[u8]) {}
}

// ---------------------------------------------------------------------
// AP register access
// ---------------------------------------------------------------------

#[derive(Debug)]
pub struct OpenAp {
    pub apsel: u8,
}

impl Cdb for OpenAp {
    type Response = ();
    const FLAGS: CdbFlags = CdbFlags::from_bits_truncate(
        CdbFlags::HAS_DATA_IN_PHASE.bits() | CdbFlags::HAS_EMBEDDED_STATUS.bits(),
    );

    fn encode(&self) -> [u8; 16] {
        let mut b = cdb2(opcode::DEBUG_COMMAND, opcode::DEBUG_INIT_AP);
        b[2] = self.apsel;
        b
    }

    fn rsp_len(&self) -> usize {
        2
    }

    fn decode(&self, _rsp: &[u8]) {}
}

#[derive(Debug)]
pub struct ReadApReg {
    pub apsel: u8,
    pub addr: u8,
}

impl Cdb for ReadApReg {
    type Response = u32;
    const FLAGS: CdbFlags = CdbFlags::from_bits_truncate(
        CdbFlags::HAS_DATA_IN_PHASE.bits() | CdbFlags::HAS_EMBEDDED_STATUS.bits(),
    );

    fn encode(&self) -> [u8; 16] {
        let mut b = cdb2(opcode::DEBUG_COMMAND, opcode::DEBUG_READ_DAP_REG);
        b[2] = self.apsel;
        b[4] = self.addr;
        b
    }

    fn rsp_len(&self) -> usize {
        8
    }

    fn decode(&self, rsp: &[u8]) -> u32 {
        get_u32_le(rsp, 4)
    }
}

#[derive(Debug)]
pub struct WriteApReg {
    pub apsel: u8,
    pub addr: u8,
    pub value: u32,
}

impl Cdb for WriteApReg {
    type Response = ();
    const FLAGS: CdbFlags = CdbFlags::from_bits_truncate(
        CdbFlags::HAS_DATA_IN_PHASE.bits() | CdbFlags::HAS_EMBEDDED_STATUS.bits(),
    );

    fn encode(&self) -> [u8; 16] {
        let mut b = cdb2(opcode::DEBUG_COMMAND, opcode::DEBUG_WRITE_DAP_REG);
        b[2] = self.apsel;
        b[4] = self.addr;
        put_u32_le(&mut b, 8, self.value);
        b
    }

    fn rsp_len(&self) -> usize {
        2
    }

    fn decode(&self, _rsp: &[u8]) {}
}

// ---------------------------------------------------------------------
// Bulk memory access
// ---------------------------------------------------------------------

fn bulk_cdb(opcode: u8, addr: u32, n: u16, ap_num: u8) -> [u8; 16] {
    let mut b = [0u8; 16];
    b[0] = opcode;
    put_u32_le(&mut b, 2, addr);
    b[6..8].copy_from_slice(&n.to_le_bytes());
    b[8] = ap_num;
    b
}

#[derive(Debug)]
pub struct BulkRead8 {
    pub addr: u32,
    pub n: u16,
    pub ap_num: u8,
}

impl Cdb for BulkRead8 {
    type Response = Vec<u8>;
    const FLAGS: CdbFlags = CdbFlags::from_bits_truncate(
        CdbFlags::HAS_DATA_IN_PHASE.bits() | CdbFlags::HAS_STATUS_PHASE.bits(),
    );

    fn encode(&self) -> [u8; 16] {
        bulk_cdb(opcode::DEBUG_READMEM_8BIT, self.addr, self.n, self.ap_num)
    }

    fn rsp_len(&self) -> usize {
        // Some firmwares return a minimum of two bytes even for a one-byte
        // request; see the open question recorded in DESIGN.md.
        (self.n as usize).max(2)
    }

    fn decode(&self, rsp: &[u8]) -> Vec<u8> {
        rsp[..self.n as usize].to_vec()
    }
}

#[derive(Debug)]
pub struct BulkWrite8 {
    pub addr: u32,
    pub data: Vec<u8>,
    pub ap_num: u8,
}

impl Cdb for BulkWrite8 {
    type Response = ();
    const FLAGS: CdbFlags = CdbFlags::from_bits_truncate(
        CdbFlags::HAS_DATA_OUT_PHASE.bits() | CdbFlags::HAS_STATUS_PHASE.bits(),
    );

    fn encode(&self) -> [u8; 16] {
        bulk_cdb(
            opcode::DEBUG_WRITEMEM_8BIT,
            self.addr,
            self.data.len() as u16,
            self.ap_num,
        )
    }

    fn data_out(&self) -> &[u8] {
        &self.data
    }

    fn decode(&self, _rsp: &[u8]) {}
}

#[derive(Debug)]
pub struct BulkRead16 {
    pub addr: u32,
    pub n: u16,
    pub ap_num: u8,
}

impl Cdb for BulkRead16 {
    type Response = Vec<u8>;
    const FLAGS: CdbFlags = CdbFlags::from_bits_truncate(
        CdbFlags::HAS_DATA_IN_PHASE.bits() | CdbFlags::HAS_STATUS_PHASE.bits(),
    );

    fn encode(&self) -> [u8; 16] {
        bulk_cdb(opcode::DEBUG_READMEM_16BIT, self.addr, self.n, self.ap_num)
    }

    fn rsp_len(&self) -> usize {
        self.n as usize * 2
    }

    fn decode(&self, rsp: &[u8]) -> Vec<u8> {
        rsp.to_vec()
    }
}

#[derive(Debug)]
pub struct BulkWrite16 {
    pub addr: u32,
    pub data: Vec<u8>,
    pub ap_num: u8,
}

impl Cdb for BulkWrite16 {
    type Response = ();
    const FLAGS: CdbFlags = CdbFlags::from_bits_truncate(
        CdbFlags::HAS_DATA_OUT_PHASE.bits() | CdbFlags::HAS_STATUS_PHASE.bits(),
    );

    fn encode(&self) -> [u8; 16] {
        bulk_cdb(
            opcode::DEBUG_WRITEMEM_16BIT,
            self.addr,
            (self.data.len() / 2) as u16,
            self.ap_num,
        )
    }

    fn data_out(&self) -> &[u8] {
        &self.data
    }

    fn decode(&self, _rsp: &[u8]) {}
}

#[derive(Debug)]
pub struct BulkRead32 {
    pub addr: u32,
    pub n: u16,
    pub ap_num: u8,
}

impl Cdb for BulkRead32 {
    type Response = Vec<u8>;
    const FLAGS: CdbFlags = CdbFlags::from_bits_truncate(
        CdbFlags::HAS_DATA_IN_PHASE.bits() | CdbFlags::HAS_STATUS_PHASE.bits(),
    );

    fn encode(&self) -> [u8; 16] {
        bulk_cdb(opcode::DEBUG_READMEM_32BIT, self.addr, self.n, self.ap_num)
    }

    fn rsp_len(&self) -> usize {
        self.n as usize * 4
    }

    fn decode(&self, rsp: &[u8]) -> Vec<u8> {
        rsp.to_vec()
    }
}

#[derive(Debug)]
pub struct BulkWrite32 {
    pub addr: u32,
    pub data: Vec<u8>,
    pub ap_num: u8,
}

impl Cdb for BulkWrite32 {
    type Response = ();
    const FLAGS: CdbFlags = CdbFlags::from_bits_truncate(
        CdbFlags::HAS_DATA_OUT_PHASE.bits() | CdbFlags::HAS_STATUS_PHASE.bits(),
    );

    fn encode(&self) -> [u8; 16] {
        bulk_cdb(
            opcode::DEBUG_WRITEMEM_32BIT,
            self.addr,
            (self.data.len() / 4) as u16,
            self.ap_num,
        )
    }

    fn data_out(&self) -> &[u8] {
        &self.data
    }

    fn decode(&self, _rsp: &[u8]) {}
}

#[derive(Debug)]
pub struct Read32 {
    pub addr: u32,
    pub ap_num: u8,
}

impl Cdb for Read32 {
    type Response = u32;
    const FLAGS: CdbFlags = CdbFlags::from_bits_truncate(
        CdbFlags::HAS_DATA_IN_PHASE.bits() | CdbFlags::HAS_EMBEDDED_STATUS.bits(),
    );

    fn encode(&self) -> [u8; 16] {
        bulk_cdb(opcode::DEBUG_READMEM_32BIT, self.addr, 1, self.ap_num)
    }

    fn rsp_len(&self) -> usize {
        8
    }

    fn decode(&self, rsp: &[u8]) -> u32 {
        get_u32_le(rsp, 4)
    }
}

#[derive(Debug)]
pub struct Write32 {
    pub addr: u32,
    pub value: u32,
    pub ap_num: u8,
}

impl Cdb for Write32 {
    type Response = ();
    const FLAGS: CdbFlags = CdbFlags::from_bits_truncate(
        CdbFlags::HAS_DATA_IN_PHASE.bits() | CdbFlags::HAS_EMBEDDED_STATUS.bits(),
    );

    fn encode(&self) -> [u8; 16] {
        // The value fits directly in the 16-byte CDB, so no data-out phase
        // is needed for a single word.
        let mut b = bulk_cdb(opcode::DEBUG_WRITEMEM_32BIT, self.addr, 1, self.ap_num);
        put_u32_le(&mut b, 9, self.value);
        b
    }

    fn rsp_len(&self) -> usize {
        2
    }

    fn decode(&self, _rsp: &[u8]) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_current_mode_encodes_opcode() {
        let cmd = GetCurrentMode;
        let raw = cmd.encode();
        assert_eq!(raw[0], opcode::GET_CURRENT_MODE);
        assert_eq!(cmd.decode(&[MODE_DEBUG, 0]), Mode::Debug);
    }

    #[test]
    fn version2_decodes_fields() {
        let cmd = Version2;
        let rsp = [3, 7, 11, 1, 2, 0, 0, 0, 0, 0, 0, 0];
        let v = cmd.decode(&rsp);
        assert_eq!(v.ver_stlink, 3);
        assert_eq!(v.ver_swim, 7);
        assert_eq!(v.ver_jtag, 11);
        assert_eq!(v.ver_msd, 1);
        assert_eq!(v.ver_bridge, 2);
    }

    #[test]
    fn bulk_read8_response_length_has_floor_of_two() {
        let one = BulkRead8 { addr: 0, n: 1, ap_num: 0 };
        assert_eq!(one.rsp_len(), 2);
        let four = BulkRead8 { addr: 0, n: 4, ap_num: 0 };
        assert_eq!(four.rsp_len(), 4);
    }

    #[test]
    fn bulk_cdb_encodes_addr_count_and_ap() {
        let cmd = BulkRead32 { addr: 0x2000_0100, n: 4, ap_num: 2 };
        let raw = cmd.encode();
        assert_eq!(get_u32_le(&raw, 2), 0x2000_0100);
        assert_eq!(u16::from_le_bytes([raw[6], raw[7]]), 4);
        assert_eq!(raw[8], 2);
    }

    #[test]
    fn read_id_codes_takes_value_from_offset_four() {
        let cmd = ReadIdCodes;
        let mut rsp = [0u8; 12];
        rsp[0] = crate::status::StatusCode::DEBUG_OK;
        put_u32_le(&mut rsp, 4, 0x6BA0_2477);
        assert_eq!(cmd.decode(&rsp), 0x6BA0_2477);
    }
}
