use crate::status::StatusCode;

/// The single error type returned by every fallible operation in this crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A USB bulk transfer failed, timed out, or returned a short count.
    #[error("USB transport error: {0}")]
    UsbIo(#[from] rusb::Error),

    /// A CDB completed with a non-OK status byte.
    #[error("command completed with status {0:?}")]
    CmdStatus(StatusCode),

    /// `exec_with_retry` exhausted its retry budget while the probe kept
    /// returning `SWD_AP_WAIT`/`SWD_DP_WAIT`.
    #[error("max retries exceeded")]
    MaxRetries,

    /// After a connect sequence, the probe did not end up in DEBUG mode.
    #[error("probe did not reach DEBUG mode after connect")]
    ModeViolation,

    /// An address did not satisfy the alignment a given access width requires.
    #[error("address 0x{addr:08x} is not aligned to a {required}-byte boundary")]
    Alignment { addr: u32, required: u32 },

    /// A memory or flash operation fell outside the addressable/flash range.
    #[error("range [0x{addr:08x}, 0x{addr:08x}+{len}) is out of bounds")]
    Range { addr: u32, len: usize },

    /// The flash status register reported a nonzero error mask after an erase
    /// or program operation.
    #[error("flash operation failed, SR=0x{sr:08x}")]
    FlashError { sr: u32 },

    /// Read-back of a freshly written block did not match what was written.
    #[error("verification mismatch at 0x{addr:08x}")]
    VerifyMismatch { addr: u32 },

    /// Two ALPs being merged into one data vector overlap.
    #[error("ALP at 0x{addr:08x} (len {len}) overlaps an existing entry")]
    DvOverlap { addr: u32, len: usize },

    /// The requested SWD clock frequency was below the probe's minimum.
    #[error("requested frequency {requested_hz} Hz is below the probe's supported minimum")]
    FrequencyTooLow { requested_hz: u32 },

    /// A response had an unexpected shape, or a precondition not covered by
    /// `Alignment`/`Range` was violated.
    #[error("protocol error: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, Error>;
