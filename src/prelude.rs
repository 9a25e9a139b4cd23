//! Common imports for call sites that just want to connect a probe and
//! program flash without naming every module individually.

pub use crate::dv::Alp;
pub use crate::error::{Error, Result};
pub use crate::flash::FlashDevice;
pub use crate::probe::{MemoryAccess, Probe};
