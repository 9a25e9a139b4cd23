//! Lifts loadable ELF segments into a flashable data vector.

use crate::dv::{Alp, DataVector};

/// The subset of an ELF program header this crate needs: a `PT_LOAD`
/// segment's physical load address, its file-backed bytes, and the total
/// in-memory size (which may exceed the file size — the difference is
/// zero-filled, e.g. for a `.bss` tail folded into the same segment).
#[derive(Debug, Clone)]
pub struct Segment {
    pub paddr: u32,
    pub data: Vec<u8>,
    pub mem_size: usize,
}

/// Turns `PT_LOAD` segments into ALPs, zero-padding each one out to its
/// `mem_size`. Segments outside the target flash's range are not filtered
/// here; [`crate::flash::FlashDevice::burn_dv`]'s block buffer silently drops
/// whatever doesn't fit.
pub fn segments_to_dv(segments: &[Segment]) -> DataVector {
    segments
        .iter()
        .map(|s| {
            let mut data = s.data.clone();
            data.resize(s.mem_size.max(data.len()), 0);
            Alp::new(s.paddr, data)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pads_bss_tail_with_zeros() {
        let segments = vec![Segment { paddr: 0x0800_0000, data: vec![1, 2, 3], mem_size: 5 }];
        let dv = segments_to_dv(&segments);
        assert_eq!(dv.len(), 1);
        assert_eq!(dv[0].addr, 0x0800_0000);
        assert_eq!(dv[0].data, vec![1, 2, 3, 0, 0]);
    }

    #[test]
    fn leaves_fully_file_backed_segment_untouched() {
        let segments = vec![Segment { paddr: 0x0800_1000, data: vec![9; 4], mem_size: 4 }];
        let dv = segments_to_dv(&segments);
        assert_eq!(dv[0].data, vec![9; 4]);
    }
}
