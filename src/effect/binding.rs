//! Slot tables shared by every pass of an effect, and slot-mask coalescing.
//!
//! A pass stage records which slots its shader reads as a [`SlotMask`] (bit `n` set means
//! slot `n` is used). [`bind_ranges`] turns a mask into maximal runs of consecutive slots
//! so each run is bound with a single backend call.

use super::constant_buffer::CBufferData;
use crate::device::{ResourceView, SamplerId};
use crate::effect::reflection::BindingKind;
use std::collections::BTreeMap;
use std::ops::Range;

/// One bit per slot.
pub type SlotMask = u128;

/// Read-only resource bound at a `t#` slot.
#[derive(Clone, Debug)]
pub struct ShaderResourceSlot {
    pub name: String,
    pub kind: BindingKind,
    pub view: Option<ResourceView>,
}

/// Sampler bound at an `s#` slot.
#[derive(Clone, Debug)]
pub struct SamplerSlot {
    pub name: String,
    pub comparison: bool,
    pub sampler: Option<SamplerId>,
}

/// Read/write resource bound at a `u#` slot.
#[derive(Clone, Debug)]
pub struct UnorderedAccessSlot {
    pub name: String,
    pub kind: BindingKind,
    pub view: Option<ResourceView>,
    /// Counter value for the next apply only; `u32::MAX` keeps the current counter.
    pub initial_count: u32,
}

/// Slot tables of one effect.
#[derive(Debug, Default)]
pub struct EffectTables {
    pub constant_buffers: BTreeMap<u32, CBufferData>,
    pub shader_resources: BTreeMap<u32, ShaderResourceSlot>,
    pub samplers: BTreeMap<u32, SamplerSlot>,
    pub unordered_access: BTreeMap<u32, UnorderedAccessSlot>,
}

/// Sets bit `slot` of `mask`.
pub fn mask_with(mask: SlotMask, slot: u32) -> SlotMask {
    mask | (1u128 << slot)
}

/// Maximal runs of set bits in `mask`, lowest slot first.
///
/// ```
/// use umbra::effect::bind_ranges;
///
/// let runs: Vec<_> = bind_ranges(0b1110_0101).collect();
/// assert_eq!(runs, [0..1, 2..3, 5..8]);
/// ```
pub fn bind_ranges(mask: SlotMask) -> BindRanges {
    BindRanges { mask, offset: 0 }
}

/// Iterator returned by [`bind_ranges`].
#[derive(Clone, Debug)]
pub struct BindRanges {
    mask: SlotMask,
    offset: u32,
}

impl Iterator for BindRanges {
    type Item = Range<u32>;

    fn next(&mut self) -> Option<Range<u32>> {
        if self.mask == 0 {
            return None;
        }
        let zeros = self.mask.trailing_zeros();
        let run = self.mask >> zeros;
        let ones = run.trailing_ones();
        let start = self.offset + zeros;
        let end = start + ones;
        // A run can reach bit 127, where a plain shift would overflow.
        self.mask = run.checked_shr(ones).unwrap_or(0);
        self.offset = end;
        Some(start..end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_match_naive_loop_for_every_16_bit_mask() {
        for mask in 0..=u16::MAX as u128 {
            let naive: Vec<u32> = (0..16u32).filter(|&bit| mask & (1u128 << bit) != 0).collect();
            let ranges: Vec<Range<u32>> = bind_ranges(mask).collect();
            let coalesced: Vec<u32> = ranges.iter().cloned().flatten().collect();
            assert_eq!(coalesced, naive, "mask {:#06x}", mask);
            assert!(ranges.len() <= naive.len());
            for pair in ranges.windows(2) {
                // Maximal: two runs never touch.
                assert!(pair[0].end < pair[1].start);
            }
        }
    }

    #[test]
    fn full_mask_is_one_run() {
        assert_eq!(bind_ranges(u128::MAX).collect::<Vec<_>>(), [0..128]);
        assert_eq!(bind_ranges(1 << 127).collect::<Vec<_>>(), [127..128]);
        assert_eq!(bind_ranges(0).count(), 0);
    }

    #[test]
    fn mask_with_sets_bits() {
        let mask = mask_with(mask_with(0, 3), 100);
        assert_eq!(bind_ranges(mask).collect::<Vec<_>>(), [3..4, 100..101]);
    }
}
