//! Parameter and gradient slots laid out inside shared regions

use crate::{MemoryBarriers, Result, SharedMemoryError, SharedRegion};
use bytemuck::Pod;
use std::sync::Arc;

/// Most buffers a slot set may rotate through
pub const MAX_SLOTS: usize = 3;

/// Byte offset of the parameters inside each `<base>_BUF_<i>` region; the
/// peer keeps a u32 sequence number in front of them
pub const SLOT_HEADER_SIZE: usize = 4;

/// A view of `element_count` fixed-width numbers inside a region.
///
/// Binding validates the range once; reads and writes copy through the
/// region so the view stays valid while the peer writes the same memory.
#[derive(Clone)]
pub struct ParameterSlot {
    region: Arc<SharedRegion>,
    offset: usize,
    element_count: usize,
    element_width: usize,
}

impl std::fmt::Debug for ParameterSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParameterSlot")
            .field("region", &self.region.name())
            .field("offset", &self.offset)
            .field("element_count", &self.element_count)
            .field("element_width", &self.element_width)
            .finish()
    }
}

impl ParameterSlot {
    /// Bind `[byte_offset, byte_offset + element_count * element_width)`.
    /// Fails with `OutOfRange` if it does not fit; the region is untouched.
    pub fn bind(
        region: &Arc<SharedRegion>,
        byte_offset: usize,
        element_count: usize,
        element_width: usize,
    ) -> Result<Self> {
        if element_width == 0 {
            return Err(SharedMemoryError::InvalidLayout("element width must be non-zero".into()));
        }
        let byte_len = element_count
            .checked_mul(element_width)
            .ok_or(SharedMemoryError::OutOfRange {
                offset: byte_offset,
                len: usize::MAX,
                size: region.size(),
            })?;
        region.check_range(byte_offset, byte_len)?;

        Ok(Self {
            region: Arc::clone(region),
            offset: byte_offset,
            element_count,
            element_width,
        })
    }

    /// Bind a slot of `element_count` values of `T`
    pub fn bind_typed<T: Pod>(region: &Arc<SharedRegion>, byte_offset: usize, element_count: usize) -> Result<Self> {
        Self::bind(region, byte_offset, element_count, std::mem::size_of::<T>())
    }

    /// Byte offset inside the region
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Number of elements
    pub fn element_count(&self) -> usize {
        self.element_count
    }

    /// Width of one element in bytes
    pub fn element_width(&self) -> usize {
        self.element_width
    }

    /// Slot length in bytes
    pub fn byte_len(&self) -> usize {
        self.element_count * self.element_width
    }

    /// Region backing this view
    pub fn region(&self) -> &Arc<SharedRegion> {
        &self.region
    }

    /// Copy `values` into the slot, byte for byte
    pub fn write<T: Pod>(&self, values: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(values);
        self.check_len(bytes.len())?;
        self.region.write_bytes(self.offset, bytes)?;
        MemoryBarriers::release_barrier();
        Ok(())
    }

    /// Copy the slot into `out`
    pub fn read_into<T: Pod>(&self, out: &mut [T]) -> Result<()> {
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(out);
        self.check_len(bytes.len())?;
        MemoryBarriers::acquire_barrier();
        self.region.read_bytes(self.offset, bytes)
    }

    /// Copy the slot into a fresh vector
    pub fn to_vec<T: Pod>(&self) -> Result<Vec<T>> {
        let width = std::mem::size_of::<T>();
        if width == 0 || self.byte_len() % width != 0 {
            return Err(SharedMemoryError::LengthMismatch {
                expected: self.byte_len(),
                actual: width,
            });
        }
        let mut out = vec![T::zeroed(); self.byte_len() / width];
        self.read_into(&mut out)?;
        Ok(out)
    }

    fn check_len(&self, actual: usize) -> Result<()> {
        if actual != self.byte_len() {
            return Err(SharedMemoryError::LengthMismatch {
                expected: self.byte_len(),
                actual,
            });
        }
        Ok(())
    }
}

/// The buffers the peer rotates parameters through.
///
/// Normally two or three slots; a single slot is accepted for unbuffered
/// layouts. Which one is current is decided by an `ActiveSlotIndex`.
#[derive(Debug, Clone)]
pub struct SlotSet {
    slots: Vec<ParameterSlot>,
}

impl SlotSet {
    /// Wrap already bound slots; they must agree on element layout
    pub fn new(slots: Vec<ParameterSlot>) -> Result<Self> {
        if slots.is_empty() || slots.len() > MAX_SLOTS {
            return Err(SharedMemoryError::InvalidLayout(format!(
                "slot set needs 1..={} slots, got {}",
                MAX_SLOTS,
                slots.len()
            )));
        }
        let first = &slots[0];
        if slots
            .iter()
            .any(|s| s.element_count != first.element_count || s.element_width != first.element_width)
        {
            return Err(SharedMemoryError::InvalidLayout("slots differ in element layout".into()));
        }
        Ok(Self { slots })
    }

    /// `count` equally spaced slots in one region, starting at `base`
    pub fn strided(
        region: &Arc<SharedRegion>,
        base: usize,
        stride: usize,
        count: usize,
        element_count: usize,
        element_width: usize,
    ) -> Result<Self> {
        let slots = (0..count)
            .map(|i| {
                let offset = i
                    .checked_mul(stride)
                    .and_then(|o| o.checked_add(base))
                    .ok_or(SharedMemoryError::OutOfRange { offset: base, len: stride, size: region.size() })?;
                ParameterSlot::bind(region, offset, element_count, element_width)
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(slots)
    }

    /// One slot per region, each at the same offset (the `<base>_BUF_<i>` layout)
    pub fn across_regions(
        regions: &[Arc<SharedRegion>],
        offset: usize,
        element_count: usize,
        element_width: usize,
    ) -> Result<Self> {
        let slots = regions
            .iter()
            .map(|region| ParameterSlot::bind(region, offset, element_count, element_width))
            .collect::<Result<Vec<_>>>()?;
        Self::new(slots)
    }

    /// Number of slots
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Never true; present for API symmetry
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slot `index`, or `OutOfRange`
    pub fn slot(&self, index: usize) -> Result<&ParameterSlot> {
        self.slots.get(index).ok_or(SharedMemoryError::OutOfRange {
            offset: index,
            len: 1,
            size: self.slots.len(),
        })
    }

    /// The slot selected by the peer's index; `CorruptedIndex` if out of range
    pub fn active(&self, index: &ActiveSlotIndex) -> Result<(usize, &ParameterSlot)> {
        let i = index.resolve(self.slots.len())?;
        Ok((i, &self.slots[i]))
    }

    /// Iterate the slots in order
    pub fn iter(&self) -> impl Iterator<Item = &ParameterSlot> {
        self.slots.iter()
    }
}

/// Peer-owned i32 selecting the current slot. Read-only on the training side.
#[derive(Clone)]
pub struct ActiveSlotIndex {
    region: Arc<SharedRegion>,
    offset: usize,
}

impl std::fmt::Debug for ActiveSlotIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveSlotIndex")
            .field("region", &self.region.name())
            .field("offset", &self.offset)
            .finish()
    }
}

impl ActiveSlotIndex {
    /// Bind the index at `offset`
    pub fn bind(region: &Arc<SharedRegion>, offset: usize) -> Result<Self> {
        region.check_range(offset, std::mem::size_of::<i32>())?;
        Ok(Self {
            region: Arc::clone(region),
            offset,
        })
    }

    /// Byte offset inside the region
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Raw value as last written by the peer
    pub fn load(&self) -> Result<i32> {
        let value = self.region.read_i32(self.offset)?;
        MemoryBarriers::acquire_barrier();
        Ok(value)
    }

    /// Peer-side write; used by peer stubs and loopback runs
    pub fn store(&self, index: i32) -> Result<()> {
        MemoryBarriers::release_barrier();
        self.region.write_i32(self.offset, index)
    }

    /// Load and validate against `slots`
    pub fn resolve(&self, slots: usize) -> Result<usize> {
        let raw = self.load()?;
        if raw < 0 || raw as usize >= slots {
            return Err(SharedMemoryError::CorruptedIndex {
                index: raw as i64,
                slots,
            });
        }
        Ok(raw as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(size: usize) -> Arc<SharedRegion> {
        Arc::new(SharedRegion::anonymous(size).unwrap())
    }

    #[test]
    fn test_bind_in_bounds_has_expected_length() {
        let region = region(64);
        for (offset, count, width) in [(0, 16, 4), (8, 7, 8), (60, 1, 4), (64, 0, 4), (0, 64, 1)] {
            let slot = ParameterSlot::bind(&region, offset, count, width).unwrap();
            assert_eq!(slot.byte_len(), count * width);
        }
    }

    #[test]
    fn test_bind_out_of_bounds_leaves_region_untouched() {
        let region = region(64);
        region.write_bytes(0, &[0xAB; 64]).unwrap();

        for (offset, count, width) in [(61, 1, 4), (0, 17, 4), (65, 0, 4), (usize::MAX, 1, 4), (0, usize::MAX, 2)] {
            let err = ParameterSlot::bind(&region, offset, count, width).unwrap_err();
            assert!(matches!(err, SharedMemoryError::OutOfRange { .. }), "{:?}", err);
        }

        let mut after = [0u8; 64];
        region.read_bytes(0, &mut after).unwrap();
        assert!(after.iter().all(|b| *b == 0xAB));
    }

    #[test]
    fn test_write_then_read_returns_values() {
        let region = region(40);
        let slot = ParameterSlot::bind_typed::<f32>(&region, 0, 10).unwrap();
        let values: Vec<f32> = (1..=10).map(|v| v as f32).collect();

        slot.write(&values).unwrap();
        assert_eq!(slot.to_vec::<f32>().unwrap(), values);
    }

    #[test]
    fn test_unaligned_f64_slot() {
        let region = region(4 + 3 * 8);
        let slot = ParameterSlot::bind_typed::<f64>(&region, SLOT_HEADER_SIZE, 3).unwrap();
        slot.write(&[0.5f64, -1.25, 1e300]).unwrap();
        assert_eq!(slot.to_vec::<f64>().unwrap(), vec![0.5, -1.25, 1e300]);
    }

    #[test]
    fn test_length_mismatch_writes_nothing() {
        let region = region(16);
        let slot = ParameterSlot::bind_typed::<f32>(&region, 0, 4).unwrap();
        let err = slot.write(&[1.0f32; 3]).unwrap_err();
        assert!(matches!(err, SharedMemoryError::LengthMismatch { expected: 16, actual: 12 }));
        assert_eq!(slot.to_vec::<f32>().unwrap(), vec![0.0; 4]);
    }

    #[test]
    fn test_strided_slots_and_index_past_end() {
        let region = region(48);
        let set = SlotSet::strided(&region, 0, 16, 3, 4, 4).unwrap();
        let offsets: Vec<usize> = set.iter().map(|s| s.offset()).collect();
        assert_eq!(offsets, vec![0, 16, 32]);

        assert!(matches!(set.slot(3), Err(SharedMemoryError::OutOfRange { .. })));
        assert!(matches!(
            ParameterSlot::bind(&region, 3 * 16, 4, 4),
            Err(SharedMemoryError::OutOfRange { offset: 48, len: 16, size: 48 })
        ));
        assert!(SlotSet::strided(&region, 0, 16, 4, 4, 4).is_err());
    }

    #[test]
    fn test_slot_count_limits() {
        let region = region(64);
        assert!(matches!(SlotSet::new(Vec::new()), Err(SharedMemoryError::InvalidLayout(_))));
        assert!(SlotSet::strided(&region, 0, 8, 4, 2, 4).is_err());
        assert!(SlotSet::strided(&region, 0, 8, 2, 2, 4).is_ok());
    }

    #[test]
    fn test_across_regions() {
        let regions: Vec<_> = (0..3).map(|_| region(4 + 8)).collect();
        let set = SlotSet::across_regions(&regions, SLOT_HEADER_SIZE, 2, 4).unwrap();
        assert_eq!(set.len(), 3);
        set.slot(2).unwrap().write(&[7u32, 9]).unwrap();

        let mut raw = [0u8; 8];
        regions[2].read_bytes(SLOT_HEADER_SIZE, &mut raw).unwrap();
        assert_eq!(u32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]), 7);
        assert_eq!(u32::from_ne_bytes([raw[4], raw[5], raw[6], raw[7]]), 9);
    }

    #[test]
    fn test_active_index_validation() {
        let control = region(8);
        let index = ActiveSlotIndex::bind(&control, 4).unwrap();
        let set = SlotSet::strided(&region(48), 0, 16, 3, 4, 4).unwrap();

        for raw in [0, 1, 2] {
            index.store(raw).unwrap();
            assert_eq!(set.active(&index).unwrap().0, raw as usize);
        }
        for raw in [3, -1, i32::MAX] {
            index.store(raw).unwrap();
            assert!(matches!(
                set.active(&index),
                Err(SharedMemoryError::CorruptedIndex { slots: 3, .. })
            ));
        }

        assert!(ActiveSlotIndex::bind(&control, 5).is_err());
    }
}
