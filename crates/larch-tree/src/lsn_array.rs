//! Compact per-slot LSN storage.
//!
//! Each slot normally takes 4 bytes: a signed file number offset from the
//! array's base file number, then a 3 byte little-endian file offset. The
//! value 0xFFFFFF in the offset field means NULL. When a slot's file number
//! cannot be expressed relative to the base (difference above 127), or its
//! file offset exceeds [`MAX_FILE_OFFSET`], the whole array is rewritten as
//! plain 8 byte LSNs and stays that way.

use larch_cache::{byte_array_size, ARRAY_ITEM_OVERHEAD, LONG_OVERHEAD};
use larch_log::Lsn;

/// Bytes per slot in the compact form.
pub const BYTES_PER_LSN_ENTRY: usize = 4;

/// Largest file offset the compact form can hold.
pub const MAX_FILE_OFFSET: u32 = 0xFF_FFFE;

/// 3 byte encoding of NULL.
const THREE_BYTE_NEGATIVE_ONE: u32 = 0xFF_FFFF;

/// Largest file number difference a slot can hold.
const MAX_FILE_NUMBER_OFFSET: i64 = i8::MAX as i64;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Repr {
    Compact {
        bytes: Vec<u8>,
        /// -1 until the first non-NULL LSN is stored.
        base_file_number: i64,
    },
    Long(Vec<Lsn>),
}

/// Ordered LSNs for the slots of one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LsnArray {
    repr: Repr,
}

impl Default for LsnArray {
    fn default() -> Self {
        Self::new()
    }
}

impl LsnArray {
    /// Creates an empty array in compact form.
    pub fn new() -> Self {
        Self {
            repr: Repr::Compact {
                bytes: Vec::new(),
                base_file_number: -1,
            },
        }
    }

    /// Rebuilds an array from its serialized compact form.
    pub fn from_compact(bytes: Vec<u8>, base_file_number: i64) -> Self {
        Self {
            repr: Repr::Compact {
                bytes,
                base_file_number,
            },
        }
    }

    /// Rebuilds an array from full LSNs.
    pub fn from_long(lsns: Vec<Lsn>) -> Self {
        Self {
            repr: Repr::Long(lsns),
        }
    }

    /// Returns the number of slots.
    pub fn len(&self) -> usize {
        match &self.repr {
            Repr::Compact { bytes, .. } => bytes.len() / BYTES_PER_LSN_ENTRY,
            Repr::Long(v) => v.len(),
        }
    }

    /// Returns true if there are no slots.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true while the compact form is in use.
    pub fn is_compact(&self) -> bool {
        matches!(self.repr, Repr::Compact { .. })
    }

    /// Returns the base file number, or -1 when unset or not compact.
    pub fn base_file_number(&self) -> i64 {
        match &self.repr {
            Repr::Compact {
                base_file_number, ..
            } => *base_file_number,
            Repr::Long(_) => -1,
        }
    }

    /// Returns the raw compact bytes, if compact.
    pub fn compact_bytes(&self) -> Option<&[u8]> {
        match &self.repr {
            Repr::Compact { bytes, .. } => Some(bytes),
            Repr::Long(_) => None,
        }
    }

    /// Returns the LSN of slot `idx`.
    pub fn get(&self, idx: usize) -> Lsn {
        match &self.repr {
            Repr::Compact {
                bytes,
                base_file_number,
            } => {
                let offset = idx * BYTES_PER_LSN_ENTRY;
                let file_offset = get_file_offset(bytes, offset);
                if file_offset == THREE_BYTE_NEGATIVE_ONE {
                    Lsn::NULL
                } else {
                    let file_number = base_file_number + bytes[offset] as i8 as i64;
                    Lsn::new(file_number as u32, file_offset)
                }
            }
            Repr::Long(v) => v[idx],
        }
    }

    /// Opens a NULL slot at `idx`, shifting later slots right.
    pub fn insert_null(&mut self, idx: usize) {
        match &mut self.repr {
            Repr::Compact { bytes, .. } => {
                let offset = idx * BYTES_PER_LSN_ENTRY;
                bytes.splice(offset..offset, [0u8, 0xFF, 0xFF, 0xFF]);
            }
            Repr::Long(v) => v.insert(idx, Lsn::NULL),
        }
    }

    /// Inserts `lsn` at `idx`, shifting later slots right.
    pub fn insert(&mut self, idx: usize, lsn: Lsn) {
        self.insert_null(idx);
        self.set(idx, lsn);
    }

    /// Removes slot `idx`, shifting later slots left.
    pub fn remove(&mut self, idx: usize) -> Lsn {
        let lsn = self.get(idx);
        match &mut self.repr {
            Repr::Compact { bytes, .. } => {
                let offset = idx * BYTES_PER_LSN_ENTRY;
                bytes.drain(offset..offset + BYTES_PER_LSN_ENTRY);
            }
            Repr::Long(v) => {
                v.remove(idx);
            }
        }
        lsn
    }

    /// Drops every slot from `len` onward.
    pub fn truncate(&mut self, len: usize) {
        match &mut self.repr {
            Repr::Compact { bytes, .. } => bytes.truncate(len * BYTES_PER_LSN_ENTRY),
            Repr::Long(v) => v.truncate(len),
        }
    }

    /// Stores `lsn` in slot `idx`, switching to the long form if needed.
    pub fn set(&mut self, idx: usize, lsn: Lsn) {
        let Repr::Compact {
            bytes,
            base_file_number,
        } = &mut self.repr
        else {
            if let Repr::Long(v) = &mut self.repr {
                v[idx] = lsn;
            }
            return;
        };
        let offset = idx * BYTES_PER_LSN_ENTRY;

        if lsn.is_null() {
            bytes[offset] = 0;
            put_file_offset(bytes, offset, THREE_BYTE_NEGATIVE_ONE);
            return;
        }

        let this_file_number = lsn.file_number() as i64;
        if *base_file_number == -1 {
            *base_file_number = this_file_number;
            bytes[offset] = 0;
        } else {
            if this_file_number < *base_file_number {
                if !adjust_file_numbers(bytes, *base_file_number, this_file_number) {
                    self.mutate_to_long(idx, lsn);
                    return;
                }
                *base_file_number = this_file_number;
            }
            let difference = this_file_number - *base_file_number;
            if difference > MAX_FILE_NUMBER_OFFSET {
                self.mutate_to_long(idx, lsn);
                return;
            }
            bytes[offset] = difference as i8 as u8;
        }

        let file_offset = lsn.file_offset();
        if file_offset > MAX_FILE_OFFSET {
            self.mutate_to_long(idx, lsn);
            return;
        }
        put_file_offset(bytes, offset, file_offset);
    }

    fn mutate_to_long(&mut self, idx: usize, lsn: Lsn) {
        let mut lsns: Vec<Lsn> = (0..self.len()).map(|i| self.get(i)).collect();
        lsns[idx] = lsn;
        self.repr = Repr::Long(lsns);
    }

    /// Returns the accounted memory for an array sized for `capacity` slots.
    pub fn memory_overhead(&self, capacity: usize) -> i64 {
        match &self.repr {
            Repr::Compact { .. } => byte_array_size(capacity * BYTES_PER_LSN_ENTRY),
            Repr::Long(_) => ARRAY_ITEM_OVERHEAD * capacity as i64 + LONG_OVERHEAD,
        }
    }
}

/// Rebases every non-NULL slot onto `new_base`. Restores the old offsets
/// and returns false if any slot would overflow.
fn adjust_file_numbers(bytes: &mut [u8], old_base: i64, new_base: i64) -> bool {
    let n = bytes.len() / BYTES_PER_LSN_ENTRY;
    for i in 0..n {
        let offset = i * BYTES_PER_LSN_ENTRY;
        if get_file_offset(bytes, offset) == THREE_BYTE_NEGATIVE_ONE {
            continue;
        }
        let cur_file_number = old_base + bytes[offset] as i8 as i64;
        let new_offset = cur_file_number - new_base;
        if new_offset > MAX_FILE_NUMBER_OFFSET {
            let undo = old_base - new_base;
            for j in (0..i).rev() {
                let off = j * BYTES_PER_LSN_ENTRY;
                if get_file_offset(bytes, off) == THREE_BYTE_NEGATIVE_ONE {
                    continue;
                }
                bytes[off] = ((bytes[off] as i8 as i64) - undo) as i8 as u8;
            }
            return false;
        }
        bytes[offset] = new_offset as i8 as u8;
    }
    true
}

fn put_file_offset(bytes: &mut [u8], offset: usize, value: u32) {
    bytes[offset + 1] = value as u8;
    bytes[offset + 2] = (value >> 8) as u8;
    bytes[offset + 3] = (value >> 16) as u8;
}

fn get_file_offset(bytes: &[u8], offset: usize) -> u32 {
    (bytes[offset + 1] as u32) | ((bytes[offset + 2] as u32) << 8) | ((bytes[offset + 3] as u32) << 16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn filled(lsns: &[Lsn]) -> LsnArray {
        let mut array = LsnArray::new();
        for (i, lsn) in lsns.iter().enumerate() {
            array.insert(i, *lsn);
        }
        array
    }

    fn contents(array: &LsnArray) -> Vec<Lsn> {
        (0..array.len()).map(|i| array.get(i)).collect()
    }

    #[test]
    fn test_null_slots() {
        let mut array = LsnArray::new();
        array.insert_null(0);
        array.insert_null(1);
        assert_eq!(array.get(0), Lsn::NULL);
        assert_eq!(array.base_file_number(), -1);
        array.set(1, Lsn::new(4, 100));
        assert_eq!(array.base_file_number(), 4);
        array.set(1, Lsn::NULL);
        assert_eq!(array.get(1), Lsn::NULL);
        assert!(array.is_compact());
    }

    #[test]
    fn test_file_number_deltas_stay_compact() {
        let lsns = [
            Lsn::new(10, 16),
            Lsn::new(10, 2000),
            Lsn::new(11, 16),
            Lsn::new(137, MAX_FILE_OFFSET),
        ];
        let array = filled(&lsns);
        assert!(array.is_compact());
        assert_eq!(contents(&array), lsns);
    }

    #[test]
    fn test_delta_128_forces_long_form() {
        let mut array = filled(&[Lsn::new(10, 16), Lsn::new(137, 16)]);
        assert!(array.is_compact());
        array.insert(2, Lsn::new(138, 16));
        assert!(!array.is_compact());
        assert_eq!(
            contents(&array),
            vec![Lsn::new(10, 16), Lsn::new(137, 16), Lsn::new(138, 16)]
        );
    }

    #[test]
    fn test_large_offset_forces_long_form() {
        let mut array = filled(&[Lsn::new(1, 16)]);
        array.insert(1, Lsn::new(1, MAX_FILE_OFFSET + 1));
        assert!(!array.is_compact());
        assert_eq!(array.get(1), Lsn::new(1, MAX_FILE_OFFSET + 1));
        assert_eq!(array.get(0), Lsn::new(1, 16));
    }

    #[test]
    fn test_rebase_to_lower_file() {
        let mut array = filled(&[Lsn::new(50, 16), Lsn::new(60, 32)]);
        array.insert(0, Lsn::new(40, 8));
        assert!(array.is_compact());
        assert_eq!(array.base_file_number(), 40);
        assert_eq!(
            contents(&array),
            vec![Lsn::new(40, 8), Lsn::new(50, 16), Lsn::new(60, 32)]
        );
    }

    #[test]
    fn test_failed_rebase_restores_then_mutates() {
        let mut array = filled(&[Lsn::new(100, 16), Lsn::new(200, 16)]);
        assert!(array.is_compact());
        array.insert(2, Lsn::new(72, 48));
        assert!(!array.is_compact());
        assert_eq!(
            contents(&array),
            vec![Lsn::new(100, 16), Lsn::new(200, 16), Lsn::new(72, 48)]
        );
    }

    #[test]
    fn test_remove_and_truncate() {
        let mut array = filled(&[Lsn::new(1, 1), Lsn::new(2, 2), Lsn::new(3, 3)]);
        assert_eq!(array.remove(1), Lsn::new(2, 2));
        assert_eq!(contents(&array), vec![Lsn::new(1, 1), Lsn::new(3, 3)]);
        array.truncate(1);
        assert_eq!(array.len(), 1);
    }

    #[test]
    fn test_memory_overhead_grows_with_long_form() {
        let mut array = filled(&[Lsn::new(1, 1)]);
        let compact = array.memory_overhead(128);
        array.set(0, Lsn::new(1, MAX_FILE_OFFSET + 5));
        assert!(array.memory_overhead(128) > compact);
    }

    proptest! {
        #[test]
        fn prop_set_then_get_matches(
            entries in proptest::collection::vec((0u32..300, 0u32..0x100_0000), 1..40)
        ) {
            let lsns: Vec<Lsn> = entries.iter().map(|(f, o)| Lsn::new(*f, *o)).collect();
            let array = filled(&lsns);
            prop_assert_eq!(contents(&array), lsns);
        }
    }
}
