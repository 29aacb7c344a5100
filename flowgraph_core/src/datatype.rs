//! Wire-level data types carried by ring buffers and sample multiplexers.
//!
//! The engine has no compile-time knowledge of a block's sample type: a
//! block declares its ports' [`DataType`]s explicitly, and the graph
//! checks type compatibility between connected ports at validation time
//! rather than via the Rust type system. This is the "runtime variant"
//! rendering of a compile-time-typed process function.

use std::sync::Arc;

/// A reference-counted opaque record type flowing through the graph.
///
/// Two ports are only type-compatible if they carry the *same*
/// `RefCountedKind` instance: descriptors compare equal by address, not
/// by structural content, since two distinct block authors may define
/// unrelated record layouts of the same byte size. The element slot in
/// the ring buffer holds an opaque handle (sized `element_size`) that
/// `add_refs`/`unref` know how to interpret — the sample multiplexer
/// calls through them without knowing the concrete record type.
#[derive(Clone, Debug)]
pub struct RefCountedKind {
    /// Byte width of one handle slot, used by the ring buffer for
    /// element sizing.
    pub element_size: usize,
    /// Human-readable name, surfaced in debug dumps and error messages.
    pub name: Arc<str>,
    /// Adds `n` references to the handle stored at `slot`, implementing
    /// the "multiply rc by downstream reader count" rule on produce.
    pub add_refs: fn(slot: *const u8, n: usize),
    /// Releases one reference to the handle stored at `slot`, running
    /// the record's destructor if this was the last one.
    pub unref: fn(slot: *const u8),
}

impl PartialEq for RefCountedKind {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.name, &other.name)
    }
}

impl Eq for RefCountedKind {}

/// The data type carried by a single port.
///
/// Not `Copy`: a `RefCounted` variant carries an `Arc<str>` descriptor
/// name, so cloning a `DataType` is cheap but not free.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DataType {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    Complex32,
    Complex64,
    /// Opaque, reference-counted record type; see [`crate::refcount`].
    RefCounted(RefCountedKind),
}

impl DataType {
    /// Byte width of one element of this type, as used by the ring
    /// buffer and sample multiplexer to convert between byte counts and
    /// sample counts.
    pub fn element_size(&self) -> usize {
        match self {
            DataType::Int8 | DataType::UInt8 => 1,
            DataType::Int16 | DataType::UInt16 => 2,
            DataType::Int32 | DataType::UInt32 | DataType::Float32 => 4,
            DataType::Int64 | DataType::UInt64 | DataType::Float64 | DataType::Complex32 => 8,
            DataType::Complex64 => 16,
            DataType::RefCounted(kind) => kind.element_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_sizes_match_wire_widths() {
        assert_eq!(DataType::Int8.element_size(), 1);
        assert_eq!(DataType::UInt16.element_size(), 2);
        assert_eq!(DataType::Float32.element_size(), 4);
        assert_eq!(DataType::Int64.element_size(), 8);
        assert_eq!(DataType::Complex32.element_size(), 8);
        assert_eq!(DataType::Complex64.element_size(), 16);
    }

    fn noop_add_refs(_slot: *const u8, _n: usize) {}
    fn noop_unref(_slot: *const u8) {}

    #[test]
    fn ref_counted_kinds_compare_by_identity() {
        let a =
            RefCountedKind { element_size: 32, name: Arc::from("record_a"), add_refs: noop_add_refs, unref: noop_unref };
        let b =
            RefCountedKind { element_size: 32, name: Arc::from("record_a"), add_refs: noop_add_refs, unref: noop_unref };
        let a2 = a.clone();
        assert_ne!(DataType::RefCounted(a.clone()), DataType::RefCounted(b));
        assert_eq!(DataType::RefCounted(a), DataType::RefCounted(a2));
    }
}
