//! Data-word signatures.
//!
//! Each module describes the words it emits as `(id_mask, fixed_mask,
//! fixed_value)` triples: `fixed_mask` selects bits that are constant for that
//! word type, `fixed_value` holds them, and `id_mask` marks the bits carrying
//! the module id. When two modules in one tag emit words whose fixed bits can
//! coincide, a decoder cannot tell them apart without a barrier word between
//! them.

/// One word pattern a module may emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleSignature {
    /// Bits holding the module id.
    pub id_mask: u32,
    /// Bits with a fixed value for this word type.
    pub fixed_mask: u32,
    /// Values of the fixed bits.
    pub fixed_value: u32,
}

impl ModuleSignature {
    /// Shorthand constructor.
    pub const fn new(id_mask: u32, fixed_mask: u32, fixed_value: u32) -> Self {
        Self {
            id_mask,
            fixed_mask,
            fixed_value,
        }
    }
}

/// True if any word pattern of `left` can be confused with one of `right`.
///
/// Patterns with equal `id_mask` are told apart by the id itself and never
/// collide.
pub fn signatures_overlap(left: &[ModuleSignature], right: &[ModuleSignature]) -> bool {
    left.iter().any(|l| {
        right.iter().any(|r| {
            if l.id_mask == r.id_mask {
                return false;
            }
            let mask = l.fixed_mask & r.fixed_mask;
            (mask & l.fixed_value) == (mask & r.fixed_value)
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_id_mask_never_overlaps() {
        let a = [ModuleSignature::new(0xf800_0000, 0x0700_0000, 0x0200_0000)];
        assert!(!signatures_overlap(&a, &a));
    }

    #[test]
    fn test_disjoint_fixed_values() {
        let a = [ModuleSignature::new(0x0000_00ff, 0xff00_0000, 0xa000_0000)];
        let b = [ModuleSignature::new(0x0000_ff00, 0xff00_0000, 0xb000_0000)];
        assert!(!signatures_overlap(&a, &b));
        assert!(!signatures_overlap(&b, &a));
    }

    #[test]
    fn test_intersecting_fixed_values() {
        let a = [ModuleSignature::new(0x0000_00ff, 0xff00_0000, 0xa000_0000)];
        // Only the top nibble is fixed, and it agrees.
        let b = [ModuleSignature::new(0x0000_ff00, 0xf000_0000, 0xa000_0000)];
        assert!(signatures_overlap(&a, &b));
    }

    #[test]
    fn test_empty_tables_never_overlap() {
        let a = [ModuleSignature::new(0, 0, 0)];
        assert!(!signatures_overlap(&a, &[]));
        assert!(!signatures_overlap(&[], &a));
    }
}
