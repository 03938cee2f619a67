//! Revlog-style `(start, end, data)` diff parts, shared by the file and
//! manifest reconstructors.
//!
//! A diff part means "replace base bytes `[start, end)` with `data`". A
//! chunk carries a sequence of these; starts must be non-decreasing,
//! `start <= end` within a part, and `start >= previous end` across parts.

use crate::error::{EngineError, Result};

/// One `(start, end, data)` revlog diff instruction.
#[derive(Debug, Clone)]
pub struct DiffPart {
    pub start: usize,
    pub end: usize,
    pub data: Vec<u8>,
}

/// Validate the monotonicity invariants across a full sequence of diff parts.
///
/// Must be called, and must succeed, before any part is applied: a
/// malformed-input error has to be raised before any state mutation commits.
pub fn validate_parts(parts: &[DiffPart]) -> Result<()> {
    let mut previous_end = 0usize;
    for part in parts {
        if part.start > part.end {
            return Err(EngineError::DiffPartOutOfOrder {
                start: part.start,
                previous_end: part.end,
            });
        }
        if part.start < previous_end {
            return Err(EngineError::DiffPartOutOfOrder {
                start: part.start,
                previous_end,
            });
        }
        previous_end = part.end;
    }
    Ok(())
}

/// Apply a validated sequence of diff parts against `base`, producing the
/// next full text by linear-time splicing: copy `[last_end, start)` from the
/// base, then `data`, advancing `last_end = end` each time; finally copy the
/// base's remaining tail.
pub fn apply_parts(base: &[u8], parts: &[DiffPart]) -> Result<Vec<u8>> {
    validate_parts(parts)?;

    let mut out = Vec::with_capacity(base.len());
    let mut last_end = 0usize;
    for part in parts {
        if part.end > base.len() || part.start > base.len() {
            return Err(EngineError::MalformedChunk {
                node: String::new(),
                reason: format!(
                    "diff part [{}, {}) out of bounds for base of length {}",
                    part.start,
                    part.end,
                    base.len()
                ),
            });
        }
        out.extend_from_slice(&base[last_end..part.start]);
        out.extend_from_slice(&part.data);
        last_end = part.end;
    }
    out.extend_from_slice(&base[last_end..]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn part(start: usize, end: usize, data: &[u8]) -> DiffPart {
        DiffPart {
            start,
            end,
            data: data.to_vec(),
        }
    }

    #[test]
    fn single_replacement() {
        let base = b"hello world";
        let parts = vec![part(6, 11, b"there")];
        let out = apply_parts(base, &parts).unwrap();
        assert_eq!(out, b"hello there");
    }

    #[test]
    fn pure_insertion_zero_width() {
        let base = b"abc";
        let parts = vec![part(1, 1, b"XYZ")];
        let out = apply_parts(base, &parts).unwrap();
        assert_eq!(out, b"aXYZbc");
    }

    #[test]
    fn pure_deletion_empty_data() {
        let base = b"abcdef";
        let parts = vec![part(2, 4, b"")];
        let out = apply_parts(base, &parts).unwrap();
        assert_eq!(out, b"abef");
    }

    #[test]
    fn multiple_non_overlapping_parts() {
        let base = b"0123456789";
        let parts = vec![part(1, 2, b"A"), part(5, 6, b"B")];
        let out = apply_parts(base, &parts).unwrap();
        assert_eq!(out, b"0A234B6789");
    }

    #[test]
    fn out_of_order_start_rejected() {
        let parts = vec![part(5, 6, b"a"), part(2, 3, b"b")];
        assert!(validate_parts(&parts).is_err());
    }

    #[test]
    fn start_greater_than_end_rejected() {
        let parts = vec![part(5, 2, b"a")];
        assert!(validate_parts(&parts).is_err());
    }

    #[test]
    fn empty_parts_is_identity() {
        let base = b"unchanged";
        let out = apply_parts(base, &[]).unwrap();
        assert_eq!(out, base);
    }

    proptest! {
        #[test]
        fn non_decreasing_starts_always_validate(
            mut bounds in proptest::collection::vec(0usize..1000, 0..20)
        ) {
            bounds.sort_unstable();
            let parts: Vec<DiffPart> = bounds
                .chunks(2)
                .filter(|pair| pair.len() == 2)
                .map(|pair| part(pair[0], pair[1], b""))
                .collect();
            prop_assert!(validate_parts(&parts).is_ok());
        }

        #[test]
        fn decreasing_start_is_always_rejected(
            a in 1usize..1000,
            b in 0usize..1000,
        ) {
            prop_assume!(b < a);
            let parts = vec![part(a, a, b""), part(b, b, b"")];
            prop_assert!(validate_parts(&parts).is_err());
        }
    }
}
