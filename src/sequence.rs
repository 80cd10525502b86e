//! Serial-number arithmetic for 32-bit AMQP sequence numbers.
//!
//! Delivery ids, transfer ids and delivery counts wrap from `u32::MAX` back to
//! zero. Comparisons treat the space as a circle: `a` precedes `b` when the
//! forward distance from `a` to `b` is less than half the space.

use std::cmp::Ordering;

/// A 32-bit wrapping sequence number.
pub type SequenceNo = u32;

const HALF: u32 = 0x8000_0000;

/// Compare two sequence numbers on the circle.
#[must_use]
pub const fn compare(a: SequenceNo, b: SequenceNo) -> Ordering {
    let diff = a.wrapping_sub(b);
    if diff == 0 {
        Ordering::Equal
    } else if diff >= HALF {
        Ordering::Less
    } else {
        Ordering::Greater
    }
}

/// Return `true` when `a` precedes `b`.
#[must_use]
pub const fn precedes(a: SequenceNo, b: SequenceNo) -> bool {
    matches!(compare(a, b), Ordering::Less)
}

/// Return `true` when `x` lies in the inclusive range `first..=last`, walking
/// forward from `first`.
#[must_use]
pub const fn in_range(first: SequenceNo, last: SequenceNo, x: SequenceNo) -> bool {
    x.wrapping_sub(first) <= last.wrapping_sub(first)
}

/// Forward distance from `from` to `to`.
#[must_use]
pub const fn distance(from: SequenceNo, to: SequenceNo) -> u32 { to.wrapping_sub(from) }

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(u32::MAX, 0, Ordering::Less)]
    #[case(0, u32::MAX, Ordering::Greater)]
    #[case(u32::MAX, 1, Ordering::Less)]
    #[case(5, 5, Ordering::Equal)]
    #[case(10, 20, Ordering::Less)]
    fn wrap_boundary_ordering(#[case] a: u32, #[case] b: u32, #[case] expected: Ordering) {
        assert_eq!(compare(a, b), expected);
    }

    #[test]
    fn range_spans_wrap() {
        assert!(in_range(u32::MAX, 1, u32::MAX));
        assert!(in_range(u32::MAX, 1, 0));
        assert!(in_range(u32::MAX, 1, 1));
        assert!(!in_range(u32::MAX, 1, 2));
        assert!(!in_range(u32::MAX, 1, u32::MAX - 1));
    }

    proptest! {
        #[test]
        fn successor_always_follows(a in any::<u32>(), step in 1u32..HALF) {
            prop_assert!(precedes(a, a.wrapping_add(step)));
            prop_assert!(!precedes(a.wrapping_add(step), a));
        }

        #[test]
        fn range_contains_every_step(first in any::<u32>(), len in 0u32..1000, k in 0u32..1000) {
            let last = first.wrapping_add(len);
            prop_assert_eq!(in_range(first, last, first.wrapping_add(k)), k <= len);
        }

        #[test]
        fn distance_inverts_addition(a in any::<u32>(), d in any::<u32>()) {
            prop_assert_eq!(distance(a, a.wrapping_add(d)), d);
        }
    }
}
