//! Property tests for key arithmetic and serialization

use num_bigint::BigInt;
use proptest::prelude::*;
use uuid::Uuid;

use rangeflow::keyspace::{BigIntKeys, Int32Keys, Int64Keys, KeySpace, StringKeys, UuidKeys};

proptest! {
    #[test]
    fn int32_serialization_round_trips(k in any::<i32>()) {
        let keys = Int32Keys;
        prop_assert_eq!(keys.deserialize(&keys.serialize(&k)).unwrap(), k);
    }

    #[test]
    fn int64_serialization_round_trips(k in any::<i64>()) {
        let keys = Int64Keys;
        prop_assert_eq!(keys.deserialize(&keys.serialize(&k)).unwrap(), k);
    }

    #[test]
    fn uuid_serialization_round_trips(raw in any::<u128>()) {
        let keys = UuidKeys;
        let k = Uuid::from_u128(raw);
        prop_assert_eq!(keys.deserialize(&keys.serialize(&k)).unwrap(), k);
    }

    #[test]
    fn bigint_serialization_round_trips(raw in any::<i128>()) {
        let keys = BigIntKeys;
        let k = BigInt::from(raw);
        prop_assert_eq!(keys.deserialize(&keys.serialize(&k)).unwrap(), k.clone());
    }

    #[test]
    fn string_serialization_is_identity(s in "\\PC*") {
        let keys = StringKeys;
        prop_assert_eq!(keys.deserialize(&keys.serialize(&s)).unwrap(), s);
    }

    #[test]
    fn int64_midpoint_stays_strictly_inside(a in any::<i64>(), b in any::<i64>(), inclusive in any::<bool>()) {
        let keys = Int64Keys;
        if let Some(mid) = keys.split(&a, &b, inclusive) {
            let (lo, hi) = (a.min(b), a.max(b));
            prop_assert!(mid > lo, "midpoint {} must exceed low bound {}", mid, lo);
            prop_assert!(mid < hi, "midpoint {} must undercut high bound {}", mid, hi);
        }
    }

    #[test]
    fn int64_split_symmetric_in_direction(a in any::<i64>(), b in any::<i64>()) {
        let keys = Int64Keys;
        prop_assert_eq!(keys.split(&a, &b, true), keys.split(&b, &a, true));
    }

    #[test]
    fn int64_narrow_ranges_never_split(lo in any::<i64>(), width in 0i64..=1) {
        let keys = Int64Keys;
        let hi = lo.saturating_add(width);
        prop_assert_eq!(keys.split(&lo, &hi, true), None);
    }

    #[test]
    fn int64_wide_inclusive_ranges_always_split(lo in -1_000_000i64..1_000_000, width in 2i64..1_000_000) {
        let keys = Int64Keys;
        let hi = lo + width;
        prop_assert!(keys.split(&lo, &hi, true).is_some());
    }

    #[test]
    fn int64_distance_is_symmetric(a in any::<i64>(), b in any::<i64>()) {
        let keys = Int64Keys;
        prop_assert_eq!(keys.distance(&a, &b), keys.distance(&b, &a));
    }

    #[test]
    fn uuid_midpoint_stays_strictly_inside(a in any::<u128>(), b in any::<u128>()) {
        let keys = UuidKeys;
        let (ka, kb) = (Uuid::from_u128(a), Uuid::from_u128(b));
        if let Some(mid) = keys.split(&ka, &kb, true) {
            let (lo, hi) = (a.min(b), a.max(b));
            prop_assert!(mid.as_u128() > lo);
            prop_assert!(mid.as_u128() < hi);
        }
    }

    #[test]
    fn bigint_midpoint_stays_strictly_inside(a in any::<i128>(), b in any::<i128>()) {
        let keys = BigIntKeys;
        let (ka, kb) = (BigInt::from(a), BigInt::from(b));
        if let Some(mid) = keys.split(&ka, &kb, true) {
            let lo = BigInt::from(a.min(b));
            let hi = BigInt::from(a.max(b));
            prop_assert!(mid > lo);
            prop_assert!(mid < hi);
        }
    }

    #[test]
    fn strings_are_never_splittable(a in "\\PC*", b in "\\PC*") {
        let keys = StringKeys;
        prop_assert_eq!(keys.split(&a, &b, true), None);
    }
}
