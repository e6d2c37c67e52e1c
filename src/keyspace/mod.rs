//! Key arithmetic and serialization
//!
//! Each supported key type provides a total ordering, midpoint computation
//! with a splittability test, and an exact string round-trip used for
//! persistence. Implementations are stateless value objects constructed once
//! and passed explicitly to the engine and scheduler; there are no hidden
//! global defaults.
//!
//! Splitting normalizes the two bounds before computing the midpoint, so the
//! arithmetic is independent of whether the data source serves keys in
//! ascending or descending order.

use num_bigint::BigInt;
use num_traits::{Signed, ToPrimitive};
use thiserror::Error;
use uuid::Uuid;

/// Key deserialization failure
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("malformed {kind} key: {raw:?}")]
    Malformed { kind: &'static str, raw: String },
}

impl KeyError {
    fn malformed(kind: &'static str, raw: &str) -> Self {
        Self::Malformed {
            kind,
            raw: raw.to_string(),
        }
    }
}

/// Arithmetic and serialization over one key type.
///
/// `split` returns a key strictly between the bounds such that `[lo, mid)`
/// and `[mid, hi]` are both non-empty, or `None` when the range holds at
/// most one key beyond its start (adjacent integers, equal bounds). That is
/// the guard against infinite or degenerate splitting.
pub trait KeySpace: Send + Sync {
    type Key: Clone + Ord + Send + Sync + std::fmt::Debug;

    /// Midpoint of `[first, last]`/`[first, last)`, or `None` when the range
    /// is too narrow to split. Bounds may arrive in either direction.
    fn split(&self, first: &Self::Key, last: &Self::Key, is_inclusive: bool)
        -> Option<Self::Key>;

    /// Exact string form used for persistence.
    fn serialize(&self, key: &Self::Key) -> String;

    /// Inverse of [`KeySpace::serialize`]: `deserialize(serialize(k)) == k`
    /// for every valid key.
    fn deserialize(&self, raw: &str) -> Result<Self::Key, KeyError>;

    /// Width of the span between two keys, where the type supports cheap
    /// measurement. Used for proportional remaining-estimates at split time.
    fn distance(&self, first: &Self::Key, last: &Self::Key) -> Option<u128>;
}

/// Midpoint over a normalized integer span. `None` when fewer than three
/// keys remain, which is exactly the "at most one further key" guard.
fn integer_midpoint(first: i128, last: i128, is_inclusive: bool) -> Option<i128> {
    let descending = first > last;
    let (mut lo, mut hi) = if descending { (last, first) } else { (first, last) };
    if !is_inclusive {
        // Exclusivity attaches to `last`, which is the low bound when the
        // range runs descending.
        if descending {
            lo = lo.checked_add(1)?;
        } else {
            hi = hi.checked_sub(1)?;
        }
    }
    if hi.checked_sub(lo)? < 2 {
        return None;
    }
    Some(lo + (hi - lo) / 2)
}

/// 32-bit integer keys; midpoint is the arithmetic mean computed in a wider
/// type, so bounds near `i32::MIN`/`i32::MAX` cannot overflow.
#[derive(Debug, Clone, Copy, Default)]
pub struct Int32Keys;

impl KeySpace for Int32Keys {
    type Key = i32;

    fn split(&self, first: &i32, last: &i32, is_inclusive: bool) -> Option<i32> {
        integer_midpoint(*first as i128, *last as i128, is_inclusive).map(|m| m as i32)
    }

    fn serialize(&self, key: &i32) -> String {
        key.to_string()
    }

    fn deserialize(&self, raw: &str) -> Result<i32, KeyError> {
        raw.parse().map_err(|_| KeyError::malformed("int32", raw))
    }

    fn distance(&self, first: &i32, last: &i32) -> Option<u128> {
        Some((*first as i128 - *last as i128).unsigned_abs())
    }
}

/// 64-bit integer keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct Int64Keys;

impl KeySpace for Int64Keys {
    type Key = i64;

    fn split(&self, first: &i64, last: &i64, is_inclusive: bool) -> Option<i64> {
        integer_midpoint(*first as i128, *last as i128, is_inclusive).map(|m| m as i64)
    }

    fn serialize(&self, key: &i64) -> String {
        key.to_string()
    }

    fn deserialize(&self, raw: &str) -> Result<i64, KeyError> {
        raw.parse().map_err(|_| KeyError::malformed("int64", raw))
    }

    fn distance(&self, first: &i64, last: &i64) -> Option<u128> {
        Some((*first as i128 - *last as i128).unsigned_abs())
    }
}

/// Arbitrary-precision integer keys.
#[derive(Debug, Clone, Default)]
pub struct BigIntKeys;

impl KeySpace for BigIntKeys {
    type Key = BigInt;

    fn split(&self, first: &BigInt, last: &BigInt, is_inclusive: bool) -> Option<BigInt> {
        let descending = first > last;
        let (mut lo, mut hi) = if descending {
            (last.clone(), first.clone())
        } else {
            (first.clone(), last.clone())
        };
        if !is_inclusive {
            if descending {
                lo += 1;
            } else {
                hi -= 1;
            }
        }
        if &hi - &lo < BigInt::from(2) {
            return None;
        }
        Some(&lo + (&hi - &lo) / 2)
    }

    fn serialize(&self, key: &BigInt) -> String {
        key.to_str_radix(10)
    }

    fn deserialize(&self, raw: &str) -> Result<BigInt, KeyError> {
        raw.parse().map_err(|_| KeyError::malformed("bigint", raw))
    }

    fn distance(&self, first: &BigInt, last: &BigInt) -> Option<u128> {
        (first - last).abs().to_u128()
    }
}

/// UUID keys, treated as 128-bit big-endian numbers for midpoint purposes.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidKeys;

impl KeySpace for UuidKeys {
    type Key = Uuid;

    fn split(&self, first: &Uuid, last: &Uuid, is_inclusive: bool) -> Option<Uuid> {
        let a = first.as_u128();
        let b = last.as_u128();
        let descending = a > b;
        let (mut lo, mut hi) = if descending { (b, a) } else { (a, b) };
        if !is_inclusive {
            if descending {
                lo = lo.checked_add(1)?;
            } else {
                hi = hi.checked_sub(1)?;
            }
        }
        if hi.checked_sub(lo)? < 2 {
            return None;
        }
        Some(Uuid::from_u128(lo + (hi - lo) / 2))
    }

    fn serialize(&self, key: &Uuid) -> String {
        key.hyphenated().to_string()
    }

    fn deserialize(&self, raw: &str) -> Result<Uuid, KeyError> {
        Uuid::parse_str(raw).map_err(|_| KeyError::malformed("uuid", raw))
    }

    fn distance(&self, first: &Uuid, last: &Uuid) -> Option<u128> {
        let (a, b) = (first.as_u128(), last.as_u128());
        Some(a.max(b) - a.min(b))
    }
}

/// Opaque string keys: identity serializer, not independently splittable
/// without an external comparator.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringKeys;

impl KeySpace for StringKeys {
    type Key = String;

    fn split(&self, _first: &String, _last: &String, _is_inclusive: bool) -> Option<String> {
        None
    }

    fn serialize(&self, key: &String) -> String {
        key.clone()
    }

    fn deserialize(&self, raw: &str) -> Result<String, KeyError> {
        Ok(raw.to_string())
    }

    fn distance(&self, _first: &String, _last: &String) -> Option<u128> {
        None
    }
}
