//! Outcome types shared by the feed decoders, plus time-based eviction.

use chrono::{DateTime, TimeDelta, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Why a line was not applied to a store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Wrong record kind, field count, checksum or unknown sentence.
    /// Expected on shared feeds and never logged above trace.
    Shape(&'static str),
    /// A field that should be numeric (or a date) could not be decoded.
    /// The whole message is discarded.
    Field { name: &'static str, value: String },
}

impl SkipReason {
    pub fn field(name: &'static str, value: &str) -> Self {
        SkipReason::Field {
            name,
            value: value.to_string(),
        }
    }

    pub fn is_field_error(&self) -> bool {
        matches!(self, SkipReason::Field { .. })
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Shape(what) => write!(f, "{}", what),
            SkipReason::Field { name, value } => write!(f, "bad {} field '{}'", name, value),
        }
    }
}

/// Result of handing one line to a store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeOutcome {
    Applied,
    Skipped(SkipReason),
}

impl DecodeOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, DecodeOutcome::Applied)
    }
}

impl From<Result<(), SkipReason>> for DecodeOutcome {
    fn from(result: Result<(), SkipReason>) -> Self {
        match result {
            Ok(()) => DecodeOutcome::Applied,
            Err(reason) => DecodeOutcome::Skipped(reason),
        }
    }
}

/// A numeric value carried in a feed field
///
/// `FromStr` for floats accepts `nan`, `inf` and overflowing exponents, none
/// of which a receiver ever reports.
pub(crate) trait FieldValue: FromStr {
    fn is_usable(&self) -> bool;
}

macro_rules! integer_field_value {
    ($($t:ty),*) => {
        $(impl FieldValue for $t {
            fn is_usable(&self) -> bool {
                true
            }
        })*
    };
}

integer_field_value!(i8, i16, i32, i64, u8, u16, u32, u64);

impl FieldValue for f32 {
    fn is_usable(&self) -> bool {
        self.is_finite()
    }
}

impl FieldValue for f64 {
    fn is_usable(&self) -> bool {
        self.is_finite()
    }
}

/// Decode a field that may legitimately be empty
///
/// Empty (or all-blank) means "not reported" and yields `Ok(None)`; anything
/// else must parse to a usable value.
pub(crate) fn optional_field<T: FieldValue>(
    raw: &str,
    name: &'static str,
) -> Result<Option<T>, SkipReason> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    match raw.parse::<T>() {
        Ok(value) if value.is_usable() => Ok(Some(value)),
        _ => Err(SkipReason::field(name, raw)),
    }
}

/// Decode a field that must be present
pub(crate) fn required_field<T: FieldValue>(raw: &str, name: &'static str) -> Result<T, SkipReason> {
    optional_field(raw, name)?.ok_or_else(|| SkipReason::field(name, raw))
}

/// True if `then` is more than `threshold` away from `now`, in either direction
pub fn is_stale(now: DateTime<Utc>, then: DateTime<Utc>, threshold: TimeDelta) -> bool {
    (now - then).abs() > threshold
}

/// Remove every entry whose timestamp is stale relative to `now`
///
/// Returns the number of entries removed.
pub fn evict_stale<K: Ord, V>(
    map: &mut BTreeMap<K, V>,
    now: DateTime<Utc>,
    threshold: TimeDelta,
    timestamp: impl Fn(&V) -> DateTime<Utc>,
) -> usize {
    let before = map.len();
    map.retain(|_, value| !is_stale(now, timestamp(value), threshold));
    before - map.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_optional_field() {
        assert_eq!(optional_field::<i32>("", "altitude"), Ok(None));
        assert_eq!(optional_field::<i32>("  ", "altitude"), Ok(None));
        assert_eq!(optional_field::<i32>("36000", "altitude"), Ok(Some(36000)));
        assert_eq!(
            optional_field::<i32>("36k", "altitude"),
            Err(SkipReason::field("altitude", "36k"))
        );
    }

    #[test]
    fn test_non_finite_floats_are_field_errors() {
        for raw in ["nan", "NaN", "inf", "-inf", "infinity", "1e39"] {
            assert_eq!(
                optional_field::<f32>(raw, "latitude"),
                Err(SkipReason::field("latitude", raw)),
                "{raw} accepted"
            );
        }
        assert_eq!(optional_field::<f64>("1e39", "latitude"), Ok(Some(1e39)));
        assert_eq!(optional_field::<f32>("-0.5", "latitude"), Ok(Some(-0.5)));
    }

    #[test]
    fn test_required_field() {
        assert_eq!(required_field::<f32>("1.5", "speed"), Ok(1.5));
        assert!(required_field::<f32>("", "speed").unwrap_err().is_field_error());
    }

    #[test]
    fn test_evict_stale_keeps_boundary_and_drops_both_directions() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let threshold = TimeDelta::seconds(60);

        let mut map = BTreeMap::new();
        map.insert(1, now);
        map.insert(2, now - TimeDelta::seconds(60));
        map.insert(3, now - TimeDelta::seconds(61));
        map.insert(4, now + TimeDelta::seconds(61));
        map.insert(5, now + TimeDelta::seconds(30));

        let removed = evict_stale(&mut map, now, threshold, |t| *t);

        assert_eq!(removed, 2);
        assert_eq!(map.keys().copied().collect::<Vec<_>>(), vec![1, 2, 5]);
        for t in map.values() {
            assert!(!is_stale(now, *t, threshold));
        }
    }

    #[test]
    fn test_outcome_from_result() {
        assert!(DecodeOutcome::from(Ok(())).is_applied());
        assert_eq!(
            DecodeOutcome::from(Err(SkipReason::Shape("not MSG"))),
            DecodeOutcome::Skipped(SkipReason::Shape("not MSG"))
        );
    }
}
