//! Lexically sortable event positions.
//!
//! A [`SortableUniqueId`] is a 30-digit decimal string: 19 digits of
//! 100-nanosecond ticks since `0001-01-01T00:00:00Z`, followed by 11 digits
//! derived from a UUID. Comparing two ids as strings compares them
//! chronologically, so the same value doubles as a resume cursor and as an
//! optimistic concurrency token.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DcbError;

const TICK_DIGITS: usize = 19;
const RANDOM_DIGITS: usize = 11;
const TOTAL_DIGITS: usize = TICK_DIGITS + RANDOM_DIGITS;

/// Ticks between `0001-01-01` and the Unix epoch.
const UNIX_EPOCH_TICKS: i64 = 621_355_968_000_000_000;
const TICKS_PER_SECOND: i64 = 10_000_000;
const NANOS_PER_TICK: i64 = 100;
/// Largest representable tick count (`9999-12-31T23:59:59.9999999`).
const MAX_TICKS: i64 = 3_155_378_975_999_999_999;
const RANDOM_MODULUS: u128 = 100_000_000_000;

/// Globally ordered event position.
///
/// The default value is the empty id, meaning "no position yet". Empty
/// sorts before every generated id.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SortableUniqueId(String);

impl SortableUniqueId {
    /// Build an id for `at`, breaking ties with `id`.
    pub fn generate(at: DateTime<Utc>, id: Uuid) -> Self {
        let ticks = to_ticks(at);
        let random = id.as_u128() % RANDOM_MODULUS;
        Self(format!("{ticks:019}{random:011}"))
    }

    /// Build a fresh id for the current instant.
    pub fn generate_now() -> Self {
        Self::generate(Utc::now(), Uuid::new_v4())
    }

    /// The lowest id at instant `at`. Marks the edge of the safe window.
    pub fn safe_threshold(at: DateTime<Utc>) -> Self {
        Self::generate(at, Uuid::nil())
    }

    /// The smallest non-empty id.
    pub fn min_value() -> Self {
        Self("0".repeat(TOTAL_DIGITS))
    }

    /// The largest representable id.
    pub fn max_value() -> Self {
        Self(format!("{MAX_TICKS:019}{}", "9".repeat(RANDOM_DIGITS)))
    }

    /// Parse and validate an id string.
    ///
    /// The empty string parses to the empty id.
    ///
    /// # Errors
    ///
    /// Returns [`DcbError::InvalidSortableUniqueId`] if the value is not
    /// exactly 30 ASCII digits.
    pub fn parse(value: &str) -> Result<Self, DcbError> {
        if value.is_empty() {
            return Ok(Self::default());
        }
        if value.len() != TOTAL_DIGITS || !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(DcbError::InvalidSortableUniqueId(value.to_string()));
        }
        Ok(Self(value.to_string()))
    }

    /// The raw string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` for the "no position" id.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Decode the timestamp portion. `None` for the empty id.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        let ticks: i64 = self.0.get(..TICK_DIGITS)?.parse().ok()?;
        let unix_ticks = ticks - UNIX_EPOCH_TICKS;
        let secs = unix_ticks.div_euclid(TICKS_PER_SECOND);
        let nanos = unix_ticks.rem_euclid(TICKS_PER_SECOND) * NANOS_PER_TICK;
        DateTime::from_timestamp(secs, u32::try_from(nanos).ok()?)
    }

    /// Strictly earlier than `other`.
    pub fn is_earlier_than(&self, other: &SortableUniqueId) -> bool {
        self < other
    }

    /// Strictly later than `other`.
    pub fn is_later_than(&self, other: &SortableUniqueId) -> bool {
        self > other
    }
}

fn to_ticks(at: DateTime<Utc>) -> i64 {
    at.timestamp()
        .saturating_mul(TICKS_PER_SECOND)
        .saturating_add(UNIX_EPOCH_TICKS)
        .saturating_add(i64::from(at.timestamp_subsec_nanos()) / NANOS_PER_TICK)
        .clamp(0, MAX_TICKS)
}

impl fmt::Display for SortableUniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SortableUniqueId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for SortableUniqueId {
    type Error = DcbError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn generated_id_has_thirty_digits() {
        let id = SortableUniqueId::generate_now();
        assert_eq!(id.as_str().len(), 30);
        assert!(id.as_str().bytes().all(|b| b.is_ascii_digit()));
    }

    #[test]
    fn out_of_range_instants_are_clamped() {
        let far_future = DateTime::<Utc>::MAX_UTC;
        let id = SortableUniqueId::generate(far_future, Uuid::nil());
        assert_eq!(&id.as_str()[..19], "3155378975999999999");

        let far_past = DateTime::<Utc>::MIN_UTC;
        let id = SortableUniqueId::generate(far_past, Uuid::nil());
        assert_eq!(&id.as_str()[..19], "0000000000000000000");
        assert_eq!(id.timestamp().map(|t| t.timestamp()), Some(-62_135_596_800));
    }

    #[test]
    fn unix_epoch_encodes_known_tick_count() {
        let epoch = Utc.timestamp_opt(0, 0).single().expect("valid epoch");
        let id = SortableUniqueId::generate(epoch, Uuid::nil());
        assert_eq!(id.as_str(), "062135596800000000000000000000");
    }

    #[test]
    fn later_instant_sorts_after_earlier_instant() {
        let base = Utc::now();
        let a = SortableUniqueId::generate(base, Uuid::new_v4());
        let b = SortableUniqueId::generate(base + Duration::microseconds(1), Uuid::new_v4());
        assert!(a < b, "{a} should sort before {b}");
        assert!(a.is_earlier_than(&b));
        assert!(b.is_later_than(&a));
    }

    #[test]
    fn safe_threshold_precedes_every_id_at_same_tick() {
        let at = Utc::now();
        let threshold = SortableUniqueId::safe_threshold(at);
        for _ in 0..20 {
            let id = SortableUniqueId::generate(at, Uuid::new_v4());
            assert!(threshold <= id);
        }
    }

    #[test]
    fn timestamp_round_trips_to_tick_precision() {
        let at = Utc
            .with_ymd_and_hms(2024, 5, 17, 8, 30, 12)
            .single()
            .expect("valid date")
            + Duration::nanoseconds(123_456_700);
        let id = SortableUniqueId::generate(at, Uuid::new_v4());
        assert_eq!(id.timestamp(), Some(at));
    }

    #[test]
    fn empty_sorts_before_min_value() {
        let empty = SortableUniqueId::default();
        assert!(empty.is_empty());
        assert!(empty < SortableUniqueId::min_value());
        assert!(SortableUniqueId::generate_now() < SortableUniqueId::max_value());
        assert_eq!(empty.timestamp(), None);
    }

    #[test]
    fn parse_rejects_malformed_values() {
        assert!(SortableUniqueId::parse("").expect("empty is valid").is_empty());
        let good = SortableUniqueId::generate_now();
        assert_eq!(
            SortableUniqueId::parse(good.as_str()).expect("generated id should parse"),
            good
        );
        let result = SortableUniqueId::parse("12345");
        assert!(
            matches!(result, Err(DcbError::InvalidSortableUniqueId(_))),
            "expected InvalidSortableUniqueId, got: {result:?}"
        );
        assert!(SortableUniqueId::parse(&"a".repeat(30)).is_err());
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = SortableUniqueId::min_value();
        let json = serde_json::to_string(&id).expect("serialization should succeed");
        assert_eq!(json, format!("\"{}\"", "0".repeat(30)));
    }
}
