//! Edition hints.
//!
//! An [`EditionHint`] is a third-party claim that a subject identity has
//! published at least a certain edition. Hints arrive as bonus payload of
//! downloaded trust lists and feed the slow downloader's priority queue.
//!
//! The queue order is materialised into a single fixed-width string so the
//! store's ordered index can serve the best hint with one range query. The
//! string concatenates, in order: the hint date rounded to the nearest UTC
//! day (`YYYYMMDD`), the source's capacity (3 digits), the sign of the
//! source's score (1 digit), the obfuscated subject id (43 characters), and
//! the edition (19 digits). Reading the index backwards then yields: newest
//! date first, then highest capacity, then trusted before distrusted
//! sources, then per-subject highest edition. Editions of different
//! subjects are never meaningfully compared because the subject id sits in
//! front of the edition.
//!
//! The subject id is XOR-obfuscated with a node-local random pad before it
//! enters the string. Without this an attacker could brute-force a public
//! key whose hash sorts extremally and so boost their own download
//! priority. The pad does not need to be cryptographic: download order is
//! only observable through the anonymizing transport, overlaid by the
//! random timing of parse completions.

use std::cmp::Ordering;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use wot_core::id::ID_BYTES;
use wot_core::time::{is_future_date, round_to_nearest_day, to_yyyymmdd};
use wot_core::{CoreError, IdentityId};

use crate::error::Result;

/// Key of an edition hint: `(source, subject)`. At most one hint exists
/// per pair.
pub type HintKey = (IdentityId, IdentityId);

/// Length of the materialised priority string.
pub const PRIORITY_LENGTH: usize = 8 + 3 + 1 + 43 + 19;

/// Bytes of the node-local obfuscation pad.
pub type ObfuscationPad = [u8; ID_BYTES];

/// A third-party claim "subject has published edition ≥ e".
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditionHint {
    source: IdentityId,
    subject: IdentityId,
    date: NaiveDate,
    source_capacity: u8,
    source_score_sign: i8,
    edition: u64,
    priority: String,
}

impl EditionHint {
    /// Build a validated hint.
    ///
    /// # Errors
    ///
    /// Fails if the source hints about itself without being an own
    /// identity (only restore may do that), if the date lies in the
    /// future, or if the capacity is below `min_capacity` or above 100.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: IdentityId,
        subject: IdentityId,
        source_is_own: bool,
        date: DateTime<Utc>,
        now: DateTime<Utc>,
        source_capacity: u8,
        source_score: i32,
        edition: u64,
        pad: &ObfuscationPad,
        min_capacity: u8,
    ) -> Result<Self> {
        if source == subject && !source_is_own {
            return Err(CoreError::invalid(format!(
                "identity {source} is trying to assign an edition hint to itself"
            ))
            .into());
        }
        if is_future_date(date, now) {
            return Err(CoreError::invalid(format!("hint date {date} lies in the future")).into());
        }
        if source_capacity < min_capacity || source_capacity > 100 {
            return Err(CoreError::invalid(format!(
                "hint source capacity {source_capacity} outside [{min_capacity}, 100]"
            ))
            .into());
        }

        let date = round_to_nearest_day(date);
        let source_score_sign: i8 = if source_score >= 0 { 1 } else { -1 };
        let priority =
            compute_priority(date, source_capacity, source_score_sign, subject, edition, pad);

        Ok(EditionHint {
            source,
            subject,
            date,
            source_capacity,
            source_score_sign,
            edition,
            priority,
        })
    }

    /// The identity that published the hint.
    #[must_use]
    pub fn source(&self) -> IdentityId {
        self.source
    }

    /// The identity the hint points at.
    #[must_use]
    pub fn subject(&self) -> IdentityId {
        self.subject
    }

    /// The day the source claims to have discovered the edition.
    #[must_use]
    pub fn date(&self) -> NaiveDate {
        self.date
    }

    /// The source's capacity at the time the hint was stored.
    #[must_use]
    pub fn source_capacity(&self) -> u8 {
        self.source_capacity
    }

    /// +1 if the source's score was non-negative, -1 otherwise.
    #[must_use]
    pub fn source_score_sign(&self) -> i8 {
        self.source_score_sign
    }

    /// The claimed edition.
    #[must_use]
    pub fn edition(&self) -> u64 {
        self.edition
    }

    /// The persisted priority string.
    #[must_use]
    pub fn priority(&self) -> &str {
        &self.priority
    }

    /// The `(source, subject)` key of this hint.
    #[must_use]
    pub fn key(&self) -> HintKey {
        (self.source, self.subject)
    }

    /// Reference comparator over the raw fields.
    ///
    /// Exists to validate the priority string: comparing two hints with
    /// this function must order them exactly like comparing their
    /// priority strings.
    #[must_use]
    pub fn cmp_reference(&self, other: &Self, pad: &ObfuscationPad) -> Ordering {
        self.date
            .cmp(&other.date)
            .then_with(|| self.source_capacity.cmp(&other.source_capacity))
            .then_with(|| self.source_score_sign.cmp(&other.source_score_sign))
            .then_with(|| {
                obfuscate_id(self.subject, pad).cmp(&obfuscate_id(other.subject, pad))
            })
            .then_with(|| self.edition.cmp(&other.edition))
    }
}

/// Obfuscate an identity id with the node-local pad.
#[must_use]
pub fn obfuscate_id(id: IdentityId, pad: &ObfuscationPad) -> String {
    let mut bytes = *id.as_bytes();
    for (byte, pad_byte) in bytes.iter_mut().zip(pad.iter()) {
        *byte ^= pad_byte;
    }
    URL_SAFE_NO_PAD.encode(bytes)
}

fn compute_priority(
    date: NaiveDate,
    capacity: u8,
    score_sign: i8,
    subject: IdentityId,
    edition: u64,
    pad: &ObfuscationPad,
) -> String {
    debug_assert!(capacity <= 100);
    debug_assert!(score_sign == 1 || score_sign == -1);

    let mut priority = String::with_capacity(PRIORITY_LENGTH);
    priority.push_str(&to_yyyymmdd(date));
    priority.push_str(&format!("{capacity:03}"));
    priority.push(if score_sign == 1 { '1' } else { '0' });
    priority.push_str(&obfuscate_id(subject, pad));
    priority.push_str(&format!("{edition:019}"));

    debug_assert_eq!(priority.len(), PRIORITY_LENGTH);
    priority
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use wot_core::Rank;

    fn make_id(n: u8) -> IdentityId {
        let mut bytes = [0u8; ID_BYTES];
        bytes[0] = n;
        IdentityId::from_bytes(bytes)
    }

    const PAD: ObfuscationPad = [0x5a; ID_BYTES];

    fn make_hint(
        source: u8,
        subject: u8,
        date: DateTime<Utc>,
        capacity: u8,
        score: i32,
        edition: u64,
    ) -> EditionHint {
        EditionHint::new(
            make_id(source),
            make_id(subject),
            false,
            date,
            date,
            capacity,
            score,
            edition,
            &PAD,
            1,
        )
        .unwrap()
    }

    fn day(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 1, 0, 0).unwrap()
    }

    #[test]
    fn priority_has_fixed_width() {
        let hint = make_hint(1, 2, day(2024, 1, 2), 40, 10, 5);
        assert_eq!(hint.priority().len(), PRIORITY_LENGTH);
    }

    #[test]
    fn capacity_breaks_date_ties() {
        // Same date: the hint from the higher-capacity source must win even
        // though the other one claims a much larger edition.
        let h1 = make_hint(1, 9, day(2024, 1, 2), 40, 10, 5);
        let h2 = make_hint(3, 9, day(2024, 1, 2), 16, 10, 99);
        assert!(h1.priority() > h2.priority());
    }

    #[test]
    fn newer_date_wins_over_capacity() {
        let newer = make_hint(1, 9, day(2024, 1, 3), 1, 10, 1);
        let older = make_hint(3, 9, day(2024, 1, 2), 100, 10, 99);
        assert!(newer.priority() > older.priority());
    }

    #[test]
    fn trusted_source_wins_over_distrusted() {
        let trusted = make_hint(1, 9, day(2024, 1, 2), 16, 0, 1);
        let distrusted = make_hint(3, 9, day(2024, 1, 2), 16, -5, 99);
        assert!(trusted.priority() > distrusted.priority());
    }

    #[test]
    fn edition_decides_for_same_subject() {
        let low = make_hint(1, 9, day(2024, 1, 2), 16, 10, 3);
        let high = make_hint(3, 9, day(2024, 1, 2), 16, 10, 7);
        assert!(high.priority() > low.priority());
    }

    #[test]
    fn self_hint_requires_own_subject() {
        let result = EditionHint::new(
            make_id(1),
            make_id(1),
            false,
            day(2024, 1, 2),
            day(2024, 1, 2),
            40,
            10,
            5,
            &PAD,
            1,
        );
        assert!(result.is_err());

        let own = EditionHint::new(
            make_id(1),
            make_id(1),
            true,
            day(2024, 1, 2),
            day(2024, 1, 2),
            100,
            100,
            5,
            &PAD,
            1,
        );
        assert!(own.is_ok());
    }

    #[test]
    fn future_date_rejected() {
        let now = day(2024, 1, 2);
        let result = EditionHint::new(
            make_id(1),
            make_id(2),
            false,
            now + chrono::Duration::days(1),
            now,
            40,
            10,
            5,
            &PAD,
            1,
        );
        assert!(result.is_err());
    }

    #[test]
    fn capacity_threshold_enforced() {
        let now = day(2024, 1, 2);
        assert!(
            EditionHint::new(make_id(1), make_id(2), false, now, now, 0, 10, 5, &PAD, 1).is_err()
        );
        // Legacy mode lowers the threshold to zero.
        assert!(
            EditionHint::new(make_id(1), make_id(2), false, now, now, 0, 10, 5, &PAD, 0).is_ok()
        );
        assert!(
            EditionHint::new(make_id(1), make_id(2), false, now, now, 101, 10, 5, &PAD, 1)
                .is_err()
        );
    }

    #[test]
    fn obfuscation_is_an_involution() {
        let id = make_id(42);
        let once = obfuscate_id(id, &PAD);
        let decoded = IdentityId::decode(&once).unwrap();
        let twice = obfuscate_id(decoded, &PAD);
        assert_eq!(twice, id.encode());
    }

    proptest! {
        /// Comparing priority strings must agree with the reference
        /// comparator over the raw fields, for arbitrary hint pairs.
        #[test]
        fn priority_string_matches_reference_comparator(
            src_a in 1u8..120, subj_a in 121u8..250, day_a in 0u32..500, cap_a in 1u8..=100,
            score_a in -50i32..50, ed_a in 0u64..1_000_000,
            src_b in 1u8..120, subj_b in 121u8..250, day_b in 0u32..500, cap_b in 1u8..=100,
            score_b in -50i32..50, ed_b in 0u64..1_000_000,
        ) {
            let base = day(2023, 1, 1);
            let a = make_hint(src_a, subj_a, base + chrono::Duration::days(i64::from(day_a)), cap_a, score_a, ed_a);
            let b = make_hint(src_b, subj_b, base + chrono::Duration::days(i64::from(day_b)), cap_b, score_b, ed_b);

            prop_assert_eq!(a.priority().cmp(b.priority()), a.cmp_reference(&b, &PAD));
        }

        /// All capacities valid for hint sources are representable.
        #[test]
        fn all_capacities_representable(rank in 0u32..10) {
            let capacity = wot_core::capacity_for_rank(Rank::Finite(rank));
            prop_assert!(capacity >= 1 && capacity <= 100);
        }
    }
}
