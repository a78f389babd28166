//! Candidate ordering rules.

use std::cmp::Ordering;

use taipan_conda_types::PackageRecord;

/// Orders two candidate records of the same package name the way conda
/// prefers them: records without tracked features first, then by version
/// (descending), build number (descending) and timestamp (descending).
pub(crate) fn compare_candidates(a: &PackageRecord, b: &PackageRecord) -> Ordering {
    // A candidate with tracked features is always sorted below one without.
    let a_has_tracked_features = !a.track_features.is_empty();
    let b_has_tracked_features = !b.track_features.is_empty();
    match a_has_tracked_features.cmp(&b_has_tracked_features) {
        Ordering::Equal => {}
        ord => return ord,
    }

    // Highest version first.
    match b.version.cmp(&a.version) {
        Ordering::Equal => {}
        ord => return ord,
    }

    // Highest build number first.
    match b.build_number.cmp(&a.build_number) {
        Ordering::Equal => {}
        ord => return ord,
    }

    // Most recent build first.
    b.timestamp.cmp(&a.timestamp)
}

#[cfg(test)]
mod test {
    use std::cmp::Ordering;

    use taipan_conda_types::PackageRecord;

    use super::compare_candidates;

    fn record(version: &str, build_number: u64) -> PackageRecord {
        let mut record = PackageRecord::new(
            "foo".to_owned(),
            version.parse().unwrap(),
            "0".to_owned(),
        );
        record.build_number = build_number;
        record
    }

    #[test]
    fn test_version_wins() {
        assert_eq!(
            compare_candidates(&record("2.0", 0), &record("1.0", 3)),
            Ordering::Less
        );
    }

    #[test]
    fn test_build_number_breaks_ties() {
        assert_eq!(
            compare_candidates(&record("1.0", 2), &record("1.0", 1)),
            Ordering::Less
        );
    }

    #[test]
    fn test_tracked_features_sink() {
        let mut tracked = record("9.0", 0);
        tracked.track_features.push("legacy".to_owned());
        assert_eq!(
            compare_candidates(&record("1.0", 0), &tracked),
            Ordering::Less
        );
    }
}
