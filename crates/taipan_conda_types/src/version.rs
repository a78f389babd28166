use std::{
    cmp::Ordering,
    fmt,
    fmt::{Debug, Display, Formatter},
    hash::{Hash, Hasher},
    str::FromStr,
};

use itertools::{EitherOrBoth, Itertools};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use smallvec::SmallVec;
use thiserror::Error;

/// This type implements the order relation between conda version strings.
///
/// Version strings consist of an optional epoch (an integer followed by `!`),
/// a version part, and an optional local part separated by `+`. The version
/// and local parts are split into segments at `.`, `_` and `-` characters,
/// which are fully equivalent (`1_2` == `1-2` == `1.2`); a trailing
/// underscore instead attaches to the last segment (`1.1_`, the openssl
/// convention). Each segment is split again into alternating runs of
/// numerals and non-numerals, and segments starting with a letter get an
/// implicit leading `0` so that numbers and strings stay in phase
/// (`1.1.a1` == `1.1.0a1`).
///
/// Comparison is lexicographic over segments with the following component
/// rules:
///
/// * integers compare numerically,
/// * strings compare lexicographically and sort below integers,
/// * `dev` sorts below everything else in its position,
/// * `post` sorts above everything else in its position,
/// * missing components are treated as the integer `0`, so `1.1` == `1.1.0`.
///
/// The resulting order, reproduced from the conda documentation:
///
/// ```txt
///        0.4
///      < 0.4.1.rc
///      < 0.4.1
///      < 0.5a1
///      < 0.5
///      < 0.9.6
///      < 1.0
///      < 1.1dev1    # special case 'dev'
///      < 1.1_       # underscore special case for openssl-like versions
///      < 1.1a1
///      < 1.1.0dev1
///      < 1.1.0rc1
///      < 1.1.0
///     == 1.1
///      < 1.1.0post1 # special case 'post'
///      < 1996.07.12
///      < 1!0.4.1    # epoch increased
/// ```
///
/// The original string is retained (normalized to lower case) so that
/// formatting a parsed version is exact.
#[derive(Clone, Eq)]
pub struct Version {
    /// The original version string, trimmed and converted to lower case.
    /// Dashes are replaced by underscores when the string contains no
    /// underscores of its own.
    norm: Box<str>,

    /// The epoch, 0 unless the string carried an explicit `<int>!` prefix.
    epoch: u64,

    /// The segments of the version part.
    segments: SmallVec<[Segment; 4]>,

    /// The segments of the local part (after `+`), empty if there is none.
    local: SmallVec<[Segment; 4]>,
}

/// One `.`-separated segment, e.g. `beta15` is `[0, "beta", 15]`.
type Segment = SmallVec<[Component; 2]>;

/// A single run of numerals or non-numerals within a segment.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub(crate) enum Component {
    /// `dev`, sorts below everything else.
    Dev,
    /// A non-numeric run, sorts below numbers.
    Ident(Box<str>),
    /// A numeric run.
    Number(u64),
    /// `post`, sorts above everything else.
    Post,
}

impl Component {
    fn cmp_rank(&self) -> u8 {
        match self {
            Component::Dev => 0,
            Component::Ident(_) => 1,
            Component::Number(_) => 2,
            Component::Post => 3,
        }
    }
}

impl Ord for Component {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Component::Number(a), Component::Number(b)) => a.cmp(b),
            (Component::Ident(a), Component::Ident(b)) => a.cmp(b),
            (a, b) => a.cmp_rank().cmp(&b.cmp_rank()),
        }
    }
}

impl PartialOrd for Component {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

const ZERO: Component = Component::Number(0);

/// Compares two sequences of segments, padding the shorter side with
/// implicit zeros on both the segment and the component level.
fn cmp_segments(a: &[Segment], b: &[Segment]) -> Ordering {
    for pair in a.iter().zip_longest(b.iter()) {
        let (left, right): (&[Component], &[Component]) = match &pair {
            EitherOrBoth::Both(left, right) => (left, right),
            EitherOrBoth::Left(left) => (left, &[]),
            EitherOrBoth::Right(right) => (&[], right),
        };

        for components in left.iter().zip_longest(right.iter()) {
            let (l, r) = match components {
                EitherOrBoth::Both(l, r) => (l, r),
                EitherOrBoth::Left(l) => (l, &ZERO),
                EitherOrBoth::Right(r) => (&ZERO, r),
            };
            match l.cmp(r) {
                Ordering::Equal => {}
                ord => return ord,
            }
        }
    }
    Ordering::Equal
}

impl Version {
    /// Returns the epoch of the version, 0 if unspecified.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Returns true if this version has a local part (e.g. `1.2+local`).
    pub fn has_local(&self) -> bool {
        !self.local.is_empty()
    }

    /// Returns the version as a `(major, minor)` tuple if the first two
    /// segments are plain numbers.
    pub fn as_major_minor(&self) -> Option<(u64, u64)> {
        let (major, minor) = self.segments.iter().next_tuple()?;
        match (major.as_slice(), minor.as_slice()) {
            ([Component::Number(major)], [Component::Number(minor)]) => Some((*major, *minor)),
            _ => None,
        }
    }

    /// Returns true if this version starts with the segments of `other`:
    /// equal epochs, equal leading segments, and `other`'s final segment a
    /// component-wise prefix of the corresponding segment of this version.
    /// This is the matching rule behind `=1.2` and `1.2.*` version specs.
    pub fn starts_with(&self, other: &Version) -> bool {
        if self.epoch != other.epoch {
            return false;
        }

        let Some((last, head)) = other.segments.split_last() else {
            return true;
        };
        if head.len() >= self.segments.len() {
            return false;
        }
        if self.segments[..head.len()] != *head {
            return false;
        }

        let own = &self.segments[head.len()];
        own.len() >= last.len() && own[..last.len()] == **last
    }

    /// Returns true if this version is compatible with `other` in the
    /// `~=` sense: at least `other`, and starting with all but the last
    /// segment of `other`.
    pub fn compatible_with(&self, other: &Version) -> bool {
        if self < other {
            return false;
        }
        let prefix = Version {
            norm: other.norm.clone(),
            epoch: other.epoch,
            segments: other.segments[..other.segments.len().saturating_sub(1)]
                .iter()
                .cloned()
                .collect(),
            local: SmallVec::new(),
        };
        self.starts_with(&prefix)
    }

    /// Returns the string this version was parsed from (normalized to lower
    /// case).
    pub fn as_str(&self) -> &str {
        &self.norm
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.epoch
            .cmp(&other.epoch)
            .then_with(|| cmp_segments(&self.segments, &other.segments))
            .then_with(|| cmp_segments(&self.local, &other.local))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Versions that compare equal must hash equally, so hash the parsed
        // representation padded to a canonical form rather than the string.
        self.epoch.hash(state);
        for segments in [&self.segments, &self.local] {
            let stripped: Vec<&[Component]> = segments
                .iter()
                .map(|segment| {
                    let mut components = segment.as_slice();
                    while let [rest @ .., Component::Number(0)] = components {
                        components = rest;
                    }
                    components
                })
                .collect();
            // Trailing all-zero segments do not participate in equality.
            let len = stripped
                .iter()
                .rposition(|components| !components.is_empty())
                .map_or(0, |index| index + 1);
            stripped[..len].hash(state);
            0xfeu8.hash(state);
        }
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.norm)
    }
}

impl Debug for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Version(\"{}\")", self.norm)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.norm)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let str = String::deserialize(deserializer)?;
        str.parse().map_err(serde::de::Error::custom)
    }
}

/// An error that occurred during parsing of a version string.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum ParseVersionError {
    /// The version string was empty.
    #[error("empty version string")]
    Empty,

    /// The epoch is not an integer.
    #[error("epoch is not a number")]
    EpochNotANumber,

    /// Two consecutive separators, or a leading/trailing one.
    #[error("version contains an empty segment")]
    EmptySegment,

    /// The version contained a character outside of `[a-zA-Z0-9._+!-]`.
    #[error("invalid character '{0}'")]
    InvalidCharacter(char),

    /// A numeral run does not fit in 64 bits.
    #[error("number in version too large")]
    NumberTooLarge,

    /// More than one `+` in the version string.
    #[error("duplicated local version separator '+'")]
    DuplicateLocalSeparator,
}

/// Splits a version part (everything between epoch and local) into
/// segments. `.`, `_` and `-` all separate segments, so `1_2`, `1-2` and
/// `1.2` parse (and compare) identically. The one exception is a trailing
/// underscore, which attaches to the last segment as a string component so
/// the openssl convention keeps its ordering (`1.1dev1` < `1.1_` <
/// `1.1a1`).
fn parse_segments(part: &str) -> Result<SmallVec<[Segment; 4]>, ParseVersionError> {
    let (part, trailing_underscore) = match part.strip_suffix('_') {
        Some(rest) if !rest.is_empty() && !rest.ends_with(['.', '_', '-']) => (rest, true),
        _ => (part, false),
    };

    let mut segments: SmallVec<[Segment; 4]> = SmallVec::new();
    for segment_str in part.split(['.', '_', '-']) {
        if segment_str.is_empty() {
            return Err(ParseVersionError::EmptySegment);
        }

        let mut segment = Segment::new();
        let mut rest = segment_str;
        while !rest.is_empty() {
            let numeral_len = rest.chars().take_while(char::is_ascii_digit).count();
            if numeral_len > 0 {
                let (run, tail) = rest.split_at(numeral_len);
                let number = run
                    .parse::<u64>()
                    .map_err(|_| ParseVersionError::NumberTooLarge)?;
                segment.push(Component::Number(number));
                rest = tail;
            } else {
                let run_len = rest.chars().take_while(|c| !c.is_ascii_digit()).count();
                let (run, tail) = rest.split_at(run_len);
                if let Some(invalid) = run.chars().find(|c| !c.is_ascii_alphabetic()) {
                    return Err(ParseVersionError::InvalidCharacter(invalid));
                }
                if segment.is_empty() {
                    // Keep numbers and strings in phase: `1.a1` == `1.0a1`.
                    segment.push(ZERO);
                }
                segment.push(match run {
                    "dev" => Component::Dev,
                    "post" => Component::Post,
                    _ => Component::Ident(run.into()),
                });
                rest = tail;
            }
        }
        segments.push(segment);
    }

    if trailing_underscore {
        segments
            .last_mut()
            .expect("the stripped part contains at least one segment")
            .push(Component::Ident("_".into()));
    }

    Ok(segments)
}

impl FromStr for Version {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_lowercase();
        if lowered.is_empty() {
            return Err(ParseVersionError::Empty);
        }

        // Dashes act as segment separators unless the version already uses
        // underscores, in which case they are kept verbatim.
        let norm: Box<str> = if lowered.contains('_') {
            lowered.into()
        } else {
            lowered.replace('-', "_").into()
        };

        // Split off the epoch.
        let (epoch, rest) = match norm.split_once('!') {
            Some((epoch, rest)) => {
                let epoch = epoch
                    .parse::<u64>()
                    .map_err(|_| ParseVersionError::EpochNotANumber)?;
                (epoch, rest)
            }
            None => (0, &*norm),
        };

        // Split off the local version.
        let (version_part, local_part) = match rest.split_once('+') {
            Some((_, local)) if local.contains('+') => {
                return Err(ParseVersionError::DuplicateLocalSeparator);
            }
            Some((version, local)) => (version, Some(local)),
            None => (rest, None),
        };

        let segments = parse_segments(version_part)?;
        let local = local_part
            .map(parse_segments)
            .transpose()?
            .unwrap_or_default();

        Ok(Version {
            norm,
            epoch,
            segments,
            local,
        })
    }
}

#[cfg(test)]
mod test {
    use std::cmp::Ordering;
    use std::str::FromStr;

    use rstest::rstest;

    use super::{ParseVersionError, Version};

    fn version(s: &str) -> Version {
        Version::from_str(s).unwrap()
    }

    #[test]
    fn test_documented_order() {
        // The ordering table from the conda documentation must hold.
        let order = [
            "0.4",
            "0.4.1.rc",
            "0.4.1",
            "0.5a1",
            "0.5b3",
            "0.5",
            "0.9.6",
            "0.960923",
            "1.0",
            "1.1dev1",
            "1.1_",
            "1.1a1",
            "1.1.0dev1",
            "1.1.a1",
            "1.1.0rc1",
            "1.1.0",
            "1.1.0post1",
            "1.1post1",
            "1996.07.12",
            "1!0.4.1",
            "1!3.1.1.6",
            "2!0.4.1",
        ];
        for (a, b) in order.iter().zip(order.iter().skip(1)) {
            assert!(
                version(a) < version(b),
                "expected {a} < {b}, got {:?}",
                version(a).cmp(&version(b))
            );
        }
    }

    #[rstest]
    #[case("1.1", "1.1.0")]
    #[case("1.1", "1.1.0.0")]
    #[case("0.4.1.RC", "0.4.1.rc")]
    #[case("1.1.dev1", "1.1.0dev1")]
    #[case("1.1.0post1", "1.1.Post1.0")]
    #[case("1_2", "1.2")]
    #[case("1-2", "1.2")]
    #[case("2022.1_1", "2022.1.1")]
    #[case("1.2_3rc", "1.2.3rc")]
    fn test_equality(#[case] a: &str, #[case] b: &str) {
        assert_eq!(version(a), version(b));
        assert_eq!(version(a).cmp(&version(b)), Ordering::Equal);
    }

    #[test]
    fn test_trailing_underscore_keeps_its_segment() {
        // `1.1_` must not become `1.1.<empty>`; the underscore stays a
        // string component of the last segment.
        assert!(version("1.1dev1") < version("1.1_"));
        assert!(version("1.1_") < version("1.1a1"));
        assert!(Version::from_str("1.._").is_err());
    }

    #[test]
    fn test_local_version() {
        assert!(version("1.2+0").has_local());
        assert!(!version("1.2").has_local());
        assert!(version("1.2") < version("1.2+0.1"));
        assert!(version("1.2+1") < version("1.2+2"));
        assert_eq!(version("1.2+0"), version("1.2+0.0"));
    }

    #[test]
    fn test_major_minor() {
        assert_eq!(version("3.11.4").as_major_minor(), Some((3, 11)));
        assert_eq!(version("3.11").as_major_minor(), Some((3, 11)));
        assert_eq!(version("3").as_major_minor(), None);
        assert_eq!(version("3.1a").as_major_minor(), None);
    }

    #[rstest]
    #[case("1.2.3", "1.2", true)]
    #[case("1.2", "1.2", true)]
    #[case("1.21", "1.2", false)]
    #[case("1.2.3", "1.2.3.4", false)]
    #[case("2.2", "1.2", false)]
    #[case("1!1.2.3", "1.2", false)]
    #[case("1.2rc1", "1.2", true)]
    fn test_starts_with(#[case] v: &str, #[case] prefix: &str, #[case] expected: bool) {
        assert_eq!(version(v).starts_with(&version(prefix)), expected);
    }

    #[rstest]
    #[case("1.2.3", "1.2", true)]
    #[case("1.9", "1.2", true)]
    #[case("2.0", "1.2", false)]
    #[case("1.1", "1.2", false)]
    fn test_compatible_with(#[case] v: &str, #[case] other: &str, #[case] expected: bool) {
        assert_eq!(version(v).compatible_with(&version(other)), expected);
    }

    #[test]
    fn test_roundtrip() {
        for s in ["1.2.3", "1!2.15.1_alpha", "0.4.1.rc", "1.2+local.4"] {
            let v = version(s);
            assert_eq!(format!("{v}"), s);
            assert_eq!(version(&format!("{v}")), v);
        }
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(Version::from_str(""), Err(ParseVersionError::Empty));
        assert_eq!(
            Version::from_str("1..2"),
            Err(ParseVersionError::EmptySegment)
        );
        assert_eq!(
            Version::from_str("x!1.2"),
            Err(ParseVersionError::EpochNotANumber)
        );
        assert_eq!(
            Version::from_str("1.2+a+b"),
            Err(ParseVersionError::DuplicateLocalSeparator)
        );
        assert_eq!(
            Version::from_str("1.2#3"),
            Err(ParseVersionError::InvalidCharacter('#'))
        );
    }

    #[test]
    fn test_serde() {
        let v: Version = serde_json::from_str("\"1.2.3\"").unwrap();
        assert_eq!(v, version("1.2.3"));
        assert_eq!(serde_json::to_string(&v).unwrap(), "\"1.2.3\"");
    }
}
