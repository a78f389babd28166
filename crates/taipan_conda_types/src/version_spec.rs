use std::{fmt, fmt::Display, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::version::{ParseVersionError, Version};

/// A relational operator in a version constraint.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum VersionOperator {
    Equals,
    NotEquals,
    Greater,
    GreaterEquals,
    Less,
    LessEquals,
    /// `=1.2` / `1.2.*`: the version starts with the given segments.
    StartsWith,
    /// `!=1.2.*`: the version does not start with the given segments.
    NotStartsWith,
    /// `~=1.2`: compatible release, at least the given version and within
    /// its second-to-last segment.
    Compatible,
}

/// The operator joining the members of a [`VersionSpec::Group`].
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum LogicalOperator {
    And,
    Or,
}

/// A boolean combination of relational constraints over [`Version`]s, parsed
/// from strings like `>=1.8,<2|==1.6.1`. `,` binds tighter than `|`.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum VersionSpec {
    /// Matches any version (`*`).
    Any,
    /// A single relational constraint.
    Range(VersionOperator, Version),
    /// A conjunction or disjunction of sub-constraints.
    Group(LogicalOperator, Vec<VersionSpec>),
}

impl VersionSpec {
    /// Returns whether the given version satisfies this constraint.
    pub fn matches(&self, version: &Version) -> bool {
        match self {
            VersionSpec::Any => true,
            VersionSpec::Range(op, bound) => match op {
                VersionOperator::Equals => version == bound,
                VersionOperator::NotEquals => version != bound,
                VersionOperator::Greater => version > bound,
                VersionOperator::GreaterEquals => version >= bound,
                VersionOperator::Less => version < bound,
                VersionOperator::LessEquals => version <= bound,
                VersionOperator::StartsWith => version.starts_with(bound),
                VersionOperator::NotStartsWith => !version.starts_with(bound),
                VersionOperator::Compatible => version.compatible_with(bound),
            },
            VersionSpec::Group(LogicalOperator::And, parts) => {
                parts.iter().all(|part| part.matches(version))
            }
            VersionSpec::Group(LogicalOperator::Or, parts) => {
                parts.iter().any(|part| part.matches(version))
            }
        }
    }
}

/// An error that occurred while parsing a version spec.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum ParseVersionSpecError {
    /// The spec (or a part of it) was empty.
    #[error("empty version constraint")]
    Empty,

    /// The version within a constraint could not be parsed.
    #[error("invalid version: {0}")]
    InvalidVersion(#[from] ParseVersionError),

    /// A glob `*` appeared anywhere but at the end of a version.
    #[error("glob is only supported at the end of a version ('{0}')")]
    InvalidGlob(String),

    /// An operator without a version, e.g. `>=`.
    #[error("operator without a version")]
    MissingVersion,
}

/// Parses one relational atom, e.g. `>=1.8` or `1.2.*`.
fn parse_atom(atom: &str) -> Result<VersionSpec, ParseVersionSpecError> {
    let atom = atom.trim();
    if atom.is_empty() {
        return Err(ParseVersionSpecError::Empty);
    }
    if atom == "*" {
        return Ok(VersionSpec::Any);
    }

    let (mut op, version_str) = if let Some(rest) = atom.strip_prefix("==") {
        (VersionOperator::Equals, rest)
    } else if let Some(rest) = atom.strip_prefix("!=") {
        (VersionOperator::NotEquals, rest)
    } else if let Some(rest) = atom.strip_prefix(">=") {
        (VersionOperator::GreaterEquals, rest)
    } else if let Some(rest) = atom.strip_prefix("<=") {
        (VersionOperator::LessEquals, rest)
    } else if let Some(rest) = atom.strip_prefix(">") {
        (VersionOperator::Greater, rest)
    } else if let Some(rest) = atom.strip_prefix("<") {
        (VersionOperator::Less, rest)
    } else if let Some(rest) = atom.strip_prefix("~=") {
        (VersionOperator::Compatible, rest)
    } else if let Some(rest) = atom.strip_prefix('=') {
        (VersionOperator::StartsWith, rest)
    } else {
        (VersionOperator::Equals, atom)
    };

    let mut version_str = version_str.trim();
    if version_str.is_empty() {
        return Err(ParseVersionSpecError::MissingVersion);
    }

    // A trailing `.*` or `*` turns an equality into a prefix match.
    if let Some(rest) = version_str
        .strip_suffix(".*")
        .or_else(|| version_str.strip_suffix('*'))
    {
        op = match op {
            VersionOperator::Equals | VersionOperator::StartsWith => VersionOperator::StartsWith,
            VersionOperator::NotEquals => VersionOperator::NotStartsWith,
            // `>=1.8.*` and friends appear in the wild; the glob is
            // meaningless there and is ignored, like conda does.
            op => op,
        };
        version_str = rest;
    }

    if version_str.contains('*') {
        return Err(ParseVersionSpecError::InvalidGlob(atom.to_owned()));
    }

    Ok(VersionSpec::Range(op, Version::from_str(version_str)?))
}

impl FromStr for VersionSpec {
    type Err = ParseVersionSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParseVersionSpecError::Empty);
        }

        let mut or_parts = Vec::new();
        for or_part in s.split('|') {
            let mut and_parts = Vec::new();
            for atom in or_part.split(',') {
                and_parts.push(parse_atom(atom)?);
            }
            or_parts.push(match and_parts.len() {
                1 => and_parts.pop().expect("group contains an element"),
                _ => VersionSpec::Group(LogicalOperator::And, and_parts),
            });
        }

        Ok(match or_parts.len() {
            1 => or_parts.pop().expect("group contains an element"),
            _ => VersionSpec::Group(LogicalOperator::Or, or_parts),
        })
    }
}

impl Display for VersionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionSpec::Any => write!(f, "*"),
            VersionSpec::Range(op, version) => match op {
                VersionOperator::Equals => write!(f, "=={version}"),
                VersionOperator::NotEquals => write!(f, "!={version}"),
                VersionOperator::Greater => write!(f, ">{version}"),
                VersionOperator::GreaterEquals => write!(f, ">={version}"),
                VersionOperator::Less => write!(f, "<{version}"),
                VersionOperator::LessEquals => write!(f, "<={version}"),
                VersionOperator::StartsWith => write!(f, "{version}.*"),
                VersionOperator::NotStartsWith => write!(f, "!={version}.*"),
                VersionOperator::Compatible => write!(f, "~={version}"),
            },
            VersionSpec::Group(op, parts) => {
                let separator = match op {
                    LogicalOperator::And => ",",
                    LogicalOperator::Or => "|",
                };
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(f, "{separator}")?;
                    }
                    write!(f, "{part}")?;
                }
                Ok(())
            }
        }
    }
}

impl Serialize for VersionSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for VersionSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let str = String::deserialize(deserializer)?;
        str.parse().map_err(serde::de::Error::custom)
    }
}
