#![deny(missing_docs)]

//! `taipan_conda_types` contains data models for working with conda packages,
//! channels and environments: versions and version constraints, match specs,
//! repodata, installed-prefix records and the environment history file.

mod channel;
mod explicit_spec;
mod history;
mod match_spec;
mod no_arch_type;
pub mod package;
mod package_record;
mod platform;
mod prefix_data;
pub mod prefix_record;
mod repo_data;
mod topological_sort;
mod utils;
mod version;
mod version_spec;

pub use channel::{Channel, ChannelConfig, ParseChannelError};
pub use explicit_spec::{
    ExplicitEnvironmentSpec, ExplicitSpec, PackageChecksum, ParseExplicitSpecError,
};
pub use history::{History, HistoryError, HistoryRevision, ParsedHistory, Revision, UserRequest};
pub use match_spec::{MatchSpec, Matches, ParseMatchSpecError, StringMatcher};
pub use no_arch_type::NoArchType;
pub use package_record::{PackageRecord, RepoDataRecord};
pub use platform::{ParsePlatformError, Platform};
pub use prefix_data::PrefixData;
pub use prefix_record::{Link, LinkType, PathType, PathsEntry, PrefixPaths, PrefixRecord};
pub use repo_data::{ChannelInfo, ConvertSubdirError, RepoData};
pub use topological_sort::topological_sort;
pub use version::{ParseVersionError, Version};
pub use version_spec::{LogicalOperator, ParseVersionSpecError, VersionOperator, VersionSpec};
