//! Installing packages from explicit urls, bypassing the solver.

use url::Url;

use taipan_conda_types::{
    ExplicitSpec, PackageChecksum, PackageRecord, RepoDataRecord,
};
use taipan_package_streaming::ArchiveIdentifier;

/// An error turning explicit specs into records.
#[derive(Debug, thiserror::Error)]
pub enum ExplicitError {
    /// The url does not end in a conda archive file name.
    #[error("'{0}' does not point to a conda package archive")]
    NotAnArchive(Url),

    /// The version in the archive name is invalid.
    #[error("invalid version in '{0}'")]
    InvalidVersion(String),
}

/// Builds installable records from explicit package urls. The record
/// carries exactly the information the url encodes: identity from the
/// archive name, subdir and channel from the path, and the checksum from
/// the fragment; the fetch pipeline verifies the checksum like any other
/// download.
pub fn records_from_explicit_specs(
    specs: &[ExplicitSpec],
) -> Result<Vec<RepoDataRecord>, ExplicitError> {
    specs
        .iter()
        .map(|spec| {
            let file_name = spec
                .file_name()
                .ok_or_else(|| ExplicitError::NotAnArchive(spec.url.clone()))?
                .to_owned();
            let identifier = ArchiveIdentifier::try_from_file_name(&file_name)
                .ok_or_else(|| ExplicitError::NotAnArchive(spec.url.clone()))?;

            let mut package_record = PackageRecord::new(
                identifier.name,
                identifier
                    .version
                    .parse()
                    .map_err(|_| ExplicitError::InvalidVersion(file_name.clone()))?,
                identifier.build_string,
            );

            // The parent path segments carry the subdir and the channel.
            let mut segments: Vec<&str> = spec
                .url
                .path_segments()
                .into_iter()
                .flatten()
                .filter(|segment| !segment.is_empty())
                .collect();
            segments.pop();
            if let Some(subdir) = segments.last() {
                package_record.subdir = (*subdir).to_owned();
            }

            match &spec.checksum {
                Some(PackageChecksum::Md5(digest)) => package_record.md5 = Some(*digest),
                Some(PackageChecksum::Sha256(digest)) => package_record.sha256 = Some(*digest),
                None => {}
            }

            let mut channel_url = spec.url.clone();
            if let Ok(mut path_segments) = channel_url.path_segments_mut() {
                path_segments.pop().pop();
            }

            Ok(RepoDataRecord {
                package_record,
                file_name,
                url: spec.url.clone(),
                channel: channel_url.as_str().trim_end_matches('/').to_owned(),
            })
        })
        .collect()
}
