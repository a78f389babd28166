//! Building solver jobs from user specs and installed state.

use taipan_conda_types::{
    MatchSpec, PrefixData, VersionOperator, VersionSpec,
};
use taipan_solve::{SolveJobs, SolverFlags};

/// Builds the solver job list from the user's specs.
///
/// Beyond translating the spec lists one to one, this applies the python
/// pinning rule: when python is already installed and none of the specs
/// name it, a pin to the installed `major.minor` is added so a routine
/// install cannot silently jump to another minor version. An explicit
/// `python` spec always wins over the pin.
pub fn prepare_jobs(
    install_specs: &[MatchSpec],
    remove_specs: &[MatchSpec],
    update_specs: &[MatchSpec],
    prefix_data: &PrefixData,
    flags: SolverFlags,
) -> SolveJobs {
    let mut jobs = SolveJobs::new(flags);

    for spec in install_specs {
        jobs.install(spec.clone());
    }
    for spec in remove_specs {
        jobs.remove(spec.clone());
    }
    for spec in update_specs {
        jobs.update(spec.clone());
    }

    let user_names_python = install_specs
        .iter()
        .chain(remove_specs)
        .chain(update_specs)
        .any(|spec| spec.name.as_deref() == Some("python"));
    if !user_names_python {
        if let Some(python) = prefix_data.python_record() {
            let version = &python.repodata_record.package_record.version;
            if let Some((major, minor)) = version.as_major_minor() {
                let pin = MatchSpec {
                    name: Some("python".to_owned()),
                    version: Some(VersionSpec::Range(
                        VersionOperator::StartsWith,
                        format!("{major}.{minor}")
                            .parse()
                            .expect("major.minor is a valid version"),
                    )),
                    ..MatchSpec::default()
                };
                tracing::debug!("pinning python to {pin}");
                jobs.install(pin);
            }
        }
    }

    jobs
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use taipan_conda_types::{MatchSpec, PrefixData};
    use taipan_solve::{SolveOperation, SolverFlags};

    use super::prepare_jobs;

    fn prefix_with_python(dir: &std::path::Path) -> PrefixData {
        use taipan_conda_types::{PackageRecord, PrefixPaths, PrefixRecord, RepoDataRecord};
        let record = PrefixRecord::from_repodata_record(
            RepoDataRecord {
                package_record: PackageRecord::new(
                    "python".to_owned(),
                    "3.11.4".parse().unwrap(),
                    "h0_0".to_owned(),
                ),
                file_name: "python-3.11.4-h0_0.conda".to_owned(),
                url: url::Url::parse("https://example.com/python-3.11.4-h0_0.conda").unwrap(),
                channel: "https://example.com".to_owned(),
            },
            PrefixPaths::default(),
            None,
            None,
        );
        let conda_meta = dir.join("conda-meta");
        fs_err::create_dir_all(&conda_meta).unwrap();
        record
            .write_to_path(conda_meta.join(record.file_name()))
            .unwrap();
        PrefixData::from_prefix(dir).unwrap()
    }

    #[test]
    fn test_python_is_pinned() {
        let dir = tempfile::tempdir().unwrap();
        let prefix_data = prefix_with_python(dir.path());

        let jobs = prepare_jobs(
            &[MatchSpec::from_str("numpy").unwrap()],
            &[],
            &[],
            &prefix_data,
            SolverFlags::default(),
        );

        let pin = jobs
            .jobs
            .iter()
            .find(|job| job.spec.name.as_deref() == Some("python"))
            .expect("a python pin is added");
        assert_eq!(pin.operation, SolveOperation::Install);
        assert_eq!(pin.spec.to_string(), "python 3.11.*");
    }

    #[test]
    fn test_explicit_python_wins() {
        let dir = tempfile::tempdir().unwrap();
        let prefix_data = prefix_with_python(dir.path());

        let jobs = prepare_jobs(
            &[MatchSpec::from_str("python =3.12").unwrap()],
            &[],
            &[],
            &prefix_data,
            SolverFlags::default(),
        );

        let python_jobs: Vec<_> = jobs
            .jobs
            .iter()
            .filter(|job| job.spec.name.as_deref() == Some("python"))
            .collect();
        assert_eq!(python_jobs.len(), 1);
        assert_eq!(python_jobs[0].spec.to_string(), "python 3.12.*");
    }

    #[test]
    fn test_no_python_no_pin() {
        let dir = tempfile::tempdir().unwrap();
        let prefix_data = PrefixData::from_prefix(dir.path()).unwrap();

        let jobs = prepare_jobs(
            &[MatchSpec::from_str("numpy").unwrap()],
            &[],
            &[],
            &prefix_data,
            SolverFlags::default(),
        );
        assert_eq!(jobs.jobs.len(), 1);
    }
}
