//! Deriving the ordered plan that turns the current prefix state into the
//! desired one.

use std::collections::{HashMap, HashSet};

use taipan_conda_types::{
    topological_sort, PackageRecord, Platform, PrefixRecord, RepoDataRecord,
};

use crate::install::python::{PythonInfo, PythonInfoError};

/// An error constructing a transaction.
#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    /// The python version of the environment could not be interpreted.
    #[error(transparent)]
    PythonInfoError(#[from] PythonInfoError),
}

/// One step of a transaction.
#[derive(Debug, Clone)]
pub enum TransactionOperation<Old, New> {
    /// Link a package that is not currently installed.
    Install(New),

    /// Replace an installed package by another build or version. Covers
    /// upgrades, downgrades and cross-channel changes.
    Change {
        /// The installed package to unlink.
        old: Old,
        /// The package to link in its place.
        new: New,
    },

    /// Unlink and relink the same package. Emitted when the environment's
    /// Python minor version changes (all `noarch: python` packages must be
    /// relinked) or when a reinstall is forced.
    Reinstall(Old),

    /// Unlink an installed package.
    Remove(Old),
}

impl<Old: AsRef<New>, New> TransactionOperation<Old, New> {
    /// The record that ends up linked by this operation, if any.
    pub fn record_to_install(&self) -> Option<&New> {
        match self {
            TransactionOperation::Install(new) => Some(new),
            TransactionOperation::Change { new, .. } => Some(new),
            TransactionOperation::Reinstall(old) => Some(old.as_ref()),
            TransactionOperation::Remove(_) => None,
        }
    }
}

impl<Old, New> TransactionOperation<Old, New> {
    /// The installed record removed by this operation, if any.
    pub fn record_to_remove(&self) -> Option<&Old> {
        match self {
            TransactionOperation::Install(_) => None,
            TransactionOperation::Change { old, .. } => Some(old),
            TransactionOperation::Reinstall(old) => Some(old),
            TransactionOperation::Remove(old) => Some(old),
        }
    }
}

/// The ordered plan that brings a prefix from its current state to the
/// desired state: unlinks first (dependents before dependencies), then
/// links in dependency order.
pub struct Transaction<Old, New> {
    /// The operations, in execution order.
    pub operations: Vec<TransactionOperation<Old, New>>,

    /// The python of the desired state, if the environment contains one.
    pub python_info: Option<PythonInfo>,

    /// The platform of the prefix.
    pub platform: Platform,
}

impl Transaction<PrefixRecord, RepoDataRecord> {
    /// Derives a transaction by diffing the installed state against the
    /// desired records. `force_reinstall` names packages that are relinked
    /// even when their desired record equals the installed one.
    pub fn from_current_and_desired(
        current: Vec<PrefixRecord>,
        desired: Vec<RepoDataRecord>,
        force_reinstall: &HashSet<String>,
        platform: Platform,
    ) -> Result<Self, TransactionError> {
        let current_python = find_python_info(current.iter().map(AsRef::as_ref), platform)?;
        let desired_python = find_python_info(desired.iter().map(AsRef::as_ref), platform)?;
        let needs_python_relink = match (&current_python, &desired_python) {
            (Some(current), Some(desired)) => desired.is_relink_required(current),
            _ => false,
        };

        // Topological order of the desired state drives the link order;
        // unlinks happen in the reverse order of the installed state.
        let current = topological_sort(current);
        let desired = topological_sort(desired);

        let mut desired_by_name: HashMap<String, RepoDataRecord> = desired
            .iter()
            .map(|record| (record.package_record.name.clone(), record.clone()))
            .collect();

        let mut removals = Vec::new();
        let mut changes: HashMap<String, TransactionOperation<PrefixRecord, RepoDataRecord>> =
            HashMap::new();
        for installed in current.into_iter().rev() {
            let package_record: &PackageRecord = installed.as_ref();
            let name = package_record.name.clone();
            match desired_by_name.remove(&name) {
                None => removals.push(TransactionOperation::Remove(installed)),
                Some(desired_record) => {
                    if &desired_record.package_record != package_record {
                        changes.insert(
                            name,
                            TransactionOperation::Change {
                                old: installed,
                                new: desired_record,
                            },
                        );
                    } else if force_reinstall.contains(&name)
                        || (package_record.noarch.is_python() && needs_python_relink)
                    {
                        changes.insert(name, TransactionOperation::Reinstall(installed));
                    }
                }
            }
        }

        // Unlinks first, then every link in dependency order.
        let mut operations = removals;
        for record in desired {
            let name = &record.package_record.name;
            if let Some(operation) = changes.remove(name) {
                operations.push(operation);
            } else if desired_by_name.contains_key(name) {
                operations.push(TransactionOperation::Install(record));
            }
        }

        Ok(Self {
            operations,
            python_info: desired_python,
            platform,
        })
    }
}

impl<Old: AsRef<New>, New> Transaction<Old, New> {
    /// The full set of records that will be linked, independent of whether
    /// each one still needs to be downloaded.
    pub fn records_to_link(&self) -> impl Iterator<Item = &New> {
        self.operations
            .iter()
            .filter_map(TransactionOperation::record_to_install)
    }

    /// The installed records that will be unlinked.
    pub fn records_to_remove(&self) -> impl Iterator<Item = &Old> {
        self.operations
            .iter()
            .filter_map(TransactionOperation::record_to_remove)
    }

    /// Returns true if the transaction changes nothing.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Finds the python record of a record set and derives its
/// [`PythonInfo`].
fn find_python_info<'a>(
    records: impl IntoIterator<Item = &'a PackageRecord>,
    platform: Platform,
) -> Result<Option<PythonInfo>, PythonInfoError> {
    records
        .into_iter()
        .find(|record| record.name == "python")
        .map(|record| PythonInfo::from_python_record(record, platform))
        .transpose()
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;

    use url::Url;

    use taipan_conda_types::{
        NoArchType, PackageRecord, Platform, PrefixPaths, PrefixRecord, RepoDataRecord,
    };

    use super::{Transaction, TransactionOperation};

    fn repodata_record(name: &str, version: &str, depends: &[&str]) -> RepoDataRecord {
        let mut package_record =
            PackageRecord::new(name.to_owned(), version.parse().unwrap(), "0".to_owned());
        package_record.depends = depends.iter().map(|s| (*s).to_owned()).collect();
        RepoDataRecord {
            file_name: format!("{name}-{version}-0.tar.bz2"),
            url: Url::parse(&format!("https://example.com/{name}-{version}-0.tar.bz2")).unwrap(),
            channel: "https://example.com".to_owned(),
            package_record,
        }
    }

    fn prefix_record(name: &str, version: &str, depends: &[&str]) -> PrefixRecord {
        PrefixRecord::from_repodata_record(
            repodata_record(name, version, depends),
            PrefixPaths::default(),
            None,
            None,
        )
    }

    #[test]
    fn test_empty_diff() {
        let transaction = Transaction::from_current_and_desired(
            vec![prefix_record("python", "3.11.4", &[])],
            vec![repodata_record("python", "3.11.4", &[])],
            &HashSet::new(),
            Platform::Linux64,
        )
        .unwrap();
        assert!(transaction.is_empty());
        assert!(transaction.python_info.is_some());
    }

    #[test]
    fn test_install_in_dependency_order() {
        let transaction = Transaction::from_current_and_desired(
            Vec::new(),
            vec![
                repodata_record("numpy", "1.24", &["python"]),
                repodata_record("python", "3.11.4", &[]),
            ],
            &HashSet::new(),
            Platform::Linux64,
        )
        .unwrap();

        let names: Vec<&str> = transaction
            .records_to_link()
            .map(|record| record.package_record.name.as_str())
            .collect();
        assert_eq!(names, vec!["python", "numpy"]);
    }

    #[test]
    fn test_change_and_remove() {
        let transaction = Transaction::from_current_and_desired(
            vec![
                prefix_record("python", "3.10.0", &[]),
                prefix_record("obsolete", "1.0", &[]),
            ],
            vec![repodata_record("python", "3.11.4", &[])],
            &HashSet::new(),
            Platform::Linux64,
        )
        .unwrap();

        assert_eq!(transaction.operations.len(), 2);
        assert!(matches!(
            transaction.operations[0],
            TransactionOperation::Remove(_)
        ));
        assert!(matches!(
            transaction.operations[1],
            TransactionOperation::Change { .. }
        ));
    }

    #[test]
    fn test_python_minor_change_relinks_noarch() {
        let mut noarch = prefix_record("six", "1.16.0", &["python"]);
        noarch.repodata_record.package_record.noarch = NoArchType::python();
        let mut desired_six = repodata_record("six", "1.16.0", &["python"]);
        desired_six.package_record.noarch = NoArchType::python();

        let transaction = Transaction::from_current_and_desired(
            vec![prefix_record("python", "3.10.0", &[]), noarch],
            vec![repodata_record("python", "3.11.4", &[]), desired_six],
            &HashSet::new(),
            Platform::Linux64,
        )
        .unwrap();

        let reinstalls: Vec<&str> = transaction
            .operations
            .iter()
            .filter_map(|op| match op {
                TransactionOperation::Reinstall(old) => {
                    Some(old.repodata_record.package_record.name.as_str())
                }
                _ => None,
            })
            .collect();
        assert_eq!(reinstalls, vec!["six"]);
    }

    #[test]
    fn test_force_reinstall() {
        let transaction = Transaction::from_current_and_desired(
            vec![prefix_record("foo", "1.0", &[])],
            vec![repodata_record("foo", "1.0", &[])],
            &HashSet::from(["foo".to_owned()]),
            Platform::Linux64,
        )
        .unwrap();
        assert!(matches!(
            transaction.operations[0],
            TransactionOperation::Reinstall(_)
        ));
    }
}
