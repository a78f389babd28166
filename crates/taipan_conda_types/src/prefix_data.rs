use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use crate::{
    package_record::PackageRecord, prefix_record::PrefixRecord,
    topological_sort::topological_sort,
};

/// The installed state of an environment prefix: the parsed contents of its
/// `conda-meta/*.json` records, keyed by package name.
///
/// A `PrefixData` is loaded fresh for every top level operation; the
/// transaction that mutates the prefix rewrites the on-disk records and the
/// next operation reloads them.
#[derive(Debug, Default)]
pub struct PrefixData {
    records: HashMap<String, PrefixRecord>,
    prefix_path: PathBuf,
}

impl PrefixData {
    /// Loads the installed packages of the given prefix. A prefix without a
    /// `conda-meta` directory is an empty environment.
    pub fn from_prefix(prefix: &Path) -> Result<Self, std::io::Error> {
        let mut records = HashMap::new();
        for record in PrefixRecord::collect_from_prefix(prefix)? {
            records.insert(record.repodata_record.package_record.name.clone(), record);
        }
        Ok(Self {
            records,
            prefix_path: prefix.to_path_buf(),
        })
    }

    /// The path of the prefix this data was loaded from.
    pub fn prefix_path(&self) -> &Path {
        &self.prefix_path
    }

    /// Returns the record of the given package, if installed.
    pub fn get(&self, name: &str) -> Option<&PrefixRecord> {
        self.records.get(name)
    }

    /// Returns the installed python interpreter record, if any.
    pub fn python_record(&self) -> Option<&PrefixRecord> {
        self.get("python")
    }

    /// The number of installed packages.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if no packages are installed.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Iterates over the installed records in unspecified order.
    pub fn records(&self) -> impl Iterator<Item = &PrefixRecord> {
        self.records.values()
    }

    /// Returns the installed records sorted topologically: every package
    /// after all of its installed dependencies.
    pub fn records_sorted(&self) -> Vec<&PrefixRecord> {
        topological_sort(self.records.values().collect())
    }

    /// Verifies that every dependency of every installed package is
    /// satisfied by some installed package, returning the violations as
    /// `(package, unmet spec)` pairs. Only the package name of each spec is
    /// checked at this level.
    pub fn find_unmet_dependencies(&self) -> Vec<(&PrefixRecord, &str)> {
        let mut unmet = Vec::new();
        for record in self.records.values() {
            let package_record: &PackageRecord = record.as_ref();
            for spec in &package_record.depends {
                let name = spec
                    .split(|c: char| {
                        c.is_whitespace() || matches!(c, '=' | '<' | '>' | '!' | '~')
                    })
                    .next()
                    .unwrap_or_default();
                if !name.is_empty() && !self.records.contains_key(name) {
                    unmet.push((record, spec.as_str()));
                }
            }
        }
        unmet
    }
}

#[cfg(test)]
mod test {
    use url::Url;

    use super::PrefixData;
    use crate::{
        package_record::{PackageRecord, RepoDataRecord},
        prefix_record::{PrefixPaths, PrefixRecord},
    };

    fn write_record(prefix: &std::path::Path, name: &str, depends: &[&str]) {
        let mut package_record =
            PackageRecord::new(name.to_owned(), "1.0".parse().unwrap(), "0".to_owned());
        package_record.depends = depends.iter().map(|s| (*s).to_owned()).collect();
        let record = PrefixRecord::from_repodata_record(
            RepoDataRecord {
                file_name: format!("{name}-1.0-0.tar.bz2"),
                url: Url::parse(&format!("https://example.com/{name}-1.0-0.tar.bz2")).unwrap(),
                channel: "https://example.com".to_owned(),
                package_record,
            },
            PrefixPaths::default(),
            None,
            None,
        );
        let conda_meta = prefix.join("conda-meta");
        fs_err::create_dir_all(&conda_meta).unwrap();
        record
            .write_to_path(conda_meta.join(record.file_name()))
            .unwrap();
    }

    #[test]
    fn test_load_and_sort() {
        let dir = tempfile::tempdir().unwrap();
        write_record(dir.path(), "numpy", &["python"]);
        write_record(dir.path(), "python", &[]);

        let data = PrefixData::from_prefix(dir.path()).unwrap();
        assert_eq!(data.len(), 2);
        assert!(data.python_record().is_some());

        let sorted = data.records_sorted();
        let names: Vec<&str> = sorted
            .iter()
            .map(|r| r.repodata_record.package_record.name.as_str())
            .collect();
        assert_eq!(names, vec!["python", "numpy"]);

        assert!(data.find_unmet_dependencies().is_empty());
    }

    #[test]
    fn test_empty_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let data = PrefixData::from_prefix(dir.path()).unwrap();
        assert!(data.is_empty());
    }

    #[test]
    fn test_unmet_dependencies() {
        let dir = tempfile::tempdir().unwrap();
        write_record(dir.path(), "numpy", &["python >=3.8"]);

        let data = PrefixData::from_prefix(dir.path()).unwrap();
        let unmet = data.find_unmet_dependencies();
        assert_eq!(unmet.len(), 1);
        assert_eq!(unmet[0].1, "python >=3.8");
    }
}
