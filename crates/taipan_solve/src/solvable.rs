use std::fmt::{Display, Formatter};

use taipan_conda_types::RepoDataRecord;

use crate::id::{NameId, RepoId, SpecId};

/// A package candidate indexed in a pool, with its dependency specs
/// interned.
pub struct PackageSolvable {
    pub(crate) repo_id: RepoId,
    pub(crate) name: NameId,
    pub(crate) dependencies: Vec<SpecId>,
    pub(crate) constrains: Vec<SpecId>,
    /// The record this solvable was created from, kept for round-tripping
    /// solver results back into transaction steps.
    pub record: RepoDataRecord,
}

impl PackageSolvable {
    /// The repo this solvable belongs to.
    pub fn repo_id(&self) -> RepoId {
        self.repo_id
    }

    /// The interned name of the package.
    pub fn name_id(&self) -> NameId {
        self.name
    }
}

pub(crate) enum SolvableInner {
    /// The synthetic root: its "dependencies" are the install jobs.
    Root(Vec<SpecId>),
    Package(PackageSolvable),
}

pub(crate) struct Solvable {
    pub(crate) inner: SolvableInner,
}

impl Solvable {
    pub(crate) fn new_root() -> Self {
        Self {
            inner: SolvableInner::Root(Vec::new()),
        }
    }

    pub(crate) fn new_package(
        repo_id: RepoId,
        name: NameId,
        record: RepoDataRecord,
        dependencies: Vec<SpecId>,
        constrains: Vec<SpecId>,
    ) -> Self {
        Self {
            inner: SolvableInner::Package(PackageSolvable {
                repo_id,
                name,
                dependencies,
                constrains,
                record,
            }),
        }
    }

    pub(crate) fn get_package(&self) -> Option<&PackageSolvable> {
        match &self.inner {
            SolvableInner::Root(_) => None,
            SolvableInner::Package(package) => Some(package),
        }
    }

    pub(crate) fn package(&self) -> &PackageSolvable {
        self.get_package().expect("unexpected root solvable")
    }

    pub(crate) fn root_mut(&mut self) -> &mut Vec<SpecId> {
        match &mut self.inner {
            SolvableInner::Root(specs) => specs,
            SolvableInner::Package(_) => panic!("unexpected package solvable"),
        }
    }

    pub(crate) fn display(&self) -> SolvableDisplay<'_> {
        SolvableDisplay { solvable: self }
    }
}

pub(crate) struct SolvableDisplay<'a> {
    solvable: &'a Solvable,
}

impl Display for SolvableDisplay<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.solvable.inner {
            SolvableInner::Root(_) => write!(f, "<root>"),
            SolvableInner::Package(package) => {
                let record = &package.record.package_record;
                write!(f, "{} {} {}", record.name, record.version, record.build)
            }
        }
    }
}
