use std::cmp::Ordering;
use std::str::FromStr;

use ahash::AHashMap;
use url::Url;

use taipan_conda_types::{MatchSpec, Matches, ParseMatchSpecError, RepoDataRecord};

use crate::{
    id::{NameId, RepoId, SolvableId, SpecId},
    solvable::{PackageSolvable, Solvable},
    sorting,
};

/// A named group of solvables, usually bound to one channel subdirectory.
#[derive(Debug, Clone)]
pub struct Repo {
    /// The name of the repo, e.g. the canonical channel name.
    pub name: String,
    /// The url of the subdirectory this repo was filled from, if any.
    pub url: Option<Url>,
    /// The priority of the repo. Under strict channel priority, candidates
    /// from lower priority repos are shadowed by higher priority ones.
    pub priority: i32,
    /// Breaks ties between repos with equal priority.
    pub subpriority: i32,
}

/// The in-memory package index shared by the solver and the transaction
/// builder.
///
/// A pool interns package names and dependency specs to integer ids, owns
/// the solvables of all registered repos, and maintains the "what provides"
/// index: for every interned spec, the ordered list of solvables that
/// satisfy it. The index must be (re)built with
/// [`Pool::create_whatprovides`] after solvables are added and before
/// solving.
pub struct Pool {
    pub(crate) solvables: Vec<Solvable>,
    repos: Vec<Repo>,
    installed_repo: Option<RepoId>,

    names: Vec<String>,
    names_to_ids: AHashMap<String, NameId>,
    /// All solvables sharing an interned name, in insertion order.
    pub(crate) packages_by_name: Vec<Vec<SolvableId>>,

    specs: Vec<MatchSpec>,
    specs_to_ids: AHashMap<String, SpecId>,

    /// The what-provides index: for each spec, the matching solvables in
    /// preference order. `None` entries are computed on demand.
    pub(crate) candidates: Vec<Option<Vec<SolvableId>>>,
    /// For each spec, the solvables with the spec's name that do NOT match
    /// it. Used for `constrains` rules.
    pub(crate) forbidden: Vec<Option<Vec<SolvableId>>>,

    whatprovides_ready: bool,
    strict_repo_priority: bool,
}

impl Default for Pool {
    fn default() -> Self {
        Self {
            solvables: vec![Solvable::new_root()],
            repos: Vec::new(),
            installed_repo: None,
            names: Vec::new(),
            names_to_ids: AHashMap::new(),
            packages_by_name: Vec::new(),
            specs: Vec::new(),
            specs_to_ids: AHashMap::new(),
            candidates: Vec::new(),
            forbidden: Vec::new(),
            whatprovides_ready: false,
            strict_repo_priority: false,
        }
    }
}

impl Pool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new repo with the given priority.
    pub fn add_repo(&mut self, name: impl Into<String>, priority: i32) -> RepoId {
        let id = RepoId::new(self.repos.len());
        self.repos.push(Repo {
            name: name.into(),
            url: None,
            priority,
            subpriority: 0,
        });
        id
    }

    /// Returns the repo with the given id.
    pub fn repo(&self, id: RepoId) -> &Repo {
        &self.repos[id.index()]
    }

    /// Returns a mutable reference to the repo with the given id.
    pub fn repo_mut(&mut self, id: RepoId) -> &mut Repo {
        &mut self.repos[id.index()]
    }

    /// Marks the repo holding the installed packages. Candidates from this
    /// repo are preferred over all channel candidates so that solutions
    /// change the environment as little as possible.
    pub fn set_installed_repo(&mut self, id: RepoId) {
        self.installed_repo = Some(id);
        self.whatprovides_ready = false;
    }

    /// The repo registered as holding the installed packages.
    pub fn installed_repo(&self) -> Option<RepoId> {
        self.installed_repo
    }

    /// Adds a package to a repo, interning its dependency and constrains
    /// specs, and returns its [`SolvableId`].
    pub fn add_solvable(
        &mut self,
        repo_id: RepoId,
        record: RepoDataRecord,
    ) -> Result<SolvableId, ParseMatchSpecError> {
        assert!(self.solvables.len() < u32::MAX as usize);

        let dependencies = record
            .package_record
            .depends
            .clone()
            .into_iter()
            .map(|spec| self.intern_spec(&spec))
            .collect::<Result<Vec<_>, _>>()?;
        let constrains = record
            .package_record
            .constrains
            .clone()
            .into_iter()
            .map(|spec| self.intern_spec(&spec))
            .collect::<Result<Vec<_>, _>>()?;

        let name = self.intern_name(&record.package_record.name);
        let solvable_id = SolvableId::new(self.solvables.len());
        self.solvables.push(Solvable::new_package(
            repo_id,
            name,
            record,
            dependencies,
            constrains,
        ));
        self.packages_by_name[name.index()].push(solvable_id);

        // The what-provides index no longer covers every solvable.
        self.whatprovides_ready = false;

        Ok(solvable_id)
    }

    /// Returns the solvables of the given repo, in insertion order.
    pub fn repo_solvables(&self, repo_id: RepoId) -> Vec<SolvableId> {
        self.solvables
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, solvable)| {
                solvable
                    .get_package()
                    .map_or(false, |package| package.repo_id == repo_id)
            })
            .map(|(index, _)| SolvableId::new(index))
            .collect()
    }

    /// Interns a package name.
    pub fn intern_name(&mut self, name: &str) -> NameId {
        match self.names_to_ids.get(name) {
            Some(&id) => id,
            None => {
                let id = NameId::new(self.names.len());
                self.names.push(name.to_owned());
                self.packages_by_name.push(Vec::new());
                self.names_to_ids.insert(name.to_owned(), id);
                id
            }
        }
    }

    /// Returns the id of an already interned package name.
    pub fn lookup_name(&self, name: &str) -> Option<NameId> {
        self.names_to_ids.get(name).copied()
    }

    /// Returns the string for an interned name id.
    pub fn resolve_name(&self, id: NameId) -> &str {
        &self.names[id.index()]
    }

    /// Interns a dependency spec, parsing it on first use. The canonical
    /// string of the spec is used as the interning key.
    pub fn intern_spec(&mut self, spec: &str) -> Result<SpecId, ParseMatchSpecError> {
        if let Some(&id) = self.specs_to_ids.get(spec) {
            return Ok(id);
        }
        let parsed = MatchSpec::from_str(spec)?;
        let id = SpecId::new(self.specs.len());
        self.specs.push(parsed);
        self.candidates.push(None);
        self.forbidden.push(None);
        self.specs_to_ids.insert(spec.to_owned(), id);
        Ok(id)
    }

    /// Interns an already parsed spec.
    pub fn intern_match_spec(&mut self, spec: MatchSpec) -> SpecId {
        let key = spec.to_string();
        if let Some(&id) = self.specs_to_ids.get(&key) {
            return id;
        }
        let id = SpecId::new(self.specs.len());
        self.specs.push(spec);
        self.candidates.push(None);
        self.forbidden.push(None);
        self.specs_to_ids.insert(key, id);
        id
    }

    /// Returns the spec for an interned id.
    pub fn resolve_spec(&self, id: SpecId) -> &MatchSpec {
        &self.specs[id.index()]
    }

    /// Returns the solvable for an id. Panics for the root solvable.
    pub fn resolve_solvable(&self, id: SolvableId) -> &PackageSolvable {
        self.solvables[id.index()].package()
    }

    pub(crate) fn resolve_solvable_inner(&self, id: SolvableId) -> &Solvable {
        &self.solvables[id.index()]
    }

    pub(crate) fn root_solvable_mut(&mut self) -> &mut Vec<SpecId> {
        self.solvables[0].root_mut()
    }

    /// The number of solvables, including the root.
    pub fn solvable_count(&self) -> usize {
        self.solvables.len()
    }

    /// (Re)builds the what-provides index: clears all memoized candidate
    /// lists and records the candidate ordering policy. Must be called
    /// after adding solvables and before solving.
    pub fn create_whatprovides(&mut self, strict_repo_priority: bool) {
        for entry in &mut self.candidates {
            *entry = None;
        }
        for entry in &mut self.forbidden {
            *entry = None;
        }
        self.strict_repo_priority = strict_repo_priority;
        self.whatprovides_ready = true;
    }

    /// Returns true if the what-provides index covers every solvable.
    pub fn whatprovides_ready(&self) -> bool {
        self.whatprovides_ready
    }

    /// The effective priority of a repo: the installed repo always ranks
    /// above every channel repo.
    fn repo_rank(&self, repo_id: RepoId) -> (i32, i32, i32) {
        let installed = if Some(repo_id) == self.installed_repo {
            1
        } else {
            0
        };
        let repo = &self.repos[repo_id.index()];
        (installed, repo.priority, repo.subpriority)
    }

    /// Returns the ordered candidates for a spec, computing and memoizing
    /// them on first use.
    pub fn spec_candidates(&mut self, spec_id: SpecId) -> &[SolvableId] {
        debug_assert!(self.whatprovides_ready, "what-provides index is stale");
        if self.candidates[spec_id.index()].is_none() {
            let computed = self.compute_candidates(spec_id);
            self.candidates[spec_id.index()] = Some(computed);
        }
        self.candidates[spec_id.index()]
            .as_deref()
            .expect("candidates were just computed")
    }

    fn compute_candidates(&self, spec_id: SpecId) -> Vec<SolvableId> {
        let spec = &self.specs[spec_id.index()];
        let Some(name_id) = spec
            .name
            .as_deref()
            .and_then(|name| self.names_to_ids.get(name))
        else {
            return Vec::new();
        };

        let mut candidates: Vec<SolvableId> = self.packages_by_name[name_id.index()]
            .iter()
            .copied()
            .filter(|&id| self.solvables[id.index()].package().record.matches(spec))
            .collect();

        // Under strict channel priority only the best repo that has any
        // candidate survives.
        if self.strict_repo_priority {
            if let Some(best) = candidates
                .iter()
                .map(|&id| self.repo_rank(self.solvables[id.index()].package().repo_id))
                .max()
            {
                candidates.retain(|&id| {
                    self.repo_rank(self.solvables[id.index()].package().repo_id) == best
                });
            }
        }

        candidates.sort_by(|&a, &b| {
            let a_package = self.solvables[a.index()].package();
            let b_package = self.solvables[b.index()].package();
            self.repo_rank(b_package.repo_id)
                .cmp(&self.repo_rank(a_package.repo_id))
                .then_with(|| {
                    sorting::compare_candidates(
                        &a_package.record.package_record,
                        &b_package.record.package_record,
                    )
                })
                .then_with(|| a.cmp(&b))
        });
        candidates
    }

    /// Returns the solvables that share the spec's name but do not match
    /// the spec. These are the packages a `constrains` forbids.
    pub fn spec_forbidden(&mut self, spec_id: SpecId) -> &[SolvableId] {
        debug_assert!(self.whatprovides_ready, "what-provides index is stale");
        if self.forbidden[spec_id.index()].is_none() {
            let spec = &self.specs[spec_id.index()];
            let computed = match spec
                .name
                .as_deref()
                .and_then(|name| self.names_to_ids.get(name))
            {
                Some(name_id) => self.packages_by_name[name_id.index()]
                    .iter()
                    .copied()
                    .filter(|&id| !self.solvables[id.index()].package().record.matches(spec))
                    .collect(),
                None => Vec::new(),
            };
            self.forbidden[spec_id.index()] = Some(computed);
        }
        self.forbidden[spec_id.index()]
            .as_deref()
            .expect("forbidden set was just computed")
    }

    /// Removes a repo and all of its solvables from the pool. Interned
    /// names and specs are kept; solvable ids are not reused.
    pub fn remove_repo(&mut self, repo_id: RepoId) {
        let solvables = &self.solvables;
        for candidates in &mut self.packages_by_name {
            candidates.retain(|&id| {
                solvables[id.index()]
                    .get_package()
                    .map_or(true, |package| package.repo_id != repo_id)
            });
        }
        // The solvable entries stay allocated so ids remain stable, but
        // they are no longer reachable through the name index.
        self.whatprovides_ready = false;
    }

    /// Orders two solvables by candidate preference. Exposed for tests and
    /// diagnostics.
    pub fn compare_solvables(&self, a: SolvableId, b: SolvableId) -> Ordering {
        sorting::compare_candidates(
            &self.solvables[a.index()].package().record.package_record,
            &self.solvables[b.index()].package().record.package_record,
        )
    }
}
