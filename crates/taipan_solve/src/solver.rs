use std::collections::HashSet;

use taipan_conda_types::{MatchSpec, VersionOperator, VersionSpec};

use crate::{
    id::{RuleId, SolvableId, SpecId},
    jobs::{SolveJobs, SolveOperation, SolverFlags},
    pool::Pool,
    problem::Problem,
    rules::{Rule, RuleKind},
    SolveError,
};

/// Why a solvable was decided.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Derivation {
    /// Propagated from a rule.
    Rule(RuleId),
    /// A free choice made by the search.
    Choice,
    /// The negation of a choice that led to the given conflicting rule.
    Flip(RuleId),
}

#[derive(Debug, Clone, Copy)]
struct Decision {
    solvable: SolvableId,
    value: bool,
    level: u32,
    derived_from: Derivation,
}

/// One entry of the decision queue of a successful solve.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SolveStep {
    /// The solvable must be present in the prefix after the transaction.
    Install(SolvableId),
    /// The installed solvable must be removed from the prefix.
    Remove(SolvableId),
}

/// The output of a successful solve: the decision queue, in decision
/// order. Install steps cover the complete desired state, including
/// installed packages that stay untouched; the transaction builder turns
/// the difference with the current prefix state into link/unlink steps.
#[derive(Debug, Clone, Default)]
pub struct Solution {
    /// The ordered decisions.
    pub steps: Vec<SolveStep>,
}

impl Solution {
    /// The solvables that must be present after the transaction.
    pub fn installs(&self) -> impl Iterator<Item = SolvableId> + '_ {
        self.steps.iter().filter_map(|step| match step {
            SolveStep::Install(id) => Some(*id),
            SolveStep::Remove(_) => None,
        })
    }

    /// The installed solvables that must be removed.
    pub fn removals(&self) -> impl Iterator<Item = SolvableId> + '_ {
        self.steps.iter().filter_map(|step| match step {
            SolveStep::Remove(id) => Some(*id),
            SolveStep::Install(_) => None,
        })
    }
}

/// A SAT-style dependency solver over a [`Pool`].
///
/// The solver owns the pool for the duration of the solve so that the
/// what-provides index can be filled while rules are evaluated. It encodes
/// the jobs into rules, runs unit propagation with chronological
/// backtracking, and returns either a decision queue or the set of rules
/// that cannot be satisfied together.
pub struct Solver {
    pool: Pool,
    pub(crate) rules: Vec<Rule>,
    /// Signed decision level per solvable: 0 undecided, `+level` decided
    /// true, `-level` decided false.
    decision_map: Vec<i64>,
    decisions: Vec<Decision>,
}

impl Solver {
    /// Creates a solver using the provided pool.
    pub fn new(pool: Pool) -> Self {
        Self {
            rules: Vec::new(),
            decision_map: Vec::new(),
            decisions: Vec::new(),
            pool,
        }
    }

    /// The pool the solver operates on.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Consumes the solver, returning the pool.
    pub fn into_pool(self) -> Pool {
        self.pool
    }

    /// Solves the provided jobs. On success the returned [`Solution`]
    /// holds the decision queue; otherwise a [`Problem`] cites the rules
    /// that conflict.
    pub fn solve(&mut self, jobs: SolveJobs) -> Result<Solution, SolveError> {
        // Reset per-run state.
        self.rules = vec![Rule::new(RuleKind::InstallRoot)];
        self.decisions.clear();
        self.pool.root_solvable_mut().clear();
        self.pool.create_whatprovides(jobs.flags.strict_repo_priority);

        let installed = self.installed_solvables();
        self.add_job_rules(&jobs, &installed)?;

        self.decision_map = vec![0; self.pool.solvable_count()];
        self.run_sat(&installed, jobs.flags)
            .map_err(|problem| SolveError::Unsolvable(problem))?;

        // Build the decision queue: installs in decision order, then
        // removals of installed packages that ended up decided out.
        let mut steps = Vec::new();
        for decision in &self.decisions {
            if decision.value && !decision.solvable.is_root() {
                steps.push(SolveStep::Install(decision.solvable));
            }
        }
        for &solvable in &installed {
            if self.value(solvable) == Some(false) {
                steps.push(SolveStep::Remove(solvable));
            }
        }
        Ok(Solution { steps })
    }

    /// Renders a problem against this solver's pool.
    pub fn display_problem<'a>(&'a self, problem: &Problem) -> crate::problem::DisplayUnsat<'a> {
        problem.display_user_friendly(self)
    }

    fn installed_solvables(&self) -> Vec<SolvableId> {
        match self.pool.installed_repo() {
            Some(repo_id) => self.pool.repo_solvables(repo_id),
            None => Vec::new(),
        }
    }

    /// Encodes the job list into rules.
    fn add_job_rules(
        &mut self,
        jobs: &SolveJobs,
        installed: &[SolvableId],
    ) -> Result<(), SolveError> {
        let mut visited = HashSet::new();
        let mut considered: Vec<SolvableId> = installed.to_vec();
        let mut missing_removals = Vec::new();

        for job in &jobs.jobs {
            match job.operation {
                SolveOperation::Install | SolveOperation::Update => {
                    let spec = self.effective_spec(job, installed, jobs.flags);
                    let spec_id = self.pool.intern_match_spec(spec);

                    if jobs.flags.only_deps && job.operation == SolveOperation::Install {
                        self.add_dependency_jobs(spec_id, &mut visited, &mut considered, jobs.flags);
                    } else {
                        self.add_rules_for_root_dep(
                            spec_id,
                            &mut visited,
                            &mut considered,
                            jobs.flags,
                        );
                    }

                    // An update must not settle for the installed variant
                    // when a better candidate is available.
                    if job.operation == SolveOperation::Update {
                        for rule in self.update_forbids_installed(spec_id, installed) {
                            self.rules.push(rule);
                        }
                    }
                }
                SolveOperation::Remove => {
                    let matching: Vec<SolvableId> = self.matching_solvables(&job.spec);
                    let installed_matches = matching
                        .iter()
                        .any(|id| installed.contains(id));
                    if !installed_matches {
                        missing_removals.push(job.spec.to_string());
                        continue;
                    }
                    // Forbid every candidate of the name so the package
                    // cannot be silently reinstalled from a channel.
                    for solvable in matching {
                        self.rules
                            .push(Rule::new(RuleKind::Forbids(SolvableId::root(), solvable)));
                    }
                }
                SolveOperation::Lock => {
                    for &locked in installed {
                        let record = &self.pool.resolve_solvable(locked).record;
                        if !taipan_conda_types::Matches::matches(record, &job.spec) {
                            continue;
                        }
                        let name = self.pool.resolve_solvable(locked).name_id();
                        let others: Vec<SolvableId> = self.pool.packages_by_name[name.index()]
                            .iter()
                            .copied()
                            .filter(|&id| id != locked)
                            .collect();
                        for other in others {
                            self.rules
                                .push(Rule::new(RuleKind::Forbids(SolvableId::root(), other)));
                        }
                    }
                }
            }
        }

        if !missing_removals.is_empty() {
            return Err(SolveError::NotInstalled(missing_removals));
        }

        // Rules for the installed packages themselves (their dependencies
        // stay relevant while they remain installed).
        for &solvable in installed {
            self.add_rules_for_solvable(solvable, &mut visited, &mut considered, jobs.flags);
        }

        // Only one candidate per package name may be installed.
        considered.sort_unstable();
        considered.dedup();
        let mut by_name: ahash::AHashMap<crate::id::NameId, Vec<SolvableId>> =
            ahash::AHashMap::new();
        for &solvable in &considered {
            let name = self.pool.resolve_solvable(solvable).name_id();
            by_name.entry(name).or_default().push(solvable);
        }
        let mut names: Vec<_> = by_name.into_iter().collect();
        names.sort_unstable_by_key(|(name, _)| *name);
        for (_, candidates) in names {
            for (index, &candidate) in candidates.iter().enumerate() {
                for &other in &candidates[index + 1..] {
                    self.rules
                        .push(Rule::new(RuleKind::Forbids(candidate, other)));
                }
            }
        }

        Ok(())
    }

    /// The spec actually used for an install/update job: update jobs that
    /// may not downgrade are narrowed to at least the installed version.
    fn effective_spec(
        &self,
        job: &crate::jobs::SolveJob,
        installed: &[SolvableId],
        flags: SolverFlags,
    ) -> MatchSpec {
        let mut spec = job.spec.clone();
        if job.operation == SolveOperation::Update && !flags.allow_downgrade {
            if let Some(name) = spec.name.as_deref() {
                let installed_version = installed.iter().find_map(|&id| {
                    let record = &self.pool.resolve_solvable(id).record.package_record;
                    (record.name == name).then(|| record.version.clone())
                });
                if let Some(version) = installed_version {
                    let floor = VersionSpec::Range(VersionOperator::GreaterEquals, version);
                    spec.version = Some(match spec.version.take() {
                        Some(existing) => VersionSpec::Group(
                            taipan_conda_types::LogicalOperator::And,
                            vec![existing, floor],
                        ),
                        None => floor,
                    });
                }
            }
        }
        spec
    }

    /// For every installed candidate of an update spec that is not already
    /// the preferred candidate, emits a rule forbidding it so the solver
    /// moves to the better variant.
    fn update_forbids_installed(
        &mut self,
        spec_id: SpecId,
        installed: &[SolvableId],
    ) -> Vec<Rule> {
        let candidates = self.pool.spec_candidates(spec_id).to_vec();
        let mut rules = Vec::new();
        for &candidate in &candidates {
            if !installed.contains(&candidate) {
                continue;
            }
            let has_better = candidates.iter().any(|&other| {
                !installed.contains(&other)
                    && self.pool.compare_solvables(other, candidate) == std::cmp::Ordering::Less
            });
            if has_better {
                rules.push(Rule::new(RuleKind::Forbids(SolvableId::root(), candidate)));
            }
        }
        rules
    }

    /// Adds a root requirement on the spec plus the rules of all candidates
    /// reachable from it.
    fn add_rules_for_root_dep(
        &mut self,
        spec_id: SpecId,
        visited: &mut HashSet<SolvableId>,
        considered: &mut Vec<SolvableId>,
        flags: SolverFlags,
    ) {
        self.pool.root_solvable_mut().push(spec_id);

        let candidates: Vec<SolvableId> = self.pool.spec_candidates(spec_id).to_vec();
        for candidate in candidates {
            if visited.insert(candidate) {
                considered.push(candidate);
                self.add_rules_for_solvable(candidate, visited, considered, flags);
            }
        }

        self.rules
            .push(Rule::new(RuleKind::Requires(SolvableId::root(), spec_id)));
    }

    /// For `only_deps` installs: requires the dependencies of the best
    /// candidate instead of the package itself.
    fn add_dependency_jobs(
        &mut self,
        spec_id: SpecId,
        visited: &mut HashSet<SolvableId>,
        considered: &mut Vec<SolvableId>,
        flags: SolverFlags,
    ) {
        let best = self.pool.spec_candidates(spec_id).first().copied();
        let Some(best) = best else {
            // No candidate at all; surface the conflict through a regular
            // root requirement so diagnostics can report it.
            self.rules
                .push(Rule::new(RuleKind::Requires(SolvableId::root(), spec_id)));
            self.pool.root_solvable_mut().push(spec_id);
            return;
        };
        let dependencies = self.pool.resolve_solvable(best).dependencies.clone();
        for dependency in dependencies {
            self.add_rules_for_root_dep(dependency, visited, considered, flags);
        }
    }

    /// Adds the requires/constrains rules of one solvable and recurses into
    /// the candidates of its dependencies.
    fn add_rules_for_solvable(
        &mut self,
        solvable: SolvableId,
        visited: &mut HashSet<SolvableId>,
        considered: &mut Vec<SolvableId>,
        flags: SolverFlags,
    ) {
        visited.insert(solvable);

        if flags.no_deps {
            return;
        }

        let mut stack = vec![solvable];
        while let Some(current) = stack.pop() {
            let dependencies = self.pool.resolve_solvable(current).dependencies.clone();
            for dependency in dependencies {
                let candidates: Vec<SolvableId> =
                    self.pool.spec_candidates(dependency).to_vec();
                for candidate in candidates {
                    if visited.insert(candidate) {
                        considered.push(candidate);
                        stack.push(candidate);
                    }
                }
                self.rules
                    .push(Rule::new(RuleKind::Requires(current, dependency)));
            }

            let constrains = self.pool.resolve_solvable(current).constrains.clone();
            for constraint in constrains {
                let forbidden: Vec<SolvableId> = self.pool.spec_forbidden(constraint).to_vec();
                for target in forbidden {
                    self.rules
                        .push(Rule::new(RuleKind::Constrains(current, target, constraint)));
                }
            }
        }
    }

    fn matching_solvables(&mut self, spec: &MatchSpec) -> Vec<SolvableId> {
        let spec_id = self.pool.intern_match_spec(spec.clone());
        self.pool.spec_candidates(spec_id).to_vec()
    }

    fn value(&self, solvable: SolvableId) -> Option<bool> {
        match self.decision_map[solvable.index()] {
            0 => None,
            level if level > 0 => Some(true),
            _ => Some(false),
        }
    }

    fn decide(&mut self, solvable: SolvableId, value: bool, level: u32, derived_from: Derivation) {
        debug_assert_eq!(self.value(solvable), None);
        self.decision_map[solvable.index()] = if value {
            i64::from(level)
        } else {
            -i64::from(level)
        };
        self.decisions.push(Decision {
            solvable,
            value,
            level,
            derived_from,
        });
    }

    /// Removes all decisions of the given level, returning the choice
    /// decision that opened it.
    fn undo_level(&mut self, level: u32) -> Decision {
        let mut choice = None;
        while let Some(decision) = self.decisions.last().copied() {
            if decision.level < level {
                break;
            }
            self.decisions.pop();
            self.decision_map[decision.solvable.index()] = 0;
            if matches!(decision.derived_from, Derivation::Choice) {
                choice = Some(decision);
            }
        }
        choice.expect("a decision level always starts with a choice")
    }

    /// Runs unit propagation until a fixpoint. Returns the id of a
    /// violated rule on conflict.
    fn propagate(&mut self, level: u32) -> Result<(), RuleId> {
        loop {
            let mut changed = false;
            for rule_index in 0..self.rules.len() {
                let rule_id = RuleId::new(rule_index);
                match self.rules[rule_index].kind {
                    RuleKind::InstallRoot => {}
                    RuleKind::Requires(owner, spec_id) => {
                        // Clause: ¬owner ∨ candidate1 ∨ … ∨ candidateN
                        if self.value(owner) == Some(false) {
                            continue;
                        }
                        let candidates = self.pool.spec_candidates(spec_id).to_vec();
                        if candidates
                            .iter()
                            .any(|&candidate| self.value(candidate) == Some(true))
                        {
                            continue;
                        }
                        let mut undecided = candidates
                            .iter()
                            .copied()
                            .filter(|&candidate| self.value(candidate).is_none());
                        match (self.value(owner), undecided.next(), undecided.next()) {
                            // All literals false.
                            (Some(true), None, _) => return Err(rule_id),
                            // Owner true and one undecided candidate left.
                            (Some(true), Some(candidate), None) => {
                                self.decide(candidate, true, level, Derivation::Rule(rule_id));
                                changed = true;
                            }
                            // Owner undecided and no candidate can be true.
                            (None, None, _) => {
                                self.decide(owner, false, level, Derivation::Rule(rule_id));
                                changed = true;
                            }
                            _ => {}
                        }
                    }
                    RuleKind::Forbids(a, b) | RuleKind::Constrains(a, b, _) => {
                        // Clause: ¬a ∨ ¬b
                        match (self.value(a), self.value(b)) {
                            (Some(true), Some(true)) => return Err(rule_id),
                            (Some(true), None) => {
                                self.decide(b, false, level, Derivation::Rule(rule_id));
                                changed = true;
                            }
                            (None, Some(true)) => {
                                self.decide(a, false, level, Derivation::Rule(rule_id));
                                changed = true;
                            }
                            _ => {}
                        }
                    }
                }
            }
            if !changed {
                return Ok(());
            }
        }
    }

    /// The DPLL search: repeatedly pick the first unsatisfied requires
    /// rule, install its best undecided candidate, and on conflict flip
    /// that choice at the previous level. Installed packages not forced
    /// either way are kept when possible.
    fn run_sat(&mut self, installed: &[SolvableId], _flags: SolverFlags) -> Result<(), Problem> {
        let mut level: u32 = 1;
        self.decide(
            SolvableId::root(),
            true,
            level,
            Derivation::Rule(RuleId::install_root()),
        );
        self.propagate(level)
            .map_err(|conflict| self.analyze_unsolvable(conflict))?;

        loop {
            if let Some(candidate) = self.next_requires_candidate() {
                level = self.set_propagate_flip(level, candidate)?;
                continue;
            }

            // All hard requirements are satisfied; keep remaining
            // installed packages if they do not conflict.
            let undecided_installed = installed
                .iter()
                .copied()
                .find(|&solvable| self.value(solvable).is_none());
            if let Some(solvable) = undecided_installed {
                level = self.set_propagate_flip(level, solvable)?;
                continue;
            }

            return Ok(());
        }
    }

    /// Finds the preferred undecided candidate of the first requires rule
    /// whose owner is installed-for-sure and that has no satisfied
    /// candidate yet.
    fn next_requires_candidate(&mut self) -> Option<SolvableId> {
        for rule_index in 0..self.rules.len() {
            let RuleKind::Requires(owner, spec_id) = self.rules[rule_index].kind else {
                continue;
            };
            if self.value(owner) != Some(true) {
                continue;
            }
            let candidates = self.pool.spec_candidates(spec_id).to_vec();
            if candidates
                .iter()
                .any(|&candidate| self.value(candidate) == Some(true))
            {
                continue;
            }
            if let Some(candidate) = candidates
                .iter()
                .copied()
                .find(|&candidate| self.value(candidate).is_none())
            {
                return Some(candidate);
            }
        }
        None
    }

    /// Opens a new decision level deciding `solvable = true`, propagates,
    /// and on conflict unwinds: the choice is flipped to false at the
    /// enclosing level and propagation resumes. A conflict at level 1 is
    /// unsolvable.
    fn set_propagate_flip(
        &mut self,
        mut level: u32,
        solvable: SolvableId,
    ) -> Result<u32, Problem> {
        level += 1;
        self.decide(solvable, true, level, Derivation::Choice);

        loop {
            match self.propagate(level) {
                Ok(()) => return Ok(level),
                Err(conflict) if level == 1 => {
                    return Err(self.analyze_unsolvable(conflict));
                }
                Err(conflict) => {
                    tracing::trace!(
                        "conflict on {} at level {level}, flipping",
                        self.pool.resolve_solvable_inner(solvable).display()
                    );
                    let choice = self.undo_level(level);
                    level -= 1;
                    self.decide(
                        choice.solvable,
                        false,
                        level,
                        Derivation::Flip(conflict),
                    );
                }
            }
        }
    }

    /// Collects the rules that participate in a top level conflict by
    /// walking the decision causes backwards from the violated rule.
    fn analyze_unsolvable(&mut self, conflict: RuleId) -> Problem {
        let mut problem = Problem::default();
        problem.add_rule(conflict);

        let mut involved: HashSet<SolvableId> = self.rules[conflict.index()]
            .involved_solvables(&self.pool)
            .into_iter()
            .collect();

        for decision in self.decisions.iter().rev() {
            if !involved.contains(&decision.solvable) {
                continue;
            }
            let rule_id = match decision.derived_from {
                Derivation::Rule(rule_id) | Derivation::Flip(rule_id) => rule_id,
                Derivation::Choice => continue,
            };
            if rule_id == RuleId::install_root() {
                continue;
            }
            problem.add_rule(rule_id);
            involved.extend(self.rules[rule_id.index()].involved_solvables(&self.pool));
        }

        problem
    }
}
