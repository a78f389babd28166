use taipan_conda_types::MatchSpec;

/// What the solver should do with one spec.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SolveOperation {
    /// Make sure a package matching the spec is installed.
    Install,
    /// Make sure no package matching the spec is installed.
    Remove,
    /// Bring the packages matching the spec to their best available
    /// version instead of favoring the installed one.
    Update,
    /// Keep the installed package matching the spec exactly as it is.
    Lock,
}

/// A single solver job: an operation over a parsed spec.
#[derive(Debug, Clone)]
pub struct SolveJob {
    /// The operation to perform.
    pub operation: SolveOperation,
    /// The spec the operation applies to.
    pub spec: MatchSpec,
}

/// Flags altering the solver's behavior.
#[derive(Debug, Clone, Copy)]
pub struct SolverFlags {
    /// Allow update jobs to select a lower version than the installed one.
    pub allow_downgrade: bool,
    /// Allow installed packages to be removed to satisfy the jobs.
    pub allow_uninstall: bool,
    /// Only consider candidates from the highest priority repo that has
    /// any candidate for a given dependency.
    pub strict_repo_priority: bool,
    /// Do not install the dependencies of the requested packages.
    pub no_deps: bool,
    /// Install only the dependencies of the requested packages, not the
    /// packages themselves.
    pub only_deps: bool,
    /// Relink requested packages even when the installed package is
    /// identical to the selected one.
    pub force_reinstall: bool,
}

impl Default for SolverFlags {
    fn default() -> Self {
        Self {
            allow_downgrade: false,
            allow_uninstall: true,
            strict_repo_priority: true,
            no_deps: false,
            only_deps: false,
            force_reinstall: false,
        }
    }
}

/// The complete input of one solver run: the job list and the flags.
#[derive(Debug, Clone)]
pub struct SolveJobs {
    /// The jobs, in the order they were added.
    pub jobs: Vec<SolveJob>,
    /// The flags for this run.
    pub flags: SolverFlags,
}

impl SolveJobs {
    /// Creates an empty job list with default flags.
    pub fn new(flags: SolverFlags) -> Self {
        Self {
            jobs: Vec::new(),
            flags,
        }
    }

    /// The given spec must be installed.
    pub fn install(&mut self, spec: MatchSpec) {
        self.jobs.push(SolveJob {
            operation: SolveOperation::Install,
            spec,
        });
    }

    /// No package matching the spec may remain installed.
    pub fn remove(&mut self, spec: MatchSpec) {
        self.jobs.push(SolveJob {
            operation: SolveOperation::Remove,
            spec,
        });
    }

    /// The packages matching the spec should move to their best version.
    pub fn update(&mut self, spec: MatchSpec) {
        self.jobs.push(SolveJob {
            operation: SolveOperation::Update,
            spec,
        });
    }

    /// The installed package matching the spec must not change.
    pub fn lock(&mut self, spec: MatchSpec) {
        self.jobs.push(SolveJob {
            operation: SolveOperation::Lock,
            spec,
        });
    }
}

impl Default for SolveJobs {
    fn default() -> Self {
        Self::new(SolverFlags::default())
    }
}
