use std::str::FromStr;

use url::Url;

use taipan_conda_types::{MatchSpec, PackageRecord, RepoDataRecord};
use taipan_solve::{Pool, RepoId, SolveError, SolveJobs, Solver, SolverFlags};

fn record(name: &str, version: &str, build: &str, depends: &[&str]) -> RepoDataRecord {
    let mut package_record = PackageRecord::new(
        name.to_owned(),
        version.parse().unwrap(),
        build.to_owned(),
    );
    package_record.depends = depends.iter().map(|s| (*s).to_owned()).collect();
    package_record.subdir = "linux-64".to_owned();
    let file_name = format!("{name}-{version}-{build}.tar.bz2");
    RepoDataRecord {
        url: Url::parse(&format!("https://conda.example.com/channel/linux-64/{file_name}"))
            .unwrap(),
        file_name,
        channel: "https://conda.example.com/channel".to_owned(),
        package_record,
    }
}

fn add_all(pool: &mut Pool, repo: RepoId, records: &[RepoDataRecord]) {
    for record in records {
        pool.add_solvable(repo, record.clone()).unwrap();
    }
}

fn solved_names(solver: &Solver, solution: &taipan_solve::Solution) -> Vec<String> {
    let mut names: Vec<String> = solution
        .installs()
        .map(|id| {
            let record = &solver.pool().resolve_solvable(id).record.package_record;
            format!("{}={}", record.name, record.version)
        })
        .collect();
    names.sort();
    names
}

#[test]
fn test_simple_install() {
    let mut pool = Pool::new();
    let repo = pool.add_repo("channel", 0);
    add_all(
        &mut pool,
        repo,
        &[
            record("foo", "1.0", "0", &[]),
            record("foo", "2.0", "0", &["bar"]),
            record("bar", "1.0", "0", &[]),
        ],
    );

    let mut solver = Solver::new(pool);
    let mut jobs = SolveJobs::default();
    jobs.install(MatchSpec::from_str("foo").unwrap());

    let solution = solver.solve(jobs).unwrap();
    // The highest version and its dependency are selected.
    assert_eq!(solved_names(&solver, &solution), vec!["bar=1.0", "foo=2.0"]);
}

#[test]
fn test_version_constraint_picks_older() {
    let mut pool = Pool::new();
    let repo = pool.add_repo("channel", 0);
    add_all(
        &mut pool,
        repo,
        &[
            record("foo", "1.0", "0", &[]),
            record("foo", "2.0", "0", &[]),
        ],
    );

    let mut solver = Solver::new(pool);
    let mut jobs = SolveJobs::default();
    jobs.install(MatchSpec::from_str("foo <2").unwrap());

    let solution = solver.solve(jobs).unwrap();
    assert_eq!(solved_names(&solver, &solution), vec!["foo=1.0"]);
}

/// Scenario S1: requesting a version that does not exist must produce an
/// unsolvable problem citing the spec.
#[test]
fn test_unsolvable_missing_version() {
    let mut pool = Pool::new();
    let repo = pool.add_repo("channel", 0);
    add_all(
        &mut pool,
        repo,
        &[
            record("a", "0.1", "0", &[]),
            record("a", "0.2", "0", &[]),
            record("a", "0.3", "0", &[]),
        ],
    );

    let mut solver = Solver::new(pool);
    let mut jobs = SolveJobs::default();
    jobs.install(MatchSpec::from_str("a ==0.4").unwrap());

    let error = solver.solve(jobs).unwrap_err();
    let SolveError::Unsolvable(problem) = error else {
        panic!("expected an unsolvable error, got {error}");
    };
    let message = solver.display_problem(&problem).to_string();
    assert!(message.contains("a ==0.4"), "unexpected message: {message}");
    assert!(
        message.contains("no candidates were found"),
        "unexpected message: {message}"
    );
}

/// Scenario S2: the menu/dropdown/icons/intl conflict. The simplified
/// problem graph merges the dropdown versions and reports the icons and
/// intl conflicts.
#[test]
fn test_unsolvable_conflict_tree() {
    let mut pool = Pool::new();
    let repo = pool.add_repo("channel", 0);
    add_all(
        &mut pool,
        repo,
        &[
            record("menu", "1.0", "0", &["dropdown 1.*"]),
            record("menu", "1.5", "0", &["dropdown 2.*"]),
            record("dropdown", "1.8", "0", &["icons 1.*", "intl 3.*"]),
            record("dropdown", "2.0", "0", &["icons 2.*"]),
            record("dropdown", "2.1", "0", &["icons 2.*"]),
            record("dropdown", "2.2", "0", &["icons 2.*"]),
            record("dropdown", "2.3", "0", &["icons 2.*"]),
            record("icons", "1.0", "0", &[]),
            record("icons", "2.0", "0", &[]),
            record("intl", "3.0", "0", &[]),
            record("intl", "5.0", "0", &[]),
        ],
    );

    let mut solver = Solver::new(pool);
    let mut jobs = SolveJobs::default();
    jobs.install(MatchSpec::from_str("menu").unwrap());
    jobs.install(MatchSpec::from_str("icons =1").unwrap());
    jobs.install(MatchSpec::from_str("intl =5").unwrap());

    let error = solver.solve(jobs).unwrap_err();
    let SolveError::Unsolvable(problem) = error else {
        panic!("expected an unsolvable error, got {error}");
    };

    let graph = problem.graph(&solver);
    let conflicts = graph.conflict_map();
    assert!(!conflicts.is_empty());

    let message = solver.display_problem(&problem).to_string();
    assert!(message.contains("menu"), "unexpected message: {message}");
    assert!(message.contains("dropdown"), "unexpected message: {message}");
    assert!(message.contains("icons"), "unexpected message: {message}");
    // The sibling dropdown 2.x nodes are merged into a version range.
    assert!(
        message.contains("2.0 | 2.1 | 2.2 | 2.3") || message.contains("2.3 | 2.2 | 2.1 | 2.0"),
        "unexpected message: {message}"
    );
}

#[test]
fn test_solver_is_deterministic() {
    let build = || {
        let mut pool = Pool::new();
        let repo = pool.add_repo("channel", 0);
        add_all(
            &mut pool,
            repo,
            &[
                record("a", "1.0", "0", &["b", "c"]),
                record("b", "1.0", "0", &["d >=1"]),
                record("b", "2.0", "0", &["d >=2"]),
                record("c", "1.0", "0", &["d <2"]),
                record("d", "1.0", "0", &[]),
                record("d", "2.0", "0", &[]),
            ],
        );
        pool
    };

    let solve = || {
        let mut solver = Solver::new(build());
        let mut jobs = SolveJobs::default();
        jobs.install(MatchSpec::from_str("a").unwrap());
        let solution = solver.solve(jobs).unwrap();
        solved_names(&solver, &solution)
    };

    let first = solve();
    assert_eq!(first, solve());
    // b must have backtracked to 1.0 because c pins d below 2.
    assert!(first.contains(&"b=1.0".to_owned()), "solved: {first:?}");
    assert!(first.contains(&"d=1.0".to_owned()), "solved: {first:?}");
}

#[test]
fn test_installed_packages_are_kept() {
    let mut pool = Pool::new();
    let repo = pool.add_repo("channel", 0);
    add_all(
        &mut pool,
        repo,
        &[
            record("foo", "1.0", "0", &[]),
            record("foo", "2.0", "0", &[]),
            record("bar", "1.0", "0", &[]),
        ],
    );
    let installed_repo = pool.add_repo("installed", 0);
    pool.add_solvable(installed_repo, record("foo", "1.0", "0", &[]))
        .unwrap();
    pool.set_installed_repo(installed_repo);

    let mut solver = Solver::new(pool);
    let mut jobs = SolveJobs::default();
    jobs.install(MatchSpec::from_str("bar").unwrap());

    let solution = solver.solve(jobs).unwrap();
    // foo stays at its installed version even though 2.0 is available.
    assert_eq!(solved_names(&solver, &solution), vec!["bar=1.0", "foo=1.0"]);
    assert_eq!(solution.removals().count(), 0);
}

#[test]
fn test_update_moves_to_best_version() {
    let mut pool = Pool::new();
    let repo = pool.add_repo("channel", 0);
    add_all(
        &mut pool,
        repo,
        &[
            record("foo", "1.0", "0", &[]),
            record("foo", "2.0", "0", &[]),
        ],
    );
    let installed_repo = pool.add_repo("installed", 0);
    let installed = pool
        .add_solvable(installed_repo, record("foo", "1.0", "0", &[]))
        .unwrap();
    pool.set_installed_repo(installed_repo);

    let mut solver = Solver::new(pool);
    let mut jobs = SolveJobs::default();
    jobs.update(MatchSpec::from_str("foo").unwrap());

    let solution = solver.solve(jobs).unwrap();
    let installs: Vec<_> = solution.installs().collect();
    assert!(!installs.contains(&installed));
    assert_eq!(solved_names(&solver, &solution), vec!["foo=2.0"]);
    assert_eq!(solution.removals().collect::<Vec<_>>(), vec![installed]);
}

#[test]
fn test_remove_installed() {
    let mut pool = Pool::new();
    let channel_repo = pool.add_repo("channel", 0);
    add_all(&mut pool, channel_repo, &[record("foo", "1.0", "0", &[])]);
    let installed_repo = pool.add_repo("installed", 0);
    let installed = pool
        .add_solvable(installed_repo, record("foo", "1.0", "0", &[]))
        .unwrap();
    pool.set_installed_repo(installed_repo);

    let mut solver = Solver::new(pool);
    let mut jobs = SolveJobs::default();
    jobs.remove(MatchSpec::from_str("foo").unwrap());

    let solution = solver.solve(jobs).unwrap();
    assert_eq!(solution.installs().count(), 0);
    assert_eq!(solution.removals().collect::<Vec<_>>(), vec![installed]);
}

#[test]
fn test_remove_missing_is_an_error() {
    let mut pool = Pool::new();
    let repo = pool.add_repo("channel", 0);
    add_all(&mut pool, repo, &[record("foo", "1.0", "0", &[])]);

    let mut solver = Solver::new(pool);
    let mut jobs = SolveJobs::default();
    jobs.remove(MatchSpec::from_str("foo").unwrap());
    jobs.remove(MatchSpec::from_str("baz").unwrap());

    let error = solver.solve(jobs).unwrap_err();
    let SolveError::NotInstalled(specs) = error else {
        panic!("expected a not-installed error, got {error}");
    };
    // Neither foo (known but not installed) nor baz is installed.
    assert_eq!(specs.len(), 2);
}

#[test]
fn test_strict_repo_priority() {
    let mut pool = Pool::new();
    let high = pool.add_repo("high", 10);
    let low = pool.add_repo("low", 0);
    add_all(&mut pool, high, &[record("foo", "1.0", "0", &[])]);
    add_all(&mut pool, low, &[record("foo", "9.0", "0", &[])]);

    let mut solver = Solver::new(pool);
    let mut jobs = SolveJobs::default();
    jobs.install(MatchSpec::from_str("foo").unwrap());

    let solution = solver.solve(jobs).unwrap();
    // Strict priority shadows the newer version in the lower channel.
    assert_eq!(solved_names(&solver, &solution), vec!["foo=1.0"]);
}

#[test]
fn test_constrains_conflict() {
    let mut pool = Pool::new();
    let repo = pool.add_repo("channel", 0);
    let mut constrainer = record("scipy", "1.0", "0", &["numpy"]);
    constrainer.package_record.constrains = vec!["numpy <2".to_owned()];
    add_all(
        &mut pool,
        repo,
        &[
            constrainer,
            record("numpy", "1.5", "0", &[]),
            record("numpy", "2.0", "0", &[]),
        ],
    );

    let mut solver = Solver::new(pool);
    let mut jobs = SolveJobs::default();
    jobs.install(MatchSpec::from_str("scipy").unwrap());
    jobs.install(MatchSpec::from_str("numpy").unwrap());

    let solution = solver.solve(jobs).unwrap();
    // The constraint forces numpy below 2 even though 2.0 is newer.
    assert_eq!(
        solved_names(&solver, &solution),
        vec!["numpy=1.5", "scipy=1.0"]
    );
}

#[test]
fn test_no_deps_flag() {
    let mut pool = Pool::new();
    let repo = pool.add_repo("channel", 0);
    add_all(
        &mut pool,
        repo,
        &[
            record("foo", "1.0", "0", &["bar"]),
            record("bar", "1.0", "0", &[]),
        ],
    );

    let mut solver = Solver::new(pool);
    let mut jobs = SolveJobs::new(SolverFlags {
        no_deps: true,
        ..SolverFlags::default()
    });
    jobs.install(MatchSpec::from_str("foo").unwrap());

    let solution = solver.solve(jobs).unwrap();
    assert_eq!(solved_names(&solver, &solution), vec!["foo=1.0"]);
}

#[test]
fn test_empty_jobs_yield_empty_solution() {
    let mut pool = Pool::new();
    let repo = pool.add_repo("channel", 0);
    add_all(&mut pool, repo, &[record("foo", "1.0", "0", &[])]);

    let mut solver = Solver::new(pool);
    let solution = solver.solve(SolveJobs::default()).unwrap();
    assert!(solution.steps.is_empty());
}
