//! Running the pre/post link and unlink scripts a package may carry.

use std::path::Path;
use std::process::Command;

use taipan_conda_types::PackageRecord;

/// The moments a package script can run.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum LinkScriptKind {
    /// Before the package's files are linked.
    PreLink,
    /// After the package's files are linked.
    PostLink,
    /// Before the package's files are removed.
    PreUnlink,
}

impl LinkScriptKind {
    fn file_name(self, is_windows: bool) -> String {
        let stem = match self {
            LinkScriptKind::PreLink => "pre-link",
            LinkScriptKind::PostLink => "post-link",
            LinkScriptKind::PreUnlink => "pre-unlink",
        };
        if is_windows {
            format!("{stem}.bat")
        } else {
            format!("{stem}.sh")
        }
    }
}

/// An error from a link script.
#[derive(Debug, thiserror::Error)]
pub enum LinkScriptError {
    /// The script could not be started.
    #[error("failed to run the {0} script")]
    FailedToRun(&'static str, #[source] std::io::Error),

    /// The script exited with a failure status.
    #[error("the {kind} script of {package} failed with {status}")]
    Failed {
        /// Which script failed.
        kind: &'static str,
        /// The package the script belongs to.
        package: String,
        /// The exit status of the script.
        status: std::process::ExitStatus,
    },
}

fn kind_name(kind: LinkScriptKind) -> &'static str {
    match kind {
        LinkScriptKind::PreLink => "pre-link",
        LinkScriptKind::PostLink => "post-link",
        LinkScriptKind::PreUnlink => "pre-unlink",
    }
}

/// Runs the given script of a package if it exists. Scripts live in the
/// package's `info/` directory (for link scripts) or under
/// `bin/.{name}-{kind}.sh` in the prefix (for unlink scripts, following
/// the layout conda-build produces); the first location found wins. The
/// script runs with the conventional environment: `PREFIX`, `PKG_NAME`,
/// `PKG_VERSION` and `PKG_BUILDNUM`.
pub fn run_link_script(
    kind: LinkScriptKind,
    record: &PackageRecord,
    package_dir: Option<&Path>,
    target_prefix: &Path,
) -> Result<(), LinkScriptError> {
    let is_windows = cfg!(windows);
    let file_name = kind.file_name(is_windows);

    let mut candidates = Vec::new();
    if let Some(package_dir) = package_dir {
        candidates.push(package_dir.join("info").join(&file_name));
    }
    candidates.push(
        target_prefix
            .join("bin")
            .join(format!(".{}-{}", record.name, file_name)),
    );
    let Some(script) = candidates.into_iter().find(|path| path.is_file()) else {
        return Ok(());
    };

    tracing::debug!("running {} script {}", kind_name(kind), script.display());

    let mut command = if is_windows {
        let mut command = Command::new("cmd.exe");
        command.arg("/c").arg(&script);
        command
    } else {
        let mut command = Command::new("sh");
        command.arg(&script);
        command
    };

    let status = command
        .env("PREFIX", target_prefix)
        .env("PKG_NAME", &record.name)
        .env("PKG_VERSION", record.version.to_string())
        .env("PKG_BUILDNUM", record.build_number.to_string())
        .current_dir(target_prefix)
        .status()
        .map_err(|e| LinkScriptError::FailedToRun(kind_name(kind), e))?;

    if !status.success() {
        return Err(LinkScriptError::Failed {
            kind: kind_name(kind),
            package: record.name.clone(),
            status,
        });
    }
    Ok(())
}
