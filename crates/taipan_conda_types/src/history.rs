//! Reading and appending `conda-meta/history` files.
//!
//! Every change made to an environment is recorded as a revision in an
//! append-only text file. A revision starts with a `==> <datetime> <==`
//! header, followed by comment lines describing the user request (the
//! command line and the requested specs) and diff lines listing the linked
//! (`+`) and unlinked (`-`) distributions.

use std::{
    collections::BTreeSet,
    io::Write,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use thiserror::Error;

/// A single parsed revision of a history file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryRevision {
    /// The datetime string from the revision header.
    pub timestamp: String,

    /// The distribution strings linked in this revision (`+` lines, or bare
    /// lines in the initial revision).
    pub link_dists: BTreeSet<String>,

    /// The distribution strings unlinked in this revision (`-` lines).
    pub unlink_dists: BTreeSet<String>,

    /// Raw comment lines, including the leading `#`.
    pub comments: Vec<String>,
}

/// Structured data extracted from the comment lines of a revision.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserRequest {
    /// The datetime string of the revision.
    pub date: String,

    /// The command that was run (from `# cmd: …`).
    pub cmd: Option<String>,

    /// Specs from install/update/create actions.
    pub update_specs: Vec<String>,

    /// Specs from remove/uninstall actions.
    pub remove_specs: Vec<String>,
}

/// A revision to be appended to a history file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Revision {
    /// The command line that caused the change.
    pub cmd: String,

    /// The specs the user asked to install or update.
    pub update_specs: Vec<String>,

    /// The specs the user asked to remove.
    pub remove_specs: Vec<String>,

    /// Distribution strings that were linked.
    pub link_dists: BTreeSet<String>,

    /// Distribution strings that were unlinked.
    pub unlink_dists: BTreeSet<String>,
}

/// Errors that can occur when working with history files.
#[derive(Debug, Error)]
pub enum HistoryError {
    /// An I/O error occurred.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

/// The parsed contents of a history file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedHistory {
    /// All revisions, oldest first.
    pub revisions: Vec<HistoryRevision>,
}

impl ParsedHistory {
    /// Returns the most recent revision, if any.
    pub fn latest(&self) -> Option<&HistoryRevision> {
        self.revisions.last()
    }

    /// Extracts the structured [`UserRequest`]s of all revisions that carry
    /// a `# cmd:` comment.
    pub fn user_requests(&self) -> Vec<UserRequest> {
        let cmd_re = lazy_regex::regex!(r"^#\s*cmd:\s*(.+)$");
        let spec_re = lazy_regex::regex!(r"^#\s*(\w+)\s+specs:\s*(.+)$");

        let mut requests = Vec::new();
        for revision in &self.revisions {
            let mut request = UserRequest {
                date: revision.timestamp.clone(),
                ..UserRequest::default()
            };
            for comment in &revision.comments {
                if let Some(captures) = cmd_re.captures(comment) {
                    request.cmd = Some(captures[1].trim().to_owned());
                } else if let Some(captures) = spec_re.captures(comment) {
                    let specs = parse_spec_list(&captures[2]);
                    match &captures[1] {
                        "install" | "update" | "create" => request.update_specs = specs,
                        "remove" | "uninstall" => request.remove_specs = specs,
                        _ => {}
                    }
                }
            }
            if request.cmd.is_some() {
                requests.push(request);
            }
        }
        requests
    }
}

/// Spec lists in comments are rendered like a python list:
/// `['numpy >=1.20', 'python']`.
fn parse_spec_list(value: &str) -> Vec<String> {
    value
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split(',')
        .map(|spec| spec.trim().trim_matches(['\'', '"']).to_owned())
        .filter(|spec| !spec.is_empty())
        .collect()
}

fn render_spec_list(specs: &[String]) -> String {
    let quoted: Vec<String> = specs.iter().map(|spec| format!("'{spec}'")).collect();
    format!("[{}]", quoted.join(", "))
}

/// Entry point for reading and appending the history of a prefix.
#[derive(Debug, Clone)]
pub struct History {
    path: PathBuf,
}

impl History {
    /// Creates a handle for the history file of the given prefix.
    pub fn from_prefix(prefix: &Path) -> Self {
        Self {
            path: prefix.join("conda-meta").join("history"),
        }
    }

    /// The path of the history file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parses the history file. A missing file yields an empty history.
    pub fn parse(&self) -> Result<ParsedHistory, HistoryError> {
        let content = match fs_err::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ParsedHistory::default())
            }
            Err(e) => return Err(e.into()),
        };

        let mut revisions = Vec::new();
        let mut current: Option<HistoryRevision> = None;
        for line in content.lines() {
            let line = line.trim_end();
            if let Some(header) = line
                .strip_prefix("==>")
                .and_then(|rest| rest.strip_suffix("<=="))
            {
                revisions.extend(current.take());
                current = Some(HistoryRevision {
                    timestamp: header.trim().to_owned(),
                    ..HistoryRevision::default()
                });
                continue;
            }

            let Some(revision) = current.as_mut() else {
                continue;
            };
            if line.starts_with('#') {
                revision.comments.push(line.to_owned());
            } else if let Some(dist) = line.strip_prefix('+') {
                revision.link_dists.insert(dist.trim().to_owned());
            } else if let Some(dist) = line.strip_prefix('-') {
                revision.unlink_dists.insert(dist.trim().to_owned());
            } else if !line.is_empty() {
                // Initial revisions list the complete environment without
                // diff markers.
                revision.link_dists.insert(line.to_owned());
            }
        }
        revisions.extend(current);

        Ok(ParsedHistory { revisions })
    }

    /// Appends a revision stamped with the given time. The `conda-meta`
    /// directory is created if needed; the write itself is a single
    /// appending write so that concurrent readers never observe a torn
    /// entry.
    pub fn append(&self, revision: &Revision, time: DateTime<Utc>) -> Result<(), HistoryError> {
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent)?;
        }

        let mut entry = String::new();
        entry.push_str(&format!("==> {} <==\n", time.format("%Y-%m-%d %H:%M:%S")));
        entry.push_str(&format!("# cmd: {}\n", revision.cmd));
        if !revision.update_specs.is_empty() {
            entry.push_str(&format!(
                "# update specs: {}\n",
                render_spec_list(&revision.update_specs)
            ));
        }
        if !revision.remove_specs.is_empty() {
            entry.push_str(&format!(
                "# remove specs: {}\n",
                render_spec_list(&revision.remove_specs)
            ));
        }
        for dist in &revision.unlink_dists {
            entry.push_str(&format!("-{dist}\n"));
        }
        for dist in &revision.link_dists {
            entry.push_str(&format!("+{dist}\n"));
        }

        let mut file = fs_err::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(entry.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeSet;

    use chrono::{TimeZone, Utc};

    use super::{History, Revision};

    #[test]
    fn test_append_and_parse() {
        let dir = tempfile::tempdir().unwrap();
        let history = History::from_prefix(dir.path());

        history
            .append(
                &Revision {
                    cmd: "taipan install numpy".to_owned(),
                    update_specs: vec!["numpy >=1.20".to_owned()],
                    remove_specs: Vec::new(),
                    link_dists: BTreeSet::from([
                        "numpy-1.24.0-py311_0".to_owned(),
                        "python-3.11.4-h2c4edbf_0".to_owned(),
                    ]),
                    unlink_dists: BTreeSet::new(),
                },
                Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            )
            .unwrap();
        history
            .append(
                &Revision {
                    cmd: "taipan remove numpy".to_owned(),
                    update_specs: Vec::new(),
                    remove_specs: vec!["numpy".to_owned()],
                    link_dists: BTreeSet::new(),
                    unlink_dists: BTreeSet::from(["numpy-1.24.0-py311_0".to_owned()]),
                },
                Utc.with_ymd_and_hms(2024, 3, 2, 9, 30, 0).unwrap(),
            )
            .unwrap();

        let parsed = history.parse().unwrap();
        assert_eq!(parsed.revisions.len(), 2);
        assert_eq!(parsed.revisions[0].timestamp, "2024-03-01 12:00:00");
        assert!(parsed.revisions[0]
            .link_dists
            .contains("numpy-1.24.0-py311_0"));
        assert!(parsed.revisions[1]
            .unlink_dists
            .contains("numpy-1.24.0-py311_0"));

        let requests = parsed.user_requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].cmd.as_deref(), Some("taipan install numpy"));
        assert_eq!(requests[0].update_specs, vec!["numpy >=1.20"]);
        assert_eq!(requests[1].remove_specs, vec!["numpy"]);
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let history = History::from_prefix(dir.path());
        assert!(history.parse().unwrap().revisions.is_empty());
    }
}
