//! The explicit configuration and cancellation plumbing shared by all
//! operations.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use taipan_conda_types::{ChannelConfig, Platform};

/// A process-wide cooperative cancellation flag. Long running tasks poll
/// the flag at their checkpoints (between download chunks, between files
/// while extracting and linking) and abort when it is raised. The embedder
/// typically raises it from a SIGINT/SIGTERM handler.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag {
    cancelled: Arc<AtomicBool>,
}

impl CancellationFlag {
    /// Creates a flag that is not raised.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the flag. All tasks polling it will abort at their next
    /// checkpoint.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Returns true if the flag has been raised.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns an error when the flag has been raised.
    pub fn err_if_cancelled(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}

/// The unit error raised at a cancellation checkpoint.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("the operation was cancelled")]
pub struct Cancelled;

/// The explicit configuration threaded through every component, replacing
/// process-wide singletons. Construct one per top level operation.
#[derive(Debug, Clone)]
pub struct Context {
    /// Resolution of bare channel names.
    pub channel_config: ChannelConfig,

    /// The platform packages are installed for.
    pub platform: Platform,

    /// Where repodata caches live.
    pub repodata_cache_dir: PathBuf,

    /// The package cache directories, in preference order. The first
    /// writable one receives downloads.
    pub package_cache_dirs: Vec<PathBuf>,

    /// How long cached repodata is used without revalidation.
    pub local_repodata_ttl: Duration,

    /// The number of parallel downloads.
    pub download_concurrency: usize,

    /// The number of parallel extractions.
    pub extract_concurrency: usize,

    /// The number of parallel bytecode compilations.
    pub pyc_concurrency: usize,

    /// Stop after the fetch phase without touching the prefix.
    pub download_only: bool,

    /// The cooperative cancellation flag.
    pub cancellation: CancellationFlag,
}

impl Context {
    /// A context with defaults derived from the given cache root: repodata
    /// caches in `<root>/repodata`, packages in `<root>/pkgs`.
    pub fn from_cache_root(cache_root: PathBuf) -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|threads| threads.get())
            .unwrap_or(4);
        Self {
            channel_config: ChannelConfig::default(),
            platform: Platform::current(),
            repodata_cache_dir: cache_root.join("repodata"),
            package_cache_dirs: vec![cache_root.join("pkgs")],
            local_repodata_ttl: Duration::from_secs(15 * 60),
            download_concurrency: parallelism.min(8).max(2),
            extract_concurrency: parallelism,
            pyc_concurrency: parallelism,
            download_only: false,
            cancellation: CancellationFlag::new(),
        }
    }
}
