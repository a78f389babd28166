//! Background compilation of python bytecode for `noarch: python`
//! packages.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;

use crate::install::python::PythonInfo;

/// A request to compile the given prefix-relative `.py` sources of one
/// package.
#[derive(Debug, Default)]
pub struct PycCompilationQueue {
    sources: Vec<PathBuf>,
}

impl PycCompilationQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the sources of one linked package.
    pub fn extend(&mut self, sources: impl IntoIterator<Item = PathBuf>) {
        self.sources.extend(sources);
    }

    /// Returns true if nothing was queued.
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Compiles all queued sources with the environment's own interpreter,
    /// at most `concurrency` interpreter processes at a time. Compilation
    /// failures are logged, not fatal: a package works without its
    /// bytecode. The call drains the queue completely before returning.
    pub async fn drain(
        self,
        target_prefix: &Path,
        python_info: &PythonInfo,
        concurrency: usize,
    ) {
        if self.sources.is_empty() {
            return;
        }

        let python = target_prefix.join(&python_info.path);
        if !python.exists() {
            tracing::warn!(
                "skipping bytecode compilation, no interpreter at {}",
                python.display()
            );
            return;
        }

        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut tasks: FuturesUnordered<_> = self
            .sources
            .chunks(64)
            .map(|chunk| {
                let python = python.clone();
                let prefix = target_prefix.to_path_buf();
                let chunk: Vec<PathBuf> = chunk.to_vec();
                let semaphore = Arc::clone(&semaphore);
                async move {
                    let _permit = semaphore.acquire().await.expect("semaphore never closes");
                    let result = tokio::process::Command::new(&python)
                        .arg("-Wi")
                        .arg("-m")
                        .arg("py_compile")
                        .args(&chunk)
                        .current_dir(&prefix)
                        .output()
                        .await;
                    match result {
                        Ok(output) if !output.status.success() => {
                            tracing::warn!(
                                "bytecode compilation failed for {} files: {}",
                                chunk.len(),
                                String::from_utf8_lossy(&output.stderr).trim()
                            );
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!("could not spawn {}: {e}", python.display());
                        }
                    }
                }
            })
            .collect();

        while tasks.next().await.is_some() {}
    }
}
