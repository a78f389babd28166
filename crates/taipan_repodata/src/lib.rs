#![deny(missing_docs)]

//! `taipan_repodata` downloads and caches the `repodata.json` indices of
//! Conda channel subdirectories and turns them into
//! [`taipan_conda_types::RepoDataRecord`]s for the solver.

mod cache;
mod fetch;
mod subdir_data;
mod utils;

pub use cache::{CacheHeaders, Expiring, SubdirState};
pub use fetch::{
    fetch_repo_data, CacheAction, CacheResult, CachedRepoData, FetchRepoDataError,
    FetchRepoDataOptions,
};
pub use subdir_data::{SubdirData, SubdirDataError};
