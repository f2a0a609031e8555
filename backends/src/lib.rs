pub mod local;
pub mod protocol;
pub mod remote;
pub mod server;
pub mod sync;

pub use local::{LocalBackend, LocalTransaction};
pub use remote::RemoteBackend;
pub use sync::{synchronize, SyncReport};

use coffre_core::{Backend, Error, Repository, RepositoryConfig, Result};
use url::Url;

/// Open the repository at `location`, dispatching on its form: absolute
/// filesystem paths use the local backend, `coffre://`, `ssh://` and
/// `stdio://` URLs the remote one.
pub async fn open(location: &str) -> Result<Repository> {
    let backend: Box<dyn Backend> = match parse_remote(location)? {
        Some(url) => Box::new(RemoteBackend::open(&url).await?),
        None => Box::new(LocalBackend::open(location).await?),
    };
    Ok(Repository::new(backend))
}

/// Create a repository at `location` with the given configuration.
pub async fn create(location: &str, config: RepositoryConfig) -> Result<Repository> {
    let backend: Box<dyn Backend> = match parse_remote(location)? {
        Some(url) => Box::new(RemoteBackend::create(&url, config).await?),
        None => Box::new(LocalBackend::create(location, config).await?),
    };
    Ok(Repository::new(backend))
}

fn parse_remote(location: &str) -> Result<Option<Url>> {
    if !location.contains("://") {
        return Ok(None);
    }
    let url = Url::parse(location)
        .map_err(|e| Error::Backend(format!("invalid repository location: {}", e)))?;
    match url.scheme() {
        "coffre" | "ssh" | "stdio" => Ok(Some(url)),
        other => Err(Error::Backend(format!("unsupported protocol: {}", other))),
    }
}
