pub mod cat;
pub mod create;
pub mod diff;
pub mod init;
pub mod keep;
pub mod ls;
pub mod pull;
pub mod purge;
pub mod push;
pub mod server;
pub mod stdio;
pub mod sync;

use anyhow::{anyhow, Result};
use coffre_core::Repository;
use uuid::Uuid;

/// Resolve a snapshot argument: a full UUID or an unambiguous prefix.
pub async fn resolve_snapshot(repository: &Repository, id: &str) -> Result<Uuid> {
    if let Ok(uuid) = Uuid::parse_str(id) {
        return Ok(uuid);
    }

    let prefix = id.to_lowercase();
    let matches: Vec<Uuid> = repository
        .get_indexes()
        .await?
        .into_iter()
        .filter(|uuid| uuid.to_string().starts_with(&prefix))
        .collect();

    match matches.as_slice() {
        [uuid] => Ok(*uuid),
        [] => Err(anyhow!("no snapshot matches {}", id)),
        _ => Err(anyhow!("{} is ambiguous, use a longer prefix", id)),
    }
}

/// Split a `<snapshot>[:<path>]` argument.
pub fn parse_snapshot_id(arg: &str) -> (&str, Option<&str>) {
    match arg.split_once(':') {
        Some((id, pattern)) if !pattern.is_empty() => (id, Some(pattern)),
        Some((id, _)) => (id, None),
        None => (arg, None),
    }
}
