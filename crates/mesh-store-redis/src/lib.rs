//! Native Redis-compatible backend for `mesh-core`'s `Store`/`Stream`/`Sub`
//! traits. One struct per trait, each holding a cheap-to-clone handle
//! (`redis::aio::ConnectionManager` reconnects transparently) plus a
//! `KeyMinter` for canonical key construction.

mod reporter;
mod store;
mod stream;
mod sub;

pub use reporter::RedisReporter;
pub use store::RedisStore;
pub use stream::RedisStream;
pub use sub::RedisSub;

use mesh_core::error::{MeshError, MeshResult};

/// Build a `ConnectionManager` from a `redis://` URL, mapping connection
/// failure into the shared `StorageError` variant.
pub async fn connect(url: &str) -> MeshResult<redis::aio::ConnectionManager> {
    let client = redis::Client::open(url).map_err(|e| MeshError::StorageError(e.to_string()))?;
    client
        .get_connection_manager()
        .await
        .map_err(|e| MeshError::StorageError(e.to_string()))
}
