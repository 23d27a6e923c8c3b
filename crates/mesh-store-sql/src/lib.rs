//! SQL emulation of the backend's `Store`/`Stream`/`Sub` contracts, over
//! `sqlx`/Postgres. Every Redis-shaped primitive (hash, list, sorted set,
//! string) gets its own table; streams get an append-only log plus
//! group/pending tables; time-hook awakenings ride Postgres
//! `LISTEN`/`NOTIFY` instead of polling.

mod reporter;
mod store;
mod stream;
mod sub;

pub use reporter::SqlReporter;
pub use store::SqlStore;
pub use stream::SqlStream;
pub use sub::SqlSub;

use mesh_core::error::{MeshError, MeshResult};
use sqlx::postgres::PgPoolOptions;

pub async fn connect(database_url: &str) -> MeshResult<sqlx::PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .map_err(|e| MeshError::StorageError(e.to_string()))
}

pub async fn migrate(pool: &sqlx::PgPool) -> MeshResult<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| MeshError::StorageError(e.to_string()))
}

/// Translate a Redis-style glob (`*`, `?`) into a SQL `LIKE` pattern.
/// `find_jobs`/`SCAN` use this so both backends accept the same pattern
/// syntax from callers.
pub(crate) fn glob_to_like(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        match c {
            '*' => out.push('%'),
            '?' => out.push('_'),
            '%' | '_' => {
                out.push('\\');
                out.push(c);
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_translates_wildcards() {
        assert_eq!(glob_to_like("hmsh:ns:state:*"), "hmsh:ns:state:%");
        assert_eq!(glob_to_like("a?c"), "a_c");
        assert_eq!(glob_to_like("100%done"), "100\\%done");
    }
}
