//! mesh-core: the backend-agnostic half of the durable mesh workflow
//! orchestration engine. Compiler/Deployer, Serializer, Activities, Engine,
//! Router, Quorum, TaskService and Reporter live here; `Store`/`Stream`/`Sub`
//! are traits only — concrete backends are sibling crates (`mesh-store-redis`,
//! `mesh-store-sql`).

pub mod activities;
pub mod cache;
pub mod compiler;
pub mod config;
pub mod engine;
pub mod error;
pub mod keyminter;
pub mod manifest;
pub mod quorum;
pub mod reporter;
pub mod router;
pub mod serializer;
pub mod store;
pub mod stream;
pub mod sub;
pub mod symbols;
pub mod task_service;

pub use error::{MeshError, MeshResult};
