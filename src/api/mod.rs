//! HTTP/JSON control plane over the engine: task catalog, job CRUD,
//! execution logs, and analytics derivations.

pub mod auth;
pub mod routes;
pub mod server;
pub mod types;

pub use server::{router, serve};
