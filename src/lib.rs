/// Voice Wall - realtime feed client
///
/// Keeps a local, ordered view of the community wall in sync with a hosted
/// backend: posts, their comments and reaction tallies, with optimistic
/// reactions that roll back when the backend rejects them.

pub mod aggregate;
pub mod auth;
pub mod backend;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod context;
pub mod error;
pub mod model;
pub mod mutation;
pub mod prefs;
pub mod session;
pub mod submit;
pub mod view;

pub use config::ClientConfig;
pub use context::WallContext;
pub use error::{WallError, WallResult};
