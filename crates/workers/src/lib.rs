//! `workers` crate — the `TaskWorker` contract and the `NodeContext` that
//! flows through it.
//!
//! Every task node — user-defined and the engine's synthetic root/end nodes
//! alike — is backed by a [`TaskWorker`]. The engine crate drives execution
//! through this trait object and persists whatever the worker wrote into its
//! [`NodeContext`] after each hook returns.

pub mod adapters;
pub mod context;
pub mod error;
pub mod mock;
pub mod traits;

pub use adapters::{FnWorker, NoopWorker};
pub use context::NodeContext;
pub use error::WorkerError;
pub use traits::TaskWorker;
