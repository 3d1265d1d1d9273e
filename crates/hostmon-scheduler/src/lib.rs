//! Task scheduler of the hostmon agent.
//!
//! Requests for metrics arrive in batches per client. The [`Manager`]
//! resolves each key through the [`AliasTable`], finds the owning plugin
//! and turns the request into a [`task::Task`] queued in that plugin's
//! heap. Plugins themselves sit in a global heap ordered by their earliest
//! due task, so picking the next task to run is O(log n) in both the number
//! of plugins and the number of tasks. A task only leaves its heap when its
//! weight fits in the plugin's free capacity.

pub mod agent;
pub mod alias;
mod client;
pub mod error;
pub mod heap;
pub mod manager;
pub mod regexp;
pub mod task;

pub use alias::AliasTable;
pub use error::{AliasError, Result, SchedulerError, TaskError};
pub use manager::{Manager, ManagerHandle, SchedulerOptions};
pub use regexp::{Expression, ExpressionType, GlobalRegexp};
