//! Service discovery helpers built on scope registries

pub mod waiter;

pub use waiter::{wait_for_members, ServiceWaiter};
