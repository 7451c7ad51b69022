//! The control server thread and its bridge into the scheduler loop.
//!
//! The server never touches simulator state: every request crosses
//! into the loop thread over [`bridge::Bridge`] and the reply crosses
//! back correlated by tag. [`service::WmediumdService`] is the typed
//! method surface with validation; [`server::serve`] is the framed
//! transport in front of it.

pub mod bridge;
pub mod server;
pub mod service;
