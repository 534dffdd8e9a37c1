//! Herald - notification fan-out over a topic exchange
//!
//! Routes domain events published by unrelated services into per-user
//! notifications and streams them to connected clients.

pub mod bus;
pub mod config;
pub mod delivery;
pub mod directory;
pub mod fanout;
pub mod notifications;
pub mod storage;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
