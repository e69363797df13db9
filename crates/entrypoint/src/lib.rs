//! Entrypoint library. The binaries and integration tests build on these modules.

pub mod config;
pub mod deps;
pub mod discovery;
pub mod error;
pub mod log;
pub mod pid1;
pub mod ready;
pub mod retry;
pub mod store;
