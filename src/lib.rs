// Library interface for pgvault
// The binary, integration tests and benchmarks all go through these modules

pub mod config;
pub mod error;
pub mod exec;
pub mod logging;
pub mod protocol;
