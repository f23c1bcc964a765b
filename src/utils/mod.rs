//! Bootstrap and retry helpers shared by the client and its binaries.

pub mod bootstrap;
pub mod retry;
