//! Crate-wide result alias.

pub type Result<T, E = anyhow::Error> = std::result::Result<T, E>;
