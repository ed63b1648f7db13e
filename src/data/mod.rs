//! Database models and operations.

pub mod loading;
pub mod models;
pub mod queue;
