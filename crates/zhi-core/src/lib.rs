//! Core building blocks shared by every zhi crate: chat message types,
//! configuration, and small path/string helpers.

pub mod config;
pub mod types;
pub mod utils;
