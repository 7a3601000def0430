//! Configuration, logging and snapshot helpers.

pub mod config;
pub mod logging;
pub mod persistence;
