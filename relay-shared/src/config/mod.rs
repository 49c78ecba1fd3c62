//! # Configuration
//!
//! This module contains the configuration model for the Relay server and the
//! loader that resolves it from defaults, files, and the environment.

pub mod server;
