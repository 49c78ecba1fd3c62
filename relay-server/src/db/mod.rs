//! Database bootstrap for the Postgres message log.

pub mod bootstrap;
