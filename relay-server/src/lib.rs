#![cfg_attr(not(test), forbid(unsafe_code))]

//! Relay server: durable broadcast log, idempotent publishing, cross-process
//! fan-out and gap-free stream recovery behind an axum HTTP surface.

pub mod app_state;
pub mod bus;
pub mod connection;
pub mod db;
pub mod fanout;
pub mod handlers;
pub mod http;
pub mod middleware;
pub mod publisher;
pub mod recovery;
pub mod registry;
pub mod routes;
pub mod server;
pub mod store;
mod tracer;
