#![cfg_attr(not(test), forbid(unsafe_code))]

//! Configuration and wire models shared by the Relay server and client.

pub mod config;
pub mod models;
