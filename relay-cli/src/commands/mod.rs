pub mod chat;
pub mod completion;
pub mod config;
pub mod sse;
pub mod state;
