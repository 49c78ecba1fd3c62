pub mod connections;
pub mod stream;
