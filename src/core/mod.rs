pub mod config;
pub mod conversation;
pub mod error;
pub mod session;
pub mod stream;
pub mod vault;
