pub mod api;
pub mod buffer;
pub mod config;
pub mod deck;
pub mod gateway;
pub mod pty;
pub mod rate_limit;
pub mod reaper;
pub mod session;
pub mod shell;
pub mod shutdown;
pub mod store;
