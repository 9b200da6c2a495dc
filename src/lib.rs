pub mod api;
pub mod config;
pub mod context;
pub mod daemon;
pub mod session;
pub mod supervisor;
