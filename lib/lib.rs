pub mod build_info;
pub mod cli;
pub mod codec;
pub mod commands;
pub mod config;
pub mod coordinator;
pub mod decoder;
pub mod executor;
pub mod logging;
pub mod protocol;
pub mod pump;
pub mod server;
pub mod sinks;
pub mod source;
pub mod spool;
pub mod state;
