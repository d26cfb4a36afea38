//! Perch core library: the gateway connection layer and the browser-facing
//! server built on it. Used by the CLI.

pub mod config;
pub mod gateway;
pub mod server;
