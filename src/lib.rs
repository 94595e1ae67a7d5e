//! Camera Relay - on-demand camera capture served over HTTP.
//!
//! `/stream` shares one continuous capture process between every connected
//! client; `/still` runs a fresh capture per request.

pub mod capture;
pub mod config;
pub mod relay;
pub mod server;
pub mod session;
pub mod snapshot;
pub mod trace;
