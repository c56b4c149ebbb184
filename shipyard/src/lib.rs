//! Shipyard
//!
//! Turns an uploaded bundle of application source files into a running,
//! publicly reachable web application, and tears it down again on request,
//! on repeated failure, or when the process exits.

pub mod app;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod http;
pub mod logs;
pub mod models;
pub mod server;
pub mod storage;
pub mod utils;
pub mod workers;
