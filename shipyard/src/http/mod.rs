//! HTTP client for the daemon API

pub mod client;
