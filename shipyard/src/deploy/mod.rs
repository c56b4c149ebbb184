//! Deployment lifecycle

pub mod bundle;
pub mod docker;
pub mod fsm;
pub mod manager;
pub mod ports;
pub mod probe;
pub mod process;
pub mod registry;
pub mod runtime;
pub mod stager;
pub mod tunnel;
