//! Request and response models

pub mod deployment;
