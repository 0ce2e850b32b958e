#![warn(
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unreachable_pub,
    missing_docs,
    rust_2018_idioms
)]

//! The reusable library powering `segload`: a multi-cluster bulk upload
//! engine for segment files.

pub mod cli;
pub mod cluster;
pub mod config;
pub mod counter;
pub mod duration;
pub mod emitter;
pub mod error;
pub mod observer;
pub mod pool;
pub mod segfile;
pub mod shared;
pub mod store;
pub mod strategy;
pub mod template;
pub mod uploader;
