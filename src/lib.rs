//! Channel relay: watches source channels and re-publishes their posts to
//! one destination, with optional text rewriting and album reassembly.

pub mod channels;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod rewrite;
pub mod store;
