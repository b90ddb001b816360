//! sketchlink - pub/sub client for remote sketch builds
//!
//! A Rust client library for submitting verify/upload jobs for source
//! sketches to a remote build worker over a publish/subscribe broker,
//! correlating the asynchronous two-phase reply (accept, then result)
//! back to the originating request.

pub mod config;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod report;
pub mod session;
pub mod topic;
pub mod transport;
