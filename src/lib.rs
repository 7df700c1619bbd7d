#![forbid(unsafe_code)]

//! Shared library for the tokgrab binaries: the backend HTTP server and the
//! command-line download client.

pub mod config;
pub mod extract;
pub mod jobs;
pub mod progress;
pub mod security;
