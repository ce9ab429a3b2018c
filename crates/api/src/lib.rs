//! HTTP API and command-line entry points for the email queue.

pub mod app;
pub mod cli;
pub mod middleware;
