//! JIT registration-token minting for FPGA CI runners.
//!
//! Authenticates as a GitHub App, exchanges the App assertion for an
//! installation-scoped access token, requests a one-time JIT runner
//! config bound to a specific FPGA board's runner identity, and hands the
//! result off. The binary entry point is in main.rs.

pub mod config;
pub mod delivery;
pub mod error;
pub mod github;
pub mod pipeline;
pub mod retry;
pub mod runner;
pub mod signer;
