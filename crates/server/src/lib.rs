//! HTTP front end for the Conduit gateway: configuration loading, runtime
//! assembly, the axum API and tracing setup.

pub mod api;
pub mod config;
pub mod error;
pub mod runtime;
pub mod telemetry;
