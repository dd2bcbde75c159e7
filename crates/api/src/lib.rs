//! HTTP API: producer intake, operator queries and process wiring.

pub mod app;
