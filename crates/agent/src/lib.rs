//! Power agent process wiring: environment configuration and HTTP API

pub mod api;
pub mod config;
