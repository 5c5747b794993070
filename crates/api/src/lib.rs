//! HTTP API: server, routing, delivery handlers.

pub mod app;
pub mod delivery;
pub mod middleware;
