//! Infrastructure layer: transactions, outbox, catalog storage, config.

pub mod catalog;
pub mod config;
pub mod db;
pub mod library;
pub mod outbox;

mod integration_tests;
