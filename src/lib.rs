//! Local-first data sync for a sports club app.
//!
//! A SQLite cache, a hosted document store and three ways of keeping them
//! consistent: cached streams ([`sync::Synchronizer`]), shared live feeds
//! ([`sync::LiveBridge`]) and cursor paging ([`sync::Paginator`]).

pub mod cache;
pub mod config;
pub mod error;
pub mod models;
pub mod remote;
pub mod repository;
pub mod session;
pub mod signature;
pub mod sync;

pub use error::SyncError;
pub use repository::Repository;
