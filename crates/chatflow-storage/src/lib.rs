//! Chatflow Storage - Database abstraction
//!
//! This crate provides the persistence layer for Chatflow: the connection
//! pool, row models, and one repository per aggregate.

pub mod db;
pub mod models;
pub mod repository;

pub use db::{Database, DatabasePool};
pub use models::*;
pub use repository::*;
