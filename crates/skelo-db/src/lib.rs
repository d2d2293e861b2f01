//! Persistence layer for skelo: SQLite pool management, row models, and
//! query functions for the `tasks`, `audit_log`, and `templates` tables.

pub mod config;
pub mod ids;
pub mod models;
pub mod pool;
pub mod queries;
