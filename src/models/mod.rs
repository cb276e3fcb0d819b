//! Core data models for the object store.
//!
//! These entities represent the logical structure of buckets and objects.
//! They map to SQLite rows via `sqlx::FromRow` and serialize naturally as
//! JSON via `serde`.

pub mod bucket;
pub mod object;
