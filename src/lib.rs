//! blobdepot — a local, disk-backed, S3-compatible object store server.
//!
//! Object payloads live on the filesystem (one directory per bucket, one
//! file per escaped key); bucket and object metadata live in an embedded
//! SQLite database so content-type/encoding survive a restart. The HTTP
//! surface is path-style S3: CreateBucket, DeleteBucket, PutObject,
//! GetObject, HeadObject, DeleteObject, ListObjectsV2.

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod server;
pub mod services;
