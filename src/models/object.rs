//! Represents an object (blob) stored in a bucket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Metadata for a single object within a bucket.
///
/// The payload bytes live on disk; this struct carries everything the
/// HTTP layer needs to answer GET/HEAD/List without touching the file.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Object {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Foreign key linking to the parent bucket.
    pub bucket_id: Uuid,

    /// Object key (path-like identifier, unique within the bucket).
    pub key: String,

    /// MIME type supplied on upload, echoed back verbatim on reads.
    pub content_type: Option<String>,

    /// Content encoding supplied on upload (e.g. "gzip"), echoed back
    /// verbatim on reads. The server never transcodes the payload.
    pub content_encoding: Option<String>,

    /// Size in bytes. Always matches the stored payload length.
    pub size_bytes: i64,

    /// MD5 hex digest of the payload, used as the ETag.
    pub etag: Option<String>,

    /// Timestamp of the last successful put.
    pub last_modified: DateTime<Utc>,

    /// Delete marker. Soft-deleted rows are invisible to every read path.
    pub is_deleted: bool,
}
