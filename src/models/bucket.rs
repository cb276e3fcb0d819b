//! Represents a logical bucket — a top-level container for objects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A storage bucket.
///
/// Buckets are the top-level namespace for stored objects. The name is
/// globally unique and immutable once the bucket has been created.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Bucket {
    /// Unique identifier for this bucket (UUID for internal DB use).
    pub id: Uuid,

    /// Globally unique bucket name (must conform to DNS naming rules).
    pub name: String,

    /// Location constraint recorded at creation time (e.g. "local").
    pub region: String,

    /// When this bucket was created.
    pub created_at: DateTime<Utc>,
}
