//! Defines routes for all S3-like bucket and object operations.
//!
//! ## Structure
//! - **Service-level endpoints**
//!   - `GET    /` — list buckets
//!
//! - **Bucket-level endpoints**
//!   - `GET    /{bucket}` — list objects (supports prefix, delimiter, max-keys)
//!   - `PUT    /{bucket}` — create bucket
//!   - `DELETE /{bucket}` — delete bucket (refused while non-empty)
//!
//! - **Object-level endpoints**
//!   - `PUT    /{bucket}/{*key}` — upload object
//!   - `GET    /{bucket}/{*key}` — download object
//!   - `HEAD   /{bucket}/{*key}` — retrieve metadata only
//!   - `DELETE /{bucket}/{*key}` — delete object
//!
//! The wildcard `*key` allows nested keys like `photos/2025/img.jpg`.
//! Every method/path combination outside this set answers 501
//! NotImplemented instead of falling through as a bare 404/405.

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        object_handlers::{
            create_bucket, delete_bucket, delete_object, get_object, head_object, list_buckets,
            list_objects, not_implemented, upload_object,
        },
    },
    services::storage_service::StorageService,
};
use axum::{
    Router,
    routing::get,
};

/// Build and return the router for all S3-compatible routes.
///
/// The router carries shared state (`StorageService`) to all handlers.
pub fn routes() -> Router<StorageService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Service-level routes
        .route("/", get(list_buckets))
        // Object-level routes
        .route(
            "/{bucket}/{*key}",
            get(get_object)
                .put(upload_object)
                .head(head_object)
                .delete(delete_object),
        )
        // Bucket-level routes
        .route(
            "/{bucket}",
            get(list_objects).put(create_bucket).delete(delete_bucket),
        )
        .fallback(not_implemented)
        .method_not_allowed_fallback(not_implemented)
}
