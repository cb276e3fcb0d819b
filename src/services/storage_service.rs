//! StorageService — S3-like bucket and object operations backed by SQLite
//! for metadata and the local filesystem for payloads.
//!
//! On-disk layout is one directory per bucket under `base_path`, holding
//! one file per object key with path-unsafe bytes percent-escaped. Every
//! put writes to a temp file, fsyncs, and renames into place, so a
//! half-written upload is never visible as a complete object. The SQLite
//! index is the source of truth for listings: a row is live iff its
//! payload file is retrievable, and `reconcile` restores that invariant
//! after a crash.

use crate::models::{bucket::Bucket, object::Object};
use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt, pin_mut};
use md5::Context;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use sqlx::{QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::{
    collections::{BTreeSet, HashMap},
    io::{self, ErrorKind},
    path::PathBuf,
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
    sync::Mutex,
};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct ListObjectsParams {
    pub prefix: Option<String>,
    pub delimiter: Option<String>,
    pub continuation_token: Option<String>,
    pub start_after: Option<String>,
    pub max_keys: usize,
}

#[derive(Debug)]
pub struct ListObjectsResult {
    pub objects: Vec<Object>,
    pub common_prefixes: Vec<String>,
    pub is_truncated: bool,
    pub next_continuation_token: Option<String>,
    pub key_count: usize,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("bucket `{0}` not found")]
    BucketNotFound(String),
    #[error("bucket `{0}` already exists")]
    BucketAlreadyExists(String),
    #[error("bucket `{0}` is not empty")]
    BucketNotEmpty(String),
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("region `{0}` is not supported")]
    UnsupportedRegion(String),
    #[error("object `{key}` not found in bucket `{bucket}`")]
    ObjectNotFound { bucket: String, key: String },
    #[error("invalid object key")]
    InvalidObjectKey,
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

const MAX_OBJECT_KEY_LEN: usize = 1024;
// Escaped keys become single filenames; stay under common OS limits.
const MAX_ESCAPED_KEY_LEN: usize = 240;
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;
const SUPPORTED_REGIONS: [&str; 9] = [
    "local",
    "us-east-1",
    "us-east-2",
    "us-west-1",
    "us-west-2",
    "eu-west-1",
    "eu-central-1",
    "ap-southeast-1",
    "ap-northeast-1",
];

// Everything outside [A-Za-z0-9._-] is escaped when a key becomes a filename.
const KEY_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'.').remove(b'_');

/// StorageService provides the S3-like operation set:
/// - create/delete/list buckets
/// - put/get/head/list/delete objects
///
/// The struct is cheap to clone and shared across all request workers.
/// Operations on the same (bucket, key) pair are serialized through a
/// per-key lock so that a put which returned success is visible to every
/// later get, and concurrent puts are last-writer-wins in full.
#[derive(Clone)]
pub struct StorageService {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where object payloads are stored.
    pub base_path: PathBuf,

    key_locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl StorageService {
    /// Create a new StorageService backed by the provided SQLite pool and
    /// using `base_path` as the root directory for object payloads.
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
            key_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Reject keys that cannot be stored safely.
    ///
    /// Empty keys, oversized keys, traversal sequences, and control bytes
    /// are all invalid. The escaped form must also fit in one filename.
    fn ensure_key_safe(&self, key: &str) -> StorageResult<()> {
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return Err(StorageError::InvalidObjectKey);
        }
        if key.starts_with('/') || key.contains("..") {
            return Err(StorageError::InvalidObjectKey);
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(StorageError::InvalidObjectKey);
        }
        if escape_key(key).len() > MAX_ESCAPED_KEY_LEN {
            return Err(StorageError::InvalidObjectKey);
        }
        Ok(())
    }

    fn ensure_bucket_name_safe(&self, name: &str) -> StorageResult<()> {
        validate_bucket_name(name).map_err(|reason| StorageError::InvalidBucketName {
            name: name.to_string(),
            reason,
        })
    }

    /// Validate a region string against SUPPORTED_REGIONS, case-insensitively.
    fn ensure_region_valid(&self, region: &str) -> StorageResult<()> {
        if SUPPORTED_REGIONS
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(region))
        {
            Ok(())
        } else {
            Err(StorageError::UnsupportedRegion(region.to_string()))
        }
    }

    /// Physical directory for a bucket. Does not check for existence.
    fn bucket_root(&self, bucket_name: &str) -> PathBuf {
        self.base_path.join(bucket_name)
    }

    /// Payload path for an object: `base_path/{bucket}/{escaped-key}`.
    fn object_path(&self, bucket_name: &str, key: &str) -> PathBuf {
        self.bucket_root(bucket_name).join(escape_key(key))
    }

    /// Fetch (or create) the lock serializing writes to one (bucket, key).
    ///
    /// The registry itself is only held long enough to clone the entry, so
    /// disk I/O never blocks unrelated keys.
    async fn key_lock(&self, bucket: &str, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.key_locks.lock().await;
        locks
            .entry(format!("{}/{}", bucket, key))
            .or_default()
            .clone()
    }

    /// Fetch bucket metadata, mapping a missing row to BucketNotFound.
    async fn fetch_bucket(&self, bucket: &str) -> StorageResult<Bucket> {
        self.ensure_bucket_name_safe(bucket)?;
        sqlx::query_as::<Sqlite, Bucket>(
            "SELECT id, name, region, created_at FROM buckets WHERE name = ?",
        )
        .bind(bucket)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StorageError::BucketNotFound(bucket.to_string()),
            other => StorageError::Sqlx(other),
        })
    }

    /// Fetch a live (non-deleted) object row.
    async fn fetch_object(&self, bucket: &Bucket, key: &str) -> StorageResult<Object> {
        sqlx::query_as::<_, Object>(
            "SELECT id, bucket_id, key, content_type, content_encoding, size_bytes,
                    etag, last_modified, is_deleted
             FROM objects
             WHERE key = ? AND bucket_id = ? AND is_deleted = 0",
        )
        .bind(key)
        .bind(bucket.id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StorageError::ObjectNotFound {
                bucket: bucket.name.clone(),
                key: key.to_string(),
            },
            other => StorageError::Sqlx(other),
        })
    }

    /// Create a bucket and initialize its directory.
    ///
    /// Returns BucketAlreadyExists on a name conflict; the UNIQUE
    /// constraint on `buckets.name` is the arbiter under concurrency.
    pub async fn create_bucket(&self, name: &str, region: String) -> StorageResult<Bucket> {
        self.ensure_bucket_name_safe(name)?;
        let normalized_region = region.to_lowercase();
        self.ensure_region_valid(&normalized_region)?;

        fs::create_dir_all(self.bucket_root(name)).await?;

        let bucket = Bucket {
            id: Uuid::new_v4(),
            name: name.to_string(),
            region: normalized_region,
            created_at: Utc::now(),
        };

        match sqlx::query("INSERT INTO buckets (id, name, region, created_at) VALUES (?, ?, ?, ?)")
            .bind(bucket.id)
            .bind(&bucket.name)
            .bind(&bucket.region)
            .bind(bucket.created_at)
            .execute(&*self.db)
            .await
        {
            Ok(_) => Ok(bucket),
            Err(err) if is_unique_violation(&err) => {
                Err(StorageError::BucketAlreadyExists(name.to_string()))
            }
            Err(err) => Err(StorageError::Sqlx(err)),
        }
    }

    /// Delete a bucket, refusing while it still holds live objects.
    ///
    /// Soft-deleted object rows are purged by the FK cascade; the bucket
    /// directory is removed best-effort afterwards.
    pub async fn delete_bucket(&self, name: &str) -> StorageResult<()> {
        let bucket = self.fetch_bucket(name).await?;

        let live: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM objects WHERE bucket_id = ? AND is_deleted = 0",
        )
        .bind(bucket.id)
        .fetch_one(&*self.db)
        .await?;
        if live > 0 {
            return Err(StorageError::BucketNotEmpty(name.to_string()));
        }

        let result = sqlx::query("DELETE FROM buckets WHERE id = ?")
            .bind(bucket.id)
            .execute(&*self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::BucketNotFound(name.to_string()));
        }

        if let Err(err) = fs::remove_dir_all(self.bucket_root(name)).await {
            if err.kind() != ErrorKind::NotFound {
                debug!(
                    "failed to remove bucket directory for `{}` after delete: {}",
                    name, err
                );
            }
        }

        Ok(())
    }

    /// List all buckets in creation order.
    pub async fn list_buckets(&self) -> StorageResult<Vec<Bucket>> {
        let buckets = sqlx::query_as::<_, Bucket>(
            "SELECT id, name, region, created_at FROM buckets ORDER BY created_at ASC, name ASC",
        )
        .fetch_all(&*self.db)
        .await?;
        Ok(buckets)
    }

    /// Stream-upload an object to disk and upsert its metadata row.
    ///
    /// Bytes are written incrementally to a temp file while the MD5 etag
    /// and size accumulate, then fsynced and renamed into the final path.
    /// An aborted stream removes the temp file and leaves any previous
    /// version of the object fully visible.
    pub async fn put_object_stream<S>(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<String>,
        content_encoding: Option<String>,
        stream: S,
    ) -> StorageResult<Object>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        self.ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;

        let lock = self.key_lock(&bucket_rec.name, key).await;
        let _guard = lock.lock().await;

        let file_path = self.object_path(&bucket_rec.name, key);
        fs::create_dir_all(self.bucket_root(&bucket_rec.name)).await?;
        let tmp_path = self
            .bucket_root(&bucket_rec.name)
            .join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size_bytes: i64 = 0;
        let mut digest = Context::new();
        pin_mut!(stream);
        while let Some(chunk_res) = stream.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(StorageError::Io(err));
                }
            };
            size_bytes += chunk.len() as i64;
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::Io(err));
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(&file_path).await?;
                fs::rename(&tmp_path, &file_path).await?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::Io(err));
            }
        }

        let etag = format!("{:x}", digest.compute());
        let insert_result = sqlx::query_as::<_, Object>(
            r#"
            INSERT INTO objects (
                id, bucket_id, key, content_type, content_encoding,
                size_bytes, etag, last_modified, is_deleted
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0)
            ON CONFLICT(bucket_id, key) DO UPDATE SET
                content_type = excluded.content_type,
                content_encoding = excluded.content_encoding,
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                last_modified = excluded.last_modified,
                is_deleted = 0
            RETURNING id, bucket_id, key, content_type, content_encoding,
                      size_bytes, etag, last_modified, is_deleted
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(bucket_rec.id)
        .bind(key)
        .bind(content_type)
        .bind(content_encoding)
        .bind(size_bytes)
        .bind(&etag)
        .bind(Utc::now())
        .fetch_one(&*self.db)
        .await;

        match insert_result {
            Ok(obj) => Ok(obj),
            Err(err) => {
                let _ = fs::remove_file(&file_path).await;
                Err(StorageError::Sqlx(err))
            }
        }
    }

    /// Fetch an object for reading.
    ///
    /// Returns metadata and an opened File handle ready for streaming out.
    /// A row whose payload file has gone missing reads as ObjectNotFound.
    pub async fn get_object_reader(
        &self,
        bucket: &str,
        key: &str,
    ) -> StorageResult<(Object, File)> {
        self.ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;
        let object = self.fetch_object(&bucket_rec, key).await?;

        let file_path = self.object_path(&bucket_rec.name, key);
        let file = File::open(&file_path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StorageError::ObjectNotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                }
            } else {
                StorageError::Io(err)
            }
        })?;

        Ok((object, file))
    }

    /// Fetch only object metadata (HEAD).
    pub async fn get_object_metadata(&self, bucket: &str, key: &str) -> StorageResult<Object> {
        self.ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;
        self.fetch_object(&bucket_rec, key).await
    }

    /// List objects following S3 ListObjectsV2 rules: prefix filtering,
    /// delimiter grouping, continuation tokens, ascending key order.
    pub async fn list_objects_v2(
        &self,
        bucket: &str,
        params: ListObjectsParams,
    ) -> StorageResult<ListObjectsResult> {
        let bucket_rec = self.fetch_bucket(bucket).await?;
        let max_keys = params.max_keys.clamp(1, 1000);
        let fetch_limit = max_keys + 1;

        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT id, bucket_id, key, content_type, content_encoding, size_bytes, \
             etag, last_modified, is_deleted \
             FROM objects WHERE bucket_id = ",
        );
        builder.push_bind(bucket_rec.id);
        builder.push(" AND is_deleted = 0");

        if let Some(prefix) = &params.prefix {
            builder.push(" AND key LIKE ");
            builder.push_bind(format!("{}%", like_escape(prefix)));
            builder.push(" ESCAPE '\\'");
        }

        if let Some(token) = params
            .continuation_token
            .as_ref()
            .or(params.start_after.as_ref())
        {
            builder.push(" AND key > ");
            builder.push_bind(token);
        }

        builder.push(" ORDER BY key ASC LIMIT ");
        builder.push_bind(fetch_limit as i64);

        let mut rows: Vec<Object> = builder.build_query_as().fetch_all(&*self.db).await?;

        let mut is_truncated = false;
        let mut next_continuation_token = None;
        if rows.len() == fetch_limit {
            if let Some(last) = rows.pop() {
                next_continuation_token = Some(last.key.clone());
            }
            is_truncated = true;
        }

        let mut contents = Vec::new();
        let mut common_prefixes = BTreeSet::new();
        for obj in rows.into_iter() {
            if let Some(delim) = &params.delimiter {
                if let Some(prefix) =
                    compute_common_prefix(&obj.key, params.prefix.as_deref(), delim)
                {
                    common_prefixes.insert(prefix);
                    continue;
                }
            }
            contents.push(obj);
        }

        let key_count = contents.len() + common_prefixes.len();

        Ok(ListObjectsResult {
            objects: contents,
            common_prefixes: common_prefixes.into_iter().collect(),
            is_truncated,
            next_continuation_token,
            key_count,
        })
    }

    /// Soft-delete an object and unlink its payload.
    ///
    /// Deleting an already-absent object reports ObjectNotFound, so
    /// repeated deletes are answered consistently.
    pub async fn delete_object(&self, bucket: &str, key: &str) -> StorageResult<Object> {
        self.ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;

        let lock = self.key_lock(&bucket_rec.name, key).await;
        let _guard = lock.lock().await;

        let object = self.fetch_object(&bucket_rec, key).await?;

        let result =
            sqlx::query("UPDATE objects SET is_deleted = 1 WHERE key = ? AND bucket_id = ?")
                .bind(key)
                .bind(bucket_rec.id)
                .execute(&*self.db)
                .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::ObjectNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }

        let file_path = self.object_path(&bucket_rec.name, key);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed payload {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("payload {} already missing", file_path.display());
            }
            Err(err) => return Err(StorageError::Io(err)),
        }

        Ok(object)
    }

    /// Startup sweep: drop index rows whose payload file is missing.
    ///
    /// Keeps the invariant that an object is listed iff its bytes are
    /// retrievable, even after a crash between unlink and row update.
    pub async fn reconcile(&self) -> StorageResult<u64> {
        let rows: Vec<(Uuid, String, String)> = sqlx::query_as(
            "SELECT objects.id, buckets.name, objects.key
             FROM objects JOIN buckets ON buckets.id = objects.bucket_id
             WHERE objects.is_deleted = 0",
        )
        .fetch_all(&*self.db)
        .await?;

        let mut repaired = 0;
        for (id, bucket, key) in rows {
            match fs::metadata(self.object_path(&bucket, &key)).await {
                Ok(_) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    warn!("dropping stale index entry for `{}/{}`", bucket, key);
                    sqlx::query("UPDATE objects SET is_deleted = 1 WHERE id = ?")
                        .bind(id)
                        .execute(&*self.db)
                        .await?;
                    repaired += 1;
                }
                Err(err) => return Err(StorageError::Io(err)),
            }
        }

        Ok(repaired)
    }
}

/// Escape an object key into a single safe filename.
///
/// Every byte outside `[A-Za-z0-9._-]` is percent-encoded, so `a/b` and
/// `a%2Fb` map to distinct files and no key can escape the bucket dir.
fn escape_key(key: &str) -> String {
    utf8_percent_encode(key, KEY_ESCAPE).to_string()
}

/// Escape LIKE metacharacters so a prefix matches literally.
fn like_escape(prefix: &str) -> String {
    prefix
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

/// Enforce S3-like bucket naming rules:
/// - 3–63 characters
/// - lowercase letters, digits, dots, hyphens only
/// - must start and end with a letter or digit
/// - no consecutive dots or dot-hyphen patterns
/// - must not look like an IPv4 address
fn validate_bucket_name(name: &str) -> Result<(), String> {
    if name.trim() != name {
        return Err("cannot begin or end with whitespace".into());
    }
    if name.len() < BUCKET_NAME_MIN_LEN || name.len() > BUCKET_NAME_MAX_LEN {
        return Err("must be between 3 and 63 characters".into());
    }
    if !name
        .chars()
        .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
    {
        return Err("allowed characters are lowercase letters, digits, dots, and hyphens".into());
    }
    if name.starts_with('.') || name.ends_with('.') || name.starts_with('-') || name.ends_with('-')
    {
        return Err("must start and end with a lowercase letter or digit".into());
    }
    if name.contains("..") || name.contains("-.") || name.contains(".-") {
        return Err("cannot contain consecutive dots or dot-hyphen combinations".into());
    }
    if is_ipv4_like(name) {
        return Err("must not be formatted like an IP address".into());
    }
    Ok(())
}

/// Group a key under its delimiter-bounded common prefix for listings.
///
/// Returns the requested prefix extended to the first delimiter occurring
/// after it, or None when the key has no further delimiter and belongs in
/// Contents. Grouping always operates on logical keys as stored in the
/// index; filename escaping is a disk-layout concern and never leaks into
/// listing results.
fn compute_common_prefix(
    key: &str,
    requested_prefix: Option<&str>,
    delimiter: &str,
) -> Option<String> {
    let prefix = requested_prefix.unwrap_or("");
    let rest = key.strip_prefix(prefix)?;
    let end = rest.find(delimiter)? + delimiter.len();
    Some(format!("{}{}", prefix, &rest[..end]))
}

/// Check if a string matches IPv4-like dotted decimal form.
fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() != 4 {
        return false;
    }
    parts.iter().all(|segment| {
        !segment.is_empty()
            && segment.len() <= 3
            && segment.chars().all(|c| c.is_ascii_digit())
            && segment.parse::<u8>().is_ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use futures::stream;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    async fn service(dir: &TempDir) -> StorageService {
        let pool = db::connect(dir.path().join("meta.db")).await.unwrap();
        db::run_migrations(&pool).await.unwrap();
        StorageService::new(Arc::new(pool), dir.path().join("objects"))
    }

    fn body(bytes: &'static [u8]) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
        stream::iter(vec![Ok(Bytes::from_static(bytes))])
    }

    fn list_all() -> ListObjectsParams {
        ListObjectsParams {
            prefix: None,
            delimiter: None,
            continuation_token: None,
            start_after: None,
            max_keys: 1000,
        }
    }

    async fn read_payload(file: &mut File) -> Vec<u8> {
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await.unwrap();
        buf
    }

    #[test]
    fn escape_key_keeps_safe_bytes_and_encodes_the_rest() {
        assert_eq!(escape_key("hello.txt"), "hello.txt");
        assert_eq!(escape_key("hello/hello.txt"), "hello%2Fhello.txt");
        assert_eq!(escape_key("a b%c"), "a%20b%25c");
        assert_eq!(escape_key("under_score-dash"), "under_score-dash");
    }

    #[test]
    fn common_prefix_extends_to_the_first_delimiter_after_the_prefix() {
        assert_eq!(
            compute_common_prefix("logs/2025/a.txt", None, "/").as_deref(),
            Some("logs/")
        );
        assert_eq!(
            compute_common_prefix("logs/2025/a.txt", Some("logs/"), "/").as_deref(),
            Some("logs/2025/")
        );
        // No delimiter past the prefix: the key lists as plain Contents.
        assert_eq!(compute_common_prefix("top", None, "/"), None);
        assert_eq!(compute_common_prefix("logs/a.txt", Some("logs/"), "/"), None);
        // Keys outside the requested prefix never group.
        assert_eq!(compute_common_prefix("data/a", Some("logs/"), "/"), None);
    }

    #[test]
    fn bucket_names_follow_s3_rules() {
        assert!(validate_bucket_name("test-bucket").is_ok());
        assert!(validate_bucket_name("a.b.c").is_ok());
        assert!(validate_bucket_name("ab").is_err());
        assert!(validate_bucket_name("UPPER").is_err());
        assert!(validate_bucket_name("-leading").is_err());
        assert!(validate_bucket_name("double..dot").is_err());
        assert!(validate_bucket_name("10.0.0.1").is_err());
    }

    #[tokio::test]
    async fn fresh_bucket_lists_zero_objects() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir).await;

        svc.create_bucket("test-bucket", "local".into())
            .await
            .unwrap();
        let listing = svc.list_objects_v2("test-bucket", list_all()).await.unwrap();
        assert!(listing.objects.is_empty());
        assert_eq!(listing.key_count, 0);
        assert!(!listing.is_truncated);
    }

    #[tokio::test]
    async fn duplicate_bucket_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir).await;

        svc.create_bucket("test-bucket", "local".into())
            .await
            .unwrap();
        let err = svc
            .create_bucket("test-bucket", "local".into())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::BucketAlreadyExists(_)));
    }

    #[tokio::test]
    async fn unknown_region_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir).await;

        let err = svc
            .create_bucket("test-bucket", "moon-base-1".into())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::UnsupportedRegion(_)));
    }

    #[tokio::test]
    async fn put_then_get_round_trips_bytes_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir).await;
        svc.create_bucket("test-bucket", "local".into())
            .await
            .unwrap();

        let stored = svc
            .put_object_stream(
                "test-bucket",
                "hello/hello.txt",
                Some("text/plain".into()),
                Some("gzip".into()),
                body(b"Hello\n"),
            )
            .await
            .unwrap();
        assert_eq!(stored.size_bytes, 6);
        assert_eq!(
            stored.etag.as_deref(),
            Some(format!("{:x}", md5::compute(b"Hello\n")).as_str())
        );

        let (meta, mut file) = svc
            .get_object_reader("test-bucket", "hello/hello.txt")
            .await
            .unwrap();
        assert_eq!(read_payload(&mut file).await, b"Hello\n");
        assert_eq!(meta.content_type.as_deref(), Some("text/plain"));
        assert_eq!(meta.content_encoding.as_deref(), Some("gzip"));
        assert_eq!(meta.size_bytes, 6);
    }

    #[tokio::test]
    async fn overwrite_replaces_content_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir).await;
        svc.create_bucket("test-bucket", "local".into())
            .await
            .unwrap();

        svc.put_object_stream(
            "test-bucket",
            "k",
            Some("text/plain".into()),
            None,
            body(b"first"),
        )
        .await
        .unwrap();
        let second = svc
            .put_object_stream(
                "test-bucket",
                "k",
                Some("application/json".into()),
                None,
                body(b"{\"n\":2}"),
            )
            .await
            .unwrap();

        let (meta, mut file) = svc.get_object_reader("test-bucket", "k").await.unwrap();
        assert_eq!(read_payload(&mut file).await, b"{\"n\":2}");
        assert_eq!(meta.content_type.as_deref(), Some("application/json"));
        assert_eq!(meta.etag, second.etag);

        let listing = svc.list_objects_v2("test-bucket", list_all()).await.unwrap();
        assert_eq!(listing.objects.len(), 1);
    }

    #[tokio::test]
    async fn put_into_missing_bucket_fails() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir).await;

        let err = svc
            .put_object_stream("no-such-bucket", "k", None, None, body(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::BucketNotFound(_)));
    }

    #[tokio::test]
    async fn traversal_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir).await;
        svc.create_bucket("test-bucket", "local".into())
            .await
            .unwrap();

        for key in ["/abs", "../up", "a/../b", ""] {
            let err = svc
                .put_object_stream("test-bucket", key, None, None, body(b"x"))
                .await
                .unwrap_err();
            assert!(matches!(err, StorageError::InvalidObjectKey), "{key}");
        }
    }

    #[tokio::test]
    async fn delete_object_then_reads_fail() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir).await;
        svc.create_bucket("test-bucket", "local".into())
            .await
            .unwrap();
        svc.put_object_stream("test-bucket", "k", None, None, body(b"x"))
            .await
            .unwrap();

        svc.delete_object("test-bucket", "k").await.unwrap();
        assert!(matches!(
            svc.get_object_metadata("test-bucket", "k").await,
            Err(StorageError::ObjectNotFound { .. })
        ));
        assert!(matches!(
            svc.delete_object("test-bucket", "k").await,
            Err(StorageError::ObjectNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn bucket_delete_refuses_until_empty() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir).await;
        svc.create_bucket("test-bucket", "local".into())
            .await
            .unwrap();
        svc.put_object_stream("test-bucket", "k", None, None, body(b"x"))
            .await
            .unwrap();

        let err = svc.delete_bucket("test-bucket").await.unwrap_err();
        assert!(matches!(err, StorageError::BucketNotEmpty(_)));

        svc.delete_object("test-bucket", "k").await.unwrap();
        svc.delete_bucket("test-bucket").await.unwrap();
        assert!(matches!(
            svc.delete_bucket("test-bucket").await,
            Err(StorageError::BucketNotFound(_))
        ));
    }

    #[tokio::test]
    async fn prefix_listing_returns_exactly_the_matching_keys() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir).await;
        svc.create_bucket("test-bucket", "local".into())
            .await
            .unwrap();
        for key in ["logs/a", "logs/b", "data/a"] {
            svc.put_object_stream("test-bucket", key, None, None, body(b"x"))
                .await
                .unwrap();
        }

        let params = ListObjectsParams {
            prefix: Some("logs/".into()),
            ..list_all()
        };
        let listing = svc.list_objects_v2("test-bucket", params).await.unwrap();
        let keys: Vec<_> = listing.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["logs/a", "logs/b"]);
    }

    #[tokio::test]
    async fn delimiter_groups_keys_into_common_prefixes() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir).await;
        svc.create_bucket("test-bucket", "local".into())
            .await
            .unwrap();
        for key in ["logs/a", "logs/b", "top"] {
            svc.put_object_stream("test-bucket", key, None, None, body(b"x"))
                .await
                .unwrap();
        }

        let params = ListObjectsParams {
            delimiter: Some("/".into()),
            ..list_all()
        };
        let listing = svc.list_objects_v2("test-bucket", params).await.unwrap();
        assert_eq!(listing.common_prefixes, vec!["logs/".to_string()]);
        let keys: Vec<_> = listing.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["top"]);
        assert_eq!(listing.key_count, 2);
    }

    #[tokio::test]
    async fn truncated_listing_pages_with_continuation_token() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir).await;
        svc.create_bucket("test-bucket", "local".into())
            .await
            .unwrap();
        for key in ["a", "b", "c"] {
            svc.put_object_stream("test-bucket", key, None, None, body(b"x"))
                .await
                .unwrap();
        }

        let first = svc
            .list_objects_v2(
                "test-bucket",
                ListObjectsParams {
                    max_keys: 2,
                    ..list_all()
                },
            )
            .await
            .unwrap();
        assert!(first.is_truncated);
        let token = first.next_continuation_token.clone().unwrap();
        assert_eq!(first.objects.len(), 2);

        let second = svc
            .list_objects_v2(
                "test-bucket",
                ListObjectsParams {
                    max_keys: 2,
                    continuation_token: Some(token),
                    ..list_all()
                },
            )
            .await
            .unwrap();
        assert!(!second.is_truncated);
        let keys: Vec<_> = second.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["c"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_puts_leave_one_complete_value() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir).await;
        svc.create_bucket("test-bucket", "local".into())
            .await
            .unwrap();

        let a = svc.clone();
        let b = svc.clone();
        let ta = tokio::spawn(async move {
            a.put_object_stream("test-bucket", "k", None, None, body(b"aaaaaaaaaa"))
                .await
        });
        let tb = tokio::spawn(async move {
            b.put_object_stream("test-bucket", "k", None, None, body(b"bbbb"))
                .await
        });
        ta.await.unwrap().unwrap();
        tb.await.unwrap().unwrap();

        let (meta, mut file) = svc.get_object_reader("test-bucket", "k").await.unwrap();
        let payload = read_payload(&mut file).await;
        assert!(payload == b"aaaaaaaaaa" || payload == b"bbbb");
        assert_eq!(meta.size_bytes as usize, payload.len());
        assert_eq!(
            meta.etag.as_deref(),
            Some(format!("{:x}", md5::compute(&payload)).as_str())
        );
    }

    #[tokio::test]
    async fn metadata_survives_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let svc = service(&dir).await;
            svc.create_bucket("test-bucket", "local".into())
                .await
                .unwrap();
            svc.put_object_stream(
                "test-bucket",
                "hello/hello.txt",
                Some("text/plain".into()),
                None,
                body(b"Hello\n"),
            )
            .await
            .unwrap();
            svc.db.close().await;
        }

        let pool = db::connect(dir.path().join("meta.db")).await.unwrap();
        let svc = StorageService::new(Arc::new(pool), dir.path().join("objects"));
        let (meta, mut file) = svc
            .get_object_reader("test-bucket", "hello/hello.txt")
            .await
            .unwrap();
        assert_eq!(read_payload(&mut file).await, b"Hello\n");
        assert_eq!(meta.content_type.as_deref(), Some("text/plain"));
    }

    #[tokio::test]
    async fn reconcile_drops_entries_without_payload() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir).await;
        svc.create_bucket("test-bucket", "local".into())
            .await
            .unwrap();
        svc.put_object_stream("test-bucket", "kept", None, None, body(b"x"))
            .await
            .unwrap();
        svc.put_object_stream("test-bucket", "lost", None, None, body(b"x"))
            .await
            .unwrap();

        std::fs::remove_file(svc.object_path("test-bucket", "lost")).unwrap();

        assert_eq!(svc.reconcile().await.unwrap(), 1);
        assert!(matches!(
            svc.get_object_metadata("test-bucket", "lost").await,
            Err(StorageError::ObjectNotFound { .. })
        ));
        let listing = svc.list_objects_v2("test-bucket", list_all()).await.unwrap();
        let keys: Vec<_> = listing.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["kept"]);
    }
}
