//! In-memory object store for pipeline tests
//!
//! Behaves like a single-region S3 endpoint: objects only become visible
//! after a put or a completed multipart upload. Failures can be scripted per
//! key, per part or for listings, and concurrent part uploads are counted.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;

use s3_backup::s3::{
    ObjectStore, RetryPolicy, S3Object, StoreError, TemporaryCredentials, TransferSession,
    UploadedPart,
};

pub const BUCKET: &str = "backup-bucket";

struct PendingUpload {
    key: String,
    parts: BTreeMap<i32, Bytes>,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<String, Bytes>,
    uploads: HashMap<String, PendingUpload>,
    next_upload: usize,
    aborted: Vec<String>,
    calls: HashMap<&'static str, usize>,
    puts_by_key: HashMap<String, usize>,
    attempts_by_part: HashMap<i32, usize>,
    put_failures: HashMap<String, VecDeque<StoreError>>,
    part_failures: HashMap<i32, VecDeque<StoreError>>,
    broken_part: Option<(i32, StoreError)>,
    list_failure: Option<StoreError>,
    completion_failure: Option<StoreError>,
    completed_part_sizes: Vec<usize>,
}

/// Fake [`ObjectStore`] keeping everything in memory
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    part_delay: Duration,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold every part upload for `delay` so concurrent parts overlap
    pub fn with_part_delay(mut self, delay: Duration) -> Self {
        self.part_delay = delay;
        self
    }

    pub fn insert(&self, key: &str, body: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .objects
            .insert(key.to_string(), Bytes::copy_from_slice(body));
    }

    /// Fail the next puts of `key` with `errors`, in order
    pub fn fail_puts(&self, key: &str, errors: impl IntoIterator<Item = StoreError>) {
        self.state
            .lock()
            .unwrap()
            .put_failures
            .entry(key.to_string())
            .or_default()
            .extend(errors);
    }

    /// Fail the next uploads of `part_number` with `errors`, in order
    pub fn fail_part_times(&self, part_number: i32, errors: impl IntoIterator<Item = StoreError>) {
        self.state
            .lock()
            .unwrap()
            .part_failures
            .entry(part_number)
            .or_default()
            .extend(errors);
    }

    /// Fail every upload of `part_number`
    pub fn break_part(&self, part_number: i32, error: StoreError) {
        self.state.lock().unwrap().broken_part = Some((part_number, error));
    }

    /// Fail every listing
    pub fn fail_listing(&self, error: StoreError) {
        self.state.lock().unwrap().list_failure = Some(error);
    }

    /// Fail every multipart completion
    pub fn fail_completion(&self, error: StoreError) {
        self.state.lock().unwrap().completion_failure = Some(error);
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.state.lock().unwrap().objects.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.state.lock().unwrap().objects.keys().cloned().collect()
    }

    pub fn calls(&self, operation: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .get(operation)
            .copied()
            .unwrap_or(0)
    }

    pub fn puts_of(&self, key: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .puts_by_key
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Upload attempts of one part number
    pub fn part_attempts(&self, part_number: i32) -> usize {
        self.state
            .lock()
            .unwrap()
            .attempts_by_part
            .get(&part_number)
            .copied()
            .unwrap_or(0)
    }

    pub fn aborted(&self) -> Vec<String> {
        self.state.lock().unwrap().aborted.clone()
    }

    /// Multipart uploads neither completed nor aborted
    pub fn pending_uploads(&self) -> usize {
        self.state.lock().unwrap().uploads.len()
    }

    /// Part sizes of the most recent completed multipart upload
    pub fn completed_part_sizes(&self) -> Vec<usize> {
        self.state.lock().unwrap().completed_part_sizes.clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn record(&self, operation: &'static str) {
        *self
            .state
            .lock()
            .unwrap()
            .calls
            .entry(operation)
            .or_default() += 1;
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list_objects(
        &self,
        _bucket: &str,
        prefix: &str,
        max_keys: i32,
    ) -> Result<Vec<S3Object>, StoreError> {
        self.record("list_objects");
        let listing = {
            let state = self.state.lock().unwrap();
            match &state.list_failure {
                Some(err) => Err(err.clone()),
                None => Ok(state
                    .objects
                    .iter()
                    .filter(|(key, _)| key.starts_with(prefix))
                    .take(max_keys.max(0) as usize)
                    .map(|(key, body)| S3Object::new(key.as_str(), body.len() as u64))
                    .collect()),
            }
        };

        // Answer after a suspension point so concurrent callers can observe
        // the same snapshot.
        tokio::task::yield_now().await;
        listing
    }

    async fn put_object(&self, _bucket: &str, key: &str, body: Bytes) -> Result<(), StoreError> {
        self.record("put_object");
        let mut state = self.state.lock().unwrap();
        *state.puts_by_key.entry(key.to_string()).or_default() += 1;
        if let Some(err) = state
            .put_failures
            .get_mut(key)
            .and_then(|queue| queue.pop_front())
        {
            return Err(err);
        }
        state.objects.insert(key.to_string(), body);
        Ok(())
    }

    async fn create_multipart_upload(
        &self,
        _bucket: &str,
        key: &str,
    ) -> Result<String, StoreError> {
        self.record("create_multipart_upload");
        let mut state = self.state.lock().unwrap();
        state.next_upload += 1;
        let upload_id = format!("upload-{}", state.next_upload);
        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<UploadedPart, StoreError> {
        self.record("upload_part");
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.part_delay.is_zero() {
            tokio::time::sleep(self.part_delay).await;
        }

        let mut state = self.state.lock().unwrap();
        *state.attempts_by_part.entry(part_number).or_default() += 1;
        if let Some((broken, err)) = &state.broken_part {
            if *broken == part_number {
                return Err(err.clone());
            }
        }
        if let Some(err) = state
            .part_failures
            .get_mut(&part_number)
            .and_then(|queue| queue.pop_front())
        {
            return Err(err);
        }

        let upload = state
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| StoreError::service("NoSuchUpload", Some(404), upload_id))?;
        upload.parts.insert(part_number, body);
        Ok(UploadedPart {
            part_number,
            e_tag: format!("\"etag-{}\"", part_number),
        })
    }

    async fn complete_multipart_upload(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
        parts: &[UploadedPart],
    ) -> Result<(), StoreError> {
        self.record("complete_multipart_upload");
        let mut state = self.state.lock().unwrap();
        if let Some(err) = &state.completion_failure {
            return Err(err.clone());
        }

        if parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
            return Err(StoreError::service(
                "InvalidPartOrder",
                Some(400),
                "parts must be in ascending order",
            ));
        }

        let upload = state
            .uploads
            .remove(upload_id)
            .ok_or_else(|| StoreError::service("NoSuchUpload", Some(404), upload_id))?;

        let mut assembled = Vec::new();
        let mut sizes = Vec::new();
        for part in parts {
            let body = upload
                .parts
                .get(&part.part_number)
                .ok_or_else(|| StoreError::service("InvalidPart", Some(400), "missing part"))?;
            assembled.extend_from_slice(body);
            sizes.push(body.len());
        }

        state.objects.insert(upload.key, Bytes::from(assembled));
        state.completed_part_sizes = sizes;
        Ok(())
    }

    async fn abort_multipart_upload(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
    ) -> Result<(), StoreError> {
        self.record("abort_multipart_upload");
        let mut state = self.state.lock().unwrap();
        state
            .uploads
            .remove(upload_id)
            .ok_or_else(|| StoreError::service("NoSuchUpload", Some(404), upload_id))?;
        state.aborted.push(upload_id.to_string());
        Ok(())
    }
}

/// Credentials valid for another day
pub fn fresh_credentials() -> TemporaryCredentials {
    TemporaryCredentials::new(
        "ASIATESTKEY",
        "test-secret",
        "test-token",
        Utc::now() + chrono::Duration::days(1),
    )
}

/// Policy with `max_attempts` and millisecond backoff
pub fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(max_attempts, Duration::from_secs(1), Duration::from_secs(1))
        .unwrap()
        .with_backoff(
            Duration::from_millis(1),
            Duration::from_millis(1),
            Duration::from_millis(5),
        )
}

pub fn session(store: Arc<MemoryStore>, max_attempts: u32) -> TransferSession {
    TransferSession::with_store(store, "us-east-1", fresh_credentials(), fast_policy(max_attempts))
}

/// Write `len` bytes of a repeating pattern to `dir/name`
pub fn write_file(dir: &Path, name: &str, len: usize) -> Vec<u8> {
    let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    std::fs::write(dir.join(name), &data).unwrap();
    data
}
