//! Chunked multipart upload
//!
//! Files below the multipart threshold go up in a single put. Larger files
//! are split into fixed-size parts that a pool of `max_concurrency` workers
//! uploads in parallel; each part is retried independently under the
//! session's policy. The object only becomes visible when the completion
//! request assembles the parts in part-number order. If any part fails for
//! good, or the caller's deadline passes, the multipart upload is aborted so
//! no partial object is ever committed.

use std::future::Future;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::error::{BackupError, BackupResult};
use crate::s3::keys::ObjectKey;
use crate::s3::report::{self, ReportContext, UploadOutcome, UploadReceipt};
use crate::s3::session::TransferSession;
use crate::s3::store::UploadedPart;
use crate::s3::types::size_string;

/// One mebibyte
pub const MIB: u64 = 1024 * 1024;

/// Most parts a multipart upload may have
pub const MAX_PARTS: usize = 10_000;

/// Thresholds governing how a file is transferred
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSpec {
    multipart_threshold: u64,
    max_concurrency: usize,
    chunk_size: u64,
}

impl TransferSpec {
    /// Sizes in bytes
    pub fn new(
        multipart_threshold: u64,
        max_concurrency: usize,
        chunk_size: u64,
    ) -> BackupResult<Self> {
        if max_concurrency == 0 {
            return Err(BackupError::Config("max concurrency must be at least 1".to_string()));
        }
        if chunk_size == 0 {
            return Err(BackupError::Config("chunk size must be at least 1 byte".to_string()));
        }
        Ok(Self {
            multipart_threshold,
            max_concurrency,
            chunk_size,
        })
    }

    /// Sizes in MiB
    pub fn from_megabytes(
        threshold_mb: u64,
        max_concurrency: usize,
        chunk_mb: u64,
    ) -> BackupResult<Self> {
        Self::new(
            threshold_mb.saturating_mul(MIB),
            max_concurrency,
            chunk_mb.saturating_mul(MIB),
        )
    }

    pub fn multipart_threshold(&self) -> u64 {
        self.multipart_threshold
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Whether a file of `len` bytes goes through multipart upload.
    /// Empty files always use a single put.
    pub fn uses_multipart(&self, len: u64) -> bool {
        len > 0 && len >= self.multipart_threshold
    }

    /// Number of parts a file of `len` bytes is split into
    pub fn part_count(&self, len: u64) -> u64 {
        len.div_ceil(self.chunk_size)
    }

    /// Split `len` bytes into parts of `chunk_size`; the last may be shorter.
    /// Fails before allocating anything when more than [`MAX_PARTS`] parts
    /// would be needed.
    pub fn plan_parts(&self, len: u64) -> BackupResult<Vec<PartRange>> {
        let count = self.part_count(len);
        if count > MAX_PARTS as u64 {
            return Err(BackupError::Config(format!(
                "{} bytes need {} parts of {}, more than the {} allowed; raise the chunk size",
                len,
                count,
                size_string(self.chunk_size),
                MAX_PARTS
            )));
        }

        (0..count)
            .map(|index| {
                let part_number = i32::try_from(index + 1).map_err(|_| {
                    BackupError::Config(format!("part number {} out of range", index + 1))
                })?;
                let offset = index * self.chunk_size;
                Ok(PartRange {
                    part_number,
                    offset,
                    len: self.chunk_size.min(len - offset),
                })
            })
            .collect()
    }
}

/// Byte range of one part
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartRange {
    /// 1-based part index
    pub part_number: i32,
    pub offset: u64,
    pub len: u64,
}

/// Shared work queue handed out to part workers
struct PartQueue {
    parts: Vec<PartRange>,
    next: AtomicUsize,
    stopped: AtomicBool,
}

impl PartQueue {
    fn new(parts: Vec<PartRange>) -> Self {
        Self {
            parts,
            next: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
        }
    }

    fn next(&self) -> Option<PartRange> {
        if self.stopped.load(Ordering::SeqCst) {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::SeqCst);
        self.parts.get(index).copied()
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// A worker of the part upload pool
struct PartWorker {
    id: usize,
    session: TransferSession,
    bucket: String,
    key: String,
    upload_id: String,
    path: PathBuf,
    queue: Arc<PartQueue>,
}

impl PartWorker {
    async fn run(self) -> BackupResult<Vec<UploadedPart>> {
        let mut uploaded = Vec::new();
        while let Some(part) = self.queue.next() {
            match self.upload_part(part).await {
                Ok(done) => uploaded.push(done),
                Err(err) => {
                    self.queue.stop();
                    return Err(BackupError::PartialUpload {
                        part_number: part.part_number,
                        source: Box::new(err),
                    });
                }
            }
        }
        Ok(uploaded)
    }

    async fn upload_part(&self, part: PartRange) -> BackupResult<UploadedPart> {
        let body = read_part(&self.path, part).await?;

        let store = self.session.store();
        let bucket = self.bucket.as_str();
        let key = self.key.as_str();
        let upload_id = self.upload_id.as_str();
        let uploaded = self
            .session
            .call("upload_part", move || {
                store.upload_part(bucket, key, upload_id, part.part_number, body.clone())
            })
            .await?;

        debug!(
            worker = self.id,
            key,
            part_number = part.part_number,
            len = part.len,
            "Uploaded part"
        );
        Ok(uploaded)
    }
}

async fn read_part(path: &Path, part: PartRange) -> BackupResult<Bytes> {
    let mut file = File::open(path).await.map_err(|e| BackupError::io(path, e))?;
    file.seek(SeekFrom::Start(part.offset))
        .await
        .map_err(|e| BackupError::io(path, e))?;

    let mut buffer = vec![0u8; part.len as usize];
    file.read_exact(&mut buffer)
        .await
        .map_err(|e| BackupError::io(path, e))?;
    Ok(Bytes::from(buffer))
}

/// Run `fut` bounded by an optional absolute deadline
async fn within<T>(
    deadline: Option<(Instant, Duration)>,
    fut: impl Future<Output = BackupResult<T>>,
) -> BackupResult<T> {
    match deadline {
        None => fut.await,
        Some((at, limit)) => match timeout_at(at, fut).await {
            Ok(result) => result,
            Err(_) => Err(BackupError::DeadlineExceeded(limit)),
        },
    }
}

/// Uploads local files under a [`TransferSpec`]
pub struct ChunkedUploader {
    session: TransferSession,
    spec: TransferSpec,
    deadline: Option<Duration>,
}

impl ChunkedUploader {
    pub fn new(session: TransferSession, spec: TransferSpec) -> Self {
        Self {
            session,
            spec,
            deadline: None,
        }
    }

    /// Bound the whole upload; in-flight parts are abandoned when it passes
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn spec(&self) -> &TransferSpec {
        &self.spec
    }

    /// Upload `local_path` to `key` and report the outcome
    pub async fn upload(&self, bucket: &str, local_path: &Path, key: &ObjectKey) -> UploadOutcome {
        let file_name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| local_path.display().to_string());
        let object_key = key.key();
        let ctx = ReportContext {
            bucket,
            folder: key.folder_prefix().trim_end_matches('/'),
            file_name: &file_name,
            key: Some(&object_key),
        };
        report::finish(self.transfer(bucket, local_path, key).await, &ctx)
    }

    /// Upload `local_path` to `key`, returning the error instead of reporting it
    pub async fn transfer(
        &self,
        bucket: &str,
        local_path: &Path,
        key: &ObjectKey,
    ) -> BackupResult<UploadReceipt> {
        let len = tokio::fs::metadata(local_path)
            .await
            .map_err(|e| BackupError::io(local_path, e))?
            .len();
        let deadline = self.deadline.map(|limit| (Instant::now() + limit, limit));
        let object_key = key.key();

        if self.spec.uses_multipart(len) {
            info!(
                bucket,
                key = %object_key,
                size = %size_string(len),
                chunk_size = %size_string(self.spec.chunk_size),
                max_concurrency = self.spec.max_concurrency,
                "Starting multipart upload"
            );
            self.put_multipart(bucket, local_path, &object_key, len, deadline)
                .await
        } else {
            debug!(bucket, key = %object_key, size = %size_string(len), "Starting single put");
            within(deadline, self.put_single(bucket, local_path, &object_key, len)).await
        }
    }

    async fn put_single(
        &self,
        bucket: &str,
        local_path: &Path,
        key: &str,
        len: u64,
    ) -> BackupResult<UploadReceipt> {
        let body = Bytes::from(
            tokio::fs::read(local_path)
                .await
                .map_err(|e| BackupError::io(local_path, e))?,
        );

        let store = self.session.store();
        self.session
            .call("put_object", move || store.put_object(bucket, key, body.clone()))
            .await?;

        Ok(UploadReceipt {
            key: key.to_string(),
            bytes: len,
            parts: 1,
        })
    }

    async fn put_multipart(
        &self,
        bucket: &str,
        local_path: &Path,
        key: &str,
        len: u64,
        deadline: Option<(Instant, Duration)>,
    ) -> BackupResult<UploadReceipt> {
        let count = self.spec.part_count(len);
        if count > MAX_PARTS as u64 {
            return Err(BackupError::Config(format!(
                "{} needs {} parts of {}, more than the {} allowed; raise the chunk size",
                local_path.display(),
                count,
                size_string(self.spec.chunk_size),
                MAX_PARTS
            )));
        }
        let parts = self.spec.plan_parts(len)?;
        let part_count = parts.len();

        let store = self.session.store();
        let upload_id = within(deadline, async {
            self.session
                .call("create_multipart_upload", move || {
                    store.create_multipart_upload(bucket, key)
                })
                .await
                .map_err(BackupError::from)
        })
        .await?;
        debug!(key, upload_id = %upload_id, parts = part_count, "Created multipart upload");

        let uploaded = match within(
            deadline,
            self.upload_parts(bucket, local_path, key, &upload_id, parts),
        )
        .await
        {
            Ok(uploaded) => uploaded,
            Err(err) => {
                self.abort(bucket, key, &upload_id).await;
                return Err(err);
            }
        };

        let upload_id_ref = upload_id.as_str();
        let parts_ref = uploaded.as_slice();
        let committed = within(deadline, async {
            self.session
                .call("complete_multipart_upload", move || {
                    store.complete_multipart_upload(bucket, key, upload_id_ref, parts_ref)
                })
                .await
                .map_err(BackupError::from)
        })
        .await;

        if let Err(err) = committed {
            self.abort(bucket, key, &upload_id).await;
            return Err(err);
        }

        Ok(UploadReceipt {
            key: key.to_string(),
            bytes: len,
            parts: part_count,
        })
    }

    /// Drive the worker pool; returns parts sorted by part number
    async fn upload_parts(
        &self,
        bucket: &str,
        local_path: &Path,
        key: &str,
        upload_id: &str,
        parts: Vec<PartRange>,
    ) -> BackupResult<Vec<UploadedPart>> {
        let total = parts.len();
        let queue = Arc::new(PartQueue::new(parts));
        let mut pool = JoinSet::new();

        for id in 0..self.spec.max_concurrency.min(total) {
            let worker = PartWorker {
                id,
                session: self.session.clone(),
                bucket: bucket.to_string(),
                key: key.to_string(),
                upload_id: upload_id.to_string(),
                path: local_path.to_path_buf(),
                queue: queue.clone(),
            };
            pool.spawn(worker.run());
        }

        let mut completed = Vec::with_capacity(total);
        let mut failure: Option<BackupError> = None;
        while let Some(joined) = pool.join_next().await {
            match joined {
                Ok(Ok(mut done)) => completed.append(&mut done),
                Ok(Err(err)) => {
                    if failure.is_none() {
                        queue.stop();
                        pool.abort_all();
                        failure = Some(err);
                    }
                }
                Err(join_err) if join_err.is_cancelled() => {}
                Err(join_err) => {
                    if failure.is_none() {
                        queue.stop();
                        pool.abort_all();
                        failure = Some(BackupError::Unknown(format!(
                            "part worker panicked: {}",
                            join_err
                        )));
                    }
                }
            }
        }

        if let Some(err) = failure {
            return Err(err);
        }
        if completed.len() != total {
            return Err(BackupError::Unknown(format!(
                "only {} of {} parts were uploaded",
                completed.len(),
                total
            )));
        }

        completed.sort_by_key(|p| p.part_number);
        Ok(completed)
    }

    /// Best-effort cancellation of a multipart upload
    async fn abort(&self, bucket: &str, key: &str, upload_id: &str) {
        let store = self.session.store();
        match self
            .session
            .call("abort_multipart_upload", move || {
                store.abort_multipart_upload(bucket, key, upload_id)
            })
            .await
        {
            Ok(()) => warn!(bucket, key, upload_id, "Aborted multipart upload"),
            Err(err) => error!(
                bucket,
                key,
                upload_id,
                error = %err,
                "Failed to abort multipart upload, uploaded parts are left to the bucket lifecycle"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_validation() {
        assert!(TransferSpec::new(10, 0, 5).is_err());
        assert!(TransferSpec::new(10, 1, 0).is_err());
        assert!(TransferSpec::new(0, 1, 1).is_ok());
    }

    #[test]
    fn test_from_megabytes() {
        let spec = TransferSpec::from_megabytes(8, 4, 5).unwrap();
        assert_eq!(spec.multipart_threshold(), 8 * MIB);
        assert_eq!(spec.chunk_size(), 5 * MIB);
        assert_eq!(spec.max_concurrency(), 4);
    }

    #[test]
    fn test_threshold_boundary() {
        let spec = TransferSpec::new(100, 2, 10).unwrap();
        assert!(!spec.uses_multipart(0));
        assert!(!spec.uses_multipart(99));
        assert!(spec.uses_multipart(100));
        assert!(spec.uses_multipart(101));
    }

    #[test]
    fn test_empty_file_never_multipart() {
        let spec = TransferSpec::new(0, 2, 10).unwrap();
        assert!(!spec.uses_multipart(0));
        assert!(spec.plan_parts(0).unwrap().is_empty());
    }

    #[test]
    fn test_plan_parts_with_short_tail() {
        let spec = TransferSpec::new(0, 2, 10).unwrap();
        let parts = spec.plan_parts(21).unwrap();
        assert_eq!(
            parts,
            vec![
                PartRange { part_number: 1, offset: 0, len: 10 },
                PartRange { part_number: 2, offset: 10, len: 10 },
                PartRange { part_number: 3, offset: 20, len: 1 },
            ]
        );
    }

    #[test]
    fn test_plan_parts_count_is_ceiling() {
        let spec = TransferSpec::new(0, 2, 7).unwrap();
        for len in [1u64, 6, 7, 8, 13, 14, 15, 700, 701] {
            let parts = spec.plan_parts(len).unwrap();
            assert_eq!(parts.len() as u64, len.div_ceil(7), "len {}", len);
            assert_eq!(parts.iter().map(|p| p.len).sum::<u64>(), len);
            assert!(parts.iter().all(|p| p.len > 0 && p.len <= 7));
        }
    }

    #[test]
    fn test_part_limit_checked_before_planning() {
        let spec = TransferSpec::new(1, 1, 1).unwrap();
        assert_eq!(spec.part_count(100 * 1024 * 1024 * 1024), 100 * 1024 * 1024 * 1024);
        assert!(matches!(
            spec.plan_parts(100 * 1024 * 1024 * 1024),
            Err(BackupError::Config(msg)) if msg.contains("10000")
        ));

        let parts = spec.plan_parts(MAX_PARTS as u64).unwrap();
        assert_eq!(parts.len(), MAX_PARTS);
        assert_eq!(parts.last().map(|p| p.part_number), Some(10_000));
        assert!(spec.plan_parts(MAX_PARTS as u64 + 1).is_err());
    }

    #[test]
    fn test_part_queue_hands_out_each_part_once() {
        let spec = TransferSpec::new(0, 2, 1).unwrap();
        let queue = PartQueue::new(spec.plan_parts(3).unwrap());
        assert_eq!(queue.next().map(|p| p.part_number), Some(1));
        assert_eq!(queue.next().map(|p| p.part_number), Some(2));
        queue.stop();
        assert_eq!(queue.next(), None);
    }
}
