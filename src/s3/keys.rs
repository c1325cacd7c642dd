//! Destination key construction and folder markers
//!
//! Object storage has a flat key space; a "folder" is simulated by a
//! zero-byte object whose key is the folder prefix (`backups/`). The marker
//! is created on first upload into a folder. Listing and creation are not
//! atomic, so two concurrent runs may both create it; writing the same empty
//! key twice leaves one marker and is not an error.

use bytes::Bytes;
use tracing::{debug, info, instrument};

use crate::error::{BackupError, BackupResult};
use crate::s3::session::TransferSession;

/// Keys requested when probing for a folder
const FOLDER_PROBE_MAX_KEYS: i32 = 1;

/// Destination of an upload: `{folder_prefix}{object_name}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectKey {
    folder_prefix: String,
    object_name: String,
}

impl ObjectKey {
    /// Build the key for `file_name` (or `override_name`) inside `folder_name`.
    /// Trailing slashes on the folder name are collapsed into one.
    pub fn new(
        folder_name: &str,
        file_name: &str,
        override_name: Option<&str>,
    ) -> BackupResult<Self> {
        let folder = folder_name.trim_end_matches('/');
        if folder.is_empty() {
            return Err(BackupError::Config(
                "destination folder name must not be empty".to_string(),
            ));
        }

        let object_name = override_name.unwrap_or(file_name);
        if object_name.is_empty() {
            return Err(BackupError::Config("object name must not be empty".to_string()));
        }

        Ok(Self {
            folder_prefix: format!("{}/", folder),
            object_name: object_name.to_string(),
        })
    }

    /// Folder prefix including its single trailing slash
    pub fn folder_prefix(&self) -> &str {
        &self.folder_prefix
    }

    pub fn object_name(&self) -> &str {
        &self.object_name
    }

    /// Full object key
    pub fn key(&self) -> String {
        format!("{}{}", self.folder_prefix, self.object_name)
    }

    /// Marker object for this key's folder
    pub fn marker(&self) -> FolderMarker {
        FolderMarker {
            key: self.folder_prefix.clone(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.folder_prefix, self.object_name)
    }
}

/// Zero-byte object standing in for a folder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderMarker {
    key: String,
}

impl FolderMarker {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Create the marker unless something already exists under its prefix.
    /// A failed listing is returned as-is and no marker write is attempted.
    ///
    /// Returns `true` if the marker was written.
    pub async fn ensure(&self, session: &TransferSession, bucket: &str) -> BackupResult<bool> {
        let store = session.store();
        let prefix = self.key.as_str();

        let existing = session
            .call("list_objects", move || {
                store.list_objects(bucket, prefix, FOLDER_PROBE_MAX_KEYS)
            })
            .await?;

        if let Some(first) = existing.first() {
            if first.is_folder_marker() {
                debug!(bucket, folder = prefix, "Folder marker exists");
            } else {
                debug!(bucket, folder = prefix, entry = first.display_name(), "Folder has objects");
            }
            return Ok(false);
        }

        info!(bucket, folder = prefix, "Folder did not exist, creating marker");
        session
            .call("put_object", move || store.put_object(bucket, prefix, Bytes::new()))
            .await?;
        Ok(true)
    }
}

/// Derive the destination key and make sure its folder marker exists
#[instrument(skip(session))]
pub async fn resolve_and_ensure_folder(
    session: &TransferSession,
    bucket: &str,
    folder_name: &str,
    file_name: &str,
    override_name: Option<&str>,
) -> BackupResult<ObjectKey> {
    let key = ObjectKey::new(folder_name, file_name, override_name)?;
    key.marker().ensure(session, bucket).await?;
    debug!(key = %key, "Resolved object key");
    Ok(key)
}
