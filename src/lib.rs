//! S3 Backup Library
//!
//! Uploads local files into a folder of an S3 bucket using temporary,
//! role-assumed credentials. Large files go up as parallel multipart
//! uploads; every storage call is retried under an adaptive policy.
//! The binary in `main.rs` is a thin command surface over [`backup`].

pub mod backup;
pub mod error;
pub mod loader;
pub mod s3;
pub mod settings;
