//! Mender-Store: file-backed persistence for Mender
//!
//! This crate provides the persistence layer for the remediation pipeline.
//! Records are grouped into collections and stored one JSON document per
//! file, with atomic replacement and whole-collection backups.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: Data integrity and crash-safe writes.
//!
//! ## Key Components
//!
//! - `FileStore`: `<root>/<collection>/<id>.json` key/value store
//! - `StoreError`: distinguishes a missing record from an I/O failure
//! - backups: `<root>/backups/<collection>_<YYYYMMDD_HHMMSS>.tar.gz`

mod archive;
mod error;
mod file_store;

pub use error::{StoreError, StoreResult};
pub use file_store::{validate_key, FileStore, BACKUP_DIR, RECORD_EXTENSION};
