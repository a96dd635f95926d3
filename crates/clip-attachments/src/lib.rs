//! # clip-attachments
//!
//! Attachment styles and their persistence to object storage.
//!
//! ## Features
//!
//! - Attachments with named styles (variants) of one uploaded file
//! - Selection of the styles a save or reprocess acts on
//! - Pending write/delete queues flushed to a [`Storage`] backend
//! - Every save guarded by a circuit breaker shared per resource name
//!
//! ## Example
//!
//! ```rust,ignore
//! use clip_attachments::{Attachment, AttachmentPersister, MemoryStorage, PassthroughProcessor, StagedFile, Style};
//! use clip_core::{AppConfig, CircuitBreakerRegistry};
//! use std::sync::Arc;
//!
//! let config = AppConfig::from_env()?;
//! let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit));
//! let persister = AttachmentPersister::new(
//!     Arc::new(MemoryStorage::new()),
//!     Arc::new(PassthroughProcessor),
//!     breakers,
//!     &config.storage,
//! );
//!
//! let mut avatar = Attachment::new(account, "avatars").with_style(Style::new("thumbnail"));
//! persister.assign(&mut avatar, StagedFile::new("me.png", png_bytes)).await?;
//! persister.save(&mut avatar).await?;
//! ```

pub mod model;
pub mod paths;
pub mod processor;
pub mod selector;
pub mod service;
pub mod storage;

pub use model::{
    Attachment, AttachmentOptions, PendingDeleteSet, PendingWriteSet, StagedFile, StoredFile,
    Style, ORIGINAL,
};
pub use paths::{PathPattern, PathResolver};
pub use processor::{PassthroughProcessor, ProcessingError, Processor};
pub use selector::{should_process, StyleSelector};
pub use service::{AttachmentError, AttachmentPersister, AttachmentResult};
pub use storage::{MemoryStorage, ObjectMetadata, Storage, StorageCall, StorageError, StorageResult};
