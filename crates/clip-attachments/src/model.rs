//! Attachment Model
//!
//! An attachment is one uploaded file plus its derived styles, owned by a
//! host entity. Pending writes and deletes are queued on the attachment and
//! flushed by the persister.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use clip_core::config::StorageConfig;
use clip_core::traits::{delays_processing, AttachmentOwner};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Name of the style holding the uploaded file itself
pub const ORIGINAL: &str = "original";

/// A named variant of the attached file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Style {
    pub name: String,
    /// Target extension, if the style converts the file
    #[serde(default)]
    pub format: Option<String>,
    /// Processor arguments (geometry, quality, ...)
    #[serde(default)]
    pub args: serde_json::Value,
}

impl Style {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            format: None,
            args: serde_json::Value::Null,
        }
    }

    pub fn original() -> Self {
        Self::new(ORIGINAL)
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    pub fn with_args(mut self, args: serde_json::Value) -> Self {
        self.args = args;
        self
    }

    pub fn is_original(&self) -> bool {
        self.name == ORIGINAL
    }
}

/// File content waiting to be uploaded
#[derive(Debug, Clone, PartialEq)]
pub struct StagedFile {
    pub file_name: String,
    pub content_type: String,
    pub data: Bytes,
    /// SHA256 of `data`
    pub fingerprint: String,
}

impl StagedFile {
    pub fn new(file_name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let file_name = file_name.into();
        let data = data.into();

        let mut hasher = Sha256::new();
        hasher.update(&data);

        Self {
            content_type: mime_guess::from_path(&file_name)
                .first_or_octet_stream()
                .to_string(),
            fingerprint: hex::encode(hasher.finalize()),
            file_name,
            data,
        }
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Metadata of the file currently attached
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredFile {
    pub file_name: String,
    pub content_type: String,
    pub file_size: u64,
    pub fingerprint: String,
    pub updated_at: DateTime<Utc>,
}

impl StoredFile {
    pub fn from_staged(file: &StagedFile) -> Self {
        Self {
            file_name: file.file_name.clone(),
            content_type: file.content_type.clone(),
            file_size: file.size(),
            fingerprint: file.fingerprint.clone(),
            updated_at: Utc::now(),
        }
    }

    /// File name without extension
    pub fn basename(&self) -> &str {
        Path::new(&self.file_name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(&self.file_name)
    }

    /// Extension without the dot, empty when there is none
    pub fn extension(&self) -> &str {
        Path::new(&self.file_name)
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or("")
    }
}

/// Staged files keyed by style name
#[derive(Debug, Clone, Default)]
pub struct PendingWriteSet {
    files: BTreeMap<String, StagedFile>,
}

impl PendingWriteSet {
    /// Stage a file, replacing whatever was staged for the style
    pub fn insert(&mut self, style: impl Into<String>, file: StagedFile) -> Option<StagedFile> {
        self.files.insert(style.into(), file)
    }

    pub fn remove(&mut self, style: &str) -> Option<StagedFile> {
        self.files.remove(style)
    }

    pub fn get(&self, style: &str) -> Option<&StagedFile> {
        self.files.get(style)
    }

    pub fn contains(&self, style: &str) -> bool {
        self.files.contains_key(style)
    }

    pub fn styles(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &StagedFile)> {
        self.files.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn clear(&mut self) {
        self.files.clear();
    }
}

/// Storage paths waiting to be deleted
#[derive(Debug, Clone, Default)]
pub struct PendingDeleteSet {
    paths: Vec<String>,
}

impl PendingDeleteSet {
    /// Queue a path; a path already queued is not added twice
    pub fn push(&mut self, path: impl Into<String>) {
        let path = path.into();
        if !self.paths.contains(&path) {
            self.paths.push(path);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.paths.iter().map(String::as_str)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.paths
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn clear(&mut self) {
        self.paths.clear();
    }
}

/// Per-attachment persistence options
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentOptions {
    /// Leave previous files in storage when a new one is saved
    pub keep_old_files: bool,
    /// Styles processed and written on assign/save (empty = all)
    pub only_process: Vec<String>,
}

impl From<&StorageConfig> for AttachmentOptions {
    fn from(config: &StorageConfig) -> Self {
        Self {
            keep_old_files: config.keep_old_files,
            only_process: Vec::new(),
        }
    }
}

/// An attached file and its styles
pub struct Attachment {
    name: String,
    owner: Arc<dyn AttachmentOwner>,
    styles: Vec<Style>,
    options: AttachmentOptions,
    file: Option<StoredFile>,
    pub(crate) queued_for_write: PendingWriteSet,
    pub(crate) queued_for_delete: PendingDeleteSet,
    dirty: bool,
}

impl std::fmt::Debug for Attachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attachment")
            .field("owner", &format_args!("{}#{}", self.owner.model_name(), self.owner.id()))
            .field("name", &self.name)
            .field("styles", &self.styles)
            .field("options", &self.options)
            .field("file", &self.file)
            .field("queued_for_write", &self.queued_for_write.styles().collect::<Vec<_>>())
            .field("queued_for_delete", &self.queued_for_delete)
            .field("dirty", &self.dirty)
            .finish()
    }
}

impl Attachment {
    /// Create an empty attachment with only the original style
    pub fn new(owner: Arc<dyn AttachmentOwner>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            owner,
            styles: vec![Style::original()],
            options: AttachmentOptions::default(),
            file: None,
            queued_for_write: PendingWriteSet::default(),
            queued_for_delete: PendingDeleteSet::default(),
            dirty: false,
        }
    }

    /// Add a style, replacing any style with the same name
    pub fn with_style(mut self, style: Style) -> Self {
        match self.styles.iter_mut().find(|s| s.name == style.name) {
            Some(existing) => *existing = style,
            None => self.styles.push(style),
        }
        self
    }

    pub fn with_options(mut self, options: AttachmentOptions) -> Self {
        self.options = options;
        self
    }

    /// Rehydrate the metadata of a file that is already stored
    pub fn with_stored_file(mut self, file: StoredFile) -> Self {
        self.file = Some(file);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> &dyn AttachmentOwner {
        self.owner.as_ref()
    }

    pub fn styles(&self) -> &[Style] {
        &self.styles
    }

    pub fn style(&self, name: &str) -> Option<&Style> {
        self.styles.iter().find(|s| s.name == name)
    }

    pub fn options(&self) -> &AttachmentOptions {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut AttachmentOptions {
        &mut self.options
    }

    pub fn file(&self) -> Option<&StoredFile> {
        self.file.as_ref()
    }

    /// Whether a file is attached
    pub fn is_present(&self) -> bool {
        self.file.is_some()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn pending_writes(&self) -> &PendingWriteSet {
        &self.queued_for_write
    }

    pub fn pending_deletes(&self) -> &PendingDeleteSet {
        &self.queued_for_delete
    }

    /// Owner's deferral flag; owners without the capability never defer
    pub fn delay_processing(&self) -> bool {
        delays_processing(self.owner.as_ref())
    }

    /// Stage a file for `style` and mark the attachment dirty
    pub fn stage(&mut self, style: impl Into<String>, file: StagedFile) {
        self.queued_for_write.insert(style, file);
        self.dirty = true;
    }

    /// Queue a storage path for deletion and mark the attachment dirty
    pub fn queue_for_delete(&mut self, path: impl Into<String>) {
        self.queued_for_delete.push(path);
        self.dirty = true;
    }

    pub(crate) fn record_original(&mut self, file: &StagedFile) {
        self.file = Some(StoredFile::from_staged(file));
    }

    pub(crate) fn clear_file(&mut self) {
        self.file = None;
        self.queued_for_write.clear();
        self.dirty = true;
    }

    pub(crate) fn mark_clean(&mut self) {
        self.dirty = false;
    }
}
