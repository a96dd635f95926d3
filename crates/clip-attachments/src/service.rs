//! Attachment Persister
//!
//! Flushes an attachment's pending deletes and writes to storage. Every
//! storage call made by `save` and `destroy` runs inside one circuit breaker
//! call for the configured resource, so an unreachable backend turns into
//! fast failures instead of slow requests.
//!
//! A failed save is not rolled back: deletes may already be flushed when a
//! write fails. Queues are only cleared after their flush completes, so
//! retrying the save repeats the unfinished part.

use std::sync::Arc;

use clip_core::circuit_breaker::{BreakerFailure, CircuitBreaker, CircuitBreakerRegistry};
use clip_core::config::StorageConfig;
use clip_core::error::CircuitOpen;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::model::{Attachment, StagedFile, ORIGINAL};
use crate::paths::{PathPattern, PathResolver};
use crate::processor::{ProcessingError, Processor};
use crate::storage::{Storage, StorageError};

/// Persister errors
#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpen),
    #[error("Processing error: {0}")]
    Processing(#[from] ProcessingError),
    #[error("Nothing staged for style {0}")]
    NothingStaged(String),
}

impl AttachmentError {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, AttachmentError::CircuitOpen(_))
    }
}

impl BreakerFailure for AttachmentError {
    fn is_countable(&self) -> bool {
        matches!(self, AttachmentError::Storage(err) if err.is_networking())
    }
}

pub type AttachmentResult<T> = Result<T, AttachmentError>;

/// Processes and persists attachments.
///
/// Held by the host and invoked explicitly; attachments never save
/// themselves.
pub struct AttachmentPersister<S: Storage, P: Processor> {
    storage: Arc<S>,
    processor: Arc<P>,
    resolver: Arc<dyn PathResolver>,
    breakers: Arc<CircuitBreakerRegistry>,
    resource: String,
}

impl<S: Storage, P: Processor> AttachmentPersister<S, P> {
    pub fn new(
        storage: Arc<S>,
        processor: Arc<P>,
        breakers: Arc<CircuitBreakerRegistry>,
        config: &StorageConfig,
    ) -> Self {
        Self {
            storage,
            processor,
            resolver: Arc::new(PathPattern::new(config.path_pattern.clone())),
            breakers,
            resource: config.resource_name.clone(),
        }
    }

    /// Replace the configured path pattern
    pub fn with_resolver(mut self, resolver: impl PathResolver + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    /// Storage path of `style` for the attachment's current state
    pub fn path(&self, attachment: &Attachment, style: &str) -> String {
        self.resolver.path(attachment, style)
    }

    /// Breaker guarding this persister's storage calls
    pub fn breaker(&self) -> Arc<CircuitBreaker> {
        self.breakers.breaker(&self.resource)
    }

    /// Attach a new upload.
    ///
    /// Queues the previous files for deletion (unless `keep_old_files`),
    /// stages the upload as the original and processes the configured
    /// `only_process` styles. Nothing is written until [`save`](Self::save).
    #[instrument(skip(self, attachment, upload), fields(attachment = %attachment.name(), file = %upload.file_name))]
    pub async fn assign(&self, attachment: &mut Attachment, upload: StagedFile) -> AttachmentResult<()> {
        if !attachment.options().keep_old_files {
            self.queue_all_for_delete(attachment);
        }

        attachment.queued_for_write.clear();
        attachment.record_original(&upload);
        attachment.stage(ORIGINAL, upload);

        let requested = attachment.options().only_process.clone();
        self.post_process(attachment, &requested).await
    }

    /// Generate every selected style from the staged original.
    ///
    /// The original is handled first; regenerating it updates the
    /// attachment's file metadata, which may change its storage path.
    pub async fn post_process<R: AsRef<str> + Sync>(
        &self,
        attachment: &mut Attachment,
        requested: &[R],
    ) -> AttachmentResult<()> {
        let styles: Vec<_> = attachment
            .selector(requested)
            .select(attachment.styles())
            .into_iter()
            .cloned()
            .collect();

        for style in styles {
            let source = attachment
                .pending_writes()
                .get(ORIGINAL)
                .cloned()
                .ok_or_else(|| AttachmentError::NothingStaged(ORIGINAL.to_string()))?;

            let processed = self.processor.process(&source, &style).await?;
            debug!(style = %style.name, file = %processed.file_name, "Style processed");

            if style.is_original() {
                attachment.record_original(&processed);
            }
            attachment.stage(style.name.clone(), processed);
        }

        Ok(())
    }

    /// Flush pending deletes and writes under the storage circuit breaker.
    ///
    /// Saves the styles named by the attachment's `only_process` (empty = all).
    /// On success the attachment is clean; on failure it stays dirty and
    /// whatever was already flushed stays flushed.
    #[instrument(skip(self, attachment), fields(attachment = %attachment.name(), resource = %self.resource))]
    pub async fn save(&self, attachment: &mut Attachment) -> AttachmentResult<bool> {
        let process = attachment.options().only_process.clone();
        self.flush(attachment, &process).await
    }

    /// Re-run processing for `styles` (empty = all) from the stored original,
    /// then save. Returns `false` when nothing is attached.
    #[instrument(skip(self, attachment), fields(attachment = %attachment.name()))]
    pub async fn reprocess(&self, attachment: &mut Attachment, styles: &[&str]) -> AttachmentResult<bool> {
        let Some(file_name) = attachment.file().map(|f| f.file_name.clone()) else {
            return Ok(false);
        };

        let path = self.path(attachment, ORIGINAL);
        let data = self.storage.get(&path).await?;
        attachment.stage(ORIGINAL, StagedFile::new(file_name, data));

        self.post_process(attachment, styles).await?;
        self.flush(attachment, styles).await
    }

    /// Regenerate the original and delete its old object if the path moved.
    ///
    /// The delete runs directly against storage, outside the breaker.
    #[instrument(skip(self, attachment), fields(attachment = %attachment.name()))]
    pub async fn reprocess_original(&self, attachment: &mut Attachment) -> AttachmentResult<()> {
        if !attachment.is_present() {
            return Ok(());
        }

        let old_path = self.path(attachment, ORIGINAL);
        self.reprocess(attachment, &[ORIGINAL]).await?;
        let new_path = self.path(attachment, ORIGINAL);

        if new_path != old_path {
            info!(old = %old_path, new = %new_path, "Original moved, removing old object");
            attachment.queue_for_delete(old_path);
            self.flush_deletes(attachment).await?;
        }

        Ok(())
    }

    /// Delete every style of the attached file and detach it
    #[instrument(skip(self, attachment), fields(attachment = %attachment.name(), resource = %self.resource))]
    pub async fn destroy(&self, attachment: &mut Attachment) -> AttachmentResult<()> {
        self.queue_all_for_delete(attachment);
        attachment.clear_file();

        let target = &mut *attachment;
        self.breakers
            .call(&self.resource, move || async move { self.flush_deletes(target).await })
            .await?;

        attachment.mark_clean();
        Ok(())
    }

    /// Guarded flush for one save. When `process` is non-empty and does not
    /// name the original, a staged original is dropped from the batch
    /// instead of being uploaded again.
    async fn flush<R: AsRef<str> + Sync>(
        &self,
        attachment: &mut Attachment,
        process: &[R],
    ) -> AttachmentResult<bool> {
        let target = &mut *attachment;

        self.breakers
            .call(&self.resource, move || async move {
                if !target.options().keep_old_files {
                    self.flush_deletes(target).await?;
                }

                let skip_original =
                    !process.is_empty() && !process.iter().any(|s| s.as_ref() == ORIGINAL);
                if skip_original {
                    target.queued_for_write.remove(ORIGINAL);
                }

                self.flush_writes(target).await?;
                Ok::<(), AttachmentError>(())
            })
            .await
            .inspect_err(|err| warn!(error = %err, "Attachment save failed"))?;

        attachment.mark_clean();
        Ok(true)
    }

    fn queue_all_for_delete(&self, attachment: &mut Attachment) {
        if !attachment.is_present() {
            return;
        }

        let paths: Vec<String> = attachment
            .styles()
            .iter()
            .map(|style| self.path(attachment, &style.name))
            .collect();

        for path in paths {
            attachment.queue_for_delete(path);
        }
    }

    async fn flush_deletes(&self, attachment: &mut Attachment) -> AttachmentResult<()> {
        for path in attachment.pending_deletes().iter() {
            match self.storage.delete(path).await {
                Ok(()) => debug!(path = %path, "Object deleted"),
                Err(StorageError::NotFound(_)) => debug!(path = %path, "Object already gone"),
                Err(err) => return Err(err.into()),
            }
        }

        attachment.queued_for_delete.clear();
        Ok(())
    }

    async fn flush_writes(&self, attachment: &mut Attachment) -> AttachmentResult<()> {
        for (style, file) in attachment.pending_writes().iter() {
            let path = self.path(attachment, style);
            let metadata = self.storage.put(&path, file.data.clone()).await?;
            debug!(style = %style, path = %path, size = metadata.size, "Style written");
        }

        attachment.queued_for_write.clear();
        Ok(())
    }
}
