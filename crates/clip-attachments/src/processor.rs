//! Style processing pipeline
//!
//! Turns the staged original into the file for one style. Image/video
//! transformation is the host's business; it plugs in through [`Processor`].

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{StagedFile, Style};

#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("Processing style {style} failed: {message}")]
    Failed { style: String, message: String },
    #[error("Unsupported source file: {0}")]
    Unsupported(String),
}

/// Generates the file for a style from a source file
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, source: &StagedFile, style: &Style) -> Result<StagedFile, ProcessingError>;
}

/// Copies the source unchanged, only renaming it when the style sets a format
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughProcessor;

#[async_trait]
impl Processor for PassthroughProcessor {
    async fn process(&self, source: &StagedFile, style: &Style) -> Result<StagedFile, ProcessingError> {
        let file_name = match style.format.as_deref() {
            Some(format) => Path::new(&source.file_name)
                .with_extension(format)
                .to_string_lossy()
                .into_owned(),
            None => source.file_name.clone(),
        };

        Ok(StagedFile::new(file_name, source.data.clone()))
    }
}
