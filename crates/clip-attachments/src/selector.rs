//! Style selection
//!
//! Decides which styles a process or save call acts on. The original is
//! skipped when the owner defers processing, since deferred owners generate
//! their other styles in a background stage and keep the original as uploaded.

use crate::model::{Attachment, Style, ORIGINAL};

/// Whether `style_name` must be (re)generated.
///
/// An empty `requested` list means every style is requested.
pub fn should_process<S: AsRef<str>>(style_name: &str, requested: &[S], delay_processing: bool) -> bool {
    if style_name == ORIGINAL && delay_processing {
        return false;
    }

    requested.is_empty() || requested.iter().any(|s| s.as_ref() == style_name)
}

/// Requested styles bound to an owner's deferral flag
#[derive(Debug, Clone, Copy)]
pub struct StyleSelector<'a, S: AsRef<str>> {
    requested: &'a [S],
    delay_processing: bool,
}

impl<'a, S: AsRef<str>> StyleSelector<'a, S> {
    pub fn new(requested: &'a [S], delay_processing: bool) -> Self {
        Self {
            requested,
            delay_processing,
        }
    }

    pub fn should_process(&self, style_name: &str) -> bool {
        should_process(style_name, self.requested, self.delay_processing)
    }

    /// Styles to process, original first
    pub fn select<'s>(&self, styles: &'s [Style]) -> Vec<&'s Style> {
        let mut selected: Vec<&Style> = styles
            .iter()
            .filter(|style| self.should_process(&style.name))
            .collect();
        selected.sort_by_key(|style| !style.is_original());
        selected
    }
}

impl Attachment {
    /// Selector for `requested` using this attachment's owner deferral flag
    pub fn selector<'a, S: AsRef<str>>(&self, requested: &'a [S]) -> StyleSelector<'a, S> {
        StyleSelector::new(requested, self.delay_processing())
    }

    pub fn process_style<S: AsRef<str>>(&self, style_name: &str, requested: &[S]) -> bool {
        should_process(style_name, requested, self.delay_processing())
    }
}
