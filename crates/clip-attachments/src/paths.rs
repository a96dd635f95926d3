//! Storage path resolution
//!
//! Paths are derived from the attachment's current state, so regenerating
//! the original (new name, new fingerprint) can move it.
//!
//! Supported tokens for [`PathPattern`]:
//!
//! | Token           | Value                                      |
//! |-----------------|--------------------------------------------|
//! | `:class`        | owner model name                           |
//! | `:attachment`   | attachment name                            |
//! | `:id`           | owner id                                   |
//! | `:id_partition` | owner id zero-padded to 9 digits, `000/000/042` |
//! | `:style`        | style name                                 |
//! | `:filename`     | `:basename.:extension`                     |
//! | `:basename`     | file name without extension                |
//! | `:extension`    | style format, else the file's extension    |
//! | `:fingerprint`  | SHA256 of the stored original              |
//!
//! Unknown tokens are kept verbatim.

use crate::model::Attachment;

/// Storage path of a style
pub trait PathResolver: Send + Sync {
    fn path(&self, attachment: &Attachment, style: &str) -> String;
}

impl<F> PathResolver for F
where
    F: Fn(&Attachment, &str) -> String + Send + Sync,
{
    fn path(&self, attachment: &Attachment, style: &str) -> String {
        self(attachment, style)
    }
}

/// Token-interpolated path template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    pattern: String,
}

impl PathPattern {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    fn token(&self, token: &str, attachment: &Attachment, style: &str) -> Option<String> {
        let owner = attachment.owner();
        let file = attachment.file();

        let extension = || {
            attachment
                .style(style)
                .and_then(|s| s.format.clone())
                .or_else(|| file.map(|f| f.extension().to_string()))
                .unwrap_or_default()
        };
        let basename = || file.map(|f| f.basename().to_string()).unwrap_or_default();

        let value = match token {
            "class" => owner.model_name().to_string(),
            "attachment" => attachment.name().to_string(),
            "id" => owner.id().to_string(),
            "id_partition" => id_partition(owner.id()),
            "style" => style.to_string(),
            "basename" => basename(),
            "extension" => extension(),
            "filename" => {
                let ext = extension();
                if ext.is_empty() {
                    basename()
                } else {
                    format!("{}.{}", basename(), ext)
                }
            }
            "fingerprint" => file.map(|f| f.fingerprint.clone()).unwrap_or_default(),
            _ => return None,
        };

        Some(value)
    }
}

impl PathResolver for PathPattern {
    fn path(&self, attachment: &Attachment, style: &str) -> String {
        let mut out = String::with_capacity(self.pattern.len() + 32);
        let mut rest = self.pattern.as_str();

        while let Some(pos) = rest.find(':') {
            out.push_str(&rest[..pos]);
            let after = &rest[pos + 1..];
            let len = after
                .find(|c: char| !(c.is_ascii_lowercase() || c == '_'))
                .unwrap_or(after.len());
            let name = &after[..len];

            match self.token(name, attachment, style) {
                Some(value) => out.push_str(&value),
                None => {
                    out.push(':');
                    out.push_str(name);
                }
            }
            rest = &after[len..];
        }
        out.push_str(rest);

        out
    }
}

fn id_partition(id: i64) -> String {
    let padded = format!("{:09}", id);
    let (head, tail) = padded.split_at(padded.len() - 6);
    format!("{}/{}/{}", head, &tail[..3], &tail[3..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{StagedFile, StoredFile, Style};
    use bytes::Bytes;
    use clip_core::config::DEFAULT_PATH_PATTERN;
    use clip_core::traits::{AttachmentOwner, Id};
    use std::sync::Arc;

    struct Account(Id);

    impl AttachmentOwner for Account {
        fn model_name(&self) -> &str {
            "accounts"
        }

        fn id(&self) -> Id {
            self.0
        }
    }

    fn attachment(id: Id) -> Attachment {
        Attachment::new(Arc::new(Account(id)), "avatars")
            .with_style(Style::new("static").with_format("png"))
            .with_stored_file(StoredFile::from_staged(&StagedFile::new(
                "me.gif",
                Bytes::from_static(b"abc"),
            )))
    }

    #[test]
    fn test_default_pattern() {
        let pattern = PathPattern::new(DEFAULT_PATH_PATTERN);

        assert_eq!(
            pattern.path(&attachment(42), "original"),
            "accounts/avatars/000/000/042/original/me.gif"
        );
        assert_eq!(
            pattern.path(&attachment(42), "static"),
            "accounts/avatars/000/000/042/static/me.png"
        );
    }

    #[test]
    fn test_id_partition_large_ids() {
        assert_eq!(id_partition(1), "000/000/001");
        assert_eq!(id_partition(123_456_789), "123/456/789");
        assert_eq!(id_partition(109_876_543_210), "109876/543/210");
    }

    #[test]
    fn test_fingerprint_and_unknown_tokens() {
        let pattern = PathPattern::new("/:class/:fingerprint-:style:bogus.:extension");

        assert_eq!(
            pattern.path(&attachment(1), "original"),
            "/accounts/ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad-original:bogus.gif"
        );
    }

    #[test]
    fn test_missing_file_interpolates_empty() {
        let attachment = Attachment::new(Arc::new(Account(3)), "headers");
        let pattern = PathPattern::new(":attachment/:id/:style/:filename");

        assert_eq!(pattern.path(&attachment, "original"), "headers/3/original/");
    }

    #[test]
    fn test_closure_resolver() {
        let resolver = |a: &Attachment, style: &str| format!("/{}/{}", a.name(), style);
        assert_eq!(resolver.path(&attachment(1), "small"), "/avatars/small");
    }
}
