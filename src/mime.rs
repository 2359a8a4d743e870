/*
 * Copyright Stalwart Labs Ltd. See the COPYING
 * file at the top-level directory of this distribution.
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! Message assembly.
//!
//! An [`Envelope`] is always rendered as `multipart/mixed` with the text part
//! first, followed by one `application/octet-stream` part per attachment.

use std::{
    fmt::Display,
    io,
    path::{Path, PathBuf},
};

use mail_builder::{
    headers::raw::Raw,
    mime::MimePart,
    MessageBuilder,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub file_name: String,
    pub raw_bytes: Vec<u8>,
}

/// An attachment that could not be read and was left out of the message.
#[derive(Debug)]
pub struct AttachmentError {
    pub path: PathBuf,
    pub reason: io::Error,
}

#[derive(Debug, Clone)]
pub struct Envelope {
    from: String,
    to: Vec<String>,
    subject: String,
    body_text: String,
    attachments: Vec<Attachment>,
    skipped: Vec<PathBuf>,
}

#[derive(Debug, Default)]
pub struct EnvelopeBuilder {
    from: Option<String>,
    to: Vec<String>,
    subject: String,
    body_text: String,
    attachments: Vec<Attachment>,
    paths: Vec<PathBuf>,
}

impl Attachment {
    pub fn new(file_name: impl Into<String>, raw_bytes: impl Into<Vec<u8>>) -> Self {
        Attachment {
            file_name: file_name.into(),
            raw_bytes: raw_bytes.into(),
        }
    }

    /// Reads a file, naming the attachment after its base name.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, AttachmentError> {
        let path = path.as_ref();
        let error = |reason| AttachmentError {
            path: path.to_path_buf(),
            reason,
        };

        if !path.is_file() {
            return Err(error(io::Error::new(
                io::ErrorKind::NotFound,
                "not a readable file",
            )));
        }
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| error(io::Error::new(io::ErrorKind::InvalidInput, "no file name")))?;
        let raw_bytes = std::fs::read(path).map_err(error)?;

        Ok(Attachment {
            file_name,
            raw_bytes,
        })
    }
}

impl AttachmentError {
    pub fn kind(&self) -> crate::ErrorKind {
        crate::ErrorKind::Attachment
    }
}

impl Display for AttachmentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.reason)
    }
}

impl std::error::Error for AttachmentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.reason)
    }
}

impl EnvelopeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    /// Adds recipients, keeping their order.
    pub fn to(mut self, to: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.to.extend(to.into_iter().map(Into::into));
        self
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    pub fn body(mut self, body_text: impl Into<String>) -> Self {
        self.body_text = body_text.into();
        self
    }

    pub fn attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Adds a file to be read when the envelope is built.
    pub fn attachment_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.paths.push(path.into());
        self
    }

    pub fn attachment_paths(mut self, paths: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        self.paths.extend(paths.into_iter().map(Into::into));
        self
    }

    /// Reads attachment files and validates the addresses. Unreadable files
    /// are skipped, only a missing sender or an empty recipient list fail.
    pub fn build(self) -> crate::Result<Envelope> {
        let from = self
            .from
            .map(|from| from.trim().to_string())
            .filter(|from| !from.is_empty())
            .ok_or(crate::Error::MissingMailFrom)?;
        check_address(&from)?;

        let to = self
            .to
            .into_iter()
            .map(|to| to.trim().to_string())
            .filter(|to| !to.is_empty())
            .collect::<Vec<_>>();
        if to.is_empty() {
            return Err(crate::Error::MissingRcptTo);
        }
        for rcpt in &to {
            check_address(rcpt)?;
        }

        let mut attachments = self.attachments;
        let mut skipped = Vec::new();
        for path in self.paths {
            match Attachment::from_path(&path) {
                Ok(attachment) => {
                    log::info!(
                        "Attached {} ({} bytes)",
                        attachment.file_name,
                        attachment.raw_bytes.len()
                    );
                    attachments.push(attachment);
                }
                Err(err) => {
                    log::warn!("Skipping attachment {}", err);
                    skipped.push(err.path);
                }
            }
        }

        Ok(Envelope {
            from,
            to,
            subject: self.subject,
            body_text: self.body_text,
            attachments,
            skipped,
        })
    }
}

// Only rejects what would break the SMTP command line, the server does the
// real validation.
fn check_address(address: &str) -> crate::Result<()> {
    if !address.contains('@')
        || address
            .chars()
            .any(|ch| ch.is_whitespace() || ch.is_control() || ch == '<' || ch == '>')
    {
        return Err(crate::Error::Config(format!(
            "invalid address {:?}",
            address
        )));
    }
    Ok(())
}

impl Envelope {
    pub fn builder() -> EnvelopeBuilder {
        EnvelopeBuilder::new()
    }

    pub fn from(&self) -> &str {
        &self.from
    }

    pub fn to(&self) -> &[String] {
        &self.to
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn body_text(&self) -> &str {
        &self.body_text
    }

    pub fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    /// Attachment paths that could not be read.
    pub fn skipped(&self) -> &[PathBuf] {
        &self.skipped
    }

    pub fn to_message_builder(&self) -> MessageBuilder<'_> {
        let mut parts = Vec::with_capacity(self.attachments.len() + 1);
        parts.push(MimePart::new("text/plain", self.body_text.as_str()));
        for attachment in &self.attachments {
            parts.push(
                MimePart::new("application/octet-stream", attachment.raw_bytes.as_slice())
                    .attachment(attachment.file_name.as_str()),
            );
        }

        MessageBuilder::new()
            .header("From", Raw::new(self.from.as_str()))
            .header("To", Raw::new(self.to.join(", ")))
            .subject(self.subject.as_str())
            .body(MimePart::new("multipart/mixed", parts))
    }

    pub fn write_to_vec(&self) -> io::Result<Vec<u8>> {
        self.to_message_builder().write_to_vec()
    }
}
