//! Turning user input into outgoing payloads.
//!
//! Messages travel as a plain body string. Attachments use a reserved
//! marker inside that body:
//!
//! ```text
//! [attachment]<url>[|<mime or kind>][|<durationMs>]
//! ```
//!
//! [`Payload`] is the structured form the engine works with;
//! [`Payload::from_body`] reads the marker (including bodies written by
//! older clients) and [`Payload::to_body`] writes it. The kind comes from
//! the mime hint when present and from the URL's file extension otherwise.
//! A marker whose kind cannot be determined is shown as plain text.

use std::fmt;

use matchchat_proto::message::{MessageId, ValidationError, validate_body};

/// Reserved prefix of attachment bodies.
pub const ATTACHMENT_MARKER: &str = "[attachment]";

/// What a message displays as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Plain text.
    Text,
    /// An image reference.
    Image,
    /// A voice note or other audio reference.
    Audio,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Image => write!(f, "image"),
            Self::Audio => write!(f, "audio"),
        }
    }
}

/// Structured message content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Plain text.
    Text {
        /// The text.
        body: String,
    },
    /// An uploaded image.
    Image {
        /// Where the image can be fetched from.
        url: String,
    },
    /// An uploaded audio clip.
    Audio {
        /// Where the clip can be fetched from.
        url: String,
        /// Clip length, if known.
        duration_ms: Option<u64>,
    },
}

impl Payload {
    /// Plain text payload.
    pub fn text(body: impl Into<String>) -> Self {
        Self::Text { body: body.into() }
    }

    /// The kind this payload displays as.
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        match self {
            Self::Text { .. } => MessageKind::Text,
            Self::Image { .. } => MessageKind::Image,
            Self::Audio { .. } => MessageKind::Audio,
        }
    }

    /// The text of a text payload.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { body } => Some(body),
            _ => None,
        }
    }

    /// Parse a wire body, recognizing the attachment marker.
    #[must_use]
    pub fn from_body(body: &str) -> Self {
        let Some(rest) = body.strip_prefix(ATTACHMENT_MARKER) else {
            return Self::text(body);
        };
        let mut parts = rest.split('|');
        let url = parts.next().unwrap_or_default().trim();
        if url.is_empty() {
            return Self::text(body);
        }
        let hint = parts.next().map(str::trim).filter(|h| !h.is_empty());
        let duration_ms = parts.next().and_then(|d| d.trim().parse::<u64>().ok());

        match classify(url, hint) {
            Some(MessageKind::Image) => Self::Image {
                url: url.to_owned(),
            },
            Some(MessageKind::Audio) => Self::Audio {
                url: url.to_owned(),
                duration_ms,
            },
            Some(MessageKind::Text) | None => {
                tracing::debug!(url, "attachment of unknown kind shown as text");
                Self::text(body)
            }
        }
    }

    /// Render the wire body.
    #[must_use]
    pub fn to_body(&self) -> String {
        match self {
            Self::Text { body } => body.clone(),
            Self::Image { url } => format!("{ATTACHMENT_MARKER}{url}|image"),
            Self::Audio {
                url,
                duration_ms: Some(ms),
            } => format!("{ATTACHMENT_MARKER}{url}|audio|{ms}"),
            Self::Audio {
                url,
                duration_ms: None,
            } => format!("{ATTACHMENT_MARKER}{url}|audio"),
        }
    }
}

/// Kind from a mime (or bare kind) hint, then from the URL's extension.
fn classify(url: &str, hint: Option<&str>) -> Option<MessageKind> {
    if let Some(hint) = hint {
        let top = hint.split('/').next().unwrap_or_default();
        if top.eq_ignore_ascii_case("image") {
            return Some(MessageKind::Image);
        }
        if top.eq_ignore_ascii_case("audio") {
            return Some(MessageKind::Audio);
        }
    }
    // Query strings and fragments would hide the extension.
    let path = url.split(['?', '#']).next().unwrap_or(url);
    kind_of_mime(&mime_guess::from_path(path).first()?)
}

fn kind_of_mime(mime: &mime_guess::Mime) -> Option<MessageKind> {
    let top = mime.type_();
    if top == mime_guess::mime::IMAGE {
        Some(MessageKind::Image)
    } else if top == mime_guess::mime::AUDIO {
        Some(MessageKind::Audio)
    } else {
        None
    }
}

/// Kind of a local file about to be uploaded, from its extension.
#[must_use]
pub fn kind_for_path(path: &std::path::Path) -> MessageKind {
    mime_guess::from_path(path)
        .first()
        .and_then(|mime| kind_of_mime(&mime))
        .unwrap_or(MessageKind::Text)
}

/// What the user is composing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Draft {
    /// Typed text.
    pub text: String,
    /// A completed upload, if one is attached.
    pub attachment: Option<Attachment>,
    /// Message being replied to.
    pub reply_to: Option<MessageId>,
}

/// A finished upload referenced by a draft.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    /// URL returned by the upload collaborator.
    pub url: String,
    /// What the upload contains.
    pub kind: MessageKind,
    /// Clip length for audio.
    pub duration_ms: Option<u64>,
}

impl Draft {
    /// A text-only draft.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// Attach a finished upload.
    #[must_use]
    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachment = Some(attachment);
        self
    }

    /// Reply to an earlier message.
    #[must_use]
    pub fn replying_to(mut self, id: MessageId) -> Self {
        self.reply_to = Some(id);
        self
    }
}

/// Output of [`compose`]: one or two payloads ready for optimistic insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Composed {
    /// Payloads in send order (attachment first, then caption).
    pub payloads: Vec<Payload>,
    /// Message being replied to, applied to every payload.
    pub reply_to: Option<MessageId>,
}

/// Validate a draft and split it into payloads. Synchronous; no I/O.
///
/// An attachment with text becomes two messages: the attachment, then the
/// text as a caption.
///
/// # Errors
///
/// Returns [`ValidationError::Empty`] if the draft has neither text nor an
/// attachment, and [`ValidationError::TooLarge`] if any resulting body
/// exceeds `max_body`.
pub fn compose(draft: Draft, max_body: usize) -> Result<Composed, ValidationError> {
    let mut payloads = Vec::with_capacity(2);

    if let Some(attachment) = draft.attachment {
        let payload = match attachment.kind {
            MessageKind::Image => Payload::Image {
                url: attachment.url,
            },
            MessageKind::Audio => Payload::Audio {
                url: attachment.url,
                duration_ms: attachment.duration_ms,
            },
            MessageKind::Text => Payload::text(attachment.url),
        };
        validate_body(&payload.to_body(), max_body)?;
        payloads.push(payload);
    }

    if !draft.text.trim().is_empty() || payloads.is_empty() {
        validate_body(&draft.text, max_body)?;
        payloads.push(Payload::text(draft.text));
    }

    Ok(Composed {
        payloads,
        reply_to: draft.reply_to,
    })
}
