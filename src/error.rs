//! Error types for the ingestion pipeline.
//!
//! Two severities exist: a [`SourceError`] is fatal to the source being
//! iterated (protocol failure, unreadable directory) and ends up as a
//! source-level entry in the run summary, while a [`MessageError`] only
//! fails the item it belongs to and the batch keeps running.

use thiserror::Error;

/// Fatal, protocol-level mailbox failure.
#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IMAP error: {0}")]
    Imap(#[from] async_imap::error::Error),

    #[error("invalid DNS name: {0}")]
    InvalidDnsName(String),

    #[error("IMAP server sent no greeting")]
    MissingGreeting,

    #[error("not connected to the mail server")]
    NotConnected,

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("all supported authentication mechanisms are excluded by the configuration")]
    NoAuthMechanism,

    #[error("mailbox `{0}` not found")]
    MailboxNotFound(String),

    #[error("the resource is not a mailbox")]
    NotSelectable,

    #[error("the mailbox may not have any child mailboxes")]
    NoInferiors,

    #[error("{0}")]
    Protocol(String),
}

/// Fatal failure of a source, regardless of its origin kind.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Mailbox(#[from] MailboxError),

    #[error("directory error: {0}")]
    Directory(#[from] std::io::Error),
}

/// Item-level validation or extraction failure. Never aborts the batch.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("attachment count is not valid ({0})")]
    AttachmentCount(i32),

    #[error("failed to get attached file size, wrong message format?")]
    UnknownSize,

    #[error("attachment file size is not valid ({0} bytes)")]
    InvalidSize(i64),

    #[error("attachment file type is not valid ({0})")]
    InvalidType(String),

    #[error("encoding failed: unknown encoding")]
    UnknownEncoding,

    #[error("failed to decode the attachment content")]
    Decode,
}

/// Outcome of extracting one item from a source. The orchestrator decides
/// the severity: `Message` and `File` fail the item, `Source` aborts the
/// source's iteration.
#[derive(Debug, Error)]
pub enum ItemError {
    #[error("incorrect message: {0}")]
    Message(#[from] MessageError),

    #[error("failed to read report file: {0}")]
    File(std::io::Error),

    #[error(transparent)]
    Source(#[from] SourceError),
}

impl From<MailboxError> for ItemError {
    fn from(err: MailboxError) -> Self {
        ItemError::Source(SourceError::Mailbox(err))
    }
}
