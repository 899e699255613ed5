//! IMAP mailbox access.
//!
//! [`client::MailboxClient`] owns the connection lifecycle; the rest of the
//! pipeline only sees the [`MailStore`] trait, which keeps the message and
//! source layers testable without a server.

pub mod client;
pub mod message;

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

use crate::error::MailboxError;

/// The socket under the IMAP session, plain or TLS depending on the
/// configured encryption.
#[derive(Debug)]
pub enum ImapStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for ImapStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ImapStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            ImapStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ImapStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            ImapStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            ImapStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ImapStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            ImapStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ImapStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            ImapStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

pub type ImapSession = async_imap::Session<ImapStream>;

/// Content-Transfer-Encoding of a message part, as reported by the
/// server's BODYSTRUCTURE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEncoding {
    SevenBit,
    EightBit,
    Binary,
    Base64,
    QuotedPrintable,
    Other(String),
}

/// One top-level MIME part of a message, as scanned from BODYSTRUCTURE.
/// The part body itself is fetched separately and only on demand.
#[derive(Debug, Clone)]
pub struct MailPart {
    /// Attachment filename, from the disposition `filename` parameter or
    /// the type `name` parameter.
    pub filename: Option<String>,
    /// Size in octets as reported by the server, or -1 when unknown.
    pub bytes: i64,
    pub encoding: TransferEncoding,
}

/// Sender and date of a message, for failure records.
#[derive(Debug, Clone, Default)]
pub struct MessageOverview {
    pub from: Option<String>,
    pub date: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct MailboxStatus {
    pub messages: u32,
    pub unseen: u32,
}

/// Message-level mailbox operations needed by the ingestion pipeline.
pub trait MailStore {
    /// Sequence numbers of unseen messages, ascending (arrival order).
    fn unseen_sorted(&mut self)
    -> impl Future<Output = Result<Vec<u32>, MailboxError>> + Send;

    /// Top-level MIME parts of a message, in part-number order (part 1
    /// first).
    fn scan_parts(
        &mut self,
        number: u32,
    ) -> impl Future<Output = Result<Vec<MailPart>, MailboxError>> + Send;

    /// Raw (still transfer-encoded) body of one part. Does not mark the
    /// message as seen.
    fn fetch_part(
        &mut self,
        number: u32,
        part: u32,
    ) -> impl Future<Output = Result<Vec<u8>, MailboxError>> + Send;

    fn set_seen(&mut self, number: u32)
    -> impl Future<Output = Result<(), MailboxError>> + Send;

    /// Move a message into a sibling of the selected mailbox, creating
    /// that mailbox when absent.
    fn move_message(
        &mut self,
        number: u32,
        mailbox: &str,
    ) -> impl Future<Output = Result<(), MailboxError>> + Send;

    fn delete_message(
        &mut self,
        number: u32,
    ) -> impl Future<Output = Result<(), MailboxError>> + Send;

    /// Sender and date, best effort. Failures are swallowed since the
    /// overview only enriches failure records.
    fn overview(&mut self, number: u32) -> impl Future<Output = Option<MessageOverview>> + Send;

    /// Identity of the backing mailbox for logs and summaries.
    fn label(&self) -> String;
}
