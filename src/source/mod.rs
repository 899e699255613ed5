//! Report sources: cursors over places where aggregate reports arrive.

pub mod action;
pub mod directory;
pub mod mailbox;

use std::fmt;

use crate::error::{ItemError, SourceError};
use crate::mailbox::MessageOverview;

/// Where a report file came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    UploadedFile,
    Mailbox,
    Directory,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::UploadedFile => write!(f, "uploaded_file"),
            SourceKind::Mailbox => write!(f, "email"),
            SourceKind::Directory => write!(f, "directory"),
        }
    }
}

/// One report file pulled out of a source, ready for parsing.
#[derive(Debug, Clone)]
pub struct ReportFile {
    pub filename: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// Disposition settings handed to a source before iteration.
#[derive(Debug, Clone, Default)]
pub struct SourceParams {
    pub when_done: Vec<String>,
    pub when_failed: Vec<String>,
}

/// A cursor over a batch of candidate report files.
///
/// The protocol is rewind, then while `valid`: `current`, decide, then
/// exactly one of `accepted`/`rejected`, then `next`. `current` may fail
/// per item without invalidating the cursor.
pub trait Source {
    fn kind(&self) -> SourceKind;

    /// Identity of the source for logs and failure records.
    fn label(&self) -> String;

    /// Apply disposition settings. Invalid entries are dropped silently,
    /// defaults fill the gaps.
    fn configure(&mut self, params: &SourceParams);

    /// Take a fresh snapshot of the candidate items and park the cursor on
    /// the first one.
    fn rewind(&mut self) -> impl Future<Output = Result<(), SourceError>> + Send;

    fn valid(&self) -> bool;

    /// Position of the cursor within the current snapshot.
    fn key(&self) -> usize;

    /// Extract the item under the cursor.
    fn current(&mut self) -> impl Future<Output = Result<ReportFile, ItemError>> + Send;

    fn next(&mut self);

    /// Run the success dispositions for the item under the cursor.
    fn accepted(&mut self) -> impl Future<Output = Result<(), SourceError>> + Send;

    /// Run the failure dispositions for the item under the cursor.
    fn rejected(&mut self) -> impl Future<Output = Result<(), SourceError>> + Send;

    /// Sender and date of the item under the cursor, when the source kind
    /// has such a notion.
    fn overview(&mut self) -> impl Future<Output = Option<MessageOverview>> + Send;
}
