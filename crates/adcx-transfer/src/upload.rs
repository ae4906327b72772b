//! A single running (or lingering) upload.

use crate::stream::UploadStream;
use adcx_proto::Cid;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// What is being transferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    /// A shared file slice
    File,
    /// The full file list
    FullList,
    /// A partial file list (or TTH list)
    PartialList,
    /// Tiger tree leaf data
    Tree,
}

impl TransferKind {
    /// The `GET` type token.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TransferKind::File | TransferKind::FullList => "file",
            TransferKind::PartialList => "list",
            TransferKind::Tree => "tthl",
        }
    }
}

/// One upload: an opened stream plus accounting state.
#[derive(Debug)]
pub struct Upload {
    /// Scheduler-assigned identifier.
    pub id: u64,
    /// Requesting user.
    pub user: Cid,
    /// Real path for files, virtual path for generated documents.
    pub path: String,
    /// Transfer kind.
    pub kind: TransferKind,
    /// Granted range start.
    pub start: u64,
    /// Granted range length.
    pub length: u64,
    /// Full size of the underlying file/document.
    pub file_size: u64,
    /// The range does not reach the end of the file (peer may resume).
    pub chunked: bool,
    /// Served through partial sharing rather than the share tree.
    pub partial: bool,
    /// Reused a delay-pool stream.
    pub resumed: bool,
    stream: Mutex<Option<UploadStream>>,
    pos: AtomicU64,
    delay_ticks: AtomicU64,
    started: std::time::Instant,
}

impl Upload {
    pub(crate) fn new(
        id: u64,
        user: Cid,
        path: String,
        kind: TransferKind,
        start: u64,
        length: u64,
        file_size: u64,
        partial: bool,
        resumed: bool,
    ) -> Self {
        Upload {
            id,
            user,
            path,
            kind,
            start,
            length,
            file_size,
            chunked: start + length != file_size,
            partial,
            resumed,
            stream: Mutex::new(None),
            pos: AtomicU64::new(0),
            delay_ticks: AtomicU64::new(0),
            started: std::time::Instant::now(),
        }
    }

    /// Time since the upload was prepared.
    #[must_use]
    pub fn elapsed(&self) -> std::time::Duration {
        self.started.elapsed()
    }

    /// Take the stream for sending. The scheduler keeps the accounting
    /// half; the connection drives the stream.
    #[must_use]
    pub fn take_stream(&self) -> Option<UploadStream> {
        self.stream.lock().take()
    }

    /// Give the stream back (delay pool keeps it open for resume).
    pub fn store_stream(&self, stream: UploadStream) {
        *self.stream.lock() = Some(stream);
    }

    /// Record sent bytes.
    pub fn add_pos(&self, bytes: u64) {
        self.pos.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Bytes sent so far.
    #[must_use]
    pub fn pos(&self) -> u64 {
        self.pos.load(Ordering::Relaxed)
    }

    pub(crate) fn tick_delay(&self) -> u64 {
        self.delay_ticks.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn reset_delay(&self) {
        self.delay_ticks.store(0, Ordering::Relaxed);
    }
}
