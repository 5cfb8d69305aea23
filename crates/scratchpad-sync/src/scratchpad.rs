//! The shared document of the active connection and its dirtiness tracking.
//!
//! Local edits mark the text dirty and stamp it with the edit time. The flush
//! tick asks [`ScratchpadState::due_text`] whether the document has been quiet
//! long enough to push; bursts of keystrokes therefore collapse into a single
//! push of the latest text. `dirty` is only cleared once the push went out.
//!
//! Remote updates always replace local state (last write wins on arrival) and
//! are never echoed back. The file list has no quiet interval: every mutation
//! marks it for an immediate wholesale push.

use scratchpad_core::types::{FileEntry, FileList, Origin, TextDocument};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScratchpadState {
    /// Current text; `timestamp` is the last change time in epoch millis.
    document: TextDocument,
    files: FileList,
    /// Text has local changes that have not been pushed.
    dirty: bool,
    /// File list has local changes that have not been pushed.
    files_dirty: bool,
    origin: Origin,
    /// The user has seen the latest remote change.
    notified: bool,
}

impl ScratchpadState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Back to an empty local document, as on a connection switch.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    // ── Mutations ─────────────────────────────────────────────────────────────

    pub fn local_text_change(&mut self, text: impl Into<String>, now_ms: u64) {
        self.document = TextDocument::new(text, now_ms);
        self.dirty = true;
        self.origin = Origin::Local;
    }

    /// Adopt a document received from the peer.
    pub fn remote_text_change(&mut self, document: TextDocument) {
        self.document = document;
        self.dirty = false;
        self.origin = Origin::Remote;
        self.notified = false;
    }

    /// Adopt a file list received from the peer.
    pub fn remote_files_change(&mut self, files: FileList) {
        self.files = files;
        self.files_dirty = false;
        self.notified = false;
    }

    /// Install the text shown for a scratchpad with no history. Counts as a
    /// remote document stamped at 0 so it is never pushed.
    pub fn set_placeholder(&mut self, text: impl Into<String>) {
        self.document = TextDocument::new(text, 0);
        self.dirty = false;
        self.origin = Origin::Remote;
    }

    pub fn add_file(&mut self, entry: FileEntry) {
        self.files.push(entry);
        self.files_dirty = true;
    }

    /// Remove the file at `index`; `None` if out of range.
    pub fn delete_file(&mut self, index: usize) -> Option<FileEntry> {
        if index >= self.files.len() {
            return None;
        }
        let removed = self.files.remove(index);
        self.files_dirty = true;
        Some(removed)
    }

    pub fn mark_notified(&mut self) {
        self.notified = true;
    }

    // ── Flush ─────────────────────────────────────────────────────────────────

    /// The document to push, if it is dirty and has been quiet for `quiet`.
    pub fn due_text(&self, now_ms: u64, quiet: Duration) -> Option<&TextDocument> {
        let quiet_ms = u64::try_from(quiet.as_millis()).unwrap_or(u64::MAX);
        let elapsed = now_ms.saturating_sub(self.document.timestamp);
        (self.dirty && elapsed >= quiet_ms).then_some(&self.document)
    }

    pub fn mark_text_pushed(&mut self) {
        self.dirty = false;
    }

    /// The last text push never reached the channel; push it again.
    pub fn mark_text_unsent(&mut self) {
        if self.origin == Origin::Local {
            self.dirty = true;
        }
    }

    /// The file list to push, if it has unpushed changes.
    pub fn due_files(&self) -> Option<&FileList> {
        self.files_dirty.then_some(&self.files)
    }

    pub fn mark_files_pushed(&mut self) {
        self.files_dirty = false;
    }

    pub fn mark_files_unsent(&mut self) {
        self.files_dirty = true;
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn document(&self) -> &TextDocument {
        &self.document
    }

    pub fn text(&self) -> &str {
        &self.document.text
    }

    pub fn files(&self) -> &FileList {
        &self.files
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn files_dirty(&self) -> bool {
        self.files_dirty
    }

    pub fn last_change(&self) -> u64 {
        self.document.timestamp
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn is_notified(&self) -> bool {
        self.notified
    }
}
