//! The journal: the store's single mutable cell.
//!
//! Everything in the store is immutable except the head pointer. In
//! memory the head lives in a [`HeadState`] updated only by compare
//! and set; on disk it is a line of the form `<record-id> root`
//! appended to `journal.log` whenever the store flushes. The last
//! parseable line is authoritative, so a torn final line from a crash
//! simply falls back to the previous one.

use crate::error::CoreResult;
use crate::types::RecordId;
use parking_lot::{Condvar, Mutex};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Name of the journal file inside the store directory.
pub(crate) const JOURNAL_FILE: &str = "journal.log";

/// The in-memory head pointer plus its dirty flag.
///
/// The dirty flag tracks whether the current head has been persisted to
/// the journal yet; the flush path clears it and writes the line.
pub(crate) struct HeadState {
    head: Mutex<RecordId>,
    changed: Condvar,
    dirty: AtomicBool,
}

impl HeadState {
    pub(crate) fn new(head: RecordId) -> Self {
        Self {
            head: Mutex::new(head),
            changed: Condvar::new(),
            dirty: AtomicBool::new(false),
        }
    }

    pub(crate) fn get(&self) -> RecordId {
        *self.head.lock()
    }

    /// Atomically replaces the head if it still equals `expected`.
    pub(crate) fn compare_and_set(&self, expected: RecordId, new: RecordId) -> bool {
        let mut head = self.head.lock();
        if *head != expected {
            return false;
        }
        *head = new;
        self.dirty.store(true, Ordering::Release);
        self.changed.notify_all();
        true
    }

    /// Blocks until the head differs from `current` or the timeout
    /// elapses, returning the head seen on wakeup.
    pub(crate) fn wait_for_change(&self, current: RecordId, timeout: Duration) -> RecordId {
        let mut head = self.head.lock();
        if *head != current {
            return *head;
        }
        let _ = self.changed.wait_for(&mut head, timeout);
        *head
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Clears the dirty flag, returning its previous value.
    pub(crate) fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    /// Re-raises the dirty flag, used when persisting the head failed
    /// after the flag was taken.
    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }
}

/// Handle to the store's head pointer.
///
/// This is the only synchronization primitive the store exposes: all
/// commits race through [`set_head`](Journal::set_head), and losers
/// rebase and try again.
#[derive(Clone)]
pub struct Journal {
    state: Arc<HeadState>,
}

impl Journal {
    pub(crate) fn new(state: Arc<HeadState>) -> Self {
        Self { state }
    }

    /// Returns the current head record id.
    #[must_use]
    pub fn head(&self) -> RecordId {
        self.state.get()
    }

    /// Atomically moves the head from `expected` to `new`.
    ///
    /// Returns `false` without any effect if the head no longer equals
    /// `expected`, in which case the caller must rebase onto the new
    /// head and retry.
    pub fn set_head(&self, expected: RecordId, new: RecordId) -> bool {
        self.state.compare_and_set(expected, new)
    }

    /// Blocks until the head differs from `current` or the timeout
    /// elapses, returning the head seen on wakeup.
    pub fn wait_for_head_change(&self, current: RecordId, timeout: Duration) -> RecordId {
        self.state.wait_for_change(current, timeout)
    }
}

/// The on-disk journal file.
pub(crate) struct JournalFile {
    file: File,
}

impl JournalFile {
    /// Opens or creates the journal, returning the handle and the last
    /// recorded head, if any.
    ///
    /// Unparseable lines are skipped rather than treated as errors; a
    /// crash can leave a torn final line and the store must still open.
    pub(crate) fn open(path: &Path) -> CoreResult<(Self, Option<RecordId>)> {
        let mut last = None;
        if path.exists() {
            let reader = BufReader::new(File::open(path)?);
            for line in reader.lines() {
                let line = line?;
                if let Some(id) = parse_line(&line) {
                    last = Some(id);
                }
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok((Self { file }, last))
    }

    /// Appends a head line.
    pub(crate) fn append(&mut self, head: RecordId) -> CoreResult<()> {
        writeln!(self.file, "{head} root")?;
        Ok(())
    }

    /// Forces appended lines to durable storage.
    pub(crate) fn sync(&mut self) -> CoreResult<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

fn parse_line(line: &str) -> Option<RecordId> {
    let (id, rest) = line.trim().split_once(' ')?;
    if rest != "root" {
        return None;
    }
    id.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SegmentId;
    use tempfile::tempdir;

    fn record() -> RecordId {
        RecordId::new(SegmentId::random_data(), 0)
    }

    #[test]
    fn compare_and_set_moves_head_once() {
        let a = record();
        let b = record();
        let c = record();
        let state = HeadState::new(a);

        assert!(state.compare_and_set(a, b));
        assert_eq!(state.get(), b);
        assert!(state.is_dirty());

        // Stale expectation loses.
        assert!(!state.compare_and_set(a, c));
        assert_eq!(state.get(), b);
    }

    #[test]
    fn wait_returns_immediately_when_already_changed() {
        let a = record();
        let b = record();
        let state = HeadState::new(b);

        let seen = state.wait_for_change(a, Duration::from_secs(10));
        assert_eq!(seen, b);
    }

    #[test]
    fn wait_wakes_on_change() {
        let a = record();
        let b = record();
        let state = Arc::new(HeadState::new(a));

        let waiter = {
            let state = Arc::clone(&state);
            std::thread::spawn(move || state.wait_for_change(a, Duration::from_secs(30)))
        };
        std::thread::sleep(Duration::from_millis(20));
        assert!(state.compare_and_set(a, b));
        assert_eq!(waiter.join().unwrap(), b);
    }

    #[test]
    fn wait_times_out_unchanged() {
        let a = record();
        let state = HeadState::new(a);
        let seen = state.wait_for_change(a, Duration::from_millis(10));
        assert_eq!(seen, a);
    }

    #[test]
    fn journal_file_last_line_wins() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(JOURNAL_FILE);

        let first = record();
        let second = record();
        {
            let (mut journal, last) = JournalFile::open(&path).unwrap();
            assert_eq!(last, None);
            journal.append(first).unwrap();
            journal.append(second).unwrap();
            journal.sync().unwrap();
        }

        let (_, last) = JournalFile::open(&path).unwrap();
        assert_eq!(last, Some(second));
    }

    #[test]
    fn torn_final_line_is_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(JOURNAL_FILE);

        let good = record();
        {
            let (mut journal, _) = JournalFile::open(&path).unwrap();
            journal.append(good).unwrap();
        }
        // Simulate a crash mid-append.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"0ed90b02-b6ab-4e23-9f6d").unwrap();
        drop(file);

        let (_, last) = JournalFile::open(&path).unwrap();
        assert_eq!(last, Some(good));
    }

    #[test]
    fn parse_line_rejects_noise() {
        assert_eq!(parse_line("not a line"), None);
        assert_eq!(parse_line(""), None);

        let id = record();
        assert_eq!(parse_line(&format!("{id} root")), Some(id));
        assert_eq!(parse_line(&format!("{id} branch")), None);
    }
}
