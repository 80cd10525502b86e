//! An [`OutputSink`] that records what it is given.

use std::{
    cell::{Cell, RefCell},
    io,
    rc::Rc,
};

use amqp_engine::{OutputSink, WriteStatus, WriteToken};
use bytes::Bytes;

/// Records every write. Clones share the same record, so a test keeps one
/// clone while the engine owns another.
#[derive(Clone, Debug, Default)]
pub struct RecordingSink {
    writes: Rc<RefCell<Vec<(Bytes, WriteToken)>>>,
    pending: Rc<Cell<bool>>,
}

impl RecordingSink {
    /// Report later writes as pending instead of complete.
    pub fn hold_writes(&self, pending: bool) { self.pending.set(pending); }

    /// Take the recorded writes.
    #[must_use]
    pub fn take(&self) -> Vec<(Bytes, WriteToken)> { self.writes.borrow_mut().drain(..).collect() }

    /// Take the recorded bytes, dropping tokens.
    #[must_use]
    pub fn take_bytes(&self) -> Vec<Bytes> {
        self.take().into_iter().map(|(bytes, _)| bytes).collect()
    }

    /// Writes recorded so far.
    #[must_use]
    pub fn len(&self) -> usize { self.writes.borrow().len() }

    /// Nothing recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.writes.borrow().is_empty() }
}

impl OutputSink for RecordingSink {
    fn write(&mut self, frame: Bytes, token: WriteToken) -> io::Result<WriteStatus> {
        self.writes.borrow_mut().push((frame, token));
        Ok(if self.pending.get() {
            WriteStatus::Pending
        } else {
            WriteStatus::Complete
        })
    }
}
