//! Frame output.
//!
//! Frames go to the registered [`OutputSink`], or to an internal queue the
//! caller drains with [`Engine::take_output`]. Transfer bytes count against
//! the session's outgoing capacity until the sink reports them written.

use std::io;

use bytes::Bytes;
use tracing::trace;

use super::{Engine, Queued};
use crate::{
    codec::{Performative, RawFrame},
    endpoint::SessionId,
    error::{EngineError, EngineFailure, Result},
    preamble::AMQP_HEADER,
};

/// Identifies one write handed to an [`OutputSink`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WriteToken(u64);

/// Whether a sink finished a write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteStatus {
    /// The bytes were written.
    Complete,
    /// The bytes were queued; the caller reports completion through
    /// [`Engine::write_completed`].
    Pending,
}

/// Destination for encoded frames.
pub trait OutputSink {
    /// Accept `frame` for writing.
    ///
    /// # Errors
    /// A failed write fails the engine.
    fn write(&mut self, frame: Bytes, token: WriteToken) -> io::Result<WriteStatus>;
}

impl<F> OutputSink for F
where
    F: FnMut(Bytes) -> io::Result<()>,
{
    fn write(&mut self, frame: Bytes, _token: WriteToken) -> io::Result<WriteStatus> {
        self(frame)?;
        Ok(WriteStatus::Complete)
    }
}

impl Engine {
    /// Route output to `sink` instead of the internal queue. Frames already
    /// queued stay available through [`Engine::take_output`].
    pub fn set_output_sink(&mut self, sink: impl OutputSink + 'static) {
        self.sink = Some(Box::new(sink));
    }

    /// Drain frames queued while no sink was registered.
    pub fn take_output(&mut self) -> Vec<Bytes> { self.output.drain(..).collect() }

    /// Report that the write identified by `token` finished. Releases the
    /// session capacity it held and resumes blocked writes.
    ///
    /// # Errors
    /// Returns [`EngineError::Failed`] when resuming writes fails the sink.
    pub fn write_completed(&mut self, token: WriteToken) -> Result<()> {
        self.run(|engine| {
            let Some((session, bytes)) = engine.pending_tokens.remove(&token) else {
                return Ok(());
            };
            engine.release_outgoing(session, bytes)
        })
    }

    /// Return `bytes` of outgoing capacity to `session`.
    fn release_outgoing(&mut self, session: SessionId, bytes: u32) -> Result<()> {
        let Some(state) = self.sessions.get_mut(&session) else {
            return Ok(());
        };
        if state.outgoing.write_completed(bytes) {
            self.capacity_reopened(session)?;
        }
        Ok(())
    }

    /// Session capacity went from none to some: resume queued writes, then
    /// let waiting senders know.
    pub(crate) fn capacity_reopened(&mut self, session: SessionId) -> Result<()> {
        self.pump_writes(session)?;
        self.queue.push_back(Queued::NotifySenders(session));
        Ok(())
    }

    /// Send the protocol header once.
    pub(crate) fn send_header(&mut self) -> Result<()> {
        if self.connection.header_sent {
            return Ok(());
        }
        self.connection.header_sent = true;
        trace!("header out");
        self.write_bytes(Bytes::from_static(&AMQP_HEADER))?;
        Ok(())
    }

    /// Encode and write one performative frame.
    pub(crate) fn send_frame(
        &mut self,
        channel: u16,
        performative: &Performative,
        payload: &[u8],
    ) -> Result<(WriteToken, WriteStatus)> {
        trace!(
            channel,
            performative = performative.name(),
            payload = payload.len(),
            "frame out"
        );
        let frame = RawFrame::performative(channel, performative, payload);
        self.frames_written = self.frames_written.wrapping_add(1);
        self.write_bytes(frame.to_bytes())
    }

    /// Write a transfer frame, holding `bytes` of session capacity until the
    /// sink completes it.
    pub(crate) fn send_transfer_frame(
        &mut self,
        session: SessionId,
        channel: u16,
        performative: &Performative,
        payload: &[u8],
    ) -> Result<()> {
        let bytes = u32::try_from(payload.len()).unwrap_or(u32::MAX);
        if let Some(state) = self.sessions.get_mut(&session) {
            state.outgoing.frame_sent(bytes);
        }
        let (token, status) = self.send_frame(channel, performative, payload)?;
        match status {
            WriteStatus::Pending => {
                self.pending_tokens.insert(token, (session, bytes));
            }
            WriteStatus::Complete => {
                if let Some(state) = self.sessions.get_mut(&session) {
                    state.outgoing.write_completed(bytes);
                }
            }
        }
        Ok(())
    }

    /// Write an empty keepalive frame. Not counted as written activity.
    pub(crate) fn send_heartbeat(&mut self) -> Result<()> {
        trace!("heartbeat out");
        self.write_bytes(RawFrame::heartbeat().to_bytes())?;
        Ok(())
    }

    fn write_bytes(&mut self, bytes: Bytes) -> Result<(WriteToken, WriteStatus)> {
        let token = WriteToken(self.next_token);
        self.next_token = self.next_token.wrapping_add(1);
        let Some(sink) = self.sink.as_mut() else {
            self.output.push_back(bytes);
            return Ok((token, WriteStatus::Complete));
        };
        match sink.write(bytes, token) {
            Ok(status) => Ok((token, status)),
            Err(err) => Err(self.failed(EngineFailure::from(err))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use super::*;
    use crate::error::EngineError;

    #[test]
    fn closure_sinks_complete_synchronously() {
        let written = Rc::new(RefCell::new(Vec::new()));
        let capture = Rc::clone(&written);
        let mut sink = move |frame: Bytes| -> io::Result<()> {
            capture.borrow_mut().push(frame);
            Ok(())
        };
        let status = OutputSink::write(&mut sink, Bytes::from_static(b"x"), WriteToken(0));
        assert!(matches!(status, Ok(WriteStatus::Complete)));
        assert_eq!(written.borrow().len(), 1);
    }

    #[test]
    fn sink_failure_fails_the_engine() {
        let mut engine = Engine::default();
        assert!(engine.start().is_ok());
        engine.set_output_sink(|_: Bytes| -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
        });
        let err = engine.open_connection();
        assert!(matches!(err, Err(EngineError::Failed(EngineFailure::Io(_)))));
        assert!(!engine.is_writable());
    }

    #[test]
    fn unknown_token_is_ignored() {
        let mut engine = Engine::default();
        assert!(engine.write_completed(WriteToken(99)).is_ok());
    }
}
