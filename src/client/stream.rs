use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};

use crate::error::{ComposerError, ComposerResult, ExecutionError};

use super::{SessionId, SignalEvent};

/// Stream of pushes for one client session.
///
/// Dropping the stream ends the session: the next push finds it
/// disconnected and the session detaches from its signals.
#[derive(Debug)]
pub struct ClientStream {
    session: SessionId,
    rx: Receiver<SignalEvent>,
}

fn disconnected() -> ComposerError {
    ComposerError::Execution(ExecutionError::Disconnected {
        path: "client_stream".to_string(),
    })
}

impl ClientStream {
    pub(crate) fn new(session: SessionId, rx: Receiver<SignalEvent>) -> Self {
        Self { session, rx }
    }

    /// The session feeding this stream.
    #[must_use]
    pub const fn session_id(&self) -> SessionId {
        self.session
    }

    /// Receive the next push (blocking).
    pub fn recv(&self) -> ComposerResult<SignalEvent> {
        self.rx.recv().map_err(|_| disconnected())
    }

    /// Receive the next push with a timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> ComposerResult<SignalEvent> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => ComposerError::Execution(ExecutionError::Timeout {
                duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
            RecvTimeoutError::Disconnected => disconnected(),
        })
    }

    /// Next push if one is waiting.
    pub fn try_recv(&self) -> ComposerResult<Option<SignalEvent>> {
        match self.rx.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(disconnected()),
        }
    }

    /// Pushes waiting in the buffer.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// True when no push is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
