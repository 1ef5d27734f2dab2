//! The stream transport: a [`Connection`] over a UNIX socket speaking the
//! frame codec, plus the readiness watcher feeding the dispatch loop.
//!
//! The split mirrors the seam contract: the connection object lives inside
//! the bus and is driven synchronously by the two-phase dispatch; the
//! watcher is a tiny task re-arming on the connection's current interest
//! (published through a watch channel after every dispatch step, because
//! handling inbound traffic may register write interest).

use crate::codec::FrameCodec;
use ferrobus_core::{
    BusEvent, Connection, ConnectionError, EventSender, EventSet, OutboundQueue, User,
};
use ferrobus_message::Message;
use ferrobus_types::PeerId;
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use tokio::io::Interest;
use tokio::net::UnixStream;
use tokio::sync::watch;
use tracing::{debug, trace};

/// Upper bound on uncharged outbound bytes per peer; beyond it the peer is
/// considered unresponsive and shut down by the router.
const MAX_OUTBOX_BYTES: u64 = 8 * 1024 * 1024;

const READ_CHUNK: usize = 16 * 1024;

#[derive(Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Running,
    ShuttingDown,
    Closed,
}

/// A [`Connection`] over a [`UnixStream`].
pub struct StreamConnection {
    stream: Arc<UnixStream>,
    codec: FrameCodec,
    outbound: OutboundQueue,
    /// Partially written frame carried across write phases.
    write_buf: VecDeque<u8>,
    eof: bool,
    state: StreamState,
    interest_tx: watch::Sender<EventSet>,
}

impl StreamConnection {
    /// Wraps an accepted stream; also returns the handles the readiness
    /// watcher needs.
    #[must_use]
    pub fn new(stream: UnixStream) -> (Self, Arc<UnixStream>, watch::Receiver<EventSet>) {
        let stream = Arc::new(stream);
        let (interest_tx, interest_rx) =
            watch::channel(EventSet::READABLE | EventSet::HANGUP);
        let connection = Self {
            stream: Arc::clone(&stream),
            codec: FrameCodec::new(),
            outbound: OutboundQueue::new(MAX_OUTBOX_BYTES),
            write_buf: VecDeque::new(),
            eof: false,
            state: StreamState::Running,
            interest_tx,
        };
        (connection, stream, interest_rx)
    }

    fn current_interest(&self) -> EventSet {
        let write_pending = !self.outbound.is_empty() || !self.write_buf.is_empty();
        match self.state {
            StreamState::Closed => EventSet::EMPTY,
            StreamState::ShuttingDown => {
                if write_pending {
                    EventSet::WRITABLE
                } else {
                    EventSet::EMPTY
                }
            }
            StreamState::Running => {
                let base = EventSet::READABLE | EventSet::HANGUP;
                if write_pending {
                    base | EventSet::WRITABLE
                } else {
                    base
                }
            }
        }
    }

    /// Publishes the current interest; wakes the watcher unconditionally
    /// so it can re-arm after a dispatch turn.
    fn publish_interest(&self) {
        let _ = self.interest_tx.send(self.current_interest());
    }

    fn fill_inbound(&mut self) -> Result<(), ConnectionError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.try_read(&mut chunk) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(());
                }
                Ok(n) => self.codec.push(&chunk[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) => return Err(ConnectionError::Io(err.to_string())),
            }
        }
    }

    fn flush_outbound(&mut self) -> Result<(), ConnectionError> {
        loop {
            if self.write_buf.is_empty() {
                let Some(message) = self.outbound.pop() else {
                    break;
                };
                let frame = FrameCodec::encode(&message)
                    .map_err(|err| ConnectionError::Io(err.to_string()))?;
                self.write_buf.extend(frame);
            }
            let (front, _) = self.write_buf.as_slices();
            match self.stream.try_write(front) {
                Ok(n) => {
                    self.write_buf.drain(..n);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(ConnectionError::Io(err.to_string())),
            }
        }
        if self.state == StreamState::ShuttingDown
            && self.outbound.is_empty()
            && self.write_buf.is_empty()
        {
            self.state = StreamState::Closed;
        }
        Ok(())
    }
}

impl Connection for StreamConnection {
    fn dispatch(&mut self, events: EventSet) -> Result<(), ConnectionError> {
        if self.state == StreamState::Closed {
            return Ok(());
        }
        let result = (|| {
            if events.intersects(EventSet::READABLE | EventSet::HANGUP)
                && self.state == StreamState::Running
            {
                self.fill_inbound()?;
            }
            if events.intersects(EventSet::WRITABLE) {
                self.flush_outbound()?;
            }
            Ok(())
        })();
        self.publish_interest();
        result
    }

    fn dequeue(&mut self) -> Result<Option<Message>, ConnectionError> {
        if self.state != StreamState::Running {
            return Ok(None);
        }
        match self.codec.next_message() {
            // A corrupt frame poisons the stream like an abrupt hangup.
            Err(err) => {
                trace!(error = %err, "undecodable frame");
                Err(ConnectionError::Eof)
            }
            Ok(Some(message)) => Ok(Some(message)),
            Ok(None) if self.eof => Err(ConnectionError::Eof),
            Ok(None) => Ok(None),
        }
    }

    fn queue(
        &mut self,
        charge_user: Option<&User>,
        txid: u64,
        message: Message,
    ) -> Result<(), ConnectionError> {
        if self.state == StreamState::Closed {
            // Late traffic to a dying peer is discarded.
            return Ok(());
        }
        let result = self.outbound.queue(charge_user, txid, message);
        self.publish_interest();
        result
    }

    fn interest(&self) -> EventSet {
        self.current_interest()
    }

    fn shutdown(&mut self) {
        if self.state == StreamState::Running {
            self.state = if self.outbound.is_empty() && self.write_buf.is_empty() {
                StreamState::Closed
            } else {
                StreamState::ShuttingDown
            };
        }
        self.publish_interest();
    }

    fn close(&mut self) {
        self.outbound.clear();
        self.write_buf.clear();
        self.state = StreamState::Closed;
        self.publish_interest();
    }

    fn is_running(&self) -> bool {
        self.state != StreamState::Closed
    }
}

fn to_tokio_interest(events: EventSet) -> Interest {
    let mut interest = None;
    if events.intersects(EventSet::READABLE | EventSet::HANGUP) {
        interest = Some(Interest::READABLE);
    }
    if events.intersects(EventSet::WRITABLE) {
        interest = Some(match interest {
            Some(i) => i | Interest::WRITABLE,
            None => Interest::WRITABLE,
        });
    }
    interest.unwrap_or(Interest::READABLE)
}

fn from_tokio_ready(ready: tokio::io::Ready) -> EventSet {
    let mut events = EventSet::EMPTY;
    if ready.is_readable() {
        events = events | EventSet::READABLE;
    }
    if ready.is_writable() {
        events = events | EventSet::WRITABLE;
    }
    if ready.is_read_closed() || ready.is_write_closed() {
        events = events | EventSet::HANGUP;
    }
    events
}

/// Watches one peer's stream and feeds readiness into the dispatch loop.
///
/// After each notification the watcher parks until the connection
/// republishes its interest at the end of the dispatch turn, so readiness
/// is never reported twice for the same unconsumed state.
pub async fn watch_connection(
    stream: Arc<UnixStream>,
    peer: PeerId,
    events: EventSender,
    mut interest_rx: watch::Receiver<EventSet>,
) {
    loop {
        let interest = *interest_rx.borrow_and_update();
        if interest.is_empty() {
            break;
        }
        tokio::select! {
            ready = stream.ready(to_tokio_interest(interest)) => {
                let set = match ready {
                    Ok(ready) => from_tokio_ready(ready).intersection(
                        interest | EventSet::HANGUP,
                    ),
                    Err(err) => {
                        debug!(peer = %peer, error = %err, "readiness poll failed");
                        EventSet::HANGUP
                    }
                };
                if set.is_empty() {
                    continue;
                }
                if events.send(BusEvent::Ready { peer, events: set }).await.is_err() {
                    break;
                }
                // Park until the dispatch turn republishes interest.
                if interest_rx.changed().await.is_err() {
                    break;
                }
            }
            changed = interest_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    debug!(peer = %peer, "connection watcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrobus_message::MessageKind;

    fn message(serial: u32) -> Message {
        Message::signal(serial, "/", "org.x.I", "Ping")
    }

    #[tokio::test]
    async fn queue_flush_and_peer_read() {
        let (left, right) = UnixStream::pair().expect("socketpair");
        let (mut connection, _stream, _interest) = StreamConnection::new(left);

        connection.queue(None, 0, message(7)).expect("queued");
        assert!(connection.interest().intersects(EventSet::WRITABLE));
        connection.dispatch(EventSet::WRITABLE).expect("flushed");
        assert!(!connection.interest().intersects(EventSet::WRITABLE));

        right.readable().await.expect("readable");
        let mut buf = vec![0u8; 4096];
        let n = right.try_read(&mut buf).expect("read");
        let mut codec = FrameCodec::new();
        codec.push(&buf[..n]);
        let decoded = codec.next_message().expect("ok").expect("message");
        assert_eq!(decoded.serial, 7);
        assert_eq!(decoded.kind, MessageKind::Signal);
    }

    #[tokio::test]
    async fn peer_write_and_dequeue() {
        let (left, right) = UnixStream::pair().expect("socketpair");
        let (mut connection, _stream, _interest) = StreamConnection::new(left);

        let frame = FrameCodec::encode(&message(3)).expect("encode");
        right.writable().await.expect("writable");
        right.try_write(&frame).expect("write");

        connection.dispatch(EventSet::READABLE).expect("read");
        let decoded = connection.dequeue().expect("ok").expect("message");
        assert_eq!(decoded.serial, 3);
        assert!(connection.dequeue().expect("ok").is_none());
    }

    #[tokio::test]
    async fn hangup_surfaces_as_eof() {
        let (left, right) = UnixStream::pair().expect("socketpair");
        let (mut connection, _stream, _interest) = StreamConnection::new(left);
        drop(right);

        connection.dispatch(EventSet::READABLE).expect("dispatch");
        assert_eq!(connection.dequeue().unwrap_err(), ConnectionError::Eof);
    }

    #[tokio::test]
    async fn corrupt_frame_poisons_the_stream() {
        let (left, right) = UnixStream::pair().expect("socketpair");
        let (mut connection, _stream, _interest) = StreamConnection::new(left);

        right.writable().await.expect("writable");
        let mut bytes = 3u32.to_le_bytes().to_vec();
        bytes.extend(b"!!!");
        right.try_write(&bytes).expect("write");

        connection.dispatch(EventSet::READABLE).expect("dispatch");
        assert_eq!(connection.dequeue().unwrap_err(), ConnectionError::Eof);
    }

    #[tokio::test]
    async fn shutdown_flushes_before_closing() {
        let (left, right) = UnixStream::pair().expect("socketpair");
        let (mut connection, _stream, _interest) = StreamConnection::new(left);

        connection.queue(None, 0, message(9)).expect("queued");
        connection.shutdown();
        assert!(connection.is_running(), "pending output keeps it alive");
        connection.dispatch(EventSet::WRITABLE).expect("flush");
        assert!(!connection.is_running());

        right.readable().await.expect("readable");
        let mut buf = vec![0u8; 4096];
        assert!(right.try_read(&mut buf).expect("read") > 0);
    }
}
