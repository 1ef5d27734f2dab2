//! The single-threaded event loop driving the bus.
//!
//! Everything that happens to the bus arrives as a [`BusEvent`] on one
//! mpsc channel: accepted connections, per-peer readiness, and the
//! terminate request from the signal handler. The loop owns the [`Bus`]
//! outright, so no locking exists anywhere in the core.

use crate::bus::Bus;
use crate::connection::{Connection, EventSet};
use crate::peer::PeerCreds;
use ferrobus_types::PeerId;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Events feeding the dispatch loop.
pub enum BusEvent {
    /// A freshly accepted, authenticated connection.
    Accept {
        connection: Box<dyn Connection>,
        creds: PeerCreds,
        /// Receives the assigned peer id, or `None` when admission failed
        /// (the connection is dropped in that case).
        admitted: oneshot::Sender<Option<PeerId>>,
    },
    /// Readiness on one peer's transport.
    Ready { peer: PeerId, events: EventSet },
    /// Drain and exit; sent by the signal integration.
    Terminate,
}

/// Sender half used by listeners, transports, and the signal task.
pub type EventSender = mpsc::Sender<BusEvent>;

/// Queue depth of the event channel. Readiness notifications are edge-ish
/// (one outstanding per peer), so the channel stays shallow.
const EVENT_QUEUE_DEPTH: usize = 256;

/// The dispatch loop.
pub struct Engine {
    bus: Bus,
    events: mpsc::Receiver<BusEvent>,
}

impl Engine {
    /// Wraps a bus into an engine, returning the event sender feeding it.
    #[must_use]
    pub fn new(bus: Bus) -> (Self, EventSender) {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        (Self { bus, events: rx }, tx)
    }

    /// Read access to the bus, for inspection before the loop runs.
    #[must_use]
    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Runs until [`BusEvent::Terminate`] arrives, every sender is gone,
    /// or a fatal error surfaces. Peers are flushed silently on the way
    /// out; the bus is returned for teardown inspection.
    pub async fn run(mut self) -> Bus {
        info!("dispatch loop running");
        while let Some(event) = self.events.recv().await {
            match event {
                BusEvent::Accept {
                    connection,
                    creds,
                    admitted,
                } => {
                    let uid = creds.uid;
                    match self.bus.add_peer(connection, creds) {
                        Ok(id) => {
                            let _ = admitted.send(Some(id));
                        }
                        Err(err) => {
                            warn!(uid, error = %err, "connection not admitted");
                            let _ = admitted.send(None);
                        }
                    }
                }
                BusEvent::Ready { peer, events } => {
                    if let Err(err) = self.bus.dispatch_peer(peer, events) {
                        error!(peer = %peer, error = %err, "fatal dispatch error");
                        break;
                    }
                }
                BusEvent::Terminate => {
                    info!("terminate requested, draining");
                    break;
                }
            }
        }
        self.bus.flush_peers();
        debug!("dispatch loop stopped");
        self.bus
    }
}
