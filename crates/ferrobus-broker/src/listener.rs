//! The accept loop and signal integration.

use crate::creds::peer_credentials;
use crate::transport::{watch_connection, StreamConnection};
use ferrobus_core::{BusEvent, EventSender};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Accepts connections forever, handing each to the dispatch loop.
pub async fn run_listener(listener: UnixListener, events: EventSender, needs_groups: bool) {
    info!("listening for connections");
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let events = events.clone();
                tokio::spawn(async move {
                    if let Err(err) = admit(stream, events, needs_groups).await {
                        warn!(error = %err, "connection setup failed");
                    }
                });
            }
            Err(err) => {
                warn!(error = %err, "accept failed");
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
        }
    }
}

async fn admit(
    stream: UnixStream,
    events: EventSender,
    needs_groups: bool,
) -> std::io::Result<()> {
    let creds = peer_credentials(&stream, needs_groups)?;
    let (connection, raw_stream, interest_rx) = StreamConnection::new(stream);

    let (admitted_tx, admitted_rx) = oneshot::channel();
    let accept = BusEvent::Accept {
        connection: Box::new(connection),
        creds,
        admitted: admitted_tx,
    };
    if events.send(accept).await.is_err() {
        return Ok(()); // the bus is shutting down
    }
    match admitted_rx.await {
        Ok(Some(peer)) => {
            debug!(peer = %peer, "watching connection");
            tokio::spawn(watch_connection(raw_stream, peer, events, interest_rx));
        }
        Ok(None) | Err(_) => {
            // Refused; the connection object was dropped with the bus's
            // decision and the stream closes with our Arc.
        }
    }
    Ok(())
}

/// Waits for SIGTERM/SIGINT and asks the dispatch loop to drain.
pub async fn signal_task(events: EventSender) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            warn!(error = %err, "cannot install SIGTERM handler");
            return;
        }
    };
    let mut int = match signal(SignalKind::interrupt()) {
        Ok(int) => int,
        Err(err) => {
            warn!(error = %err, "cannot install SIGINT handler");
            return;
        }
    };

    tokio::select! {
        _ = term.recv() => info!("SIGTERM received"),
        _ = int.recv() => info!("SIGINT received"),
    }
    let _ = events.send(BusEvent::Terminate).await;
}
