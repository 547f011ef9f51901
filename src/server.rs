//! WebSocket feed of oracle events.
//!
//! Every client gets the latest quote as soon as it connects, then each
//! [`FeedEvent`] as a JSON text frame. Slow clients skip frames rather than
//! hold up the feed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use quote_oracle_core::Notifier;
use quote_oracle_types::{FeedEvent, PriceQuote, QuoteView};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// Frames buffered per client before it starts skipping.
const CLIENT_BUFFER: usize = 256;

/// Bind `addr` and serve the feed until the process exits.
pub async fn run_server(
    addr: &str,
    quotes: Notifier<PriceQuote>,
    event_rx: broadcast::Receiver<FeedEvent>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind feed server to {}", addr))?;
    info!("Quote WebSocket server listening on {}", addr);
    serve(listener, quotes, event_rx).await
}

/// Serve the feed on an already bound listener.
pub async fn serve(
    listener: TcpListener,
    quotes: Notifier<PriceQuote>,
    event_rx: broadcast::Receiver<FeedEvent>,
) -> anyhow::Result<()> {
    let (frame_tx, _) = broadcast::channel::<String>(CLIENT_BUFFER);
    tokio::spawn(encode_events(event_rx, frame_tx.clone()));
    let connected = Arc::new(AtomicUsize::new(0));

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Failed to accept connection: {}", e);
                continue;
            }
        };

        // Subscribe before the handshake so nothing published after the
        // snapshot is missed.
        let frames = frame_tx.subscribe();
        let snapshot = quotes
            .latest()
            .and_then(|record| encode(&FeedEvent::Quote(QuoteView::from(&record.value))));
        let connected = Arc::clone(&connected);

        tokio::spawn(async move {
            let clients = connected.fetch_add(1, Ordering::Relaxed) + 1;
            debug!("Feed client {} connected ({} total)", peer_addr, clients);
            if let Err(e) = serve_client(stream, snapshot, frames).await {
                debug!("Client {} error: {}", peer_addr, e);
            }
            let clients = connected.fetch_sub(1, Ordering::Relaxed) - 1;
            debug!("Feed client {} disconnected ({} left)", peer_addr, clients);
        });
    }
}

/// Serialize events once for all clients.
async fn encode_events(mut event_rx: broadcast::Receiver<FeedEvent>, frame_tx: broadcast::Sender<String>) {
    loop {
        match event_rx.recv().await {
            Ok(event) => {
                if let Some(frame) = encode(&event) {
                    // No subscribers is fine.
                    let _ = frame_tx.send(frame);
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Feed encoder fell behind, skipped {} events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!("Feed event source closed");
}

fn encode(event: &FeedEvent) -> Option<String> {
    match serde_json::to_string(event) {
        Ok(json) => Some(json),
        Err(e) => {
            warn!("Failed to encode feed event: {}", e);
            None
        }
    }
}

async fn serve_client(
    stream: TcpStream,
    snapshot: Option<String>,
    mut frames: broadcast::Receiver<String>,
) -> anyhow::Result<()> {
    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    if let Some(json) = snapshot {
        ws_sender.send(Message::Text(json)).await?;
    }

    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Ok(json) => ws_sender.send(Message::Text(json)).await?,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Slow feed client skipped {} frames", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },

            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Ping(payload))) => ws_sender.send(Message::Pong(payload)).await?,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(_)) => {}
            },
        }
    }
    Ok(())
}
