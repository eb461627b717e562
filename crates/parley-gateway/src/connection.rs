use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use parley_types::events::ServerEvent;
use parley_types::models::User;

use crate::registry::{Connection, Payload};
use crate::router::{MessageRouter, encode_event};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Run a WebSocket for an already authenticated user until it closes.
///
/// One task writes (draining the outbound queue), the calling task reads.
/// Teardown starts from the read side: when it stops, the connection is
/// unregistered, which closes the queue, which ends the writer.
pub async fn handle_connection(socket: WebSocket, router: MessageRouter, user: User) {
    let (sink, stream) = socket.split();
    let registry = router.registry().clone();

    let (conn, queue) = Connection::new(registry.queue_depth());
    let conn_id = conn.id();
    let shutdown = conn.shutdown_token();
    registry.register(user.id, conn);

    info!("{} ({}) connected to gateway", user.username, user.id);

    match encode_event(&ServerEvent::Ready {
        user_id: user.id,
        username: user.username.clone(),
    }) {
        Ok(ready) => {
            registry.send(user.id, ready);
        }
        Err(e) => warn!("Failed to encode ready event: {}", e),
    }

    let pong_received = Arc::new(AtomicBool::new(true));

    let write_task = tokio::spawn(write_loop(
        sink,
        queue,
        shutdown.clone(),
        pong_received.clone(),
    ));

    read_loop(stream, &router, &user, &shutdown, &pong_received).await;

    registry.unregister(user.id, conn_id);
    // Stop the writer even if a newer connection already replaced this one.
    shutdown.cancel();
    let _ = write_task.await;

    info!("{} ({}) disconnected from gateway", user.username, user.id);
}

async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    router: &MessageRouter,
    user: &User,
    shutdown: &CancellationToken,
    pong_received: &AtomicBool,
) {
    loop {
        let msg = tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = stream.next() => msg,
        };

        match msg {
            Some(Ok(Message::Text(text))) => {
                router.handle_frame(user, text.as_str()).await;
            }
            Some(Ok(Message::Pong(_))) => {
                pong_received.store(true, Ordering::Release);
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!("{} ({}) read error: {}", user.username, user.id, e);
                break;
            }
        }
    }
}

/// The only writer for this socket. Ends when the queue closes, the token is
/// cancelled, a write fails, or the peer stops answering pings.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut queue: mpsc::Receiver<Payload>,
    shutdown: CancellationToken,
    pong_received: Arc<AtomicBool>,
) {
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;
    let mut missed_heartbeats: u8 = 0;

    loop {
        tokio::select! {
            payload = queue.recv() => {
                let Some(payload) = payload else { break };
                if sink.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if pong_received.swap(false, Ordering::Acquire) {
                    missed_heartbeats = 0;
                } else {
                    missed_heartbeats += 1;
                    if missed_heartbeats >= 2 {
                        warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                        break;
                    }
                }
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }

    // Wake the reader if the writer is the side that failed.
    shutdown.cancel();
    let _ = sink.close().await;
}
