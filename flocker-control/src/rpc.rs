//! Agent-facing RPC server.
//!
//! Each connected agent gets a session that lives until the transport
//! drops. Messages to an agent go through its session's queue, so every
//! connection sees broadcasts in the order they were produced. Broadcast
//! triggers: a configuration change, receipt of a node-state update, and a
//! new agent completing the version handshake (that one goes to the new
//! agent only). A failed send is logged and dropped; the transport's own
//! liveness handling is the only disconnection signal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use flocker_common::proto::{new_trace_id, Message, MAX_FRAME_BYTES, PROTOCOL_MAJOR};
use flocker_common::wire;

use crate::app::AppState;

pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_BYTES)
        .new_codec()
}

/// Registry of live agent sessions.
#[derive(Default)]
pub struct AgentHub {
    sessions: parking_lot::Mutex<HashMap<u64, mpsc::UnboundedSender<Message>>>,
    next_id: AtomicU64,
}

impl AgentHub {
    pub fn register(&self) -> (u64, mpsc::UnboundedReceiver<Message>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions.lock().insert(id, tx);
        (id, rx)
    }

    pub fn deregister(&self, id: u64) {
        self.sessions.lock().remove(&id);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn send_to(&self, id: u64, message: Message) {
        if let Some(tx) = self.sessions.lock().get(&id) {
            if tx.send(message).is_err() {
                warn!(session = id, "dropping message for closed agent session");
            }
        }
    }

    pub fn broadcast(&self, message: Message) {
        for (id, tx) in self.sessions.lock().iter() {
            if tx.send(message.clone()).is_err() {
                warn!(session = *id, "dropping broadcast for closed agent session");
            }
        }
    }

    /// Tear down every session; the per-connection tasks close their
    /// transports once their queues are gone.
    pub fn shutdown(&self) {
        self.sessions.lock().clear();
    }
}

async fn cluster_status(app: &AppState, trace_id: &str) -> Message {
    Message::ClusterStatus {
        configuration: app.config.get().await,
        state: app.state.as_deployment(),
        trace_id: trace_id.to_string(),
    }
}

/// Send the current (configuration, state) snapshot to every session.
pub async fn broadcast_status(app: &AppState, trace_id: &str) {
    let status = cluster_status(app, trace_id).await;
    debug!(%trace_id, sessions = app.hub.session_count(), "broadcasting cluster status");
    app.hub.broadcast(status);
}

/// Rebroadcast on every committed configuration change.
pub async fn watch_configuration(app: Arc<AppState>) {
    let mut rx = app.config.subscribe();
    while rx.changed().await.is_ok() {
        let change = rx.borrow_and_update().clone();
        info!(trace_id = %change.trace_id, epoch = change.epoch, "configuration changed");
        broadcast_status(&app, &change.trace_id).await;
    }
}

/// Accept loop for agent connections.
pub async fn run(listener: TcpListener, acceptor: TlsAcceptor, app: Arc<AppState>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "agent accept failed");
                continue;
            }
        };
        let acceptor = acceptor.clone();
        let app = app.clone();
        tokio::spawn(async move {
            match acceptor.accept(stream).await {
                Ok(tls) => handle_agent(tls, app, peer.to_string()).await,
                Err(e) => warn!(peer = %peer, error = %e, "agent TLS handshake failed"),
            }
        });
    }
}

async fn handle_agent<S>(stream: S, app: Arc<AppState>, peer: String)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let framed = Framed::new(stream, codec());
    let (mut sink, mut frames) = framed.split();
    let (session, mut queue) = app.hub.register();
    info!(peer = %peer, session, "agent connected");

    loop {
        tokio::select! {
            queued = queue.recv() => {
                let Some(message) = queued else {
                    // Hub shut the session down.
                    break;
                };
                let bytes = match wire::encode(&message) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(session, error = %e, "failed to encode outbound message");
                        continue;
                    }
                };
                if let Err(e) = sink.send(bytes.into()).await {
                    warn!(session, error = %e, "send to agent failed, dropping");
                    break;
                }
            }
            frame = frames.next() => {
                let Some(frame) = frame else { break };
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(session, error = %e, "agent framing error");
                        break;
                    }
                };
                let message: Message = match wire::decode(&frame) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(session, error = %e, "undecodable agent frame");
                        continue;
                    }
                };
                handle_message(&app, session, message).await;
            }
        }
    }

    app.hub.deregister(session);
    info!(peer = %peer, session, "agent disconnected");
}

async fn handle_message(app: &AppState, session: u64, message: Message) {
    match message {
        Message::Version => {
            app.hub.send_to(
                session,
                Message::VersionResponse {
                    major: PROTOCOL_MAJOR,
                },
            );
            // A newly connected agent immediately gets the current picture.
            let trace_id = new_trace_id();
            let status = cluster_status(app, &trace_id).await;
            debug!(session, %trace_id, "sending snapshot to new agent");
            app.hub.send_to(session, status);
        }
        Message::NodeState { changes, trace_id } => {
            debug!(session, %trace_id, changes = changes.len(), "node state update");
            app.state.apply_changes(changes);
            broadcast_status(app, &trace_id).await;
        }
        other => {
            warn!(session, "unexpected message from agent: {:?}", other);
        }
    }
}
