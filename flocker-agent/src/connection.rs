//! Connection to the control service: mutual-TLS client with a version
//! handshake, automatic reconnection with capped exponential backoff, and
//! ordered delivery of cluster updates into the convergence loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures_util::{SinkExt, StreamExt};
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{info, warn};

use flocker_common::proto::{Message, MAX_FRAME_BYTES, PROTOCOL_MAJOR};
use flocker_common::wire;

use crate::convergence::ClusterUpdate;

/// Reconnect delays in seconds; the first attempt is immediate and the cap
/// holds once the table is exhausted.
pub const RECONNECT_BACKOFF_SECS: [u64; 7] = [0, 1, 2, 4, 8, 16, 30];

#[derive(Debug, Error)]
enum SessionError {
    #[error("control service speaks protocol major {found}, this agent requires {required}")]
    VersionMismatch { found: u32, required: u32 },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub struct ControlConnector {
    addr: String,
    server_name: ServerName<'static>,
    tls: TlsConnector,
}

impl ControlConnector {
    pub fn new(addr: impl Into<String>, tls_config: Arc<ClientConfig>) -> Result<Self> {
        let addr = addr.into();
        let host = addr
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(addr.as_str());
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| anyhow!("{} is not a valid TLS server name", host))?;
        Ok(ControlConnector {
            addr,
            server_name,
            tls: TlsConnector::from(tls_config),
        })
    }

    async fn connect(
        &self,
    ) -> Result<Framed<tokio_rustls::client::TlsStream<TcpStream>, LengthDelimitedCodec>> {
        let tcp = TcpStream::connect(&self.addr)
            .await
            .with_context(|| format!("connecting to control service at {}", self.addr))?;
        let tls = self
            .tls
            .connect(self.server_name.clone(), tcp)
            .await
            .context("TLS handshake with control service failed")?;
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(MAX_FRAME_BYTES)
            .new_codec();
        Ok(Framed::new(tls, codec))
    }
}

/// Maintain the control connection forever. Returns only on a protocol
/// major mismatch, which is fatal: the process exits so a supervisor can
/// restart it against a compatible control service.
pub async fn run(
    connector: ControlConnector,
    updates: mpsc::Sender<ClusterUpdate>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
) -> Result<()> {
    let mut failures = 0usize;
    loop {
        let delay = RECONNECT_BACKOFF_SECS[failures.min(RECONNECT_BACKOFF_SECS.len() - 1)];
        if delay > 0 {
            tokio::time::sleep(Duration::from_secs(delay)).await;
        }
        match session(&connector, &updates, &mut outbound).await {
            // A session that got past the handshake resets the backoff.
            Ok(()) => {
                failures = 0;
                info!("control connection lost, reconnecting");
            }
            Err(SessionError::VersionMismatch { found, required }) => {
                return Err(anyhow!(
                    "control service speaks protocol major {}, this agent requires {}",
                    found,
                    required
                ));
            }
            Err(SessionError::Other(e)) => {
                failures += 1;
                warn!(error = %e, attempt = failures, "control connection failed");
            }
        }
    }
}

async fn session(
    connector: &ControlConnector,
    updates: &mpsc::Sender<ClusterUpdate>,
    outbound: &mut mpsc::UnboundedReceiver<Message>,
) -> Result<(), SessionError> {
    let mut framed = connector.connect().await?;

    framed
        .send(
            wire::encode(&Message::Version)
                .context("encoding version request")?
                .into(),
        )
        .await
        .context("sending version request")?;

    let first = framed
        .next()
        .await
        .ok_or_else(|| anyhow!("control service closed during handshake"))?
        .context("reading version response")?;
    match wire::decode(&first).context("decoding version response")? {
        Message::VersionResponse { major } if major == PROTOCOL_MAJOR => {}
        Message::VersionResponse { major } => {
            return Err(SessionError::VersionMismatch {
                found: major,
                required: PROTOCOL_MAJOR,
            });
        }
        other => {
            return Err(anyhow!("unexpected handshake response: {:?}", other).into());
        }
    }
    info!("connected to control service");

    // Past the handshake: any further failure is an ordinary disconnect.
    loop {
        tokio::select! {
            frame = framed.next() => {
                let Some(frame) = frame else { return Ok(()) };
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(error = %e, "control stream error");
                        return Ok(());
                    }
                };
                let message: Message = match wire::decode(&frame) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(error = %e, "undecodable frame from control service");
                        continue;
                    }
                };
                if let Message::ClusterStatus { configuration, state, trace_id } = message {
                    // Per-connection ordering is the transport's; awaiting
                    // here preserves it into the loop's channel.
                    if updates
                        .send(ClusterUpdate { configuration, state, trace_id })
                        .await
                        .is_err()
                    {
                        return Ok(());
                    }
                }
            }
            queued = outbound.recv() => {
                let Some(message) = queued else { return Ok(()) };
                let bytes = wire::encode(&message).context("encoding outbound message")?;
                if let Err(e) = framed.send(bytes.into()).await {
                    warn!(error = %e, "send to control service failed");
                    return Ok(());
                }
            }
        }
    }
}
