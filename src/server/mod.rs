//! WebSocket signaling server: one task per connection, a writer task fed by
//! the connection's outbound queue, and shared registries behind the router.

pub mod auth;
pub mod registry;
pub mod router;
pub mod store;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Result;
use auth::IdentityVerifier;
use registry::ConnectionHandle;
use router::{MessageRouter, Session};

pub struct SignalingServer {
    listener: TcpListener,
    router: Arc<MessageRouter>,
    verifier: Arc<dyn IdentityVerifier>,
}

impl SignalingServer {
    pub async fn bind(
        addr: &str,
        router: Arc<MessageRouter>,
        verifier: Arc<dyn IdentityVerifier>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| anyhow::anyhow!("failed to bind {}: {}", addr, e))?;
        Ok(Self {
            listener,
            router,
            verifier,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| anyhow::anyhow!("no local addr: {}", e).into())
    }

    pub async fn run(self) -> Result<()> {
        info!("signaling server listening on {}", self.local_addr()?);
        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    continue;
                }
            };
            debug!("connection from {}", peer_addr);
            let router = self.router.clone();
            let verifier = self.verifier.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, router, verifier).await {
                    debug!("connection {} ended: {}", peer_addr, e);
                }
            });
        }
    }
}

/// Pulls `token` out of the request query string, e.g. `/ws?token=abc`.
fn token_from_query(query: Option<&str>) -> Option<String> {
    query?
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
        .map(str::to_owned)
}

async fn handle_connection(
    stream: TcpStream,
    router: Arc<MessageRouter>,
    verifier: Arc<dyn IdentityVerifier>,
) -> Result<()> {
    let token: Arc<StdMutex<Option<String>>> = Arc::new(StdMutex::new(None));
    let token_slot = token.clone();
    let callback = move |req: &Request, resp: Response| -> std::result::Result<Response, ErrorResponse> {
        if let Ok(mut slot) = token_slot.lock() {
            *slot = token_from_query(req.uri().query());
        }
        Ok(resp)
    };
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback).await?;

    let token = token.lock().ok().and_then(|slot| slot.clone());
    let user_id = verifier
        .verify(token.as_deref())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let (mut write, mut read) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    // Writer task: the only place that touches the sink, so a slow client
    // never blocks the read loop or the router.
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if write.send(msg).await.is_err() {
                break;
            }
        }
    });

    let mut session = Session::new(ConnectionHandle::new(tx), user_id);
    while let Some(msg) = read.next().await {
        match msg {
            Ok(Message::Text(text)) => router.handle_text(&mut session, &text).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {} // ping/pong/binary
            Err(e) => {
                debug!("read error: {}", e);
                break;
            }
        }
    }

    // Transport closed (or the client sent `leave` and dropped). Either way
    // the participant is removed exactly once.
    router.handle_disconnect(&mut session).await;
    writer.abort();
    Ok(())
}
