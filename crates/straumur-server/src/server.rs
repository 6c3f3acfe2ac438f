//! WebSocket server

use std::borrow::Cow;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use straumur_decode::ExecutionBackend;
use straumur::{AnswerService, BusyPolicy, OutboundFrame, StraumurConfig};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};

use crate::registry::ConnectionRegistry;
use crate::session::Session;

pub const SHUTDOWN_REASON: &str = "Server shutdown";

/// Outbound frames buffered per connection before answering pauses.
const OUTBOUND_CAPACITY: usize = 64;

/// Serves answers over WebSocket at `/ws`.
pub struct Server<B> {
    service: AnswerService<B>,
    addr: SocketAddr,
    busy_policy: BusyPolicy,
    registry: Arc<ConnectionRegistry>,
}

/// Builder for constructing a [`Server`].
pub struct ServerBuilder<B> {
    service: AnswerService<B>,
    addr: SocketAddr,
    busy_policy: BusyPolicy,
}

impl<B: ExecutionBackend> Server<B> {
    /// Create a new server builder.
    pub fn builder(service: AnswerService<B>) -> ServerBuilder<B> {
        ServerBuilder {
            service,
            addr: SocketAddr::from(([0, 0, 0, 0], 5173)),
            busy_policy: BusyPolicy::default(),
        }
    }

    /// Builds a server from the `[server]` config section.
    pub fn from_config(service: AnswerService<B>, config: &StraumurConfig) -> Result<Self> {
        let addr: SocketAddr = config
            .server
            .bind_addr()
            .parse()
            .with_context(|| format!("invalid bind address {}", config.server.bind_addr()))?;
        Ok(Self::builder(service)
            .bind(addr)
            .busy_policy(config.server.busy_policy)
            .build())
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.registry.clone()
    }

    pub fn router(&self) -> Router {
        let state = AppState {
            service: self.service.clone(),
            registry: self.registry.clone(),
            busy_policy: self.busy_policy,
        };
        Router::new()
            .route("/ws", get(ws_handler::<B>))
            .with_state(state)
    }

    /// Binds the configured address and serves until ctrl-c.
    pub async fn serve(self) -> Result<()> {
        let listener = TcpListener::bind(self.addr)
            .await
            .with_context(|| format!("failed to bind {}", self.addr))?;
        self.run_on(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for ctrl-c: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Received interrupt");
        })
        .await
    }

    /// Serves on `listener` until `shutdown` resolves, then closes every
    /// connection and releases the backend.
    pub async fn run_on<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let local = listener.local_addr()?;
        info!("Listening on ws://{}/ws", local);

        let registry = self.registry.clone();
        let signal = async move {
            shutdown.await;
            let closed = registry.close_all().await;
            info!("Shutting down, closed {} connection(s)", closed.len());
        };

        axum::serve(listener, self.router())
            .with_graceful_shutdown(signal)
            .await
            .context("server error")?;

        self.service.shutdown().await?;
        info!("Server shutdown complete.");
        Ok(())
    }
}

impl<B: ExecutionBackend> ServerBuilder<B> {
    /// Set the address to bind the server to.
    pub fn bind(mut self, addr: impl Into<SocketAddr>) -> Self {
        self.addr = addr.into();
        self
    }

    pub fn busy_policy(mut self, policy: BusyPolicy) -> Self {
        self.busy_policy = policy;
        self
    }

    /// Build the server.
    pub fn build(self) -> Server<B> {
        Server {
            service: self.service,
            addr: self.addr,
            busy_policy: self.busy_policy,
            registry: Arc::new(ConnectionRegistry::new()),
        }
    }
}

// ============================================================================
// Connection handling
// ============================================================================

struct AppState<B> {
    service: AnswerService<B>,
    registry: Arc<ConnectionRegistry>,
    busy_policy: BusyPolicy,
}

impl<B> Clone for AppState<B> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            registry: self.registry.clone(),
            busy_policy: self.busy_policy,
        }
    }
}

async fn ws_handler<B: ExecutionBackend>(
    ws: WebSocketUpgrade,
    State(state): State<AppState<B>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket<B: ExecutionBackend>(socket: WebSocket, state: AppState<B>) {
    let (mut sink, mut source) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<OutboundFrame>(OUTBOUND_CAPACITY);
    let (going_away_tx, mut going_away_rx) = oneshot::channel::<()>();

    let session = Session::start(state.service.clone(), state.busy_policy, out_tx);
    let (id, mut closed_by_server) = state.registry.register(session.cancel_handle()).await;
    info!("Connection {} opened", id);

    let writer = tokio::spawn(async move {
        let mut going_away_pending = true;
        loop {
            tokio::select! {
                biased;
                signal = &mut going_away_rx, if going_away_pending => {
                    going_away_pending = false;
                    if signal.is_ok() {
                        let close = CloseFrame {
                            code: close_code::AWAY,
                            reason: Cow::from(SHUTDOWN_REASON),
                        };
                        let _ = sink.send(Message::Close(Some(close))).await;
                        break;
                    }
                }
                frame = out_rx.recv() => {
                    let Some(frame) = frame else { break };
                    if sink.send(Message::Text(frame.to_text())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut shutting_down = false;
    loop {
        tokio::select! {
            _ = &mut closed_by_server => {
                shutting_down = true;
                break;
            }
            message = source.next() => match message {
                Some(Ok(Message::Text(text))) => session.submit(text).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Connection {} read error: {}", id, e);
                    break;
                }
            },
        }
    }

    // Must reach the writer while the session's frame senders are still alive.
    if shutting_down {
        let _ = going_away_tx.send(());
    } else {
        drop(going_away_tx);
    }
    session.close().await;
    if !shutting_down {
        state.registry.remove(id).await;
    }
    if let Err(e) = writer.await {
        warn!("Connection {} writer failed: {}", id, e);
    }
    info!("Connection {} closed", id);
}
