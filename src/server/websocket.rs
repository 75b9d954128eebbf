use crate::common::models::UserId;
use crate::common::protocol::{AuthResponse, ClientEvent, ServerEvent};
use crate::server::auth;
use crate::server::config::ServerConfig;
use crate::server::hub::ChatHub;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use rustls::ServerConfig as RustlsConfig;
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

/// Accepts WebSocket clients, optionally over TLS, and hands them to the hub.
pub struct WebSocketServer {
    hub: Arc<ChatHub>,
    tls: Option<TlsAcceptor>,
}

impl WebSocketServer {
    pub fn new(hub: Arc<ChatHub>) -> Self {
        let tls = match setup_tls_acceptor(hub.config()) {
            Ok(acceptor) => acceptor,
            Err(e) => {
                error!("[TLS] Configuration failed: {}", e);
                warn!("[TLS] Falling back to plain WebSocket");
                None
            }
        };
        Self { hub, tls }
    }

    pub async fn run(&self, addr: &str) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        let scheme = if self.tls.is_some() { "wss" } else { "ws" };
        info!("[WS] Listening on {}://{}", scheme, addr);

        loop {
            let (stream, peer) = listener.accept().await?;
            debug!("[WS] New connection from {}", peer);
            let hub = self.hub.clone();
            let acceptor = self.tls.clone();
            tokio::spawn(async move {
                let result = match acceptor {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls_stream) => upgrade(hub, tls_stream).await,
                        Err(e) => Err(anyhow::anyhow!("TLS accept failed: {}", e)),
                    },
                    None => upgrade(hub, stream).await,
                };
                if let Err(e) = result {
                    warn!("[WS] Client {} error: {}", peer, e);
                }
            });
        }
    }
}

async fn upgrade<S>(hub: Arc<ChatHub>, stream: S) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let ws = tokio_tungstenite::accept_async(stream).await?;
    handle_connection(hub, ws).await
}

/// Builds the TLS acceptor from the configured PEM files. `Ok(None)` when TLS is off.
fn setup_tls_acceptor(config: &ServerConfig) -> anyhow::Result<Option<TlsAcceptor>> {
    if !config.enable_tls {
        info!("[TLS] TLS disabled in configuration");
        return Ok(None);
    }
    let cert_path = config
        .tls_cert_path
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("TLS_CERT_PATH not set"))?;
    let key_path = config
        .tls_key_path
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("TLS_KEY_PATH not set"))?;

    let cert_file = File::open(cert_path)
        .map_err(|e| anyhow::anyhow!("Failed to open certificate file '{}': {}", cert_path, e))?;
    let cert_chain: Vec<rustls::Certificate> = certs(&mut BufReader::new(cert_file))?
        .into_iter()
        .map(rustls::Certificate)
        .collect();
    if cert_chain.is_empty() {
        return Err(anyhow::anyhow!("No certificates found in {}", cert_path));
    }

    let key_file = File::open(key_path)
        .map_err(|e| anyhow::anyhow!("Failed to open private key file '{}': {}", key_path, e))?;
    let mut keys = pkcs8_private_keys(&mut BufReader::new(key_file))?;
    if keys.is_empty() {
        keys = rsa_private_keys(&mut BufReader::new(File::open(key_path)?))?;
    }
    if keys.is_empty() {
        return Err(anyhow::anyhow!("No private keys found in {}", key_path));
    }

    let tls_config = RustlsConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(cert_chain, rustls::PrivateKey(keys.remove(0)))
        .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?;
    info!("[TLS] Loaded certificate from {}", cert_path);
    Ok(Some(TlsAcceptor::from(Arc::new(tls_config))))
}

enum AuthOutcome {
    Authenticated(UserId),
    Rejected(&'static str),
    Closed,
}

/// Waits for the first frame, which must be an `auth` event with a live session token.
async fn authenticate<S>(hub: &ChatHub, stream: &mut SplitStream<WebSocketStream<S>>) -> AuthOutcome
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let first = match tokio::time::timeout(hub.config().auth_timeout, stream.next()).await {
        Ok(frame) => frame,
        Err(_) => return AuthOutcome::Rejected("Authentication timeout"),
    };
    let text = match first {
        Some(Ok(Message::Text(text))) => text,
        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return AuthOutcome::Closed,
        Some(Ok(_)) => return AuthOutcome::Rejected("Expected auth event"),
    };
    match serde_json::from_str::<ClientEvent>(&text) {
        Ok(ClientEvent::Auth(request)) => match auth::validate_session(hub.db(), &request.token).await {
            Some(user_id) => AuthOutcome::Authenticated(user_id),
            None => AuthOutcome::Rejected("Invalid or expired session token"),
        },
        _ => AuthOutcome::Rejected("Expected auth event"),
    }
}

fn encode(event: &ServerEvent) -> Option<Message> {
    match serde_json::to_string(event) {
        Ok(text) => Some(Message::Text(text)),
        Err(e) => {
            error!("[WS] Failed to encode event: {}", e);
            None
        }
    }
}

fn auth_failure(reason: &str) -> ServerEvent {
    ServerEvent::AuthResponse(AuthResponse {
        success: false,
        user_id: None,
        error: Some(reason.to_string()),
    })
}

/// Runs one client connection to completion: authentication, then the event loop
/// until the socket closes or the server kicks it.
pub async fn handle_connection<S>(hub: Arc<ChatHub>, ws: WebSocketStream<S>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();

    if hub.connection_count().await >= hub.config().max_clients {
        warn!("[WS] Rejecting client: {} connections open", hub.config().max_clients);
        if let Some(frame) = encode(&auth_failure("Server is full")) {
            sink.send(frame).await?;
        }
        sink.close().await?;
        return Ok(());
    }

    let user_id = match authenticate(&hub, &mut stream).await {
        AuthOutcome::Authenticated(user_id) => user_id,
        AuthOutcome::Rejected(reason) => {
            info!("[WS:AUTH] Rejected connection: {}", reason);
            if let Some(frame) = encode(&auth_failure(reason)) {
                sink.send(frame).await?;
            }
            sink.close().await?;
            return Ok(());
        }
        AuthOutcome::Closed => {
            debug!("[WS:AUTH] Client left before authenticating");
            return Ok(());
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    let (kick_tx, mut kick_rx) = oneshot::channel();
    let local = tx.clone();
    let session = match hub.connect(&user_id, tx, Some(kick_tx)).await {
        Ok(session) => session,
        Err(e) => {
            warn!("[WS:AUTH] Could not register {}: {}", user_id, e);
            let reason = if e.is_client_error() { e.to_string() } else { "Authentication failed".to_string() };
            if let Some(frame) = encode(&auth_failure(&reason)) {
                sink.send(frame).await?;
            }
            sink.close().await?;
            return Ok(());
        }
    };

    let welcome = ServerEvent::AuthResponse(AuthResponse {
        success: true,
        user_id: Some(user_id.clone()),
        error: None,
    });
    if let Some(frame) = encode(&welcome) {
        sink.send(frame).await?;
    }
    info!("[WS:AUTH] {} authenticated on {}", session.user.username, session.connection_id);

    // Drains the outbound queue until every sender is gone.
    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let Some(frame) = encode(&event) else { continue };
            if let Err(e) = sink.send(frame).await {
                debug!("[WS] Write failed: {}", e);
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        tokio::select! {
            _ = &mut kick_rx => {
                info!("[WS] Closing {} on server request", session.connection_id);
                break;
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(event) => hub.handle_event(&session, event).await,
                    Err(e) => {
                        debug!("[WS] Unparseable frame from {}: {}", session.user.username, e);
                        let _ = local.send(ServerEvent::error("Invalid event"));
                    }
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("[WS] Read error on {}: {}", session.connection_id, e);
                    break;
                }
            }
        }
    }

    hub.disconnect(&session).await;
    drop(local);
    let _ = writer.await;
    Ok(())
}
