//! Server Host: TLS WebSocket listener, the HTTP probe on the same port,
//! CORS/Private-Network headers, subprotocol negotiation, and the wiring
//! from Device Reader -> Event Bus -> per-session dispatch.
//!
//! Grounded directly on `examples/Devolutions-IronRDP`'s `ironrdp-server`
//! `server.rs` (`TcpListener::bind` + accept loop, a connection handler split
//! from the listener loop) and `builder.rs`'s typestate builder, adapted:
//! `ServerBuilder<State>` replaces `RdpServerBuilder<State>`. The
//! thread -> `tokio::sync::broadcast` fanout (one Device Reader thread,
//! many concurrent sessions) is grounded on
//! `examples/other_examples/4c52dabf_wstlxx-BongoCat-server__src-main.rs.rs`,
//! which uses the same shape to bridge a blocking native-event thread into
//! multiple WebSocket clients.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::Message;

use crate::config::ConfigHandle;
use crate::controller::Controller;
use crate::device::DeviceEvent;
use crate::error::BridgeError;
use crate::keyboard::VirtualKeyboard;
use crate::session::{RpcOutcome, Session};
use crate::wamp::WampMessage;

pub const LISTEN_ADDR: &str = "[::]:8181";
pub const SERVER_IDENT: &str = "AntigravityBridge";
pub const PROBE_VERSION: &str = "1.4.8.21486";
const MAX_HEADER_BYTES: usize = 8 * 1024;

/// Shared, process-wide collaborators handed to every connection.
#[derive(Clone)]
pub struct AppState {
    pub config: ConfigHandle,
    pub keyboard: Arc<dyn VirtualKeyboard>,
    pub device_events: broadcast::Sender<DeviceEvent>,
}

pub struct ServerOptions {
    pub addr: SocketAddr,
    pub tls: TlsAcceptor,
}

pub struct ServerHost {
    opts: ServerOptions,
    state: AppState,
}

// --- Typestate builder, mirroring the teacher's `RdpServerBuilder<State>`. ---

pub struct WantsAddr;
pub struct WantsTls {
    addr: SocketAddr,
}
pub struct WantsState {
    addr: SocketAddr,
    tls: TlsAcceptor,
}

pub struct ServerBuilder<S> {
    state: S,
}

impl ServerBuilder<WantsAddr> {
    pub fn new() -> Self {
        Self { state: WantsAddr }
    }

    pub fn with_addr(self, addr: SocketAddr) -> ServerBuilder<WantsTls> {
        ServerBuilder { state: WantsTls { addr } }
    }
}

impl Default for ServerBuilder<WantsAddr> {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder<WantsTls> {
    pub fn with_tls(self, tls: TlsAcceptor) -> ServerBuilder<WantsState> {
        ServerBuilder {
            state: WantsState { addr: self.state.addr, tls },
        }
    }
}

impl ServerBuilder<WantsState> {
    pub fn with_state(self, config: ConfigHandle, keyboard: Arc<dyn VirtualKeyboard>) -> ServerHost {
        let (device_events, _unused) = broadcast::channel(64);
        ServerHost {
            opts: ServerOptions {
                addr: self.state.addr,
                tls: self.state.tls,
            },
            state: AppState {
                config,
                keyboard,
                device_events,
            },
        }
    }
}

impl ServerHost {
    pub fn device_event_sender(&self) -> broadcast::Sender<DeviceEvent> {
        self.state.device_events.clone()
    }

    /// Binds the listener and accepts connections until shutdown is
    /// requested. Bind failure is the only path that surfaces as
    /// `BridgeError::FatalStartup` (spec §7).
    pub async fn run(self) -> Result<(), BridgeError> {
        self.run_until(shutdown_signal()).await
    }

    /// Accepts connections until `shutdown` resolves. Splitting this out
    /// from `run` keeps the signal wait testable without binding a socket.
    pub async fn run_until(self, shutdown: impl std::future::Future<Output = ()>) -> Result<(), BridgeError> {
        let listener = TcpListener::bind(self.opts.addr)
            .await
            .map_err(|err| BridgeError::FatalStartup(format!("binding {}: {err}", self.opts.addr)))?;
        tracing::info!(addr = %self.opts.addr, "listening");

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            tracing::warn!(error = %err, "accept failed");
                            continue;
                        }
                    };

                    let tls = self.opts.tls.clone();
                    let state = self.state.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, tls, state).await {
                            tracing::debug!(?peer, error = %err, "connection ended with error");
                        }
                    });
                }
                () = &mut shutdown => {
                    tracing::info!("shutdown signal received, closing listener");
                    return Ok(());
                }
            }
        }
    }
}

/// Waits for SIGINT (or, on unix, SIGTERM too). No graceful join of the
/// Device Reader thread or connected sessions is attempted; the process
/// exit tears them down (spec §5 Cancellation).
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => tracing::warn!(error = %err, "failed to install SIGTERM handler"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

async fn handle_connection(stream: TcpStream, tls: TlsAcceptor, state: AppState) -> Result<(), BridgeError> {
    let tls_stream = tls
        .accept(stream)
        .await
        .map_err(|err| BridgeError::SessionProtocol(format!("tls handshake failed: {err}")))?;

    let (mut head, tls_stream) = peek_http_head(tls_stream).await?;
    let leftover = std::mem::take(&mut head.leftover);
    let stream = PrefixedStream::new(tls_stream, leftover);

    if head.method.eq_ignore_ascii_case("OPTIONS") {
        return respond_preflight(stream, head.origin.as_deref()).await;
    }

    if !head.is_upgrade {
        return match head.path.as_str() {
            "/config" => respond_config_page(stream, head.origin.as_deref()).await,
            _ => respond_probe(stream, head.origin.as_deref()).await,
        };
    }

    run_websocket_session(stream, head, state).await
}

async fn run_websocket_session(
    stream: PrefixedStream<tokio_rustls::server::TlsStream<TcpStream>>,
    head: HttpHead,
    state: AppState,
) -> Result<(), BridgeError> {
    let origin = head.origin.clone();
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, move |req: &Request, mut response: Response| {
        apply_negotiation(req, &mut response, origin.as_deref());
        Ok(response)
    })
    .await
    .map_err(|err| BridgeError::SessionProtocol(format!("websocket handshake failed: {err}")))?;

    let (mut ws_sink, mut ws_stream) = ws_stream.split();
    let (outbound_tx, mut outbound_rx) = tokio::sync::mpsc::unbounded_channel::<WampMessage>();
    let session = Session::new(outbound_tx);
    let controller = Arc::new(Controller::new(session, state.config.clone(), Arc::clone(&state.keyboard)));

    let welcome = controller.session().welcome_message(SERVER_IDENT);
    ws_sink
        .send(Message::Text(welcome.serialize()))
        .await
        .map_err(|err| BridgeError::SessionProtocol(format!("failed to send welcome: {err}")))?;

    let mut device_events = state.device_events.subscribe();

    loop {
        tokio::select! {
            inbound = ws_stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => dispatch_inbound(&controller, &text).await,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        tracing::debug!(error = %err, "websocket read error");
                        break;
                    }
                }
            }
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(message) => {
                        if ws_sink.send(Message::Text(message.serialize())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            event = device_events.recv() => {
                match event {
                    // Spawned rather than awaited inline: both pipelines round-trip
                    // through outbound RPC (`self:read`/`self:update`), which can only
                    // resolve if this select loop keeps pumping `outbound_rx` (writes
                    // the tunneled EVENT) and `ws_stream` (reads the CALLRESULT back).
                    // Awaiting here would stall both branches and every RPC would time
                    // out. The single-flight guard, `Session`, and outbound sender are
                    // all shared/cloneable, so running concurrently is safe.
                    Ok(DeviceEvent::Motion(sample)) => {
                        let controller = Arc::clone(&controller);
                        tokio::spawn(async move { controller.process_motion(sample).await; });
                    }
                    Ok(DeviceEvent::Button(sample)) => {
                        let controller = Arc::clone(&controller);
                        tokio::spawn(async move { controller.process_button(sample).await; });
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "device event broadcast lagged for this session");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    controller.session().cancel_all_pending();
    Ok(())
}

async fn dispatch_inbound(controller: &Arc<Controller>, text: &str) {
    let message = match WampMessage::parse(text) {
        Ok(message) => message,
        Err(err) => {
            tracing::warn!(error = %err, "malformed inbound wamp message, ignoring");
            return;
        }
    };

    match message {
        WampMessage::Prefix { prefix, uri } => controller.session().register_prefix(prefix, uri),
        WampMessage::Subscribe { topic } => {
            let resolved = controller.session().resolve(&topic);
            controller.session().set_subscribed_topic(resolved);
        }
        WampMessage::Call {
            call_id,
            proc_uri,
            args,
        } => {
            let resolved = controller.session().resolve(&proc_uri);
            match controller.handle_call(&resolved, args).await {
                Ok(result) => {
                    let _ = controller.session().send_call_result(call_id, result);
                }
                Err((uri, description)) => {
                    let _ = controller.session().send_call_error(call_id, uri, description);
                }
            }
        }
        WampMessage::CallResult { call_id, result } => {
            controller.session().resolve_pending(&call_id, RpcOutcome::Result(result));
        }
        WampMessage::CallError {
            call_id,
            error_uri,
            description,
            ..
        } => {
            controller
                .session()
                .resolve_pending(&call_id, RpcOutcome::Error { uri: error_uri, description });
        }
        // Unsubscribe/Publish/Event from the client carry no meaning here.
        WampMessage::Unsubscribe { .. } | WampMessage::Publish { .. } | WampMessage::Event { .. } => {}
        WampMessage::Welcome { .. } => {
            tracing::warn!("client sent a WELCOME message, ignoring");
        }
    }
}

/// Negotiates the WebSocket subprotocol (`wamp` preferred, `3dx-v1`
/// accepted) and stamps every CORS/Private-Network header spec §4.7
/// requires onto the handshake response.
fn apply_negotiation(req: &Request, response: &mut Response, origin: Option<&str>) {
    if let Some(offered) = req.headers().get("sec-websocket-protocol").and_then(|v| v.to_str().ok()) {
        let offered: Vec<&str> = offered.split(',').map(str::trim).collect();
        let chosen = if offered.contains(&"wamp") {
            Some("wamp")
        } else if offered.contains(&"3dx-v1") {
            Some("3dx-v1")
        } else {
            None
        };
        if let Some(chosen) = chosen {
            if let Ok(value) = HeaderValue::from_str(chosen) {
                response.headers_mut().insert("sec-websocket-protocol", value);
            }
        }
    }
    apply_cors_headers(response.headers_mut(), origin);
}

fn apply_cors_headers(headers: &mut tokio_tungstenite::tungstenite::http::HeaderMap, origin: Option<&str>) {
    let allow_origin = origin.unwrap_or("*");
    let pairs: [(&str, &str); 4] = [
        ("access-control-allow-origin", allow_origin),
        ("access-control-allow-methods", "GET,POST,OPTIONS"),
        ("access-control-allow-headers", "*"),
        ("access-control-allow-private-network", "true"),
    ];
    for (name, value) in pairs {
        if let Ok(value) = HeaderValue::from_str(value) {
            headers.insert(name, value);
        }
    }
}

async fn respond_probe<S>(mut stream: S, origin: Option<&str>) -> Result<(), BridgeError>
where
    S: AsyncWrite + Unpin,
{
    let body = serde_json::json!({ "port": 8181, "version": PROBE_VERSION }).to_string();
    write_http_response(&mut stream, StatusCode::OK, "application/json", origin, body.into_bytes()).await
}

async fn respond_config_page<S>(mut stream: S, origin: Option<&str>) -> Result<(), BridgeError>
where
    S: AsyncWrite + Unpin,
{
    // Config UI HTML rendering is out of scope (spec §1); this is a stub
    // placeholder so the route exists and responds.
    let body = b"<!doctype html><title>spacemouse-bridge config</title>".to_vec();
    write_http_response(&mut stream, StatusCode::OK, "text/html", origin, body).await
}

async fn respond_preflight<S>(mut stream: S, origin: Option<&str>) -> Result<(), BridgeError>
where
    S: AsyncWrite + Unpin,
{
    write_http_response(&mut stream, StatusCode::NO_CONTENT, "text/plain", origin, Vec::new()).await
}

async fn write_http_response<S>(
    stream: &mut S,
    status: StatusCode,
    content_type: &str,
    origin: Option<&str>,
    body: Vec<u8>,
) -> Result<(), BridgeError>
where
    S: AsyncWrite + Unpin,
{
    let allow_origin = origin.unwrap_or("*");
    let head = format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: {content_type}\r\n\
         Content-Length: {}\r\n\
         Access-Control-Allow-Origin: {allow_origin}\r\n\
         Access-Control-Allow-Methods: GET,POST,OPTIONS\r\n\
         Access-Control-Allow-Headers: *\r\n\
         Access-Control-Allow-Private-Network: true\r\n\
         Connection: close\r\n\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or(""),
        body.len(),
    );
    stream
        .write_all(head.as_bytes())
        .await
        .map_err(|err| BridgeError::SessionProtocol(format!("writing http response: {err}")))?;
    stream
        .write_all(&body)
        .await
        .map_err(|err| BridgeError::SessionProtocol(format!("writing http body: {err}")))?;
    stream
        .shutdown()
        .await
        .map_err(|err| BridgeError::SessionProtocol(format!("closing http response: {err}")))
}

/// The parsed subset of an HTTP request line + headers we need to route.
struct HttpHead {
    method: String,
    path: String,
    is_upgrade: bool,
    origin: Option<String>,
    /// Bytes read past the header block's terminating CRLFCRLF, which
    /// belong to the request body (or, for a websocket upgrade, are simply
    /// empty since browsers don't send a body with the handshake).
    leftover: Vec<u8>,
}

/// Reads just enough of the stream to parse the request line and headers,
/// without assuming the underlying transport supports `peek` (TLS streams
/// don't: the decrypted bytes differ from the raw ones). Anything read past
/// the header terminator is preserved in `leftover` and replayed by
/// `PrefixedStream` before further reads reach the real socket.
async fn peek_http_head<S>(mut stream: S) -> Result<(HttpHead, S), BridgeError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(512);
    let mut chunk = [0u8; 512];
    let header_end = loop {
        if let Some(pos) = find_header_terminator(&buf) {
            break pos;
        }
        if buf.len() >= MAX_HEADER_BYTES {
            return Err(BridgeError::SessionProtocol("http request headers too large".into()));
        }
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|err| BridgeError::SessionProtocol(format!("reading http request: {err}")))?;
        if n == 0 {
            return Err(BridgeError::SessionProtocol("connection closed during http handshake".into()));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let header_bytes = &buf[..header_end];
    let leftover = buf[header_end + 4..].to_vec();
    let text = String::from_utf8_lossy(header_bytes);
    let mut lines = text.split("\r\n");

    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("").to_owned();
    let path = parts.next().unwrap_or("/").to_owned();

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_owned());
        }
    }

    let upgrade_header = headers.get("upgrade").map(|v| v.eq_ignore_ascii_case("websocket")).unwrap_or(false);
    let connection_header = headers
        .get("connection")
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);

    Ok((
        HttpHead {
            method,
            path,
            is_upgrade: upgrade_header && connection_header,
            origin: headers.get("origin").cloned(),
            leftover,
        },
        stream,
    ))
}

fn find_header_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Replays bytes already consumed while peeking the HTTP head, then falls
/// through to the underlying stream. Needed because the WebSocket upgrade
/// handshake (performed by `tokio-tungstenite`) re-reads the request from
/// scratch; without this, the already-consumed header bytes would be lost.
pub struct PrefixedStream<S> {
    prefix: std::io::Cursor<Vec<u8>>,
    inner: S,
}

impl<S> PrefixedStream<S> {
    fn new(inner: S, prefix: Vec<u8>) -> Self {
        Self {
            prefix: std::io::Cursor::new(prefix),
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        let pos = self.prefix.position() as usize;
        let remaining = &self.prefix.get_ref()[pos..];
        if !remaining.is_empty() {
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            self.prefix.set_position((pos + n) as u64);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls;

    #[test]
    fn finds_header_terminator() {
        let buf = b"GET / HTTP/1.1\r\nHost: x\r\n\r\nbody-bytes";
        let pos = find_header_terminator(buf).unwrap();
        assert_eq!(&buf[pos + 4..], b"body-bytes");
    }

    #[tokio::test]
    async fn parses_upgrade_request() {
        let raw = b"GET /3dconnexion/nlproxy HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nOrigin: https://example.com\r\nSec-WebSocket-Protocol: wamp\r\n\r\n";
        let (head, _stream) = peek_http_head(std::io::Cursor::new(raw.to_vec())).await.unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.path, "/3dconnexion/nlproxy");
        assert!(head.is_upgrade);
        assert_eq!(head.origin.as_deref(), Some("https://example.com"));
    }

    #[tokio::test]
    async fn parses_plain_probe_request() {
        let raw = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";
        let (head, _stream) = peek_http_head(std::io::Cursor::new(raw.to_vec())).await.unwrap();
        assert!(!head.is_upgrade);
        assert_eq!(head.path, "/");
    }

    #[tokio::test]
    async fn prefixed_stream_replays_consumed_bytes_before_inner() {
        let inner = std::io::Cursor::new(b"-tail".to_vec());
        let mut stream = PrefixedStream::new(inner, b"head".to_vec());
        let mut out = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut stream, &mut out).await.unwrap();
        assert_eq!(out, b"head-tail");
    }

    #[tokio::test]
    async fn preflight_response_carries_all_cors_headers() {
        let mut out: Vec<u8> = Vec::new();
        respond_preflight(&mut out, Some("https://cad.onshape.com")).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 204"));
        assert!(text.contains("Access-Control-Allow-Origin: https://cad.onshape.com"));
        assert!(text.contains("Access-Control-Allow-Methods: GET,POST,OPTIONS"));
        assert!(text.contains("Access-Control-Allow-Headers: *"));
        assert!(text.contains("Access-Control-Allow-Private-Network: true"));
    }

    #[tokio::test]
    async fn probe_response_reports_port_and_version() {
        let mut out: Vec<u8> = Vec::new();
        respond_probe(&mut out, None).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Access-Control-Allow-Origin: *"));
        let body_start = text.find("\r\n\r\n").unwrap() + 4;
        let body: serde_json::Value = serde_json::from_str(&text[body_start..]).unwrap();
        assert_eq!(body["port"], 8181);
        assert_eq!(body["version"], PROBE_VERSION);
    }

    #[tokio::test]
    async fn run_until_returns_once_shutdown_resolves() {
        let dir = std::env::temp_dir().join("spacemouse-bridge-server-test");
        std::fs::create_dir_all(&dir).unwrap();
        let material = tls::TlsMaterial::in_dir(&dir);
        let acceptor = tls::build_acceptor(&material).await.unwrap();

        let config = ConfigHandle::load(Some(dir.join("config.json"))).await;
        let server = ServerBuilder::new()
            .with_addr("127.0.0.1:0".parse().unwrap())
            .with_tls(acceptor)
            .with_state(config, Arc::new(crate::keyboard::LoggingKeyboard));

        server.run_until(std::future::ready(())).await.unwrap();
        std::fs::remove_dir_all(&dir).ok();
    }
}
