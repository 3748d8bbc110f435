//! Interactive terminal sessions over the platform WebSocket.
//!
//! Every byte crossing the socket is wrapped in an agent protocol frame.
//! A session runs a read pump (socket to stdout) and a write pump (stdin to
//! socket) side by side; either of them, a signal, or the caller can end it
//! through [`Session::close`].

pub mod resize;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::io::{self, IsTerminal, Read};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, InvalidHeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use url::Url;

use crate::config::Credentials;
use crate::protocol::{build_input_message, build_resize_message, parse_message};
use resize::ResizeEvents;

/// Path of the terminal endpoint on the API host
const TERMINAL_PATH: &str = "/ws/terminal";
const TENANT_HEADER: &str = "x-tenant-id";

/// Largest stdin chunk forwarded in one frame
const INPUT_CHUNK: usize = 1024;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to build WebSocket URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("unsupported URL scheme {0:?}")]
    Scheme(String),

    #[error("invalid header value: {0}")]
    Header(#[from] InvalidHeaderValue),

    #[error("WebSocket connection failed (status {status}): {source}")]
    Rejected {
        status: u16,
        #[source]
        source: tungstenite::Error,
    },

    #[error("WebSocket connection failed: {0}")]
    Connect(#[source] tungstenite::Error),

    #[error("connection cancelled")]
    Cancelled,

    #[error("failed to set raw mode: {0}")]
    RawMode(#[source] io::Error),

    #[error("failed to install signal handler: {0}")]
    Signal(#[source] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    /// Drop incoming frames whose payload does not hash to the header digest
    pub verify_payload_digest: bool,
    /// Reports the local terminal size as (cols, rows), `None` when unknown
    pub terminal_size: fn() -> Option<(u16, u16)>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            verify_payload_digest: false,
            terminal_size: local_terminal_size,
        }
    }
}

/// Size of the controlling terminal, only when stdout is one
pub fn local_terminal_size() -> Option<(u16, u16)> {
    if !io::stdout().is_terminal() {
        return None;
    }
    crossterm::terminal::size().ok()
}

/// Turn the API base URL into the terminal WebSocket URL
pub fn websocket_url(base_url: &str, session_id: &str) -> Result<Url, SessionError> {
    let mut url = Url::parse(base_url)?;

    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => return Err(SessionError::Scheme(other.to_string())),
    };
    url.set_scheme(scheme)
        .map_err(|()| SessionError::Scheme(scheme.to_string()))?;

    url.set_path(TERMINAL_PATH);
    url.query_pairs_mut().append_pair("sessionId", session_id);
    Ok(url)
}

fn connect_error(err: tungstenite::Error) -> SessionError {
    let status = match &err {
        tungstenite::Error::Http(response) => Some(response.status().as_u16()),
        _ => None,
    };
    match status {
        Some(status) => SessionError::Rejected { status, source: err },
        None => SessionError::Connect(err),
    }
}

/// Puts the local terminal in raw mode and restores it when dropped
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> io::Result<Self> {
        crossterm::terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = crossterm::terminal::disable_raw_mode();
    }
}

/// A connected terminal session
pub struct Session {
    session_id: String,
    options: SessionOptions,
    sink: Mutex<WsSink>,
    source: Mutex<Option<WsSource>>,
    shutdown: CancellationToken,
    closed: AtomicBool,
    sequence: AtomicU64,
    state: StdMutex<SessionState>,
    raw_mode: StdMutex<Option<RawModeGuard>>,
}

impl Session {
    /// Open the WebSocket for `session_id`, authenticated with `credentials`
    pub async fn connect(
        base_url: &str,
        session_id: &str,
        credentials: &Credentials,
        options: SessionOptions,
        cancel: &CancellationToken,
    ) -> Result<Arc<Self>, SessionError> {
        let url = websocket_url(base_url, session_id)?;
        debug!(%url, session_id, state = ?SessionState::Connecting, "connecting terminal session");

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(SessionError::Connect)?;
        let headers = request.headers_mut();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", credentials.access_token))?,
        );
        headers.insert(TENANT_HEADER, HeaderValue::from_str(&credentials.tenant_id)?);

        let connected = tokio::select! {
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
            result = connect_async(request) => result.map_err(connect_error),
        };
        let (ws, response) = match connected {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, session_id, state = ?SessionState::Disconnected, "terminal session not connected");
                return Err(e);
            }
        };
        debug!(status = %response.status(), session_id, state = ?SessionState::Connected, "terminal session connected");

        let (sink, source) = ws.split();
        Ok(Arc::new(Self {
            session_id: session_id.to_string(),
            options,
            sink: Mutex::new(sink),
            source: Mutex::new(Some(source)),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
            state: StdMutex::new(SessionState::Connected),
            raw_mode: StdMutex::new(None),
        }))
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Drive the session against the local terminal until it closes
    pub async fn run(self: &Arc<Self>, resize: Box<dyn ResizeEvents>) -> Result<(), SessionError> {
        let guard = if io::stdin().is_terminal() {
            Some(RawModeGuard::enable().map_err(SessionError::RawMode)?)
        } else {
            None
        };

        let signals = self.spawn_signal_handler().map_err(SessionError::Signal)?;
        *self.raw_mode.lock().unwrap_or_else(|e| e.into_inner()) = guard;

        let watcher = self.spawn_resize_watcher(resize);
        self.send_size().await;

        self.pump(spawn_stdin_reader(), tokio::io::stdout()).await;
        self.close().await;

        signals.abort();
        let _ = watcher.await;
        Ok(())
    }

    /// Run the read and write pumps until both have stopped
    pub async fn pump<W>(&self, input: mpsc::Receiver<io::Result<Vec<u8>>>, output: W)
    where
        W: AsyncWrite + Unpin,
    {
        let Some(source) = self.source.lock().await.take() else {
            return;
        };
        tokio::join!(self.read_pump(source, output), self.write_pump(input));
    }

    async fn read_pump<W>(&self, mut source: WsSource, mut output: W)
    where
        W: AsyncWrite + Unpin,
    {
        loop {
            let message = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                message = source.next() => message,
            };

            match message {
                Some(Ok(Message::Binary(data))) => {
                    if self.handle_frame(&data, &mut output).await.is_break() {
                        break;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "remote closed terminal session");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "terminal read failed");
                    break;
                }
                None => break,
            }
        }

        self.close().await;
    }

    async fn handle_frame<W>(&self, data: &[u8], output: &mut W) -> ControlFlow<()>
    where
        W: AsyncWrite + Unpin,
    {
        let msg = match parse_message(data) {
            Ok(msg) => msg,
            Err(e) => {
                trace!(error = %e, "ignoring undecodable frame");
                return ControlFlow::Continue(());
            }
        };
        if msg.payload_length == 0 {
            return ControlFlow::Continue(());
        }
        if self.options.verify_payload_digest && !msg.digest_matches() {
            warn!(
                sequence = msg.sequence_number,
                message_id = %hex::encode(msg.message_id),
                "dropping frame with mismatched payload digest"
            );
            return ControlFlow::Continue(());
        }

        if msg.is_output() {
            if let Err(e) = output.write_all(&msg.payload).await {
                debug!(error = %e, "failed to write terminal output");
            }
            let _ = output.flush().await;
        } else if msg.is_handshake_complete() {
            debug!(sequence = msg.sequence_number, "agent handshake complete");
        } else if msg.is_exit_code() {
            debug!(code = %String::from_utf8_lossy(&msg.payload), "remote process exited");
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    }

    async fn write_pump(&self, mut input: mpsc::Receiver<io::Result<Vec<u8>>>) {
        loop {
            let chunk = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                chunk = input.recv() => chunk,
            };

            match chunk {
                Some(Ok(bytes)) => {
                    let sequence = self.next_sequence();
                    if let Err(e) = self.send_frame(build_input_message(&bytes, sequence)).await {
                        debug!(error = %e, sequence, "terminal write failed");
                        break;
                    }
                }
                Some(Err(e)) => debug!(error = %e, "stdin read failed"),
                None => break,
            }
        }

        self.close().await;
    }

    async fn send_frame(&self, frame: Vec<u8>) -> Result<(), tungstenite::Error> {
        self.sink.lock().await.send(Message::Binary(frame)).await
    }

    /// Tell the device the current local terminal size, if there is one
    pub async fn send_size(&self) {
        let Some((cols, rows)) = (self.options.terminal_size)() else {
            return;
        };
        if let Err(e) = self.send_resize(cols, rows).await {
            debug!(error = %e, cols, rows, "failed to send terminal size");
        }
    }

    pub async fn send_resize(&self, cols: u16, rows: u16) -> Result<(), tungstenite::Error> {
        let sequence = self.next_sequence();
        self.send_frame(build_resize_message(cols, rows, sequence))
            .await
    }

    fn spawn_resize_watcher(self: &Arc<Self>, mut events: Box<dyn ResizeEvents>) -> JoinHandle<()> {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = session.shutdown.cancelled() => break,
                    event = events.changed() => match event {
                        Some(()) => session.send_size().await,
                        None => break,
                    },
                }
            }
        })
    }

    fn spawn_signal_handler(self: &Arc<Self>) -> io::Result<JoinHandle<()>> {
        let signal = termination_signal()?;
        let session = Arc::clone(self);
        Ok(tokio::spawn(async move {
            tokio::select! {
                _ = session.shutdown.cancelled() => {}
                _ = signal => {
                    debug!("termination signal received");
                    session.close().await;
                }
            }
        }))
    }

    fn restore_terminal(&self) {
        self.raw_mode
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    /// Stop both pumps, restore the terminal and close the socket.
    /// Only the first call does anything.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.set_state(SessionState::Closing);
        self.shutdown.cancel();
        self.restore_terminal();

        let mut sink = self.sink.lock().await;
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        };
        if let Err(e) = sink.send(Message::Close(Some(frame))).await {
            trace!(error = %e, "close frame not sent");
        }
        let _ = sink.close().await;
        drop(sink);

        self.set_state(SessionState::Closed);
        debug!(session_id = %self.session_id, "terminal session closed");
    }
}

#[cfg(unix)]
fn termination_signal() -> io::Result<impl std::future::Future<Output = ()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;
    Ok(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
            _ = quit.recv() => {}
        }
    })
}

#[cfg(not(unix))]
fn termination_signal() -> io::Result<impl std::future::Future<Output = ()>> {
    Ok(async {
        let _ = tokio::signal::ctrl_c().await;
    })
}

/// Read stdin on its own thread so a blocked read never holds the runtime open
fn spawn_stdin_reader() -> mpsc::Receiver<io::Result<Vec<u8>>> {
    let (tx, rx) = mpsc::channel(16);

    std::thread::spawn(move || {
        let mut stdin = io::stdin();
        let mut buf = [0u8; INPUT_CHUNK];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(Ok(buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let _ = tx.blocking_send(Err(e));
                    break;
                }
            }
        }
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{build_message, AgentMessage, PayloadType, MESSAGE_TYPE_OUTPUT_STREAM};
    use async_trait::async_trait;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_hdr_async;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    type ServerWs = WebSocketStream<TcpStream>;

    #[derive(Debug, Default)]
    struct Handshake {
        uri: String,
        authorization: Option<String>,
        tenant: Option<String>,
    }

    fn credentials() -> Credentials {
        Credentials {
            access_token: "tok-123".to_string(),
            tenant_id: "tenant-9".to_string(),
        }
    }

    async fn listen() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        (listener, base)
    }

    async fn accept(listener: &TcpListener) -> (ServerWs, Handshake) {
        let (stream, _) = listener.accept().await.unwrap();
        let captured = Arc::new(StdMutex::new(Handshake::default()));
        let slot = Arc::clone(&captured);

        let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            let header = |name: &str| {
                req.headers()
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            };
            *slot.lock().unwrap() = Handshake {
                uri: req.uri().to_string(),
                authorization: header("authorization"),
                tenant: header("x-tenant-id"),
            };
            Ok(resp)
        };
        let ws = accept_hdr_async(stream, callback).await.unwrap();

        let handshake = std::mem::take(&mut *captured.lock().unwrap());
        (ws, handshake)
    }

    /// Collect binary frames from the client until it closes
    async fn collect_frames(ws: &mut ServerWs) -> Vec<AgentMessage> {
        let mut frames = Vec::new();
        while let Some(Ok(msg)) = ws.next().await {
            match msg {
                Message::Binary(data) => frames.push(parse_message(&data).unwrap()),
                Message::Close(_) => break,
                _ => {}
            }
        }
        frames
    }

    fn frame(payload_type: PayloadType, payload: &[u8], seq: u64) -> Message {
        Message::Binary(build_message(MESSAGE_TYPE_OUTPUT_STREAM, payload_type, payload, seq))
    }

    #[test]
    fn test_websocket_url() {
        let url = websocket_url("https://api.example.com", "abc").unwrap();
        assert_eq!(url.as_str(), "wss://api.example.com/ws/terminal?sessionId=abc");

        let url = websocket_url("http://localhost:8080/api", "s 1").unwrap();
        assert_eq!(url.as_str(), "ws://localhost:8080/ws/terminal?sessionId=s+1");

        assert!(matches!(
            websocket_url("ftp://example.com", "abc"),
            Err(SessionError::Scheme(_))
        ));
        assert!(matches!(websocket_url("not a url", "abc"), Err(SessionError::Url(_))));
    }

    #[tokio::test]
    async fn test_read_pump_writes_output_until_exit() {
        let (listener, base) = listen().await;

        let server = tokio::spawn(async move {
            let (mut ws, handshake) = accept(&listener).await;
            ws.send(frame(PayloadType::Output, b"hello ", 1)).await.unwrap();
            ws.send(frame(PayloadType::Output, b"", 2)).await.unwrap();
            ws.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
            ws.send(frame(PayloadType::HandshakeComplete, b"{}", 3)).await.unwrap();
            ws.send(frame(PayloadType::Output, b"world", 4)).await.unwrap();
            ws.send(frame(PayloadType::ExitCode, b"0", 5)).await.unwrap();
            ws.send(frame(PayloadType::Output, b"after exit", 6)).await.ok();
            collect_frames(&mut ws).await;
            handshake
        });

        let cancel = CancellationToken::new();
        let session = Session::connect(&base, "sess-1", &credentials(), SessionOptions::default(), &cancel)
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Connected);

        let (_input_tx, input_rx) = mpsc::channel(1);
        let mut output = Vec::new();
        session.pump(input_rx, &mut output).await;

        assert_eq!(output, b"hello world");
        assert_eq!(session.state(), SessionState::Closed);

        let handshake = server.await.unwrap();
        assert_eq!(handshake.uri, "/ws/terminal?sessionId=sess-1");
        assert_eq!(handshake.authorization.as_deref(), Some("Bearer tok-123"));
        assert_eq!(handshake.tenant.as_deref(), Some("tenant-9"));
    }

    #[tokio::test]
    async fn test_write_pump_frames_input_in_sequence() {
        let (listener, base) = listen().await;

        let server = tokio::spawn(async move {
            let (mut ws, _) = accept(&listener).await;
            collect_frames(&mut ws).await
        });

        let cancel = CancellationToken::new();
        let session = Session::connect(&base, "sess-2", &credentials(), SessionOptions::default(), &cancel)
            .await
            .unwrap();

        session.send_resize(80, 24).await.unwrap();

        let (input_tx, input_rx) = mpsc::channel(4);
        input_tx.send(Ok(b"ls\n".to_vec())).await.unwrap();
        input_tx.send(Ok(b"exit\n".to_vec())).await.unwrap();
        drop(input_tx);

        session.pump(input_rx, tokio::io::sink()).await;
        assert_eq!(session.state(), SessionState::Closed);

        let frames = server.await.unwrap();
        assert_eq!(frames.len(), 3);

        assert_eq!(frames[0].kind(), Some(PayloadType::Size));
        assert_eq!(frames[0].payload, br#"{"cols":80,"rows":24}"#);
        assert_eq!(frames[0].sequence_number, 1);

        assert!(frames[1].is_output());
        assert_eq!(frames[1].payload, b"ls\n");
        assert_eq!(frames[1].sequence_number, 2);
        assert_eq!(frames[1].message_type, MESSAGE_TYPE_OUTPUT_STREAM);

        assert_eq!(frames[2].payload, b"exit\n");
        assert_eq!(frames[2].sequence_number, 3);
        assert!(frames.iter().all(|f| f.digest_matches()));
    }

    #[tokio::test]
    async fn test_digest_verification_drops_tampered_frames() {
        let (listener, base) = listen().await;

        let server = tokio::spawn(async move {
            let (mut ws, _) = accept(&listener).await;
            let mut tampered = build_message(MESSAGE_TYPE_OUTPUT_STREAM, PayloadType::Output, b"bad", 1);
            let last = tampered.len() - 1;
            tampered[last] = b'X';
            ws.send(Message::Binary(tampered)).await.unwrap();
            ws.send(frame(PayloadType::Output, b"ok", 2)).await.unwrap();
            ws.send(frame(PayloadType::ExitCode, b"0", 3)).await.unwrap();
            collect_frames(&mut ws).await;
        });

        let options = SessionOptions {
            verify_payload_digest: true,
            ..SessionOptions::default()
        };
        let cancel = CancellationToken::new();
        let session = Session::connect(&base, "sess-3", &credentials(), options, &cancel)
            .await
            .unwrap();

        let (_input_tx, input_rx) = mpsc::channel(1);
        let mut output = Vec::new();
        session.pump(input_rx, &mut output).await;

        assert_eq!(output, b"ok");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (listener, base) = listen().await;

        let server = tokio::spawn(async move {
            let (mut ws, _) = accept(&listener).await;
            collect_frames(&mut ws).await
        });

        let cancel = CancellationToken::new();
        let session = Session::connect(&base, "sess-4", &credentials(), SessionOptions::default(), &cancel)
            .await
            .unwrap();

        session.close().await;
        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);

        // Pumping after close returns straight away
        let (_input_tx, input_rx) = mpsc::channel(1);
        session.pump(input_rx, tokio::io::sink()).await;

        assert!(server.await.unwrap().is_empty());
    }

    struct ChannelResize(mpsc::Receiver<()>);

    #[async_trait]
    impl ResizeEvents for ChannelResize {
        async fn changed(&mut self) -> Option<()> {
            self.0.recv().await
        }
    }

    #[tokio::test]
    async fn test_resize_watcher_sends_size_frames() {
        let (listener, base) = listen().await;

        let server = tokio::spawn(async move {
            let (mut ws, _) = accept(&listener).await;
            let mut frames = Vec::new();
            while frames.len() < 2 {
                match ws.next().await {
                    Some(Ok(Message::Binary(data))) => frames.push(parse_message(&data).unwrap()),
                    Some(Ok(_)) => {}
                    _ => break,
                }
            }
            frames
        });

        let options = SessionOptions {
            terminal_size: || Some((132, 43)),
            ..SessionOptions::default()
        };
        let cancel = CancellationToken::new();
        let session = Session::connect(&base, "sess-5", &credentials(), options, &cancel)
            .await
            .unwrap();

        let (resize_tx, resize_rx) = mpsc::channel(4);
        let watcher = session.spawn_resize_watcher(Box::new(ChannelResize(resize_rx)));
        resize_tx.send(()).await.unwrap();
        resize_tx.send(()).await.unwrap();

        let frames = server.await.unwrap();
        session.close().await;
        watcher.await.unwrap();

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].sequence_number, 2);
        for f in &frames {
            assert_eq!(f.kind(), Some(PayloadType::Size));
            assert_eq!(f.payload, br#"{"cols":132,"rows":43}"#);
        }
    }

    #[tokio::test]
    async fn test_rejected_handshake_reports_status() {
        let (listener, base) = listen().await;

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let reject = |_: &Request, _: Response| -> Result<Response, ErrorResponse> {
                let mut response = ErrorResponse::new(Some("forbidden".to_string()));
                *response.status_mut() = tungstenite::http::StatusCode::FORBIDDEN;
                Err(response)
            };
            let result = accept_hdr_async(stream, reject).await;
            assert!(result.is_err());
        });

        let cancel = CancellationToken::new();
        let err = Session::connect(&base, "sess-6", &credentials(), SessionOptions::default(), &cancel)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SessionError::Rejected { status: 403, .. }));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_honours_cancellation() {
        let (listener, base) = listen().await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = Session::connect(&base, "sess-7", &credentials(), SessionOptions::default(), &cancel)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SessionError::Cancelled));
        drop(listener);
    }
}
