//! Reconnecting line-oriented TCP client shared by the ADS-B and GPS feeds.
//!
//! A [`ConnectionWorker`] owns exactly one socket to a fixed `host:port`.
//! Complete newline-terminated lines are handed to a [`LineHandler`]; any
//! transport failure drops back to [`ConnectionState::Disconnected`] and a
//! retry is scheduled after a flat delay (no backoff).

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, trace, warn};

/// Default time allowed for a connect attempt before it is aborted
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default delay between a disconnect (or failed attempt) and the next attempt
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

const READ_BUFFER_CAPACITY: usize = 8192;

/// Connection lifecycle as seen by observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// Consumer of a line feed
///
/// Both callbacks run on the worker task, strictly in socket-arrival order.
pub trait LineHandler: Send + Sync + 'static {
    /// Called once per complete line, without the trailing `\r\n`
    fn handle_line(&self, line: &str);

    /// Called on `Connecting -> Connected` (true) and `Connected -> Disconnected` (false)
    ///
    /// Writes issued through `link` while handling `true` are sent before any
    /// further line is read.
    fn on_connection_changed(&self, connected: bool, link: &ConnectionLink) {
        let _ = (connected, link);
    }
}

/// Where and how to connect
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Short feed name used in logs and metric labels
    pub feed: String,
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    pub retry_delay: Duration,
}

impl ConnectionConfig {
    pub fn new(feed: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            feed: feed.into(),
            host: host.into(),
            port,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Cloneable handle onto a running worker: state observation plus the write primitive
#[derive(Debug, Clone)]
pub struct ConnectionLink {
    outbound_tx: flume::Sender<Vec<u8>>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl ConnectionLink {
    /// Queue raw bytes for the socket
    ///
    /// Fire-and-forget: data is only delivered if the current connection is
    /// still alive when the worker picks it up. Anything queued while not
    /// connected is discarded on the next connect.
    pub fn write_data(&self, data: impl Into<Vec<u8>>) {
        if self.outbound_tx.send(data.into()).is_err() {
            trace!("write_data on a stopped worker");
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Subscribe to state transitions
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// A link with no worker behind it; writes land in the returned receiver
    #[cfg(test)]
    pub(crate) fn detached() -> (Self, flume::Receiver<Vec<u8>>) {
        let (outbound_tx, outbound_rx) = flume::unbounded();
        let (_, state_rx) = watch::channel(ConnectionState::Disconnected);
        (
            Self {
                outbound_tx,
                state_rx,
            },
            outbound_rx,
        )
    }
}

/// How an established session ended
enum SessionEnd {
    Shutdown,
    Closed,
    Failed(anyhow::Error),
}

/// Reconnecting client bound to one handler
pub struct ConnectionWorker<H: LineHandler> {
    config: ConnectionConfig,
    handler: Arc<H>,
    state_tx: watch::Sender<ConnectionState>,
    outbound_tx: flume::Sender<Vec<u8>>,
    outbound_rx: flume::Receiver<Vec<u8>>,
}

impl<H: LineHandler> ConnectionWorker<H> {
    pub fn new(config: ConnectionConfig, handler: Arc<H>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (outbound_tx, outbound_rx) = flume::unbounded();
        Self {
            config,
            handler,
            state_tx,
            outbound_tx,
            outbound_rx,
        }
    }

    pub fn link(&self) -> ConnectionLink {
        ConnectionLink {
            outbound_tx: self.outbound_tx.clone(),
            state_rx: self.state_tx.subscribe(),
        }
    }

    /// Start the worker on its own task
    ///
    /// The task runs until `shutdown` is cancelled. A worker can only be
    /// started once since `spawn` consumes it.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        let span = tracing::info_span!("feed", name = %self.config.feed);
        tokio::spawn(self.run(shutdown).instrument(span))
    }

    /// Connection loop: `Disconnected -> Connecting -> Connected -> Disconnected -> ...`
    pub async fn run(self, shutdown: CancellationToken) {
        let address = self.config.address();
        let link = self.link();
        let feed = self.config.feed.clone();
        metrics::gauge!("feed.connection.connected", "feed" => feed.clone()).set(0.0);

        loop {
            self.set_state(ConnectionState::Connecting);
            debug!("Connecting to {} feed at {}", feed, address);

            let attempt = tokio::select! {
                _ = shutdown.cancelled() => break,
                attempt = timeout(self.config.connect_timeout, TcpStream::connect(&address)) => attempt,
            };

            match attempt {
                Ok(Ok(stream)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Failed to set TCP_NODELAY on {}: {}", address, e);
                    }

                    // Stale writes from a previous session or from while we were down
                    let stale = self.outbound_rx.drain().count();
                    if stale > 0 {
                        debug!("Dropped {} queued writes from before connect", stale);
                    }

                    info!("Connected to {} feed at {}", feed, address);
                    metrics::gauge!("feed.connection.connected", "feed" => feed.clone()).set(1.0);
                    self.handler.on_connection_changed(true, &link);
                    self.set_state(ConnectionState::Connected);

                    let end = self.run_session(stream, &shutdown).await;

                    metrics::gauge!("feed.connection.connected", "feed" => feed.clone()).set(0.0);
                    self.handler.on_connection_changed(false, &link);
                    self.set_state(ConnectionState::Disconnected);

                    match end {
                        SessionEnd::Shutdown => {
                            info!("Closing {} feed connection for shutdown", feed);
                            break;
                        }
                        SessionEnd::Closed => {
                            info!("{} feed at {} closed the connection", feed, address);
                        }
                        SessionEnd::Failed(e) => {
                            warn!("{} feed at {} dropped: {:#}", feed, address, e);
                        }
                    }
                }
                Ok(Err(e)) => {
                    metrics::counter!("feed.connection.failed_total", "feed" => feed.clone())
                        .increment(1);
                    warn!(
                        "Failed to connect to {} feed at {}: {} - retrying in {:?}",
                        feed, address, e, self.config.retry_delay
                    );
                    self.set_state(ConnectionState::Disconnected);
                }
                Err(_) => {
                    metrics::counter!("feed.connection.failed_total", "feed" => feed.clone())
                        .increment(1);
                    warn!(
                        "Connect to {} feed at {} timed out after {:?} - retrying in {:?}",
                        feed, address, self.config.connect_timeout, self.config.retry_delay
                    );
                    self.set_state(ConnectionState::Disconnected);
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(self.config.retry_delay) => {}
            }
        }

        self.set_state(ConnectionState::Disconnected);
        debug!("{} feed worker stopped", feed);
    }

    async fn run_session(&self, stream: TcpStream, shutdown: &CancellationToken) -> SessionEnd {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::with_capacity(READ_BUFFER_CAPACITY, read_half);
        // Survives cancelled reads, so a partially received line is never lost
        let mut buf: Vec<u8> = Vec::with_capacity(1024);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => return SessionEnd::Shutdown,

                outbound = self.outbound_rx.recv_async() => {
                    // The worker holds a sender, so the channel never disconnects
                    let Ok(data) = outbound else { continue };
                    if let Err(e) = write_half.write_all(&data).await {
                        return SessionEnd::Failed(anyhow::Error::new(e).context("write failed"));
                    }
                    trace!("Wrote {} bytes", data.len());
                }

                read = reader.read_until(b'\n', &mut buf) => {
                    match read {
                        Ok(0) => {
                            if !buf.is_empty() {
                                debug!("Discarding {} bytes of unterminated line at EOF", buf.len());
                            }
                            warn!("Read returned no data, aborting connection");
                            return SessionEnd::Closed;
                        }
                        Ok(_) => {
                            // Only complete lines are delivered; a tail without '\n'
                            // means EOF is next
                            if buf.last() != Some(&b'\n') {
                                continue;
                            }
                            self.deliver_line(&buf);
                            buf.clear();
                        }
                        Err(e) => {
                            return SessionEnd::Failed(anyhow::Error::new(e).context("read failed"));
                        }
                    }
                }
            }
        }
    }

    fn deliver_line(&self, raw: &[u8]) {
        let text = String::from_utf8_lossy(raw);
        let line = text.trim_end_matches(['\n', '\r']);
        if line.trim().is_empty() {
            // Logged and skipped; the connection stays up
            debug!("Skipping line with no content");
            return;
        }
        self.handler.handle_line(line);
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                trace!("Connection state {} -> {}", current, state);
                *current = state;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct Recorder {
        lines: Mutex<Vec<String>>,
        events: Mutex<Vec<bool>>,
    }

    impl LineHandler for Recorder {
        fn handle_line(&self, line: &str) {
            self.lines.lock().unwrap().push(line.to_string());
        }

        fn on_connection_changed(&self, connected: bool, link: &ConnectionLink) {
            self.events.lock().unwrap().push(connected);
            if connected {
                link.write_data("HELLO\n");
            }
        }
    }

    fn fast_config(port: u16) -> ConnectionConfig {
        ConnectionConfig {
            feed: "test".to_string(),
            host: "127.0.0.1".to_string(),
            port,
            connect_timeout: Duration::from_millis(500),
            retry_delay: Duration::from_millis(200),
        }
    }

    async fn wait_for_state(rx: &mut watch::Receiver<ConnectionState>, want: ConnectionState) {
        timeout(Duration::from_secs(5), rx.wait_for(|s| *s == want))
            .await
            .expect("timed out waiting for state")
            .expect("worker dropped");
    }

    #[tokio::test]
    async fn test_delivers_complete_lines_and_handshake() {
        use tokio::io::AsyncReadExt;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let recorder = Arc::new(Recorder::default());
        let worker = ConnectionWorker::new(fast_config(port), recorder.clone());
        let link = worker.link();
        let mut state = link.subscribe();
        let token = CancellationToken::new();
        let handle = worker.spawn(token.clone());

        let (mut socket, _) = listener.accept().await.unwrap();
        wait_for_state(&mut state, ConnectionState::Connected).await;

        let mut hello = [0u8; 6];
        timeout(Duration::from_secs(5), socket.read_exact(&mut hello))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&hello, b"HELLO\n");

        socket.write_all(b"first\r\nsec").await.unwrap();
        socket.flush().await.unwrap();
        sleep(Duration::from_millis(50)).await;
        socket.write_all(b"ond\n\r\nthird").await.unwrap();
        socket.flush().await.unwrap();
        sleep(Duration::from_millis(100)).await;

        assert_eq!(
            *recorder.lines.lock().unwrap(),
            vec!["first".to_string(), "second".to_string()]
        );

        token.cancel();
        handle.await.unwrap();
        assert_eq!(*recorder.events.lock().unwrap(), vec![true, false]);
        assert_eq!(link.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_reconnects_after_peer_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let recorder = Arc::new(Recorder::default());
        let worker = ConnectionWorker::new(fast_config(port), recorder.clone());
        let mut state = worker.link().subscribe();
        let token = CancellationToken::new();
        let handle = worker.spawn(token.clone());

        let (socket, _) = listener.accept().await.unwrap();
        wait_for_state(&mut state, ConnectionState::Connected).await;
        drop(socket);
        wait_for_state(&mut state, ConnectionState::Disconnected).await;

        let (_socket, _) = timeout(Duration::from_secs(5), listener.accept())
            .await
            .unwrap()
            .unwrap();
        wait_for_state(&mut state, ConnectionState::Connected).await;

        token.cancel();
        handle.await.unwrap();
        assert_eq!(*recorder.events.lock().unwrap(), vec![true, false, true, false]);
    }

    #[tokio::test]
    async fn test_refused_connect_never_reports_disconnect_callback() {
        // Grab a free port, then close it so connects are refused
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let recorder = Arc::new(Recorder::default());
        let worker = ConnectionWorker::new(fast_config(port), recorder.clone());
        let token = CancellationToken::new();
        let handle = worker.spawn(token.clone());

        sleep(Duration::from_millis(300)).await;
        token.cancel();
        handle.await.unwrap();

        assert!(recorder.events.lock().unwrap().is_empty());
        assert!(recorder.lines.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_connect_timeout_returns_to_disconnected_and_retries() {
        use tokio::net::TcpSocket;
        use tokio::time::Instant;

        let socket = TcpSocket::new_v4().unwrap();
        socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let listener = socket.listen(1).unwrap();
        let addr = listener.local_addr().unwrap();

        // Fill the accept queue; once it is full the kernel stops answering SYNs
        let mut backlog = Vec::new();
        while let Ok(Ok(stream)) =
            timeout(Duration::from_millis(200), TcpStream::connect(addr)).await
        {
            backlog.push(stream);
            assert!(backlog.len() < 64, "accept queue never filled");
        }

        let config = ConnectionConfig {
            connect_timeout: Duration::from_millis(300),
            retry_delay: Duration::from_millis(200),
            ..fast_config(addr.port())
        };
        let recorder = Arc::new(Recorder::default());
        let worker = ConnectionWorker::new(config, recorder.clone());
        let mut state = worker.link().subscribe();
        let token = CancellationToken::new();
        let handle = worker.spawn(token.clone());

        let mut seen = Vec::new();
        while seen.len() < 3 {
            timeout(Duration::from_secs(5), state.changed())
                .await
                .expect("no state change")
                .unwrap();
            seen.push((*state.borrow_and_update(), Instant::now()));
        }

        let states: Vec<_> = seen.iter().map(|(s, _)| *s).collect();
        assert_eq!(
            states,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Disconnected,
                ConnectionState::Connecting,
            ]
        );
        let waited = seen[1].1 - seen[0].1;
        assert!(waited >= Duration::from_millis(250), "timed out after {waited:?}");
        let retried = seen[2].1 - seen[1].1;
        assert!(retried >= Duration::from_millis(150), "retried after {retried:?}");

        token.cancel();
        handle.await.unwrap();
        assert!(recorder.events.lock().unwrap().is_empty());
        drop(listener);
    }

    #[test]
    fn test_connection_config_defaults() {
        let config = ConnectionConfig::new("adsb", "localhost", 30003);
        assert_eq!(config.address(), "localhost:30003");
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.retry_delay, Duration::from_secs(5));
    }
}
