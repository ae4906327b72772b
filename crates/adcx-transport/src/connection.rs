//! The buffered endpoint.
//!
//! [`connect`] spawns one worker task that owns the socket. Callers hold a
//! [`BufferedConnection`] handle (cheap to clone) and receive
//! [`TransportEvent`]s on an unbounded channel, in arrival order. Commands
//! from any task are serialized through the worker; all socket I/O happens
//! there.

use crate::error::TransportError;
use crate::tls;
use flate2::{Decompress, FlushDecompress, Status};
use rustls::pki_types::ServerName;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;

/// Reader framing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadMode {
    /// LF-delimited text lines
    #[default]
    Line,
    /// zlib-compressed stream of text lines; reverts to `Line` at the
    /// compressed stream's end marker
    ZPipe,
    /// Raw bytes
    Binary,
}

/// Callbacks delivered by the endpoint worker.
#[derive(Debug)]
pub enum TransportEvent {
    /// TCP connect started.
    Connecting,
    /// Socket (and TLS, when enabled) established.
    Connected {
        /// Local socket address (for NAT traversal port advertising).
        local: SocketAddr,
        /// Remote socket address.
        remote: SocketAddr,
    },
    /// One decoded text line, without its terminator.
    Line(String),
    /// Raw bytes received in binary mode.
    Data(Vec<u8>),
    /// The endpoint died; no further events follow.
    Failed(String),
}

/// Connection parameters.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Wrap the connection in TLS.
    pub tls: bool,
    /// Accept TLS peers without a pinned keyprint.
    pub allow_untrusted: bool,
    /// Pinned certificate digest; mismatch fails the connection.
    pub keyprint: Option<[u8; 32]>,
    /// TCP connect timeout; zero means 30 seconds.
    pub timeout: Duration,
    /// Switch framing on `IZON`/stream-end inline, before later bytes of
    /// the same read are parsed. Hub sessions enable this; the command
    /// channel cannot switch modes race-free mid-buffer.
    pub watch_zlib: bool,
}

enum Command {
    WriteLine(String),
    WriteBytes(Vec<u8>),
    SetMode(ReadMode),
    Disconnect { graceful: bool },
}

/// Handle to a buffered endpoint. Dropping every handle tears the
/// connection down.
#[derive(Clone)]
pub struct BufferedConnection {
    tx: mpsc::UnboundedSender<Command>,
}

impl BufferedConnection {
    /// Queue a text line (terminator appended by the caller's protocol
    /// layer; this writes bytes verbatim).
    ///
    /// # Errors
    ///
    /// [`TransportError::Closed`] when the worker is gone.
    pub fn write_line(&self, line: impl Into<String>) -> Result<(), TransportError> {
        self.tx
            .send(Command::WriteLine(line.into()))
            .map_err(|_| TransportError::Closed)
    }

    /// Queue raw bytes.
    ///
    /// # Errors
    ///
    /// [`TransportError::Closed`] when the worker is gone.
    pub fn write_bytes(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.tx
            .send(Command::WriteBytes(bytes))
            .map_err(|_| TransportError::Closed)
    }

    /// Switch the reader framing mode.
    ///
    /// # Errors
    ///
    /// [`TransportError::Closed`] when the worker is gone.
    pub fn set_mode(&self, mode: ReadMode) -> Result<(), TransportError> {
        self.tx
            .send(Command::SetMode(mode))
            .map_err(|_| TransportError::Closed)
    }

    /// Tear the connection down. `graceful` flushes pending writes first.
    pub fn disconnect(&self, graceful: bool) {
        let _ = self.tx.send(Command::Disconnect { graceful });
    }
}

/// Open an endpoint to `host:port` and spawn its worker.
#[must_use]
pub fn connect(
    host: String,
    port: u16,
    options: ConnectOptions,
) -> (
    BufferedConnection,
    mpsc::UnboundedReceiver<TransportEvent>,
) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    tokio::spawn(worker(host, port, options, cmd_rx, event_tx));

    (BufferedConnection { tx: cmd_tx }, event_rx)
}

/// Wrap an already-accepted socket in a buffered endpoint (server side).
#[must_use]
pub fn adopt(
    stream: TcpStream,
) -> (
    BufferedConnection,
    mpsc::UnboundedReceiver<TransportEvent>,
) {
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let local = stream.local_addr().ok();
        let remote = stream.peer_addr().ok();
        send_connected(&event_tx, local, remote);
        io_loop(stream, &mut cmd_rx, &event_tx, false).await;
    });

    (BufferedConnection { tx: cmd_tx }, event_rx)
}

async fn worker(
    host: String,
    port: u16,
    options: ConnectOptions,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let _ = events.send(TransportEvent::Connecting);

    let timeout = if options.timeout.is_zero() {
        Duration::from_secs(30)
    } else {
        options.timeout
    };

    let stream = match tokio::time::timeout(timeout, TcpStream::connect((host.as_str(), port)))
        .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            let _ = events.send(TransportEvent::Failed(format!("connect failed: {err}")));
            return;
        }
        Err(_) => {
            let _ = events.send(TransportEvent::Failed("connect timed out".into()));
            return;
        }
    };

    let local = stream.local_addr().ok();
    let remote = stream.peer_addr().ok();

    if options.tls {
        let config = match tls::client_config(options.keyprint, options.allow_untrusted) {
            Ok(config) => config,
            Err(err) => {
                let _ = events.send(TransportEvent::Failed(err.to_string()));
                return;
            }
        };
        let server_name = match ServerName::try_from(host.clone()) {
            Ok(name) => name,
            Err(err) => {
                let _ = events.send(TransportEvent::Failed(format!("bad server name: {err}")));
                return;
            }
        };
        let connector = TlsConnector::from(Arc::new(config));
        match connector.connect(server_name, stream).await {
            Ok(tls_stream) => {
                send_connected(&events, local, remote);
                io_loop(tls_stream, &mut cmd_rx, &events, options.watch_zlib).await;
            }
            Err(err) => {
                let _ = events.send(TransportEvent::Failed(format!("tls failed: {err}")));
            }
        }
    } else {
        send_connected(&events, local, remote);
        io_loop(stream, &mut cmd_rx, &events, options.watch_zlib).await;
    }
}

fn send_connected(
    events: &mpsc::UnboundedSender<TransportEvent>,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
) {
    if let (Some(local), Some(remote)) = (local, remote) {
        let _ = events.send(TransportEvent::Connected { local, remote });
    }
}

async fn io_loop<S>(
    socket: S,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    events: &mpsc::UnboundedSender<TransportEvent>,
    watch_zlib: bool,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(socket);
    let mut framer = Framer::new(watch_zlib);
    let mut buf = vec![0u8; 16 * 1024];

    loop {
        tokio::select! {
            command = cmd_rx.recv() => {
                match command {
                    None | Some(Command::Disconnect { graceful: false }) => {
                        return;
                    }
                    Some(Command::Disconnect { graceful: true }) => {
                        let _ = writer.flush().await;
                        let _ = writer.shutdown().await;
                        return;
                    }
                    Some(Command::WriteLine(line)) => {
                        if let Err(err) = writer.write_all(line.as_bytes()).await {
                            let _ = events.send(TransportEvent::Failed(err.to_string()));
                            return;
                        }
                    }
                    Some(Command::WriteBytes(bytes)) => {
                        if let Err(err) = writer.write_all(&bytes).await {
                            let _ = events.send(TransportEvent::Failed(err.to_string()));
                            return;
                        }
                    }
                    Some(Command::SetMode(mode)) => framer.set_mode(mode),
                }
            }
            read = reader.read(&mut buf) => {
                match read {
                    Ok(0) => {
                        let _ = events.send(TransportEvent::Failed(
                            "connection closed by remote".into(),
                        ));
                        return;
                    }
                    Ok(n) => {
                        if let Err(err) = framer.feed(&buf[..n], events) {
                            let _ = events.send(TransportEvent::Failed(err.to_string()));
                            return;
                        }
                    }
                    Err(err) => {
                        let _ = events.send(TransportEvent::Failed(err.to_string()));
                        return;
                    }
                }
            }
        }
    }
}

/// Splits the byte stream into events according to the active mode.
struct Framer {
    mode: ReadMode,
    pending: Vec<u8>,
    inflater: Option<Decompress>,
    watch_zlib: bool,
}

impl Framer {
    fn new(watch_zlib: bool) -> Self {
        Framer {
            mode: ReadMode::Line,
            pending: Vec::new(),
            inflater: None,
            watch_zlib,
        }
    }

    fn set_mode(&mut self, mode: ReadMode) {
        self.mode = mode;
        self.inflater = match mode {
            ReadMode::ZPipe => Some(Decompress::new(true)),
            _ => None,
        };
    }

    fn feed(
        &mut self,
        mut data: &[u8],
        events: &mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<(), TransportError> {
        while !data.is_empty() {
            match self.mode {
                ReadMode::Binary => {
                    let _ = events.send(TransportEvent::Data(data.to_vec()));
                    return Ok(());
                }
                ReadMode::Line => {
                    self.pending.extend_from_slice(data);
                    if self.drain_lines(events) {
                        // A compression toggle was seen: the rest of the
                        // buffer is already compressed.
                        self.set_mode(ReadMode::ZPipe);
                        let rest = std::mem::take(&mut self.pending);
                        return self.feed(&rest, events);
                    }
                    return Ok(());
                }
                ReadMode::ZPipe => {
                    let (plain, consumed, ended) = self.inflate(data)?;
                    self.pending.extend_from_slice(&plain);
                    let _ = self.drain_lines(events);
                    data = &data[consumed..];
                    if ended {
                        // Compressed frame over; remaining bytes are plain.
                        self.set_mode(ReadMode::Line);
                    } else {
                        debug_assert!(data.is_empty());
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }

    fn inflate(&mut self, input: &[u8]) -> Result<(Vec<u8>, usize, bool), TransportError> {
        let inflater = self
            .inflater
            .as_mut()
            .ok_or_else(|| TransportError::Inflate("no inflater".into()))?;

        let mut out = Vec::new();
        let mut consumed = 0usize;
        let mut chunk = [0u8; 16 * 1024];

        while consumed < input.len() {
            let before_in = inflater.total_in();
            let before_out = inflater.total_out();
            let status = inflater
                .decompress(&input[consumed..], &mut chunk, FlushDecompress::None)
                .map_err(|e| TransportError::Inflate(e.to_string()))?;
            let used = (inflater.total_in() - before_in) as usize;
            let produced = (inflater.total_out() - before_out) as usize;
            consumed += used;
            out.extend_from_slice(&chunk[..produced]);

            match status {
                Status::StreamEnd => return Ok((out, consumed, true)),
                Status::Ok | Status::BufError => {
                    if used == 0 && produced == 0 {
                        break;
                    }
                }
            }
        }
        Ok((out, consumed, false))
    }

    /// Emit complete lines from the pending buffer. Returns true when a
    /// compression toggle was emitted and the caller must re-feed the
    /// remainder as compressed data.
    fn drain_lines(&mut self, events: &mpsc::UnboundedSender<TransportEvent>) -> bool {
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let text = String::from_utf8_lossy(&line).into_owned();
            let toggles = self.watch_zlib && self.mode == ReadMode::Line && text == "IZON";
            let _ = events.send(TransportEvent::Line(text));
            if toggles {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tokio::net::TcpListener;

    async fn expect_connected(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) {
        loop {
            match rx.recv().await {
                Some(TransportEvent::Connected { .. }) => return,
                Some(TransportEvent::Connecting) => continue,
                other => panic!("expected Connected, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn line_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"ISUP ADBAS0 ADTIGR\nISID AAAB\n").await.unwrap();
            let mut buf = vec![0u8; 256];
            let n = socket.read(&mut buf).await.unwrap();
            String::from_utf8_lossy(&buf[..n]).into_owned()
        });

        let (conn, mut rx) = connect(addr.ip().to_string(), addr.port(), ConnectOptions::default());
        expect_connected(&mut rx).await;

        conn.write_line("HSUP ADBAS0\n").unwrap();

        match rx.recv().await {
            Some(TransportEvent::Line(l)) => assert_eq!(l, "ISUP ADBAS0 ADTIGR"),
            other => panic!("unexpected event {other:?}"),
        }
        match rx.recv().await {
            Some(TransportEvent::Line(l)) => assert_eq!(l, "ISID AAAB"),
            other => panic!("unexpected event {other:?}"),
        }

        conn.disconnect(true);
        let sent = server.await.unwrap();
        assert_eq!(sent, "HSUP ADBAS0\n");
    }

    #[tokio::test]
    async fn zpipe_inflates_and_reverts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"BMSG AAAB compressed\\sline\n").unwrap();
        let compressed = encoder.finish().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            // Wait for the client to switch modes before sending.
            let mut go = [0u8; 3];
            socket.read_exact(&mut go).await.unwrap();
            socket.write_all(&compressed).await.unwrap();
            // After the zlib stream ends the connection is back in line mode.
            socket.write_all(b"IMSG plain\n").await.unwrap();
            // Hold the socket open until the client is done reading.
            let mut hold = [0u8; 1];
            let _ = socket.read(&mut hold).await;
        });

        let (conn, mut rx) = connect(addr.ip().to_string(), addr.port(), ConnectOptions::default());
        expect_connected(&mut rx).await;
        conn.set_mode(ReadMode::ZPipe).unwrap();
        conn.write_line("GO\n").unwrap();

        match rx.recv().await {
            Some(TransportEvent::Line(l)) => assert_eq!(l, "BMSG AAAB compressed\\sline"),
            other => panic!("unexpected event {other:?}"),
        }
        match rx.recv().await {
            Some(TransportEvent::Line(l)) => assert_eq!(l, "IMSG plain"),
            other => panic!("unexpected event {other:?}"),
        }
        conn.disconnect(false);
    }

    #[tokio::test]
    async fn binary_mode_delivers_raw_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut go = [0u8; 3];
            socket.read_exact(&mut go).await.unwrap();
            socket.write_all(&[1u8, 2, 3, 4]).await.unwrap();
            let mut hold = [0u8; 1];
            let _ = socket.read(&mut hold).await;
        });

        let (conn, mut rx) = connect(addr.ip().to_string(), addr.port(), ConnectOptions::default());
        expect_connected(&mut rx).await;
        conn.set_mode(ReadMode::Binary).unwrap();
        conn.write_line("GO\n").unwrap();

        match rx.recv().await {
            Some(TransportEvent::Data(bytes)) => assert_eq!(bytes, [1, 2, 3, 4]),
            other => panic!("unexpected event {other:?}"),
        }
        conn.disconnect(false);
    }

    #[tokio::test]
    async fn failed_on_refused_connection() {
        // Port 1 on localhost is almost certainly closed.
        let (_conn, mut rx) = connect("127.0.0.1".into(), 1, ConnectOptions::default());
        loop {
            match rx.recv().await {
                Some(TransportEvent::Connecting) => continue,
                Some(TransportEvent::Failed(_)) => return,
                other => panic!("unexpected event {other:?}"),
            }
        }
    }
}
