//! Client-client connections (the upload side).
//!
//! A peer connection speaks a miniature ADC session: a `SUP` exchange,
//! one `INF` each way carrying the CID (and the connect token on the
//! dialling side), then `GET`/`SND` rounds served from the upload
//! scheduler. Tokens we handed out in `CTM` commands are tracked in
//! [`ExpectedConnections`] so inbound sockets can be tied back to the
//! right user and hub.

use crate::core::CoreContext;
use crate::user::UserFlags;
use adcx_proto::features::sup;
use adcx_proto::{AdcCommand, AdcStatus, Cid, Code, CommandType, Severity, Sid};
use adcx_transport::{connect, BufferedConnection, ConnectOptions, TransportEvent};
use adcx_transfer::{PreparedUpload, SlotKind, UploadError, UploadRequest, UploadUser};
use dashmap::DashMap;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// Bytes handed to the transport per write while streaming an upload.
const SEND_CHUNK: usize = 256 * 1024;

/// Tokens from our outgoing `CTM`s, awaiting the peer's inbound socket.
#[derive(Default)]
pub struct ExpectedConnections {
    map: DashMap<String, (Cid, String)>,
}

impl ExpectedConnections {
    /// Record a token we just offered.
    pub fn expect(&self, token: &str, cid: Cid, hub_url: &str) {
        self.map
            .insert(token.to_string(), (cid, hub_url.to_string()));
    }

    /// Claim (and forget) a token presented by an inbound peer.
    #[must_use]
    pub fn claim(&self, token: &str) -> Option<(Cid, String)> {
        self.map.remove(token).map(|(_, v)| v)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Accepts inbound peer connections on the configured port.
pub struct PeerServer {
    ctx: Arc<CoreContext>,
    expected: Arc<ExpectedConnections>,
    port: u16,
    stop: Arc<AtomicBool>,
}

impl PeerServer {
    /// New server (not yet listening).
    #[must_use]
    pub fn new(ctx: Arc<CoreContext>, expected: Arc<ExpectedConnections>, port: u16) -> Self {
        PeerServer {
            ctx,
            expected,
            port,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start the accept loop.
    pub fn start(&self) {
        let ctx = Arc::clone(&self.ctx);
        let expected = Arc::clone(&self.expected);
        let stop = Arc::clone(&self.stop);
        let port = self.port;

        tokio::spawn(async move {
            let listener = match TcpListener::bind(("0.0.0.0", port)).await {
                Ok(listener) => listener,
                Err(err) => {
                    tracing::error!(port, %err, "cannot listen for peer connections");
                    return;
                }
            };
            tracing::info!(port, "listening for peer connections");

            loop {
                if stop.load(Ordering::Acquire) {
                    return;
                }
                match listener.accept().await {
                    Ok((socket, addr)) => {
                        tracing::debug!(%addr, "inbound peer connection");
                        let session = PeerSession::inbound(
                            Arc::clone(&ctx),
                            Arc::clone(&expected),
                            socket,
                        );
                        tokio::spawn(session.run());
                    }
                    Err(err) => {
                        tracing::warn!(%err, "accept failed");
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                }
            }
        });
    }

    /// Stop accepting new connections.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }
}

/// Dial a peer in response to a `CTM` we received, then serve its
/// requests.
pub fn connect_to_peer(
    ctx: Arc<CoreContext>,
    host: String,
    port: u16,
    token: String,
    secure: bool,
    user_cid: Cid,
) {
    tokio::spawn(async move {
        let (conn, events) = connect(
            host,
            port,
            ConnectOptions {
                tls: secure,
                allow_untrusted: true,
                keyprint: None,
                timeout: Duration::from_secs(30),
                watch_zlib: false,
            },
        );
        let session = PeerSession::outbound(ctx, conn, events, token, user_cid);
        session.run().await;
    });
}

enum PeerState {
    /// Waiting for the peer's `SUP`.
    Sup,
    /// Waiting for the peer's `INF`.
    Inf,
    /// Serving requests.
    Get,
}

struct PeerSession {
    ctx: Arc<CoreContext>,
    expected: Option<Arc<ExpectedConnections>>,
    conn: BufferedConnection,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    state: PeerState,
    initiator: bool,
    token: Option<String>,
    user: Option<UploadUser>,
    slot: SlotKind,
}

impl PeerSession {
    fn inbound(
        ctx: Arc<CoreContext>,
        expected: Arc<ExpectedConnections>,
        socket: tokio::net::TcpStream,
    ) -> Self {
        let (conn, events) = adcx_transport::adopt(socket);
        PeerSession {
            ctx,
            expected: Some(expected),
            conn,
            events,
            state: PeerState::Sup,
            initiator: false,
            token: None,
            user: None,
            slot: SlotKind::None,
        }
    }

    fn outbound(
        ctx: Arc<CoreContext>,
        conn: BufferedConnection,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        token: String,
        user_cid: Cid,
    ) -> Self {
        let mut session = PeerSession {
            ctx,
            expected: None,
            conn,
            events,
            state: PeerState::Sup,
            initiator: true,
            token: Some(token),
            user: None,
            slot: SlotKind::None,
        };
        session.user = session.build_user(user_cid);
        session
    }

    fn build_user(&self, cid: Cid) -> Option<UploadUser> {
        let profiles = self.ctx.registry.profiles_for_user(&cid);
        let user = self.ctx.registry.user(cid);
        let online = self.ctx.registry.online_users(&cid);
        let (op, mcn) = online.first().map_or((false, false), |o| {
            let id = o.identity();
            (id.is_op(), id.supports("MCN1"))
        });
        Some(UploadUser {
            cid,
            profile: profiles.iter().next().copied().unwrap_or(0),
            profiles,
            favorite: user.is_set(UserFlags::FAVORITE),
            op,
            mcn,
            supports_minislots: true,
        })
    }

    async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            match event {
                TransportEvent::Connecting => {}
                TransportEvent::Connected { .. } => {
                    if self.initiator {
                        self.send_sup();
                    }
                }
                TransportEvent::Line(line) => {
                    if !self.handle_line(&line).await {
                        break;
                    }
                }
                TransportEvent::Data(_) => {}
                TransportEvent::Failed(reason) => {
                    tracing::debug!(reason, "peer connection closed");
                    break;
                }
            }
        }

        // Slot accounting on the way out.
        if let Some(user) = &self.user {
            self.ctx.scheduler.connection_closed(&user.cid, self.slot, None);
        }
    }

    fn send_sup(&self) {
        let cmd = AdcCommand::client(Code::SUP)
            .add_param(sup::BAS0)
            .add_param(sup::BASE)
            .add_param(sup::TIGR);
        let _ = self.conn.write_line(cmd.to_line(Sid::HUB));
    }

    fn send_inf(&self) {
        let mut cmd = AdcCommand::client(Code::INF).add_named("ID", self.ctx.cid.to_base32());
        if let Some(token) = &self.token {
            if self.initiator {
                cmd = cmd.add_named("TO", token);
            }
        }
        let _ = self.conn.write_line(cmd.to_line(Sid::HUB));
    }

    fn send_error(&self, code: u8, message: &str) {
        let cmd = AdcCommand::status(
            CommandType::Client,
            AdcStatus::new(Severity::Recoverable, code),
            message,
        );
        let _ = self.conn.write_line(cmd.to_line(Sid::HUB));
    }

    async fn handle_line(&mut self, line: &str) -> bool {
        let Ok(cmd) = AdcCommand::parse(line) else {
            return true;
        };

        match self.state {
            PeerState::Sup => {
                if cmd.code() != Code::SUP {
                    self.send_error(AdcStatus::BAD_STATE, "Expecting SUP");
                    return false;
                }
                if !self.initiator {
                    self.send_sup();
                }
                self.send_inf();
                self.state = PeerState::Inf;
                true
            }
            PeerState::Inf => {
                if cmd.code() != Code::INF {
                    self.send_error(AdcStatus::BAD_STATE, "Expecting INF");
                    return false;
                }
                self.on_inf(&cmd)
            }
            PeerState::Get => {
                match cmd.code() {
                    Code::GET => self.on_get(&cmd).await,
                    Code::GFI => self.on_gfi(&cmd),
                    Code::STA => true,
                    _ => true,
                }
            }
        }
    }

    fn on_inf(&mut self, cmd: &AdcCommand) -> bool {
        let Some(cid_text) = cmd.named("ID", 0) else {
            self.send_error(AdcStatus::PROTOCOL_GENERIC, "INF without ID");
            return false;
        };
        let Ok(cid) = Cid::from_base32(cid_text) else {
            self.send_error(AdcStatus::PROTOCOL_GENERIC, "Invalid CID");
            return false;
        };

        if !self.initiator {
            // The peer presents the token from our CTM offer.
            if let Some(token) = cmd.named("TO", 0) {
                self.token = Some(token.to_string());
                if let Some(expected) = &self.expected {
                    if let Some((expected_cid, _hub)) = expected.claim(token) {
                        if expected_cid != cid {
                            self.send_error(AdcStatus::PROTOCOL_GENERIC, "CID mismatch");
                            return false;
                        }
                    }
                }
            }
            self.user = self.build_user(cid);
        } else if let Some(user) = &self.user {
            if user.cid != cid {
                self.send_error(AdcStatus::PROTOCOL_GENERIC, "CID mismatch");
                return false;
            }
        }

        if self.user.as_ref().map_or(true, |u| u.profiles.is_empty()) {
            // Unknown on every hub we share with.
            self.send_error(AdcStatus::UNKNOWN_USER, "Unknown user");
            return false;
        }

        self.state = PeerState::Get;
        true
    }

    async fn on_get(&mut self, cmd: &AdcCommand) -> bool {
        if cmd.params().len() < 4 {
            self.send_error(AdcStatus::PROTOCOL_GENERIC, "Too few parameters for GET");
            return true;
        }
        let kind = cmd.param(0).unwrap_or("").to_string();
        let path = cmd.param(1).unwrap_or("").to_string();
        let start: i64 = cmd.param(2).and_then(|v| v.parse().ok()).unwrap_or(-1);
        let bytes: i64 = cmd.param(3).and_then(|v| v.parse().ok()).unwrap_or(0);

        let Some(user) = self.user.clone() else {
            self.send_error(AdcStatus::BAD_STATE, "No identity");
            return false;
        };

        let request = UploadRequest {
            kind: kind.clone(),
            path: path.clone(),
            start,
            bytes,
            recursive: cmd.flag("RE", 4),
            tth_list: cmd.flag("TL", 4),
            current_slot: self.slot,
        };

        let token = self.token.clone().unwrap_or_default();
        let prepared = match self
            .ctx
            .scheduler
            .prepare_upload(&request, &user, &token, unix_now())
        {
            Ok(prepared) => prepared,
            Err(UploadError::SlotsFull { queue_position }) => {
                let mut sta = AdcCommand::status(
                    CommandType::Client,
                    AdcStatus::new(Severity::Recoverable, AdcStatus::SLOTS_FULL),
                    "All upload slots taken",
                );
                if let Some(position) = queue_position {
                    sta = sta.add_named("QP", position.to_string());
                }
                let _ = self.conn.write_line(sta.to_line(Sid::HUB));
                return false;
            }
            Err(err) => {
                self.send_error(err.status_code(), &err.to_string());
                return true;
            }
        };

        self.slot = prepared.slot;

        let snd = AdcCommand::client(Code::SND)
            .add_param(kind)
            .add_param(path)
            .add_param(prepared.start.to_string())
            .add_param(prepared.length.to_string());
        if self.conn.write_line(snd.to_line(Sid::HUB)).is_err() {
            return false;
        }

        self.stream_upload(&prepared).await;
        true
    }

    async fn stream_upload(&mut self, prepared: &PreparedUpload) {
        let Some(mut stream) = prepared.upload.take_stream() else {
            return;
        };

        let mut buffer = vec![0u8; SEND_CHUNK];
        let mut failed = false;
        loop {
            let read = match stream.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) => {
                    tracing::warn!(%err, path = %prepared.upload.path, "upload read failed");
                    failed = true;
                    break;
                }
            };
            if self.conn.write_bytes(buffer[..read].to_vec()).is_err() {
                failed = true;
                break;
            }
            prepared.upload.add_pos(read as u64);
            // Let the writer drain between chunks.
            tokio::task::yield_now().await;
        }

        if failed {
            self.ctx.scheduler.connection_closed(
                &prepared.upload.user,
                self.slot,
                Some(&prepared.upload),
            );
            self.slot = SlotKind::None;
            return;
        }

        // Keep the stream for delay-pool resume of chunked file uploads.
        prepared.upload.store_stream(stream);
        self.ctx.scheduler.transmit_done(&prepared.upload);
        tracing::debug!(
            path = %prepared.upload.path,
            sent = prepared.upload.pos(),
            "upload finished"
        );
    }

    fn on_gfi(&mut self, cmd: &AdcCommand) -> bool {
        let (Some(kind), Some(ident)) = (cmd.param(0), cmd.param(1)) else {
            self.send_error(AdcStatus::PROTOCOL_GENERIC, "Missing parameters");
            return true;
        };
        if kind != "file" {
            self.send_error(AdcStatus::TRANSFER_GENERIC, "Unknown item type");
            return true;
        }
        let Some(user) = &self.user else {
            return false;
        };

        match self.ctx.tree.resolve_file(ident, &user.profiles) {
            Ok(file) => {
                let res = AdcCommand::client(Code::RES)
                    .add_named("FN", file.adc_path())
                    .add_named("SI", file.size.to_string())
                    .add_named("TR", file.tth.to_base32());
                let _ = self.conn.write_line(res.to_line(Sid::HUB));
            }
            Err(_) => {
                self.send_error(AdcStatus::FILE_NOT_AVAILABLE, "File not available");
            }
        }
        true
    }
}
