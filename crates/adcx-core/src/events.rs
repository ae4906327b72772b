//! Events delivered from hub sessions to the application layer.
//!
//! Hub sessions never call back into the UI; they emit typed events on an
//! unbounded channel, replacing listener interfaces with one tagged union
//! per session.

use crate::user::OnlineUser;
use adcx_proto::AdcCommand;
use std::sync::Arc;

/// Severity of a user-visible status message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Transient notification
    Notify,
    /// Verbose/diagnostic
    Verbose,
    /// Informational
    Info,
    /// Warning
    Warning,
    /// Error
    Error,
}

/// A chat message routed through a hub.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    /// Sender.
    pub from: Arc<OnlineUser>,
    /// Addressee of a private message.
    pub to: Option<Arc<OnlineUser>>,
    /// Where replies should go (private messages).
    pub reply_to: Option<Arc<OnlineUser>>,
    /// Message body.
    pub text: String,
    /// `/me` message.
    pub third_person: bool,
    /// Sender-reported timestamp, unix seconds.
    pub timestamp: Option<u64>,
}

/// A request to open a client-client connection, produced by `CTM`, `NAT`
/// and `RNT` negotiation.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// Who to connect to.
    pub user: Arc<OnlineUser>,
    /// Remote port to dial.
    pub port: u16,
    /// Connect token to present.
    pub token: String,
    /// Use the TLS client protocol.
    pub secure: bool,
    /// Our local port (NAT traversal pairs bind both ends).
    pub local_port: Option<u16>,
    /// We are the passive half of a NAT traversal pair.
    pub nat_server: bool,
}

/// Hub user-command definition (`CMD`), surfaced for menu integration.
#[derive(Debug, Clone)]
pub struct UserCommand {
    /// Menu path.
    pub name: String,
    /// Context bitmask.
    pub context: i32,
    /// Raw command text; empty for separators/removals.
    pub command: String,
    /// Remove a previously sent command.
    pub remove: bool,
    /// Separator entry.
    pub separator: bool,
    /// One-shot (confirm) command.
    pub once: bool,
}

/// Events a hub session emits.
#[derive(Debug)]
pub enum ClientEvent {
    /// Connection attempt started.
    Connecting,
    /// Session reached the NORMAL state.
    LoggedIn,
    /// Session closed; reconnect may follow.
    Disconnected {
        /// Human-readable reason.
        reason: String,
    },
    /// The hub asked us to move to another address.
    Redirect {
        /// Target hub URL.
        url: String,
    },
    /// A user-visible status line.
    StatusMessage {
        /// Severity for filtering/markup.
        severity: Severity,
        /// Text.
        text: String,
        /// Spam-ish messages UIs may collapse.
        is_spam: bool,
    },
    /// Main-chat message.
    Chat(ChatMessage),
    /// Private message.
    PrivateMessage(ChatMessage),
    /// The hub requested a password (`GPA`).
    PasswordRequested,
    /// A user joined.
    UserConnected(Arc<OnlineUser>),
    /// A user's identity changed.
    UserUpdated(Arc<OnlineUser>),
    /// Several identities changed at once (own-INF recomputation).
    UsersUpdated(Vec<Arc<OnlineUser>>),
    /// A user left.
    UserDisconnected {
        /// The binding that went away.
        user: Arc<OnlineUser>,
        /// Also drop any transfers with them.
        disconnect_transfers: bool,
    },
    /// Open a client-client connection.
    ConnectToMe(ConnectRequest),
    /// An incoming search we may respond to.
    IncomingSearch {
        /// The raw command (responder needs the full parameter set).
        command: AdcCommand,
        /// The searching user.
        user: Arc<OnlineUser>,
        /// Reply over UDP (active peer) rather than via hub routing.
        udp_reply: bool,
    },
    /// A search result addressed to us.
    SearchResult {
        /// The raw `RES` command.
        command: AdcCommand,
        /// The responding user.
        user: Arc<OnlineUser>,
    },
    /// A partial-sharing availability report (`PSR`).
    PartialResult {
        /// The raw command.
        command: AdcCommand,
        /// The reporting user.
        user: Arc<OnlineUser>,
    },
    /// Hub user-command definition.
    HubUserCommand(UserCommand),
    /// A directed-search completion report (`STA DSCH`).
    DirectSearchEnd {
        /// Token of the finished search.
        token: String,
        /// Result count the peer reported.
        result_count: u32,
    },
}
