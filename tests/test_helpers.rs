//! Shared fixtures for the workspace integration tests.

use adcx_core::{Core, CoreSettings, HubSettings};
use adcx_proto::Pid;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// A scripted hub endpoint driven by the test body.
pub struct MockHub {
    listener: TcpListener,
    /// Address the client should connect to.
    pub url: String,
}

/// One accepted hub-side connection.
pub struct MockHubSession {
    socket: TcpStream,
    buffer: Vec<u8>,
}

impl MockHub {
    /// Bind an ephemeral listener.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock hub");
        let addr = listener.local_addr().expect("local addr");
        MockHub {
            listener,
            url: format!("adc://{}:{}", addr.ip(), addr.port()),
        }
    }

    /// Wait for the client's connection.
    pub async fn accept(&self) -> MockHubSession {
        let (socket, _) = self.listener.accept().await.expect("accept");
        MockHubSession {
            socket,
            buffer: Vec::new(),
        }
    }
}

impl MockHubSession {
    /// Read one LF-terminated line from the client.
    pub async fn read_line(&mut self) -> String {
        loop {
            if let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.buffer.drain(..=pos).collect();
                return String::from_utf8_lossy(&line).into_owned();
            }
            let mut chunk = [0u8; 4096];
            let read = self.socket.read(&mut chunk).await.expect("hub read");
            assert!(read > 0, "client closed the connection");
            self.buffer.extend_from_slice(&chunk[..read]);
        }
    }

    /// Send raw bytes to the client.
    pub async fn send(&mut self, data: &str) {
        self.socket
            .write_all(data.as_bytes())
            .await
            .expect("hub write");
    }

    /// Send a binary frame to the client.
    pub async fn send_bytes(&mut self, data: &[u8]) {
        self.socket.write_all(data).await.expect("hub write");
    }
}

/// A core with a deterministic identity and no listening ports.
pub fn test_core(pid_seed: u8) -> Arc<Core> {
    Core::new(CoreSettings {
        pid: Some(Pid::from_bytes([pid_seed; 24])),
        hub_defaults: HubSettings {
            nick: "tester".into(),
            auto_reconnect: false,
            ..HubSettings::default()
        },
        ..Default::default()
    })
}

/// Drive a standard login against a mock hub session and return our SID
/// token as assigned by the hub.
pub async fn complete_login(hub: &mut MockHubSession) -> String {
    let sup = hub.read_line().await;
    assert!(sup.starts_with("HSUP "), "expected SUP, got {sup}");
    hub.send("ISUP ADBAS0 ADTIGR\n").await;
    hub.send("ISID AAAB\n").await;

    let inf = hub.read_line().await;
    assert!(inf.starts_with("BINF AAAB "), "expected INF, got {inf}");

    // Echo the identity back, which completes the login.
    hub.send(&inf).await;
    "AAAB".to_string()
}
