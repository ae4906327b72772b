//! Secondary-protocol connectivity validation.
//!
//! When a hybrid hub wants to verify our other IP family, it sends `TCP`
//! with the alternate address, port and a token. One worker opens a fresh
//! connection from that family, presents the token in a `TCP` frame, and
//! waits up to ten seconds for a success status. A new request preempts a
//! running worker; hub shutdown cancels it.

use crate::error::CoreError;
use adcx_proto::{AdcCommand, Code, CommandType, Sid};
use adcx_transport::{connect, ConnectOptions, TransportEvent};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Overall deadline for one validation attempt.
pub const HBRI_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle to a running validation worker.
pub struct HbriWorker {
    stop: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl HbriWorker {
    /// Request cancellation and detach.
    pub fn cancel(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Cancel and wait for the worker to finish.
    pub async fn cancel_and_join(self) {
        self.stop.store(true, Ordering::Release);
        let _ = self.task.await;
    }

    /// Has the worker finished on its own?
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Parameters of one validation attempt.
pub struct HbriRequest {
    /// Alternate-family hub address.
    pub address: String,
    /// Alternate-family hub port.
    pub port: u16,
    /// TLS, mirroring the main hub socket.
    pub secure: bool,
    /// Accept untrusted certificates (mirrors the hub setting).
    pub allow_untrusted: bool,
    /// Validation token from the hub.
    pub token: String,
    /// Our SID on the main connection.
    pub sid: Sid,
    /// Connectivity parameters for the probe `TCP` frame
    /// (`I4`/`I6`/`U4`/`U6` of the family being validated).
    pub connectivity: Vec<(String, String)>,
}

/// Spawn a validation worker. The outcome is reported through `report`.
#[must_use]
pub fn spawn_hbri(
    request: HbriRequest,
    report: impl FnOnce(Result<(), CoreError>) + Send + 'static,
) -> HbriWorker {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&stop);
    let task = tokio::spawn(async move {
        let result = run(request, &stop_flag).await;
        if !stop_flag.load(Ordering::Acquire) {
            report(result);
        }
    });
    HbriWorker { stop, task }
}

async fn run(request: HbriRequest, stop: &AtomicBool) -> Result<(), CoreError> {
    let mut probe = AdcCommand::new(CommandType::Hub, Code::TCP);
    for (key, value) in &request.connectivity {
        probe = probe.add_named(key, value);
    }
    probe = probe.add_named("TO", &request.token);
    let line = probe.to_line(request.sid);

    tracing::debug!(address = %request.address, port = request.port, "starting connectivity validation");

    let (conn, mut events) = connect(
        request.address.clone(),
        request.port,
        ConnectOptions {
            tls: request.secure,
            allow_untrusted: request.allow_untrusted,
            keyprint: None,
            timeout: HBRI_TIMEOUT,
            watch_zlib: false,
        },
    );

    let deadline = tokio::time::Instant::now() + HBRI_TIMEOUT;
    loop {
        if stop.load(Ordering::Acquire) {
            conn.disconnect(false);
            return Err(CoreError::HbriValidationFailed("canceled".into()));
        }

        let event = tokio::select! {
            event = events.recv() => event,
            () = tokio::time::sleep_until(deadline) => {
                conn.disconnect(false);
                return Err(CoreError::HbriValidationFailed("connection timeout".into()));
            }
            // Re-check the cancel flag at a steady cadence.
            () = tokio::time::sleep(Duration::from_millis(100)) => continue,
        };

        match event {
            Some(TransportEvent::Connecting) => {}
            Some(TransportEvent::Connected { .. }) => {
                conn.write_line(line.clone())?;
            }
            Some(TransportEvent::Line(reply)) => {
                conn.disconnect(true);
                let command = AdcCommand::parse(&reply)?;
                let status = command.sta_status().map_err(|_| {
                    CoreError::HbriValidationFailed("invalid hub response".into())
                })?;
                if status.is_success() {
                    return Ok(());
                }
                let message = command.param(1).unwrap_or("validation rejected");
                return Err(CoreError::HbriValidationFailed(message.to_string()));
            }
            Some(TransportEvent::Data(_)) => {}
            Some(TransportEvent::Failed(reason)) => {
                return Err(CoreError::HbriValidationFailed(reason));
            }
            None => {
                return Err(CoreError::HbriValidationFailed("connection closed".into()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    async fn run_request(reply: &'static str) -> Result<(), CoreError> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 512];
            let n = socket.read(&mut buf).await.unwrap();
            let line = String::from_utf8_lossy(&buf[..n]).into_owned();
            assert!(line.starts_with("HTCP "), "unexpected probe: {line}");
            assert!(line.contains("TOtok"));
            socket.write_all(reply.as_bytes()).await.unwrap();
        });

        let (tx, rx) = oneshot::channel();
        let request = HbriRequest {
            address: addr.ip().to_string(),
            port: addr.port(),
            secure: false,
            allow_untrusted: true,
            token: "tok".into(),
            sid: Sid::parse("AAAB").unwrap(),
            connectivity: vec![("I6".into(), "::1".into()), ("U6".into(), "4000".into())],
        };
        let _worker = spawn_hbri(request, move |result| {
            let _ = tx.send(result);
        });
        rx.await.unwrap()
    }

    #[tokio::test]
    async fn validation_succeeds_on_success_status() {
        assert!(run_request("ISTA 000 ok\n").await.is_ok());
    }

    #[tokio::test]
    async fn validation_fails_on_error_status() {
        let err = run_request("ISTA 142 too\\sslow\n").await.unwrap_err();
        assert!(matches!(err, CoreError::HbriValidationFailed(_)));
    }

    #[tokio::test]
    async fn preemption_suppresses_report() {
        // A canceled worker must not call the report hook.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // Accept and stall without replying.
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(socket);
        });

        let request = HbriRequest {
            address: addr.ip().to_string(),
            port: addr.port(),
            secure: false,
            allow_untrusted: true,
            token: "tok".into(),
            sid: Sid::parse("AAAB").unwrap(),
            connectivity: vec![],
        };
        let reported = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&reported);
        let worker = spawn_hbri(request, move |_| {
            flag.store(true, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        worker.cancel_and_join().await;
        assert!(!reported.load(Ordering::SeqCst));
    }
}
