//! Client driver: connect, bind, hand the session over, reconnect.
//!
//! The client owns the connection lifecycle up to a successful bind. It
//! connects, applies socket options, builds a session with a one-shot
//! bind-response hook, and sends `bind_req`. On `bind_resp` with ok
//! status the pair `(BindResponse, Session)` is delivered to the user on
//! a fresh task (so the callback may drop the client) and the driver
//! releases its owning reference; the user installs handlers and drives
//! the session from there. Failures anywhere in the cycle report through
//! the error callback and, with auto-reconnect enabled, re-arm the
//! connect loop after a constant delay.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::Result;
use crate::protocol::{BindRequest, BindResponse, CommandStatus, Request, Response};
use crate::session::{ProtocolHandler, Session, SessionConfig};
use crate::tcp;

/// Client driver configuration.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Configuration applied to each session the client builds.
    pub session_config: SessionConfig,
    /// Keepalive idle time applied to connected sockets.
    pub inactivity_timeout: Duration,
    /// Retry after connection or binding failures.
    pub auto_reconnect: bool,
    /// Delay between retries.
    pub reconnect_delay: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            session_config: SessionConfig::default(),
            inactivity_timeout: Duration::from_secs(60),
            auto_reconnect: true,
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

type BindCallback = Arc<dyn Fn(BindResponse, Session) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(String) + Send + Sync>;

enum ClientEvent {
    BindOk(BindResponse),
    BindRejected(CommandStatus),
    SessionClosed(Option<String>),
}

/// Intercepts the bind response during the binding phase; everything else
/// is dropped until the user installs their own handler.
struct BindPhaseHandler {
    events: mpsc::UnboundedSender<ClientEvent>,
    bound: bool,
}

impl ProtocolHandler for BindPhaseHandler {
    fn on_request(&mut self, _request: Request, _sequence_number: u32) -> Result<()> {
        Ok(())
    }

    fn on_response(
        &mut self,
        response: Response,
        _sequence_number: u32,
        status: CommandStatus,
    ) -> Result<()> {
        if self.bound {
            return Ok(());
        }
        if let Response::Bind(bind_resp) = response {
            if status.is_ok() {
                self.bound = true;
                let _ = self.events.send(ClientEvent::BindOk(bind_resp));
            } else {
                let _ = self.events.send(ClientEvent::BindRejected(status));
            }
        }
        Ok(())
    }
}

struct ClientInner {
    addr: SocketAddr,
    bind_request: BindRequest,
    options: ClientOptions,
    bind_callback: BindCallback,
    error_callback: ErrorCallback,
    stopped: AtomicBool,
    stop_notify: Notify,
    binding: Mutex<Option<Session>>,
}

/// Connecting side of the protocol.
pub struct Client {
    inner: Arc<ClientInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Create a client for `addr`, binding as `system_id`.
    ///
    /// `bind_callback` receives the peer's bind response together with the
    /// bound session; `error_callback` receives every connection, binding
    /// and close diagnostic.
    pub fn new(
        addr: SocketAddr,
        system_id: impl Into<String>,
        options: ClientOptions,
        bind_callback: impl Fn(BindResponse, Session) + Send + Sync + 'static,
        error_callback: impl Fn(String) + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                addr,
                bind_request: BindRequest::new(system_id),
                options,
                bind_callback: Arc::new(bind_callback),
                error_callback: Arc::new(error_callback),
                stopped: AtomicBool::new(false),
                stop_notify: Notify::new(),
                binding: Mutex::new(None),
            }),
            task: Mutex::new(None),
        }
    }

    /// Endpoint this client connects to.
    pub fn addr(&self) -> SocketAddr {
        self.inner.addr
    }

    /// Begin connecting. Must be called within a tokio runtime.
    pub fn start(&self) {
        let mut task = self.task.lock().expect("client task lock");
        if task.is_some() {
            return;
        }
        *task = Some(tokio::spawn(run_loop(self.inner.clone())));
    }

    /// Cancel any reconnect timer and close the current binding session.
    ///
    /// A session already handed over at bind time is the user's to close.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        self.inner.stop_notify.notify_one();
        if let Some(session) = self.inner.binding.lock().expect("client binding lock").take() {
            session.close("client stopped");
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.stop();
        if let Some(task) = self.task.lock().expect("client task lock").take() {
            task.abort();
        }
    }
}

async fn run_loop(inner: Arc<ClientInner>) {
    loop {
        if inner.stopped.load(Ordering::Acquire) {
            return;
        }

        match TcpStream::connect(inner.addr).await {
            Ok(stream) => run_connection(&inner, stream).await,
            Err(e) => {
                (inner.error_callback)(format!("connect to {} failed: {e}", inner.addr));
            }
        }

        if inner.stopped.load(Ordering::Acquire) || !inner.options.auto_reconnect {
            return;
        }

        tokio::select! {
            _ = tokio::time::sleep(inner.options.reconnect_delay) => {}
            _ = inner.stop_notify.notified() => return,
        }
    }
}

async fn run_connection(inner: &Arc<ClientInner>, stream: TcpStream) {
    tcp::enable_keepalive(&stream, inner.options.inactivity_timeout);
    tcp::enable_no_delay(&stream);
    let peer_addr = stream.peer_addr().ok();

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let close_tx = event_tx.clone();

    let mut builder = Session::builder()
        .with_config(inner.options.session_config.clone())
        .with_protocol_handler(BindPhaseHandler {
            events: event_tx,
            bound: false,
        })
        .with_close_handler(move |_session, reason| {
            let _ = close_tx.send(ClientEvent::SessionClosed(reason));
        });
    if let Some(peer_addr) = peer_addr {
        builder = builder.with_peer_addr(peer_addr);
    }

    let session = match builder.build(stream) {
        Ok(session) => session,
        Err(e) => {
            (inner.error_callback)(format!("session build failed: {e}"));
            return;
        }
    };

    *inner.binding.lock().expect("client binding lock") = Some(session.clone());
    session.start();

    if let Err(e) = session.send_request(inner.bind_request.clone()) {
        (inner.error_callback)(format!("bind request failed: {e}"));
    }

    loop {
        tokio::select! {
            _ = inner.stop_notify.notified() => {
                session.close("client stopped");
                inner.binding.lock().expect("client binding lock").take();
                return;
            }
            event = event_rx.recv() => match event {
                Some(ClientEvent::BindOk(bind_resp)) => {
                    debug!(
                        peer = %bind_resp.system_id,
                        "bind accepted, handing session to the user"
                    );

                    // Reception stays paused across the handover so the
                    // user's handlers see every PDU after the bind.
                    session.pause_receiving();

                    let callback = inner.bind_callback.clone();
                    let handed = session.clone();
                    tokio::spawn(async move {
                        callback(bind_resp, handed.clone());
                        handed.resume_receiving();
                    });

                    // The driver's owning reference ends here.
                    inner.binding.lock().expect("client binding lock").take();
                }
                Some(ClientEvent::BindRejected(status)) => {
                    (inner.error_callback)(format!(
                        "bind rejected with status {:#04x}",
                        status.as_u8()
                    ));
                    session.close("bind rejected");
                }
                Some(ClientEvent::SessionClosed(reason)) => {
                    (inner.error_callback)(format!(
                        "session closed: {}",
                        reason.unwrap_or_else(|| "graceful".to_string())
                    ));
                    break;
                }
                None => break,
            }
        }
    }

    inner.binding.lock().expect("client binding lock").take();
}
