//! Server driver: accept connections and route the bind handshake.
//!
//! Each accepted socket gets its options applied and a session in a
//! "binding" set. The first `bind_req` on a session goes to the user's
//! bind handler: returning true answers `bind_resp(rok)` with the
//! server's identity and promotes the session into the server's session
//! manager (the user keeps driving it through the handle given to the
//! handler); returning false answers `bind_resp(rfail)` and closes. A
//! session that closes before binding is swept out of the binding set
//! with a diagnostic.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::Result;
use crate::manager::{AggregateMetrics, SessionManager};
use crate::protocol::{BindRequest, BindResponse, CommandStatus, Request, Response};
use crate::session::{ProtocolHandler, Session, SessionConfig};
use crate::tcp;

/// Server driver configuration.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Configuration applied to each accepted session.
    pub session_config: SessionConfig,
    /// Keepalive idle time applied to accepted sockets.
    pub inactivity_timeout: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            session_config: SessionConfig::default(),
            inactivity_timeout: Duration::from_secs(60),
        }
    }
}

type BindHandler = Arc<dyn Fn(&BindRequest, &Session) -> bool + Send + Sync>;

struct ServerInner {
    local_addr: SocketAddr,
    system_id: String,
    options: ServerOptions,
    bind_handler: BindHandler,
    listener: Mutex<Option<TcpListener>>,
    binding: Mutex<HashMap<u64, Session>>,
    manager: SessionManager,
}

/// Accepting side of the protocol.
pub struct Server {
    inner: Arc<ServerInner>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// Bind the listening socket.
    ///
    /// `bind_handler` decides each incoming bind: it receives the request
    /// and the session handle, and its return value selects between
    /// `rok` and `rfail`.
    pub async fn bind(
        addr: SocketAddr,
        system_id: impl Into<String>,
        options: ServerOptions,
        bind_handler: impl Fn(&BindRequest, &Session) -> bool + Send + Sync + 'static,
    ) -> Result<Self> {
        options.session_config.validate()?;

        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            inner: Arc::new(ServerInner {
                local_addr,
                system_id: system_id.into(),
                options,
                bind_handler: Arc::new(bind_handler),
                listener: Mutex::new(Some(listener)),
                binding: Mutex::new(HashMap::new()),
                manager: SessionManager::new(),
            }),
            accept_task: Mutex::new(None),
        })
    }

    /// Actual listening address (useful when bound to port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Identity answered in `bind_resp`.
    pub fn system_id(&self) -> &str {
        &self.inner.system_id
    }

    /// Sessions accepted but not yet bound.
    pub fn binding_session_count(&self) -> usize {
        self.inner.binding.lock().expect("server binding lock").len()
    }

    /// Sessions promoted past the bind handshake.
    pub fn active_session_count(&self) -> usize {
        self.inner.manager.active_count()
    }

    /// Aggregate metrics over the bound sessions.
    pub fn get_metrics(&self) -> AggregateMetrics {
        self.inner.manager.get_metrics()
    }

    /// The registry of bound sessions.
    pub fn session_manager(&self) -> &SessionManager {
        &self.inner.manager
    }

    /// Begin accepting connections. Must be called within a tokio runtime.
    pub fn start(&self) {
        let mut task = self.accept_task.lock().expect("server accept lock");
        if task.is_some() {
            return;
        }
        let Some(listener) = self
            .inner
            .listener
            .lock()
            .expect("server listener lock")
            .take()
        else {
            return;
        };
        *task = Some(tokio::spawn(accept_loop(listener, self.inner.clone())));
    }

    /// Stop accepting, close binding sessions, unbind bound sessions.
    pub fn stop(&self) {
        if let Some(task) = self.accept_task.lock().expect("server accept lock").take() {
            task.abort();
        }

        let binding: Vec<Session> = {
            let mut binding = self.inner.binding.lock().expect("server binding lock");
            binding.drain().map(|(_, session)| session).collect()
        };
        for session in binding {
            session.close("server stopped");
        }

        self.inner.manager.close_all();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.lock().expect("server accept lock").take() {
            task.abort();
        }
    }
}

async fn accept_loop(listener: TcpListener, inner: Arc<ServerInner>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => on_accept(&inner, stream, peer_addr),
            Err(e) => {
                warn!("accept failed: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

fn on_accept(inner: &Arc<ServerInner>, stream: TcpStream, peer_addr: SocketAddr) {
    tcp::enable_keepalive(&stream, inner.options.inactivity_timeout);
    tcp::enable_no_delay(&stream);

    let close_ref: Weak<ServerInner> = Arc::downgrade(inner);
    let builder = Session::builder()
        .with_config(inner.options.session_config.clone())
        .with_peer_addr(peer_addr)
        .with_close_handler(move |session, reason| {
            let Some(inner) = close_ref.upgrade() else {
                return;
            };
            let was_binding = inner
                .binding
                .lock()
                .expect("server binding lock")
                .remove(&session.id())
                .is_some();
            if was_binding {
                warn!(
                    peer = %peer_addr,
                    "session closed during binding: {}",
                    reason.as_deref().unwrap_or("no reason")
                );
            }
        });

    let session = match builder.build(stream) {
        Ok(session) => session,
        Err(e) => {
            error!(peer = %peer_addr, "failed to build session: {e}");
            return;
        }
    };

    session.set_protocol_handler(BindPhaseHandler {
        server: Arc::downgrade(inner),
        session: session.clone(),
        done: false,
    });

    inner
        .binding
        .lock()
        .expect("server binding lock")
        .insert(session.id(), session.clone());

    debug!(peer = %peer_addr, session_id = session.id(), "connection accepted");
    session.start();
}

/// Waits for the first `bind_req` and runs the user's bind decision.
struct BindPhaseHandler {
    server: Weak<ServerInner>,
    session: Session,
    done: bool,
}

impl ProtocolHandler for BindPhaseHandler {
    fn on_request(&mut self, request: Request, sequence_number: u32) -> Result<()> {
        if self.done {
            return Ok(());
        }
        let Request::Bind(bind_req) = request else {
            // Nothing but a bind is meaningful before the handshake.
            return Ok(());
        };
        self.done = true;

        let Some(server) = self.server.upgrade() else {
            return Ok(());
        };

        let accepted = (server.bind_handler)(&bind_req, &self.session);
        let bind_resp = BindResponse::new(server.system_id.clone());

        if accepted {
            self.session
                .send_response(bind_resp, sequence_number, CommandStatus::Rok)?;
            server
                .binding
                .lock()
                .expect("server binding lock")
                .remove(&self.session.id());
            server.manager.add(self.session.clone());
            debug!(
                system_id = %bind_req.system_id,
                session_id = self.session.id(),
                "bind accepted"
            );
        } else {
            self.session
                .send_response(bind_resp, sequence_number, CommandStatus::Rfail)?;
            server
                .binding
                .lock()
                .expect("server binding lock")
                .remove(&self.session.id());
            self.session.close("bind rejected");
            debug!(
                system_id = %bind_req.system_id,
                session_id = self.session.id(),
                "bind rejected"
            );
        }

        Ok(())
    }

    fn on_response(
        &mut self,
        _response: Response,
        _sequence_number: u32,
        _status: CommandStatus,
    ) -> Result<()> {
        Ok(())
    }
}
