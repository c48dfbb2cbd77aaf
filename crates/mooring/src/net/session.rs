use crate::io;
use std::fmt;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a session, distinct from every other live
/// session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub fn allocate() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A single connected endpoint's lifecycle context. The acceptor core only
/// needs an identity; everything else about a session belongs to its
/// processor.
pub trait Session: Send + Sync {
    fn id(&self) -> SessionId;
}

/// Callback fired once per session when the session is destroyed.
pub type DestroyedListener = Box<dyn Fn(SessionId) + Send + Sync>;

/// Read-only live enumeration of managed sessions. The acceptor builds one
/// over its processor and hands it to the idle checker on start, so idle
/// detection can walk the sessions without owning the registry.
pub type SessionSnapshot = Arc<dyn Fn() -> Vec<Arc<dyn Session>> + Send + Sync>;

/// Owns the lifecycle of sessions after accept: I/O scheduling, teardown,
/// and the destroyed event the acceptor's admission bookkeeping hangs off.
pub trait SessionProcessor: Send + Sync {
    /// Takes ownership of a freshly built session. Must not block; may fail,
    /// in which case the processor boundary is responsible for closing the
    /// session's socket.
    fn add(&self, session: Arc<dyn Session>) -> io::Result<()>;

    /// Live snapshot of the sessions this processor currently manages.
    fn managed_sessions(&self) -> Vec<Arc<dyn Session>>;

    /// Subscribes to the destroyed event, which fires exactly once per
    /// session handed to [`add`].
    ///
    /// [`add`]: SessionProcessor::add
    fn on_session_destroyed(&self, listener: DestroyedListener);

    /// Called once at acceptor shutdown.
    fn dispose(&self);
}

/// Periodic idle detection over the managed sessions. Started when the
/// first endpoint is bound, stopped when the last one is unbound.
pub trait IdleStatusChecker: Send + Sync {
    /// Starts the checker. `sessions` enumerates the live managed sessions
    /// on demand; the checker holds it for the duration of its run.
    fn start(&self, sessions: SessionSnapshot);
    fn stop(&self);
}

/// Default checker for deployments that do their idle detection elsewhere.
pub struct NoopIdleStatusChecker;

impl IdleStatusChecker for NoopIdleStatusChecker {
    fn start(&self, _sessions: SessionSnapshot) {}
    fn stop(&self) {}
}

/// Immutable template applied to every session a listener produces.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Initial read buffer size for session I/O.
    pub read_buffer_size: usize,
    pub tcp_no_delay: bool,
    /// Both-direction idle threshold consumed by idle detection.
    pub idle_time: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 2048,
            tcp_no_delay: false,
            idle_time: None,
        }
    }
}

/// Default session over an accepted TCP stream: an identity, the endpoints,
/// the socket, and the config template it was built from. Deployments with
/// richer session state supply their own [`Session`] through the accept
/// driver instead.
pub struct StreamSession {
    id: SessionId,
    peer: SocketAddr,
    local: SocketAddr,
    config: SessionConfig,
    processor: Arc<dyn SessionProcessor>,
    socket: Mutex<Option<TcpStream>>,
}

impl StreamSession {
    pub fn new(
        processor: Arc<dyn SessionProcessor>,
        socket: TcpStream,
        peer: SocketAddr,
        local: SocketAddr,
        config: SessionConfig,
    ) -> std::io::Result<Self> {
        if config.tcp_no_delay {
            socket.set_nodelay(true)?;
        }

        Ok(Self {
            id: SessionId::allocate(),
            peer,
            local,
            config,
            processor,
            socket: Mutex::new(Some(socket)),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn processor(&self) -> &Arc<dyn SessionProcessor> {
        &self.processor
    }

    /// Transfers the socket to whoever drives this session's I/O. `None`
    /// once taken (or after teardown dropped it).
    pub fn take_socket(&self) -> Option<TcpStream> {
        self.socket
            .lock()
            .expect("session socket lock poisoned")
            .take()
    }
}

impl Session for StreamSession {
    fn id(&self) -> SessionId {
        self.id
    }
}
