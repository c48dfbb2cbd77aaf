use crate::{
    fault::{self, Fault},
    io::{self, Error},
    net::{
        IdleStatusChecker, NoopIdleStatusChecker, Session, SessionConfig, SessionId,
        SessionProcessor, SessionSnapshot,
    },
    rt::WorkerPool,
    sync::{AcquireOutcome, AdmissionGate, AdmissionPermit, CompletionFuture},
};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::any::Any;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{event, Level};

/// How long a blocking accept waits before surfacing a timeout so the loop
/// can observe its stop flag and yield its worker to other listeners.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(250);

// Generous: a loop notices its stop flag within one poll interval plus one
// trip through the worker queue.
const STOP_WAIT: Duration = Duration::from_secs(5);

/// User-owned opaque data attached to a bound endpoint and carried along the
/// accept path to session construction.
pub type ListenerTag = Arc<dyn Any + Send + Sync>;

/// A freshly accepted connection, as handed to the accept driver's session
/// construction hook.
pub struct Accepted<'a> {
    pub socket: TcpStream,
    pub peer: SocketAddr,
    pub local: SocketAddr,
    pub tag: Option<&'a ListenerTag>,
    pub config: &'a SessionConfig,
}

/// The two platform hooks of the accept path, injected as a capability so
/// concrete transports can replace either without inheritance.
pub trait AcceptDriver: Send + Sync {
    /// Drives the platform accept primitive for one connection. Listener
    /// sockets carry a read timeout; `WouldBlock`/`TimedOut` errors are
    /// routine and re-arm the loop without being reported.
    fn begin_accept(&self, listener: &TcpListener) -> std::io::Result<(TcpStream, SocketAddr)>;

    /// Builds the session for an accepted socket. The socket travels into
    /// the session; a failed build therefore closes it on drop.
    fn new_session(
        &self,
        processor: &Arc<dyn SessionProcessor>,
        accepted: Accepted<'_>,
    ) -> io::Result<Arc<dyn Session>>;
}

/// Default driver: plain `std::net` accept and [`StreamSession`] sessions.
///
/// [`StreamSession`]: crate::net::StreamSession
pub struct StreamAcceptDriver;

impl AcceptDriver for StreamAcceptDriver {
    fn begin_accept(&self, listener: &TcpListener) -> std::io::Result<(TcpStream, SocketAddr)> {
        listener.accept()
    }

    fn new_session(
        &self,
        processor: &Arc<dyn SessionProcessor>,
        accepted: Accepted<'_>,
    ) -> io::Result<Arc<dyn Session>> {
        let session = crate::net::StreamSession::new(
            Arc::clone(processor),
            accepted.socket,
            accepted.peer,
            accepted.local,
            accepted.config.clone(),
        )?;

        Ok(Arc::new(session))
    }
}

/// Acceptor-wide settings, frozen at build time.
#[derive(Debug, Clone)]
pub struct AcceptorConfig {
    /// Upper bound on concurrently live sessions; 0 disables admission
    /// control entirely.
    pub max_connections: usize,
    pub backlog: i32,
    pub reuse_address: bool,
    /// Hint to session I/O that read buffers may be pooled and reused
    /// between reads. Not consumed by the accept path itself.
    pub reuse_buffer: bool,
    /// Template applied to every session produced by this acceptor.
    pub session: SessionConfig,
}

impl Default for AcceptorConfig {
    fn default() -> Self {
        Self {
            max_connections: 0,
            // The OS default of around 128 is not enough under high load.
            backlog: 1024,
            reuse_address: true,
            reuse_buffer: true,
            session: SessionConfig::default(),
        }
    }
}

pub struct TcpAcceptorBuilder {
    processor: Option<Arc<dyn SessionProcessor>>,
    driver: Option<Arc<dyn AcceptDriver>>,
    idle_checker: Option<Arc<dyn IdleStatusChecker>>,
    pool_threads: Option<usize>,
    config: AcceptorConfig,
}

impl TcpAcceptorBuilder {
    pub fn new() -> Self {
        Self {
            processor: None,
            driver: None,
            idle_checker: None,
            pool_threads: None,
            config: AcceptorConfig::default(),
        }
    }

    /// Sets the processor that takes ownership of accepted sessions. The
    /// acceptor subscribes to its destroyed event; that subscription is what
    /// returns admission slots, so the processor must fire it exactly once
    /// per added session.
    pub fn processor(mut self, processor: Arc<dyn SessionProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }

    pub fn driver(mut self, driver: Arc<dyn AcceptDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    pub fn idle_checker(mut self, idle_checker: Arc<dyn IdleStatusChecker>) -> Self {
        self.idle_checker = Some(idle_checker);
        self
    }

    /// Worker threads shared by every accept loop. Listeners multiplex over
    /// the pool, so this does not need to scale with endpoint count.
    pub fn pool_threads(mut self, pool_threads: usize) -> Self {
        self.pool_threads = Some(pool_threads);
        self
    }

    pub fn max_connections(mut self, max_connections: usize) -> Self {
        self.config.max_connections = max_connections;
        self
    }

    pub fn backlog(mut self, backlog: i32) -> Self {
        self.config.backlog = backlog;
        self
    }

    pub fn reuse_address(mut self, reuse_address: bool) -> Self {
        self.config.reuse_address = reuse_address;
        self
    }

    pub fn reuse_buffer(mut self, reuse_buffer: bool) -> Self {
        self.config.reuse_buffer = reuse_buffer;
        self
    }

    pub fn session_config(mut self, session: SessionConfig) -> Self {
        self.config.session = session;
        self
    }

    pub fn build(self) -> io::Result<TcpAcceptor> {
        let processor = self
            .processor
            .ok_or_else(|| Error::InvalidOptions("processor must be set".to_string()))?;
        let driver = self
            .driver
            .unwrap_or_else(|| Arc::new(StreamAcceptDriver));
        let idle_checker = self
            .idle_checker
            .unwrap_or_else(|| Arc::new(NoopIdleStatusChecker));
        let pool_threads = self.pool_threads.unwrap_or_else(default_pool_threads);

        if pool_threads == 0 {
            return Err(Error::InvalidOptions(
                "pool_threads must be at least 1".to_string(),
            ));
        }

        let admitted: Arc<Mutex<HashMap<SessionId, AdmissionPermit>>> =
            Arc::new(Mutex::new(HashMap::new()));

        // Sole release path for admitted sessions: one permit dropped per
        // destruction. Skipping this subscription would leak the connection
        // budget monotonically.
        processor.on_session_destroyed(Box::new({
            let admitted = Arc::clone(&admitted);
            move |session_id| {
                let released = admitted
                    .lock()
                    .expect("admission ledger lock poisoned")
                    .remove(&session_id);
                drop(released);
            }
        }));

        // Read-only accessor the idle checker receives on start, so idle
        // detection can enumerate sessions without owning the registry.
        let session_snapshot: SessionSnapshot = Arc::new({
            let processor = Arc::clone(&processor);
            move || processor.managed_sessions()
        });

        let acceptor = TcpAcceptor {
            inner: Arc::new(AcceptorInner {
                pool: WorkerPool::new(pool_threads, "mooring-accept"),
                config: self.config,
                processor,
                driver,
                idle_checker,
                session_snapshot,
                state: Mutex::new(BoundState {
                    listeners: HashMap::new(),
                    gate: None,
                    disposed: false,
                }),
                admitted,
            }),
        };

        event!(Level::DEBUG, message = "acceptor built", pool_threads);

        Ok(acceptor)
    }
}

impl Default for TcpAcceptorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn default_pool_threads() -> usize {
    std::thread::available_parallelism()
        .map(|threads| threads.get())
        .unwrap_or(2)
}

/// Accepts TCP connections on any number of bound endpoints and hands the
/// resulting sessions to a session processor, keeping the number of live
/// sessions within the configured admission budget.
///
/// Cheap to clone; all clones operate the same acceptor.
#[derive(Clone)]
pub struct TcpAcceptor {
    inner: Arc<AcceptorInner>,
}

struct AcceptorInner {
    config: AcceptorConfig,
    processor: Arc<dyn SessionProcessor>,
    driver: Arc<dyn AcceptDriver>,
    idle_checker: Arc<dyn IdleStatusChecker>,
    session_snapshot: SessionSnapshot,
    pool: WorkerPool,
    state: Mutex<BoundState>,

    // Permits of admitted sessions, keyed by session id until the destroyed
    // event returns them. Shared with the destroyed-event subscription.
    admitted: Arc<Mutex<HashMap<SessionId, AdmissionPermit>>>,
}

// Mutated only by bind/unbind/dispose on user threads, under the mutex;
// accept loops hold per-entry Arcs and never touch the map.
struct BoundState {
    listeners: HashMap<SocketAddr, Arc<ListenerEntry>>,
    gate: Option<Arc<AdmissionGate>>,
    disposed: bool,
}

struct ListenerEntry {
    local: SocketAddr,
    socket: TcpListener,
    tag: Option<ListenerTag>,
    stop: AtomicBool,
    stopped: CompletionFuture<()>,
}

impl ListenerEntry {
    fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }
}

impl TcpAcceptor {
    /// Binds every requested endpoint, all-or-nothing: on any failure every
    /// endpoint opened by this call is closed again before the error is
    /// returned. An empty request binds one wildcard endpoint on an
    /// ephemeral port.
    ///
    /// Returns the actual local endpoints, which differ from the requested
    /// ones where port 0 was requested.
    pub fn bind(&self, endpoints: &[SocketAddr]) -> io::Result<Vec<SocketAddr>> {
        self.bind_tagged(endpoints.iter().map(|endpoint| (*endpoint, None)).collect())
    }

    /// Like [`bind`], with an opaque user tag carried to session
    /// construction for each endpoint.
    ///
    /// [`bind`]: TcpAcceptor::bind
    pub fn bind_tagged(
        &self,
        endpoints: Vec<(SocketAddr, Option<ListenerTag>)>,
    ) -> io::Result<Vec<SocketAddr>> {
        let requested = if endpoints.is_empty() {
            vec![(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)), None)]
        } else {
            endpoints
        };

        let mut state = self.inner.state.lock().expect("acceptor state lock poisoned");
        if state.disposed {
            return Err(Error::Disposed);
        }

        // Open everything before installing anything, so a failure can roll
        // back by simply dropping the sockets opened so far.
        let mut opened = Vec::with_capacity(requested.len());
        for (endpoint, tag) in requested {
            let listener = open_listener(endpoint, &self.inner.config)?;
            let local = listener.local_addr().map_err(Error::Io)?;
            opened.push((local, listener, tag));
        }

        let first_bind = state.listeners.is_empty();
        if self.inner.config.max_connections > 0 && state.gate.is_none() {
            state.gate = Some(Arc::new(AdmissionGate::new(self.inner.config.max_connections)));
        }

        let mut actual = Vec::with_capacity(opened.len());
        for (local, socket, tag) in opened {
            let entry = Arc::new(ListenerEntry {
                local,
                socket,
                tag,
                stop: AtomicBool::new(false),
                stopped: CompletionFuture::new(),
            });
            state.listeners.insert(local, Arc::clone(&entry));

            let accept_loop = Arc::new(AcceptLoop {
                acceptor: Arc::downgrade(&self.inner),
                entry,
                gate: state.gate.clone(),
            });
            accept_loop.arm();

            actual.push(local);
        }

        if first_bind {
            self.inner
                .idle_checker
                .start(Arc::clone(&self.inner.session_snapshot));
        }

        event!(
            Level::DEBUG,
            message = "endpoints bound",
            endpoints = ?actual
        );

        Ok(actual)
    }

    /// Unbinds the given endpoints, ignoring ones that are not bound.
    /// Each affected accept loop is stopped and its listening socket closed.
    /// When the last endpoint goes away the idle checker is stopped and the
    /// admission gate is closed and discarded. Idempotent.
    pub fn unbind(&self, endpoints: &[SocketAddr]) {
        let mut removed = Vec::new();
        let gate;
        let emptied;
        {
            let mut state = self.inner.state.lock().expect("acceptor state lock poisoned");
            for endpoint in endpoints {
                if let Some(entry) = state.listeners.remove(endpoint) {
                    removed.push(entry);
                }
            }
            if removed.is_empty() {
                return;
            }

            gate = state.gate.clone();
            emptied = state.listeners.is_empty();
            if emptied {
                if let Some(gate) = state.gate.take() {
                    gate.close();
                }
            }
        }

        for entry in &removed {
            entry.request_stop();
        }
        // Wake loops parked in admission waits so they observe their flags.
        if let Some(gate) = &gate {
            gate.interrupt();
        }

        for entry in &removed {
            if !entry.stopped.wait_timeout(STOP_WAIT) {
                event!(
                    Level::WARN,
                    message = "accept loop did not stop in time",
                    endpoint = %entry.local
                );
            }
        }

        if emptied {
            self.inner.idle_checker.stop();
        }

        event!(
            Level::DEBUG,
            message = "endpoints unbound",
            count = removed.len()
        );
    }

    /// Endpoints currently bound, by their actual local addresses.
    pub fn local_endpoints(&self) -> Vec<SocketAddr> {
        self.inner
            .state
            .lock()
            .expect("acceptor state lock poisoned")
            .listeners
            .keys()
            .copied()
            .collect()
    }

    /// Free admission slots, or `None` when admission control is disabled
    /// or no endpoint has been bound yet. Meaningful at quiescent points.
    pub fn available_admissions(&self) -> Option<usize> {
        self.inner
            .state
            .lock()
            .expect("acceptor state lock poisoned")
            .gate
            .as_ref()
            .map(|gate| gate.available())
    }

    pub fn config(&self) -> &AcceptorConfig {
        &self.inner.config
    }

    pub fn is_disposed(&self) -> bool {
        self.inner
            .state
            .lock()
            .expect("acceptor state lock poisoned")
            .disposed
    }

    /// Shuts the acceptor down: unbinds everything, disposes the processor
    /// and releases the worker pool. Subsumes unbind semantics, so the idle
    /// checker and admission gate go away even without a prior full unbind.
    /// Idempotent; every other operation on a disposed acceptor is refused
    /// or a no-op.
    pub fn dispose(&self) {
        {
            let mut state = self.inner.state.lock().expect("acceptor state lock poisoned");
            if state.disposed {
                return;
            }
            state.disposed = true;
        }

        let bound = self.local_endpoints();
        if !bound.is_empty() {
            self.unbind(&bound);
        }

        self.inner.processor.dispose();
        self.inner.pool.shutdown();

        event!(Level::DEBUG, "acceptor disposed");
    }
}

fn open_listener(endpoint: SocketAddr, config: &AcceptorConfig) -> io::Result<TcpListener> {
    let open = || -> std::io::Result<TcpListener> {
        let socket = Socket::new(
            Domain::for_address(endpoint),
            Type::STREAM,
            Some(Protocol::TCP),
        )?;
        socket.set_reuse_address(config.reuse_address)?;
        socket.bind(&SockAddr::from(endpoint))?;
        socket.listen(config.backlog)?;
        // The timeout bounds how long a loop sits in accept before it gets
        // another chance to observe its stop flag.
        socket.set_read_timeout(Some(ACCEPT_POLL_INTERVAL))?;

        Ok(socket.into())
    };

    open().map_err(|source| Error::Bind { endpoint, source })
}

/// Per-listener accept driver. Each protocol round is one task on the
/// worker pool: acquire an admission slot, accept one connection, build and
/// hand over the session, then re-arm by submitting the next round. Rounds
/// from many listeners interleave over the shared pool.
struct AcceptLoop {
    acceptor: Weak<AcceptorInner>,
    entry: Arc<ListenerEntry>,
    gate: Option<Arc<AdmissionGate>>,
}

impl AcceptLoop {
    /// Submits the next protocol round. The loop terminates instead when its
    /// listener is being stopped or the acceptor is gone.
    fn arm(self: &Arc<Self>) {
        let Some(inner) = self.acceptor.upgrade() else {
            self.finish();
            return;
        };

        let round = Arc::clone(self);
        inner.pool.submit(move || round.run_once());
    }

    fn run_once(self: Arc<Self>) {
        if self.entry.is_stopping() {
            return self.finish();
        }

        // The wait for a slot is bounded so a saturated gate cannot pin this
        // worker; the round just re-arms and other listeners get their turn.
        let permit = match &self.gate {
            Some(gate) => match gate.acquire_within(&self.entry.stop, ACCEPT_POLL_INTERVAL) {
                AcquireOutcome::Acquired(permit) => Some(permit),
                AcquireOutcome::Closed | AcquireOutcome::Cancelled => return self.finish(),
                AcquireOutcome::TimedOut => {
                    self.arm();
                    return;
                }
            },
            None => None,
        };

        if self.entry.is_stopping() {
            return self.finish();
        }

        let Some(inner) = self.acceptor.upgrade() else {
            return self.finish();
        };

        match inner.driver.begin_accept(&self.entry.socket) {
            Ok((socket, peer)) => {
                if self.entry.is_stopping() {
                    // A straggler that arrived while stopping; its admission
                    // slot goes straight back.
                    drop(socket);
                    drop(permit);
                    return self.finish();
                }

                self.complete_accept(&inner, socket, peer, permit);
            }
            Err(error) if accept_would_block(&error) => {
                // Nothing arrived within the poll interval. The permit is
                // re-acquired next round so a closed gate is observed.
                drop(permit);
            }
            Err(error) if error.kind() == std::io::ErrorKind::Interrupted => {
                drop(permit);
            }
            Err(error) => {
                // The slot must not leak just because accept failed; drop
                // the permit before the next round.
                drop(permit);

                if self.entry.is_stopping() {
                    return self.finish();
                }

                fault::report(Fault::new("accept", &error));
            }
        }

        drop(inner);
        self.arm();
    }

    /// Completion step: builds the session and hands it to the processor.
    /// Failures are reported and the loop re-arms; they never propagate.
    fn complete_accept(
        &self,
        inner: &Arc<AcceptorInner>,
        socket: TcpStream,
        peer: SocketAddr,
        permit: Option<AdmissionPermit>,
    ) {
        event!(
            Level::TRACE,
            message = "incoming connection accepted",
            peer = %peer,
            local = %self.entry.local
        );

        let accepted = Accepted {
            socket,
            peer,
            local: self.entry.local,
            tag: self.entry.tag.as_ref(),
            config: &inner.config.session,
        };

        let session = match inner.driver.new_session(&inner.processor, accepted) {
            Ok(session) => session,
            Err(error) => {
                // The permit drops with this frame, freeing the slot.
                fault::report(Fault::new("session setup", &error));
                return;
            }
        };

        // Ledger the permit before the hand-over; the destroyed event may
        // fire as soon as the processor owns the session.
        if let Some(permit) = permit {
            inner
                .admitted
                .lock()
                .expect("admission ledger lock poisoned")
                .insert(session.id(), permit);
        }

        if let Err(error) = inner.processor.add(Arc::clone(&session)) {
            // The processor never owned it, so no destroyed event will come.
            let released = inner
                .admitted
                .lock()
                .expect("admission ledger lock poisoned")
                .remove(&session.id());
            drop(released);

            fault::report(Fault::new("session admission", &error));
        }
    }

    fn finish(&self) {
        self.entry.stopped.complete(());

        event!(
            Level::TRACE,
            message = "accept loop stopped",
            endpoint = %self.entry.local
        );
    }
}

fn accept_would_block(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}
