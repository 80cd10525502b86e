//! The protocol engine.
//!
//! [`Engine`] owns the connection and every session, link, delivery and
//! transaction created under it. Callers drive it from both directions:
//! [`Engine::ingest`] feeds bytes read from the peer, and the endpoint
//! operations (`open_session`, `write`, `declare`, ...) mutate local state.
//! Frames are written to an [`OutputSink`] or queued for
//! [`Engine::take_output`]. Events raised by either direction are dispatched
//! to registered handlers before the call that produced them returns.
//!
//! ```
//! use amqp_engine::{Engine, EngineConfig};
//!
//! let mut engine = Engine::new(EngineConfig::default());
//! engine.start().unwrap();
//! engine.open_connection().unwrap();
//! let session = engine.new_session().unwrap();
//! engine.open_session(session).unwrap();
//! assert!(!engine.take_output().is_empty());
//! ```

mod deliveries;
mod endpoints;
mod events;
mod input;
mod output;
mod pipeline;
mod tick;
mod transactions;

use std::collections::{BTreeMap, HashMap, VecDeque};

use bytes::{Bytes, BytesMut};
pub use events::{Event, EventKind};
use events::{Handler, Queued};
pub use output::{OutputSink, WriteStatus, WriteToken};
pub use pipeline::Pipeline;
pub use tick::TickScheduler;
pub use transactions::LOCAL_TRANSACTIONS;
use tracing::{debug, warn};

use crate::{
    codec::FrameCodec,
    config::EngineConfig,
    connection::Connection,
    delivery::Delivery,
    endpoint::{
        ConnectionId, ControllerId, DeliveryKey, Endpoint, EndpointState, LinkId, ManagerId,
        SessionId, TransactionId,
    },
    error::{EngineError, EngineFailure, Result},
    idle::IdleTimer,
    link::{Link, LinkOwner},
    session::Session,
    transaction::{Controller, Manager, Transaction},
};

/// Engine lifecycle. Transitions only move forward.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EngineState {
    /// Constructed, not started.
    #[default]
    Idle,
    /// `start` is running.
    Starting,
    /// Accepting input and producing output.
    Started,
    /// A protocol or I/O failure occurred; only shutdown remains.
    Failed,
    /// Shut down; terminal.
    Shutdown,
}

/// How the idle timer is being driven.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TickMode {
    Manual,
    Auto,
}

/// Sans-I/O AMQP 1.0 engine.
pub struct Engine {
    config: EngineConfig,
    state: EngineState,
    failure: Option<EngineFailure>,
    next_id: u32,
    connection: Connection,
    sessions: BTreeMap<SessionId, Session>,
    links: BTreeMap<LinkId, Link>,
    deliveries: BTreeMap<DeliveryKey, Delivery>,
    settled: Vec<DeliveryKey>,
    transactions: BTreeMap<TransactionId, Transaction>,
    controllers: BTreeMap<ControllerId, Controller>,
    managers: BTreeMap<ManagerId, Manager>,
    codec: FrameCodec,
    input: BytesMut,
    sink: Option<Box<dyn OutputSink>>,
    output: VecDeque<Bytes>,
    next_token: u64,
    pending_tokens: HashMap<WriteToken, (SessionId, u32)>,
    frames_read: u64,
    frames_written: u64,
    handlers: HashMap<(Endpoint, EventKind), Handler>,
    queue: VecDeque<Queued>,
    dispatching: bool,
    idle: IdleTimer,
    tick_mode: Option<TickMode>,
    scheduler: Option<Box<dyn TickScheduler>>,
    scheduled_deadline: Option<i64>,
}

impl Default for Engine {
    fn default() -> Self { Self::new(EngineConfig::default()) }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("state", &self.state)
            .field("failure", &self.failure)
            .field("connection", &self.connection)
            .field("sessions", &self.sessions.len())
            .field("links", &self.links.len())
            .field("deliveries", &self.deliveries.len())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Create an engine using `config` for connection and session defaults.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        let connection = Connection::new(&config);
        let codec = FrameCodec::new(connection.max_frame_size());
        Self {
            config,
            state: EngineState::Idle,
            failure: None,
            next_id: 0,
            connection,
            sessions: BTreeMap::new(),
            links: BTreeMap::new(),
            deliveries: BTreeMap::new(),
            settled: Vec::new(),
            transactions: BTreeMap::new(),
            controllers: BTreeMap::new(),
            managers: BTreeMap::new(),
            codec,
            input: BytesMut::new(),
            sink: None,
            output: VecDeque::new(),
            next_token: 0,
            pending_tokens: HashMap::new(),
            frames_read: 0,
            frames_written: 0,
            handlers: HashMap::new(),
            queue: VecDeque::new(),
            dispatching: false,
            idle: IdleTimer::default(),
            tick_mode: None,
            scheduler: None,
            scheduled_deadline: None,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> EngineState { self.state }

    /// Why the engine failed, once it has.
    #[must_use]
    pub const fn failure(&self) -> Option<&EngineFailure> { self.failure.as_ref() }

    /// Output may be produced.
    #[must_use]
    pub const fn is_writable(&self) -> bool { matches!(self.state, EngineState::Started) }

    /// Frames decoded from the peer, heartbeats included.
    #[must_use]
    pub const fn frames_read(&self) -> u64 { self.frames_read }

    /// Frames written to the peer, heartbeats excluded.
    #[must_use]
    pub const fn frames_written(&self) -> u64 { self.frames_written }

    /// Configuration the engine was built with.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig { &self.config }

    /// The connection.
    #[must_use]
    pub const fn connection(&self) -> &Connection { &self.connection }

    /// The connection, for configuration before it is opened.
    pub const fn connection_mut(&mut self) -> &mut Connection { &mut self.connection }

    /// A session.
    #[must_use]
    pub fn session(&self, id: SessionId) -> Option<&Session> { self.sessions.get(&id) }

    /// A session, for configuration before it is opened.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidArgument`] for an unknown session.
    pub fn session_mut(&mut self, id: SessionId) -> Result<&mut Session> {
        self.sessions
            .get_mut(&id)
            .ok_or_else(|| EngineError::invalid_arg(format!("unknown {id}")))
    }

    /// Every session, in creation order.
    pub fn sessions(&self) -> impl Iterator<Item = SessionId> + '_ { self.sessions.keys().copied() }

    /// A link.
    #[must_use]
    pub fn link(&self, id: LinkId) -> Option<&Link> { self.links.get(&id) }

    /// A link, for configuration before it is opened.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidArgument`] for an unknown link.
    pub fn link_mut(&mut self, id: LinkId) -> Result<&mut Link> {
        self.links
            .get_mut(&id)
            .ok_or_else(|| EngineError::invalid_arg(format!("unknown {id}")))
    }

    /// A delivery. Complete deliveries settled locally are dropped once the
    /// call that settled them returns.
    #[must_use]
    pub fn delivery(&self, key: DeliveryKey) -> Option<&Delivery> { self.deliveries.get(&key) }

    /// A transaction.
    #[must_use]
    pub fn transaction(&self, id: TransactionId) -> Option<&Transaction> {
        self.transactions.get(&id)
    }

    /// A transaction controller.
    #[must_use]
    pub fn controller(&self, id: ControllerId) -> Option<&Controller> { self.controllers.get(&id) }

    /// A transaction manager.
    #[must_use]
    pub fn manager(&self, id: ManagerId) -> Option<&Manager> { self.managers.get(&id) }

    /// Start the engine. Idempotent: later calls return the same connection
    /// and produce no output.
    ///
    /// # Errors
    /// Returns [`EngineError::Shutdown`] after shutdown.
    pub fn start(&mut self) -> Result<ConnectionId> {
        match self.state {
            EngineState::Shutdown => return Err(EngineError::Shutdown),
            EngineState::Idle => {
                self.state = EngineState::Starting;
                debug!("engine starting");
                self.state = EngineState::Started;
                self.push_event(Event::EngineStarted);
                self.dispatch();
            }
            EngineState::Starting | EngineState::Started | EngineState::Failed => {}
        }
        Ok(ConnectionId(0))
    }

    /// Fail the engine with a caller-supplied cause.
    ///
    /// The engine stops producing output and local close calls fail until
    /// [`Engine::shutdown`] is called. Has no effect once failed or shut down.
    pub fn engine_failed(&mut self, cause: impl Into<String>) -> EngineFailure {
        let failure = EngineFailure::Injected(cause.into());
        self.fail(failure.clone());
        self.dispatch();
        self.failure.clone().unwrap_or(failure)
    }

    /// Shut the engine down. Idempotent.
    ///
    /// The engine shutdown event fires exactly once; every endpoint that was
    /// not already closed by both ends receives an endpoint shutdown event.
    pub fn shutdown(&mut self) {
        if matches!(self.state, EngineState::Shutdown) {
            return;
        }
        debug!(state = ?self.state, "engine shutting down");
        self.state = EngineState::Shutdown;
        self.push_event(Event::EngineShutdown);

        if !self.connection_fully_closed() {
            self.push_event(Event::EndpointShutdown(Endpoint::Connection));
        }
        let sessions: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, session)| !session.is_fully_closed())
            .map(|(id, _)| *id)
            .collect();
        for id in sessions {
            self.push_event(Event::EndpointShutdown(Endpoint::Session(id)));
        }
        let links: Vec<LinkId> = self
            .links
            .iter()
            .filter(|(_, link)| !link.is_fully_closed())
            .map(|(id, _)| *id)
            .collect();
        for id in links {
            let endpoint = self.link_endpoint(id);
            self.push_event(Event::EndpointShutdown(endpoint));
        }
        self.dispatch();
    }

    /// Run a public operation and dispatch the events it raised.
    fn run<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let result = op(self);
        self.dispatch();
        result
    }

    const fn alloc_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id = id.wrapping_add(1);
        id
    }

    /// Record a failure; the first one wins.
    fn fail(&mut self, failure: EngineFailure) {
        if matches!(self.state, EngineState::Failed | EngineState::Shutdown) {
            return;
        }
        warn!(error = %failure, "engine failed");
        self.state = EngineState::Failed;
        self.failure = Some(failure.clone());
        self.push_event(Event::EngineFailed(failure));
    }

    /// Fail the engine and return the error to hand back to the caller.
    fn failed(&mut self, failure: EngineFailure) -> EngineError {
        self.fail(failure);
        self.failure_error()
    }

    fn failure_error(&self) -> EngineError {
        self.failure.clone().map_or(EngineError::Shutdown, EngineError::Failed)
    }

    /// Input may be processed.
    fn ensure_running(&self) -> Result<()> {
        match self.state {
            EngineState::Idle | EngineState::Starting => Err(EngineError::NotStarted),
            EngineState::Started => Ok(()),
            EngineState::Failed => Err(self.failure_error()),
            EngineState::Shutdown => Err(EngineError::Shutdown),
        }
    }

    /// Endpoints may be created or configured.
    fn ensure_usable(&self) -> Result<()> {
        match self.state {
            EngineState::Idle | EngineState::Starting | EngineState::Started => Ok(()),
            EngineState::Failed => Err(self.failure_error()),
            EngineState::Shutdown => Err(EngineError::Shutdown),
        }
    }

    /// Local close calls: `Ok(false)` after shutdown, where they complete as
    /// silent no-ops.
    fn ensure_closable(&self) -> Result<bool> {
        match self.state {
            EngineState::Failed => Err(self.failure_error()),
            EngineState::Shutdown => Ok(false),
            EngineState::Idle | EngineState::Starting | EngineState::Started => Ok(true),
        }
    }

    const fn connection_fully_closed(&self) -> bool {
        matches!(self.connection.local_state, EndpointState::Closed)
            && matches!(self.connection.remote_state, EndpointState::Closed)
    }

    /// Endpoint that receives a link's events.
    fn link_endpoint(&self, id: LinkId) -> Endpoint {
        match self.links.get(&id).map(|link| link.owner) {
            Some(LinkOwner::Controller(controller)) => Endpoint::Controller(controller),
            Some(LinkOwner::Manager(manager)) => Endpoint::Manager(manager),
            Some(LinkOwner::Plain) | None => Endpoint::Link(id),
        }
    }

    fn session_ref(&self, id: SessionId) -> Result<&Session> {
        self.sessions
            .get(&id)
            .ok_or_else(|| EngineError::invalid_arg(format!("unknown {id}")))
    }

    fn link_ref(&self, id: LinkId) -> Result<&Link> {
        self.links
            .get(&id)
            .ok_or_else(|| EngineError::invalid_arg(format!("unknown {id}")))
    }

    fn delivery_ref(&self, key: DeliveryKey) -> Result<&Delivery> {
        self.deliveries
            .get(&key)
            .ok_or_else(|| EngineError::invalid_arg(format!("unknown {key}")))
    }

    fn delivery_mut(&mut self, key: DeliveryKey) -> Result<&mut Delivery> {
        self.deliveries
            .get_mut(&key)
            .ok_or_else(|| EngineError::invalid_arg(format!("unknown {key}")))
    }
}
