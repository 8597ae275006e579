//! Session registry: the single owner of every live session and of the
//! connection <-> session mapping.
//!
//! The registry keeps three maps in step behind one mutex:
//! - `connection_to_session`: which session a connection drives
//! - `sessions`: the sessions themselves (sole owner)
//! - `session_to_connection`: where a session's frames go
//!
//! Once any public operation returns, a session id is in all three maps or in
//! none of them. The map lock only covers lookups and edits of the maps.
//! Every session sits behind a lock of its own, and solver work happens
//! under that lock alone, so a slow step holds up its own session and
//! nothing else. No code path waits for one kind of lock while holding the
//! other.
//!
//! Stepping runs as one job per session on the registry's worker pool:
//! - [`SessionRegistry::run_cycle`] steps each session and hands its frame to
//!   the connection as soon as that session is done. It stops waiting once
//!   its budget is spent; a step still running then is left to finish on its
//!   own, and later cycles skip the session until it has.
//! - [`SessionRegistry::tick`] and [`SessionRegistry::flush`] are the two
//!   halves of a cycle as separate operations.

use crate::session::{Lifecycle, Session, SessionError, SessionId, SESSION_TIMEOUT};
use crate::solver::{Backend, GridDims, SolverFactory};
use log::{debug, error, info, warn};
use protocol::transform::{FrameTransform, Identity};
use protocol::{encode, EncodeError, Encoder, Message, ServerErrorMessage};
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Client messages held for a session while a step has it locked.
const MAX_QUEUED_MESSAGES: usize = 64;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("failed to build solver worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

/// Why a session's outgoing messages could not be built. Fatal to the
/// session.
#[derive(Debug, Error)]
enum FlushError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Encode(#[from] EncodeError),
}

/// Identifier the network layer assigns to each accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Outbound side of a connection, as seen by the registry.
///
/// Messages are already encoded. The queue is bounded; when the registry
/// drops the last handle, the connection's writer closes the transport.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    outbound: mpsc::Sender<Vec<u8>>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, outbound: mpsc::Sender<Vec<u8>>) -> Self {
        Self { id, outbound }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queues an encoded message without waiting.
    pub fn try_send(&self, bytes: Vec<u8>) -> Result<(), TrySendError<Vec<u8>>> {
        self.outbound.try_send(bytes)
    }

    /// Encodes and queues an error report. Failures are only logged.
    pub fn send_error(&self, session_id: &str, message: &str) {
        let error = Message::ServerError(ServerErrorMessage {
            session_id: session_id.to_string(),
            message: message.to_string(),
        });
        match encode(&error) {
            Ok(bytes) => {
                if self.try_send(bytes).is_err() {
                    debug!("Connection {} could not take error report", self.id);
                }
            }
            Err(err) => error!("Failed to encode error report: {}", err),
        }
    }
}

/// Settings the registry applies to every session it creates.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub grid: GridDims,
    pub backend: Backend,
    pub session_timeout: Duration,
    /// Solver worker threads; 0 lets the pool pick one per core
    pub worker_threads: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            grid: GridDims::default(),
            backend: Backend::Cpu,
            session_timeout: SESSION_TIMEOUT,
            worker_threads: 0,
        }
    }
}

/// Step-phase outcome of a [`SessionRegistry::tick`] or cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Sessions that performed a solver step
    pub stepped: usize,
    /// Sessions removed for inactivity
    pub expired: usize,
    /// Sessions removed because they were closed after a failure
    pub closed: usize,
    /// Sessions skipped because an earlier step was still running
    pub busy: usize,
    /// Steps still running when the cycle stopped waiting
    pub unfinished: usize,
}

/// Broadcast-phase outcome of a [`SessionRegistry::flush`] or cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub frames_sent: usize,
    pub states_sent: usize,
    /// Messages left pending because the connection queue was full
    pub deferred: usize,
    /// Messages dropped because the connection is gone
    pub closed: usize,
    /// Sessions skipped because a step had them locked
    pub busy: usize,
    /// Sessions closed because their messages could not be built
    pub failed: usize,
}

impl FlushReport {
    fn merge(self, other: Self) -> Self {
        Self {
            frames_sent: self.frames_sent + other.frames_sent,
            states_sent: self.states_sent + other.states_sent,
            deferred: self.deferred + other.deferred,
            closed: self.closed + other.closed,
            busy: self.busy + other.busy,
            failed: self.failed + other.failed,
        }
    }
}

/// Outcome of one [`SessionRegistry::run_cycle`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub tick: TickReport,
    pub flush: FlushReport,
}

/// Point-in-time view of one session, for monitoring and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub lifecycle: Lifecycle,
    pub dims: Option<GridDims>,
    pub simulation_time: f64,
    pub has_new_frame: bool,
    pub paused: bool,
    pub speed: f32,
    pub connection: Option<ConnectionId>,
}

/// One session and what the registry needs to work on it outside the map
/// lock.
struct SessionSlot {
    session: Mutex<Session>,
    /// Client messages that arrived while the session was locked
    queued: Mutex<VecDeque<Message>>,
    /// Set while a step job for this session is pending or running
    stepping: AtomicBool,
}

impl SessionSlot {
    fn new(session: Session) -> Self {
        Self {
            session: Mutex::new(session),
            queued: Mutex::new(VecDeque::new()),
            stepping: AtomicBool::new(false),
        }
    }

    // A panicking solver step leaves the session usable, so poisoning is
    // ignored throughout.
    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The session, unless a step or another caller holds it.
    fn try_lock(&self) -> Option<MutexGuard<'_, Session>> {
        match self.session.try_lock() {
            Ok(session) => Some(session),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    /// Holds `message` until the session is free. False when the queue is
    /// full.
    fn queue(&self, message: Message) -> bool {
        let mut queued = self.queued.lock().unwrap_or_else(PoisonError::into_inner);
        if queued.len() >= MAX_QUEUED_MESSAGES {
            return false;
        }
        queued.push_back(message);
        true
    }

    /// Applies held messages in arrival order.
    fn apply_queued(&self, session: &mut Session) -> Result<(), SessionError> {
        let queued: Vec<Message> = self
            .queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        queued.iter().try_for_each(|message| apply(session, message))
    }
}

/// Clears a slot's stepping flag when its step job ends, panic or not.
struct SteppingGuard<'a>(&'a SessionSlot);

impl Drop for SteppingGuard<'_> {
    fn drop(&mut self) {
        self.0.stepping.store(false, Ordering::Release);
    }
}

/// A session's slot and connection, copied out of the maps.
#[derive(Clone)]
struct LiveSession {
    id: SessionId,
    slot: Arc<SessionSlot>,
    connection: Option<ConnectionHandle>,
}

/// What one step job did.
#[derive(Debug, Default)]
struct StepOutcome {
    stepped: bool,
    flush: FlushReport,
}

enum Reap {
    Expired,
    Closed,
}

#[derive(Default)]
struct RegistryState {
    connection_to_session: HashMap<ConnectionId, SessionId>,
    sessions: BTreeMap<SessionId, Arc<SessionSlot>>,
    session_to_connection: HashMap<SessionId, ConnectionHandle>,
}

/// Everything detached from the maps for one session. Dropped outside the
/// map lock so solver cleanup and transport shutdown don't stall other
/// callers.
struct Detached {
    session_id: SessionId,
    slot: Arc<SessionSlot>,
    connection: Option<ConnectionHandle>,
}

impl RegistryState {
    fn detach_connection(&mut self, connection: ConnectionId) -> Option<Detached> {
        let session_id = self.connection_to_session.remove(&connection)?;
        self.detach_session(&session_id)
    }

    fn detach_session(&mut self, session_id: &SessionId) -> Option<Detached> {
        let connection = self.session_to_connection.remove(session_id);
        if let Some(handle) = &connection {
            if self.connection_to_session.get(&handle.id()) == Some(session_id) {
                self.connection_to_session.remove(&handle.id());
            }
        }
        let slot = self.sessions.remove(session_id)?;
        Some(Detached {
            session_id: session_id.clone(),
            slot,
            connection,
        })
    }

    fn live(&self) -> Vec<LiveSession> {
        self.sessions
            .iter()
            .map(|(id, slot)| LiveSession {
                id: id.clone(),
                slot: Arc::clone(slot),
                connection: self.session_to_connection.get(id).cloned(),
            })
            .collect()
    }
}

/// Thread-safe owner of all sessions.
pub struct SessionRegistry {
    state: Mutex<RegistryState>,
    factory: Arc<dyn SolverFactory>,
    transform: Arc<dyn FrameTransform>,
    workers: rayon::ThreadPool,
    grid: GridDims,
    session_timeout: Duration,
}

impl SessionRegistry {
    /// Creates a registry using the configured built-in backend and no frame
    /// transform.
    pub fn new(config: RegistryConfig) -> Result<Self, RegistryError> {
        Self::with_parts(config.clone(), Arc::new(config.backend), Arc::new(Identity))
    }

    /// Creates a registry with an explicit solver factory and frame transform.
    pub fn with_parts(
        config: RegistryConfig,
        factory: Arc<dyn SolverFactory>,
        transform: Arc<dyn FrameTransform>,
    ) -> Result<Self, RegistryError> {
        let workers = rayon::ThreadPoolBuilder::new()
            .num_threads(config.worker_threads)
            .thread_name(|i| format!("solver-worker-{i}"))
            .panic_handler(|_| error!("Solver step panicked, session left as it was"))
            .build()?;

        info!(
            "Session registry ready: {} grid, {} backend, {} transform, {} workers",
            config.grid,
            factory.name(),
            transform.name(),
            workers.current_num_threads()
        );

        Ok(Self {
            state: Mutex::new(RegistryState::default()),
            factory,
            transform,
            workers,
            grid: config.grid,
            session_timeout: config.session_timeout,
        })
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates and initializes a session for `connection` and binds the two.
    ///
    /// The solver is initialized before the lock is taken. A connection that
    /// already had a session loses it.
    pub fn create_session(&self, connection: ConnectionHandle) -> Result<SessionId, RegistryError> {
        let mut rng = rand::thread_rng();
        let mut session = Session::with_timeout(SessionId::generate(&mut rng), self.session_timeout);
        session.initialize(self.factory.create(), self.grid)?;

        let connection_id = connection.id();
        let (session_id, replaced) = {
            let mut state = self.lock();
            while state.sessions.contains_key(session.id()) {
                warn!("Session id collision on {}, regenerating", session.id());
                session.reassign_id(SessionId::generate(&mut rng));
            }
            let replaced = state.detach_connection(connection_id);

            let session_id = session.id().clone();
            state
                .connection_to_session
                .insert(connection_id, session_id.clone());
            state
                .session_to_connection
                .insert(session_id.clone(), connection);
            state
                .sessions
                .insert(session_id.clone(), Arc::new(SessionSlot::new(session)));
            (session_id, replaced)
        };

        if let Some(old) = replaced {
            info!(
                "Connection {} replaced session {}",
                connection_id, old.session_id
            );
        }
        info!(
            "Session {} created for connection {} ({} grid)",
            session_id, connection_id, self.grid
        );
        Ok(session_id)
    }

    /// Removes the session bound to `connection`. Unknown connections are a
    /// no-op. The solver is released once no step is using it.
    pub fn remove_session(&self, connection: ConnectionId) -> Option<SessionId> {
        let detached = self.lock().detach_connection(connection)?;
        info!(
            "Session {} removed for connection {}",
            detached.session_id, connection
        );
        Some(detached.session_id)
    }

    pub fn lookup_session(&self, connection: ConnectionId) -> Option<SessionId> {
        self.lock().connection_to_session.get(&connection).cloned()
    }

    /// Routes a decoded client message to its session.
    ///
    /// Never waits on a running step: a session that is busy gets the message
    /// queued and applied before its next step. Returns false when the
    /// session is unknown, the message is not a client message or the queue
    /// is full. A reset that fails to re-initialize the solver reports a
    /// `ServerError` to the client and removes the session.
    pub fn dispatch(&self, session_id: &SessionId, message: &Message) -> bool {
        if !message.is_client_message() {
            debug!(
                "Session {} sent server-only message {:?}, ignoring",
                session_id,
                message.message_type()
            );
            return false;
        }
        let Some(slot) = self.lock().sessions.get(session_id).cloned() else {
            debug!("Dropping message for unknown session {}", session_id);
            return false;
        };

        let result = match slot.try_lock() {
            Some(mut session) => slot
                .apply_queued(&mut session)
                .and_then(|()| apply(&mut session, message)),
            None => {
                if slot.queue(message.clone()) {
                    return true;
                }
                warn!(
                    "Session {} is busy and its queue is full, dropping {:?}",
                    session_id,
                    message.message_type()
                );
                return false;
            }
        };

        if let Err(err) = result {
            let detached = self.lock().detach_session(session_id);
            error!("Session {} failed and was removed: {}", session_id, err);
            if let Some(connection) = detached.as_ref().and_then(|d| d.connection.as_ref()) {
                connection.send_error(session_id.as_str(), &err.to_string());
            }
        }
        true
    }

    /// Runs the step phase on its own: every session is scheduled and, if
    /// due, stepped once. Waits for all steps, then sweeps.
    pub fn tick(&self) -> TickReport {
        self.tick_at(Instant::now())
    }

    /// [`SessionRegistry::tick`] with an explicit clock.
    ///
    /// Sessions idle past their timeout, and sessions closed after a failure,
    /// are purged from all maps, which also closes their connection.
    pub fn tick_at(&self, now: Instant) -> TickReport {
        self.advance(now, None, None).tick
    }

    /// Runs the broadcast phase on its own.
    ///
    /// Hands each session's pending announcement and frame to its
    /// connection. A session's state announcement always goes out before its
    /// next frame. Nothing is cleared unless the connection accepted it; a
    /// full queue leaves the message pending for the next cycle. Sessions
    /// locked by a running step are skipped.
    pub fn flush(&self) -> FlushReport {
        let live = self.lock().live();
        let transform = self.transform.as_ref();
        self.workers.install(|| {
            live.par_iter()
                .map(|entry| {
                    let mut report = FlushReport::default();
                    match (&entry.connection, entry.slot.try_lock()) {
                        (Some(connection), Some(mut session)) => {
                            flush_session(&entry.id, &mut session, connection, transform, &mut report)
                        }
                        (Some(_), None) => report.busy += 1,
                        (None, _) => {}
                    }
                    report
                })
                .reduce(FlushReport::default, FlushReport::merge)
        })
    }

    /// One update/broadcast cycle: steps every session and flushes each one as
    /// soon as its own step is done.
    ///
    /// Returns after every step finished or `budget` ran out, whichever is
    /// first. Steps still running by then finish and flush in the
    /// background.
    pub fn run_cycle(&self, budget: Duration) -> CycleReport {
        self.run_cycle_at(Instant::now(), budget)
    }

    pub fn run_cycle_at(&self, now: Instant, budget: Duration) -> CycleReport {
        self.advance(now, Some(budget), Some(Arc::clone(&self.transform)))
    }

    /// Spawns one step job per idle session, waits for them up to `budget`,
    /// then sweeps. With a transform, each job also flushes its session.
    fn advance(
        &self,
        now: Instant,
        budget: Option<Duration>,
        transform: Option<Arc<dyn FrameTransform>>,
    ) -> CycleReport {
        let live = self.lock().live();
        let mut report = CycleReport::default();
        let (done_tx, done_rx) = std_mpsc::channel::<StepOutcome>();
        let mut pending = 0;

        for entry in &live {
            if entry.slot.stepping.swap(true, Ordering::AcqRel) {
                report.tick.busy += 1;
                continue;
            }
            pending += 1;
            let entry = entry.clone();
            let transform = transform.clone();
            let done = done_tx.clone();
            self.workers.spawn(move || {
                let outcome = {
                    let _stepping = SteppingGuard(&entry.slot);
                    step_session(&entry, now, transform.as_deref())
                };
                drop(entry);
                // Nobody listens once the cycle stopped waiting
                let _ = done.send(outcome);
            });
        }
        drop(done_tx);

        let deadline = budget.map(|budget| Instant::now() + budget);
        while pending > 0 {
            let received = match deadline {
                Some(deadline) => done_rx
                    .recv_timeout(deadline.saturating_duration_since(Instant::now()))
                    .ok(),
                None => done_rx.recv().ok(),
            };
            let Some(outcome) = received else {
                break;
            };
            pending -= 1;
            report.tick.stepped += usize::from(outcome.stepped);
            report.flush = report.flush.merge(outcome.flush);
        }
        report.tick.unfinished = pending;

        self.sweep(&live, now, &mut report.tick);
        report
    }

    /// Removes sessions that timed out or were closed after a failure.
    /// Sessions a step still holds are left for a later sweep.
    fn sweep(&self, live: &[LiveSession], now: Instant, report: &mut TickReport) {
        let reapable: Vec<(&SessionId, Reap)> = live
            .iter()
            .filter_map(|entry| {
                let session = entry.slot.try_lock()?;
                if session.lifecycle().is_terminal() {
                    Some((&entry.id, Reap::Closed))
                } else if session.is_expired_at(now) {
                    Some((&entry.id, Reap::Expired))
                } else {
                    None
                }
            })
            .collect();
        if reapable.is_empty() {
            return;
        }

        let removed: Vec<(Detached, Reap)> = {
            let mut state = self.lock();
            reapable
                .into_iter()
                .filter_map(|(id, reap)| state.detach_session(id).map(|d| (d, reap)))
                .collect()
        };

        for (detached, reap) in &removed {
            match reap {
                Reap::Expired => {
                    info!("Session {} expired after inactivity", detached.session_id);
                    detached.slot.lock().expire();
                    report.expired += 1;
                }
                Reap::Closed => {
                    info!("Session {} closed after a failure, removed", detached.session_id);
                    report.closed += 1;
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().sessions.is_empty()
    }

    /// Number of connections bound to a session.
    pub fn connection_count(&self) -> usize {
        self.lock().connection_to_session.len()
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.lock().sessions.keys().cloned().collect()
    }

    /// Waits for the session if a step is running on it.
    pub fn session_snapshot(&self, session_id: &SessionId) -> Option<SessionSnapshot> {
        let (slot, connection) = {
            let state = self.lock();
            let slot = Arc::clone(state.sessions.get(session_id)?);
            let connection = state
                .session_to_connection
                .get(session_id)
                .map(ConnectionHandle::id);
            (slot, connection)
        };
        let session = slot.lock();
        Some(SessionSnapshot {
            id: session_id.clone(),
            lifecycle: session.lifecycle(),
            dims: session.dims(),
            simulation_time: session.simulation_time(),
            has_new_frame: session.has_new_frame(),
            paused: session.is_paused(),
            speed: session.speed(),
            connection,
        })
    }

    /// Verifies that the three maps describe the same set of bindings.
    pub fn check_consistency(&self) -> Result<(), String> {
        let state = self.lock();
        let sizes = (
            state.connection_to_session.len(),
            state.sessions.len(),
            state.session_to_connection.len(),
        );
        if sizes.0 != sizes.1 || sizes.1 != sizes.2 {
            return Err(format!(
                "map sizes differ: {} connections, {} sessions, {} handles",
                sizes.0, sizes.1, sizes.2
            ));
        }
        for (connection, session_id) in &state.connection_to_session {
            if !state.sessions.contains_key(session_id) {
                return Err(format!(
                    "connection {connection} points at missing session {session_id}"
                ));
            }
            match state.session_to_connection.get(session_id) {
                Some(handle) if handle.id() == *connection => {}
                Some(handle) => {
                    return Err(format!(
                        "session {session_id} bound to {} but reached from {connection}",
                        handle.id()
                    ))
                }
                None => return Err(format!("session {session_id} has no connection")),
            }
        }
        Ok(())
    }
}

fn apply(session: &mut Session, message: &Message) -> Result<(), SessionError> {
    match message {
        Message::ClientInput(input) => {
            session.handle_input(input.x, input.y, input.z, input.value);
            Ok(())
        }
        Message::ClientControl(control) => session.handle_control(control),
        _ => Ok(()),
    }
}

/// Body of one step job. Runs under the session's lock only.
fn step_session(
    entry: &LiveSession,
    now: Instant,
    transform: Option<&dyn FrameTransform>,
) -> StepOutcome {
    let mut outcome = StepOutcome::default();
    let mut session = entry.slot.lock();

    if let Err(err) = entry.slot.apply_queued(&mut session) {
        // A failed reset already closed the session; the sweep removes it
        error!("Session {} failed: {}", entry.id, err);
        if let Some(connection) = &entry.connection {
            connection.send_error(entry.id.as_str(), &err.to_string());
        }
        return outcome;
    }

    session.schedule(now);
    outcome.stepped = session.update_at(now);

    if let (Some(transform), Some(connection)) = (transform, &entry.connection) {
        flush_session(&entry.id, &mut session, connection, transform, &mut outcome.flush);
    }
    outcome
}

fn flush_session(
    session_id: &SessionId,
    session: &mut Session,
    connection: &ConnectionHandle,
    transform: &dyn FrameTransform,
    report: &mut FlushReport,
) {
    if let Err(err) = try_flush_session(session_id, session, connection, transform, report) {
        fail_session(session_id, session, connection, &err, report);
    }
}

fn try_flush_session(
    session_id: &SessionId,
    session: &mut Session,
    connection: &ConnectionHandle,
    transform: &dyn FrameTransform,
    report: &mut FlushReport,
) -> Result<(), FlushError> {
    if let Some(state) = session.pending_state() {
        let bytes = encode(&Message::ServerState(state))?;
        if !deliver(connection, bytes, report) {
            // The frame must not overtake the announcement
            return Ok(());
        }
        session.mark_state_sent();
        report.states_sent += 1;
    }

    if session.has_new_frame() {
        let bytes = encode_frame(session_id, session, transform)?;
        if deliver(connection, bytes, report) {
            session.mark_frame_sent();
            report.frames_sent += 1;
        }
    }
    Ok(())
}

/// Closes a session whose messages cannot be built and tells the client.
/// The next sweep removes it from the maps.
fn fail_session(
    session_id: &SessionId,
    session: &mut Session,
    connection: &ConnectionHandle,
    err: &FlushError,
    report: &mut FlushReport,
) {
    error!("Session {} closed: {}", session_id, err);
    session.close();
    connection.send_error(session_id.as_str(), &err.to_string());
    report.failed += 1;
}

/// Builds an encoded `ServerFrame` with one fallible allocation. With the
/// identity transform the field data is written straight into it.
fn encode_frame(
    session_id: &SessionId,
    session: &mut Session,
    transform: &dyn FrameTransform,
) -> Result<Vec<u8>, FlushError> {
    let sim_time = session.simulation_time();
    let mut encoder = Encoder::new();

    if transform.is_identity() {
        let capacity = session.frame_len();
        encoder.encode_frame_with(session_id.as_str(), sim_time, capacity, |out| {
            session.write_frame(out).map(drop).map_err(FlushError::from)
        })?;
    } else {
        let payload = transform.transform(session.frame_data()?);
        encoder.encode_frame_with(session_id.as_str(), sim_time, payload.len(), |out| {
            out.extend_from_slice(&payload);
            Ok::<_, FlushError>(())
        })?;
    }
    Ok(encoder.take())
}

/// Hands `bytes` to the connection without waiting. Returns whether it was
/// accepted.
fn deliver(connection: &ConnectionHandle, bytes: Vec<u8>, report: &mut FlushReport) -> bool {
    match connection.try_send(bytes) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            report.deferred += 1;
            false
        }
        Err(TrySendError::Closed(_)) => {
            report.closed += 1;
            false
        }
    }
}
