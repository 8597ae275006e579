//! One client's simulation instance and its lifecycle flags.
//!
//! A session moves through `Created -> Active -> (Expired | Closed)`. It
//! becomes `Active` once its solver is initialized with explicit grid
//! dimensions; once terminal, every operation on it is a no-op.
//!
//! Two flags tie the session to the tick cycle:
//! - `needs_update` is raised by [`Session::schedule`] according to the
//!   session's speed and consumed by [`Session::update`], which performs
//!   exactly one solver step.
//! - `has_new_frame` is raised by that step and cleared only by
//!   [`Session::mark_frame_sent`], after the frame has been queued for
//!   transmission.

use crate::solver::{try_zeroed, FieldSolver, GridDims, SolverError};
use log::{debug, warn};
use protocol::{ClientControlMessage, ControlKind, ServerStateMessage};
use rand::Rng;
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Idle time after which a session is swept by the registry.
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("solver initialization failed: {0}")]
    Solver(#[from] SolverError),

    #[error("failed to allocate {bytes} bytes of frame buffers")]
    Allocation { bytes: usize },
}

/// 128-bit random session identifier rendered as 32 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        SessionId(format!("{:032x}", rng.gen::<u128>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        SessionId(id.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Created,
    Active,
    Expired,
    Closed,
}

impl Lifecycle {
    pub fn is_terminal(self) -> bool {
        matches!(self, Lifecycle::Expired | Lifecycle::Closed)
    }
}

/// A client's isolated simulation.
pub struct Session {
    id: SessionId,
    lifecycle: Lifecycle,
    dims: Option<GridDims>,
    solver: Option<Box<dyn FieldSolver>>,
    /// Last electric field snapshot pulled from the solver
    electric: Vec<f32>,
    /// Last magnetic field snapshot pulled from the solver
    magnetic: Vec<f32>,
    has_new_frame: bool,
    needs_update: bool,
    last_activity: Instant,
    timeout: Duration,
    paused: bool,
    /// Steps per tick, in `[0, 1]`
    speed: f32,
    cadence: f32,
    state_pending: bool,
}

impl Session {
    pub fn new(id: SessionId) -> Self {
        Self::with_timeout(id, SESSION_TIMEOUT)
    }

    pub fn with_timeout(id: SessionId, timeout: Duration) -> Self {
        Self {
            id,
            lifecycle: Lifecycle::Created,
            dims: None,
            solver: None,
            electric: Vec::new(),
            magnetic: Vec::new(),
            has_new_frame: false,
            needs_update: false,
            last_activity: Instant::now(),
            timeout,
            paused: false,
            speed: 1.0,
            cadence: 0.0,
            state_pending: false,
        }
    }

    /// Initializes `solver` for `dims` and takes ownership of it.
    ///
    /// On success the session is `Active` and has a state announcement
    /// pending. Only valid on a `Created` session; otherwise a no-op.
    pub fn initialize(
        &mut self,
        mut solver: Box<dyn FieldSolver>,
        dims: GridDims,
    ) -> Result<(), SessionError> {
        if self.lifecycle != Lifecycle::Created {
            return Ok(());
        }

        solver.initialize(dims)?;
        let (electric, magnetic) = match allocate_snapshots(dims) {
            Ok(buffers) => buffers,
            Err(err) => {
                solver.cleanup();
                return Err(err);
            }
        };

        self.solver = Some(solver);
        self.electric = electric;
        self.magnetic = magnetic;
        self.dims = Some(dims);
        self.lifecycle = Lifecycle::Active;
        self.state_pending = true;
        self.last_activity = Instant::now();
        Ok(())
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn is_active(&self) -> bool {
        self.lifecycle == Lifecycle::Active
    }

    pub fn dims(&self) -> Option<GridDims> {
        self.dims
    }

    pub fn has_new_frame(&self) -> bool {
        self.has_new_frame
    }

    pub fn needs_update(&self) -> bool {
        self.needs_update
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn speed(&self) -> f32 {
        self.speed
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn simulation_time(&self) -> f64 {
        self.solver.as_ref().map_or(0.0, |solver| solver.time())
    }

    /// Forwards a perturbation at normalized `(x, y, z)` to the solver.
    pub fn handle_input(&mut self, x: f32, y: f32, z: f32, value: f32) {
        self.handle_input_at(x, y, z, value, Instant::now());
    }

    pub fn handle_input_at(&mut self, x: f32, y: f32, z: f32, value: f32, now: Instant) {
        if !self.is_active() {
            return;
        }
        let (Some(solver), Some(dims)) = (self.solver.as_mut(), self.dims) else {
            return;
        };
        solver.add_source(dims.grid_point(x, y, z), value);
        self.last_activity = now;
    }

    /// Applies a control message. Fails only when a reset cannot
    /// re-initialize the solver, which leaves the session unusable.
    pub fn handle_control(&mut self, control: &ClientControlMessage) -> Result<(), SessionError> {
        self.handle_control_at(control, Instant::now())
    }

    pub fn handle_control_at(
        &mut self,
        control: &ClientControlMessage,
        now: Instant,
    ) -> Result<(), SessionError> {
        if !self.is_active() {
            return Ok(());
        }
        self.last_activity = now;

        match control.kind {
            ControlKind::Pause => self.paused = true,
            ControlKind::Resume => self.paused = false,
            ControlKind::SetSpeed => {
                if control.parameter.is_finite() {
                    self.speed = control.parameter.clamp(0.0, 1.0);
                    debug!("Session {} speed set to {}", self.id, self.speed);
                } else {
                    warn!(
                        "Session {} ignoring non-finite speed {}",
                        self.id, control.parameter
                    );
                }
            }
            ControlKind::Reset => self.reset()?,
        }
        Ok(())
    }

    fn reset(&mut self) -> Result<(), SessionError> {
        let (Some(solver), Some(dims)) = (self.solver.as_mut(), self.dims) else {
            return Ok(());
        };
        solver.cleanup();
        if let Err(err) = solver.initialize(dims) {
            self.close();
            return Err(err.into());
        }
        self.has_new_frame = false;
        self.needs_update = false;
        self.cadence = 0.0;
        self.state_pending = true;
        Ok(())
    }

    /// Decides whether the next `update` should step, based on speed and pause
    /// state. Sessions past their idle window are left for the sweep.
    pub fn schedule(&mut self, now: Instant) {
        if !self.is_active() || self.paused || self.is_expired_at(now) {
            return;
        }
        self.cadence += self.speed;
        if self.cadence >= 1.0 {
            self.cadence -= 1.0;
            self.needs_update = true;
        }
    }

    /// Performs one solver step if one is due. Returns whether it stepped.
    pub fn update(&mut self) -> bool {
        self.update_at(Instant::now())
    }

    pub fn update_at(&mut self, now: Instant) -> bool {
        if !self.is_active() || !self.needs_update {
            return false;
        }
        self.needs_update = false;
        let Some(solver) = self.solver.as_mut() else {
            return false;
        };
        solver.step();
        self.has_new_frame = true;
        self.last_activity = now;
        true
    }

    /// Appends the pending frame to `out` as electric then magnetic field
    /// bytes and returns how many bytes were written, 0 when there is nothing
    /// to send. Growing `out` is fallible.
    ///
    /// Does not clear the pending flag; see [`Session::mark_frame_sent`].
    pub fn write_frame(&mut self, out: &mut Vec<u8>) -> Result<usize, SessionError> {
        if !self.is_active() || !self.has_new_frame {
            return Ok(0);
        }
        let Some(solver) = self.solver.as_ref() else {
            return Ok(0);
        };
        solver.electric_field(&mut self.electric);
        solver.magnetic_field(&mut self.magnetic);

        let bytes = (self.electric.len() + self.magnetic.len()) * std::mem::size_of::<f32>();
        out.try_reserve(bytes)
            .map_err(|_| SessionError::Allocation { bytes })?;
        for value in self.electric.iter().chain(&self.magnetic) {
            out.extend_from_slice(&value.to_le_bytes());
        }
        Ok(bytes)
    }

    /// The pending frame in a buffer of its own; empty when there is nothing
    /// to send.
    pub fn frame_data(&mut self) -> Result<Vec<u8>, SessionError> {
        let mut bytes = Vec::new();
        self.write_frame(&mut bytes)?;
        Ok(bytes)
    }

    /// Size of a full frame for this session's grid.
    pub fn frame_len(&self) -> usize {
        self.dims.map_or(0, |dims| dims.frame_bytes())
    }

    /// Clears the pending frame. Call only once the frame has been queued.
    pub fn mark_frame_sent(&mut self) {
        self.has_new_frame = false;
    }

    /// The `ServerState` announcement waiting to be sent, if any. Stays
    /// pending until [`Session::mark_state_sent`].
    pub fn pending_state(&self) -> Option<ServerStateMessage> {
        if !self.is_active() || !self.state_pending {
            return None;
        }
        let dims = self.dims?;
        Some(ServerStateMessage {
            session_id: self.id.to_string(),
            time: self.simulation_time() as f32,
            width: dims.width() as i32,
            height: dims.height() as i32,
            depth: dims.depth() as i32,
        })
    }

    pub fn mark_state_sent(&mut self) {
        self.state_pending = false;
    }

    /// Replaces the id of a session that has not been registered yet.
    pub(crate) fn reassign_id(&mut self, id: SessionId) {
        self.id = id;
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.lifecycle == Lifecycle::Expired
            || now.saturating_duration_since(self.last_activity) > self.timeout
    }

    /// Marks the session expired and releases its solver.
    pub fn expire(&mut self) {
        self.shutdown(Lifecycle::Expired);
    }

    /// Marks the session closed and releases its solver.
    pub fn close(&mut self) {
        self.shutdown(Lifecycle::Closed);
    }

    fn shutdown(&mut self, terminal: Lifecycle) {
        if self.lifecycle.is_terminal() {
            return;
        }
        self.lifecycle = terminal;
        if let Some(mut solver) = self.solver.take() {
            solver.cleanup();
        }
        self.electric = Vec::new();
        self.magnetic = Vec::new();
        self.has_new_frame = false;
        self.needs_update = false;
        self.state_pending = false;
    }

    #[cfg(test)]
    pub(crate) fn set_last_activity(&mut self, at: Instant) {
        self.last_activity = at;
    }
}

fn allocate_snapshots(dims: GridDims) -> Result<(Vec<f32>, Vec<f32>), SessionError> {
    let to_session_error = |err| match err {
        SolverError::Allocation { bytes } => SessionError::Allocation { bytes },
        other => SessionError::Solver(other),
    };
    let electric = try_zeroed(dims.components()).map_err(to_session_error)?;
    let magnetic = try_zeroed(dims.components()).map_err(to_session_error)?;
    Ok((electric, magnetic))
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("lifecycle", &self.lifecycle)
            .field("dims", &self.dims)
            .field("has_new_frame", &self.has_new_frame)
            .field("needs_update", &self.needs_update)
            .field("paused", &self.paused)
            .field("speed", &self.speed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::{Backend, GridPoint, SolverFactory};
    use std::sync::{Arc, Mutex};

    /// Calls observed by a [`Recorder`] solver.
    #[derive(Debug, Default)]
    pub(crate) struct Calls {
        pub steps: usize,
        pub sources: Vec<(GridPoint, f32)>,
        pub initializations: usize,
        pub cleanups: usize,
    }

    /// Solver that records every call and reports constant fields.
    pub(crate) struct Recorder {
        pub calls: Arc<Mutex<Calls>>,
        dims: Option<GridDims>,
        time: f64,
    }

    impl Recorder {
        pub fn new() -> (Self, Arc<Mutex<Calls>>) {
            let calls = Arc::new(Mutex::new(Calls::default()));
            let recorder = Recorder {
                calls: Arc::clone(&calls),
                dims: None,
                time: 0.0,
            };
            (recorder, calls)
        }
    }

    impl FieldSolver for Recorder {
        fn initialize(&mut self, dims: GridDims) -> Result<(), SolverError> {
            self.dims = Some(dims);
            self.time = 0.0;
            self.calls.lock().unwrap().initializations += 1;
            Ok(())
        }

        fn step(&mut self) {
            self.time += 1.0;
            self.calls.lock().unwrap().steps += 1;
        }

        fn add_source(&mut self, at: GridPoint, value: f32) {
            self.calls.lock().unwrap().sources.push((at, value));
        }

        fn electric_field(&self, out: &mut Vec<f32>) {
            out.clear();
            out.resize(self.dims.map_or(0, |d| d.components()), 1.0);
        }

        fn magnetic_field(&self, out: &mut Vec<f32>) {
            out.clear();
            out.resize(self.dims.map_or(0, |d| d.components()), 2.0);
        }

        fn time(&self) -> f64 {
            self.time
        }

        fn cleanup(&mut self) {
            self.dims = None;
            self.calls.lock().unwrap().cleanups += 1;
        }
    }

    fn active_session(edge: u32) -> (Session, Arc<Mutex<Calls>>) {
        let (recorder, calls) = Recorder::new();
        let mut session = Session::new(SessionId::from("test"));
        session
            .initialize(Box::new(recorder), GridDims::cube(edge).unwrap())
            .unwrap();
        (session, calls)
    }

    fn control(kind: ControlKind, parameter: f32) -> ClientControlMessage {
        ClientControlMessage { kind, parameter }
    }

    #[test]
    fn test_session_id_format() {
        let mut rng = rand::thread_rng();
        let id = SessionId::generate(&mut rng);
        assert_eq!(id.as_str().len(), 32);
        assert!(id
            .as_str()
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(id, SessionId::generate(&mut rng));
    }

    #[test]
    fn test_new_session_is_created() {
        let mut session = Session::new(SessionId::from("fresh"));
        assert_eq!(session.lifecycle(), Lifecycle::Created);
        assert!(session.frame_data().unwrap().is_empty());
        assert!(session.pending_state().is_none());
    }

    #[test]
    fn test_initialize_activates() {
        let (mut session, calls) = active_session(4);
        assert_eq!(session.lifecycle(), Lifecycle::Active);
        assert_eq!(session.dims(), Some(GridDims::cube(4).unwrap()));
        assert_eq!(calls.lock().unwrap().initializations, 1);

        let state = session.pending_state().unwrap();
        assert_eq!((state.width, state.height, state.depth), (4, 4, 4));
        assert_eq!(state.session_id, "test");
        assert!(session.pending_state().is_some());
        session.mark_state_sent();
        assert!(session.pending_state().is_none());
    }

    #[test]
    fn test_initialize_failure_keeps_session_created() {
        struct Broken;
        impl FieldSolver for Broken {
            fn initialize(&mut self, _dims: GridDims) -> Result<(), SolverError> {
                Err(SolverError::BackendUnavailable("no device".to_string()))
            }
            fn step(&mut self) {}
            fn add_source(&mut self, _at: GridPoint, _value: f32) {}
            fn electric_field(&self, out: &mut Vec<f32>) {
                out.clear();
            }
            fn magnetic_field(&self, out: &mut Vec<f32>) {
                out.clear();
            }
            fn time(&self) -> f64 {
                0.0
            }
            fn cleanup(&mut self) {}
        }

        let mut session = Session::new(SessionId::from("broken"));
        let err = session
            .initialize(Box::new(Broken), GridDims::cube(2).unwrap())
            .unwrap_err();
        assert!(matches!(err, SessionError::Solver(_)));
        assert_eq!(session.lifecycle(), Lifecycle::Created);
    }

    #[test]
    fn test_handle_input_floors_coordinates() {
        let (mut session, calls) = active_session(128);
        session.handle_input(0.5, 0.25, 0.999, 3.0);

        let calls = calls.lock().unwrap();
        assert_eq!(calls.sources.len(), 1);
        assert_eq!(calls.sources[0].0, GridPoint { x: 64, y: 32, z: 127 });
        assert_eq!(calls.sources[0].1, 3.0);
    }

    #[test]
    fn test_handle_input_forwards_out_of_range() {
        let (mut session, calls) = active_session(10);
        session.handle_input(1.5, -0.5, 0.0, 1.0);
        assert_eq!(
            calls.lock().unwrap().sources[0].0,
            GridPoint { x: 15, y: -5, z: 0 }
        );
    }

    #[test]
    fn test_update_steps_only_when_scheduled() {
        let (mut session, calls) = active_session(2);
        session.update();
        assert_eq!(calls.lock().unwrap().steps, 0);
        assert!(!session.has_new_frame());

        session.schedule(Instant::now());
        assert!(session.needs_update());
        assert!(session.update());
        assert_eq!(calls.lock().unwrap().steps, 1);
        assert!(session.has_new_frame());
        assert!(!session.needs_update());

        // A second update without scheduling does nothing
        assert!(!session.update());
        assert_eq!(calls.lock().unwrap().steps, 1);
    }

    #[test]
    fn test_frame_data_delivery_contract() {
        let (mut session, _) = active_session(2);
        assert!(session.frame_data().unwrap().is_empty());

        session.schedule(Instant::now());
        session.update();

        let frame = session.frame_data().unwrap();
        assert_eq!(frame.len(), GridDims::cube(2).unwrap().frame_bytes());
        // Electric field first, then magnetic
        assert_eq!(&frame[..4], &1.0f32.to_le_bytes());
        assert_eq!(&frame[frame.len() - 4..], &2.0f32.to_le_bytes());

        // Still pending until marked sent
        assert!(!session.frame_data().unwrap().is_empty());
        assert_eq!(session.frame_len(), frame.len());
        session.mark_frame_sent();
        assert!(session.frame_data().unwrap().is_empty());
    }

    #[test]
    fn test_write_frame_appends_after_existing_bytes() {
        let (mut session, _) = active_session(2);
        session.schedule(Instant::now());
        session.update();

        let mut out = vec![0xaa, 0xbb];
        let written = session.write_frame(&mut out).unwrap();

        assert_eq!(written, GridDims::cube(2).unwrap().frame_bytes());
        assert_eq!(out.len(), 2 + written);
        assert_eq!(&out[..2], &[0xaa, 0xbb]);
        assert_eq!(&out[2..6], &1.0f32.to_le_bytes());
        assert!(session.has_new_frame());
    }

    #[test]
    fn test_pause_and_resume() {
        let (mut session, calls) = active_session(2);
        session.handle_control(&control(ControlKind::Pause, 0.0)).unwrap();
        session.schedule(Instant::now());
        session.update();
        assert_eq!(calls.lock().unwrap().steps, 0);

        session.handle_control(&control(ControlKind::Resume, 0.0)).unwrap();
        session.schedule(Instant::now());
        session.update();
        assert_eq!(calls.lock().unwrap().steps, 1);
    }

    #[test]
    fn test_set_speed_controls_cadence() {
        let (mut session, calls) = active_session(2);
        session
            .handle_control(&control(ControlKind::SetSpeed, 0.5))
            .unwrap();

        for _ in 0..4 {
            session.schedule(Instant::now());
            session.update();
        }
        assert_eq!(calls.lock().unwrap().steps, 2);
    }

    #[test]
    fn test_set_speed_clamps_and_rejects_nan() {
        let (mut session, _) = active_session(2);
        session
            .handle_control(&control(ControlKind::SetSpeed, 7.0))
            .unwrap();
        assert_eq!(session.speed(), 1.0);
        session
            .handle_control(&control(ControlKind::SetSpeed, -1.0))
            .unwrap();
        assert_eq!(session.speed(), 0.0);
        session
            .handle_control(&control(ControlKind::SetSpeed, f32::NAN))
            .unwrap();
        assert_eq!(session.speed(), 0.0);
    }

    #[test]
    fn test_reset_reinitializes_and_discards_frame() {
        let (mut session, calls) = active_session(2);
        session.mark_state_sent();
        session.schedule(Instant::now());
        session.update();
        assert!(session.has_new_frame());

        session.handle_control(&control(ControlKind::Reset, 0.0)).unwrap();

        assert!(!session.has_new_frame());
        assert_eq!(session.simulation_time(), 0.0);
        assert!(session.pending_state().is_some());
        let calls = calls.lock().unwrap();
        assert_eq!(calls.initializations, 2);
        assert_eq!(calls.cleanups, 1);
    }

    #[test]
    fn test_expiry_window() {
        let (mut session, _) = active_session(2);
        let now = Instant::now();
        session.set_last_activity(now);

        assert!(!session.is_expired_at(now + SESSION_TIMEOUT));
        assert!(session.is_expired_at(now + SESSION_TIMEOUT + Duration::from_secs(1)));
    }

    #[test]
    fn test_expired_session_is_not_scheduled() {
        let (mut session, calls) = active_session(2);
        let now = Instant::now();
        session.set_last_activity(now);
        let later = now + SESSION_TIMEOUT + Duration::from_secs(1);

        session.schedule(later);
        session.update_at(later);
        assert_eq!(calls.lock().unwrap().steps, 0);
    }

    #[test]
    fn test_update_refreshes_activity() {
        let (mut session, _) = active_session(2);
        let later = Instant::now() + Duration::from_secs(60);
        session.schedule(later);
        session.update_at(later);
        assert_eq!(session.last_activity(), later);
    }

    #[test]
    fn test_terminal_session_ignores_everything() {
        let (mut session, calls) = active_session(2);
        session.close();
        assert_eq!(session.lifecycle(), Lifecycle::Closed);
        assert_eq!(calls.lock().unwrap().cleanups, 1);

        session.handle_input(0.5, 0.5, 0.5, 1.0);
        session.schedule(Instant::now());
        session.update();
        session.expire();

        assert_eq!(session.lifecycle(), Lifecycle::Closed);
        assert!(session.frame_data().unwrap().is_empty());
        let calls = calls.lock().unwrap();
        assert!(calls.sources.is_empty());
        assert_eq!(calls.steps, 0);
        assert_eq!(calls.cleanups, 1);
    }

    #[test]
    fn test_drop_cleans_up_solver() {
        let (session, calls) = active_session(2);
        drop(session);
        assert_eq!(calls.lock().unwrap().cleanups, 1);
    }

    #[test]
    fn test_works_with_builtin_backend() {
        let mut session = Session::new(SessionId::from("cpu"));
        let dims = GridDims::cube(6).unwrap();
        session.initialize(Backend::Cpu.create(), dims).unwrap();
        session.handle_input(0.5, 0.5, 0.5, 1.0);
        session.schedule(Instant::now());
        session.update();

        let frame = session.frame_data().unwrap();
        assert_eq!(frame.len(), dims.frame_bytes());
        assert!(frame.iter().any(|b| *b != 0));
    }
}
