//! Nestable unit-of-work coordination.
//!
//! A [`Coordination`] groups related side effects (typically bind/unbind
//! cascades) so that participants are notified together when the unit ends
//! or fails. Participants are notified in reverse insertion order, always.
//! A coordination created with a deadline is failed by a background timer
//! with the canonical [`FailureCause::Timeout`] cause if it is neither ended
//! nor failed in time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::exception::{CoordinationError, FailureCause, TetherResult};

/// A party interested in the outcome of a coordination.
#[async_trait]
pub trait Participant: Send + Sync {
    /// Called when the coordination ends normally.
    async fn ended(&self, coordination: &Coordination) -> TetherResult<()>;

    /// Called when the coordination fails (explicitly or by timeout).
    async fn failed(&self, coordination: &Coordination) -> TetherResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Active,
    /// Termination started; the winning thread is running callbacks.
    Terminating,
    Ended,
    Failed,
}

struct Core {
    state: State,
    failure: Option<FailureCause>,
    deadline: Option<Instant>,
    timer: Option<JoinHandle<()>>,
}

struct CoordinationInner {
    id: u64,
    name: String,
    created_at: i64,
    owner: Weak<CoordinatorInner>,
    core: Mutex<Core>,
    participants: Mutex<Vec<Arc<dyn Participant>>>,
    /// Serializes participation calls: at most one `add_participant` is in
    /// flight per coordination.
    participation: Mutex<()>,
    terminated: Notify,
}

/// A single unit of work. Cheap to clone; all clones refer to the same
/// coordination.
#[derive(Clone)]
pub struct Coordination {
    inner: Arc<CoordinationInner>,
}

impl std::fmt::Debug for Coordination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordination")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish()
    }
}

impl Coordination {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Creation time, milliseconds since the Unix epoch.
    pub fn created_at(&self) -> i64 {
        self.inner.created_at
    }

    pub async fn is_terminated(&self) -> bool {
        self.inner.core.lock().await.state != State::Active
    }

    /// The recorded failure cause, if the coordination failed.
    pub async fn failure(&self) -> Option<FailureCause> {
        self.inner.core.lock().await.failure.clone()
    }

    pub async fn deadline(&self) -> Option<Instant> {
        self.inner.core.lock().await.deadline
    }

    /// Registers a participant. Duplicate registrations of the same
    /// participant are ignored. Fails with a reason-coded error when the
    /// coordination has already terminated.
    pub async fn add_participant(
        &self,
        participant: Arc<dyn Participant>,
    ) -> Result<(), CoordinationError> {
        let _permit = self.inner.participation.lock().await;

        {
            let core = self.inner.core.lock().await;
            if core.state != State::Active {
                return Err(self.terminated_error(core.failure.clone()));
            }
        }

        let mut participants = self.inner.participants.lock().await;
        if !participants
            .iter()
            .any(|existing| Arc::ptr_eq(existing, &participant))
        {
            participants.push(participant);
        }
        Ok(())
    }

    pub async fn participant_count(&self) -> usize {
        self.inner.participants.lock().await.len()
    }

    /// Ends the coordination, notifying participants in reverse insertion
    /// order. A second call reports `AlreadyEnded`; a call after `fail`
    /// reports `Failed` with the recorded cause. A participant error does
    /// not stop the fan-out but surfaces as `PartiallyEnded`.
    pub async fn end(&self) -> Result<(), CoordinationError> {
        if !self.start_termination(None).await {
            let core = self.inner.core.lock().await;
            return Err(self.terminated_error(core.failure.clone()));
        }

        let participants = self.drain_participants().await;
        let mut partial = false;
        for participant in participants.iter().rev() {
            if let Err(e) = participant.ended(self).await {
                error!(
                    "Participant threw while ending coordination {}/{}: {}",
                    self.inner.id, self.inner.name, e
                );
                partial = true;
            }
        }

        self.finish(State::Ended).await;
        debug!("Coordination {}/{} ended", self.inner.id, self.inner.name);

        if partial {
            return Err(CoordinationError::PartiallyEnded {
                id: self.inner.id,
                name: self.inner.name.clone(),
            });
        }
        Ok(())
    }

    /// Fails the coordination. Idempotent: returns `false` when already
    /// terminated. Participants are notified of the failure in reverse
    /// insertion order; their errors are logged, not propagated.
    pub async fn fail(&self, cause: FailureCause) -> bool {
        if !self.start_termination(Some(cause.clone())).await {
            return false;
        }

        let participants = self.drain_participants().await;
        for participant in participants.iter().rev() {
            if let Err(e) = participant.failed(self).await {
                error!(
                    "Participant threw while failing coordination {}/{}: {}",
                    self.inner.id, self.inner.name, e
                );
            }
        }

        self.finish(State::Failed).await;
        warn!(
            "Coordination {}/{} failed: {}",
            self.inner.id, self.inner.name, cause
        );
        true
    }

    /// Waits until the coordination terminates. With a timeout, returns
    /// `false` if the window elapsed first.
    pub async fn join(&self, timeout: Option<Duration>) -> bool {
        let wait = async {
            loop {
                let notified = self.inner.terminated.notified();
                if self.is_terminated().await {
                    return;
                }
                notified.await;
            }
        };
        match timeout {
            Some(window) => tokio::time::timeout(window, wait).await.is_ok(),
            None => {
                wait.await;
                true
            }
        }
    }

    /// Pushes the deadline further out. Only meaningful for coordinations
    /// created with a deadline; returns the new deadline.
    pub async fn extend_timeout(
        &self,
        extension: Duration,
    ) -> Result<Option<Instant>, CoordinationError> {
        let mut core = self.inner.core.lock().await;
        if core.state != State::Active {
            return Err(self.terminated_error(core.failure.clone()));
        }
        if let Some(deadline) = core.deadline {
            let new_deadline = deadline + extension;
            if let Some(timer) = core.timer.take() {
                timer.abort();
            }
            core.deadline = Some(new_deadline);
            core.timer = Some(self.spawn_timer(new_deadline));
        }
        Ok(core.deadline)
    }

    /// Transitions Active -> Terminating, recording the failure cause when
    /// failing. Only the winning caller proceeds with termination.
    async fn start_termination(&self, cause: Option<FailureCause>) -> bool {
        let mut core = self.inner.core.lock().await;
        if core.state != State::Active {
            return false;
        }
        core.state = State::Terminating;
        core.failure = cause;
        if let Some(timer) = core.timer.take() {
            timer.abort();
        }
        true
    }

    async fn drain_participants(&self) -> Vec<Arc<dyn Participant>> {
        std::mem::take(&mut *self.inner.participants.lock().await)
    }

    async fn finish(&self, state: State) {
        {
            let mut core = self.inner.core.lock().await;
            core.state = state;
        }
        self.inner.terminated.notify_waiters();
        if let Some(owner) = self.inner.owner.upgrade() {
            owner.active.remove(&self.inner.id);
        }
    }

    fn terminated_error(&self, failure: Option<FailureCause>) -> CoordinationError {
        match failure {
            Some(cause) => CoordinationError::Failed {
                id: self.inner.id,
                name: self.inner.name.clone(),
                cause,
            },
            None => CoordinationError::AlreadyEnded {
                id: self.inner.id,
                name: self.inner.name.clone(),
            },
        }
    }

    fn spawn_timer(&self, deadline: Instant) -> JoinHandle<()> {
        let coordination = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if coordination.fail(FailureCause::Timeout).await {
                info!(
                    "Coordination {}/{} failed by deadline timer",
                    coordination.inner.id, coordination.inner.name
                );
            }
        })
    }
}

struct CoordinatorInner {
    next_id: AtomicU64,
    active: DashMap<u64, Coordination>,
}

/// Factory and registry for coordinations.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<CoordinatorInner>,
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl Coordinator {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                next_id: AtomicU64::new(1),
                active: DashMap::new(),
            }),
        }
    }

    /// Creates a coordination without touching any stack. A zero timeout
    /// means no deadline.
    pub fn create(&self, name: &str, timeout: Duration) -> Coordination {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);

        let coordination = Coordination {
            inner: Arc::new(CoordinationInner {
                id,
                name: name.to_string(),
                created_at: chrono::Utc::now().timestamp_millis(),
                owner: Arc::downgrade(&self.inner),
                core: Mutex::new(Core {
                    state: State::Active,
                    failure: None,
                    deadline,
                    timer: None,
                }),
                participants: Mutex::new(Vec::new()),
                participation: Mutex::new(()),
                terminated: Notify::new(),
            }),
        };

        if let Some(deadline) = deadline {
            let timer = coordination.spawn_timer(deadline);
            let core = coordination.inner.core.try_lock();
            if let Ok(mut core) = core {
                core.timer = Some(timer);
            }
        }

        self.inner.active.insert(id, coordination.clone());
        debug!("Created coordination {}/{}", id, name);
        coordination
    }

    /// Creates a coordination and pushes it onto the caller's stack.
    pub fn begin(
        &self,
        name: &str,
        timeout: Duration,
        stack: &mut CoordinationStack,
    ) -> Coordination {
        let coordination = self.create(name, timeout);
        stack.push(coordination.clone());
        coordination
    }

    pub fn get(&self, id: u64) -> Option<Coordination> {
        self.inner.active.get(&id).map(|entry| entry.clone())
    }

    pub fn active_count(&self) -> usize {
        self.inner.active.len()
    }
}

/// Explicit per-task stack of active coordinations. The stack is a plain
/// value owned by the calling task; coordination-aware code receives it as
/// context rather than reaching into ambient thread-local state.
#[derive(Default)]
pub struct CoordinationStack {
    frames: Vec<Coordination>,
}

impl CoordinationStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, coordination: Coordination) {
        self.frames.push(coordination);
    }

    /// Pops the top coordination. Popping an empty stack returns `None`.
    pub fn pop(&mut self) -> Option<Coordination> {
        self.frames.pop()
    }

    pub fn peek(&self) -> Option<&Coordination> {
        self.frames.last()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Pushes a coordination and returns a guard that pops it again when
    /// dropped, on every exit path.
    pub fn scoped(&mut self, coordination: Coordination) -> CoordinationScope<'_> {
        self.push(coordination.clone());
        CoordinationScope {
            stack: self,
            coordination,
        }
    }
}

/// Scope guard pairing a push with a guaranteed pop.
pub struct CoordinationScope<'a> {
    stack: &'a mut CoordinationStack,
    coordination: Coordination,
}

impl CoordinationScope<'_> {
    pub fn coordination(&self) -> &Coordination {
        &self.coordination
    }
}

impl Drop for CoordinationScope<'_> {
    fn drop(&mut self) {
        self.stack.pop();
    }
}
