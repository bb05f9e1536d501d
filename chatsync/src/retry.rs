//! Exponential-backoff retry driver for asynchronous operations.
//!
//! [`RetryController`] repeatedly invokes a caller-supplied async
//! operation until it succeeds, the attempt budget runs out, or the
//! caller aborts. Timers and transport callbacks are asynchronous and
//! can fire after the controller has moved on — a timed-out attempt may
//! still complete, an abort may race an in-flight completion — so every
//! completion path carries the attempt identity it was issued under and
//! re-checks it before touching state. The output resolves at most
//! once, whatever the interleaving.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::service::ServiceError;

/// Default starting point of the backoff progression.
pub const DEFAULT_INITIAL_WAIT: Duration = Duration::from_secs(1);

/// Default cap on a single inter-attempt wait.
pub const DEFAULT_MAX_SINGLE_WAIT: Duration = Duration::from_secs(60);

/// Tuning knobs for a retry controller.
#[derive(Debug, Clone, Copy)]
pub struct RetryOptions {
    /// Base of the exponential wait progression.
    pub initial_wait: Duration,
    /// Upper bound on any single wait.
    pub max_single_wait: Duration,
    /// Attempt budget; 0 means retry until success or abort.
    pub max_attempts: u32,
    /// Per-attempt timeout. A timed-out attempt counts as a transient
    /// failure; a late completion from it is discarded.
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            initial_wait: DEFAULT_INITIAL_WAIT,
            max_single_wait: DEFAULT_MAX_SINGLE_WAIT,
            max_attempts: 0,
            attempt_timeout: None,
        }
    }
}

impl RetryOptions {
    /// Options with a bounded attempt budget and default timing.
    #[must_use]
    pub fn bounded(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }
}

/// The wait before attempt `n` (1-based): `min(initial * 2^(n-1), max)`.
///
/// Saturates instead of overflowing, so arbitrarily large attempt
/// numbers clamp to `max_single_wait`.
#[must_use]
pub fn wait_before_attempt(opts: &RetryOptions, attempt_no: u32) -> Duration {
    let initial = u64::try_from(opts.initial_wait.as_millis()).unwrap_or(u64::MAX);
    let max = u64::try_from(opts.max_single_wait.as_millis()).unwrap_or(u64::MAX);
    let exp = attempt_no.saturating_sub(1);
    let millis = if exp >= u64::BITS {
        u64::MAX
    } else {
        initial.saturating_mul(1_u64 << exp)
    };
    Duration::from_millis(millis.min(max))
}

/// Lifecycle of a retry controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    /// Not started yet, or just reset.
    NotStarted,
    /// An attempt is in flight.
    InProgress,
    /// Sleeping before the next attempt.
    RetryWait,
    /// The output has resolved; [`RetryController::reset`] to reuse.
    Finished,
}

impl RetryState {
    /// Whether the controller is in a running state.
    #[must_use]
    pub const fn is_running(self) -> bool {
        matches!(self, Self::InProgress | Self::RetryWait)
    }
}

/// Terminal failure of a retry sequence.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RetryError {
    /// The caller aborted the controller.
    #[error("retry aborted")]
    Aborted,

    /// The server authoritatively rejected the operation; retrying
    /// cannot help.
    #[error(transparent)]
    Rejected(ServiceError),

    /// The attempt budget ran out; carries the last transient error.
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        /// How many attempts were made before giving up.
        attempts: u32,
        /// The failure of the final attempt.
        last: ServiceError,
    },
}

/// Misuse of the controller state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RetryStateError {
    /// `start` called on a controller that is running or finished.
    #[error("controller already started; reset it first")]
    AlreadyStarted,
    /// `restart` called on a finished controller.
    #[error("controller already finished")]
    AlreadyFinished,
    /// `reset` called while attempts are still being made.
    #[error("controller still running")]
    StillRunning,
}

type Outcome<T> = Result<T, RetryError>;

/// Boxed future produced by each invocation of the retried operation.
pub type AttemptFuture<T> = Pin<Box<dyn Future<Output = Result<T, ServiceError>> + Send>>;

type Operation<T> = Box<dyn FnMut() -> AttemptFuture<T> + Send>;
type CancelHook = Arc<dyn Fn() + Send + Sync>;

/// Cloneable observer of a controller's single-resolution output.
///
/// All clones observe the same outcome. After
/// [`RetryController::reset`] the controller gets a fresh output
/// channel, so handles must be re-fetched.
#[derive(Debug, Clone)]
pub struct RetryHandle<T> {
    rx: watch::Receiver<Option<Outcome<T>>>,
}

impl<T: Clone> RetryHandle<T> {
    /// Waits for the controller to resolve.
    ///
    /// If the controller is dropped without ever resolving (possible
    /// only when it was never started), this reports an abort.
    pub async fn outcome(&mut self) -> Outcome<T> {
        loop {
            if let Some(out) = self.rx.borrow_and_update().clone() {
                return out;
            }
            if self.rx.changed().await.is_err() {
                return self
                    .rx
                    .borrow()
                    .clone()
                    .unwrap_or(Err(RetryError::Aborted));
            }
        }
    }

    /// The outcome, if already resolved.
    #[must_use]
    pub fn try_outcome(&self) -> Option<Outcome<T>> {
        self.rx.borrow().clone()
    }
}

struct Inner<T> {
    opts: RetryOptions,
    state: RetryState,
    attempt_no: u32,
    // Monotonically increasing identity of the current attempt. Never
    // reset, unlike attempt_no: stale timer/transport callbacks compare
    // their captured value against it and bail on mismatch.
    attempt_id: u64,
    timer: Option<JoinHandle<()>>,
    deferred_restart: Option<Duration>,
    op: Operation<T>,
    cancel: Option<CancelHook>,
    tx: watch::Sender<Option<Outcome<T>>>,
}

impl<T> Inner<T> {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn resolve(&mut self, outcome: Outcome<T>) {
        debug_assert!(self.state != RetryState::Finished);
        self.state = RetryState::Finished;
        self.deferred_restart = None;
        let _ = self.tx.send_replace(Some(outcome));
    }
}

/// Drives one asynchronous operation to completion with exponential
/// backoff between attempts.
///
/// The controller is reference-counted: driver tasks (attempts and
/// timers) hold it alive while running, so a caller may drop its clone
/// after [`start`](Self::start) and keep only the
/// [`RetryHandle`] — the fire-and-forget shape packaged by [`retry`].
pub struct RetryController<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for RetryController<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> RetryController<T> {
    /// Creates a controller over `op` with no cancellation hook.
    pub fn new<F, Fut>(op: F, opts: RetryOptions) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, ServiceError>> + Send + 'static,
    {
        let mut op = op;
        Self::build(Box::new(move || Box::pin(op()) as AttemptFuture<T>), None, opts)
    }

    /// Creates a controller whose `cancel` hook is invoked whenever a
    /// mid-flight attempt is abandoned (abort or attempt timeout), so
    /// the underlying transport operation can be torn down.
    pub fn with_cancel<F, Fut, C>(op: F, cancel: C, opts: RetryOptions) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, ServiceError>> + Send + 'static,
        C: Fn() + Send + Sync + 'static,
    {
        let mut op = op;
        Self::build(
            Box::new(move || Box::pin(op()) as AttemptFuture<T>),
            Some(Arc::new(cancel)),
            opts,
        )
    }

    fn build(op: Operation<T>, cancel: Option<CancelHook>, opts: RetryOptions) -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                opts,
                state: RetryState::NotStarted,
                attempt_no: 0,
                attempt_id: 0,
                timer: None,
                deferred_restart: None,
                op,
                cancel,
                tx,
            })),
        }
    }

    /// A fresh handle to the output.
    ///
    /// Must be re-fetched after [`reset`](Self::reset), which replaces
    /// the output channel.
    #[must_use]
    pub fn handle(&self) -> RetryHandle<T> {
        RetryHandle {
            rx: self.inner.lock().tx.subscribe(),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> RetryState {
        self.inner.lock().state
    }

    /// Number of the current (or last) attempt, 1-based; 0 before the
    /// first start.
    #[must_use]
    pub fn attempt_no(&self) -> u32 {
        self.inner.lock().attempt_no
    }

    /// Begins the attempt sequence, after `delay` when one is given.
    ///
    /// # Errors
    ///
    /// [`RetryStateError::AlreadyStarted`] unless the controller is in
    /// [`RetryState::NotStarted`].
    pub fn start(&self, delay: Option<Duration>) -> Result<(), RetryStateError> {
        let mut g = self.inner.lock();
        if g.state != RetryState::NotStarted {
            return Err(RetryStateError::AlreadyStarted);
        }
        g.attempt_no = 1;
        if let Some(d) = delay.filter(|d| !d.is_zero()) {
            g.state = RetryState::RetryWait;
            g.timer = Some(Self::spawn_wait(Arc::clone(&self.inner), d));
        } else {
            drop(g);
            Self::next_try(&self.inner);
        }
        Ok(())
    }

    /// Begins the sequence again from attempt 1.
    ///
    /// From [`RetryState::InProgress`] the restart is deferred until the
    /// in-flight attempt completes; from [`RetryState::RetryWait`] or
    /// [`RetryState::NotStarted`] any pending timer is cancelled and the
    /// sequence starts over immediately (or after `delay`). The output
    /// channel is kept.
    ///
    /// # Errors
    ///
    /// [`RetryStateError::AlreadyFinished`] once the output resolved.
    pub fn restart(&self, delay: Option<Duration>) -> Result<(), RetryStateError> {
        let mut g = self.inner.lock();
        match g.state {
            RetryState::Finished => Err(RetryStateError::AlreadyFinished),
            RetryState::InProgress => {
                g.deferred_restart = Some(delay.unwrap_or(Duration::ZERO));
                Ok(())
            }
            RetryState::RetryWait | RetryState::NotStarted => {
                g.cancel_timer();
                g.state = RetryState::NotStarted;
                drop(g);
                self.start(delay)
            }
        }
    }

    /// Cancels a running controller.
    ///
    /// Cancels any pending timer, invokes the cancellation hook when an
    /// attempt is mid-flight, and rejects the output with
    /// [`RetryError::Aborted`]. Returns `false` (with no side effects)
    /// when the controller is not running.
    pub fn abort(&self) -> bool {
        let cancel = {
            let mut g = self.inner.lock();
            if !g.state.is_running() {
                return false;
            }
            g.cancel_timer();
            let cancel = if g.state == RetryState::InProgress {
                g.cancel.clone()
            } else {
                None
            };
            // Invalidate any in-flight completion before resolving.
            g.attempt_id += 1;
            tracing::debug!(attempt = g.attempt_no, "retry aborted by caller");
            g.resolve(Err(RetryError::Aborted));
            cancel
        };
        if let Some(hook) = cancel {
            hook();
        }
        true
    }

    /// Re-initializes a finished controller for reuse.
    ///
    /// Replaces the output channel; callers must obtain a new
    /// [`RetryHandle`] via [`handle`](Self::handle). A controller that
    /// was never started resets trivially.
    ///
    /// # Errors
    ///
    /// [`RetryStateError::StillRunning`] while attempts are being made.
    pub fn reset(&self) -> Result<(), RetryStateError> {
        let mut g = self.inner.lock();
        match g.state {
            RetryState::NotStarted => Ok(()),
            RetryState::Finished => {
                let (tx, _) = watch::channel(None);
                g.tx = tx;
                g.attempt_no = 0;
                g.state = RetryState::NotStarted;
                Ok(())
            }
            RetryState::InProgress | RetryState::RetryWait => Err(RetryStateError::StillRunning),
        }
    }

    fn next_try(inner: &Arc<Mutex<Inner<T>>>) {
        let (fut, id) = {
            let mut g = inner.lock();
            if g.state == RetryState::Finished {
                return;
            }
            g.attempt_id += 1;
            let id = g.attempt_id;
            g.state = RetryState::InProgress;
            g.timer = None;
            if let Some(timeout) = g.opts.attempt_timeout {
                let timer_inner = Arc::clone(inner);
                g.timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    Self::attempt_timed_out(&timer_inner, id, timeout);
                }));
            }
            tracing::debug!(attempt = g.attempt_no, "starting attempt");
            ((g.op)(), id)
        };
        let done_inner = Arc::clone(inner);
        tokio::spawn(async move {
            match fut.await {
                Ok(value) => Self::attempt_succeeded(&done_inner, id, value),
                Err(err) => Self::attempt_failed(&done_inner, id, err),
            }
        });
    }

    fn attempt_succeeded(inner: &Arc<Mutex<Inner<T>>>, id: u64, value: T) {
        let mut g = inner.lock();
        if g.state == RetryState::Finished || g.attempt_id != id {
            tracing::debug!("stale attempt reported success; discarding");
            return;
        }
        g.cancel_timer();
        tracing::debug!(attempt = g.attempt_no, "attempt succeeded");
        g.resolve(Ok(value));
    }

    fn attempt_failed(inner: &Arc<Mutex<Inner<T>>>, id: u64, err: ServiceError) {
        let g = {
            let mut g = inner.lock();
            if g.state == RetryState::Finished || g.attempt_id != id {
                tracing::debug!(error = %err, "stale attempt reported failure; discarding");
                return;
            }
            g.cancel_timer();
            tracing::debug!(attempt = g.attempt_no, error = %err, "attempt failed");
            g
        };
        Self::sched_next_retry(g, inner, err);
    }

    fn attempt_timed_out(inner: &Arc<Mutex<Inner<T>>>, id: u64, timeout: Duration) {
        let cancel = {
            let mut g = inner.lock();
            if g.state == RetryState::Finished || g.attempt_id != id {
                return;
            }
            g.timer = None;
            tracing::warn!(attempt = g.attempt_no, ?timeout, "attempt timed out");
            let cancel = g.cancel.clone();
            Self::sched_next_retry(g, inner, ServiceError::Timeout);
            cancel
        };
        if let Some(hook) = cancel {
            hook();
        }
    }

    fn sched_next_retry(
        mut g: MutexGuard<'_, Inner<T>>,
        inner: &Arc<Mutex<Inner<T>>>,
        err: ServiceError,
    ) {
        // Invalidate the attempt that just ended (it may still be
        // running after a timeout).
        g.attempt_id += 1;
        if let Some(delay) = g.deferred_restart.take() {
            g.attempt_no = 1;
            if delay.is_zero() {
                drop(g);
                Self::next_try(inner);
            } else {
                g.state = RetryState::RetryWait;
                g.timer = Some(Self::spawn_wait(Arc::clone(inner), delay));
            }
            return;
        }
        if !err.is_transient() {
            tracing::warn!(error = %err, "authoritative failure; not retrying");
            g.resolve(Err(RetryError::Rejected(err)));
            return;
        }
        g.attempt_no += 1;
        if g.opts.max_attempts != 0 && g.attempt_no > g.opts.max_attempts {
            let attempts = g.attempt_no - 1;
            tracing::warn!(attempts, error = %err, "attempt budget exhausted, giving up");
            g.resolve(Err(RetryError::Exhausted { attempts, last: err }));
            return;
        }
        let wait = wait_before_attempt(&g.opts, g.attempt_no);
        tracing::debug!(attempt = g.attempt_no, ?wait, "scheduling retry");
        g.state = RetryState::RetryWait;
        g.timer = Some(Self::spawn_wait(Arc::clone(inner), wait));
    }

    fn spawn_wait(inner: Arc<Mutex<Inner<T>>>, delay: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut g = inner.lock();
                if g.state != RetryState::RetryWait {
                    return;
                }
                g.timer = None;
            }
            Self::next_try(&inner);
        })
    }
}

/// Fire-and-forget convenience: runs `op` under a fresh controller and
/// returns only the output handle.
///
/// The controller is jointly owned by its driver tasks and is dropped
/// once the outcome resolves and the tasks finish; the caller keeps
/// observing through the handle.
pub fn retry<T, F, Fut>(op: F, opts: RetryOptions) -> RetryHandle<T>
where
    T: Clone + Send + Sync + 'static,
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, ServiceError>> + Send + 'static,
{
    let controller = RetryController::new(op, opts);
    let handle = controller.handle();
    // A zero-delay start from NotStarted cannot fail.
    let _ = controller.start(None);
    handle
}
