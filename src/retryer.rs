//! Runs one operation to completion with retries, backoff and pausing.
//!
//! A [`Retryer`] drives a single fetch or mutation. Failed attempts are
//! retried according to a [`Retry`] policy after a [`RetryDelay`]. While the
//! application is unfocused or offline (depending on the [`NetworkMode`]) the
//! retryer parks in a paused state until it is resumed or cancelled.
//!
//! Every retryer settles exactly once: the first of success, final failure
//! or cancellation wins, and the matching terminal callback runs once.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::environment::{FocusManager, OnlineManager};
use crate::error::{CancelOptions, CancelledError, QueryError};
use crate::timer;
use crate::utils::lock;

/// The operation a retryer runs. Called once per attempt with a token that
/// is cancelled when the retryer is.
pub type Operation<T> =
    Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, Result<T, QueryError>> + Send + Sync>;

/// Cloneable handle to the final outcome.
pub type Promise<T> = Shared<BoxFuture<'static, Result<T, QueryError>>>;

type RetryPredicate = Arc<dyn Fn(u32, &QueryError) -> bool + Send + Sync>;
type DelayFn = Arc<dyn Fn(u32, &QueryError) -> Duration + Send + Sync>;

/// Whether a failed attempt is retried.
///
/// The failure count passed to predicates is the number of failures before
/// the current one.
#[derive(Clone, Default)]
pub enum Retry {
    #[default]
    Never,
    Always,
    /// Retry up to this many times after the first attempt.
    Count(u32),
    Predicate(RetryPredicate),
}

impl Retry {
    /// At most `attempts` invocations in total.
    #[must_use]
    pub const fn max_attempts(attempts: u32) -> Self {
        Self::Count(attempts.saturating_sub(1))
    }

    pub fn predicate(f: impl Fn(u32, &QueryError) -> bool + Send + Sync + 'static) -> Self {
        Self::Predicate(Arc::new(f))
    }

    #[must_use]
    pub fn should_retry(&self, failure_count: u32, error: &QueryError) -> bool {
        match self {
            Self::Never => false,
            Self::Always => true,
            Self::Count(retries) => failure_count < *retries,
            Self::Predicate(f) => f(failure_count, error),
        }
    }
}

impl fmt::Debug for Retry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Never => f.write_str("Never"),
            Self::Always => f.write_str("Always"),
            Self::Count(retries) => f.debug_tuple("Count").field(retries).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// Wait between a failed attempt and the next one.
#[derive(Clone)]
pub enum RetryDelay {
    Fixed(Duration),
    /// `min(base * 2^failure_count, max)`.
    Exponential { base: Duration, max: Duration },
    Custom(DelayFn),
}

impl Default for RetryDelay {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

impl RetryDelay {
    pub fn custom(f: impl Fn(u32, &QueryError) -> Duration + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(f))
    }

    /// Delay after the failure that brought the count to `failure_count + 1`.
    #[must_use]
    pub fn delay(&self, failure_count: u32, error: &QueryError) -> Duration {
        match self {
            Self::Fixed(delay) => *delay,
            Self::Exponential { base, max } => {
                let factor = 2u32.checked_pow(failure_count).unwrap_or(u32::MAX);
                base.saturating_mul(factor).min(*max)
            }
            Self::Custom(f) => f(failure_count, error),
        }
    }
}

impl fmt::Debug for RetryDelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(delay) => f.debug_tuple("Fixed").field(delay).finish(),
            Self::Exponential { base, max } => f
                .debug_struct("Exponential")
                .field("base", base)
                .field("max", max)
                .finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// How connectivity gates execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NetworkMode {
    /// Never start or retry while offline.
    #[default]
    Online,
    /// Ignore connectivity entirely.
    Always,
    /// Always make the first attempt, pause retries while offline.
    OfflineFirst,
}

/// Whether an operation in `mode` may start now.
#[must_use]
pub fn can_fetch(mode: NetworkMode, online: &OnlineManager) -> bool {
    match mode {
        NetworkMode::Online => online.is_online(),
        NetworkMode::Always | NetworkMode::OfflineFirst => true,
    }
}

/// Lifecycle of a retryer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryerStatus {
    Idle,
    Running,
    Paused,
    Succeeded,
    Failed,
    Cancelled,
}

impl RetryerStatus {
    #[must_use]
    pub const fn is_settled(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// Everything a retryer needs to run.
pub struct RetryerConfig<T> {
    pub operation: Operation<T>,
    pub retry: Retry,
    pub retry_delay: RetryDelay,
    pub network_mode: NetworkMode,
    pub focus: FocusManager,
    pub online: OnlineManager,
    pub can_run: Arc<dyn Fn() -> bool + Send + Sync>,
    pub on_success: Option<Box<dyn FnOnce(&T) + Send>>,
    pub on_error: Option<Box<dyn FnOnce(&QueryError) + Send>>,
    pub on_fail: Option<Arc<dyn Fn(u32, &QueryError) + Send + Sync>>,
    pub on_pause: Option<Arc<dyn Fn() + Send + Sync>>,
    pub on_continue: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl<T> RetryerConfig<T> {
    /// A config with no retries, `Online` network mode and no callbacks.
    pub fn new(operation: Operation<T>, focus: FocusManager, online: OnlineManager) -> Self {
        Self {
            operation,
            retry: Retry::Never,
            retry_delay: RetryDelay::default(),
            network_mode: NetworkMode::Online,
            focus,
            online,
            can_run: Arc::new(|| true),
            on_success: None,
            on_error: None,
            on_fail: None,
            on_pause: None,
            on_continue: None,
        }
    }
}

struct RunState {
    status: RetryerStatus,
    failure_count: u32,
    cancelled: Option<CancelledError>,
    retry_cancelled: bool,
    forced_continue: bool,
}

struct Terminal<T> {
    on_success: Option<Box<dyn FnOnce(&T) + Send>>,
    on_error: Option<Box<dyn FnOnce(&QueryError) + Send>>,
    tx: Option<oneshot::Sender<Result<T, QueryError>>>,
}

struct Pending<T> {
    operation: Operation<T>,
    retry: Retry,
    retry_delay: RetryDelay,
    on_fail: Option<Arc<dyn Fn(u32, &QueryError) + Send + Sync>>,
    on_pause: Option<Arc<dyn Fn() + Send + Sync>>,
    on_continue: Option<Arc<dyn Fn() + Send + Sync>>,
}

struct Inner<T> {
    state: Mutex<RunState>,
    terminal: Mutex<Terminal<T>>,
    pending: Mutex<Option<Pending<T>>>,
    token: CancellationToken,
    wake: Notify,
    network_mode: NetworkMode,
    focus: FocusManager,
    online: OnlineManager,
    can_run: Arc<dyn Fn() -> bool + Send + Sync>,
}

/// Handle to a running operation. Clones refer to the same operation.
pub struct Retryer<T> {
    inner: Arc<Inner<T>>,
    promise: Promise<T>,
}

impl<T> Clone for Retryer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            promise: self.promise.clone(),
        }
    }
}

impl<T> fmt::Debug for Retryer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("Retryer")
            .field("status", &state.status)
            .field("failure_count", &state.failure_count)
            .field("network_mode", &self.inner.network_mode)
            .finish_non_exhaustive()
    }
}

impl<T> Retryer<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates an idle retryer. Nothing runs until [`Self::start`].
    pub fn new(config: RetryerConfig<T>) -> Self {
        let (tx, rx) = oneshot::channel();
        let promise = async move {
            rx.await.unwrap_or_else(|_| {
                Err(QueryError::TaskFailed(
                    "retryer dropped before settling".to_string(),
                ))
            })
        }
        .boxed()
        .shared();

        let inner = Arc::new(Inner {
            state: Mutex::new(RunState {
                status: RetryerStatus::Idle,
                failure_count: 0,
                cancelled: None,
                retry_cancelled: false,
                forced_continue: false,
            }),
            terminal: Mutex::new(Terminal {
                on_success: config.on_success,
                on_error: config.on_error,
                tx: Some(tx),
            }),
            pending: Mutex::new(Some(Pending {
                operation: config.operation,
                retry: config.retry,
                retry_delay: config.retry_delay,
                on_fail: config.on_fail,
                on_pause: config.on_pause,
                on_continue: config.on_continue,
            })),
            token: CancellationToken::new(),
            wake: Notify::new(),
            network_mode: config.network_mode,
            focus: config.focus,
            online: config.online,
            can_run: config.can_run,
        });

        Self { inner, promise }
    }

    /// Spawns the run loop. Calling it again is a no-op.
    ///
    /// Without a tokio runtime the retryer fails immediately with
    /// [`QueryError::TaskFailed`].
    pub fn start(&self) {
        let Some(pending) = lock(&self.inner.pending).take() else {
            return;
        };
        {
            let mut state = lock(&self.inner.state);
            if state.status == RetryerStatus::Idle {
                state.status = RetryerStatus::Running;
            }
        }

        let inner = Arc::clone(&self.inner);
        let spawned = timer::spawn(async move {
            let result = AssertUnwindSafe(run(&inner, pending))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    Err(QueryError::TaskFailed("operation panicked".to_string()))
                });
            inner.settle(result);
        });

        if !spawned {
            self.inner.settle(Err(QueryError::TaskFailed(
                "no tokio runtime to run the operation".to_string(),
            )));
        }
    }

    /// Cancels the operation. The outcome becomes [`QueryError::Cancelled`]
    /// immediately, regardless of the retry policy.
    pub fn cancel(&self, options: CancelOptions) {
        let cancelled = CancelledError::from(options);
        {
            let mut state = lock(&self.inner.state);
            if state.status.is_settled() {
                return;
            }
            state.cancelled.get_or_insert(cancelled);
        }
        debug!(revert = options.revert, silent = options.silent, "operation cancelled");
        self.inner.token.cancel();
        self.inner.wake.notify_one();
        self.inner.settle(Err(cancelled.into()));
    }

    /// Stops further retries. The current attempt still runs to completion.
    pub fn cancel_retry(&self) {
        lock(&self.inner.state).retry_cancelled = true;
    }

    /// Allows retries again after [`Self::cancel_retry`].
    pub fn continue_retry(&self) {
        lock(&self.inner.state).retry_cancelled = false;
    }

    /// Resumes a paused retryer whether or not it could continue on its own.
    ///
    /// A resume that arrives before the run loop reaches its pause is kept
    /// and honoured by that pause.
    pub fn resume(&self) -> Promise<T> {
        {
            let mut state = lock(&self.inner.state);
            if !state.status.is_settled() {
                state.forced_continue = true;
            }
        }
        self.inner.wake.notify_one();
        self.promise.clone()
    }

    /// Resumes a paused retryer if focus and connectivity now allow it.
    pub fn try_resume(&self) {
        self.inner.wake.notify_one();
    }

    /// Whether the first attempt may run right now.
    #[must_use]
    pub fn can_start(&self) -> bool {
        self.inner.can_start()
    }

    #[must_use]
    pub fn status(&self) -> RetryerStatus {
        lock(&self.inner.state).status
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.status() == RetryerStatus::Paused
    }

    #[must_use]
    pub fn failure_count(&self) -> u32 {
        lock(&self.inner.state).failure_count
    }

    /// Shared future of the final outcome.
    #[must_use]
    pub fn promise(&self) -> Promise<T> {
        self.promise.clone()
    }

    /// Returns `true` if both handles drive the same operation.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T> Inner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn can_start(&self) -> bool {
        can_fetch(self.network_mode, &self.online) && (self.can_run)()
    }

    fn can_continue(&self) -> bool {
        let connected = self.network_mode == NetworkMode::Always
            || (self.focus.is_focused() && self.online.is_online());
        connected && (self.can_run)()
    }

    fn cancelled(&self) -> Option<CancelledError> {
        lock(&self.state).cancelled
    }

    fn set_status(&self, status: RetryerStatus) {
        let mut state = lock(&self.state);
        if !state.status.is_settled() {
            state.status = status;
        }
    }

    /// Parks until resumed, able to continue, or cancelled.
    async fn pause(&self, pending: &Pending<T>) -> Result<(), QueryError> {
        self.set_status(RetryerStatus::Paused);
        debug!("operation paused");
        if let Some(on_pause) = &pending.on_pause {
            on_pause();
        }

        loop {
            let forced = {
                let mut state = lock(&self.state);
                if let Some(cancelled) = state.cancelled {
                    return Err(cancelled.into());
                }
                std::mem::take(&mut state.forced_continue)
            };
            if forced || self.can_continue() {
                break;
            }
            self.wake.notified().await;
        }

        self.set_status(RetryerStatus::Running);
        debug!("operation continued");
        if let Some(on_continue) = &pending.on_continue {
            on_continue();
        }
        Ok(())
    }

    /// Settles the retryer. Only the first call has any effect.
    fn settle(&self, result: Result<T, QueryError>) {
        let (on_success, on_error, tx) = {
            let mut terminal = lock(&self.terminal);
            let Some(tx) = terminal.tx.take() else {
                return;
            };
            (terminal.on_success.take(), terminal.on_error.take(), tx)
        };
        lock(&self.state).status = match &result {
            Ok(_) => RetryerStatus::Succeeded,
            Err(err) if err.is_cancelled() => RetryerStatus::Cancelled,
            Err(_) => RetryerStatus::Failed,
        };

        match &result {
            Ok(value) => {
                if let Some(on_success) = on_success {
                    on_success(value);
                }
            }
            Err(err) => {
                if let Some(on_error) = on_error {
                    on_error(err);
                }
            }
        }
        let _ = tx.send(result);
    }
}

async fn run<T>(inner: &Inner<T>, pending: Pending<T>) -> Result<T, QueryError>
where
    T: Clone + Send + Sync + 'static,
{
    if !inner.can_start() {
        inner.pause(&pending).await?;
    }

    loop {
        {
            let mut state = lock(&inner.state);
            if let Some(cancelled) = state.cancelled {
                return Err(cancelled.into());
            }
            state.forced_continue = false;
        }

        let attempt = (pending.operation)(inner.token.child_token());
        let outcome = tokio::select! {
            biased;
            () = inner.token.cancelled() => Err(inner.cancelled().unwrap_or_default().into()),
            outcome = attempt => outcome,
        };

        let error = match outcome {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        let (failure_count, retry_cancelled) = {
            let state = lock(&inner.state);
            if let Some(cancelled) = state.cancelled {
                return Err(cancelled.into());
            }
            (state.failure_count, state.retry_cancelled)
        };
        if retry_cancelled || !pending.retry.should_retry(failure_count, &error) {
            return Err(error);
        }

        let delay = pending.retry_delay.delay(failure_count, &error);
        let failure_count = {
            let mut state = lock(&inner.state);
            state.failure_count += 1;
            state.failure_count
        };
        debug!(failure_count, ?delay, %error, "attempt failed, retrying");
        if let Some(on_fail) = &pending.on_fail {
            on_fail(failure_count, &error);
        }

        tokio::select! {
            biased;
            () = inner.token.cancelled() => {}
            () = tokio::time::sleep(delay) => {}
        }

        if inner.cancelled().is_none() && !inner.can_continue() {
            inner.pause(&pending).await?;
        }
        if lock(&inner.state).retry_cancelled {
            return Err(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting_operation(
        calls: &Arc<AtomicU32>,
        result: impl Fn(u32) -> Result<u32, QueryError> + Send + Sync + 'static,
    ) -> Operation<u32> {
        let calls = Arc::clone(calls);
        let result = Arc::new(result);
        Arc::new(move |_token| {
            let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
            let outcome = result(attempt);
            async move { outcome }.boxed()
        })
    }

    fn config(operation: Operation<u32>) -> RetryerConfig<u32> {
        RetryerConfig::new(operation, FocusManager::new(), OnlineManager::new())
    }

    async fn tick() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[test]
    fn test_retry_policies() {
        let err = QueryError::fetch("x");
        assert!(!Retry::Never.should_retry(0, &err));
        assert!(Retry::Always.should_retry(100, &err));
        assert!(Retry::Count(2).should_retry(1, &err));
        assert!(!Retry::Count(2).should_retry(2, &err));
        assert!(matches!(Retry::max_attempts(3), Retry::Count(2)));
        assert!(matches!(Retry::max_attempts(0), Retry::Count(0)));
        let even = Retry::predicate(|count, _| count % 2 == 0);
        assert!(even.should_retry(0, &err));
        assert!(!even.should_retry(1, &err));
    }

    #[test]
    fn test_default_delay_is_capped_exponential() {
        let err = QueryError::fetch("x");
        let delay = RetryDelay::default();
        assert_eq!(delay.delay(0, &err), Duration::from_secs(1));
        assert_eq!(delay.delay(1, &err), Duration::from_secs(2));
        assert_eq!(delay.delay(4, &err), Duration::from_secs(16));
        assert_eq!(delay.delay(5, &err), Duration::from_secs(30));
        assert_eq!(delay.delay(64, &err), Duration::from_secs(30));
    }

    #[test]
    fn test_can_fetch_by_network_mode() {
        let online = OnlineManager::new();
        online.set_online(false);
        assert!(!can_fetch(NetworkMode::Online, &online));
        assert!(can_fetch(NetworkMode::OfflineFirst, &online));
        assert!(can_fetch(NetworkMode::Always, &online));
    }

    #[test]
    fn test_start_without_runtime_fails() {
        let calls = Arc::new(AtomicU32::new(0));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        let mut config = config(counting_operation(&calls, Ok));
        config.on_error = Some(Box::new(move |err: &QueryError| {
            sink.lock().expect("lock").push(err.clone());
        }));
        let retryer = Retryer::new(config);
        retryer.start();
        assert_eq!(retryer.status(), RetryerStatus::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(matches!(
            errors.lock().expect("lock").as_slice(),
            [QueryError::TaskFailed(_)]
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_runs_on_success_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let successes = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&successes);
        let mut config = config(counting_operation(&calls, |_| Ok(7)));
        config.on_success = Some(Box::new(move |value: &u32| {
            assert_eq!(*value, 7);
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let retryer = Retryer::new(config);
        assert_eq!(retryer.status(), RetryerStatus::Idle);
        retryer.start();
        retryer.start();

        assert_eq!(retryer.promise().await, Ok(7));
        assert_eq!(retryer.status(), RetryerStatus::Succeeded);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(successes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_bound_is_respected() {
        let calls = Arc::new(AtomicU32::new(0));
        let fails = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&fails);
        let mut config = config(counting_operation(&calls, |n| {
            Err(QueryError::fetch(format!("attempt {n}")))
        }));
        config.retry = Retry::max_attempts(3);
        config.retry_delay = RetryDelay::Fixed(Duration::from_millis(10));
        config.on_fail = Some(Arc::new(move |count, _: &QueryError| {
            sink.lock().expect("lock").push(count);
        }));

        let retryer = Retryer::new(config);
        retryer.start();
        let result = retryer.promise().await;

        assert_eq!(result, Err(QueryError::fetch("attempt 3")));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(*fails.lock().expect("lock"), vec![1, 2]);
        assert_eq!(retryer.failure_count(), 2);
        assert_eq!(retryer.status(), RetryerStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_delays_are_applied() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut config = config(counting_operation(&calls, |n| {
            if n < 3 { Err(QueryError::fetch("flaky")) } else { Ok(n) }
        }));
        config.retry = Retry::Count(5);
        let retryer = Retryer::new(config);
        let started = tokio::time::Instant::now();
        retryer.start();

        assert_eq!(retryer.promise().await, Ok(3));
        // 1s after the first failure, 2s after the second.
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_failing_attempt_wins_over_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let operation: Operation<u32> = Arc::new(move |_token| {
            counter.fetch_add(1, Ordering::SeqCst);
            async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Err(QueryError::fetch("late failure"))
            }
            .boxed()
        });
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        let mut config = config(operation);
        config.retry = Retry::Always;
        config.on_error = Some(Box::new(move |err: &QueryError| {
            sink.lock().expect("lock").push(err.clone());
        }));

        let retryer = Retryer::new(config);
        retryer.start();
        tick().await;
        retryer.cancel(CancelOptions::revert());

        let result = retryer.promise().await;
        assert_eq!(
            result,
            Err(QueryError::Cancelled(CancelledError {
                revert: true,
                silent: false
            }))
        );
        assert_eq!(retryer.status(), RetryerStatus::Cancelled);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(errors.lock().expect("lock").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_operation_sees_cancellation_token() {
        let observed = Arc::new(AtomicU32::new(0));
        let flag = Arc::clone(&observed);
        let operation: Operation<u32> = Arc::new(move |token: CancellationToken| {
            let flag = Arc::clone(&flag);
            async move {
                token.cancelled().await;
                flag.store(1, Ordering::SeqCst);
                Ok(0)
            }
            .boxed()
        });
        let retryer = Retryer::new(config(operation));
        retryer.start();
        tick().await;
        retryer.cancel(CancelOptions::default());
        assert!(retryer.promise().await.is_err_and(|err| err.is_cancelled()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_online_mode_pauses_before_first_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut config = config(counting_operation(&calls, Ok));
        let online = config.online.clone();
        online.set_online(false);
        let pauses = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&pauses);
        config.on_pause = Some(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let retryer = Retryer::new(config);
        assert!(!retryer.can_start());
        retryer.start();
        tick().await;
        assert!(retryer.is_paused());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(pauses.load(Ordering::SeqCst), 1);

        // Still offline: waking does nothing.
        retryer.try_resume();
        tick().await;
        assert!(retryer.is_paused());

        online.set_online(true);
        retryer.try_resume();
        assert_eq!(retryer.promise().await, Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_forces_continue_while_offline() {
        let calls = Arc::new(AtomicU32::new(0));
        let config = config(counting_operation(&calls, Ok));
        config.online.set_online(false);
        let retryer = Retryer::new(config);
        retryer.start();
        tick().await;
        assert!(retryer.is_paused());

        assert_eq!(retryer.resume().await, Ok(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_first_attempts_then_pauses_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut config = config(counting_operation(&calls, |n| {
            if n == 1 { Err(QueryError::fetch("offline")) } else { Ok(n) }
        }));
        let online = config.online.clone();
        online.set_online(false);
        config.network_mode = NetworkMode::OfflineFirst;
        config.retry = Retry::Count(3);
        config.retry_delay = RetryDelay::Fixed(Duration::from_millis(10));

        let retryer = Retryer::new(config);
        retryer.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(retryer.is_paused());

        online.set_online(true);
        retryer.try_resume();
        assert_eq!(retryer.promise().await, Ok(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_mode_ignores_connectivity() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut config = config(counting_operation(&calls, Ok));
        config.online.set_online(false);
        config.focus.set_focused(Some(false));
        config.network_mode = NetworkMode::Always;
        let retryer = Retryer::new(config);
        retryer.start();
        assert_eq!(retryer.promise().await, Ok(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_pause_while_unfocused() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut config = config(counting_operation(&calls, |n| {
            if n == 1 { Err(QueryError::fetch("first")) } else { Ok(n) }
        }));
        let focus = config.focus.clone();
        config.retry = Retry::Count(1);
        config.retry_delay = RetryDelay::Fixed(Duration::from_millis(10));
        let retryer = Retryer::new(config);
        retryer.start();
        tick().await;
        focus.set_focused(Some(false));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(retryer.is_paused());

        focus.set_focused(Some(true));
        retryer.try_resume();
        assert_eq!(retryer.promise().await, Ok(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_retry_stops_after_current_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut config = config(counting_operation(&calls, |_| Err(QueryError::fetch("nope"))));
        config.retry = Retry::Always;
        config.retry_delay = RetryDelay::Fixed(Duration::from_millis(10));
        let retryer = Retryer::new(config);
        retryer.start();
        tokio::time::sleep(Duration::from_millis(25)).await;
        retryer.cancel_retry();

        assert_eq!(retryer.promise().await, Err(QueryError::fetch("nope")));
        assert_eq!(retryer.status(), RetryerStatus::Failed);
        assert!(calls.load(Ordering::SeqCst) <= 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_paused_settles_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let config = config(counting_operation(&calls, Ok));
        config.online.set_online(false);
        let retryer = Retryer::new(config);
        retryer.start();
        tick().await;
        retryer.cancel(CancelOptions::silent());
        assert!(retryer.promise().await.is_err_and(|err| err.is_cancelled()));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_operation_fails() {
        let operation: Operation<u32> = Arc::new(|_token| {
            async {
                let missing: Option<u32> = None;
                Ok(missing.unwrap_or_else(|| panic!("boom")))
            }
            .boxed()
        });
        let retryer = Retryer::new(config(operation));
        retryer.start();
        assert!(matches!(
            retryer.promise().await,
            Err(QueryError::TaskFailed(_))
        ));
    }
}
