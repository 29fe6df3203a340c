use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{self, BoxFuture, FutureExt, Shared};

use crate::config::RetrySettings;
use crate::error::{retry_exhausted, SessionError, SessionResult};
use crate::platform::runtime::sleep;
use crate::util::backoff::calculate_backoff;
use crate::util::subscribe::{ObserverList, PartialObserver, Unsubscribe};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitializationState {
    Idle,
    InProgress,
    Ready,
    /// Every attempt failed. Only [`RetryCoordinator::reset`] leaves this state.
    Failed,
}

#[derive(Clone, Debug)]
pub struct RetryStatus {
    pub state: InitializationState,
    /// Attempts made in the current (or most recent) pass.
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<SessionError>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryEvent {
    AttemptStarted { attempt: u32 },
    RetryScheduled { attempt: u32, delay: Duration },
    Succeeded { attempts: u32 },
    Exhausted { attempts: u32 },
    Reset,
}

pub type RetryFuture<T> = Shared<BoxFuture<'static, SessionResult<T>>>;

struct CoordinatorInner<T> {
    settings: RetrySettings,
    status: Mutex<RetryStatus>,
    in_flight: Mutex<Option<RetryFuture<T>>>,
    events: ObserverList<RetryEvent>,
}

impl<T> CoordinatorInner<T> {
    fn update_status<F>(&self, f: F)
    where
        F: FnOnce(&mut RetryStatus),
    {
        f(&mut self.status.lock().unwrap());
    }

    fn finish(&self) {
        self.in_flight.lock().unwrap().take();
    }
}

/// Drives an async operation with exponential backoff.
///
/// Only one pass runs at a time: a `run` issued while a pass is in flight
/// returns the same shared future instead of starting another one.
pub struct RetryCoordinator<T> {
    inner: Arc<CoordinatorInner<T>>,
}

impl<T> Clone for RetryCoordinator<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> RetryCoordinator<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(settings: RetrySettings) -> Self {
        let max_attempts = settings.max_attempts.max(1);
        Self {
            inner: Arc::new(CoordinatorInner {
                settings,
                status: Mutex::new(RetryStatus {
                    state: InitializationState::Idle,
                    attempts: 0,
                    max_attempts,
                    last_error: None,
                }),
                in_flight: Mutex::new(None),
                events: ObserverList::new(),
            }),
        }
    }

    pub fn status(&self) -> RetryStatus {
        self.inner.status.lock().unwrap().clone()
    }

    pub fn state(&self) -> InitializationState {
        self.inner.status.lock().unwrap().state
    }

    pub fn is_in_flight(&self) -> bool {
        self.inner.in_flight.lock().unwrap().is_some()
    }

    pub fn on_event(&self, observer: PartialObserver<RetryEvent>) -> Unsubscribe {
        self.inner.events.add(observer)
    }

    /// Starts a pass running `operation`, or joins the pass already in flight.
    ///
    /// Once the coordinator is [`InitializationState::Failed`] this resolves
    /// immediately with a `retry-exhausted` error without calling `operation`.
    pub fn run<F, Fut>(&self, operation: F) -> RetryFuture<T>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SessionResult<T>> + Send + 'static,
    {
        let mut in_flight = self.inner.in_flight.lock().unwrap();
        if let Some(existing) = in_flight.as_ref() {
            return existing.clone();
        }

        {
            let mut status = self.inner.status.lock().unwrap();
            if status.state == InitializationState::Failed {
                let attempts = status.attempts;
                drop(status);
                return future::ready(Err(retry_exhausted(format!(
                    "Initialization failed after {attempts} attempts; reset before retrying"
                ))))
                .boxed()
                .shared();
            }
            status.state = InitializationState::InProgress;
            status.attempts = 0;
            status.last_error = None;
        }

        let inner = Arc::clone(&self.inner);
        let pass = async move { run_pass(inner, operation).await }.boxed().shared();
        *in_flight = Some(pass.clone());
        pass
    }

    /// Returns a failed or finished coordinator to `Idle` with a zeroed
    /// attempt counter. Has no effect while a pass is in flight.
    pub fn reset(&self) -> bool {
        let in_flight = self.inner.in_flight.lock().unwrap();
        if in_flight.is_some() {
            return false;
        }
        self.inner.update_status(|status| {
            status.state = InitializationState::Idle;
            status.attempts = 0;
            status.last_error = None;
        });
        drop(in_flight);
        self.inner.events.notify(&RetryEvent::Reset);
        true
    }
}

async fn run_pass<T, F, Fut>(inner: Arc<CoordinatorInner<T>>, operation: F) -> SessionResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = SessionResult<T>>,
{
    let max_attempts = inner.settings.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        inner.update_status(|status| status.attempts = attempt);
        inner.events.notify(&RetryEvent::AttemptStarted { attempt });

        match operation().await {
            Ok(value) => {
                inner.update_status(|status| {
                    status.state = InitializationState::Ready;
                    status.last_error = None;
                });
                inner.finish();
                inner.events.notify(&RetryEvent::Succeeded { attempts: attempt });
                return Ok(value);
            }
            Err(error) => {
                log::warn!("attempt {attempt}/{max_attempts} failed: {error}");
                let exhausted = attempt >= max_attempts;
                inner.update_status(|status| {
                    status.last_error = Some(error.clone());
                    if exhausted {
                        status.state = InitializationState::Failed;
                    }
                });

                if exhausted {
                    inner.finish();
                    inner.events.notify(&RetryEvent::Exhausted { attempts: attempt });
                    return Err(retry_exhausted(format!(
                        "Initialization failed after {attempt} attempts: {error}"
                    )));
                }

                let delay = calculate_backoff(attempt, inner.settings.backoff());
                inner
                    .events
                    .notify(&RetryEvent::RetryScheduled { attempt, delay });
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::error::unavailable;
    use crate::error::SessionErrorCode;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn settings(max_attempts: u32, base_ms: u64) -> RetrySettings {
        RetrySettings::new(max_attempts, Duration::from_millis(base_ms))
    }

    /// Operation that fails `failures` times before succeeding with the call count.
    fn flaky(
        calls: &Arc<AtomicU32>,
        failures: u32,
    ) -> impl Fn() -> BoxFuture<'static, SessionResult<u32>> + Send + Sync + 'static {
        let calls = calls.clone();
        move || {
            let calls = calls.clone();
            async move {
                let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if call <= failures {
                    Err(unavailable("backend unreachable").into())
                } else {
                    Ok(call)
                }
            }
            .boxed()
        }
    }

    fn record_events(coordinator: &RetryCoordinator<u32>) -> (Arc<Mutex<Vec<RetryEvent>>>, Unsubscribe) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let unsubscribe = coordinator.on_event(PartialObserver::new().with_next(
            move |event: &RetryEvent| sink.lock().unwrap().push(event.clone()),
        ));
        (events, unsubscribe)
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn concurrent_runs_share_one_pass() {
        let coordinator = RetryCoordinator::new(settings(3, 100));
        let calls = Arc::new(AtomicU32::new(0));
        let slow_calls = calls.clone();
        let slow = move || {
            let calls = slow_calls.clone();
            async move {
                sleep(Duration::from_millis(50)).await;
                Ok(calls.fetch_add(1, Ordering::SeqCst) + 1)
            }
        };
        let unused = Arc::new(AtomicU32::new(0));

        let first = coordinator.run(slow);
        assert_eq!(coordinator.state(), InitializationState::InProgress);
        let second = coordinator.run(flaky(&unused, 0));

        let (a, b) = tokio::join!(first, second);
        assert_eq!(a.unwrap(), 1);
        assert_eq!(b.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(unused.load(Ordering::SeqCst), 0);
        assert_eq!(coordinator.state(), InitializationState::Ready);
        assert!(!coordinator.is_in_flight());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn backoff_doubles_between_attempts() {
        let coordinator = RetryCoordinator::new(settings(4, 100));
        let (events, _unsubscribe) = record_events(&coordinator);
        let calls = Arc::new(AtomicU32::new(0));

        let started = Instant::now();
        let result = coordinator.run(flaky(&calls, 3)).await;
        let elapsed = started.elapsed();

        assert_eq!(result.unwrap(), 4);
        let delays: Vec<Duration> = events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                RetryEvent::RetryScheduled { delay, .. } => Some(*delay),
                _ => None,
            })
            .collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );
        assert!(elapsed >= Duration::from_millis(700));
        assert!(elapsed < Duration::from_millis(750));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn exhausted_retries_fail_until_reset() {
        let coordinator = RetryCoordinator::new(settings(3, 10));
        let calls = Arc::new(AtomicU32::new(0));

        let error = coordinator.run(flaky(&calls, u32::MAX)).await.unwrap_err();
        assert_eq!(error.code, SessionErrorCode::RetryExhausted);

        let status = coordinator.status();
        assert_eq!(status.state, InitializationState::Failed);
        assert_eq!(status.attempts, 3);
        assert_eq!(status.max_attempts, 3);
        assert!(status.last_error.is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // No automatic retries once failed.
        let again = coordinator.run(flaky(&calls, 0)).await;
        assert!(again.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        assert!(coordinator.reset());
        let status = coordinator.status();
        assert_eq!(status.state, InitializationState::Idle);
        assert_eq!(status.attempts, 0);

        let calls_after_reset = Arc::new(AtomicU32::new(0));
        let value = coordinator.run(flaky(&calls_after_reset, 0)).await.unwrap();
        assert_eq!(value, 1);
        assert_eq!(coordinator.state(), InitializationState::Ready);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn reset_is_refused_while_in_flight() {
        let coordinator = RetryCoordinator::new(settings(2, 10));
        let calls = Arc::new(AtomicU32::new(0));
        let pass = coordinator.run(flaky(&calls, 1));

        assert!(!coordinator.reset());
        assert_eq!(pass.await.unwrap(), 2);
        assert!(coordinator.reset());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn events_trace_a_failed_pass() {
        let coordinator = RetryCoordinator::new(settings(2, 10));
        let (events, _unsubscribe) = record_events(&coordinator);
        let calls = Arc::new(AtomicU32::new(0));

        let _ = coordinator.run(flaky(&calls, u32::MAX)).await;

        assert_eq!(
            *events.lock().unwrap(),
            vec![
                RetryEvent::AttemptStarted { attempt: 1 },
                RetryEvent::RetryScheduled {
                    attempt: 1,
                    delay: Duration::from_millis(10)
                },
                RetryEvent::AttemptStarted { attempt: 2 },
                RetryEvent::Exhausted { attempts: 2 },
            ]
        );
    }
}
