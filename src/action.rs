//! Deferred, composable request actions.
//!
//! A [`RestAction`] describes "queue this work and produce a `T`"; nothing
//! happens until a terminal operation runs it:
//! - [`queue`](RestAction::queue) and friends: fire-and-forget, callbacks
//!   invoked on dedicated callback tasks so a slow consumer can never stall
//!   rate-limit scheduling.
//! - [`complete`](RestAction::complete): await the result. 429s are retried
//!   transparently unless [`complete_with(false)`](RestAction::complete_with)
//!   asked for them.
//! - [`submit`](RestAction::submit): a cancellable handle that is itself a
//!   future.
//!
//! Combinators are pure: each returns a new action and never mutates or runs
//! the receiver. Configuration set on the outer action (deadline, checks,
//! priority) flows through to the work items it eventually queues.
//!
//! Awaiting `complete()` from inside a queue callback would re-enter the
//! pipeline that is currently delivering a result; it is detected via a task
//! marker and reported as [`RestError::Recursion`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::task::JoinHandle;

use crate::client::RestClient;
use crate::error::RestError;
use crate::request::Check;

tokio::task_local! {
    /// Set while a user callback is running; guards against `complete()`
    /// re-entrancy.
    static IN_CALLBACK: ();
}

/// Per-action settings that flow into the queued work.
#[derive(Clone)]
pub(crate) struct ActionConfig {
    pub checks: Vec<Check>,
    pub deadline_millis: u64,
    pub priority: bool,
    pub retry_on_rate_limit: bool,
    pub cancelled: Arc<AtomicBool>,
}

impl Default for ActionConfig {
    fn default() -> Self {
        Self {
            checks: Vec::new(),
            deadline_millis: 0,
            priority: false,
            retry_on_rate_limit: true,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl ActionConfig {
    /// Fold the settings of an enclosing combined action into this one.
    /// A member keeps its own deadline when it set one; checks accumulate.
    fn inherit(&mut self, outer: &ActionConfig) {
        if self.deadline_millis == 0 {
            self.deadline_millis = outer.deadline_millis;
        }
        self.checks.extend(outer.checks.iter().cloned());
        self.priority |= outer.priority;
        self.retry_on_rate_limit &= outer.retry_on_rate_limit;
    }
}

type Producer<T> =
    Box<dyn FnOnce(RestClient, ActionConfig) -> BoxFuture<'static, Result<T, RestError>> + Send>;

/// A deferred REST operation producing a `T`.
pub struct RestAction<T> {
    client: RestClient,
    config: ActionConfig,
    producer: Producer<T>,
}

impl<T> fmt::Debug for RestAction<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestAction")
            .field("deadline_millis", &self.config.deadline_millis)
            .field("priority", &self.config.priority)
            .field("checks", &self.config.checks.len())
            .finish()
    }
}

impl<T: Send + 'static> RestAction<T> {
    pub(crate) fn from_parts(client: RestClient, config: ActionConfig, producer: Producer<T>) -> Self {
        Self { client, config, producer }
    }

    pub(crate) fn new(client: RestClient, producer: Producer<T>) -> Self {
        Self::from_parts(client, ActionConfig::default(), producer)
    }

    /// An action that resolves immediately with `value`.
    pub fn ready(client: &RestClient, value: T) -> Self {
        Self::new(client.clone(), Box::new(move |_, _| async move { Ok(value) }.boxed()))
    }

    /// An action that fails immediately with `error`.
    pub fn err(client: &RestClient, error: RestError) -> Self {
        Self::new(client.clone(), Box::new(move |_, _| async move { Err(error) }.boxed()))
    }

    fn execute(self) -> BoxFuture<'static, Result<T, RestError>> {
        (self.producer)(self.client, self.config)
    }

    // ---- configuration -----------------------------------------------------

    /// Replace the pre-flight checks with a single predicate.
    pub fn set_check(mut self, check: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.config.checks = vec![Arc::new(check)];
        self
    }

    /// Add a pre-flight predicate; all checks must pass (AND semantics).
    pub fn add_check(mut self, check: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.config.checks.push(Arc::new(check));
        self
    }

    /// Absolute deadline (epoch millis). Work still queued past it is skipped
    /// and fails with a timeout, never silently dropped.
    pub fn deadline(mut self, epoch_millis: u64) -> Self {
        self.config.deadline_millis = epoch_millis;
        self
    }

    /// Relative deadline from now.
    pub fn timeout(self, timeout: Duration) -> Self {
        let now = self.client.clock().now_millis();
        let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self.deadline(now.saturating_add(millis))
    }

    /// Mark the queued work as priority: it survives bulk cancellation.
    pub fn priority(mut self) -> Self {
        self.config.priority = true;
        self
    }

    // ---- combinators -------------------------------------------------------

    /// Transform the successful result.
    pub fn map<U, F>(self, f: F) -> RestAction<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let producer = self.producer;
        RestAction::from_parts(
            self.client,
            self.config,
            Box::new(move |client, config| {
                let fut = producer(client, config);
                async move { fut.await.map(f) }.boxed()
            }),
        )
    }

    /// Chain a dependent action built from the successful result.
    pub fn flat_map<U, F>(self, f: F) -> RestAction<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> RestAction<U> + Send + 'static,
    {
        let producer = self.producer;
        RestAction::from_parts(
            self.client,
            self.config,
            Box::new(move |client, config| {
                let deadline = config.deadline_millis;
                let fut = producer(client, config);
                async move {
                    let value = fut.await?;
                    let mut next = f(value);
                    if next.config.deadline_millis == 0 {
                        next.config.deadline_millis = deadline;
                    }
                    next.execute().await
                }
                .boxed()
            }),
        )
    }

    /// Chain a dependent action only when `predicate` holds; otherwise the
    /// original value passes through untouched.
    pub fn flat_map_if<P, F>(self, predicate: P, f: F) -> RestAction<T>
    where
        P: FnOnce(&T) -> bool + Send + 'static,
        F: FnOnce(T) -> RestAction<T> + Send + 'static,
    {
        let client = self.client.clone();
        self.flat_map(move |value| {
            if predicate(&value) {
                f(value)
            } else {
                RestAction::ready(&client, value)
            }
        })
    }

    /// Recover from any failure with a fallback value.
    pub fn on_error_map<F>(self, f: F) -> RestAction<T>
    where
        F: FnOnce(RestError) -> T + Send + 'static,
    {
        self.on_error_map_if(|_| true, f)
    }

    /// Recover from failures matching `predicate` with a fallback value.
    pub fn on_error_map_if<P, F>(self, predicate: P, f: F) -> RestAction<T>
    where
        P: FnOnce(&RestError) -> bool + Send + 'static,
        F: FnOnce(RestError) -> T + Send + 'static,
    {
        let producer = self.producer;
        RestAction::from_parts(
            self.client,
            self.config,
            Box::new(move |client, config| {
                let fut = producer(client, config);
                async move {
                    match fut.await {
                        Ok(value) => Ok(value),
                        Err(err) if predicate(&err) => Ok(f(err)),
                        Err(err) => Err(err),
                    }
                }
                .boxed()
            }),
        )
    }

    /// Recover from any failure with a fallback action.
    pub fn on_error_flat_map<F>(self, f: F) -> RestAction<T>
    where
        F: FnOnce(RestError) -> RestAction<T> + Send + 'static,
    {
        self.on_error_flat_map_if(|_| true, f)
    }

    /// Recover from failures matching `predicate` with a fallback action.
    pub fn on_error_flat_map_if<P, F>(self, predicate: P, f: F) -> RestAction<T>
    where
        P: FnOnce(&RestError) -> bool + Send + 'static,
        F: FnOnce(RestError) -> RestAction<T> + Send + 'static,
    {
        let producer = self.producer;
        RestAction::from_parts(
            self.client,
            self.config,
            Box::new(move |client, config| {
                let fut = producer(client, config);
                async move {
                    match fut.await {
                        Ok(value) => Ok(value),
                        Err(err) if predicate(&err) => f(err).execute().await,
                        Err(err) => Err(err),
                    }
                }
                .boxed()
            }),
        )
    }

    /// Run both actions concurrently and combine their results. If either
    /// fails, the other is cancelled if still pending and the combined action
    /// fails with that error.
    pub fn and<U, V, F>(self, other: RestAction<U>, combiner: F) -> RestAction<V>
    where
        U: Send + 'static,
        V: Send + 'static,
        F: FnOnce(T, U) -> V + Send + 'static,
    {
        let client = self.client.clone();
        let cancel_left = self.config.cancelled.clone();
        let cancel_right = other.config.cancelled.clone();
        RestAction::new(
            client,
            Box::new(move |_, config| {
                let mut left = self;
                let mut right = other;
                left.config.inherit(&config);
                right.config.inherit(&config);
                async move {
                    match futures::future::try_join(left.execute(), right.execute()).await {
                        Ok((left, right)) => Ok(combiner(left, right)),
                        Err(err) => {
                            cancel_left.store(true, Ordering::SeqCst);
                            cancel_right.store(true, Ordering::SeqCst);
                            Err(err)
                        }
                    }
                }
                .boxed()
            }),
        )
    }

    /// Run both actions concurrently, producing a tuple.
    pub fn zip<U: Send + 'static>(self, other: RestAction<U>) -> RestAction<(T, U)> {
        self.and(other, |left, right| (left, right))
    }

    /// Run all actions concurrently, producing their results in order. The
    /// first failure cancels every still-pending sibling and fails the whole.
    pub fn all_of(actions: Vec<RestAction<T>>) -> RestAction<Vec<T>> {
        assert!(!actions.is_empty(), "all_of requires at least one action");
        let client = actions[0].client.clone();
        let flags: Vec<Arc<AtomicBool>> =
            actions.iter().map(|a| a.config.cancelled.clone()).collect();
        RestAction::new(
            client,
            Box::new(move |_, config| {
                let mut actions = actions;
                for action in &mut actions {
                    action.config.inherit(&config);
                }
                async move {
                    let futures = actions.into_iter().map(RestAction::execute);
                    match futures::future::try_join_all(futures).await {
                        Ok(values) => Ok(values),
                        Err(err) => {
                            for flag in &flags {
                                flag.store(true, Ordering::SeqCst);
                            }
                            Err(err)
                        }
                    }
                }
                .boxed()
            }),
        )
    }

    /// Make failures a value instead of a short-circuit: useful with
    /// [`all_of`](Self::all_of) when one failure must not cancel the rest.
    pub fn map_to_result(self) -> RestAction<Result<T, RestError>> {
        let producer = self.producer;
        RestAction::from_parts(
            self.client,
            self.config,
            Box::new(move |client, config| {
                let fut = producer(client, config);
                async move { Ok(fut.await) }.boxed()
            }),
        )
    }

    /// Wait before running.
    pub fn delay(self, delay: Duration) -> RestAction<T> {
        let producer = self.producer;
        RestAction::from_parts(
            self.client,
            self.config,
            Box::new(move |client, config| {
                let sleeper = client.sleeper();
                async move {
                    sleeper.sleep(delay).await;
                    producer(client, config).await
                }
                .boxed()
            }),
        )
    }

    // ---- terminals ---------------------------------------------------------

    /// Await the result. Must not be awaited from inside a queue callback.
    pub async fn complete(self) -> Result<T, RestError> {
        if IN_CALLBACK.try_with(|_| ()).is_ok() {
            tracing::error!(
                "complete() awaited inside a queue callback; this would re-enter the \
                 callback pipeline"
            );
            return Err(RestError::Recursion);
        }
        self.execute().await
    }

    /// Like [`complete`](Self::complete), but with `retry_on_rate_limit` set
    /// to `false` the first 429 surfaces as [`RestError::RateLimited`]
    /// instead of being absorbed.
    pub async fn complete_with(mut self, retry_on_rate_limit: bool) -> Result<T, RestError> {
        self.config.retry_on_rate_limit = retry_on_rate_limit;
        self.complete().await
    }

    /// Queue with default handlers: success is dropped, failure is logged.
    pub fn queue(self) {
        self.queue_with(None, None);
    }

    /// Queue with a success callback; failures are logged.
    pub fn queue_then(self, on_success: impl FnOnce(T) + Send + 'static) {
        self.queue_with(Some(Box::new(on_success)), None);
    }

    /// Queue with success and failure callbacks.
    pub fn queue_handle(
        self,
        on_success: impl FnOnce(T) + Send + 'static,
        on_failure: impl FnOnce(RestError) + Send + 'static,
    ) {
        self.queue_with(Some(Box::new(on_success)), Some(Box::new(on_failure)));
    }

    fn queue_with(
        self,
        on_success: Option<Box<dyn FnOnce(T) + Send>>,
        on_failure: Option<Box<dyn FnOnce(RestError) + Send>>,
    ) {
        tokio::spawn(async move {
            match self.execute().await {
                Ok(value) => {
                    if let Some(callback) = on_success {
                        dispatch_callback(move || callback(value));
                    }
                }
                Err(err) => match on_failure {
                    Some(callback) => dispatch_callback(move || callback(err)),
                    None => {
                        if err.is_cancelled() {
                            tracing::debug!(error = %err, "queued request cancelled");
                        } else {
                            tracing::error!(error = %err, "queued request failed");
                        }
                    }
                },
            }
        });
    }

    /// Schedule the eventual `queue()` after a delay.
    pub fn queue_after(self, delay: Duration) -> JoinHandle<()> {
        let sleeper = self.client.sleeper();
        tokio::spawn(async move {
            sleeper.sleep(delay).await;
            self.queue();
        })
    }

    /// Start the action and return a cancellable, awaitable handle.
    pub fn submit(self) -> SubmittedAction<T> {
        let cancelled = self.config.cancelled.clone();
        let handle = tokio::spawn(self.execute());
        SubmittedAction { handle, cancelled }
    }
}

impl RestAction<crate::response::RestResponse> {
    /// Deserialize the JSON body into `T` when the action resolves.
    pub fn parse<T>(self) -> RestAction<T>
    where
        T: serde::de::DeserializeOwned + Send + 'static,
    {
        let producer = self.producer;
        RestAction::from_parts(
            self.client,
            self.config,
            Box::new(move |client, config| {
                let fut = producer(client, config);
                async move {
                    let response = fut.await?;
                    serde_json::from_slice(response.body())
                        .map_err(|err| RestError::Parsing { detail: err.to_string() })
                }
                .boxed()
            }),
        )
    }
}

/// Callbacks run on their own spawned tasks, marked so `complete()` can
/// detect re-entrancy from inside them.
fn dispatch_callback(callback: impl FnOnce() + Send + 'static) {
    tokio::spawn(IN_CALLBACK.scope((), async move { callback() }));
}

/// Handle to a started action: cancel it, or await its result.
pub struct SubmittedAction<T> {
    handle: JoinHandle<Result<T, RestError>>,
    cancelled: Arc<AtomicBool>,
}

impl<T> SubmittedAction<T> {
    /// Cooperatively cancel: pending work is skipped at dequeue time; an
    /// already-executing HTTP call is not interrupted, only its result is
    /// suppressed.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.handle.abort();
    }

    /// Whether `cancel` was called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl<T: Send + 'static> std::future::IntoFuture for SubmittedAction<T> {
    type Output = Result<T, RestError>;
    type IntoFuture = BoxFuture<'static, Result<T, RestError>>;

    fn into_future(self) -> Self::IntoFuture {
        async move {
            match self.handle.await {
                Ok(result) => result,
                Err(join_err) if join_err.is_panic() => {
                    std::panic::resume_unwind(join_err.into_panic())
                }
                Err(_) => Err(RestError::Cancelled),
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, TrackingSleeper};

    fn client() -> RestClient {
        RestClient::builder("https://api.example.com").build().unwrap()
    }

    fn client_with(clock: ManualClock, sleeper: TrackingSleeper) -> RestClient {
        RestClient::builder("https://api.example.com")
            .clock(Arc::new(clock))
            .sleeper(Arc::new(sleeper))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn map_transforms_the_result() {
        let client = client();
        let value = RestAction::ready(&client, 21).map(|v| v * 2).complete().await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn flat_map_chains_dependent_actions() {
        let client = client();
        let chained = client.clone();
        let value = RestAction::ready(&client, 3)
            .flat_map(move |v| RestAction::ready(&chained, v.to_string()))
            .complete()
            .await
            .unwrap();
        assert_eq!(value, "3");
    }

    #[tokio::test]
    async fn flat_map_if_passes_through_when_predicate_fails() {
        let client = client();
        let chained = client.clone();
        let value = RestAction::ready(&client, 5)
            .flat_map_if(|v| *v > 10, move |_| RestAction::ready(&chained, 999))
            .complete()
            .await
            .unwrap();
        assert_eq!(value, 5);
    }

    #[tokio::test]
    async fn map_does_not_swallow_failure() {
        let client = client();
        let err = RestAction::<i32>::err(&client, RestError::Shutdown)
            .map(|v| v + 1)
            .complete()
            .await
            .unwrap_err();
        assert!(matches!(err, RestError::Shutdown));
    }

    #[tokio::test]
    async fn on_error_map_recovers_matching_failures_only() {
        let client = client();
        let value = RestAction::<i32>::err(&client, RestError::Cancelled)
            .on_error_map(|_| -1)
            .complete()
            .await
            .unwrap();
        assert_eq!(value, -1);

        let err = RestAction::<i32>::err(&client, RestError::Shutdown)
            .on_error_map_if(RestError::is_cancelled, |_| -1)
            .complete()
            .await
            .unwrap_err();
        assert!(matches!(err, RestError::Shutdown));
    }

    #[tokio::test]
    async fn on_error_flat_map_runs_a_fallback_action() {
        let client = client();
        let fallback = client.clone();
        let value = RestAction::<i32>::err(&client, RestError::Cancelled)
            .on_error_flat_map(move |_| RestAction::ready(&fallback, 7))
            .complete()
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn zip_combines_and_fails_fast() {
        let client = client();
        let pair = RestAction::ready(&client, 1)
            .zip(RestAction::ready(&client, "a"))
            .complete()
            .await
            .unwrap();
        assert_eq!(pair, (1, "a"));

        let err = RestAction::ready(&client, 1)
            .zip(RestAction::<i32>::err(&client, RestError::Shutdown))
            .complete()
            .await
            .unwrap_err();
        assert!(matches!(err, RestError::Shutdown));
    }

    #[tokio::test]
    async fn all_of_keeps_order() {
        let client = client();
        let values = RestAction::all_of(vec![
            RestAction::ready(&client, 1),
            RestAction::ready(&client, 2),
            RestAction::ready(&client, 3),
        ])
        .complete()
        .await
        .unwrap();
        assert_eq!(values, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn map_to_result_turns_failure_into_a_value() {
        let client = client();
        let result = RestAction::<i32>::err(&client, RestError::Cancelled)
            .map_to_result()
            .complete()
            .await
            .unwrap();
        assert!(matches!(result, Err(RestError::Cancelled)));
    }

    #[tokio::test]
    async fn delay_waits_through_the_injected_sleeper() {
        let sleeper = TrackingSleeper::new();
        let client = client_with(ManualClock::new(0), sleeper.clone());
        let value = RestAction::ready(&client, 1)
            .delay(Duration::from_secs(5))
            .complete()
            .await
            .unwrap();
        assert_eq!(value, 1);
        assert_eq!(sleeper.calls(), vec![Duration::from_secs(5)]);
    }

    #[tokio::test]
    async fn timeout_sets_an_absolute_deadline() {
        let client = client_with(ManualClock::new(10_000), TrackingSleeper::new());
        let action = RestAction::ready(&client, ()).timeout(Duration::from_secs(2));
        assert_eq!(action.config.deadline_millis, 12_000);
    }

    #[tokio::test]
    async fn combined_actions_forward_their_config_to_members() {
        fn observing(client: &RestClient) -> RestAction<(u64, bool, usize)> {
            RestAction::new(
                client.clone(),
                Box::new(|_, config| {
                    async move { Ok((config.deadline_millis, config.priority, config.checks.len())) }
                        .boxed()
                }),
            )
        }

        let client = client();
        let (left, right) = observing(&client)
            .zip(observing(&client))
            .deadline(5_000)
            .priority()
            .add_check(|| true)
            .complete()
            .await
            .unwrap();
        assert_eq!(left, (5_000, true, 1));
        assert_eq!(right, (5_000, true, 1));

        // A member's own deadline wins over the combined action's.
        let (left, _) = observing(&client)
            .deadline(2_000)
            .zip(observing(&client))
            .deadline(5_000)
            .complete()
            .await
            .unwrap();
        assert_eq!(left.0, 2_000);

        let values = RestAction::all_of(vec![observing(&client), observing(&client)])
            .deadline(7_000)
            .complete()
            .await
            .unwrap();
        assert!(values.iter().all(|v| v.0 == 7_000));
    }

    #[tokio::test]
    async fn checks_accumulate() {
        let client = client();
        let action = RestAction::ready(&client, ())
            .set_check(|| true)
            .add_check(|| false);
        assert_eq!(action.config.checks.len(), 2);
        assert!(!action.config.checks.iter().all(|c| c()));
    }

    #[tokio::test]
    async fn submit_can_be_awaited() {
        let client = client();
        let value = RestAction::ready(&client, 9).submit().await.unwrap();
        assert_eq!(value, 9);
    }

    #[tokio::test]
    async fn submit_cancel_resolves_cancelled() {
        let client = client();
        // Long real delay; cancel aborts it well before it elapses.
        let submitted = RestAction::ready(&client, 1).delay(Duration::from_secs(60)).submit();
        submitted.cancel();
        assert!(submitted.is_cancelled());
        let err = submitted.await.unwrap_err();
        assert!(matches!(err, RestError::Cancelled));
    }

    #[tokio::test]
    async fn complete_inside_a_queue_callback_is_rejected() {
        let client = client();
        let inner = client.clone();
        let (tx, rx) = tokio::sync::oneshot::channel();
        RestAction::ready(&client, ()).queue_then(move |()| {
            let result =
                futures::executor::block_on(RestAction::ready(&inner, 1).complete());
            let _ = tx.send(result);
        });
        let result = rx.await.unwrap();
        assert!(matches!(result, Err(RestError::Recursion)));
    }
}

