use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::time::Instant;

use crate::backend::{
    BackendError, BackendErrorCode, BackendResult, BatchOp, Credentials, Direction, Document,
    DocumentStoreArc, Identity, IdentityCallback, IdentityProviderArc, MessageHandler,
    MessagePayload, MessagingProviderArc, Query, SignInResult, SnapshotCallback,
};
use crate::config::SessionConfig;
use crate::error::{not_signed_in, shut_down, SessionError, SessionErrorCode, SessionResult};
use crate::janitor::{standard_jobs, Janitor};
use crate::listener::{ListenerRegistry, ResourceKind, SubscriptionKey};
use crate::notifications::NotificationCenter;
use crate::platform::runtime::{sleep, spawn_detached};
use crate::retry::{RetryCoordinator, RetryEvent, RetryFuture, RetryStatus};
use crate::util::subscribe::{PartialObserver, Unsubscribe};

use super::directory::{UserDirectory, USERS_COLLECTION};
use super::state::{AuthIdentity, DetailedStatus, SessionState};

const NOTIFICATIONS_COLLECTION: &str = "notifications";
const FOREGROUND_FILTER: &str = "foreground";

/// Result of one successful initialization pass.
#[derive(Clone, Debug, PartialEq, Eq)]
enum PassOutcome {
    Ready(String),
    SignedOut,
}

enum Transition {
    Unchanged,
    SignedOut,
    SignedIn(String),
}

struct SessionInner {
    config: SessionConfig,
    identity: IdentityProviderArc,
    store: DocumentStoreArc,
    messaging: MessagingProviderArc,
    retry: RetryCoordinator<PassOutcome>,
    listeners: ListenerRegistry,
    janitor: Janitor,
    users: UserDirectory,
    notifications: NotificationCenter,
    state: Mutex<SessionState>,
    last_identity: Mutex<Option<AuthIdentity>>,
    permissions: Mutex<Vec<String>>,
    push_token: Mutex<Option<String>>,
    auth_unsubscribe: Mutex<Option<Unsubscribe>>,
    status_senders: Mutex<Vec<async_channel::Sender<DetailedStatus>>>,
    background_registered: AtomicBool,
    this: Weak<SessionInner>,
}

/// Owns the signed-in session: initialization with retries, live listeners,
/// maintenance jobs and the reaction to identity changes.
///
/// Each initialization pass runs these steps in order:
///
/// 1. wait (bounded) for the identity provider to report an identity;
/// 2. check that the document store answers a one-record read;
/// 3. refresh the identity's claims and make sure its profile exists;
/// 4. request push permission and register the push token;
/// 5. arm the notification feed, push handlers and janitor jobs.
///
/// Only a failure in step 4 fails the pass and triggers a backoff retry.
/// When retries run out the session becomes [`SessionState::Degraded`].
/// The identity listener is armed once by [`SessionManager::start`].
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionInner>,
}

impl SessionManager {
    pub fn new(
        config: SessionConfig,
        identity: IdentityProviderArc,
        store: DocumentStoreArc,
        messaging: MessagingProviderArc,
    ) -> Self {
        let inner = Arc::new_cyclic(|this: &Weak<SessionInner>| {
            let retry = RetryCoordinator::new(config.retry.clone());
            let observer = this.clone();
            // The observer list lives inside the coordinator; the returned
            // handle is only needed to detach early.
            let _detach = retry.on_event(PartialObserver::new().with_next(
                move |event: &RetryEvent| {
                    if let Some(inner) = observer.upgrade() {
                        inner.on_retry_event(event);
                    }
                },
            ));

            SessionInner {
                users: UserDirectory::new(Arc::clone(&store), config.user_cache_ttl()),
                janitor: Janitor::new(Arc::clone(&store)),
                listeners: ListenerRegistry::new(),
                notifications: NotificationCenter::new(),
                retry,
                identity,
                store,
                messaging,
                config,
                state: Mutex::new(SessionState::Idle),
                last_identity: Mutex::new(None),
                permissions: Mutex::new(Vec::new()),
                push_token: Mutex::new(None),
                auth_unsubscribe: Mutex::new(None),
                status_senders: Mutex::new(Vec::new()),
                background_registered: AtomicBool::new(false),
                this: this.clone(),
            }
        });
        Self { inner }
    }

    /// Arms the identity listener and runs the first initialization pass.
    pub async fn start(&self) -> DetailedStatus {
        self.inner.arm_identity_listener();
        self.initialize().await
    }

    /// Runs an initialization pass, or joins the one already running.
    pub async fn initialize(&self) -> DetailedStatus {
        let pass = self.inner.begin_pass();
        let result = pass.await;
        self.inner.finish_pass(result)
    }

    /// Tears the session down, clears the retry counter and initializes
    /// again. Joins the running pass instead when one is in flight.
    pub async fn reinitialize(&self) -> DetailedStatus {
        log::info!("manual session reinitialization requested");
        let pass = self.inner.restart();
        let result = pass.await;
        self.inner.finish_pass(result)
    }

    /// Signs in through the identity provider and warms the user directory.
    /// The identity listener starts the matching initialization pass.
    pub async fn sign_in(&self, credentials: &Credentials) -> SessionResult<SignInResult> {
        let result = self.inner.identity.sign_in(credentials).await?;
        if let Err(err) = self.inner.users.ensure_profile(&result.identity).await {
            log::warn!(
                "could not prepare profile for user {}: {err}",
                result.identity.uid
            );
        }
        Ok(result)
    }

    /// Signs out and tears the session down.
    pub async fn sign_out(&self) -> SessionResult<()> {
        self.inner.identity.sign_out().await?;
        self.inner.handle_identity_change(None);
        Ok(())
    }

    /// Detaches from the identity provider and releases every listener and job.
    pub fn stop(&self) {
        let unsubscribe = self.inner.auth_unsubscribe.lock().unwrap().take();
        if let Some(unsubscribe) = unsubscribe {
            unsubscribe();
        }
        self.inner.teardown();
        self.inner.last_identity.lock().unwrap().take();
        self.inner.set_state(SessionState::Idle);
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock().unwrap()
    }

    pub fn detailed_status(&self) -> DetailedStatus {
        self.inner.detailed_status()
    }

    /// Returns a receiver that gets the current status immediately and a new
    /// one on every state transition or retry attempt.
    pub fn status_updates(&self) -> async_channel::Receiver<DetailedStatus> {
        let (sender, receiver) = async_channel::unbounded();
        let _ = sender.try_send(self.inner.detailed_status());
        self.inner.status_senders.lock().unwrap().push(sender);
        receiver
    }

    pub fn on_retry_event(&self, observer: PartialObserver<RetryEvent>) -> Unsubscribe {
        self.inner.retry.on_event(observer)
    }

    pub fn retry_status(&self) -> RetryStatus {
        self.inner.retry.status()
    }

    pub fn current_identity(&self) -> Option<AuthIdentity> {
        self.inner.last_identity.lock().unwrap().clone()
    }

    /// Claim names from the most recent forced token refresh.
    pub fn permissions(&self) -> Vec<String> {
        self.inner.permissions.lock().unwrap().clone()
    }

    /// Forces a token refresh so that changed custom claims take effect
    /// without waiting for the next initialization pass.
    pub async fn refresh_permissions(&self) -> SessionResult<Vec<String>> {
        if self.inner.identity.current_identity().is_none() {
            return Err(not_signed_in());
        }
        let token = self.inner.identity.get_token(true).await?;
        let names = claim_names(&token.claims);
        *self.inner.permissions.lock().unwrap() = names.clone();
        Ok(names)
    }

    pub fn has_permission(&self, name: &str) -> bool {
        self.inner
            .permissions
            .lock()
            .unwrap()
            .iter()
            .any(|permission| permission == name)
    }

    pub fn push_token(&self) -> Option<String> {
        self.inner.push_token.lock().unwrap().clone()
    }

    /// Fetches a fresh push token and stores it on the user's profile.
    pub async fn refresh_push_token(&self) -> SessionResult<String> {
        let uid = self.inner.signed_in_uid()?;
        let token = self.inner.save_push_token(&uid).await?;
        log::debug!("push token refreshed for {uid}");
        Ok(token)
    }

    /// Marks one notification as read in the document store.
    pub async fn mark_notification_read(&self, id: &str) -> SessionResult<()> {
        self.inner.signed_in_uid()?;
        self.inner
            .store
            .commit(vec![mark_read_op(id)])
            .await?;
        self.inner.notifications.mark_read(&[id.to_string()]);
        Ok(())
    }

    /// Marks every unread notification of the signed-in user as read in a
    /// single batch. Returns how many were updated.
    pub async fn mark_all_read(&self) -> SessionResult<usize> {
        let uid = self.inner.signed_in_uid()?;
        let query = Query::collection(NOTIFICATIONS_COLLECTION)
            .where_eq("userId", uid.as_str())
            .where_eq("read", false);
        let ids: Vec<String> = self
            .inner
            .store
            .query(&query)
            .await?
            .into_iter()
            .map(|document| document.id)
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }

        self.inner
            .store
            .commit(ids.iter().map(|id| mark_read_op(id)).collect())
            .await?;
        self.inner.notifications.mark_read(&ids);
        log::debug!("marked {} notifications read for {uid}", ids.len());
        Ok(ids.len())
    }

    pub async fn delete_notification(&self, id: &str) -> SessionResult<()> {
        self.inner.signed_in_uid()?;
        self.inner
            .store
            .commit(vec![BatchOp::Delete {
                collection: NOTIFICATIONS_COLLECTION.to_string(),
                id: id.to_string(),
            }])
            .await?;
        self.inner.notifications.forget(id);
        Ok(())
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.inner.listeners
    }

    pub fn janitor(&self) -> &Janitor {
        &self.inner.janitor
    }

    pub fn notifications(&self) -> &NotificationCenter {
        &self.inner.notifications
    }

    pub fn users(&self) -> &UserDirectory {
        &self.inner.users
    }
}

impl SessionInner {
    fn arm_identity_listener(&self) {
        if self.auth_unsubscribe.lock().unwrap().is_some() {
            return;
        }
        {
            let mut last = self.last_identity.lock().unwrap();
            if last.is_none() {
                *last = self
                    .identity
                    .current_identity()
                    .map(|identity| AuthIdentity::observed(identity.uid));
            }
        }

        let this = self.this.clone();
        let callback: IdentityCallback = Arc::new(move |identity| {
            if let Some(inner) = this.upgrade() {
                inner.handle_identity_change(identity);
            }
        });
        let unsubscribe = self.identity.on_identity_change(callback);
        *self.auth_unsubscribe.lock().unwrap() = Some(unsubscribe);
    }

    fn handle_identity_change(&self, identity: Option<Identity>) {
        let transition = {
            let mut last = self.last_identity.lock().unwrap();
            match identity {
                Some(next) => {
                    let unchanged = last.as_ref().is_some_and(|previous| previous.id == next.uid);
                    if unchanged {
                        if let Some(previous) = last.as_mut() {
                            previous.last_observed_at = Utc::now();
                        }
                        Transition::Unchanged
                    } else {
                        *last = Some(AuthIdentity::observed(next.uid.clone()));
                        Transition::SignedIn(next.uid)
                    }
                }
                None if last.is_none() => Transition::Unchanged,
                None => {
                    *last = None;
                    Transition::SignedOut
                }
            }
        };

        match transition {
            Transition::Unchanged => log::debug!("identity event without a change; ignoring"),
            Transition::SignedOut => {
                log::info!("identity signed out; tearing down session");
                self.teardown();
                self.set_state(SessionState::SignedOut);
            }
            Transition::SignedIn(uid) => {
                log::info!("identity changed to {uid}; reinitializing session");
                self.spawn_restart();
            }
        }
    }

    fn begin_pass(&self) -> RetryFuture<PassOutcome> {
        self.set_state(SessionState::Initializing);
        let this = self.this.clone();
        self.retry.run(move || {
            let this = this.clone();
            async move {
                match this.upgrade() {
                    Some(inner) => inner.run_pass().await,
                    None => Err(shut_down("Session manager was dropped")),
                }
            }
        })
    }

    fn restart(&self) -> RetryFuture<PassOutcome> {
        if self.retry.is_in_flight() {
            log::debug!("initialization already running; joining it");
            return self.begin_pass();
        }
        self.teardown();
        self.retry.reset();
        self.begin_pass()
    }

    fn spawn_restart(&self) {
        let Some(inner) = self.this.upgrade() else {
            return;
        };
        let pass = inner.restart();
        spawn_detached(async move {
            let result = pass.await;
            inner.finish_pass(result);
        });
    }

    fn finish_pass(&self, result: SessionResult<PassOutcome>) -> DetailedStatus {
        let current = self
            .last_identity
            .lock()
            .unwrap()
            .as_ref()
            .map(|identity| identity.id.clone());

        match result {
            Ok(outcome) => {
                let expected = match &outcome {
                    PassOutcome::Ready(uid) => Some(uid.clone()),
                    PassOutcome::SignedOut => None,
                };
                if expected == current {
                    self.set_state(match outcome {
                        PassOutcome::Ready(_) => SessionState::Ready,
                        PassOutcome::SignedOut => SessionState::SignedOut,
                    });
                } else if current.is_none() {
                    log::info!("identity signed out during initialization; tearing down");
                    self.teardown();
                    self.set_state(SessionState::SignedOut);
                } else {
                    log::info!("identity changed during initialization; starting over");
                    self.spawn_restart();
                }
            }
            Err(err) if err.code == SessionErrorCode::ShutDown => {}
            Err(err) => {
                if current.is_none() {
                    self.set_state(SessionState::SignedOut);
                } else {
                    log::warn!("session initialization gave up, continuing degraded: {err}");
                    self.set_state(SessionState::Degraded);
                }
            }
        }
        self.detailed_status()
    }

    async fn run_pass(&self) -> SessionResult<PassOutcome> {
        let Some(identity) = self.wait_for_identity().await else {
            log::info!(
                "no identity after {:?}; session stays signed out",
                self.config.auth_ready_timeout()
            );
            self.last_identity.lock().unwrap().take();
            return Ok(PassOutcome::SignedOut);
        };
        self.observe(&identity);

        self.check_reachable().await;

        self.refresh_claims().await;
        if let Err(err) = self.users.ensure_profile(&identity).await {
            log::warn!("could not prepare profile for user {}: {err}", identity.uid);
        }

        self.register_push(&identity.uid).await?;

        self.arm(&identity.uid);
        log::info!("session initialized for user {}", identity.uid);
        Ok(PassOutcome::Ready(identity.uid))
    }

    async fn wait_for_identity(&self) -> Option<Identity> {
        let deadline = Instant::now() + self.config.auth_ready_timeout();
        loop {
            if let Some(identity) = self.identity.current_identity() {
                return Some(identity);
            }
            if Instant::now() >= deadline {
                return None;
            }
            sleep(self.config.auth_poll_interval()).await;
        }
    }

    fn observe(&self, identity: &Identity) {
        let mut last = self.last_identity.lock().unwrap();
        match last.as_mut() {
            Some(previous) if previous.id == identity.uid => {
                previous.last_observed_at = Utc::now();
                return;
            }
            _ => {}
        }
        *last = Some(AuthIdentity::observed(identity.uid.clone()));
    }

    async fn check_reachable(&self) {
        let query = Query::collection(NOTIFICATIONS_COLLECTION).limit(1);
        match self.store.query(&query).await {
            Ok(_) => log::debug!("document store reachable"),
            Err(err) => log::warn!("document store reachability check failed: {err}{}", err.diagnostic_hint()),
        }
    }

    async fn refresh_claims(&self) {
        match self.identity.get_token(true).await {
            Ok(token) => {
                let names = claim_names(&token.claims);
                log::debug!("refreshed claims: {names:?}");
                *self.permissions.lock().unwrap() = names;
            }
            Err(err) => log::warn!("claims refresh failed: {err}"),
        }
    }

    async fn register_push(&self, uid: &str) -> SessionResult<()> {
        let permission = self.messaging.request_permission().await?;
        if !permission.is_enabled() {
            log::info!("push permission is {permission:?}; skipping token registration");
            return Ok(());
        }

        self.save_push_token(uid).await?;
        Ok(())
    }

    async fn save_push_token(&self, uid: &str) -> SessionResult<String> {
        let token = self.messaging.get_token().await?;
        let mut patch = Map::new();
        patch.insert("fcmToken".into(), Value::from(token.clone()));
        patch.insert(
            "fcmTokenUpdatedAt".into(),
            Value::from(Utc::now().timestamp_millis()),
        );
        self.store.write(USERS_COLLECTION, uid, patch).await?;
        self.users.invalidate(uid);
        *self.push_token.lock().unwrap() = Some(token.clone());
        Ok(token)
    }

    fn signed_in_uid(&self) -> SessionResult<String> {
        self.identity
            .current_identity()
            .map(|identity| identity.uid)
            .ok_or_else(not_signed_in)
    }

    fn arm(&self, uid: &str) {
        self.arm_feed(uid, false);
        self.arm_foreground();
        self.arm_background();
        if self.config.janitor.enabled {
            for job in standard_jobs(&self.config.janitor) {
                self.janitor.schedule(job);
            }
        }
    }

    /// Subscribes the user's notification feed. The simplified variant drops
    /// ordering and limit so it needs no composite index.
    fn arm_feed(&self, uid: &str, simplified: bool) {
        let filter = if simplified {
            format!("user:{uid}:simple")
        } else {
            format!("user:{uid}")
        };
        let mut query = Query::collection(NOTIFICATIONS_COLLECTION).where_eq("userId", uid);
        if !simplified {
            query = query
                .order_by("createdAt", Direction::Descending)
                .limit(self.config.notification_feed_limit);
        }

        let key = SubscriptionKey::new(ResourceKind::Notifications, filter.clone());
        let this = self.this.clone();
        let owner = uid.to_string();
        let store = Arc::clone(&self.store);
        let result = self
            .listeners
            .subscribe(ResourceKind::Notifications, filter, move || {
                let callback: SnapshotCallback = Arc::new(move |snapshot| {
                    if let Some(inner) = this.upgrade() {
                        inner.on_feed_snapshot(&key, &owner, simplified, snapshot);
                    }
                });
                store.subscribe(query, callback)
            });

        if let Err(err) = result {
            match err.backend_error() {
                Some(backend) if !simplified && needs_fallback(backend) => {
                    log::warn!("notification feed rejected; retrying with the simplified query");
                    self.arm_feed(uid, true);
                }
                _ => self.notifications.report_error(&err),
            }
        }
    }

    fn on_feed_snapshot(
        &self,
        key: &SubscriptionKey,
        uid: &str,
        simplified: bool,
        snapshot: BackendResult<Vec<Document>>,
    ) {
        match snapshot {
            Ok(documents) => {
                let delivered = self.notifications.ingest_snapshot(&documents);
                if delivered > 0 {
                    log::debug!("{delivered} new notifications for {uid}");
                }
            }
            Err(err) => {
                self.listeners.report_error(key, &err);
                if !simplified && needs_fallback(&err) && self.is_current(uid) {
                    log::warn!(
                        "notification feed for {uid} failed; falling back to the simplified query"
                    );
                    self.arm_feed(uid, true);
                } else {
                    self.notifications.report_error(&SessionError::from(err));
                }
            }
        }
    }

    fn arm_foreground(&self) {
        let this = self.this.clone();
        let messaging = Arc::clone(&self.messaging);
        let result = self
            .listeners
            .subscribe(ResourceKind::PushMessages, FOREGROUND_FILTER, move || {
                let handler: MessageHandler = Arc::new(move |payload| {
                    if let Some(inner) = this.upgrade() {
                        inner.on_push(payload);
                    }
                });
                Ok(messaging.on_foreground_message(handler))
            });
        if let Err(err) = result {
            log::warn!("could not attach foreground push handler: {err}");
        }
    }

    /// The messaging provider keeps one background handler for the life of
    /// the process, so it is registered once and ignores messages while
    /// signed out.
    fn arm_background(&self) {
        if self.background_registered.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = self.this.clone();
        self.messaging
            .on_background_message(Arc::new(move |payload| {
                let Some(inner) = this.upgrade() else {
                    return;
                };
                let signed_in = inner.last_identity.lock().unwrap().is_some();
                if signed_in {
                    inner.on_push(payload);
                } else {
                    log::debug!("background push while signed out; ignoring");
                }
            }));
    }

    fn on_push(&self, payload: MessagePayload) {
        match self.notifications.ingest_push(&payload) {
            Ok(true) => log::debug!("push message {:?} delivered", payload.message_id),
            Ok(false) => log::debug!("push message {:?} already delivered", payload.message_id),
            Err(err) => log::warn!("dropping push message {:?}: {err}", payload.message_id),
        }
    }

    fn is_current(&self, uid: &str) -> bool {
        self.last_identity
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|identity| identity.id == uid)
    }

    fn teardown(&self) {
        let listeners = self.listeners.unsubscribe_all();
        let jobs = self.janitor.stop_all();
        self.users.clear();
        self.notifications.clear();
        self.permissions.lock().unwrap().clear();
        self.push_token.lock().unwrap().take();
        if listeners > 0 || jobs > 0 {
            log::info!("session torn down: {listeners} listeners, {jobs} janitor jobs");
        }
    }

    fn on_retry_event(&self, event: &RetryEvent) {
        match event {
            RetryEvent::AttemptStarted { attempt } => log::info!(
                "session initialization attempt {attempt}/{}",
                self.config.retry.max_attempts
            ),
            RetryEvent::RetryScheduled { attempt, delay } => {
                log::info!("session initialization attempt {attempt} failed; retrying in {delay:?}")
            }
            _ => {}
        }
        self.publish();
    }

    fn set_state(&self, state: SessionState) {
        let changed = {
            let mut current = self.state.lock().unwrap();
            let changed = *current != state;
            *current = state;
            changed
        };
        if changed {
            log::info!("session state: {state}");
            self.publish();
        }
    }

    fn detailed_status(&self) -> DetailedStatus {
        let state = *self.state.lock().unwrap();
        let retry = self.retry.status();
        DetailedStatus {
            state,
            is_initialized: state.is_initialized(),
            attempts: retry.attempts,
            max_attempts: retry.max_attempts,
            last_error: retry.last_error,
        }
    }

    fn publish(&self) {
        let status = self.detailed_status();
        self.status_senders
            .lock()
            .unwrap()
            .retain(|sender| sender.try_send(status.clone()).is_ok());
    }
}

/// Names of the claims that grant something: `false` and `null` claims are
/// left out.
fn claim_names(claims: &Map<String, Value>) -> Vec<String> {
    let mut names: Vec<String> = claims
        .iter()
        .filter(|(_, value)| !matches!(value, Value::Null | Value::Bool(false)))
        .map(|(name, _)| name.clone())
        .collect();
    names.sort();
    names
}

fn mark_read_op(id: &str) -> BatchOp {
    let mut fields = Map::new();
    fields.insert("read".into(), Value::Bool(true));
    fields.insert("readAt".into(), Value::from(Utc::now().timestamp_millis()));
    BatchOp::Update {
        collection: NOTIFICATIONS_COLLECTION.to_string(),
        id: id.to_string(),
        fields,
    }
}

fn needs_fallback(error: &BackendError) -> bool {
    matches!(
        error.code,
        BackendErrorCode::PermissionDenied | BackendErrorCode::FailedPrecondition
    )
}
