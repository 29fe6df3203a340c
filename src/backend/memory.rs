//! In-process collaborators for tests and offline development.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::error::{internal_error, not_found, unauthenticated, BackendError, BackendResult};
use super::types::{
    BatchOp, Credentials, Document, IdTokenResult, Identity, IdentityCallback, MessageHandler,
    MessagePayload, PermissionState, Query, SignInResult, SnapshotCallback,
};
use super::{DocumentStore, IdentityProvider, MessagingProvider};
use crate::platform::runtime::spawn_detached;
use crate::util::subscribe::Unsubscribe;

type ListenerRule = Arc<dyn Fn(&Query) -> Option<BackendError> + Send + Sync + 'static>;

struct StoreListener {
    id: u64,
    query: Query,
    callback: SnapshotCallback,
}

#[derive(Default)]
struct StoreInner {
    documents: Mutex<BTreeMap<String, Document>>,
    listeners: Mutex<Vec<StoreListener>>,
    next_listener_id: AtomicU64,
    listener_rule: Mutex<Option<ListenerRule>>,
    query_error: Mutex<Option<BackendError>>,
    queries: AtomicUsize,
    commits: AtomicUsize,
}

/// Document store backed by an ordered map.
///
/// Initial snapshots and listener errors are delivered from a spawned task,
/// the way a network-backed store would; later writes notify matching
/// listeners synchronously once the write has been applied.
#[derive(Clone, Default)]
pub struct InMemoryDocumentStore {
    inner: Arc<StoreInner>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a document without notifying listeners.
    pub fn insert(&self, document: Document) {
        self.inner
            .documents
            .lock()
            .unwrap()
            .insert(document.path(), document);
    }

    pub fn get(&self, collection: &str, id: &str) -> Option<Document> {
        self.inner
            .documents
            .lock()
            .unwrap()
            .get(&format!("{collection}/{id}"))
            .cloned()
    }

    pub fn documents_in(&self, collection: &str) -> Vec<Document> {
        self.inner
            .documents
            .lock()
            .unwrap()
            .values()
            .filter(|doc| doc.collection == collection)
            .cloned()
            .collect()
    }

    /// Makes new subscriptions whose query satisfies `rule` fail with the
    /// returned error (delivered through the snapshot callback).
    pub fn reject_listeners_where<F>(&self, rule: F)
    where
        F: Fn(&Query) -> Option<BackendError> + Send + Sync + 'static,
    {
        *self.inner.listener_rule.lock().unwrap() = Some(Arc::new(rule));
    }

    /// Makes every one-shot query fail with `error` until cleared with `None`.
    pub fn set_query_error(&self, error: Option<BackendError>) {
        *self.inner.query_error.lock().unwrap() = error;
    }

    pub fn active_listeners(&self) -> usize {
        self.inner.listeners.lock().unwrap().len()
    }

    pub fn query_count(&self) -> usize {
        self.inner.queries.load(Ordering::SeqCst)
    }

    pub fn commit_count(&self) -> usize {
        self.inner.commits.load(Ordering::SeqCst)
    }

    fn run_query(&self, query: &Query) -> Vec<Document> {
        let documents = self.inner.documents.lock().unwrap();
        let matching = documents
            .values()
            .filter(|doc| query.matches(doc))
            .cloned()
            .collect();
        query.finish(matching)
    }

    fn notify_listeners(&self) {
        let listeners: Vec<(Query, SnapshotCallback)> = self
            .inner
            .listeners
            .lock()
            .unwrap()
            .iter()
            .map(|listener| (listener.query.clone(), listener.callback.clone()))
            .collect();
        for (query, callback) in listeners {
            callback(Ok(self.run_query(&query)));
        }
    }

    fn apply(&self, ops: Vec<BatchOp>) -> BackendResult<()> {
        let mut documents = self.inner.documents.lock().unwrap();
        for op in &ops {
            if let BatchOp::Update { collection, id, .. } = op {
                let path = format!("{collection}/{id}");
                if !documents.contains_key(&path) {
                    return Err(not_found(format!("No document to update: {path}")));
                }
            }
        }
        for op in ops {
            match op {
                BatchOp::Update {
                    collection,
                    id,
                    fields,
                } => {
                    if let Some(document) = documents.get_mut(&format!("{collection}/{id}")) {
                        document.fields.extend(fields);
                    }
                }
                BatchOp::Delete { collection, id } => {
                    documents.remove(&format!("{collection}/{id}"));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn read(&self, collection: &str, id: &str) -> BackendResult<Option<Document>> {
        Ok(self.get(collection, id))
    }

    async fn query(&self, query: &Query) -> BackendResult<Vec<Document>> {
        self.inner.queries.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.inner.query_error.lock().unwrap().clone() {
            return Err(error);
        }
        Ok(self.run_query(query))
    }

    async fn write(
        &self,
        collection: &str,
        id: &str,
        patch: Map<String, Value>,
    ) -> BackendResult<()> {
        {
            let mut documents = self.inner.documents.lock().unwrap();
            documents
                .entry(format!("{collection}/{id}"))
                .and_modify(|doc| doc.fields.extend(patch.clone()))
                .or_insert_with(|| Document::new(collection, id, patch));
        }
        self.notify_listeners();
        Ok(())
    }

    fn subscribe(&self, query: Query, callback: SnapshotCallback) -> BackendResult<Unsubscribe> {
        let rule = self.inner.listener_rule.lock().unwrap().clone();
        if let Some(error) = rule.and_then(|rule| rule(&query)) {
            spawn_detached(async move {
                callback(Err(error));
            });
            return Ok(Box::new(|| {}));
        }

        let id = self.inner.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.inner.listeners.lock().unwrap().push(StoreListener {
            id,
            query: query.clone(),
            callback: callback.clone(),
        });

        let store = self.clone();
        spawn_detached(async move {
            let still_listening = store
                .inner
                .listeners
                .lock()
                .unwrap()
                .iter()
                .any(|listener| listener.id == id);
            if still_listening {
                callback(Ok(store.run_query(&query)));
            }
        });

        let inner = Arc::downgrade(&self.inner);
        Ok(Box::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner
                    .listeners
                    .lock()
                    .unwrap()
                    .retain(|listener| listener.id != id);
            }
        }))
    }

    async fn commit(&self, ops: Vec<BatchOp>) -> BackendResult<()> {
        self.inner.commits.fetch_add(1, Ordering::SeqCst);
        self.apply(ops)?;
        self.notify_listeners();
        Ok(())
    }
}

#[derive(Default)]
struct IdentityInner {
    accounts: Mutex<HashMap<String, (String, Identity)>>,
    current: Mutex<Option<Identity>>,
    callbacks: Mutex<Vec<(u64, IdentityCallback)>>,
    next_callback_id: AtomicU64,
    claims: Mutex<Map<String, Value>>,
    token_refreshes: AtomicUsize,
}

/// Identity provider with email/password accounts held in memory.
///
/// Like hosted auth SDKs, a newly registered callback is immediately invoked
/// with the current identity.
#[derive(Clone, Default)]
pub struct InMemoryIdentityProvider {
    inner: Arc<IdentityInner>,
}

impl InMemoryIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_account(&self, email: &str, password: &str, identity: Identity) {
        self.inner
            .accounts
            .lock()
            .unwrap()
            .insert(email.to_string(), (password.to_string(), identity));
    }

    pub fn set_claims(&self, claims: Map<String, Value>) {
        *self.inner.claims.lock().unwrap() = claims;
    }

    /// Replaces the current identity and notifies every callback.
    pub fn set_current(&self, identity: Option<Identity>) {
        *self.inner.current.lock().unwrap() = identity.clone();
        self.emit(identity);
    }

    /// Re-delivers the current identity, simulating a redundant SDK event.
    pub fn emit_current(&self) {
        let identity = self.current_identity();
        self.emit(identity);
    }

    pub fn callback_count(&self) -> usize {
        self.inner.callbacks.lock().unwrap().len()
    }

    pub fn token_refreshes(&self) -> usize {
        self.inner.token_refreshes.load(Ordering::SeqCst)
    }

    fn emit(&self, identity: Option<Identity>) {
        let callbacks: Vec<IdentityCallback> = self
            .inner
            .callbacks
            .lock()
            .unwrap()
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();
        for callback in callbacks {
            callback(identity.clone());
        }
    }
}

#[async_trait]
impl IdentityProvider for InMemoryIdentityProvider {
    async fn sign_in(&self, credentials: &Credentials) -> BackendResult<SignInResult> {
        let account = self
            .inner
            .accounts
            .lock()
            .unwrap()
            .get(&credentials.email)
            .cloned();
        let identity = match account {
            Some((password, identity)) if password == credentials.password => identity,
            Some(_) => return Err(unauthenticated("Incorrect password")),
            None => return Err(not_found("No account found with this email address")),
        };
        self.set_current(Some(identity.clone()));
        Ok(SignInResult {
            token: format!("token-{}", identity.uid),
            identity,
        })
    }

    async fn sign_out(&self) -> BackendResult<()> {
        self.set_current(None);
        Ok(())
    }

    fn on_identity_change(&self, callback: IdentityCallback) -> Unsubscribe {
        let id = self.inner.next_callback_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .callbacks
            .lock()
            .unwrap()
            .push((id, callback.clone()));
        callback(self.current_identity());

        let inner = Arc::downgrade(&self.inner);
        Box::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner
                    .callbacks
                    .lock()
                    .unwrap()
                    .retain(|(entry, _)| *entry != id);
            }
        })
    }

    fn current_identity(&self) -> Option<Identity> {
        self.inner.current.lock().unwrap().clone()
    }

    async fn get_token(&self, force_refresh: bool) -> BackendResult<IdTokenResult> {
        let identity = self
            .current_identity()
            .ok_or_else(|| unauthenticated("No signed-in identity"))?;
        if force_refresh {
            self.inner.token_refreshes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(IdTokenResult {
            token: format!(
                "token-{}-{}",
                identity.uid,
                self.inner.token_refreshes.load(Ordering::SeqCst)
            ),
            claims: self.inner.claims.lock().unwrap().clone(),
        })
    }
}

struct MessagingInner {
    permission: Mutex<PermissionState>,
    token: Mutex<String>,
    failing_token_requests: AtomicUsize,
    token_requests: AtomicUsize,
    foreground: Mutex<Vec<(u64, MessageHandler)>>,
    background: Mutex<Option<MessageHandler>>,
    next_handler_id: AtomicU64,
}

#[derive(Clone)]
pub struct InMemoryMessagingProvider {
    inner: Arc<MessagingInner>,
}

impl Default for InMemoryMessagingProvider {
    fn default() -> Self {
        Self {
            inner: Arc::new(MessagingInner {
                permission: Mutex::new(PermissionState::Granted),
                token: Mutex::new("push-token".to_string()),
                failing_token_requests: AtomicUsize::new(0),
                token_requests: AtomicUsize::new(0),
                foreground: Mutex::new(Vec::new()),
                background: Mutex::new(None),
                next_handler_id: AtomicU64::new(1),
            }),
        }
    }
}

impl InMemoryMessagingProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_permission(&self, permission: PermissionState) {
        *self.inner.permission.lock().unwrap() = permission;
    }

    pub fn set_token(&self, token: impl Into<String>) {
        *self.inner.token.lock().unwrap() = token.into();
    }

    /// Makes the next `count` token requests fail with `unavailable`.
    pub fn fail_token_requests(&self, count: usize) {
        self.inner
            .failing_token_requests
            .store(count, Ordering::SeqCst);
    }

    pub fn token_requests(&self) -> usize {
        self.inner.token_requests.load(Ordering::SeqCst)
    }

    pub fn foreground_handlers(&self) -> usize {
        self.inner.foreground.lock().unwrap().len()
    }

    pub fn has_background_handler(&self) -> bool {
        self.inner.background.lock().unwrap().is_some()
    }

    pub fn deliver_foreground(&self, payload: MessagePayload) {
        let handlers: Vec<MessageHandler> = self
            .inner
            .foreground
            .lock()
            .unwrap()
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in handlers {
            handler(payload.clone());
        }
    }

    pub fn deliver_background(&self, payload: MessagePayload) {
        let handler = self.inner.background.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler(payload);
        }
    }
}

#[async_trait]
impl MessagingProvider for InMemoryMessagingProvider {
    async fn request_permission(&self) -> BackendResult<PermissionState> {
        Ok(*self.inner.permission.lock().unwrap())
    }

    async fn get_token(&self) -> BackendResult<String> {
        self.inner.token_requests.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .inner
            .failing_token_requests
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(super::error::unavailable("Messaging service unreachable"));
        }
        let token = self.inner.token.lock().unwrap().clone();
        if token.is_empty() {
            return Err(internal_error("Messaging provider returned no token"));
        }
        Ok(token)
    }

    fn on_foreground_message(&self, handler: MessageHandler) -> Unsubscribe {
        let id = self.inner.next_handler_id.fetch_add(1, Ordering::SeqCst);
        self.inner.foreground.lock().unwrap().push((id, handler));
        let inner = Arc::downgrade(&self.inner);
        Box::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner
                    .foreground
                    .lock()
                    .unwrap()
                    .retain(|(entry, _)| *entry != id);
            }
        })
    }

    fn on_background_message(&self, handler: MessageHandler) {
        *self.inner.background.lock().unwrap() = Some(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::error::failed_precondition;
    use crate::backend::Direction;
    use serde_json::json;

    async fn settle() {
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
    }

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test(flavor = "current_thread")]
    async fn write_merges_and_notifies_listeners() {
        let store = InMemoryDocumentStore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let unsubscribe = store
            .subscribe(
                Query::collection("holds").where_eq("status", "active"),
                Arc::new(move |result: BackendResult<Vec<Document>>| {
                    sink.lock().unwrap().push(result.unwrap().len());
                }),
            )
            .unwrap();
        settle().await;

        store
            .write("holds", "h1", fields(json!({"status": "active"})))
            .await
            .unwrap();
        store
            .write("holds", "h1", fields(json!({"doorId": "d1"})))
            .await
            .unwrap();

        let hold = store.get("holds", "h1").unwrap();
        assert_eq!(hold.get_str("status"), Some("active"));
        assert_eq!(hold.get_str("doorId"), Some("d1"));
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 1]);

        unsubscribe();
        assert_eq!(store.active_listeners(), 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn commit_is_atomic() {
        let store = InMemoryDocumentStore::new();
        store.insert(Document::new("holds", "h1", fields(json!({"status": "active"}))));

        let result = store
            .commit(vec![
                BatchOp::Delete {
                    collection: "holds".into(),
                    id: "h1".into(),
                },
                BatchOp::Update {
                    collection: "holds".into(),
                    id: "missing".into(),
                    fields: Map::new(),
                },
            ])
            .await;

        assert!(result.is_err());
        assert!(store.get("holds", "h1").is_some());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn rejected_listener_reports_error_asynchronously() {
        let store = InMemoryDocumentStore::new();
        store.reject_listeners_where(|query| {
            query
                .order_by
                .as_ref()
                .map(|_| failed_precondition("The query requires an index"))
        });
        let errors = Arc::new(AtomicUsize::new(0));
        let counter = errors.clone();

        store
            .subscribe(
                Query::collection("notifications").order_by("createdAt", Direction::Descending),
                Arc::new(move |result: BackendResult<Vec<Document>>| {
                    if result.is_err() {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                }),
            )
            .unwrap();
        assert_eq!(errors.load(Ordering::SeqCst), 0);

        settle().await;
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(store.active_listeners(), 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn identity_callbacks_fire_on_registration_and_change() {
        let provider = InMemoryIdentityProvider::new();
        provider.add_account("a@gaterlink.io", "secret", Identity::new("u1"));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let unsubscribe = provider.on_identity_change(Arc::new(move |identity: Option<Identity>| {
            sink.lock().unwrap().push(identity.map(|i| i.uid));
        }));

        provider
            .sign_in(&Credentials::email_password("a@gaterlink.io", "secret"))
            .await
            .unwrap();
        assert!(provider
            .sign_in(&Credentials::email_password("a@gaterlink.io", "wrong"))
            .await
            .is_err());
        provider.sign_out().await.unwrap();
        unsubscribe();
        provider.emit_current();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![None, Some("u1".to_string()), None]
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn token_failures_are_consumed() {
        let messaging = InMemoryMessagingProvider::new();
        messaging.fail_token_requests(1);
        assert!(messaging.get_token().await.is_err());
        assert_eq!(messaging.get_token().await.unwrap(), "push-token");
        assert_eq!(messaging.token_requests(), 2);
    }
}
