use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Map, Value};

use crate::backend::{Document, DocumentStoreArc, Identity};
use crate::cache::TtlCache;
use crate::error::SessionResult;

pub const USERS_COLLECTION: &str = "users";
pub const DEFAULT_ROLE: &str = "customer";

/// Cached access to `users/{uid}` profile records.
pub struct UserDirectory {
    store: DocumentStoreArc,
    cache: TtlCache<String, Document>,
}

impl UserDirectory {
    pub fn new(store: DocumentStoreArc, ttl: Duration) -> Self {
        Self {
            store,
            cache: TtlCache::new(ttl),
        }
    }

    /// Returns the profile for `uid`, reading through to the store on a miss
    /// or once the cached copy expired. Missing profiles are not cached.
    pub async fn get_profile(&self, uid: &str) -> SessionResult<Option<Document>> {
        if let Some(profile) = self.cache.get(&uid.to_string()) {
            return Ok(Some(profile));
        }
        let profile = self.store.read(USERS_COLLECTION, uid).await?;
        if let Some(profile) = &profile {
            self.cache.insert(uid.to_string(), profile.clone());
        }
        Ok(profile)
    }

    /// Merges `patch` into the profile and drops the cached copy.
    pub async fn update_profile(&self, uid: &str, patch: Map<String, Value>) -> SessionResult<()> {
        let mut patch = patch;
        patch.insert("updatedAt".into(), Value::from(Utc::now().timestamp_millis()));
        self.store.write(USERS_COLLECTION, uid, patch).await?;
        self.invalidate(uid);
        Ok(())
    }

    /// Creates the profile for `identity` when it does not exist, or fills in
    /// the role and notification settings when an existing record lacks them.
    pub async fn ensure_profile(&self, identity: &Identity) -> SessionResult<Document> {
        let existing = self.store.read(USERS_COLLECTION, &identity.uid).await?;
        let now = Utc::now().timestamp_millis();

        let patch = match &existing {
            None => {
                log::info!("creating profile for user {}", identity.uid);
                let mut fields = default_profile(identity);
                fields.insert("createdAt".into(), Value::from(now));
                fields.insert("updatedAt".into(), Value::from(now));
                fields
            }
            Some(profile) => {
                let mut missing = Map::new();
                for (key, value) in default_profile(identity) {
                    let repairable = key == "role" || key == "notificationSettings";
                    if repairable && profile.get(&key).is_none() {
                        missing.insert(key, value);
                    }
                }
                if !missing.is_empty() {
                    log::info!("repairing profile for user {}", identity.uid);
                    missing.insert("updatedAt".into(), Value::from(now));
                }
                missing
            }
        };

        let profile = match existing {
            Some(profile) if patch.is_empty() => profile,
            existing => {
                self.store
                    .write(USERS_COLLECTION, &identity.uid, patch.clone())
                    .await?;
                let mut fields = existing.map(|doc| doc.fields).unwrap_or_default();
                fields.extend(patch);
                Document::new(USERS_COLLECTION, identity.uid.clone(), fields)
            }
        };
        self.cache.insert(identity.uid.clone(), profile.clone());
        Ok(profile)
    }

    pub fn invalidate(&self, uid: &str) -> bool {
        self.cache.invalidate(&uid.to_string())
    }

    pub fn clear(&self) {
        self.cache.clear();
    }

    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }
}

fn default_profile(identity: &Identity) -> Map<String, Value> {
    let mut fields = json!({
        "id": identity.uid,
        "role": DEFAULT_ROLE,
        "isActive": true,
        "notificationSettings": {
            "pushEnabled": true,
            "emailEnabled": true,
            "smsEnabled": false,
            "soundEnabled": true,
            "badgeEnabled": true,
        },
    })
    .as_object()
    .cloned()
    .unwrap_or_default();
    if let Some(email) = &identity.email {
        fields.insert("email".into(), Value::from(email.clone()));
    }
    if let Some(name) = &identity.display_name {
        fields.insert("displayName".into(), Value::from(name.clone()));
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::InMemoryDocumentStore;
    use std::sync::Arc;

    fn directory(store: &InMemoryDocumentStore, ttl_ms: u64) -> UserDirectory {
        UserDirectory::new(Arc::new(store.clone()), Duration::from_millis(ttl_ms))
    }

    #[tokio::test(flavor = "current_thread")]
    async fn creates_missing_profile_with_defaults() {
        let store = InMemoryDocumentStore::new();
        let users = directory(&store, 60_000);
        let identity = Identity::new("u1").with_email("ada@example.com");

        let profile = users.ensure_profile(&identity).await.unwrap();
        assert_eq!(profile.get_str("role"), Some("customer"));

        let stored = store.get("users", "u1").unwrap();
        assert_eq!(stored.get_str("email"), Some("ada@example.com"));
        assert_eq!(
            stored.get("notificationSettings").and_then(|s| s.get("smsEnabled")),
            Some(&Value::Bool(false))
        );
        assert!(stored.get("createdAt").is_some());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn repairs_profile_without_overwriting_role() {
        let store = InMemoryDocumentStore::new();
        store.insert(Document::new(
            "users",
            "u2",
            json!({"role": "manager", "email": "m@example.com"})
                .as_object()
                .cloned()
                .unwrap(),
        ));
        let users = directory(&store, 60_000);

        let profile = users.ensure_profile(&Identity::new("u2")).await.unwrap();
        assert_eq!(profile.get_str("role"), Some("manager"));
        assert!(store
            .get("users", "u2")
            .unwrap()
            .get("notificationSettings")
            .is_some());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn cached_profile_expires() {
        let store = InMemoryDocumentStore::new();
        store.insert(Document::new(
            "users",
            "u3",
            json!({"role": "customer"}).as_object().cloned().unwrap(),
        ));
        let users = directory(&store, 100);

        assert!(users.get_profile("u3").await.unwrap().is_some());
        store.insert(Document::new(
            "users",
            "u3",
            json!({"role": "admin"}).as_object().cloned().unwrap(),
        ));
        let cached = users.get_profile("u3").await.unwrap().unwrap();
        assert_eq!(cached.get_str("role"), Some("customer"));

        tokio::time::advance(Duration::from_millis(150)).await;
        let fresh = users.get_profile("u3").await.unwrap().unwrap();
        assert_eq!(fresh.get_str("role"), Some("admin"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn update_invalidates_cache() {
        let store = InMemoryDocumentStore::new();
        let users = directory(&store, 60_000);
        users.ensure_profile(&Identity::new("u4")).await.unwrap();
        assert_eq!(users.cached_count(), 1);

        let mut patch = Map::new();
        patch.insert("role".into(), Value::from("technician"));
        users.update_profile("u4", patch).await.unwrap();
        assert_eq!(users.cached_count(), 0);

        let profile = users.get_profile("u4").await.unwrap().unwrap();
        assert_eq!(profile.get_str("role"), Some("technician"));
        assert!(users.get_profile("missing").await.unwrap().is_none());
    }
}
