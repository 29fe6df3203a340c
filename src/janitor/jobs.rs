//! The maintenance jobs a signed-in session keeps running.
//!
//! Timestamps in the document store are epoch milliseconds, so every cutoff
//! is computed the same way.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{json, Map, Value};

use crate::backend::Query;
use crate::config::{JanitorSettings, MAX_RETENTION_DAYS};

use super::job::{JanitorJob, SweepAction};

pub const EXPIRED_HOLDS: &str = "expired-holds";
pub const READ_NOTIFICATIONS: &str = "read-notifications";
pub const RESOLVED_EMERGENCIES: &str = "resolved-emergencies";
pub const ACCESS_LOGS: &str = "access-logs";
pub const CHAT_MESSAGES: &str = "chat-messages";

/// Epoch millis `days` before `now`. Retention is clamped to the range the
/// config accepts; a cutoff before the representable range matches nothing.
fn cutoff(now: DateTime<Utc>, days: i64) -> i64 {
    ChronoDuration::try_days(days.clamp(1, MAX_RETENTION_DAYS))
        .and_then(|span| now.checked_sub_signed(span))
        .map_or(i64::MIN, |at| at.timestamp_millis())
}

fn expired_status() -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert("status".to_string(), json!("expired"));
    fields
}

/// Builds the standard job set from `settings`.
pub fn standard_jobs(settings: &JanitorSettings) -> Vec<JanitorJob> {
    let hourly = settings.retention_interval();
    let notification_days = settings.notification_retention_days;
    let emergency_days = settings.emergency_retention_days;
    let access_log_days = settings.access_log_retention_days;
    let chat_days = settings.chat_retention_days;

    vec![
        JanitorJob::new(
            EXPIRED_HOLDS,
            settings.expired_holds_interval(),
            |now| {
                Query::collection("holds")
                    .where_eq("status", "active")
                    .where_lt("expiresAt", now.timestamp_millis())
            },
            SweepAction::update(expired_status()).touching("updatedAt"),
        ),
        JanitorJob::new(
            READ_NOTIFICATIONS,
            hourly,
            move |now| {
                Query::collection("notifications")
                    .where_eq("read", true)
                    .where_lt("createdAt", cutoff(now, notification_days))
            },
            SweepAction::Delete,
        ),
        JanitorJob::new(
            RESOLVED_EMERGENCIES,
            hourly,
            move |now| {
                Query::collection("emergencies")
                    .where_eq("status", "resolved")
                    .where_lt("createdAt", cutoff(now, emergency_days))
            },
            SweepAction::Delete,
        ),
        JanitorJob::new(
            ACCESS_LOGS,
            hourly,
            move |now| {
                Query::collection("accessLogs").where_lt("timestamp", cutoff(now, access_log_days))
            },
            SweepAction::Delete,
        ),
        JanitorJob::new(
            CHAT_MESSAGES,
            hourly,
            move |now| {
                Query::collection_group("messages").where_lt("createdAt", cutoff(now, chat_days))
            },
            SweepAction::Delete,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::InMemoryDocumentStore;
    use crate::backend::Document;
    use crate::janitor::Janitor;
    use std::sync::Arc;

    fn doc(collection: &str, id: &str, fields: Value) -> Document {
        Document::new(collection, id, fields.as_object().cloned().unwrap())
    }

    fn days_ago(days: i64) -> i64 {
        cutoff(Utc::now(), days)
    }

    #[test]
    fn standard_jobs_follow_settings() {
        let jobs = standard_jobs(&JanitorSettings::default());
        let names: Vec<&str> = jobs.iter().map(|job| job.name.as_str()).collect();
        assert_eq!(
            names,
            vec![EXPIRED_HOLDS, READ_NOTIFICATIONS, RESOLVED_EMERGENCIES, ACCESS_LOGS, CHAT_MESSAGES]
        );
        assert_eq!(jobs[0].interval, std::time::Duration::from_secs(300));
        assert!(jobs[1..]
            .iter()
            .all(|job| job.interval == std::time::Duration::from_secs(3_600)));
        assert!(jobs[4].query_at(Utc::now()).collection_group);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn retention_jobs_delete_only_old_records() {
        let store = InMemoryDocumentStore::new();
        store.insert(doc("notifications", "old-read", json!({"read": true, "createdAt": days_ago(31)})));
        store.insert(doc("notifications", "old-unread", json!({"read": false, "createdAt": days_ago(31)})));
        store.insert(doc("notifications", "new-read", json!({"read": true, "createdAt": days_ago(1)})));
        store.insert(doc("emergencies", "resolved", json!({"status": "resolved", "createdAt": days_ago(91)})));
        store.insert(doc("emergencies", "open", json!({"status": "active", "createdAt": days_ago(91)})));
        store.insert(doc("accessLogs", "old", json!({"timestamp": days_ago(61)})));
        store.insert(doc("accessLogs", "recent", json!({"timestamp": days_ago(59)})));
        store.insert(doc("chatRooms/r1/messages", "old", json!({"createdAt": days_ago(40)})));
        store.insert(doc("chatRooms/r2/messages", "new", json!({"createdAt": days_ago(2)})));

        let janitor = Janitor::new(Arc::new(store.clone()));
        let mut removed = 0;
        for job in standard_jobs(&JanitorSettings::default()) {
            removed += janitor.run_once(&job).await.unwrap();
        }

        assert_eq!(removed, 4);
        assert!(store.get("notifications", "old-read").is_none());
        assert!(store.get("notifications", "old-unread").is_some());
        assert!(store.get("notifications", "new-read").is_some());
        assert!(store.get("emergencies", "resolved").is_none());
        assert!(store.get("emergencies", "open").is_some());
        assert!(store.get("accessLogs", "old").is_none());
        assert!(store.get("accessLogs", "recent").is_some());
        assert!(store.get("chatRooms/r1/messages", "old").is_none());
        assert!(store.get("chatRooms/r2/messages", "new").is_some());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn unchecked_retention_never_touches_fresh_records() {
        let store = InMemoryDocumentStore::new();
        let now = Utc::now().timestamp_millis();
        store.insert(doc("notifications", "fresh", json!({"read": true, "createdAt": now})));
        store.insert(doc("chatRooms/r1/messages", "fresh", json!({"createdAt": now})));

        let settings = JanitorSettings {
            notification_retention_days: -1,
            chat_retention_days: i64::MAX,
            ..JanitorSettings::default()
        };
        let janitor = Janitor::new(Arc::new(store.clone()));
        for job in standard_jobs(&settings) {
            janitor.run_once(&job).await.unwrap();
        }

        assert!(store.get("notifications", "fresh").is_some());
        assert!(store.get("chatRooms/r1/messages", "fresh").is_some());
    }
}
