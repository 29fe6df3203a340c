use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::backend::{Document, MessagePayload};
use crate::error::{SessionError, SessionResult};
use crate::util::subscribe::{ObserverList, PartialObserver, Unsubscribe};

use super::model::Notification;

#[derive(Default)]
struct CenterState {
    seen: HashSet<String>,
    feed_read: HashMap<String, bool>,
}

/// Routes validated notifications to application observers.
///
/// Each notification id is delivered at most once until [`NotificationCenter::clear`],
/// whether it arrives through the document feed or as a push message.
#[derive(Default)]
pub struct NotificationCenter {
    observers: ObserverList<Notification>,
    state: Mutex<CenterState>,
}

impl NotificationCenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: PartialObserver<Notification>) -> Unsubscribe {
        self.observers.add(observer)
    }

    /// Delivers `notification` unless its id was already delivered.
    pub fn dispatch(&self, notification: Notification) -> bool {
        if !self.state.lock().unwrap().seen.insert(notification.id.clone()) {
            log::debug!("notification {} already delivered", notification.id);
            return false;
        }
        self.observers.notify(&notification);
        true
    }

    /// Applies a feed snapshot: records read flags and delivers notifications
    /// not seen before. Invalid records are logged and skipped. Returns how
    /// many notifications were delivered.
    pub fn ingest_snapshot(&self, documents: &[Document]) -> usize {
        let mut fresh = Vec::new();
        for document in documents {
            match Notification::from_document(document) {
                Ok(notification) => fresh.push(notification),
                Err(err) => log::warn!("skipping notification {}: {err}", document.path()),
            }
        }

        {
            let mut state = self.state.lock().unwrap();
            state.feed_read = fresh
                .iter()
                .map(|notification| (notification.id.clone(), notification.read))
                .collect();
        }

        fresh
            .into_iter()
            .filter(|notification| !notification.read)
            .map(|notification| self.dispatch(notification))
            .filter(|delivered| *delivered)
            .count()
    }

    /// Validates and delivers a push message.
    pub fn ingest_push(&self, payload: &MessagePayload) -> SessionResult<bool> {
        let notification = Notification::from_message(payload)?;
        Ok(self.dispatch(notification))
    }

    pub fn report_error(&self, error: &SessionError) {
        self.observers.notify_error(error);
    }

    /// Unread notifications in the latest feed snapshot.
    pub fn unread_count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .feed_read
            .values()
            .filter(|read| !**read)
            .count()
    }

    /// Records `ids` as read until the next feed snapshot arrives.
    pub fn mark_read(&self, ids: &[String]) {
        let mut state = self.state.lock().unwrap();
        for id in ids {
            if let Some(read) = state.feed_read.get_mut(id) {
                *read = true;
            }
        }
    }

    /// Drops a deleted notification from the feed state.
    pub fn forget(&self, id: &str) {
        self.state.lock().unwrap().feed_read.remove(id);
    }

    pub fn delivered_count(&self) -> usize {
        self.state.lock().unwrap().seen.len()
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Forgets delivered ids and feed state. Observers stay registered.
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.seen.clear();
        state.feed_read.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::NotificationKind;
    use serde_json::json;
    use std::collections::HashMap as Map;
    use std::sync::Arc;

    fn feed_doc(id: &str, read: bool) -> Document {
        Document::new(
            "notifications",
            id,
            json!({"type": "hold", "holdId": format!("hold-{id}"), "read": read, "userId": "u1"})
                .as_object()
                .cloned()
                .unwrap(),
        )
    }

    fn recorder(center: &NotificationCenter) -> (Arc<Mutex<Vec<String>>>, Unsubscribe) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let unsubscribe = center.subscribe(
            PartialObserver::new()
                .with_next(move |n: &Notification| sink.lock().unwrap().push(n.id.clone())),
        );
        (received, unsubscribe)
    }

    #[test]
    fn snapshot_delivers_each_unread_id_once() {
        let center = NotificationCenter::new();
        let (received, _unsubscribe) = recorder(&center);

        assert_eq!(center.ingest_snapshot(&[feed_doc("a", false), feed_doc("b", true)]), 1);
        assert_eq!(
            center.ingest_snapshot(&[feed_doc("a", false), feed_doc("b", true), feed_doc("c", false)]),
            1
        );

        assert_eq!(*received.lock().unwrap(), vec!["a".to_string(), "c".to_string()]);
        assert_eq!(center.unread_count(), 2);
    }

    #[test]
    fn invalid_records_are_skipped() {
        let center = NotificationCenter::new();
        let broken = Document::new(
            "notifications",
            "bad",
            json!({"type": "teleport"}).as_object().cloned().unwrap(),
        );
        assert_eq!(center.ingest_snapshot(&[broken, feed_doc("ok", false)]), 1);
        assert_eq!(center.delivered_count(), 1);
    }

    #[test]
    fn push_and_feed_share_dedupe() {
        let center = NotificationCenter::new();
        let (received, _unsubscribe) = recorder(&center);

        let payload = MessagePayload {
            data: Some(Map::from([
                ("type".to_string(), "hold".to_string()),
                ("holdId".to_string(), "hold-a".to_string()),
                ("notificationId".to_string(), "a".to_string()),
            ])),
            ..Default::default()
        };
        assert!(center.ingest_push(&payload).unwrap());
        assert_eq!(center.ingest_snapshot(&[feed_doc("a", false)]), 0);
        assert_eq!(received.lock().unwrap().len(), 1);

        center.clear();
        assert_eq!(center.ingest_snapshot(&[feed_doc("a", false)]), 1);
    }

    #[test]
    fn unsubscribed_observer_stops_receiving() {
        let center = NotificationCenter::new();
        let (received, unsubscribe) = recorder(&center);
        unsubscribe();
        assert_eq!(center.observer_count(), 0);

        let notification = Notification::from_document(&feed_doc("x", false)).unwrap();
        assert!(matches!(notification.kind, NotificationKind::Hold { .. }));
        assert!(center.dispatch(notification));
        assert!(received.lock().unwrap().is_empty());
    }

    #[test]
    fn local_read_state_updates_unread_count() {
        let center = NotificationCenter::new();
        center.ingest_snapshot(&[feed_doc("a", false), feed_doc("b", false), feed_doc("c", false)]);
        assert_eq!(center.unread_count(), 3);

        center.mark_read(&["a".to_string(), "missing".to_string()]);
        assert_eq!(center.unread_count(), 2);

        center.forget("b");
        assert_eq!(center.unread_count(), 1);
    }
}
