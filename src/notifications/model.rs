use std::fmt;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::backend::{Document, MessagePayload};
use crate::error::{invalid_payload, SessionResult};

pub const EMERGENCY_CHANNEL: &str = "emergency-alerts";
pub const HOLD_CHANNEL: &str = "hold-notifications";
pub const EQUIPMENT_CHANNEL: &str = "equipment-updates";
pub const MESSAGE_CHANNEL: &str = "messages";
pub const REQUEST_CHANNEL: &str = "requests";
pub const DEFAULT_CHANNEL: &str = "default";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EquipmentUpdate {
    Status,
    Reservation,
    Maintenance,
}

/// What a notification is about, discriminated by its `type` field.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationKind {
    #[serde(rename_all = "camelCase")]
    Emergency {
        emergency_id: String,
        #[serde(default)]
        site_id: Option<String>,
        #[serde(default)]
        severity: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Hold {
        hold_id: String,
        #[serde(default)]
        site_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Equipment {
        equipment_id: String,
        #[serde(default)]
        site_id: Option<String>,
        #[serde(rename = "notificationType")]
        update: EquipmentUpdate,
    },
    #[serde(rename_all = "camelCase")]
    Request { request_id: String },
    #[serde(rename_all = "camelCase")]
    Message { chat_room_id: String },
    StatusUpdate,
    General,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Emergency { .. } => "emergency",
            NotificationKind::Hold { .. } => "hold",
            NotificationKind::Equipment { .. } => "equipment",
            NotificationKind::Request { .. } => "request",
            NotificationKind::Message { .. } => "message",
            NotificationKind::StatusUpdate => "status_update",
            NotificationKind::General => "general",
        }
    }

    /// Platform notification channel the kind is displayed on.
    pub fn channel_id(&self) -> &'static str {
        match self {
            NotificationKind::Emergency { .. } => EMERGENCY_CHANNEL,
            NotificationKind::Hold { .. } => HOLD_CHANNEL,
            NotificationKind::Equipment { .. } => EQUIPMENT_CHANNEL,
            NotificationKind::Message { .. } => MESSAGE_CHANNEL,
            NotificationKind::Request { .. } => REQUEST_CHANNEL,
            NotificationKind::StatusUpdate | NotificationKind::General => DEFAULT_CHANNEL,
        }
    }

    fn from_fields(fields: &Map<String, Value>) -> SessionResult<Self> {
        if !fields.contains_key("type") {
            return Ok(NotificationKind::General);
        }
        NotificationKind::deserialize(Value::Object(fields.clone()))
            .map_err(|err| invalid_payload(format!("Invalid notification payload: {err}")))
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a notification entered the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotificationSource {
    Feed,
    Push,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Notification {
    pub id: String,
    pub title: String,
    pub body: String,
    pub read: bool,
    /// Epoch milliseconds, when the record carries one.
    pub created_at: Option<i64>,
    pub kind: NotificationKind,
    pub source: NotificationSource,
}

impl Notification {
    pub fn channel_id(&self) -> &'static str {
        self.kind.channel_id()
    }

    /// Validates a record from the `notifications` collection.
    pub fn from_document(document: &Document) -> SessionResult<Self> {
        let kind = NotificationKind::from_fields(&document.fields)?;
        Ok(Self {
            id: document.id.clone(),
            title: document.get_str("title").unwrap_or_default().to_string(),
            body: document.get_str("body").unwrap_or_default().to_string(),
            read: document
                .get("read")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            created_at: document.get("createdAt").and_then(Value::as_i64),
            kind,
            source: NotificationSource::Feed,
        })
    }

    /// Validates a push message. The data map must carry an identifier
    /// (`notificationId`, falling back to the message id) and a `type`.
    pub fn from_message(payload: &MessagePayload) -> SessionResult<Self> {
        let data = payload
            .data
            .as_ref()
            .ok_or_else(|| invalid_payload("Push message has no data payload"))?;
        if !data.contains_key("type") {
            return Err(invalid_payload("Push message data has no 'type' field"));
        }

        let id = data
            .get("notificationId")
            .cloned()
            .or_else(|| payload.message_id.clone())
            .ok_or_else(|| invalid_payload("Push message has no notification id"))?;

        let fields: Map<String, Value> = data
            .iter()
            .map(|(key, value)| (key.clone(), Value::String(value.clone())))
            .collect();
        let kind = NotificationKind::from_fields(&fields)?;

        let shown = payload.notification.as_ref();
        let title = shown
            .and_then(|n| n.title.clone())
            .or_else(|| data.get("title").cloned())
            .unwrap_or_default();
        let body = shown
            .and_then(|n| n.body.clone())
            .or_else(|| data.get("body").cloned())
            .unwrap_or_default();

        Ok(Self {
            id,
            title,
            body,
            read: false,
            created_at: data.get("createdAt").and_then(|raw| raw.parse().ok()),
            kind,
            source: NotificationSource::Push,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NotificationPayload;
    use crate::error::SessionErrorCode;
    use serde_json::json;
    use std::collections::HashMap;

    fn document(fields: Value) -> Document {
        Document::new("notifications", "n1", fields.as_object().cloned().unwrap())
    }

    fn push(data: &[(&str, &str)]) -> MessagePayload {
        MessagePayload {
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect::<HashMap<_, _>>(),
            ),
            message_id: Some("m-1".into()),
            ..Default::default()
        }
    }

    #[test]
    fn parses_emergency_document() {
        let notification = Notification::from_document(&document(json!({
            "type": "emergency",
            "emergencyId": "e1",
            "siteId": "s1",
            "severity": "high",
            "title": "Emergency: fire",
            "body": "Evacuate",
            "createdAt": 1_700_000_000_000i64,
        })))
        .unwrap();

        assert_eq!(
            notification.kind,
            NotificationKind::Emergency {
                emergency_id: "e1".into(),
                site_id: Some("s1".into()),
                severity: Some("high".into()),
            }
        );
        assert_eq!(notification.channel_id(), "emergency-alerts");
        assert_eq!(notification.created_at, Some(1_700_000_000_000));
        assert!(!notification.read);
    }

    #[test]
    fn document_without_type_is_general() {
        let notification =
            Notification::from_document(&document(json!({"title": "Hi", "read": true}))).unwrap();
        assert_eq!(notification.kind, NotificationKind::General);
        assert_eq!(notification.channel_id(), "default");
        assert!(notification.read);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let error = Notification::from_document(&document(json!({"type": "pizza"}))).unwrap_err();
        assert_eq!(error.code, SessionErrorCode::InvalidPayload);
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let error = Notification::from_document(&document(json!({"type": "hold"}))).unwrap_err();
        assert_eq!(error.code, SessionErrorCode::InvalidPayload);
    }

    #[test]
    fn parses_equipment_push_message() {
        let mut payload = push(&[
            ("type", "equipment"),
            ("equipmentId", "eq-9"),
            ("notificationType", "maintenance"),
            ("notificationId", "n-77"),
        ]);
        payload.notification = Some(NotificationPayload {
            title: Some("Lift 3".into()),
            body: Some("Scheduled maintenance".into()),
        });

        let notification = Notification::from_message(&payload).unwrap();
        assert_eq!(notification.id, "n-77");
        assert_eq!(notification.title, "Lift 3");
        assert_eq!(notification.source, NotificationSource::Push);
        assert_eq!(notification.channel_id(), "equipment-updates");
        assert!(matches!(
            notification.kind,
            NotificationKind::Equipment {
                update: EquipmentUpdate::Maintenance,
                ..
            }
        ));
    }

    #[test]
    fn push_message_falls_back_to_message_id() {
        let notification =
            Notification::from_message(&push(&[("type", "message"), ("chatRoomId", "r1")])).unwrap();
        assert_eq!(notification.id, "m-1");
        assert_eq!(notification.channel_id(), "messages");
    }

    #[test]
    fn push_message_without_type_is_rejected() {
        let error = Notification::from_message(&push(&[("title", "hello")])).unwrap_err();
        assert_eq!(error.code, SessionErrorCode::InvalidPayload);

        let error = Notification::from_message(&MessagePayload::default()).unwrap_err();
        assert_eq!(error.code, SessionErrorCode::InvalidPayload);
    }
}
