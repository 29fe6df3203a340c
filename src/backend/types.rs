use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

use super::error::BackendResult;

/// Signed-in principal as reported by the identity provider.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub uid: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
}

impl Identity {
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            email: None,
            display_name: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl Credentials {
    pub fn email_password(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct SignInResult {
    pub identity: Identity,
    pub token: String,
}

/// ID token together with the custom claims it carries.
#[derive(Clone, Debug, Default)]
pub struct IdTokenResult {
    pub token: String,
    pub claims: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    /// Full collection path, e.g. `holds` or `chatRooms/r1/messages`.
    pub collection: String,
    pub id: String,
    pub fields: Map<String, Value>,
}

impl Document {
    pub fn new(collection: impl Into<String>, id: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
            fields,
        }
    }

    pub fn path(&self) -> String {
        format!("{}/{}", self.collection, self.id)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }

    /// Last segment of the collection path, used to match collection-group queries.
    pub fn collection_id(&self) -> &str {
        self.collection
            .rsplit('/')
            .next()
            .unwrap_or(self.collection.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterOp {
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn matches(&self, document: &Document) -> bool {
        let Some(actual) = document.get(&self.field) else {
            return false;
        };
        match self.op {
            FilterOp::Equal => actual == &self.value,
            FilterOp::NotEqual => actual != &self.value,
            FilterOp::LessThan => compare_values(actual, &self.value) == Some(Ordering::Less),
            FilterOp::LessThanOrEqual => matches!(
                compare_values(actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FilterOp::GreaterThan => {
                compare_values(actual, &self.value) == Some(Ordering::Greater)
            }
            FilterOp::GreaterThanOrEqual => matches!(
                compare_values(actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    pub collection: String,
    pub collection_group: bool,
    pub filters: Vec<Filter>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn collection(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            collection_group: false,
            filters: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    /// Queries every collection whose last path segment is `collection_id`.
    pub fn collection_group(collection_id: impl Into<String>) -> Self {
        Self {
            collection_group: true,
            ..Self::collection(collection_id)
        }
    }

    pub fn filter(mut self, field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        self.filters.push(Filter {
            field: field.into(),
            op,
            value: value.into(),
        });
        self
    }

    pub fn where_eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(field, FilterOp::Equal, value)
    }

    pub fn where_lt(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(field, FilterOp::LessThan, value)
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches_collection(&self, document: &Document) -> bool {
        if self.collection_group {
            document.collection_id() == self.collection
        } else {
            document.collection == self.collection
        }
    }

    pub fn matches(&self, document: &Document) -> bool {
        self.matches_collection(document) && self.filters.iter().all(|f| f.matches(document))
    }

    /// Applies ordering and limit to documents that already passed [`Query::matches`].
    pub fn finish(&self, mut documents: Vec<Document>) -> Vec<Document> {
        if let Some(order) = &self.order_by {
            documents.sort_by(|left, right| {
                let ordering = match (left.get(&order.field), right.get(&order.field)) {
                    (Some(a), Some(b)) => compare_values(a, b).unwrap_or(Ordering::Equal),
                    (Some(_), None) => Ordering::Greater,
                    (None, Some(_)) => Ordering::Less,
                    (None, None) => Ordering::Equal,
                };
                match order.direction {
                    Direction::Ascending => ordering,
                    Direction::Descending => ordering.reverse(),
                }
            });
        }
        if let Some(limit) = self.limit {
            documents.truncate(limit);
        }
        documents
    }
}

fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum BatchOp {
    Update {
        collection: String,
        id: String,
        fields: Map<String, Value>,
    },
    Delete {
        collection: String,
        id: String,
    },
}

impl BatchOp {
    pub fn update(document: &Document, fields: Map<String, Value>) -> Self {
        BatchOp::Update {
            collection: document.collection.clone(),
            id: document.id.clone(),
            fields,
        }
    }

    pub fn delete(document: &Document) -> Self {
        BatchOp::Delete {
            collection: document.collection.clone(),
            id: document.id.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PermissionState {
    /// The user has not decided whether to allow notifications.
    Default,
    Granted,
    /// Granted with provisional (quiet) delivery.
    Provisional,
    Denied,
}

impl PermissionState {
    pub fn is_enabled(&self) -> bool {
        matches!(self, PermissionState::Granted | PermissionState::Provisional)
    }
}

/// Payload displayed to the user when a notification is shown.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NotificationPayload {
    pub title: Option<String>,
    pub body: Option<String>,
}

/// Message delivered by the push provider.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessagePayload {
    pub notification: Option<NotificationPayload>,
    pub data: Option<HashMap<String, String>>,
    pub message_id: Option<String>,
    pub from: Option<String>,
}

pub type SnapshotCallback = Arc<dyn Fn(BackendResult<Vec<Document>>) + Send + Sync + 'static>;
pub type IdentityCallback = Arc<dyn Fn(Option<Identity>) + Send + Sync + 'static>;
pub type MessageHandler = Arc<dyn Fn(MessagePayload) + Send + Sync + 'static>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(collection: &str, id: &str, fields: Value) -> Document {
        Document::new(collection, id, fields.as_object().cloned().unwrap())
    }

    #[test]
    fn filters_compare_numbers_and_strings() {
        let hold = doc("holds", "h1", json!({"status": "active", "expiresAt": 100}));
        assert!(Query::collection("holds")
            .where_eq("status", "active")
            .where_lt("expiresAt", 200)
            .matches(&hold));
        assert!(!Query::collection("holds")
            .where_lt("expiresAt", 50)
            .matches(&hold));
        assert!(!Query::collection("holds")
            .where_eq("missing", true)
            .matches(&hold));
    }

    #[test]
    fn collection_group_matches_last_segment() {
        let message = doc("chatRooms/r1/messages", "m1", json!({"createdAt": 1}));
        assert!(Query::collection_group("messages").matches(&message));
        assert!(!Query::collection("messages").matches(&message));
    }

    #[test]
    fn finish_orders_and_limits() {
        let docs = vec![
            doc("notifications", "a", json!({"createdAt": 1})),
            doc("notifications", "b", json!({"createdAt": 3})),
            doc("notifications", "c", json!({"createdAt": 2})),
        ];
        let ordered = Query::collection("notifications")
            .order_by("createdAt", Direction::Descending)
            .limit(2)
            .finish(docs);
        let ids: Vec<_> = ordered.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[test]
    fn credentials_debug_redacts_password() {
        let credentials = Credentials::email_password("a@b.c", "hunter2");
        assert!(!format!("{credentials:?}").contains("hunter2"));
    }
}
