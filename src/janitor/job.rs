use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::backend::{BatchOp, Document, Query};

/// Builds the stale-record query for a sweep started at the given instant.
pub type StalePredicate = Arc<dyn Fn(DateTime<Utc>) -> Query + Send + Sync + 'static>;

/// Corrective write applied to every record a sweep finds.
#[derive(Clone, Debug, PartialEq)]
pub enum SweepAction {
    Delete,
    /// Merges `fields` into the record, stamping `touch_field` with the
    /// sweep time (epoch millis) when set.
    Update {
        fields: Map<String, Value>,
        touch_field: Option<String>,
    },
}

impl SweepAction {
    pub fn update(fields: Map<String, Value>) -> Self {
        SweepAction::Update {
            fields,
            touch_field: None,
        }
    }

    pub fn touching(self, field: impl Into<String>) -> Self {
        match self {
            SweepAction::Update { fields, .. } => SweepAction::Update {
                fields,
                touch_field: Some(field.into()),
            },
            SweepAction::Delete => SweepAction::Delete,
        }
    }

    pub fn to_op(&self, document: &Document, now: DateTime<Utc>) -> BatchOp {
        match self {
            SweepAction::Delete => BatchOp::delete(document),
            SweepAction::Update {
                fields,
                touch_field,
            } => {
                let mut patch = fields.clone();
                if let Some(field) = touch_field {
                    patch.insert(field.clone(), Value::from(now.timestamp_millis()));
                }
                BatchOp::update(document, patch)
            }
        }
    }
}

#[derive(Clone)]
pub struct JanitorJob {
    pub name: String,
    pub interval: Duration,
    pub predicate: StalePredicate,
    pub action: SweepAction,
}

impl JanitorJob {
    pub fn new<P>(name: impl Into<String>, interval: Duration, predicate: P, action: SweepAction) -> Self
    where
        P: Fn(DateTime<Utc>) -> Query + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            interval,
            predicate: Arc::new(predicate),
            action,
        }
    }

    pub fn query_at(&self, now: DateTime<Utc>) -> Query {
        (self.predicate)(now)
    }
}

impl fmt::Debug for JanitorJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JanitorJob")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .field("action", &self.action)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn update_action_stamps_touch_field() {
        let now = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        let action = SweepAction::update(json!({"status": "expired"}).as_object().cloned().unwrap())
            .touching("updatedAt");
        let hold = Document::new("holds", "h1", Map::new());

        let op = action.to_op(&hold, now);

        let BatchOp::Update { fields, id, .. } = op else {
            panic!("expected an update");
        };
        assert_eq!(id, "h1");
        assert_eq!(fields["status"], json!("expired"));
        assert_eq!(fields["updatedAt"], json!(1_700_000_000_000_i64));
    }

    #[test]
    fn delete_ignores_touching() {
        assert_eq!(SweepAction::Delete.touching("updatedAt"), SweepAction::Delete);
    }
}
