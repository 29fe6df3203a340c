use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Notifications,
    PushMessages,
    Holds,
    Requests,
    Emergencies,
    Equipment,
    Messages,
    Other(String),
}

impl ResourceKind {
    pub fn as_str(&self) -> &str {
        match self {
            ResourceKind::Notifications => "notifications",
            ResourceKind::PushMessages => "push-messages",
            ResourceKind::Holds => "holds",
            ResourceKind::Requests => "requests",
            ResourceKind::Emergencies => "emergencies",
            ResourceKind::Equipment => "equipment",
            ResourceKind::Messages => "messages",
            ResourceKind::Other(name) => name.as_str(),
        }
    }
}

impl From<&str> for ResourceKind {
    fn from(value: &str) -> Self {
        match value {
            "notifications" => ResourceKind::Notifications,
            "push-messages" => ResourceKind::PushMessages,
            "holds" => ResourceKind::Holds,
            "requests" => ResourceKind::Requests,
            "emergencies" => ResourceKind::Emergencies,
            "equipment" => ResourceKind::Equipment,
            "messages" => ResourceKind::Messages,
            other => ResourceKind::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub resource_kind: ResourceKind,
    pub filter_key: String,
}

impl SubscriptionKey {
    pub fn new(resource_kind: impl Into<ResourceKind>, filter_key: impl Into<String>) -> Self {
        Self {
            resource_kind: resource_kind.into(),
            filter_key: filter_key.into(),
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.resource_kind, self.filter_key)
    }
}
