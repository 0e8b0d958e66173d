use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing string value.
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Borrow the inner string.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;

            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

macro_rules! generated_id {
    ($name:ident) => {
        impl $name {
            /// Generate a fresh, time-ordered identifier.
            #[must_use]
            pub fn generate() -> Self {
                Self(uuid::Uuid::now_v7().to_string())
            }
        }
    };
}

string_id!(SystemId, "Names a backend system requests are routed to.");
string_id!(RequestId, "Identifies a single ingress request.");
string_id!(EventId, "Identifies a published event.");
string_id!(HandlerId, "Identifies an event bus subscription.");
string_id!(WorkflowId, "Identifies a registered workflow definition.");
string_id!(ExecutionId, "Identifies one run of a workflow.");

generated_id!(RequestId);
generated_id!(EventId);
generated_id!(HandlerId);
generated_id!(ExecutionId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_from_str() {
        let system = SystemId::from("marketplace");
        assert_eq!(system.as_str(), "marketplace");
        assert_eq!(&*system, "marketplace");
    }

    #[test]
    fn id_serializes_transparently() {
        let id = WorkflowId::new("onboarding");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"onboarding\"");
        let back: WorkflowId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = ExecutionId::generate();
        let b = ExecutionId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn borrow_allows_str_lookups() {
        let mut map = std::collections::HashMap::new();
        map.insert(SystemId::from("cns"), 1);
        assert_eq!(map.get("cns"), Some(&1));
    }
}
