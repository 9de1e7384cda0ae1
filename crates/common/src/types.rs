use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Declares a UUID-backed identifier newtype.
///
/// Each identifier is a distinct type so saga ids, entity ids and snapshot
/// ids cannot be mixed up even though they share a representation.
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Creates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Creates an identifier from an existing UUID.
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the underlying UUID.
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

uuid_id!(
    /// Identifier of the business entity a saga acts upon (an order, a customer).
    AggregateId
);

uuid_id!(
    /// Identifier of a saga instance.
    SagaId
);

uuid_id!(
    /// Identifier of a single forward or compensating action.
    ActionId
);

impl ActionId {
    /// Derives the id of a step's action from its saga id, so the same
    /// action gets the same id whenever the saga is rebuilt from a template.
    pub fn for_step(saga_id: SagaId, sequence: u32, compensating: bool) -> Self {
        let direction = if compensating { "compensating" } else { "forward" };
        let name = format!("{sequence}/{direction}");
        Self(Uuid::new_v5(&saga_id.as_uuid(), name.as_bytes()))
    }
}

uuid_id!(
    /// Identifier of a persisted saga snapshot.
    SnapshotId
);

uuid_id!(
    /// Identifier of a stored saga configuration.
    ConfigurationId
);

uuid_id!(
    /// Concurrency token stamped on every write of a saga record or
    /// configuration. A save is accepted only when the caller presents the
    /// token it last read.
    ETag
);
