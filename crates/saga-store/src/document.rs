use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ConfigurationId, ETag, SagaId, SnapshotId};

/// Sequence number of a saga snapshot.
///
/// Sequences are assigned by the store, start at 1 for the first snapshot of
/// a saga and increase by 1 for each subsequent snapshot of the same saga.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Sequence(i64);

impl Sequence {
    /// Creates a sequence from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the sequence (0) of a saga that has no snapshots yet.
    pub fn initial() -> Self {
        Self(0)
    }

    /// Returns the sequence (1) of the first snapshot.
    pub fn first() -> Self {
        Self(1)
    }

    /// Returns the next sequence.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw sequence value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Sequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Sequence {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// The current persisted record of a saga.
///
/// There is at most one record per saga id. Every write stamps a fresh
/// [`ETag`]; saves must present the previous one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaDocument {
    /// The saga this record belongs to.
    pub saga_id: SagaId,

    /// The saga type (e.g. "CreateOrderSaga").
    pub saga_type: String,

    /// Concurrency token of the stored version. `None` before the first write.
    pub etag: Option<ETag>,

    /// When the record was last written.
    pub updated_at: DateTime<Utc>,

    /// The serialized saga.
    pub state: serde_json::Value,
}

impl SagaDocument {
    /// Creates an unsaved saga document.
    pub fn new(saga_id: SagaId, saga_type: impl Into<String>, state: serde_json::Value) -> Self {
        Self {
            saga_id,
            saga_type: saga_type.into(),
            etag: None,
            updated_at: Utc::now(),
            state,
        }
    }

    /// Creates an unsaved document from a serializable saga state.
    pub fn from_state<T: Serialize>(
        saga_id: SagaId,
        saga_type: impl Into<String>,
        state: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(saga_id, saga_type, serde_json::to_value(state)?))
    }

    /// Deserializes the stored state into a concrete type.
    pub fn into_state<T: for<'de> Deserialize<'de>>(self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.state)
    }
}

/// An immutable, sequence-numbered copy of a saga at one point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEnvelope {
    /// Unique identifier of this snapshot.
    pub snapshot_id: SnapshotId,

    /// The saga this snapshot belongs to.
    pub saga_id: SagaId,

    /// The saga type.
    pub saga_type: String,

    /// Position of this snapshot in the saga's history.
    pub sequence: Sequence,

    /// Concurrency token of the saga record when the snapshot was taken.
    pub etag: Option<ETag>,

    /// When the snapshot was written.
    pub timestamp: DateTime<Utc>,

    /// The serialized saga.
    pub state: serde_json::Value,
}

impl SnapshotEnvelope {
    /// Creates a snapshot envelope. The sequence is assigned by the store on append.
    pub fn new(
        saga_id: SagaId,
        saga_type: impl Into<String>,
        etag: Option<ETag>,
        state: serde_json::Value,
    ) -> Self {
        Self {
            snapshot_id: SnapshotId::new(),
            saga_id,
            saga_type: saga_type.into(),
            sequence: Sequence::initial(),
            etag,
            timestamp: Utc::now(),
            state,
        }
    }

    /// Deserializes the snapshot state into a concrete type.
    pub fn into_state<T: for<'de> Deserialize<'de>>(self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.state)
    }

    /// Gets a reference to the state as JSON.
    pub fn state_ref(&self) -> &serde_json::Value {
        &self.state
    }
}

/// A stored saga configuration: a named step template for new sagas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigurationDocument {
    /// The configuration id.
    pub id: ConfigurationId,

    /// Human-readable configuration name.
    pub name: String,

    /// Concurrency token of the stored version. `None` before the first write.
    pub etag: Option<ETag>,

    /// The serialized step template.
    pub definition: serde_json::Value,
}

impl ConfigurationDocument {
    /// Creates an unsaved configuration document.
    pub fn new(id: ConfigurationId, name: impl Into<String>, definition: serde_json::Value) -> Self {
        Self {
            id,
            name: name.into(),
            etag: None,
            definition,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct TestState {
        step: u32,
        name: String,
    }

    #[test]
    fn sequence_progression() {
        assert_eq!(Sequence::initial().next(), Sequence::first());
        assert_eq!(Sequence::first().next(), Sequence::new(2));
        assert!(Sequence::new(3) > Sequence::first());
    }

    #[test]
    fn saga_document_state_roundtrip() {
        let original = TestState {
            step: 2,
            name: "reserve_credit".to_string(),
        };

        let document = SagaDocument::from_state(SagaId::new(), "TestSaga", &original).unwrap();
        assert!(document.etag.is_none());

        let restored: TestState = document.into_state().unwrap();
        assert_eq!(restored, original);
    }

    #[test]
    fn new_snapshot_is_unsequenced() {
        let saga_id = SagaId::new();
        let snapshot = SnapshotEnvelope::new(saga_id, "TestSaga", None, serde_json::json!({}));

        assert_eq!(snapshot.saga_id, saga_id);
        assert_eq!(snapshot.sequence, Sequence::initial());
        assert_eq!(snapshot.state_ref(), &serde_json::json!({}));
    }
}
