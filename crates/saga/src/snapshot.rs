//! Persisted shape of a saga: the current record and its snapshot history.

use chrono::{DateTime, Utc};
use common::{AggregateId, ConfigurationId, ETag, SagaId, SnapshotId};
use saga_store::{Sequence, SnapshotEnvelope};
use serde::{Deserialize, Serialize};

use crate::action::{SagaAction, SagaStep};
use crate::error::{Result, SagaError};
use crate::state::{ActionState, SagaState};

/// One step as persisted. An action that never left `Initial` may be omitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotStep {
    pub sequence: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<SagaAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensating_action: Option<SagaAction>,
}

impl SnapshotStep {
    fn full(step: &SagaStep) -> Self {
        Self {
            sequence: step.sequence(),
            action: Some(step.action().clone()),
            compensating_action: Some(step.compensating_action().clone()),
        }
    }

    fn pruned(step: &SagaStep) -> Option<Self> {
        let keep = |action: &SagaAction| {
            (action.state() != ActionState::Initial).then(|| action.clone())
        };
        let action = keep(step.action());
        let compensating_action = keep(step.compensating_action());
        if action.is_none() && compensating_action.is_none() {
            return None;
        }
        Some(Self {
            sequence: step.sequence(),
            action,
            compensating_action,
        })
    }

    /// Returns true if neither action was omitted.
    pub fn is_complete(&self) -> bool {
        self.action.is_some() && self.compensating_action.is_some()
    }
}

/// The serialized form of a saga, as stored in records and snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaRecord {
    pub saga_id: SagaId,
    pub saga_type: String,
    pub entity_id: Option<AggregateId>,
    pub saga_started: Option<DateTime<Utc>>,
    pub current_step: u32,
    pub state: SagaState,
    pub state_info: Option<String>,
    pub config_id: Option<ConfigurationId>,
    pub config_name: Option<String>,
    pub steps: Vec<SnapshotStep>,
}

impl SagaRecord {
    /// Builds a record carrying every step and action.
    pub(crate) fn full(header: RecordHeader, steps: &[SagaStep]) -> Self {
        header.into_record(steps.iter().map(SnapshotStep::full).collect())
    }

    /// Builds a record without the actions that never ran.
    pub(crate) fn pruned(header: RecordHeader, steps: &[SagaStep]) -> Self {
        header.into_record(steps.iter().filter_map(SnapshotStep::pruned).collect())
    }

    /// Rebuilds the step list from a full record.
    pub(crate) fn complete_steps(&self) -> Result<Vec<SagaStep>> {
        self.steps
            .iter()
            .map(|step| match (&step.action, &step.compensating_action) {
                (Some(action), Some(compensating)) => Ok(SagaStep::new(
                    step.sequence,
                    action.clone(),
                    compensating.clone(),
                )),
                _ => Err(SagaError::InvalidSteps(format!(
                    "step {} of saga {} was persisted without both actions",
                    step.sequence, self.saga_id
                ))),
            })
            .collect()
    }

    /// Overlays the persisted actions onto a template step list.
    ///
    /// Steps and actions absent from the record keep their template form.
    pub(crate) fn overlay(&self, mut template: Vec<SagaStep>) -> Result<Vec<SagaStep>> {
        for persisted in &self.steps {
            let step = template
                .iter_mut()
                .find(|s| s.sequence() == persisted.sequence)
                .ok_or_else(|| {
                    SagaError::InvalidSteps(format!(
                        "snapshot of saga {} references unknown step {}",
                        self.saga_id, persisted.sequence
                    ))
                })?;
            if let Some(action) = &persisted.action {
                step.replace_action(false, action.clone());
            }
            if let Some(action) = &persisted.compensating_action {
                step.replace_action(true, action.clone());
            }
        }
        Ok(template)
    }
}

/// The saga-level fields of a record.
#[derive(Debug, Clone)]
pub(crate) struct RecordHeader {
    pub saga_id: SagaId,
    pub saga_type: String,
    pub entity_id: Option<AggregateId>,
    pub saga_started: Option<DateTime<Utc>>,
    pub current_step: u32,
    pub state: SagaState,
    pub state_info: Option<String>,
    pub config_id: Option<ConfigurationId>,
    pub config_name: Option<String>,
}

impl RecordHeader {
    fn into_record(self, steps: Vec<SnapshotStep>) -> SagaRecord {
        SagaRecord {
            saga_id: self.saga_id,
            saga_type: self.saga_type,
            entity_id: self.entity_id,
            saga_started: self.saga_started,
            current_step: self.current_step,
            state: self.state,
            state_info: self.state_info,
            config_id: self.config_id,
            config_name: self.config_name,
            steps,
        }
    }
}

/// A stored, immutable snapshot of a saga.
#[derive(Debug, Clone, PartialEq)]
pub struct SagaSnapshot {
    pub snapshot_id: SnapshotId,
    pub sequence: Sequence,
    pub etag: Option<ETag>,
    pub taken_at: DateTime<Utc>,
    pub record: SagaRecord,
}

impl SagaSnapshot {
    pub fn saga_id(&self) -> SagaId {
        self.record.saga_id
    }

    pub fn state(&self) -> SagaState {
        self.record.state
    }

    pub fn current_step(&self) -> u32 {
        self.record.current_step
    }
}

impl TryFrom<SnapshotEnvelope> for SagaSnapshot {
    type Error = serde_json::Error;

    fn try_from(envelope: SnapshotEnvelope) -> std::result::Result<Self, Self::Error> {
        let snapshot_id = envelope.snapshot_id;
        let sequence = envelope.sequence;
        let etag = envelope.etag;
        let taken_at = envelope.timestamp;
        Ok(Self {
            snapshot_id,
            sequence,
            etag,
            taken_at,
            record: envelope.into_state()?,
        })
    }
}
