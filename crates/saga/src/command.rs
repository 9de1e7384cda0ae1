//! Commands, their result values and the command registry.

use std::collections::HashMap;
use std::sync::Arc;

use common::{AggregateId, SagaId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SagaError};

/// The kinds of result a command can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultKind {
    Unit,
    Boolean,
    Integer,
    Decimal,
    Text,
    Id,
    Json,
}

impl std::fmt::Display for ResultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// A command result, expected or actual.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum ResultValue {
    Unit,
    Boolean(bool),
    Integer(i64),
    /// Non-finite decimals are stored as the strings "NaN", "inf" and "-inf".
    Decimal(#[serde(with = "decimal")] f64),
    Text(String),
    Id(Uuid),
    Json(serde_json::Value),
}

impl ResultValue {
    /// Returns the kind of this value.
    pub fn kind(&self) -> ResultKind {
        match self {
            ResultValue::Unit => ResultKind::Unit,
            ResultValue::Boolean(_) => ResultKind::Boolean,
            ResultValue::Integer(_) => ResultKind::Integer,
            ResultValue::Decimal(_) => ResultKind::Decimal,
            ResultValue::Text(_) => ResultKind::Text,
            ResultValue::Id(_) => ResultKind::Id,
            ResultValue::Json(_) => ResultKind::Json,
        }
    }

    /// Creates a text value.
    pub fn text(value: impl Into<String>) -> Self {
        ResultValue::Text(value.into())
    }
}

/// JSON has no literal for NaN or the infinities.
mod decimal {
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else {
            serializer.serialize_str(&value.to_string())
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(value) => Ok(value),
            Repr::Text(text) => text
                .parse::<f64>()
                .ok()
                .filter(|value| !value.is_finite())
                .ok_or_else(|| D::Error::custom(format!("invalid decimal '{text}'"))),
        }
    }
}

impl std::fmt::Display for ResultValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResultValue::Unit => write!(f, "()"),
            ResultValue::Boolean(v) => write!(f, "{v}"),
            ResultValue::Integer(v) => write!(f, "{v}"),
            ResultValue::Decimal(v) => write!(f, "{v}"),
            ResultValue::Text(v) => write!(f, "{v}"),
            ResultValue::Id(v) => write!(f, "{v}"),
            ResultValue::Json(v) => write!(f, "{v}"),
        }
    }
}

impl From<bool> for ResultValue {
    fn from(value: bool) -> Self {
        ResultValue::Boolean(value)
    }
}

impl From<i64> for ResultValue {
    fn from(value: i64) -> Self {
        ResultValue::Integer(value)
    }
}

impl From<&str> for ResultValue {
    fn from(value: &str) -> Self {
        ResultValue::Text(value.to_string())
    }
}

impl From<Uuid> for ResultValue {
    fn from(value: Uuid) -> Self {
        ResultValue::Id(value)
    }
}

/// A command dispatched as part of a saga action.
///
/// The command name selects the handler. The saga stamps its own id and the
/// entity id on the command before dispatch so the handler can route the
/// result back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    name: String,
    saga_id: Option<SagaId>,
    entity_id: Option<AggregateId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<serde_json::Value>,
    expected_result: Option<ResultValue>,
    result: Option<ResultValue>,
}

impl Command {
    /// Creates a command with no expected result.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            saga_id: None,
            entity_id: None,
            payload: None,
            expected_result: None,
            result: None,
        }
    }

    /// Creates a command expecting a specific result.
    pub fn expecting(name: impl Into<String>, expected: impl Into<ResultValue>) -> Self {
        Self::new(name).with_expected_result(expected)
    }

    /// Sets the expected result.
    pub fn with_expected_result(mut self, expected: impl Into<ResultValue>) -> Self {
        self.expected_result = Some(expected.into());
        self
    }

    /// Attaches handler-specific parameters.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Sets the target entity.
    pub fn with_entity_id(mut self, entity_id: AggregateId) -> Self {
        self.entity_id = Some(entity_id);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn saga_id(&self) -> Option<SagaId> {
        self.saga_id
    }

    pub fn entity_id(&self) -> Option<AggregateId> {
        self.entity_id
    }

    pub fn payload(&self) -> Option<&serde_json::Value> {
        self.payload.as_ref()
    }

    pub fn expected_result(&self) -> Option<&ResultValue> {
        self.expected_result.as_ref()
    }

    /// Returns the actual result, once one has been reported.
    pub fn result(&self) -> Option<&ResultValue> {
        self.result.as_ref()
    }

    /// Returns the declared result kind, taken from the expected result.
    pub fn result_kind(&self) -> Option<ResultKind> {
        self.expected_result.as_ref().map(ResultValue::kind)
    }

    pub(crate) fn bind(&mut self, saga_id: SagaId, entity_id: Option<AggregateId>) {
        self.saga_id = Some(saga_id);
        if self.entity_id.is_none() {
            self.entity_id = entity_id;
        }
        self.result = None;
    }

    /// Returns a copy without saga binding or result.
    pub(crate) fn unbound(&self) -> Command {
        Command {
            name: self.name.clone(),
            saga_id: None,
            entity_id: None,
            payload: self.payload.clone(),
            expected_result: self.expected_result.clone(),
            result: None,
        }
    }

    pub(crate) fn set_result(&mut self, result: ResultValue) {
        self.result = Some(result);
    }

    /// Returns the stateless template form of this command.
    pub fn to_template(&self) -> CommandTemplate {
        CommandTemplate {
            name: self.name.clone(),
            expected_result: self.expected_result.clone(),
            payload: self.payload.clone(),
        }
    }
}

/// A command reduced to its name and expected result, as stored in
/// saga configurations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandTemplate {
    pub name: String,
    pub expected_result: Option<ResultValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl CommandTemplate {
    /// Creates a template expecting a specific result.
    pub fn new(name: impl Into<String>, expected_result: Option<ResultValue>) -> Self {
        Self {
            name: name.into(),
            expected_result,
            payload: None,
        }
    }
}

/// Turns a stored template into a live command.
pub type CommandDecoder = Arc<dyn Fn(&CommandTemplate) -> Result<Command> + Send + Sync>;

/// Maps stable command names to decoders.
///
/// Populated at startup; configurations may only reference registered names.
#[derive(Clone, Default)]
pub struct CommandRegistry {
    decoders: HashMap<String, CommandDecoder>,
}

impl CommandRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a command whose expected result, if present, must be of `kind`.
    ///
    /// `None` registers a command that declares no result.
    pub fn register(self, name: impl Into<String>, kind: Option<ResultKind>) -> Self {
        self.register_decoder(name, move |template: &CommandTemplate| {
            match (&template.expected_result, kind) {
                (Some(expected), Some(kind)) if expected.kind() != kind => {
                    Err(SagaError::InvalidCommandTemplate {
                        command: template.name.clone(),
                        reason: format!("expected a {kind} result, got {}", expected.kind()),
                    })
                }
                (Some(_), None) => Err(SagaError::InvalidCommandTemplate {
                    command: template.name.clone(),
                    reason: "command declares no result".to_string(),
                }),
                _ => {
                    let mut command = Command::new(template.name.clone());
                    command.expected_result = template.expected_result.clone();
                    command.payload = template.payload.clone();
                    Ok(command)
                }
            }
        })
    }

    /// Registers a custom decoder.
    pub fn register_decoder<F>(mut self, name: impl Into<String>, decoder: F) -> Self
    where
        F: Fn(&CommandTemplate) -> Result<Command> + Send + Sync + 'static,
    {
        self.decoders.insert(name.into(), Arc::new(decoder));
        self
    }

    /// Returns true if a decoder is registered for `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.decoders.contains_key(name)
    }

    /// Decodes a template into a command.
    pub fn decode(&self, template: &CommandTemplate) -> Result<Command> {
        let decoder = self
            .decoders
            .get(&template.name)
            .ok_or_else(|| SagaError::UnknownCommand(template.name.clone()))?;
        decoder(template)
    }
}

impl std::fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("commands", &self.decoders.keys().collect::<Vec<_>>())
            .finish()
    }
}
