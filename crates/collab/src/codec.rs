//! Step codec: the seam between the wire format and the step type.
//!
//! Protocol messages carry steps as opaque JSON values. Sessions and the
//! authority decode them through a `StepCodec`, so the rebase algorithm never
//! depends on how a particular editor serializes its steps.

use crate::error::{CollabError, CollabResult};
use doc_model::Step;
use serde::Deserialize;
use serde_json::Value;

/// Encodes steps for the wire and decodes them back.
pub trait StepCodec: Send + Sync {
    fn encode(&self, step: &Step) -> CollabResult<Value>;

    fn decode(&self, value: &Value) -> CollabResult<Step>;

    fn encode_all(&self, steps: &[Step]) -> CollabResult<Vec<Value>> {
        steps.iter().map(|step| self.encode(step)).collect()
    }

    fn decode_all(&self, values: &[Value]) -> CollabResult<Vec<Step>> {
        values.iter().map(|value| self.decode(value)).collect()
    }
}

/// Codec using the serde representation of `Step`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonStepCodec;

impl StepCodec for JsonStepCodec {
    fn encode(&self, step: &Step) -> CollabResult<Value> {
        serde_json::to_value(step).map_err(|e| CollabError::Codec(e.to_string()))
    }

    fn decode(&self, value: &Value) -> CollabResult<Step> {
        Step::deserialize(value).map_err(|e| CollabError::Codec(e.to_string()))
    }
}
