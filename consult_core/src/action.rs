//! Action envelope routed by the store to the slice reducers.
//!
//! Every action is `{ type, timestamp, payload, meta? }`. The payload is a
//! closed enum so reducers match on compile-checked shapes rather than
//! inspecting loosely typed maps.

use crate::clock::IdGenerator;
use crate::consultation::ConsultationAction;
use crate::system::SystemAction;
use crate::user::UserAction;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Payload of an action, tagged by the slice that owns it
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "slice", content = "action", rename_all = "snake_case")]
pub enum ActionPayload {
    Consultation(ConsultationAction),
    System(SystemAction),
    User(UserAction),
}

impl ActionPayload {
    /// Stable name of the action, e.g. `consultation/finalize_transcript`
    pub fn type_name(&self) -> String {
        let (slice, value) = match self {
            ActionPayload::Consultation(a) => ("consultation", serde_json::to_value(a)),
            ActionPayload::System(a) => ("system", serde_json::to_value(a)),
            ActionPayload::User(a) => ("user", serde_json::to_value(a)),
        };
        let name = value
            .ok()
            .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_owned))
            .unwrap_or_else(|| "unknown".into());
        format!("{}/{}", slice, name)
    }
}

impl From<ConsultationAction> for ActionPayload {
    fn from(action: ConsultationAction) -> Self {
        ActionPayload::Consultation(action)
    }
}

impl From<SystemAction> for ActionPayload {
    fn from(action: SystemAction) -> Self {
        ActionPayload::System(action)
    }
}

impl From<UserAction> for ActionPayload {
    fn from(action: UserAction) -> Self {
        ActionPayload::User(action)
    }
}

/// Optional provenance attached by the dispatching collaborator
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct ActionMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

/// A timestamped action
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Action {
    pub timestamp: DateTime<Utc>,
    pub payload: ActionPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<ActionMeta>,
}

impl Action {
    pub fn new(payload: impl Into<ActionPayload>, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            payload: payload.into(),
            meta: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.meta.get_or_insert_with(ActionMeta::default).source = Some(source.into());
        self
    }
}

/// Inputs a reducer may read besides the previous slice and the action
pub struct ReduceContext<'a> {
    pub now: DateTime<Utc>,
    pub ids: &'a dyn IdGenerator,
}

impl<'a> ReduceContext<'a> {
    pub fn new(now: DateTime<Utc>, ids: &'a dyn IdGenerator) -> Self {
        Self { now, ids }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_name_uses_serde_tag() {
        let payload: ActionPayload = ConsultationAction::Pause { id: "c1".into() }.into();
        assert_eq!(payload.type_name(), "consultation/pause");

        let payload: ActionPayload = SystemAction::SetOnline { online: false }.into();
        assert_eq!(payload.type_name(), "system/set_online");
    }

    #[test]
    fn test_action_envelope_serializes_meta_only_when_present() {
        let action = Action::new(UserAction::GdprDelete, Utc::now());
        let json = serde_json::to_value(&action).unwrap();
        assert!(json.get("meta").is_none());

        let action = action.with_source("ui");
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["meta"]["source"], "ui");
    }
}
