//! Frames: the entries of a strand's execution stack.
//!
//! A frame holds step-local payload for one (sub-)phase of a workflow plus
//! the deadline bookkeeping the escalation monitor works from. The payload
//! is an ordered key/value container; progs that want a schema read it
//! through [`Frame::payload_as`] and write it through [`Frame::from_payload`].

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Where control returns when a pushed frame pops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameLink {
    /// Prog of the caller.
    pub prog: String,
    /// Label of the caller, re-entered with the popped value as `retval`.
    pub label: String,
}

/// One entry of a strand's stack.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Step-local payload.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub payload: Map<String, Value>,

    /// Absolute time after which the frame escalates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_at: Option<DateTime<Utc>>,

    /// Label whose execution satisfies the deadline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_target: Option<String>,

    /// Page raised for a missed deadline, if any. At most one per frame.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_id: Option<Uuid>,

    /// Caller to return to on pop. `None` for the bottom frame.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<FrameLink>,
}

fn not_an_object() -> serde_json::Error {
    <serde_json::Error as serde::de::Error>::custom("frame payload must be a JSON object")
}

impl Frame {
    /// Creates an empty frame.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a frame from any serializable struct or map.
    ///
    /// # Errors
    ///
    /// Returns an error if `value` does not serialize to a JSON object.
    pub fn from_payload<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        match serde_json::to_value(value)? {
            Value::Object(payload) => Ok(Self {
                payload,
                ..Self::default()
            }),
            Value::Null => Ok(Self::default()),
            _ => Err(not_an_object()),
        }
    }

    /// Adds a key to the payload, builder style.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Reads the whole payload as a typed value.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload does not match `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.payload.clone()))
    }

    /// Reads one payload key as a typed value.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is present but does not match `T`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, serde_json::Error> {
        self.payload
            .get(key)
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()
    }

    /// Writes one payload key.
    ///
    /// # Errors
    ///
    /// Returns an error if `value` cannot be serialized.
    pub fn set<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), serde_json::Error> {
        self.payload
            .insert(key.to_string(), serde_json::to_value(value)?);
        Ok(())
    }

    /// Removes one payload key, returning its previous value.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.payload.remove(key)
    }

    /// Arms a deadline: if `target` has not executed by `at`, the frame pages.
    pub fn set_deadline(&mut self, target: impl Into<String>, at: DateTime<Utc>) {
        self.deadline_target = Some(target.into());
        self.deadline_at = Some(at);
    }

    /// Disarms the deadline. The page reference is left for the caller to resolve.
    pub fn clear_deadline(&mut self) {
        self.deadline_at = None;
        self.deadline_target = None;
    }

    /// Returns true if a deadline is armed and `now` is past it.
    #[must_use]
    pub fn is_deadline_missed_at(&self, now: DateTime<Utc>) -> bool {
        self.deadline_at.is_some_and(|at| now > at)
    }
}
