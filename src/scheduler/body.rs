//! The computation-body model.
//!
//! A process body is a closed tree of composites over leaves. The core
//! treats bodies as opaque JSON; only this module (used by the scheduler
//! for validation and by the worker runtime for unfolding) gives them
//! structure.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ComputationBody {
    /// A unit of actual work: a named handler plus its input.
    Leaf {
        handler: String,
        #[serde(default)]
        payload: Value,
    },
    /// Run all children; the node's value is the ordered array of theirs.
    Parallel { children: Vec<ComputationBody> },
    /// Run all children; the first value wins, the rest are cancelled.
    Choice { children: Vec<ComputationBody> },
}

impl ComputationBody {
    pub fn parse(value: &Value) -> anyhow::Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| anyhow::anyhow!("malformed computation body: {}", e))
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("body serialization is infallible")
    }
}
