// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fluent builder for constructing [`Event`]s before they are appended.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use pe_core::{Event, EventType, JobId, PipelineId, Role};
use serde_json::Value;

/// Builds an [`Event`] ergonomically. The `id` field is left at `0` and is
/// assigned by [`crate::EventLog::append`], which is the only thing allowed
/// to mint event ids.
#[derive(Debug, Clone)]
pub struct EventBuilder {
    pipeline_id: PipelineId,
    job_id: JobId,
    from_role: Role,
    to_role: Option<Role>,
    event_type: EventType,
    parent_event_id: Option<u64>,
    content: Value,
    metadata: BTreeMap<String, Value>,
    timestamp: Option<DateTime<Utc>>,
}

impl EventBuilder {
    #[must_use]
    pub fn new(pipeline_id: PipelineId, job_id: JobId, from_role: Role, event_type: EventType) -> Self {
        Self {
            pipeline_id,
            job_id,
            from_role,
            to_role: None,
            event_type,
            parent_event_id: None,
            content: Value::Null,
            metadata: BTreeMap::new(),
            timestamp: None,
        }
    }

    #[must_use]
    pub fn to_role(mut self, role: Role) -> Self {
        self.to_role = Some(role);
        self
    }

    #[must_use]
    pub fn parent(mut self, parent_event_id: u64) -> Self {
        self.parent_event_id = Some(parent_event_id);
        self
    }

    #[must_use]
    pub fn content(mut self, content: Value) -> Self {
        self.content = content;
        self
    }

    #[must_use]
    pub fn metadata_entry(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    #[must_use]
    pub fn build(self) -> Event {
        Event {
            id: 0,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            pipeline_id: self.pipeline_id,
            job_id: self.job_id,
            from_role: self.from_role,
            to_role: self.to_role,
            event_type: self.event_type,
            parent_event_id: self.parent_event_id,
            content: self.content,
            metadata: self.metadata,
        }
    }
}
