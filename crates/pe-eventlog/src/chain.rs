// SPDX-License-Identifier: MIT OR Apache-2.0

//! Parent-chain traversal over the in-memory event index.

use std::collections::HashMap;
use std::fmt;

use pe_core::{Event, EventId};

/// Errors raised while walking an event's parent chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    /// No event with the requested id has been indexed.
    NotFound {
        /// The id that was looked up.
        event_id: EventId,
    },
    /// An event references a `parent_event_id` that isn't indexed — a
    /// corrupted or partially-hydrated log.
    BrokenParent {
        /// The event whose parent reference could not be resolved.
        event_id: EventId,
        /// The missing parent id.
        missing_parent: EventId,
    },
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { event_id } => write!(f, "no event with id {event_id}"),
            Self::BrokenParent {
                event_id,
                missing_parent,
            } => write!(
                f,
                "event {event_id} references missing parent {missing_parent}"
            ),
        }
    }
}

impl std::error::Error for ChainError {}

/// Walk `start`'s ancestry through `parent_event_id` links and return every
/// event in the chain in root-to-leaf (causal) order, `start` last.
pub fn walk_chain(
    index: &HashMap<EventId, Event>,
    start: EventId,
) -> Result<Vec<Event>, ChainError> {
    let mut current = index
        .get(&start)
        .cloned()
        .ok_or(ChainError::NotFound { event_id: start })?;
    let mut chain = vec![current.clone()];

    while let Some(parent_id) = current.parent_event_id {
        current = index.get(&parent_id).cloned().ok_or(ChainError::BrokenParent {
            event_id: current.id,
            missing_parent: parent_id,
        })?;
        chain.push(current.clone());
    }

    chain.reverse();
    Ok(chain)
}
