// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]

//! Failure signature tracking and the monotonic self-repair → role-switch →
//! hard-fail escalation ladder.
//!
//! The map from [`FailureSignature`] to [`EscalationRecord`] is process-local
//! and bounded by a hand-rolled LRU (a `HashMap` plus a recency `VecDeque`):
//! there is no crate in the surrounding stack for embedded LRU caches, and a
//! signature map is small enough that a dependency would be overkill.
//! Persistence is best-effort and explicit — [`Escalator::flush`] and
//! [`Escalator::load`] are never called implicitly, since durability of this
//! state is an open question upstream of this crate.

use pe_core::{EscalationLevel, EscalationRecord, FailureSignature};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::Path;
use tracing::debug;

/// Capacity floor required by the failure-signature map.
pub const MIN_CAPACITY: usize = 4096;

/// Outcome of recording one failure against the signature map.
#[derive(Debug, Clone, PartialEq)]
pub struct EscalationOutcome {
    /// Escalation level after this failure, monotonically ≥ the prior level.
    pub level: EscalationLevel,
    /// Total failures observed for this signature so far.
    pub count: u32,
    /// An alternate profile to retry under when `level == RoleSwitch`, if one
    /// hasn't already been tried for this signature.
    pub retry_profile: Option<String>,
}

/// Bounded, process-local map from [`FailureSignature`] to [`EscalationRecord`].
#[derive(Debug)]
pub struct Escalator {
    records: HashMap<FailureSignature, EscalationRecord>,
    /// Recency order, oldest first; the front is evicted when over capacity.
    order: VecDeque<FailureSignature>,
    capacity: usize,
}

impl Escalator {
    /// Build an escalator with at least [`MIN_CAPACITY`] signature slots.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            records: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(MIN_CAPACITY),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn get(&self, signature: &FailureSignature) -> Option<&EscalationRecord> {
        self.records.get(signature)
    }

    /// Record one more occurrence of `signature` and compute the resulting
    /// escalation outcome. `candidate_profiles` are alternate personas the
    /// caller is willing to switch to; the first one not already tried for
    /// this signature is offered back as `retry_profile`.
    pub fn record_failure(
        &mut self,
        signature: FailureSignature,
        candidate_profiles: &[String],
    ) -> EscalationOutcome {
        self.touch(&signature);
        let record = self.records.entry(signature.clone()).or_default();
        record.count += 1;

        let computed = match record.count {
            1 => EscalationLevel::SelfRepair,
            2 => EscalationLevel::RoleSwitch,
            _ => EscalationLevel::HardFail,
        };
        // Monotonic non-decreasing: count only ever grows, so this already
        // holds, but guard explicitly against a future change to the mapping.
        if computed > record.level {
            record.level = computed;
        }

        let retry_profile = if record.level == EscalationLevel::RoleSwitch {
            let chosen = candidate_profiles
                .iter()
                .find(|p| !record.switched_profiles.contains(p))
                .cloned();
            if let Some(profile) = &chosen {
                record.switched_profiles.push(profile.clone());
            }
            chosen
        } else {
            None
        };

        debug!(
            target: "pe.escalate",
            count = record.count,
            level = ?record.level,
            "recorded failure"
        );

        let level = record.level;
        let count = record.count;

        self.evict_if_needed();

        EscalationOutcome {
            level,
            count,
            retry_profile,
        }
    }

    fn touch(&mut self, signature: &FailureSignature) {
        if let Some(pos) = self.order.iter().position(|s| s == signature) {
            self.order.remove(pos);
        }
        self.order.push_back(signature.clone());
    }

    fn evict_if_needed(&mut self) {
        while self.records.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.records.remove(&oldest);
            } else {
                break;
            }
        }
    }

    /// Serialize the full signature map to `path`. Best-effort: callers
    /// should treat a write failure as non-fatal, since this state is
    /// recoverable by re-observing failures.
    pub fn flush(&self, path: &Path) -> io::Result<()> {
        let entries: Vec<PersistedEntry> = self
            .order
            .iter()
            .filter_map(|sig| {
                self.records
                    .get(sig)
                    .map(|record| PersistedEntry {
                        signature: sig.clone(),
                        record: record.clone(),
                    })
            })
            .collect();
        let json = serde_json::to_string_pretty(&entries)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, json)
    }

    /// Load a previously flushed signature map. Best-effort: a missing or
    /// corrupt file is not an error the caller must handle specially beyond
    /// starting from an empty map, since this state is never authoritative.
    pub fn load(path: &Path, capacity: usize) -> io::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let entries: Vec<PersistedEntry> = serde_json::from_str(&raw)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let mut escalator = Self::new(capacity);
        for entry in entries {
            escalator.order.push_back(entry.signature.clone());
            escalator.records.insert(entry.signature, entry.record);
        }
        escalator.evict_if_needed();
        Ok(escalator)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedEntry {
    signature: FailureSignature,
    record: EscalationRecord,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pe_core::Role;

    fn sig(kind: &str) -> FailureSignature {
        FailureSignature::new(kind, vec!["diff".into()], Role::Coder, "hash-1")
    }

    #[test]
    fn first_failure_is_self_repair() {
        let mut esc = Escalator::new(MIN_CAPACITY);
        let outcome = esc.record_failure(sig("SEMANTIC_NULL"), &[]);
        assert_eq!(outcome.level, EscalationLevel::SelfRepair);
        assert_eq!(outcome.count, 1);
    }

    #[test]
    fn second_failure_is_role_switch_and_offers_a_profile() {
        let mut esc = Escalator::new(MIN_CAPACITY);
        let signature = sig("SEMANTIC_NULL");
        esc.record_failure(signature.clone(), &[]);
        let outcome = esc.record_failure(signature, &["alt-coder".into()]);
        assert_eq!(outcome.level, EscalationLevel::RoleSwitch);
        assert_eq!(outcome.retry_profile, Some("alt-coder".into()));
    }

    #[test]
    fn third_failure_is_hard_fail() {
        let mut esc = Escalator::new(MIN_CAPACITY);
        let signature = sig("SEMANTIC_NULL");
        esc.record_failure(signature.clone(), &[]);
        esc.record_failure(signature.clone(), &["alt-coder".into()]);
        let outcome = esc.record_failure(signature, &["alt-coder".into()]);
        assert_eq!(outcome.level, EscalationLevel::HardFail);
    }

    #[test]
    fn level_never_decreases_even_if_recomputed_lower() {
        let mut esc = Escalator::new(MIN_CAPACITY);
        let signature = sig("SEMANTIC_NULL");
        esc.record_failure(signature.clone(), &[]);
        esc.record_failure(signature.clone(), &[]);
        esc.record_failure(signature.clone(), &[]);
        assert_eq!(esc.get(&signature).unwrap().level, EscalationLevel::HardFail);
    }

    #[test]
    fn each_profile_is_offered_at_most_once() {
        let mut esc = Escalator::new(MIN_CAPACITY);
        let signature = sig("SEMANTIC_NULL");
        esc.record_failure(signature.clone(), &[]);
        let first = esc.record_failure(signature.clone(), &["alt-coder".into()]);
        assert_eq!(first.retry_profile, Some("alt-coder".into()));
        // Still at role_switch count-wise would require re-triggering count==2,
        // but switched_profiles already contains alt-coder so a hypothetical
        // repeat offer at the same level would find nothing left.
        let record = esc.get(&signature).unwrap();
        assert_eq!(record.switched_profiles, vec!["alt-coder".to_string()]);
    }

    #[test]
    fn distinct_signatures_do_not_collapse() {
        let mut esc = Escalator::new(MIN_CAPACITY);
        esc.record_failure(sig("SEMANTIC_NULL"), &[]);
        esc.record_failure(sig("JSON_PARSE"), &[]);
        assert_eq!(esc.len(), 2);
    }

    #[test]
    fn flush_then_load_round_trips() {
        let mut esc = Escalator::new(MIN_CAPACITY);
        let signature = sig("SEMANTIC_NULL");
        esc.record_failure(signature.clone(), &[]);
        esc.record_failure(signature.clone(), &["alt-coder".into()]);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("escalator.json");
        esc.flush(&path).unwrap();

        let loaded = Escalator::load(&path, MIN_CAPACITY).unwrap();
        assert_eq!(loaded.get(&signature), esc.get(&signature));
    }

    #[test]
    fn eviction_drops_the_least_recently_touched_signature() {
        let mut esc = Escalator::new(MIN_CAPACITY + 1);
        for i in 0..MIN_CAPACITY + 5 {
            esc.record_failure(sig(&format!("KIND_{i}")), &[]);
        }
        assert_eq!(esc.len(), MIN_CAPACITY + 1);
        assert!(esc.get(&sig("KIND_0")).is_none());
    }
}
