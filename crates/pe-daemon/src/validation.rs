// SPDX-License-Identifier: MIT OR Apache-2.0
//! Request validation for the dispatch API, ahead of any queue mutation.

use pe_json_guard::{validate_json_payload, JsonGuardLimits};
use uuid::Uuid;

/// Validates incoming dispatch API requests before processing.
pub struct RequestValidator;

const MAX_DEPTH: usize = 10;
const MAX_SIZE_BYTES: usize = 1_000_000;

impl RequestValidator {
    /// Validate that `id` is a well-formed UUID string.
    pub fn validate_job_id(id: &str) -> Result<(), String> {
        if id.is_empty() {
            return Err("job_id must not be empty".into());
        }
        id.parse::<Uuid>().map(|_| ()).map_err(|_| format!("invalid UUID format: {id}"))
    }

    /// Validate a job's payload. Must be a JSON object within the guard's
    /// depth/size limits; an empty object is allowed.
    pub fn validate_payload(payload: &serde_json::Value) -> Result<(), Vec<String>> {
        let errors = validate_json_payload(payload, JsonGuardLimits::new(MAX_DEPTH, MAX_SIZE_BYTES));
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Validate a job's context. `Value::Null` is allowed — most jobs carry
    /// no extra context — anything else must pass the same object guard as
    /// the payload.
    pub fn validate_context(context: &serde_json::Value) -> Result<(), Vec<String>> {
        if context.is_null() {
            return Ok(());
        }
        Self::validate_payload(context)
    }

    /// Validate a `POST /jobs/create` request's root-pipeline fields,
    /// required exactly when the job has no `parent_job_id`.
    pub fn validate_root_fields(root_request: &Option<String>, session_id: &Option<String>) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        match root_request {
            Some(r) if r.trim().is_empty() => errors.push("root_request must not be blank".into()),
            None => errors.push("root_request is required when parent_job_id is absent".into()),
            Some(_) => {}
        }
        match session_id {
            Some(s) if s.trim().is_empty() => errors.push("session_id must not be blank".into()),
            None => errors.push("session_id is required when parent_job_id is absent".into()),
            Some(_) => {}
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn valid_uuid_accepted() {
        let id = Uuid::new_v4().to_string();
        assert!(RequestValidator::validate_job_id(&id).is_ok());
    }

    #[test]
    fn invalid_uuid_rejected() {
        assert!(RequestValidator::validate_job_id("not-a-uuid").is_err());
    }

    #[test]
    fn empty_job_id_rejected() {
        assert!(RequestValidator::validate_job_id("").is_err());
    }

    #[test]
    fn object_payload_accepted() {
        assert!(RequestValidator::validate_payload(&json!({"task": "fix the parser"})).is_ok());
    }

    #[test]
    fn non_object_payload_rejected() {
        assert!(RequestValidator::validate_payload(&json!([1, 2, 3])).is_err());
    }

    #[test]
    fn null_context_accepted() {
        assert!(RequestValidator::validate_context(&serde_json::Value::Null).is_ok());
    }

    #[test]
    fn non_null_non_object_context_rejected() {
        assert!(RequestValidator::validate_context(&json!("notes")).is_err());
    }

    #[test]
    fn root_fields_required_together() {
        assert!(RequestValidator::validate_root_fields(&Some("do the thing".into()), &Some("sess-1".into())).is_ok());
        assert!(RequestValidator::validate_root_fields(&None, &Some("sess-1".into())).is_err());
        assert!(RequestValidator::validate_root_fields(&Some("do the thing".into()), &None).is_err());
    }

    #[test]
    fn blank_root_request_rejected() {
        assert!(RequestValidator::validate_root_fields(&Some("   ".into()), &Some("sess-1".into())).is_err());
    }
}
