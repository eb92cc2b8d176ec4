//! Resource status and the stack lifecycle classification.

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Status of a resource, always recomputed from live state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum ResourceStatus {
    #[display("NOEXIST")]
    #[serde(rename = "NOEXIST")]
    NoExist,
    #[display("PROGRESS")]
    #[serde(rename = "PROGRESS")]
    Progress,
    #[display("FAILED")]
    #[serde(rename = "FAILED")]
    Failed,
    #[display("COMPLETED")]
    #[serde(rename = "COMPLETED")]
    Completed,
    #[display("REQUIRE_UPDATE")]
    #[serde(rename = "REQUIRE_UPDATE")]
    RequireUpdate,
}

impl ResourceStatus {
    /// Whether the remote object exists in some form.
    pub fn exists(&self) -> bool {
        !matches!(self, ResourceStatus::NoExist)
    }
}

/// Outcome of classifying a raw lifecycle code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// The code alone decides the status.
    Settled(ResourceStatus),
    /// The stack is stable; the status depends on whether the templates match.
    NeedsDriftCheck,
}

impl Classification {
    pub fn resolve(self, templates_match: bool) -> ResourceStatus {
        match self {
            Classification::Settled(status) => status,
            Classification::NeedsDriftCheck if templates_match => ResourceStatus::Completed,
            Classification::NeedsDriftCheck => ResourceStatus::RequireUpdate,
        }
    }
}

/// Classify a lifecycle code such as `CREATE_COMPLETE` or
/// `UPDATE_ROLLBACK_IN_PROGRESS`.
///
/// `None` means the stack descriptor is absent. The action is the first
/// `_`-separated token and the status is the last one. Any combination that
/// is not understood is an error rather than a guess.
pub fn classify(code: Option<&str>, deletion_time_present: bool) -> Result<Classification> {
    let Some(code) = code else {
        return Ok(Classification::Settled(ResourceStatus::NoExist));
    };

    let action = code.split('_').next().unwrap_or_default();
    let suffix = code.rsplit('_').next().unwrap_or_default();

    match (action, suffix) {
        (_, "PROGRESS") => Ok(Classification::Settled(ResourceStatus::Progress)),
        (_, "FAILED") => Ok(Classification::Settled(ResourceStatus::Failed)),
        ("DELETE", "COMPLETE") => Ok(Classification::Settled(ResourceStatus::NoExist)),
        ("ROLLBACK", "COMPLETE") if deletion_time_present => {
            Ok(Classification::Settled(ResourceStatus::Failed))
        }
        ("ROLLBACK" | "IMPORT" | "REVIEW" | "UPDATE" | "CREATE", "COMPLETE") => {
            Ok(Classification::NeedsDriftCheck)
        }
        _ => Err(Error::InvalidState(format!("unknown stack status: {}", code))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: Option<&str>, deleted: bool, templates_match: bool) -> ResourceStatus {
        classify(code, deleted).unwrap().resolve(templates_match)
    }

    #[test]
    fn test_absent_stack_is_noexist() {
        assert_eq!(status(None, false, false), ResourceStatus::NoExist);
    }

    #[test]
    fn test_progress_regardless_of_action() {
        for code in [
            "CREATE_IN_PROGRESS",
            "UPDATE_IN_PROGRESS",
            "DELETE_IN_PROGRESS",
            "UPDATE_COMPLETE_CLEANUP_IN_PROGRESS",
            "UPDATE_ROLLBACK_IN_PROGRESS",
            "REVIEW_IN_PROGRESS",
        ] {
            assert_eq!(status(Some(code), false, true), ResourceStatus::Progress, "{code}");
        }
    }

    #[test]
    fn test_failed_suffix() {
        for code in ["CREATE_FAILED", "ROLLBACK_FAILED", "UPDATE_ROLLBACK_FAILED"] {
            assert_eq!(status(Some(code), false, true), ResourceStatus::Failed, "{code}");
        }
    }

    #[test]
    fn test_create_complete_depends_on_drift() {
        assert_eq!(
            status(Some("CREATE_COMPLETE"), false, true),
            ResourceStatus::Completed
        );
        assert_eq!(
            status(Some("CREATE_COMPLETE"), false, false),
            ResourceStatus::RequireUpdate
        );
    }

    #[test]
    fn test_delete_complete_is_noexist() {
        assert_eq!(
            status(Some("DELETE_COMPLETE"), true, false),
            ResourceStatus::NoExist
        );
    }

    #[test]
    fn test_rollback_complete() {
        assert_eq!(
            status(Some("ROLLBACK_COMPLETE"), true, true),
            ResourceStatus::Failed
        );
        assert_eq!(
            status(Some("ROLLBACK_COMPLETE"), false, true),
            ResourceStatus::Completed
        );
        assert_eq!(
            status(Some("ROLLBACK_COMPLETE"), false, false),
            ResourceStatus::RequireUpdate
        );
    }

    #[test]
    fn test_update_rollback_complete_uses_update_action() {
        assert_eq!(
            status(Some("UPDATE_ROLLBACK_COMPLETE"), false, true),
            ResourceStatus::Completed
        );
        assert_eq!(
            status(Some("IMPORT_COMPLETE"), false, false),
            ResourceStatus::RequireUpdate
        );
    }

    #[test]
    fn test_unknown_code_is_an_error() {
        let err = classify(Some("DELETE_SKIPPED"), false).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert!(classify(Some("MIGRATE_COMPLETE"), false).is_err());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ResourceStatus::NoExist.to_string(), "NOEXIST");
        assert_eq!(ResourceStatus::RequireUpdate.to_string(), "REQUIRE_UPDATE");
        assert_eq!(
            serde_json::to_string(&ResourceStatus::Completed).unwrap(),
            "\"COMPLETED\""
        );
    }
}
