//! Approval gate: an external handler consulted for modules marked
//! `requires_approval` (spec §4.7 step 6).

use async_trait::async_trait;
use serde_json::Value;

use apcore_errors::ApcoreError;

use crate::context::Context;
use crate::module::Annotations;
use crate::observability::tracing::record_approval_decision;

/// Everything the handler needs to decide on a fresh (non-token) approval
/// request.
pub struct ApprovalRequest<'a> {
    pub module_id: &'a str,
    pub arguments: &'a Value,
    pub annotations: Annotations,
    pub description: &'a str,
    pub tags: &'a [String],
    pub context: &'a Context,
}

/// Outcome of an approval decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalStatus {
    Approved,
    Rejected,
    Timeout,
    Pending { approval_id: String },
}

/// External collaborator consulted by the executor when a module's
/// `requiresApproval` annotation is set.
#[async_trait]
pub trait ApprovalHandler: Send + Sync {
    async fn request_approval(&self, request: ApprovalRequest<'_>) -> ApprovalStatus;
    async fn check_approval(&self, token: &str) -> ApprovalStatus;
}

/// Runs the approval gate for one call: pops `_approval_token` from
/// `inputs` if present and checks it, else requests a fresh decision.
///
/// # Errors
/// Returns `ApprovalDenied`, `ApprovalTimeout`, or `ApprovalPending`
/// depending on the handler's decision; `rejected` and any unrecognized
/// status are treated as denial.
pub async fn run_gate(
    handler: &dyn ApprovalHandler,
    module_id: &str,
    inputs: &mut Value,
    annotations: Annotations,
    description: &str,
    tags: &[String],
    context: &Context,
) -> Result<(), ApcoreError> {
    let token = inputs
        .as_object_mut()
        .and_then(|obj| obj.remove("_approval_token"));

    let status = if let Some(Value::String(token)) = token {
        handler.check_approval(&token).await
    } else {
        handler
            .request_approval(ApprovalRequest {
                module_id,
                arguments: inputs,
                annotations,
                description,
                tags,
                context,
            })
            .await
    };

    match status {
        ApprovalStatus::Approved => {
            tracing::info!(module_id, status = "approved", "approval_decision");
            record_approval_decision(context, module_id, "approved", None);
            Ok(())
        }
        ApprovalStatus::Rejected => {
            tracing::info!(module_id, status = "rejected", "approval_decision");
            record_approval_decision(context, module_id, "rejected", None);
            Err(ApcoreError::approval_denied(module_id))
        }
        ApprovalStatus::Timeout => {
            tracing::info!(module_id, status = "timeout", "approval_decision");
            record_approval_decision(context, module_id, "timeout", None);
            Err(ApcoreError::approval_timeout(module_id))
        }
        ApprovalStatus::Pending { approval_id } => {
            tracing::info!(module_id, status = "pending", approval_id, "approval_decision");
            record_approval_decision(context, module_id, "pending", Some(&approval_id));
            Err(ApcoreError::approval_pending(module_id, approval_id))
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use serde_json::json;

    struct FixedHandler(ApprovalStatus);

    #[async_trait]
    impl ApprovalHandler for FixedHandler {
        async fn request_approval(&self, _request: ApprovalRequest<'_>) -> ApprovalStatus {
            self.0.clone()
        }
        async fn check_approval(&self, _token: &str) -> ApprovalStatus {
            self.0.clone()
        }
    }

    impl Clone for ApprovalStatus {
        fn clone(&self) -> Self {
            match self {
                Self::Approved => Self::Approved,
                Self::Rejected => Self::Rejected,
                Self::Timeout => Self::Timeout,
                Self::Pending { approval_id } => Self::Pending {
                    approval_id: approval_id.clone(),
                },
            }
        }
    }

    #[tokio::test]
    async fn approved_status_succeeds() {
        let handler = FixedHandler(ApprovalStatus::Approved);
        let mut inputs = json!({});
        let context = Context::root("t1", None);
        let result = run_gate(&handler, "m", &mut inputs, Annotations::default(), "d", &[], &context).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn pending_status_carries_approval_id() {
        let handler = FixedHandler(ApprovalStatus::Pending {
            approval_id: "tok-abc".into(),
        });
        let mut inputs = json!({});
        let context = Context::root("t1", None);
        let err = run_gate(&handler, "m", &mut inputs, Annotations::default(), "d", &[], &context)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "APPROVAL_PENDING");
        assert_eq!(err.approval_id().as_deref(), Some("tok-abc"));
    }

    #[tokio::test]
    async fn approval_token_is_popped_and_checked() {
        let handler = FixedHandler(ApprovalStatus::Approved);
        let mut inputs = json!({"_approval_token": "tok-1", "a": 1});
        let context = Context::root("t1", None);
        run_gate(&handler, "m", &mut inputs, Annotations::default(), "d", &[], &context)
            .await
            .unwrap();
        assert!(inputs.get("_approval_token").is_none());
        assert_eq!(inputs.get("a"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn rejected_status_is_approval_denied() {
        let handler = FixedHandler(ApprovalStatus::Rejected);
        let mut inputs = json!({});
        let context = Context::root("t1", None);
        let err = run_gate(&handler, "m", &mut inputs, Annotations::default(), "d", &[], &context)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "APPROVAL_DENIED");
    }
}
