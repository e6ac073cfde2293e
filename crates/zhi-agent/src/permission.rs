//! Permission controller: a thin adapter over the UI's confirm callback.

use std::sync::Arc;

use tracing::{debug, info};

use crate::tools::RiskTier;

/// What the user is asked to approve.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PermissionRequest {
    pub tool: String,
    /// Human-readable summary of the action.
    pub description: String,
    pub tier: RiskTier,
    /// Extra warning for destructive shell commands.
    pub warning: Option<String>,
}

/// The outcome of one confirmation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PermissionDecision {
    pub description: String,
    pub tier: RiskTier,
    pub granted: bool,
}

/// Synchronous confirm callback supplied by the UI.
pub type ConfirmFn = Arc<dyn Fn(&PermissionRequest) -> bool + Send + Sync>;

#[derive(Clone, Default)]
pub struct PermissionController {
    confirm: Option<ConfirmFn>,
}

impl PermissionController {
    pub fn new(confirm: Option<ConfirmFn>) -> Self {
        Self { confirm }
    }

    pub fn with_callback<F>(f: F) -> Self
    where
        F: Fn(&PermissionRequest) -> bool + Send + Sync + 'static,
    {
        Self {
            confirm: Some(Arc::new(f)),
        }
    }

    /// A controller with no callback: every request is denied.
    pub fn deny_all() -> Self {
        Self { confirm: None }
    }

    pub fn has_callback(&self) -> bool {
        self.confirm.is_some()
    }

    pub fn request(&self, req: &PermissionRequest) -> PermissionDecision {
        let granted = match &self.confirm {
            Some(confirm) => confirm(req),
            None => {
                debug!(tool = %req.tool, "no confirmation handler configured, denying");
                false
            }
        };
        info!(tool = %req.tool, tier = %req.tier, granted, "permission decision");
        PermissionDecision {
            description: req.description.clone(),
            tier: req.tier,
            granted,
        }
    }
}

impl std::fmt::Debug for PermissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionController")
            .field("has_callback", &self.has_callback())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> PermissionRequest {
        PermissionRequest {
            tool: "file_write".into(),
            description: "file_write(report.md)".into(),
            tier: RiskTier::High,
            warning: None,
        }
    }

    #[test]
    fn test_missing_callback_denies() {
        let decision = PermissionController::deny_all().request(&request());
        assert!(!decision.granted);
        assert_eq!(decision.tier, RiskTier::High);
    }

    #[test]
    fn test_callback_result_is_used() {
        let yes = PermissionController::with_callback(|_| true);
        let no = PermissionController::with_callback(|req| req.tool != "file_write");
        assert!(yes.request(&request()).granted);
        assert!(!no.request(&request()).granted);
    }
}
