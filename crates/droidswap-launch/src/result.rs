//! Outcome of one launch task

use serde::Serialize;

use droidswap_core::{Error, LaunchTaskDetail, ResolutionAction};

/// Error id of a task stopped by cancellation
pub const CANCELLED_ERROR_ID: &str = "CANCELLED";

/// What a task reports back to the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LaunchResult {
    pub success: bool,
    /// Short text for the error notification
    pub error: String,
    pub error_id: String,
    /// Full error text for the run console
    pub console_error: String,
    /// Recovery offered as a hyperlink
    pub resolution: ResolutionAction,
    /// Apply `resolution` without asking (fallback mode)
    pub auto_resolve: bool,
    pub details: Vec<LaunchTaskDetail>,
}

impl LaunchResult {
    pub fn success(details: Vec<LaunchTaskDetail>) -> Self {
        Self {
            success: true,
            error: String::new(),
            error_id: String::new(),
            console_error: String::new(),
            resolution: ResolutionAction::None,
            auto_resolve: false,
            details,
        }
    }

    pub fn failure(
        error_id: impl Into<String>,
        error: impl Into<String>,
        console_error: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            error: error.into(),
            error_id: error_id.into(),
            console_error: console_error.into(),
            ..Self::success(Vec::new())
        }
    }

    pub fn cancelled(title: &str) -> Self {
        let message = format!("{}.", Error::cancelled(title));
        Self::failure(CANCELLED_ERROR_ID, message.clone(), message)
    }

    pub fn with_resolution(mut self, resolution: ResolutionAction, auto_resolve: bool) -> Self {
        self.resolution = resolution;
        self.auto_resolve = auto_resolve && resolution != ResolutionAction::None;
        self
    }

    pub fn with_details(mut self, details: Vec<LaunchTaskDetail>) -> Self {
        self.details = details;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        !self.success && self.error_id == CANCELLED_ERROR_ID
    }

    /// Hyperlink labels joined for display, e.g. `Apply Changes | Rerun`
    pub fn hyperlink_text(&self) -> Option<String> {
        let options = self.resolution.options();
        (!options.is_empty()).then(|| options.join(" | "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_resolve_needs_a_resolution() {
        let result = LaunchResult::failure("X", "x", "x").with_resolution(ResolutionAction::None, true);
        assert!(!result.auto_resolve);

        let result =
            LaunchResult::failure("X", "x", "x").with_resolution(ResolutionAction::Retry, true);
        assert!(result.auto_resolve);
    }

    #[test]
    fn test_hyperlink_text() {
        let result = LaunchResult::failure("X", "x", "x")
            .with_resolution(ResolutionAction::ApplyChanges, false);
        assert_eq!(result.hyperlink_text().as_deref(), Some("Apply Changes | Rerun"));
        assert!(LaunchResult::success(Vec::new()).hyperlink_text().is_none());
    }

    #[test]
    fn test_cancelled() {
        let result = LaunchResult::cancelled("Install");
        assert!(result.is_cancelled());
        assert_eq!(result.error, "Install was cancelled.");
    }
}
