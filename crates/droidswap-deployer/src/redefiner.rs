//! Debugger-side class redefinition
//!
//! When a debugger is attached to an app process, class changes for that
//! process go through the debugger instead of the installer. Each attached
//! debugger provides one [`Redefiner`] for the process it controls.

/// Classes to redefine in one process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedefineRequest {
    pub package: String,
    /// Descriptors of changed classes, e.g. `Lcom/example/Foo;`
    pub classes: Vec<String>,
    /// Device paths of the staged APKs holding the new definitions
    pub staged_apks: Vec<String>,
}

/// Redefines classes in one debugged process
#[cfg_attr(test, mockall::automock)]
pub trait Redefiner: Send + Sync {
    /// Process this redefiner is attached to
    fn pid(&self) -> u32;

    /// Apply the redefinition; the error is a human-readable reason
    fn redefine(&self, request: &RedefineRequest) -> Result<(), String>;
}
