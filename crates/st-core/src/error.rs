//! Error taxonomy surfaced through the command processor.

use thiserror::Error;

/// Failure modes a command may hit between arrival and reply. The display
/// text is user-visible: transports write it into the combined output, so the
/// wording is part of the wire contract.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("Empty command")]
    EmptyCommand,

    #[error("Failed to match PIN/shortcut")]
    PinMismatch,

    /// Reminds the user of the proper syntax to invoke PLT magic.
    #[error(".plt P L T command")]
    BadPlt,

    #[error("PLT is not available because LintText is not used")]
    LintTextMissing,

    #[error("bad prefix or feature is not configured")]
    BadPrefix,

    #[error("emergency lock down is in effect")]
    EmergencyLockDown,

    /// Opaque wrapper around a feature's own failure.
    #[error("{0}")]
    Feature(String),
}
