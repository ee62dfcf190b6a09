//! Error types for the Hyper-V DVD drive crate.

use crate::types::ControllerAddress;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Error kinds for Hyper-V operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HyperVErrorKind {
    /// The Hyper-V PowerShell module is not installed or available.
    ModuleNotAvailable,
    /// A PowerShell command failed or reported an error.
    PowerShellError,
    /// The remote output was not the JSON we expected.
    ParseError,
    /// No DVD drive sits at the requested controller address.
    DvdDriveNotFound,
    /// The operation would clear a drive's resource pool.
    PolicyViolation,
    /// A drive descriptor or desired drive list failed validation.
    InvalidArgument,
    /// The call deadline elapsed.
    Timeout,
    /// The caller cancelled the call.
    Cancelled,
    /// Insufficient privileges.
    AccessDenied,
    /// The host is not reachable or the credential is wrong.
    ConnectionError,
}

/// Hyper-V management error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HyperVError {
    pub kind: HyperVErrorKind,
    pub message: String,
    #[serde(default)]
    pub details: Option<String>,
}

impl fmt::Display for HyperVError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.kind, self.message)?;
        if let Some(ref d) = self.details {
            write!(f, " ({})", d)?;
        }
        Ok(())
    }
}

impl std::error::Error for HyperVError {}

impl HyperVError {
    pub fn new(kind: HyperVErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(
        kind: HyperVErrorKind,
        message: impl Into<String>,
        details: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            details: Some(details.into()),
        }
    }

    pub fn module_not_available() -> Self {
        Self::new(
            HyperVErrorKind::ModuleNotAvailable,
            "Hyper-V PowerShell module is not available. Ensure the Hyper-V role is installed.",
        )
    }

    pub fn ps_error(stderr: impl Into<String>) -> Self {
        Self::new(HyperVErrorKind::PowerShellError, stderr)
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(HyperVErrorKind::ParseError, message)
    }

    pub fn access_denied(message: impl Into<String>) -> Self {
        Self::new(HyperVErrorKind::AccessDenied, message)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(HyperVErrorKind::InvalidArgument, message)
    }

    pub fn timeout(op: &str) -> Self {
        Self::new(
            HyperVErrorKind::Timeout,
            format!("Operation '{}' timed out", op),
        )
    }

    pub fn cancelled(op: &str) -> Self {
        Self::new(
            HyperVErrorKind::Cancelled,
            format!("Operation '{}' was cancelled", op),
        )
    }

    pub fn dvd_drive_not_found(vm: &str, address: ControllerAddress) -> Self {
        Self::new(
            HyperVErrorKind::DvdDriveNotFound,
            format!("VM '{}' has no DVD drive at controller {}", vm, address),
        )
    }

    pub fn pool_clear_rejected(vm: &str, address: ControllerAddress, pool: &str) -> Self {
        Self::with_details(
            HyperVErrorKind::PolicyViolation,
            format!(
                "Unable to remove resource pool from DVD drive {} on VM '{}'",
                address, vm
            ),
            format!("current pool '{}'", pool),
        )
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == HyperVErrorKind::DvdDriveNotFound
    }

    pub fn is_policy_violation(&self) -> bool {
        self.kind == HyperVErrorKind::PolicyViolation
    }

    pub fn is_decode(&self) -> bool {
        self.kind == HyperVErrorKind::ParseError
    }
}

/// Convert a `HyperVError` into a plain `String` for callers that report text only.
impl From<HyperVError> for String {
    fn from(e: HyperVError) -> String {
        e.to_string()
    }
}

/// Convenience alias.
pub type HyperVResult<T> = Result<T, HyperVError>;
