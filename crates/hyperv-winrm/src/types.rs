//! Shared types for the Hyper-V DVD drive crate.
//!
//! Covers controller addressing, the DVD drive descriptor exchanged with the
//! remote host, local validation of desired drive lists, and executor
//! configuration.

use crate::error::{HyperVError, HyperVResult};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Name Hyper-V gives the implicit default resource pool.
pub const DEFAULT_POOL_NAME: &str = "Primordial";

/// Highest controller number Hyper-V exposes (SCSI controllers 0..=3).
pub const MAX_CONTROLLER_NUMBER: u32 = 3;

/// Highest location on a single controller (SCSI locations 0..=63).
pub const MAX_CONTROLLER_LOCATION: u32 = 63;

/// Whether a pool name denotes the host's default pool.
pub fn is_default_pool(name: Option<&str>) -> bool {
    match name {
        None => true,
        Some(n) => {
            let n = n.trim();
            n.is_empty() || n.eq_ignore_ascii_case(DEFAULT_POOL_NAME)
        }
    }
}

// ─── Controller Address ──────────────────────────────────────────────

/// Where a drive is attached right now. Not a stable identity: an update
/// can move a drive to another address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ControllerAddress {
    pub controller_number: u32,
    pub controller_location: u32,
}

impl ControllerAddress {
    pub fn new(controller_number: u32, controller_location: u32) -> Self {
        Self {
            controller_number,
            controller_location,
        }
    }
}

impl fmt::Display for ControllerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.controller_number, self.controller_location)
    }
}

// ─── DVD Drive ───────────────────────────────────────────────────────

/// A DVD drive slot on a VM, as listed by the host or as desired by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DvdDrive {
    pub controller_number: u32,
    pub controller_location: u32,
    /// ISO image mounted in the drive. `None` is an empty drive.
    #[serde(default, deserialize_with = "de_path")]
    pub path: Option<String>,
    /// Resource pool the drive belongs to. `None` is the default pool.
    #[serde(default, deserialize_with = "de_pool")]
    pub resource_pool_name: Option<String>,
}

fn de_path<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    let v: Option<String> = Option::deserialize(d)?;
    Ok(v.filter(|s| !s.trim().is_empty()))
}

fn de_pool<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    let v: Option<String> = Option::deserialize(d)?;
    Ok(v.filter(|s| !is_default_pool(Some(s.as_str()))))
}

impl DvdDrive {
    /// An empty drive in the default pool.
    pub fn new(controller_number: u32, controller_location: u32) -> Self {
        Self {
            controller_number,
            controller_location,
            path: None,
            resource_pool_name: None,
        }
    }

    /// Mount `path`; a blank path leaves the drive empty.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into()).filter(|p| !p.trim().is_empty());
        self
    }

    /// Join `pool`; a blank name keeps the default pool.
    pub fn with_resource_pool(mut self, pool: impl Into<String>) -> Self {
        self.resource_pool_name = Some(pool.into()).filter(|p| !p.trim().is_empty());
        self
    }

    pub fn address(&self) -> ControllerAddress {
        ControllerAddress::new(self.controller_number, self.controller_location)
    }

    /// The mounted image, or `None` for an empty drive.
    pub fn media_path(&self) -> Option<&str> {
        self.path.as_deref().filter(|p| !p.trim().is_empty())
    }

    /// Whether no media is mounted.
    pub fn is_empty(&self) -> bool {
        self.media_path().is_none()
    }

    /// The named pool, or `None` when the drive is in the default pool.
    pub fn resource_pool(&self) -> Option<&str> {
        let pool = self.resource_pool_name.as_deref();
        if is_default_pool(pool) {
            None
        } else {
            pool
        }
    }

    /// Check the descriptor before it is sent anywhere.
    pub fn validate(&self) -> HyperVResult<()> {
        if self.controller_number > MAX_CONTROLLER_NUMBER {
            return Err(HyperVError::invalid(format!(
                "controller number {} out of range (0..={})",
                self.controller_number, MAX_CONTROLLER_NUMBER
            )));
        }
        if self.controller_location > MAX_CONTROLLER_LOCATION {
            return Err(HyperVError::invalid(format!(
                "controller location {} out of range (0..={})",
                self.controller_location, MAX_CONTROLLER_LOCATION
            )));
        }
        Ok(())
    }
}

/// Validate a desired drive list: every entry individually, and no two
/// entries on the same address.
pub fn validate_desired(drives: &[DvdDrive]) -> HyperVResult<()> {
    let mut seen = HashSet::with_capacity(drives.len());
    for (i, drive) in drives.iter().enumerate() {
        drive
            .validate()
            .map_err(|e| HyperVError::invalid(format!("dvd_drives[{}]: {}", i, e.message)))?;
        if !seen.insert(drive.address()) {
            return Err(HyperVError::invalid(format!(
                "dvd_drives[{}]: controller address {} is used more than once",
                i,
                drive.address()
            )));
        }
    }
    Ok(())
}

// ─── Configuration ───────────────────────────────────────────────────

/// Executor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HyperVConfig {
    /// PowerShell executable path.
    #[serde(default = "default_pwsh_path")]
    pub powershell_path: String,
    /// Per-command timeout in seconds, applied as given. A call context
    /// deadline can shorten it.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    /// Target hostname (empty = localhost).
    #[serde(default)]
    pub target_host: String,
    /// Credential for remote management.
    #[serde(default)]
    pub credential: Option<HyperVCredential>,
    /// Check for the Hyper-V module when the client is built.
    #[serde(default)]
    pub verify_module: bool,
}

/// Credential for remote Hyper-V host management.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HyperVCredential {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub domain: Option<String>,
}

impl fmt::Debug for HyperVCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HyperVCredential")
            .field("username", &self.username)
            .field("password", &"***")
            .field("domain", &self.domain)
            .finish()
    }
}

fn default_pwsh_path() -> String {
    "powershell.exe".to_string()
}
fn default_timeout() -> u64 {
    60
}

impl Default for HyperVConfig {
    fn default() -> Self {
        Self {
            powershell_path: default_pwsh_path(),
            timeout_seconds: default_timeout(),
            target_host: String::new(),
            credential: None,
            verify_module: false,
        }
    }
}

impl HyperVConfig {
    /// Load a config from its JSON form; missing fields take their defaults.
    pub fn from_json(json: &str) -> HyperVResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| HyperVError::invalid(format!("Invalid Hyper-V config: {}", e)))
    }

    pub fn is_remote(&self) -> bool {
        !self.target_host.trim().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_listing_normalises_blank_and_default_pool() {
        let json = r#"[
            {"ControllerNumber":0,"ControllerLocation":1,"Path":"","ResourcePoolName":"Primordial"},
            {"ControllerNumber":1,"ControllerLocation":0,"Path":"C:\\iso\\a.iso","ResourcePoolName":"Gold"},
            {"ControllerNumber":1,"ControllerLocation":1,"Path":null,"ResourcePoolName":null}
        ]"#;
        let drives: Vec<DvdDrive> = serde_json::from_str(json).unwrap();
        assert_eq!(drives[0], DvdDrive::new(0, 1));
        assert_eq!(drives[1].path.as_deref(), Some("C:\\iso\\a.iso"));
        assert_eq!(drives[1].resource_pool(), Some("Gold"));
        assert!(drives[2].is_empty());
        assert_eq!(drives[2].resource_pool(), None);
    }

    #[test]
    fn decode_tolerates_missing_optional_fields() {
        let d: DvdDrive =
            serde_json::from_str(r#"{"ControllerNumber":0,"ControllerLocation":0}"#).unwrap();
        assert_eq!(d, DvdDrive::new(0, 0));
    }

    #[test]
    fn resource_pool_treats_primordial_as_default() {
        let d = DvdDrive::new(0, 0).with_resource_pool("primordial");
        assert_eq!(d.resource_pool(), None);
        let d = DvdDrive::new(0, 0).with_resource_pool("Gold");
        assert_eq!(d.resource_pool(), Some("Gold"));
    }

    #[test]
    fn validate_rejects_out_of_range_address() {
        assert!(DvdDrive::new(4, 0).validate().is_err());
        assert!(DvdDrive::new(0, 64).validate().is_err());
        assert!(DvdDrive::new(3, 63).validate().is_ok());
    }

    #[test]
    fn blank_strings_mean_empty_drive_and_default_pool() {
        let d = DvdDrive::new(0, 0).with_path("  ").with_resource_pool("");
        assert_eq!(d, DvdDrive::new(0, 0));
        assert!(d.validate().is_ok());

        let hand_built = DvdDrive {
            path: Some(String::new()),
            resource_pool_name: Some(" ".into()),
            ..DvdDrive::new(1, 0)
        };
        assert!(hand_built.validate().is_ok());
        assert!(hand_built.is_empty());
        assert_eq!(hand_built.media_path(), None);
        assert_eq!(hand_built.resource_pool(), None);
    }

    #[test]
    fn validate_desired_rejects_duplicate_addresses() {
        let drives = vec![
            DvdDrive::new(0, 0).with_path("a.iso"),
            DvdDrive::new(0, 1),
            DvdDrive::new(0, 0).with_path("b.iso"),
        ];
        let err = validate_desired(&drives).unwrap_err();
        assert!(err.message.contains("dvd_drives[2]"));
        assert!(err.message.contains("0:0"));
    }

    #[test]
    fn validate_desired_accepts_empty_list() {
        assert!(validate_desired(&[]).is_ok());
    }

    #[test]
    fn config_defaults_fill_missing_fields() {
        let cfg = HyperVConfig::from_json(r#"{"targetHost":"hv01"}"#).unwrap();
        assert_eq!(cfg.powershell_path, "powershell.exe");
        assert_eq!(cfg.timeout_seconds, 60);
        assert!(cfg.is_remote());
        assert!(cfg.credential.is_none());
        assert!(!cfg.verify_module);
    }

    #[test]
    fn config_rejects_malformed_json() {
        let err = HyperVConfig::from_json("{not json").unwrap_err();
        assert_eq!(err.kind, crate::error::HyperVErrorKind::InvalidArgument);
    }

    #[test]
    fn credential_debug_hides_password() {
        let c = HyperVCredential {
            username: "admin".into(),
            password: "hunter2".into(),
            domain: Some("CORP".into()),
        };
        let s = format!("{:?}", c);
        assert!(!s.contains("hunter2"));
        assert!(s.contains("admin"));
    }
}
