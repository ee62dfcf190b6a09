//! Hyper-V VM DVD drive operations: add, list, look up, retarget, remove.
//!
//! Each operation builds a [`PsCommand`], submits it through a
//! [`RemoteExecutor`] and interprets the result. Nothing here retries.

use crate::command::PsCommand;
use crate::error::{HyperVError, HyperVResult};
use crate::executor::{CallContext, RemoteExecutor};
use crate::types::{ControllerAddress, DvdDrive};
use log::{debug, info};

/// Command names, shared with executors that dispatch on them.
pub mod names {
    pub const ADD: &str = "Add-VMDvdDrive";
    pub const LIST: &str = "Get-VMDvdDrives";
    pub const GET: &str = "Get-VMDvdDrive";
    pub const SET: &str = "Set-VMDvdDrive";
    pub const REMOVE: &str = "Remove-VMDvdDrive";
}

const ADD_SCRIPT: &str = r#"Import-Module Hyper-V
$NewVmDvdDriveArgs = @{
    VmName               = $p.VmName
    ControllerNumber     = $p.ControllerNumber
    ControllerLocation   = $p.ControllerLocation
    Path                 = $p.Path
    AllowUnverifiedPaths = $true
}
if (!$NewVmDvdDriveArgs.Path) {
    $NewVmDvdDriveArgs.Path = $null
}
if ($p.ResourcePoolName) {
    $NewVmDvdDriveArgs.ResourcePoolName = $p.ResourcePoolName
}
Add-VMDvdDrive @NewVmDvdDriveArgs"#;

const LIST_SCRIPT: &str = r#"$vmDvdDrivesObject = @(Get-VM -Name ([WildcardPattern]::Escape($p.VmName) + '*') | ?{ $_.Name -eq $p.VmName } | Get-VMDvdDrive | %{ @{
    ControllerNumber   = $_.ControllerNumber;
    ControllerLocation = $_.ControllerLocation;
    Path               = $_.Path;
    ResourcePoolName   = $_.PoolName;
}})
if ($vmDvdDrivesObject) {
    ConvertTo-Json -InputObject $vmDvdDrivesObject
} else {
    "[]"
}"#;

const GET_SCRIPT: &str = r#"$vmDvdDrivesObject = @(Get-VM -Name ([WildcardPattern]::Escape($p.VmName) + '*') | ?{ $_.Name -eq $p.VmName } | Get-VMDvdDrive -ControllerNumber $p.ControllerNumber -ControllerLocation $p.ControllerLocation | %{ @{
    ControllerNumber   = $_.ControllerNumber;
    ControllerLocation = $_.ControllerLocation;
    Path               = $_.Path;
    ResourcePoolName   = $_.PoolName;
}})
if ($vmDvdDrivesObject) {
    ConvertTo-Json -InputObject $vmDvdDrivesObject
} else {
    "[]"
}"#;

// The pool and existence checks repeat on the host in case the drive
// changed between the lookup and this call.
const SET_SCRIPT: &str = r#"Import-Module Hyper-V
$vmDvdDrivesObject = @(Get-VM -Name ([WildcardPattern]::Escape($p.VmName) + '*') | ?{ $_.Name -eq $p.VmName } | Get-VMDvdDrive -ControllerNumber $p.ControllerNumber -ControllerLocation $p.ControllerLocation)
if (!$vmDvdDrivesObject) {
    throw "DvdDriveNotFound: VM '$($p.VmName)' has no DVD drive at controller $($p.ControllerNumber):$($p.ControllerLocation)"
}
$current = $vmDvdDrivesObject[0]

$SetVmDvdDriveArgs = @{}
$SetVmDvdDriveArgs.VmName               = $current.VmName
$SetVmDvdDriveArgs.ControllerNumber     = $current.ControllerNumber
$SetVmDvdDriveArgs.ControllerLocation   = $current.ControllerLocation
$SetVmDvdDriveArgs.ToControllerNumber   = $p.ToControllerNumber
$SetVmDvdDriveArgs.ToControllerLocation = $p.ToControllerLocation

$currentPool = $current.PoolName
if (!$currentPool -or $currentPool -eq 'Primordial') { $currentPool = $null }
$desiredPool = $p.ResourcePoolName
if (!$desiredPool) { $desiredPool = $null }
if ($currentPool -ne $desiredPool) {
    if ($desiredPool) {
        $SetVmDvdDriveArgs.ResourcePoolName = $desiredPool
    } else {
        throw "PolicyViolation: Unable to remove resource pool '$currentPool' from DVD drive $($p.ControllerNumber):$($p.ControllerLocation) on VM '$($p.VmName)'"
    }
}
$SetVmDvdDriveArgs.Path                 = $p.Path
$SetVmDvdDriveArgs.AllowUnverifiedPaths = $true
if (!$SetVmDvdDriveArgs.Path) {
    $SetVmDvdDriveArgs.Path = $null
}

Set-VMDvdDrive @SetVmDvdDriveArgs"#;

const REMOVE_SCRIPT: &str = r#"@(Get-VM -Name ([WildcardPattern]::Escape($p.VmName) + '*') | ?{ $_.Name -eq $p.VmName } | Get-VMDvdDrive -ControllerNumber $p.ControllerNumber -ControllerLocation $p.ControllerLocation) | Remove-VMDvdDrive"#;

fn require_vm_name(vm_name: &str) -> HyperVResult<()> {
    if vm_name.trim().is_empty() {
        return Err(HyperVError::invalid("VM name must not be empty"));
    }
    Ok(())
}

/// Command that attaches `drive` to `vm_name`.
pub fn add_command(vm_name: &str, drive: &DvdDrive) -> PsCommand {
    PsCommand::new(names::ADD, ADD_SCRIPT)
        .arg("VmName", vm_name)
        .arg("ControllerNumber", drive.controller_number)
        .arg("ControllerLocation", drive.controller_location)
        .arg("Path", drive.media_path().unwrap_or_default())
        .arg("ResourcePoolName", drive.resource_pool())
}

/// Command that lists every DVD drive on `vm_name`.
pub fn list_command(vm_name: &str) -> PsCommand {
    PsCommand::new(names::LIST, LIST_SCRIPT).arg("VmName", vm_name)
}

/// Command that lists the DVD drive at `address`, if any.
pub fn get_command(vm_name: &str, address: ControllerAddress) -> PsCommand {
    PsCommand::new(names::GET, GET_SCRIPT)
        .arg("VmName", vm_name)
        .arg("ControllerNumber", address.controller_number)
        .arg("ControllerLocation", address.controller_location)
}

/// Command that moves the drive at `from` to `to`'s address and contents.
pub fn set_command(vm_name: &str, from: ControllerAddress, to: &DvdDrive) -> PsCommand {
    PsCommand::new(names::SET, SET_SCRIPT)
        .arg("VmName", vm_name)
        .arg("ControllerNumber", from.controller_number)
        .arg("ControllerLocation", from.controller_location)
        .arg("ToControllerNumber", to.controller_number)
        .arg("ToControllerLocation", to.controller_location)
        .arg("Path", to.media_path())
        .arg("ResourcePoolName", to.resource_pool())
}

/// Command that removes whatever drive sits at `address`.
pub fn remove_command(vm_name: &str, address: ControllerAddress) -> PsCommand {
    PsCommand::new(names::REMOVE, REMOVE_SCRIPT)
        .arg("VmName", vm_name)
        .arg("ControllerNumber", address.controller_number)
        .arg("ControllerLocation", address.controller_location)
}

/// Manager for VM DVD drive operations.
pub struct DvdDriveManager;

impl DvdDriveManager {
    // ── Create ──────────────────────────────────────────────────────

    /// Attach a new DVD drive. The host rejects an occupied or invalid
    /// address; no pre-check happens here.
    pub async fn create_dvd_drive(
        exec: &dyn RemoteExecutor,
        ctx: &CallContext,
        vm_name: &str,
        drive: &DvdDrive,
    ) -> HyperVResult<()> {
        require_vm_name(vm_name)?;
        drive.validate()?;
        info!(
            "Adding DVD drive {} to VM '{}' (path={:?}, pool={:?})",
            drive.address(),
            vm_name,
            drive.media_path(),
            drive.resource_pool()
        );
        exec.run_fire_and_forget(ctx, &add_command(vm_name, drive))
            .await
    }

    // ── Query ───────────────────────────────────────────────────────

    /// List the VM's DVD drives in host order. A VM with none (or no such
    /// VM) yields an empty list.
    pub async fn get_dvd_drives(
        exec: &dyn RemoteExecutor,
        ctx: &CallContext,
        vm_name: &str,
    ) -> HyperVResult<Vec<DvdDrive>> {
        require_vm_name(vm_name)?;
        let output = exec.run_with_result(ctx, &list_command(vm_name)).await?;
        let drives: Vec<DvdDrive> = output.parse_json_array()?;
        debug!("VM '{}' has {} DVD drive(s)", vm_name, drives.len());
        Ok(drives)
    }

    /// Look up the drive currently at `address`.
    pub async fn get_dvd_drive(
        exec: &dyn RemoteExecutor,
        ctx: &CallContext,
        vm_name: &str,
        address: ControllerAddress,
    ) -> HyperVResult<Option<DvdDrive>> {
        require_vm_name(vm_name)?;
        let output = exec
            .run_with_result(ctx, &get_command(vm_name, address))
            .await?;
        let drives: Vec<DvdDrive> = output.parse_json_array()?;
        Ok(drives.into_iter().find(|d| d.address() == address))
    }

    // ── Update ──────────────────────────────────────────────────────

    /// Retarget the drive at `from` so it becomes `to`: new address, new
    /// media, new pool. A drive in a named pool can't be moved back to the
    /// default pool here.
    pub async fn update_dvd_drive(
        exec: &dyn RemoteExecutor,
        ctx: &CallContext,
        vm_name: &str,
        from: ControllerAddress,
        to: &DvdDrive,
    ) -> HyperVResult<()> {
        require_vm_name(vm_name)?;
        to.validate()?;

        let current = Self::get_dvd_drive(exec, ctx, vm_name, from)
            .await?
            .ok_or_else(|| HyperVError::dvd_drive_not_found(vm_name, from))?;

        if let (Some(pool), None) = (current.resource_pool(), to.resource_pool()) {
            return Err(HyperVError::pool_clear_rejected(vm_name, from, pool));
        }

        info!(
            "Updating DVD drive {} -> {} on VM '{}' (path={:?}, pool={:?})",
            from,
            to.address(),
            vm_name,
            to.media_path(),
            to.resource_pool()
        );
        exec.run_fire_and_forget(ctx, &set_command(vm_name, from, to))
            .await
    }

    // ── Delete ──────────────────────────────────────────────────────

    /// Remove the drive at `address`. Nothing there is not an error.
    pub async fn delete_dvd_drive(
        exec: &dyn RemoteExecutor,
        ctx: &CallContext,
        vm_name: &str,
        address: ControllerAddress,
    ) -> HyperVResult<()> {
        require_vm_name(vm_name)?;
        info!("Removing DVD drive {} from VM '{}'", address, vm_name);
        exec.run_fire_and_forget(ctx, &remove_command(vm_name, address))
            .await
    }
}
