//! In-memory Hyper-V host for tests and dry runs.
//!
//! [`SimulatedHost`] answers the DVD drive commands against per-VM drive
//! lists, records every command it receives, and can be told to fail a
//! given call so partial-failure paths can be exercised.

use crate::command::PsCommand;
use crate::dvd_drive::names;
use crate::error::{HyperVError, HyperVResult};
use crate::executor::{CallContext, RemoteExecutor};
use crate::powershell::{
    classify_failure, PsOutput, CHECK_MODULE, NOT_FOUND_MARKER, POLICY_MARKER,
};
use crate::types::{ControllerAddress, DvdDrive, DEFAULT_POOL_NAME};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Mutex;

/// A command as the host received it.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub name: &'static str,
    pub parameters: Map<String, Value>,
}

impl RecordedCall {
    pub fn get_u32(&self, key: &str) -> Option<u32> {
        self.parameters
            .get(key)
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
    }

    /// `(ControllerNumber, ControllerLocation)` of the call, if present.
    pub fn address(&self) -> Option<ControllerAddress> {
        Some(ControllerAddress::new(
            self.get_u32("ControllerNumber")?,
            self.get_u32("ControllerLocation")?,
        ))
    }
}

struct Failure {
    name: &'static str,
    nth: usize,
    error: HyperVError,
}

#[derive(Default)]
struct HostState {
    vms: HashMap<String, Vec<DvdDrive>>,
    calls: Vec<RecordedCall>,
    failures: Vec<Failure>,
    module_available: bool,
    yielding: bool,
}

/// In-memory stand-in for a Hyper-V host.
pub struct SimulatedHost {
    state: Mutex<HostState>,
}

impl Default for SimulatedHost {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedHost {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HostState {
                module_available: true,
                ..HostState::default()
            }),
        }
    }

    /// Add a VM with the given drives, listed in this order.
    pub fn with_vm(self, vm_name: &str, drives: Vec<DvdDrive>) -> Self {
        self.lock().vms.insert(vm_name.to_string(), drives);
        self
    }

    /// Pretend the Hyper-V module is not installed.
    pub fn without_module(self) -> Self {
        self.lock().module_available = false;
        self
    }

    /// Yield to the scheduler before every call, so concurrent callers
    /// interleave at each remote round trip the way they would against a
    /// real host.
    pub fn yielding(self) -> Self {
        self.lock().yielding = true;
        self
    }

    /// Fail the `nth` (1-based) call named `name` with `error`, without
    /// applying it.
    pub fn fail_on(&self, name: &'static str, nth: usize, error: HyperVError) {
        self.lock().failures.push(Failure { name, nth, error });
    }

    /// Current drives of `vm_name`, in listing order.
    pub fn drives(&self, vm_name: &str) -> Vec<DvdDrive> {
        self.lock().vms.get(vm_name).cloned().unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    pub fn call_names(&self) -> Vec<&'static str> {
        self.lock().calls.iter().map(|c| c.name).collect()
    }

    /// Calls excluding read-only lookups.
    pub fn mutations(&self) -> Vec<RecordedCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| matches!(c.name, names::ADD | names::SET | names::REMOVE))
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    async fn round_trip(&self, ctx: &CallContext, command: &PsCommand) -> HyperVResult<()> {
        let yielding = self.lock().yielding;
        if yielding {
            tokio::task::yield_now().await;
        }
        ctx.check(command.name())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HostState> {
        // A panic while holding the lock only happens in a failing test.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn dispatch(&self, command: &PsCommand) -> HyperVResult<String> {
        let mut state = self.lock();
        state.calls.push(RecordedCall {
            name: command.name(),
            parameters: command.parameters().clone(),
        });
        let seen = state
            .calls
            .iter()
            .filter(|c| c.name == command.name())
            .count();
        if let Some(i) = state
            .failures
            .iter()
            .position(|f| f.name == command.name() && f.nth == seen)
        {
            return Err(state.failures.remove(i).error);
        }

        let vm_name = command.get_str("VmName").unwrap_or_default().to_string();
        let at = |n: &str, l: &str| -> HyperVResult<ControllerAddress> {
            match (command.get_u32(n), command.get_u32(l)) {
                (Some(n), Some(l)) => Ok(ControllerAddress::new(n, l)),
                _ => Err(HyperVError::ps_error(format!(
                    "Cannot bind parameter '{}': missing controller address",
                    n
                ))),
            }
        };

        match command.name() {
            CHECK_MODULE => Ok(if state.module_available {
                r#"{"Name":"Hyper-V"}"#.to_string()
            } else {
                String::new()
            }),
            names::LIST => {
                let drives = state.vms.get(&vm_name).cloned().unwrap_or_default();
                Ok(listing(&drives))
            }
            names::GET => {
                let address = at("ControllerNumber", "ControllerLocation")?;
                let drives: Vec<DvdDrive> = state
                    .vms
                    .get(&vm_name)
                    .map(|ds| ds.iter().filter(|d| d.address() == address).cloned().collect())
                    .unwrap_or_default();
                Ok(listing(&drives))
            }
            names::ADD => {
                let address = at("ControllerNumber", "ControllerLocation")?;
                let drives = state.vms.get_mut(&vm_name).ok_or_else(|| {
                    HyperVError::ps_error(format!(
                        "Hyper-V was unable to find a virtual machine with name \"{}\".",
                        vm_name
                    ))
                })?;
                if drives.iter().any(|d| d.address() == address) {
                    return Err(HyperVError::ps_error(format!(
                        "Failed to add device 'Virtual CD/DVD Disk': controller location {} is already in use",
                        address
                    )));
                }
                let mut drive =
                    DvdDrive::new(address.controller_number, address.controller_location);
                drive.path = command.get_str("Path").filter(|p| !p.is_empty()).map(String::from);
                drive.resource_pool_name = command.get_str("ResourcePoolName").map(String::from);
                drives.push(drive);
                Ok(String::new())
            }
            names::SET => {
                let from = at("ControllerNumber", "ControllerLocation")?;
                let to = at("ToControllerNumber", "ToControllerLocation")?;
                let not_found = || {
                    classify_failure(format!(
                        "{} VM '{}' has no DVD drive at controller {}",
                        NOT_FOUND_MARKER, vm_name, from
                    ))
                };
                let drives = state.vms.get_mut(&vm_name).ok_or_else(not_found)?;
                let idx = drives
                    .iter()
                    .position(|d| d.address() == from)
                    .ok_or_else(not_found)?;
                let desired_pool = command.get_str("ResourcePoolName").map(String::from);
                if let (Some(pool), None) = (drives[idx].resource_pool(), desired_pool.as_ref()) {
                    return Err(classify_failure(format!(
                        "{} Unable to remove resource pool '{}' from DVD drive {}",
                        POLICY_MARKER, pool, from
                    )));
                }
                if to != from && drives.iter().any(|d| d.address() == to) {
                    return Err(HyperVError::ps_error(format!(
                        "Failed to move device: controller location {} is already in use",
                        to
                    )));
                }
                let drive = &mut drives[idx];
                drive.controller_number = to.controller_number;
                drive.controller_location = to.controller_location;
                drive.path = command.get_str("Path").filter(|p| !p.is_empty()).map(String::from);
                if desired_pool.is_some() {
                    drive.resource_pool_name = desired_pool;
                }
                Ok(String::new())
            }
            names::REMOVE => {
                let address = at("ControllerNumber", "ControllerLocation")?;
                if let Some(drives) = state.vms.get_mut(&vm_name) {
                    drives.retain(|d| d.address() != address);
                }
                Ok(String::new())
            }
            other => Err(HyperVError::ps_error(format!(
                "The term '{}' is not a command the simulated host understands",
                other
            ))),
        }
    }
}

/// Render drives the way the listing script does, default pool included.
fn listing(drives: &[DvdDrive]) -> String {
    if drives.is_empty() {
        return "[]".to_string();
    }
    let items: Vec<Value> = drives
        .iter()
        .map(|d| {
            json!({
                "ControllerNumber": d.controller_number,
                "ControllerLocation": d.controller_location,
                "Path": d.path,
                "ResourcePoolName": d.resource_pool().unwrap_or(DEFAULT_POOL_NAME),
            })
        })
        .collect();
    // ConvertTo-Json unwraps single-element arrays.
    if items.len() == 1 {
        items[0].to_string()
    } else {
        Value::Array(items).to_string()
    }
}

#[async_trait]
impl RemoteExecutor for SimulatedHost {
    async fn run_fire_and_forget(
        &self,
        ctx: &CallContext,
        command: &PsCommand,
    ) -> HyperVResult<()> {
        self.round_trip(ctx, command).await?;
        self.dispatch(command).map(|_| ())
    }

    async fn run_with_result(
        &self,
        ctx: &CallContext,
        command: &PsCommand,
    ) -> HyperVResult<PsOutput> {
        self.round_trip(ctx, command).await?;
        self.dispatch(command).map(PsOutput::ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dvd_drive::{add_command, list_command, remove_command};

    #[tokio::test]
    async fn records_calls_in_order() {
        let host = SimulatedHost::new().with_vm("vm", vec![]);
        let ctx = CallContext::background();
        host.run_fire_and_forget(&ctx, &add_command("vm", &DvdDrive::new(0, 0)))
            .await
            .unwrap();
        host.run_fire_and_forget(&ctx, &remove_command("vm", ControllerAddress::new(0, 0)))
            .await
            .unwrap();
        assert_eq!(host.call_names(), vec![names::ADD, names::REMOVE]);
        assert_eq!(host.calls()[1].address(), Some(ControllerAddress::new(0, 0)));
        assert!(host.drives("vm").is_empty());
    }

    #[tokio::test]
    async fn injected_failure_hits_the_nth_call_only() {
        let host = SimulatedHost::new().with_vm("vm", vec![]);
        let ctx = CallContext::background();
        host.fail_on(names::ADD, 2, HyperVError::ps_error("boom"));
        host.run_fire_and_forget(&ctx, &add_command("vm", &DvdDrive::new(0, 0)))
            .await
            .unwrap();
        let err = host
            .run_fire_and_forget(&ctx, &add_command("vm", &DvdDrive::new(0, 1)))
            .await
            .unwrap_err();
        assert_eq!(err.message, "boom");
        host.run_fire_and_forget(&ctx, &add_command("vm", &DvdDrive::new(0, 1)))
            .await
            .unwrap();
        assert_eq!(host.drives("vm").len(), 2);
    }

    #[tokio::test]
    async fn listing_mimics_single_object_output() {
        let host = SimulatedHost::new().with_vm("vm", vec![DvdDrive::new(0, 0)]);
        let out = host
            .run_with_result(&CallContext::background(), &list_command("vm"))
            .await
            .unwrap();
        assert!(out.stdout.starts_with('{'));
        assert!(out.stdout.contains("Primordial"));
        let drives: Vec<DvdDrive> = out.parse_json_array().unwrap();
        assert_eq!(drives, vec![DvdDrive::new(0, 0)]);
    }
}
