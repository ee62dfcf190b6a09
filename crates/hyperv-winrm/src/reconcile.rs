//! Positional reconciliation of a VM's DVD drives.
//!
//! The host exposes no stable drive id, so the observed and desired lists
//! are matched by index: drive `i` on the host is retargeted to become
//! desired drive `i`. Surplus observed drives are removed first (highest
//! index first), then the overlap is updated, then the missing tail is
//! created. Operations run one at a time; the first failure stops the run
//! and leaves whatever was already applied. Running again against the fresh
//! host state continues the convergence.
//!
//! Overlapping positions are always updated, even when the drive already
//! matches. Callers that count remote calls rely on that.

use crate::dvd_drive::DvdDriveManager;
use crate::error::HyperVResult;
use crate::executor::{CallContext, RemoteExecutor};
use crate::types::{validate_desired, ControllerAddress, DvdDrive};
use log::{debug, info, warn};

/// One step of a reconciliation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DvdDriveOp {
    Delete { address: ControllerAddress },
    Update { from: ControllerAddress, to: DvdDrive },
    Create { drive: DvdDrive },
}

/// Operation counts of a plan, for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanSummary {
    pub deletes: usize,
    pub updates: usize,
    pub creates: usize,
}

impl PlanSummary {
    pub fn of(ops: &[DvdDriveOp]) -> Self {
        ops.iter().fold(Self::default(), |mut s, op| {
            match op {
                DvdDriveOp::Delete { .. } => s.deletes += 1,
                DvdDriveOp::Update { .. } => s.updates += 1,
                DvdDriveOp::Create { .. } => s.creates += 1,
            }
            s
        })
    }
}

/// Computes and applies DVD drive plans.
pub struct DvdDriveReconciler;

impl DvdDriveReconciler {
    /// The positional diff from `current` to `desired`.
    pub fn plan(current: &[DvdDrive], desired: &[DvdDrive]) -> Vec<DvdDriveOp> {
        let overlap = current.len().min(desired.len());
        let mut ops = Vec::with_capacity(current.len().max(desired.len()));

        ops.extend(
            current[overlap..]
                .iter()
                .rev()
                .map(|d| DvdDriveOp::Delete { address: d.address() }),
        );
        ops.extend(
            current
                .iter()
                .zip(desired)
                .map(|(c, d)| DvdDriveOp::Update {
                    from: c.address(),
                    to: d.clone(),
                }),
        );
        ops.extend(
            desired[overlap..]
                .iter()
                .map(|d| DvdDriveOp::Create { drive: d.clone() }),
        );
        ops
    }

    /// Apply `ops` in order, stopping at the first error.
    pub async fn apply(
        exec: &dyn RemoteExecutor,
        ctx: &CallContext,
        vm_name: &str,
        ops: &[DvdDriveOp],
    ) -> HyperVResult<()> {
        for (step, op) in ops.iter().enumerate() {
            debug!("VM '{}' step {}/{}: {:?}", vm_name, step + 1, ops.len(), op);
            let res = match op {
                DvdDriveOp::Delete { address } => {
                    DvdDriveManager::delete_dvd_drive(exec, ctx, vm_name, *address).await
                }
                DvdDriveOp::Update { from, to } => {
                    DvdDriveManager::update_dvd_drive(exec, ctx, vm_name, *from, to).await
                }
                DvdDriveOp::Create { drive } => {
                    DvdDriveManager::create_dvd_drive(exec, ctx, vm_name, drive).await
                }
            };
            if let Err(e) = res {
                warn!(
                    "DVD drive reconciliation of VM '{}' stopped at step {}/{}: {}",
                    vm_name,
                    step + 1,
                    ops.len(),
                    e
                );
                return Err(e);
            }
        }
        Ok(())
    }

    /// Bring the VM's DVD drives in line with `desired`.
    pub async fn create_or_update(
        exec: &dyn RemoteExecutor,
        ctx: &CallContext,
        vm_name: &str,
        desired: &[DvdDrive],
    ) -> HyperVResult<()> {
        validate_desired(desired)?;

        let current = DvdDriveManager::get_dvd_drives(exec, ctx, vm_name).await?;
        let ops = Self::plan(&current, desired);
        let summary = PlanSummary::of(&ops);
        info!(
            "Reconciling DVD drives of VM '{}': {} current, {} desired ({} delete, {} update, {} create)",
            vm_name,
            current.len(),
            desired.len(),
            summary.deletes,
            summary.updates,
            summary.creates
        );

        Self::apply(exec, ctx, vm_name, &ops).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive(n: u32, l: u32, path: &str) -> DvdDrive {
        DvdDrive::new(n, l).with_path(path)
    }

    fn addr(n: u32, l: u32) -> ControllerAddress {
        ControllerAddress::new(n, l)
    }

    #[test]
    fn plan_shrinks_from_the_top_then_updates() {
        let current = vec![drive(0, 0, "a"), drive(0, 1, "b"), drive(1, 0, "c")];
        let desired = vec![drive(0, 0, "z")];
        let ops = DvdDriveReconciler::plan(&current, &desired);
        assert_eq!(
            ops,
            vec![
                DvdDriveOp::Delete { address: addr(1, 0) },
                DvdDriveOp::Delete { address: addr(0, 1) },
                DvdDriveOp::Update {
                    from: addr(0, 0),
                    to: drive(0, 0, "z")
                },
            ]
        );
    }

    #[test]
    fn plan_updates_then_grows() {
        let current = vec![drive(0, 0, "a")];
        let desired = vec![drive(0, 1, "x"), drive(1, 0, "y"), drive(1, 1, "w")];
        let ops = DvdDriveReconciler::plan(&current, &desired);
        assert_eq!(
            ops,
            vec![
                DvdDriveOp::Update {
                    from: addr(0, 0),
                    to: drive(0, 1, "x")
                },
                DvdDriveOp::Create { drive: drive(1, 0, "y") },
                DvdDriveOp::Create { drive: drive(1, 1, "w") },
            ]
        );
    }

    #[test]
    fn plan_updates_identical_drives_too() {
        let same = vec![drive(0, 0, "a"), drive(0, 1, "b")];
        let ops = DvdDriveReconciler::plan(&same, &same);
        assert_eq!(
            PlanSummary::of(&ops),
            PlanSummary {
                deletes: 0,
                updates: 2,
                creates: 0
            }
        );
    }

    #[test]
    fn plan_to_empty_deletes_everything_descending() {
        let current = vec![drive(0, 0, "a"), drive(0, 1, "b")];
        let ops = DvdDriveReconciler::plan(&current, &[]);
        assert_eq!(
            ops,
            vec![
                DvdDriveOp::Delete { address: addr(0, 1) },
                DvdDriveOp::Delete { address: addr(0, 0) },
            ]
        );
    }

    #[test]
    fn plan_from_empty_creates_in_order() {
        let desired = vec![drive(0, 0, "a"), drive(0, 1, "b")];
        let ops = DvdDriveReconciler::plan(&[], &desired);
        assert_eq!(
            ops,
            vec![
                DvdDriveOp::Create { drive: drive(0, 0, "a") },
                DvdDriveOp::Create { drive: drive(0, 1, "b") },
            ]
        );
    }

    #[test]
    fn plan_of_two_empty_lists_is_empty() {
        assert!(DvdDriveReconciler::plan(&[], &[]).is_empty());
    }
}
