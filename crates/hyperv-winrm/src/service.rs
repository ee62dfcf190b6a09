//! Client facade for the Hyper-V DVD drive crate.
//!
//! Owns the executor and delegates to [`DvdDriveManager`] and
//! [`DvdDriveReconciler`]. Reconciliation runs for the same VM are
//! serialised through a per-VM lock; runs for different VMs proceed
//! independently.

use crate::error::{HyperVError, HyperVResult};
use crate::dvd_drive::DvdDriveManager;
use crate::executor::{CallContext, RemoteExecutor};
use crate::powershell::{check_module_command, module_present, PsExecutor};
use crate::reconcile::DvdDriveReconciler;
use crate::types::*;
use log::info;

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Hyper-V DVD drive client.
pub struct HyperVClient {
    exec: Arc<dyn RemoteExecutor>,
    config: HyperVConfig,
    vm_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl HyperVClient {
    /// Create a client that runs PowerShell as configured.
    pub fn new(config: HyperVConfig) -> Self {
        let exec: Arc<dyn RemoteExecutor> = Arc::new(PsExecutor::new(&config));
        Self::with_executor(exec, config)
    }

    /// Create a client and, if `verify_module` is set, make sure the
    /// Hyper-V module answers.
    pub async fn connect(config: HyperVConfig, ctx: &CallContext) -> HyperVResult<Self> {
        let client = Self::new(config);
        if client.config.verify_module {
            client.ensure_module(ctx).await?;
        }
        Ok(client)
    }

    /// Create a client over any executor.
    pub fn with_executor(exec: Arc<dyn RemoteExecutor>, config: HyperVConfig) -> Self {
        Self {
            exec,
            config,
            vm_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Get the current config.
    pub fn config(&self) -> &HyperVConfig {
        &self.config
    }

    pub fn executor(&self) -> &dyn RemoteExecutor {
        self.exec.as_ref()
    }

    /// Check whether the Hyper-V module is available.
    pub async fn check_module(&self, ctx: &CallContext) -> HyperVResult<bool> {
        let output = self.exec.run_with_result(ctx, &check_module_command()).await?;
        Ok(module_present(&output.stdout))
    }

    pub async fn ensure_module(&self, ctx: &CallContext) -> HyperVResult<()> {
        if !self.check_module(ctx).await? {
            return Err(HyperVError::module_not_available());
        }
        Ok(())
    }

    async fn vm_lock(&self, vm_name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.vm_locks.lock().await;
        locks
            .entry(vm_name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Forget the lock for `vm_name` once no other run holds or awaits it.
    async fn release_vm_lock(&self, vm_name: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.vm_locks.lock().await;
        // One reference lives in the map, one is ours.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(vm_name);
        }
    }

    #[cfg(test)]
    async fn tracked_vms(&self) -> usize {
        self.vm_locks.lock().await.len()
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    //  DVD Drives
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub async fn create_dvd_drive(
        &self,
        ctx: &CallContext,
        vm_name: &str,
        drive: &DvdDrive,
    ) -> HyperVResult<()> {
        DvdDriveManager::create_dvd_drive(self.executor(), ctx, vm_name, drive).await
    }

    pub async fn get_dvd_drives(
        &self,
        ctx: &CallContext,
        vm_name: &str,
    ) -> HyperVResult<Vec<DvdDrive>> {
        DvdDriveManager::get_dvd_drives(self.executor(), ctx, vm_name).await
    }

    pub async fn get_dvd_drive(
        &self,
        ctx: &CallContext,
        vm_name: &str,
        address: ControllerAddress,
    ) -> HyperVResult<Option<DvdDrive>> {
        DvdDriveManager::get_dvd_drive(self.executor(), ctx, vm_name, address).await
    }

    pub async fn update_dvd_drive(
        &self,
        ctx: &CallContext,
        vm_name: &str,
        from: ControllerAddress,
        to: &DvdDrive,
    ) -> HyperVResult<()> {
        DvdDriveManager::update_dvd_drive(self.executor(), ctx, vm_name, from, to).await
    }

    pub async fn delete_dvd_drive(
        &self,
        ctx: &CallContext,
        vm_name: &str,
        address: ControllerAddress,
    ) -> HyperVResult<()> {
        DvdDriveManager::delete_dvd_drive(self.executor(), ctx, vm_name, address).await
    }

    /// Reconcile the VM's DVD drives against `desired`.
    pub async fn create_or_update_dvd_drives(
        &self,
        ctx: &CallContext,
        vm_name: &str,
        desired: &[DvdDrive],
    ) -> HyperVResult<()> {
        let lock = self.vm_lock(vm_name).await;
        let result = async {
            let _guard = ctx
                .run("acquire VM lock", async { Ok(lock.lock().await) })
                .await?;
            info!("Applying {} DVD drive(s) to VM '{}'", desired.len(), vm_name);
            DvdDriveReconciler::create_or_update(self.executor(), ctx, vm_name, desired).await
        }
        .await;
        self.release_vm_lock(vm_name, lock).await;
        result
    }
}
