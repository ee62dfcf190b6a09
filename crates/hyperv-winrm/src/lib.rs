//! # Hyper-V DVD drives over remote PowerShell
//!
//! Adapter layer that turns a declarative list of a VM's DVD drives into the
//! Hyper-V cmdlet calls that make the host match it. Provides:
//!
//! - **Drive operations** – add, list, look up, retarget (address / media /
//!   resource pool) and remove DVD drives
//! - **Reconciliation** – positional diff of observed vs. desired drives,
//!   applied strictly in order (shrink, update, grow)
//! - **Execution** – structured PowerShell commands run locally or against a
//!   remote host via `Invoke-Command`, with deadlines and cancellation
//! - **Simulation** – an in-memory host implementing the same executor seam

pub mod types;
pub mod error;
pub mod command;
pub mod executor;
pub mod powershell;
pub mod dvd_drive;
pub mod reconcile;
pub mod simulated;
pub mod service;

pub use error::{HyperVError, HyperVErrorKind, HyperVResult};
pub use executor::{CallContext, RemoteExecutor};
pub use service::HyperVClient;
pub use types::{ControllerAddress, DvdDrive, HyperVConfig, HyperVCredential};
