//! detonator: Automated Malware Detonation Sandbox
//!
//! Accepts a suspect binary, detonates it inside one or more isolated
//! VirtualBox VMs (each carrying a security product or a behavioral
//! monitor), and returns a merged report of the threat alerts each agent
//! raised and the structured behavioral events the monitor captured.
//!
//! # Key Properties
//!
//! - **Exclusive VM leases**: a fixed pool of sandbox VMs, one pipeline per
//!   VM at a time, FIFO across competing analyses
//! - **Cleanup discipline**: every pipeline exit path returns its VM to a
//!   powered-off, session-unlocked baseline; failures mark the VM
//!   needs-attention instead of poisoning the next run
//! - **Quoting-safe guest commands**: every path reaches the guest shell
//!   through a typed builder with golden-string tests
//! - **Fire-and-forget detonation**: samples that block or loop are killed
//!   by the next snapshot restore, never awaited
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use detonator::config::load_config;
//! use detonator::controller::vboxmanage::VBoxManage;
//! use detonator::orchestrator::Orchestrator;
//! use detonator::store::ResultStore;
//!
//! #[tokio::main]
//! async fn main() -> detonator::Result<()> {
//!     let config = load_config(std::path::Path::new("detonator.yaml"))?;
//!     let controller = Arc::new(VBoxManage::new(config.vbox_manage_path.clone()));
//!     let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.server.port));
//!
//!     let orchestrator = Orchestrator::start(config, controller, ResultStore::new());
//!     detonator::server::serve(addr, orchestrator).await
//! }
//! ```

// Core analysis machinery
pub mod collector;
pub mod controller;
pub mod guest;
pub mod pipeline;
pub mod pool;

// Task lifecycle
pub mod orchestrator;
pub mod store;

// Model and ambient concerns
pub mod config;
pub mod error;
pub mod model;
pub mod server;

// Re-exports for convenience
pub use error::{Error, ErrorKind, Result};

// Prelude for common imports
pub mod prelude {
    pub use crate::config::{AgentKind, Config, VmSpec};
    pub use crate::controller::{VmController, VmStatus};
    pub use crate::error::{Error, ErrorKind, Result};
    pub use crate::model::{Alert, Event, Report, Sample, Task, TaskStatus, VmResult};
    pub use crate::orchestrator::Orchestrator;
    pub use crate::pool::{VmLease, VmPool};
    pub use crate::store::ResultStore;
}
