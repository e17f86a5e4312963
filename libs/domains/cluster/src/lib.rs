//! Master-side cluster manager runtime.
//!
//! Accepts inbound worker sockets, validates the handshake, wires workers
//! into the distributed-compute runtime and tracks a reference count per
//! scale set so the last departing worker tears the whole group down.

pub mod error;
pub mod manager;
pub mod worker;

pub use error::{ManagerError, ManagerResult};
pub use manager::{ClusterManager, ManagerOptions, WorkerRuntime};
pub use worker::{WorkerConfig, WorkerHello, WorkerUserData, HDR_COOKIE_LEN};
