//! Intra-node GPU peer-to-peer transport.
//!
//! Two ranks on the same host connect through the four-phase protocol:
//! `can_connect`, setup, connect and free. Either the producing GPU writes
//! the consumer's buffer directly, or (copy-engine mode) it writes a staging
//! buffer that the sender-side proxy moves with device copies, batching
//! contiguous slices of all channels into single transfers.

use std::sync::Once;

use env_logger::Env;

pub mod common;
pub mod descriptor;
pub mod mapper;
pub mod negotiator;
pub mod prober;
pub mod proxy;
pub mod runtime;
pub mod shm;
pub mod topo;

pub use common::config::P2pConfig;
pub use common::error::{P2pError, Result};
pub use negotiator::{CommContext, ConnInfo, Connector, RecvResources, SendResources};
pub use prober::P2pTransport;
pub use topo::get_hostname;

static INIT: Once = Once::new();
pub fn initialize_logger() {
    INIT.call_once(|| {
        env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    });
}
