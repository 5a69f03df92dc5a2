use std::collections::hash_map::DefaultHasher;
use std::ffi::CString;
use std::hash::{Hash, Hasher};

use crate::common::error::Result;

/// Identity of one rank as exchanged at communicator init.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PeerInfo {
    pub rank: i32,
    pub host_hash: u64,
    /// Device id of the shared-memory mount; differs across isolated containers.
    pub shm_dev: u64,
    pub pid_hash: u64,
    pub bus_id: i64,
    pub cuda_dev: i32,
}

impl PeerInfo {
    /// Describe the calling process driving `cuda_dev`.
    pub fn local(rank: i32, cuda_dev: i32, bus_id: i64) -> PeerInfo {
        let host = get_hostname();
        let host_hash = hash_of(&host);
        let pid_hash = hash_of(&(host.as_str(), std::process::id()));
        PeerInfo {
            rank,
            host_hash,
            shm_dev: shm_dev_id(),
            pid_hash,
            bus_id,
            cuda_dev,
        }
    }
}

fn hash_of<T: Hash>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

fn shm_dev_id() -> u64 {
    let path = match CString::new("/dev/shm") {
        Ok(p) => p,
        Err(_) => return 0,
    };
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::stat(path.as_ptr(), &mut st) } != 0 {
        return 0;
    }
    st.st_dev as u64
}

pub fn get_hostname() -> String {
    match hostname::get() {
        Ok(h) => h.to_string_lossy().into_owned(),
        Err(_) => String::from("unknown"),
    }
}

/// Topology graph a connection belongs to (ring, tree, collnet, ...).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TopoGraph {
    pub id: i32,
}

/// Result of a P2P path query between two GPUs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct P2pPath {
    pub can_connect: bool,
    /// Topology prefers the receiver reading from the sender's buffer.
    pub read: bool,
    /// Third GPU that must relay traffic.
    pub intermediate_rank: Option<i32>,
}

pub trait Topology: Send + Sync {
    fn check_p2p(&self, bus_id1: i64, bus_id2: i64) -> Result<P2pPath>;
}

/// Every pair of GPUs on the host sees the same path.
#[derive(Clone, Copy, Debug, Default)]
pub struct FixedTopology {
    pub path: P2pPath,
}

impl FixedTopology {
    pub fn connected() -> FixedTopology {
        FixedTopology {
            path: P2pPath {
                can_connect: true,
                read: false,
                intermediate_rank: None,
            },
        }
    }
}

impl Topology for FixedTopology {
    fn check_p2p(&self, _bus_id1: i64, _bus_id2: i64) -> Result<P2pPath> {
        Ok(self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_peers_share_host_and_process() {
        let a = PeerInfo::local(0, 0, 0x1000);
        let b = PeerInfo::local(1, 1, 0x2000);
        assert_eq!(a.host_hash, b.host_hash);
        assert_eq!(a.shm_dev, b.shm_dev);
        assert_eq!(a.pid_hash, b.pid_hash);
        assert_ne!(a.bus_id, b.bus_id);
    }
}
