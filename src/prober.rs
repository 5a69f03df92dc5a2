use std::sync::{Arc, Mutex, OnceLock};

use crate::common::config::P2pConfig;
use crate::common::error::Result;
use crate::common::layout::CUDA_IPC_MIN;
use crate::runtime::DeviceRuntime;
use crate::topo::{PeerInfo, Topology};

/// First runtime release able to do P2P with devices hidden from this process.
const INVISIBLE_P2P_VERSION: i32 = 10010;

/// Whether the runtime can export a legacy IPC handle, checked once.
///
/// The lock is held across the whole allocate, export and free sequence, so
/// concurrent first callers wait for one check instead of running their own.
#[derive(Debug, Default)]
pub struct LegacyIpcSupport {
    supported: Mutex<Option<bool>>,
}

impl LegacyIpcSupport {
    pub const fn new() -> LegacyIpcSupport {
        LegacyIpcSupport {
            supported: Mutex::new(None),
        }
    }

    /// The process-wide instance every `P2pTransport::new` shares.
    pub fn process() -> Arc<LegacyIpcSupport> {
        static PROCESS: OnceLock<Arc<LegacyIpcSupport>> = OnceLock::new();
        PROCESS.get_or_init(|| Arc::new(LegacyIpcSupport::new())).clone()
    }

    pub fn supported(&self, runtime: &dyn DeviceRuntime) -> Result<bool> {
        let mut cached = self.supported.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(supported) = *cached {
            return Ok(supported);
        }
        let dummy = runtime.alloc_zeroed(CUDA_IPC_MIN)?;
        let supported = match runtime.ipc_get_handle(dummy) {
            Ok(_) => true,
            Err(e) => {
                log::info!("Legacy IPC not supported: {}", e);
                false
            }
        };
        runtime.free(dummy)?;
        *cached = Some(supported);
        Ok(supported)
    }
}

/// The P2P transport as registered with the communicator.
///
/// Tunables are resolved once here and every phase reads them from this
/// value. Legacy IPC support is checked once per process.
pub struct P2pTransport {
    config: P2pConfig,
    legacy_ipc: Arc<LegacyIpcSupport>,
}

impl P2pTransport {
    pub fn new(config: P2pConfig) -> P2pTransport {
        P2pTransport::with_legacy_ipc(config, LegacyIpcSupport::process())
    }

    /// A transport that consults `legacy_ipc` instead of the process-wide check.
    pub fn with_legacy_ipc(config: P2pConfig, legacy_ipc: Arc<LegacyIpcSupport>) -> P2pTransport {
        crate::initialize_logger();
        log::debug!("{} p2p transport: {:?}", crate::get_hostname(), config);
        P2pTransport { config, legacy_ipc }
    }

    pub fn from_env() -> P2pTransport {
        P2pTransport::new(P2pConfig::from_env())
    }

    pub fn config(&self) -> &P2pConfig {
        &self.config
    }

    /// Sends go through the proxy copy engine, so the proxy connect and
    /// progress hooks are live.
    pub fn uses_copy_engine(&self) -> bool {
        self.config.use_memcpy
    }

    /// Whether the two peers can talk over P2P. Negative answers are not errors.
    pub fn can_connect(
        &self,
        runtime: &dyn DeviceRuntime,
        topo: &dyn Topology,
        info1: &PeerInfo,
        info2: &PeerInfo,
    ) -> Result<bool> {
        // Different nodes or isolated containers
        if info1.host_hash != info2.host_hash || info1.shm_dev != info2.shm_dev {
            return Ok(false);
        }

        let path = topo.check_p2p(info1.bus_id, info2.bus_id)?;
        if !path.can_connect {
            return Ok(false);
        }
        if path.intermediate_rank.is_some() {
            // The copy engine cannot relay through a third GPU.
            return Ok(!self.config.use_memcpy);
        }

        let (dev1, dev2) = match (
            bus_id_to_dev(runtime, info1.bus_id)?,
            bus_id_to_dev(runtime, info2.bus_id)?,
        ) {
            (Some(d1), Some(d2)) => (d1, d2),
            _ => return Ok(runtime.version() >= INVISIBLE_P2P_VERSION),
        };

        match runtime.can_access_peer(dev1, dev2) {
            Err(e) => {
                log::info!(
                    "peer query failed between dev {}(={:x}) and dev {}(={:x}): {}",
                    dev1,
                    info1.bus_id,
                    dev2,
                    info2.bus_id,
                    e
                );
                Ok(false)
            }
            Ok(false) => {
                log::info!(
                    "Could not enable P2P between dev {}(={:x}) and dev {}(={:x})",
                    dev1,
                    info1.bus_id,
                    dev2,
                    info2.bus_id
                );
                Ok(false)
            }
            Ok(true) => self.legacy_ipc.supported(runtime),
        }
    }
}

/// Local device index of `bus_id`, if this process can see it.
pub fn bus_id_to_dev(runtime: &dyn DeviceRuntime, bus_id: i64) -> Result<Option<i32>> {
    for dev in 0..runtime.device_count()? {
        if runtime.device_bus_id(dev)? == bus_id {
            return Ok(Some(dev as i32));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::runtime::HostRuntime;
    use crate::topo::{FixedTopology, P2pPath};

    fn peer(rank: i32, bus_id: i64) -> PeerInfo {
        PeerInfo {
            rank,
            host_hash: 11,
            shm_dev: 22,
            pid_hash: 33,
            bus_id,
            cuda_dev: rank,
        }
    }

    // Own cache per test, so call counts do not depend on test order.
    fn transport() -> P2pTransport {
        P2pTransport::with_legacy_ipc(P2pConfig::default(), Arc::new(LegacyIpcSupport::new()))
    }

    #[test]
    fn different_hosts_never_query_peer_access() {
        let rt = HostRuntime::new(vec![0x1000, 0x2000]);
        let topo = FixedTopology::connected();
        let t = transport();
        let a = peer(0, 0x1000);
        let other_host = PeerInfo {
            host_hash: 12,
            ..peer(1, 0x2000)
        };
        let other_ns = PeerInfo {
            shm_dev: 23,
            ..peer(1, 0x2000)
        };
        assert!(!t.can_connect(&rt, &topo, &a, &other_host).unwrap());
        assert!(!t.can_connect(&rt, &topo, &a, &other_ns).unwrap());
        assert_eq!(rt.stats().peer_queries, 0);
    }

    #[test]
    fn legacy_ipc_check_runs_once() {
        let rt = HostRuntime::new(vec![0x1000, 0x2000]);
        let topo = FixedTopology::connected();
        let t = transport();
        for _ in 0..3 {
            assert!(t.can_connect(&rt, &topo, &peer(0, 0x1000), &peer(1, 0x2000)).unwrap());
        }
        let stats = rt.stats();
        assert_eq!(stats.allocations, 1);
        assert_eq!(stats.ipc_exports, 1);
        assert_eq!(stats.peer_queries, 3);
        assert_eq!(rt.live_allocations(), 0);
    }

    #[test]
    fn failed_legacy_ipc_check_is_cached() {
        let rt = HostRuntime::new(vec![0x1000, 0x2000]);
        rt.set_ipc_supported(false);
        let topo = FixedTopology::connected();
        let t = transport();
        assert!(!t.can_connect(&rt, &topo, &peer(0, 0x1000), &peer(1, 0x2000)).unwrap());
        rt.set_ipc_supported(true);
        assert!(!t.can_connect(&rt, &topo, &peer(0, 0x1000), &peer(1, 0x2000)).unwrap());
        assert_eq!(rt.stats().ipc_exports, 1);
    }

    #[test]
    fn concurrent_first_callers_share_one_check() {
        let rt = HostRuntime::new(vec![0x1000, 0x2000]);
        rt.set_alloc_delay(Some(Duration::from_millis(20)));
        let topo = FixedTopology::connected();
        let support = Arc::new(LegacyIpcSupport::new());
        let transports = [
            P2pTransport::with_legacy_ipc(P2pConfig::default(), support.clone()),
            P2pTransport::with_legacy_ipc(P2pConfig::direct(), support),
        ];
        let barrier = Barrier::new(8);
        thread::scope(|s| {
            for i in 0..8 {
                let (rt, topo, barrier, t) = (&rt, &topo, &barrier, &transports[i % 2]);
                s.spawn(move || {
                    barrier.wait();
                    assert!(t.can_connect(rt, topo, &peer(0, 0x1000), &peer(1, 0x2000)).unwrap());
                });
            }
        });
        let stats = rt.stats();
        assert_eq!(stats.ipc_exports, 1);
        assert_eq!(stats.allocations, 1);
        assert_eq!(stats.peer_queries, 8);
        assert_eq!(rt.live_allocations(), 0);
    }

    #[test]
    fn plain_transports_share_the_process_check() {
        let a = P2pTransport::new(P2pConfig::default());
        let b = P2pTransport::new(P2pConfig::direct());
        assert!(Arc::ptr_eq(&a.legacy_ipc, &b.legacy_ipc));
        assert!(Arc::ptr_eq(&a.legacy_ipc, &LegacyIpcSupport::process()));
    }

    #[test]
    fn relayed_path_only_without_copy_engine() {
        let rt = HostRuntime::new(vec![0x1000, 0x2000]);
        let topo = FixedTopology {
            path: P2pPath {
                can_connect: true,
                read: false,
                intermediate_rank: Some(2),
            },
        };
        let (a, b) = (peer(0, 0x1000), peer(1, 0x2000));
        assert!(!transport().can_connect(&rt, &topo, &a, &b).unwrap());
        let direct = P2pTransport::new(P2pConfig::direct());
        assert!(direct.can_connect(&rt, &topo, &a, &b).unwrap());
        assert_eq!(rt.stats().peer_queries, 0);
    }

    #[test]
    fn no_topology_path_means_no() {
        let rt = HostRuntime::new(vec![0x1000, 0x2000]);
        let topo = FixedTopology::default();
        assert!(!transport()
            .can_connect(&rt, &topo, &peer(0, 0x1000), &peer(1, 0x2000))
            .unwrap());
    }

    #[test]
    fn invisible_devices_depend_on_runtime_version() {
        let topo = FixedTopology::connected();
        let (a, hidden) = (peer(0, 0x1000), peer(1, 0x9000));
        let recent = HostRuntime::new(vec![0x1000]);
        assert!(transport().can_connect(&recent, &topo, &a, &hidden).unwrap());
        let old = HostRuntime::new(vec![0x1000]).with_version(10000);
        assert!(!transport().can_connect(&old, &topo, &a, &hidden).unwrap());
    }

    #[test]
    fn peer_query_failure_and_denial_are_negative() {
        let topo = FixedTopology::connected();
        let (a, b) = (peer(0, 0x1000), peer(1, 0x2000));
        let rt = HostRuntime::new(vec![0x1000, 0x2000]);
        rt.set_peer_query_fails(true);
        assert!(!transport().can_connect(&rt, &topo, &a, &b).unwrap());
        let rt = HostRuntime::new(vec![0x1000, 0x2000]);
        rt.deny_peer(0, 1);
        assert!(!transport().can_connect(&rt, &topo, &a, &b).unwrap());
        assert_eq!(rt.stats().ipc_exports, 0);
    }

    #[test]
    fn bus_ids_map_to_visible_devices() {
        let rt = HostRuntime::new(vec![0x1000, 0x2000]);
        assert_eq!(bus_id_to_dev(&rt, 0x2000).unwrap(), Some(1));
        assert_eq!(bus_id_to_dev(&rt, 0x3000).unwrap(), None);
    }
}
