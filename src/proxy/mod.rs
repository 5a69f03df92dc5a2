//! Proxy side of the transport.
//!
//! Every rank runs one `P2pProxy`. Endpoints reach it through the `ProxyRpc`
//! seam to obtain buffers (`allocator`), and the proxy host drives copy-engine
//! progress through `P2pProxy::progress` (`scheduler`).

pub mod allocator;
pub mod events;
pub mod scheduler;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::common::config::P2pConfig;
use crate::common::error::{P2pError, Result};
use crate::common::layout::NUM_PROTOCOLS;
use crate::runtime::DeviceRuntime;

pub use allocator::{ConnectRequest, ProxyInfo, SetupRequest, SharedAllocation, StagingInfo};
pub use events::{EventBlock, EventId, EventPool};
pub use scheduler::{CopyBatcher, OpState, ProxyArgs, ProxySubArgs};

use allocator::ProxyResources;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProxyMsg {
    Setup,
    Connect,
}

/// Endpoint's handle on a connection living inside a (possibly remote) proxy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProxyConnector {
    pub id: u64,
    pub rank: i32,
    pub send: bool,
}

/// Request/response channel between an endpoint and the proxy of `rank`.
pub trait ProxyRpc: Send + Sync {
    fn connect(&self, send: bool, rank: i32) -> Result<ProxyConnector>;
    fn call(&self, conn: &ProxyConnector, msg: ProxyMsg, req: &[u8]) -> Result<Vec<u8>>;
    /// Release everything the proxy holds for `conn`. Never fails loudly.
    fn free(&self, conn: &ProxyConnector);
}

pub(crate) struct ProxyConnection {
    pub(crate) send: bool,
    pub(crate) resources: ProxyResources,
}

pub struct P2pProxy {
    pub(crate) runtime: Arc<dyn DeviceRuntime>,
    pub(crate) config: P2pConfig,
    pub(crate) rank: i32,
    pub(crate) n_channels: usize,
    pub(crate) buff_sizes: [usize; NUM_PROTOCOLS],
    pub(crate) send_staging: SharedAllocation,
    pub(crate) recv_shared: SharedAllocation,
    pub(crate) events: EventPool,
    pub(crate) batcher: CopyBatcher,
    pub(crate) connections: HashMap<u64, ProxyConnection>,
    next_id: u64,
}

impl P2pProxy {
    pub fn new(
        runtime: Arc<dyn DeviceRuntime>,
        config: P2pConfig,
        rank: i32,
        n_channels: usize,
        buff_sizes: [usize; NUM_PROTOCOLS],
    ) -> P2pProxy {
        P2pProxy {
            events: EventPool::new(runtime.clone()),
            runtime,
            config,
            rank,
            n_channels,
            buff_sizes,
            send_staging: SharedAllocation::default(),
            recv_shared: SharedAllocation::default(),
            batcher: CopyBatcher::default(),
            connections: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn rank(&self) -> i32 {
        self.rank
    }

    /// Register a new connection with no resources yet.
    pub fn open(&mut self, send: bool) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.connections.insert(
            id,
            ProxyConnection {
                send,
                resources: ProxyResources::Empty,
            },
        );
        id
    }

    pub fn handle(&mut self, id: u64, msg: ProxyMsg, req: &[u8]) -> Result<Vec<u8>> {
        let send = self
            .connections
            .get(&id)
            .map(|c| c.send)
            .ok_or_else(|| P2pError::protocol(format!("unknown proxy connection {}", id)))?;
        match (msg, send) {
            (ProxyMsg::Setup, true) => self.send_proxy_setup(id, req),
            (ProxyMsg::Setup, false) => self.recv_proxy_setup(id, req),
            (ProxyMsg::Connect, true) => self.send_proxy_connect(id, req),
            (ProxyMsg::Connect, false) => Err(P2pError::protocol("receive connections take no proxy connect")),
        }
    }

    /// Tear down one connection. Failures are logged and cleanup carries on.
    pub fn free_connection(&mut self, id: u64) {
        let conn = match self.connections.remove(&id) {
            Some(conn) => conn,
            None => {
                log::warn!("proxy {}: free of unknown connection {}", self.rank, id);
                return;
            }
        };
        self.batcher.discard(id);
        if conn.send {
            self.send_proxy_free(conn.resources);
        } else {
            self.recv_proxy_free(conn.resources);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Staging state of a send connection in copy-engine mode.
    pub fn proxy_info(&self, id: u64) -> Option<&ProxyInfo> {
        match self.connections.get(&id).map(|c| &c.resources) {
            Some(ProxyResources::Staged(info)) => Some(info),
            _ => None,
        }
    }

    pub(crate) fn staged(&self, id: u64) -> Result<&ProxyInfo> {
        self.proxy_info(id)
            .ok_or_else(|| P2pError::protocol(format!("proxy connection {} has no staging", id)))
    }

    pub(crate) fn staged_mut(&mut self, id: u64) -> Result<&mut ProxyInfo> {
        match self.connections.get_mut(&id).map(|c| &mut c.resources) {
            Some(ProxyResources::Staged(info)) => Ok(info),
            _ => Err(P2pError::protocol(format!("proxy connection {} has no staging", id))),
        }
    }

    pub fn staging_refs(&self) -> usize {
        self.send_staging.refs()
    }

    pub fn recv_buffer_refs(&self) -> usize {
        self.recv_shared.refs()
    }
}

/// Decode an RPC payload that must be exactly one `T`.
pub(crate) fn decode_exact<T>(bytes: &[u8], what: &str) -> Result<T>
where
    T: DeserializeOwned + Serialize,
{
    let value: T = bincode::deserialize(bytes).map_err(|e| P2pError::protocol(format!("malformed {}: {}", what, e)))?;
    let expected = bincode::serialized_size(&value)? as usize;
    if expected != bytes.len() {
        return Err(P2pError::protocol(format!(
            "{} of {} bytes, expected {}",
            what,
            bytes.len(),
            expected
        )));
    }
    Ok(value)
}

/// In-process RPC: each rank's proxy lives behind a mutex in one table.
#[derive(Default)]
pub struct LocalProxyRpc {
    proxies: Mutex<HashMap<i32, Arc<Mutex<P2pProxy>>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl LocalProxyRpc {
    pub fn new() -> LocalProxyRpc {
        LocalProxyRpc::default()
    }

    pub fn register(&self, proxy: P2pProxy) -> Arc<Mutex<P2pProxy>> {
        let rank = proxy.rank();
        let proxy = Arc::new(Mutex::new(proxy));
        lock(&self.proxies).insert(rank, proxy.clone());
        proxy
    }

    pub fn proxy(&self, rank: i32) -> Option<Arc<Mutex<P2pProxy>>> {
        lock(&self.proxies).get(&rank).cloned()
    }

    fn get(&self, rank: i32) -> Result<Arc<Mutex<P2pProxy>>> {
        self.proxy(rank)
            .ok_or_else(|| P2pError::protocol(format!("no proxy registered for rank {}", rank)))
    }
}

impl ProxyRpc for LocalProxyRpc {
    fn connect(&self, send: bool, rank: i32) -> Result<ProxyConnector> {
        let proxy = self.get(rank)?;
        let id = lock(&proxy).open(send);
        Ok(ProxyConnector { id, rank, send })
    }

    fn call(&self, conn: &ProxyConnector, msg: ProxyMsg, req: &[u8]) -> Result<Vec<u8>> {
        let proxy = self.get(conn.rank)?;
        let mut proxy = lock(&proxy);
        proxy.handle(conn.id, msg, req)
    }

    fn free(&self, conn: &ProxyConnector) {
        match self.proxy(conn.rank) {
            Some(proxy) => lock(&proxy).free_connection(conn.id),
            None => log::warn!("no proxy for rank {} while freeing connection {}", conn.rank, conn.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ExportedBuffer;
    use crate::runtime::HostRuntime;

    #[test]
    fn decode_exact_rejects_trailing_bytes() {
        let mut bytes = bincode::serialize(&SetupRequest { size: 64 }).unwrap();
        assert_eq!(decode_exact::<SetupRequest>(&bytes, "setup").unwrap().size, 64);
        bytes.push(0);
        assert!(matches!(
            decode_exact::<SetupRequest>(&bytes, "setup"),
            Err(P2pError::Protocol { .. })
        ));
        assert!(matches!(
            decode_exact::<SetupRequest>(&bytes[..4], "setup"),
            Err(P2pError::Protocol { .. })
        ));
    }

    #[test]
    fn local_rpc_routes_by_rank() {
        let rt = Arc::new(HostRuntime::new(vec![0x1000, 0x2000]));
        let rpc = LocalProxyRpc::new();
        for rank in 0..2 {
            rpc.register(P2pProxy::new(rt.clone(), P2pConfig::direct(), rank, 1, [4096; 3]));
        }
        let conn = rpc.connect(true, 1).unwrap();
        assert_eq!(conn.rank, 1);
        let req = bincode::serialize(&SetupRequest { size: 4096 }).unwrap();
        let resp = rpc.call(&conn, ProxyMsg::Setup, &req).unwrap();
        let exported: ExportedBuffer = decode_exact(&resp, "buffer").unwrap();
        assert!(!exported.ptr.is_null());
        assert_eq!(rpc.proxy(1).unwrap().lock().unwrap().connection_count(), 1);

        rpc.free(&conn);
        assert_eq!(rpc.proxy(1).unwrap().lock().unwrap().connection_count(), 0);
        assert_eq!(rt.live_allocations(), 0);
        assert!(rpc.connect(true, 7).is_err());
    }
}
