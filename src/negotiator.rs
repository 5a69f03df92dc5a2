//! Endpoint side of the connection: setup, connect and free for both
//! directions.
//!
//! Setup asks the proxy of the buffer-owning rank (self, or the relaying
//! rank) for memory and publishes a `ConnectDescriptor` in the connect slot.
//! Connect maps the peer's descriptor and wires the connector's buffers,
//! head and tail. In copy-engine mode the sender instead writes into the
//! proxy's staging buffer and pinned mirror, and the receiver watches the
//! counters in the shm segment the sender's proxy exported.

use std::sync::Arc;

use crate::common::error::{P2pError, Result};
use crate::common::layout::{
    align_size, step_offsets, CUDA_IPC_MIN, DIRECT_READ, DIRECT_WRITE, IPC_READ, IPC_WRITE, NCCL_STEPS,
    NUM_PROTOCOLS, PROTO_SIMPLE, RECV_MEM_SIZE, RECV_SIZES_FIFO, RECV_TAIL, SEND_HEAD, SEND_MEM_SIZE,
    SEND_PTR_EXCHANGE, SEND_RED_OP_ARG_EXCHANGE, SHM_RECV_MEM, SHM_SEND_MEM, STAGING_SHAPES,
};
use crate::descriptor::{BufferDescriptor, ConnectDescriptor, ConnectSlot, ExportedBuffer, StagingSegment};
use crate::mapper::{p2p_map, release_import, MappedBuffer};
use crate::prober::P2pTransport;
use crate::proxy::{decode_exact, ConnectRequest, ProxyConnector, ProxyMsg, ProxyRpc, SetupRequest, StagingInfo};
use crate::runtime::{DevicePtr, DeviceRuntime};
use crate::shm::ShmSegment;
use crate::topo::{get_hostname, PeerInfo, TopoGraph, Topology};

/// Communicator state the transport reads.
pub struct CommContext {
    pub rank: i32,
    pub n_channels: usize,
    pub buff_sizes: [usize; NUM_PROTOCOLS],
    pub peer_info: Vec<PeerInfo>,
    pub topo: Arc<dyn Topology>,
    pub proxy: Arc<dyn ProxyRpc>,
    pub runtime: Arc<dyn DeviceRuntime>,
}

impl CommContext {
    fn peer(&self, rank: i32) -> Result<&PeerInfo> {
        usize::try_from(rank)
            .ok()
            .and_then(|r| self.peer_info.get(r))
            .ok_or_else(|| P2pError::protocol(format!("no peer info for rank {}", rank)))
    }

    fn step_size(&self) -> usize {
        self.buff_sizes[PROTO_SIMPLE] / NCCL_STEPS
    }
}

/// Addresses the device kernels use for one direction of a connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnInfo {
    pub buffs: [DevicePtr; NUM_PROTOCOLS],
    pub head: DevicePtr,
    pub tail: DevicePtr,
    pub sizes_fifo: Option<DevicePtr>,
    pub offs_fifo: Option<DevicePtr>,
    pub ptr_exchange: Option<DevicePtr>,
    pub red_op_arg_exchange: Option<DevicePtr>,
    /// `DIRECT_*` / `IPC_*` flags.
    pub direct: u32,
}

#[derive(Debug, Default)]
pub struct SendResources {
    dev_mem: Option<DevicePtr>,
    send_mem_import: Option<DevicePtr>,
    recv_mem_import: Option<DevicePtr>,
    staging: Option<StagingInfo>,
    offs_fifo: Option<DevicePtr>,
}

#[derive(Default)]
pub struct RecvResources {
    dev_mem: Option<DevicePtr>,
    send_mem_import: Option<DevicePtr>,
    recv_mem_import: Option<DevicePtr>,
    shm: Option<ShmSegment>,
    offs_fifo: Option<DevicePtr>,
}

pub struct Connector<R> {
    pub conn: ConnInfo,
    pub proxy_conn: Option<ProxyConnector>,
    resources: Option<R>,
}

impl<R> Default for Connector<R> {
    fn default() -> Self {
        Connector {
            conn: ConnInfo::default(),
            proxy_conn: None,
            resources: None,
        }
    }
}

impl<R> Connector<R> {
    pub fn is_set_up(&self) -> bool {
        self.resources.is_some()
    }

    fn resources_mut(&mut self) -> Result<&mut R> {
        self.resources
            .as_mut()
            .ok_or_else(|| P2pError::protocol("connect before setup"))
    }
}

impl Connector<SendResources> {
    /// Staging block handed out by the proxy in copy-engine mode.
    pub fn staging(&self) -> Option<&StagingInfo> {
        self.resources.as_ref().and_then(|r| r.staging.as_ref())
    }
}

fn upload_offsets(runtime: &dyn DeviceRuntime, offsets: &[i32; NCCL_STEPS]) -> Result<DevicePtr> {
    let bytes: Vec<u8> = offsets.iter().flat_map(|o| o.to_ne_bytes()).collect();
    let table = runtime.alloc_zeroed(bytes.len())?;
    if let Err(e) = runtime.memcpy_htod(table, &bytes) {
        free_table(runtime, Some(table));
        return Err(e);
    }
    Ok(table)
}

fn staged_offsets(comm: &CommContext, desc: &ConnectDescriptor) -> Result<[i32; NCCL_STEPS]> {
    if desc.graph_id < 0 || desc.graph_id as usize >= STAGING_SHAPES {
        return Err(P2pError::protocol(format!(
            "graph {} outside the staging layout",
            desc.graph_id
        )));
    }
    if desc.channel_id < 0 || desc.channel_id as usize >= comm.n_channels {
        return Err(P2pError::protocol(format!(
            "channel {} beyond {} channels",
            desc.channel_id, comm.n_channels
        )));
    }
    step_offsets(
        comm.step_size(),
        comm.n_channels,
        desc.channel_id as usize,
        desc.graph_id as usize,
    )
}

fn free_table(runtime: &dyn DeviceRuntime, table: Option<DevicePtr>) {
    if let Some(ptr) = table {
        if let Err(e) = runtime.free(ptr) {
            log::warn!("freeing offset table failed: {}", e);
        }
    }
}

impl P2pTransport {
    /// Direction and relay rank for the pair, after the read-enable override.
    fn path_info(&self, topo: &dyn Topology, my: &PeerInfo, peer: &PeerInfo) -> Result<(bool, Option<i32>)> {
        let path = topo.check_p2p(my.bus_id, peer.bus_id)?;
        let read = self.config().read_enable.unwrap_or(path.read);
        Ok((read, path.intermediate_rank))
    }

    /// Ask the proxy of `owner` for a plain buffer and resolve it for both ends.
    fn setup_buffer(
        &self,
        comm: &CommContext,
        conn: &ProxyConnector,
        my: &PeerInfo,
        peer: &PeerInfo,
        size: usize,
    ) -> Result<(BufferDescriptor, MappedBuffer)> {
        let req = bincode::serialize(&SetupRequest { size: size as u64 })?;
        let resp = comm.proxy.call(conn, ProxyMsg::Setup, &req)?;
        let exported: ExportedBuffer = decode_exact(&resp, "buffer response")?;
        let owner = comm.peer(conn.rank)?;
        let local = BufferDescriptor::for_consumer(owner, my, &exported);
        let mapped = p2p_map(&*comm.runtime, my, owner, &local)?;
        Ok((BufferDescriptor::for_consumer(owner, peer, &exported), mapped))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn send_setup(
        &self,
        comm: &CommContext,
        graph: &TopoGraph,
        my: &PeerInfo,
        peer: &PeerInfo,
        slot: &mut ConnectSlot,
        send: &mut Connector<SendResources>,
        channel_id: i32,
        conn_index: i32,
    ) -> Result<()> {
        let staged = self.uses_copy_engine();
        let (mut read, intermediate) = self.path_info(&*comm.topo, my, peer)?;
        if staged {
            read = false;
        }
        // Scatter-reduce half of a CollNet pair always writes.
        if conn_index == 1 {
            read = false;
        }
        let read_str = if read { "/read" } else { "" };

        let mut send_size = SEND_MEM_SIZE;
        if read {
            // The SIMPLE buffer trails the send header.
            send_size += comm.buff_sizes[PROTO_SIMPLE];
        }
        let send_size = align_size(send_size, CUDA_IPC_MIN);

        let rank = match intermediate {
            None => {
                if my.pid_hash == peer.pid_hash && !staged {
                    if !self.config().direct_disable {
                        send.conn.direct |= if read { DIRECT_READ } else { DIRECT_WRITE };
                    }
                    log::info!(
                        "{} Channel {:02} : {}[{:x}] -> {}[{:x}] via P2P/direct pointer{}",
                        get_hostname(),
                        channel_id,
                        my.rank,
                        my.bus_id,
                        peer.rank,
                        peer.bus_id,
                        read_str
                    );
                } else {
                    send.conn.direct |= if read { IPC_READ } else { IPC_WRITE };
                    log::info!(
                        "{} Channel {:02} : {}[{:x}] -> {}[{:x}] via P2P/IPC{}{}",
                        get_hostname(),
                        channel_id,
                        my.rank,
                        my.bus_id,
                        peer.rank,
                        peer.bus_id,
                        read_str,
                        if staged { "/CE" } else { "" }
                    );
                }
                my.rank
            }
            Some(relay) => {
                if staged {
                    return Err(P2pError::protocol("copy-engine staging cannot relay through another rank"));
                }
                log::info!(
                    "{} Channel {:02} : {}[{:x}] -> {}[{:x}] via P2P/indirect/{}[{:x}]{}",
                    get_hostname(),
                    channel_id,
                    my.rank,
                    my.bus_id,
                    peer.rank,
                    peer.bus_id,
                    relay,
                    comm.peer(relay)?.bus_id,
                    read_str
                );
                relay
            }
        };

        let mut desc = ConnectDescriptor {
            rank,
            read,
            graph_id: graph.id,
            channel_id,
            buffer: None,
            staging: None,
        };
        let proxy_conn = comm.proxy.connect(true, rank)?;
        send.proxy_conn = Some(proxy_conn);
        let mut resources = SendResources::default();

        if staged {
            let resp = comm.proxy.call(&proxy_conn, ProxyMsg::Setup, &[])?;
            let staging: StagingInfo = decode_exact(&resp, "staging response")?;
            desc.staging = Some(StagingSegment {
                name: staging.shm_name,
                size: staging.shm_size,
            });
            resources.staging = Some(staging);
        } else {
            let (buffer, mapped) = self.setup_buffer(comm, &proxy_conn, my, peer, send_size)?;
            desc.buffer = Some(buffer);
            resources.dev_mem = Some(mapped.ptr);
            resources.send_mem_import = mapped.import;
        }
        send.resources = Some(resources);
        desc.encode_into(slot)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn recv_setup(
        &self,
        comm: &CommContext,
        graph: &TopoGraph,
        my: &PeerInfo,
        peer: &PeerInfo,
        slot: &mut ConnectSlot,
        recv: &mut Connector<RecvResources>,
        channel_id: i32,
        conn_index: i32,
    ) -> Result<()> {
        let staged = self.uses_copy_engine();
        let (mut read, intermediate) = self.path_info(&*comm.topo, my, peer)?;
        if staged || conn_index == 1 {
            read = false;
        }

        let mut recv_size = RECV_MEM_SIZE;
        for (p, size) in comm.buff_sizes.iter().enumerate() {
            // In read mode the sender hosts the SIMPLE buffer.
            if !(read && p == PROTO_SIMPLE) {
                recv_size += size;
            }
        }
        let recv_size = align_size(recv_size, CUDA_IPC_MIN);

        let rank = match intermediate {
            None => {
                if my.pid_hash == peer.pid_hash && !staged {
                    if !self.config().direct_disable {
                        recv.conn.direct |= if read { DIRECT_READ } else { DIRECT_WRITE };
                    }
                } else {
                    recv.conn.direct |= if read { IPC_READ } else { IPC_WRITE };
                }
                my.rank
            }
            Some(relay) => relay,
        };

        let proxy_conn = comm.proxy.connect(false, rank)?;
        recv.proxy_conn = Some(proxy_conn);
        let (buffer, mapped) = self.setup_buffer(comm, &proxy_conn, my, peer, recv_size)?;
        recv.resources = Some(RecvResources {
            dev_mem: Some(mapped.ptr),
            recv_mem_import: mapped.import,
            ..RecvResources::default()
        });

        ConnectDescriptor {
            rank,
            read,
            graph_id: graph.id,
            channel_id,
            buffer: Some(buffer),
            staging: None,
        }
        .encode_into(slot)
    }

    /// Wire the send connector to the receiver described in `slot`.
    pub fn send_connect(&self, comm: &CommContext, slot: &ConnectSlot, send: &mut Connector<SendResources>) -> Result<()> {
        if !send.conn.tail.is_null() {
            return Err(P2pError::protocol("send connector connected twice"));
        }
        let proxy_conn = send.proxy_conn;
        let direct = send.conn.direct;
        let resources = send.resources_mut()?;
        let info = ConnectDescriptor::decode(slot)?;
        let my = comm.peer(comm.rank)?;
        let owner = comm.peer(info.rank)?;
        let buffer = info
            .buffer
            .ok_or_else(|| P2pError::protocol("receiver descriptor carries no buffer"))?;
        let mapped = p2p_map(&*comm.runtime, my, owner, &buffer)?;
        resources.recv_mem_import = mapped.import;
        let rem_dev_mem = mapped.ptr;

        let mut buffs = [DevicePtr::NULL; NUM_PROTOCOLS];
        let mut buff = rem_dev_mem.add(RECV_MEM_SIZE);
        for (p, slot_ptr) in buffs.iter_mut().enumerate() {
            if info.read && p == PROTO_SIMPLE {
                // Read mode: SIMPLE lives after the local send header.
                let local = resources
                    .dev_mem
                    .ok_or_else(|| P2pError::protocol("read mode without a local send buffer"))?;
                *slot_ptr = local.add(SEND_MEM_SIZE);
            } else {
                *slot_ptr = buff;
                buff = buff.add(comm.buff_sizes[p]);
            }
        }

        let mut conn = ConnInfo {
            buffs,
            direct,
            ..ConnInfo::default()
        };
        match resources.staging {
            Some(staging) => {
                conn.tail = staging.ce_recv_mem.add(RECV_TAIL);
                conn.sizes_fifo = Some(staging.ce_recv_mem.add(RECV_SIZES_FIFO));
                conn.head = staging.dev_shm.add(SHM_SEND_MEM + SEND_HEAD);

                let offsets = staged_offsets(comm, &info)?;
                let req = ConnectRequest {
                    recv_fifo: conn.buffs[PROTO_SIMPLE],
                    offsets,
                    graph_id: info.graph_id,
                };
                let proxy_conn = proxy_conn.ok_or_else(|| P2pError::protocol("send connect without a proxy connection"))?;
                let resp = comm.proxy.call(&proxy_conn, ProxyMsg::Connect, &bincode::serialize(&req)?)?;
                if !resp.is_empty() {
                    return Err(P2pError::protocol(format!(
                        "proxy connect answered {} bytes, expected none",
                        resp.len()
                    )));
                }
                // The GPU writes the staging buffer; the proxy moves it to the peer.
                conn.buffs[PROTO_SIMPLE] = staging.ce_dev_buff;
                let table = upload_offsets(&*comm.runtime, &offsets)?;
                resources.offs_fifo = Some(table);
                conn.offs_fifo = Some(table);
            }
            None => {
                let local = resources
                    .dev_mem
                    .ok_or_else(|| P2pError::protocol("send connect without a local send buffer"))?;
                conn.tail = rem_dev_mem.add(RECV_TAIL);
                conn.head = local.add(SEND_HEAD);
                conn.ptr_exchange = Some(local.add(SEND_PTR_EXCHANGE));
                conn.red_op_arg_exchange = Some(local.add(SEND_RED_OP_ARG_EXCHANGE));
            }
        }
        send.conn = conn;
        Ok(())
    }

    /// Wire the receive connector to the sender described in `slot`.
    pub fn recv_connect(&self, comm: &CommContext, slot: &ConnectSlot, recv: &mut Connector<RecvResources>) -> Result<()> {
        if !recv.conn.tail.is_null() {
            return Err(P2pError::protocol("receive connector connected twice"));
        }
        let staged = self.uses_copy_engine();
        let direct = recv.conn.direct;
        let resources = recv.resources_mut()?;
        let info = ConnectDescriptor::decode(slot)?;
        let mut conn = ConnInfo {
            direct,
            ..ConnInfo::default()
        };

        let mut rem_dev_mem = None;
        if staged {
            let staging = info
                .staging
                .ok_or_else(|| P2pError::protocol("sender descriptor carries no staging segment"))?;
            log::trace!("Open shmName {} shmSize {}", staging.name.path(), staging.size);
            let shm = ShmSegment::open(&*comm.runtime, staging.name, staging.size as usize)?;
            // Drop the name right away so a crash cannot leak it.
            let unlinked = shm.unlink();
            let dev_shm = shm.dev_ptr();
            resources.shm = Some(shm);
            unlinked?;
            conn.tail = dev_shm.add(SHM_RECV_MEM + RECV_TAIL);
            conn.head = dev_shm.add(SHM_SEND_MEM + SEND_HEAD);
        } else {
            let my = comm.peer(comm.rank)?;
            let owner = comm.peer(info.rank)?;
            let buffer = info
                .buffer
                .ok_or_else(|| P2pError::protocol("sender descriptor carries no buffer"))?;
            let mapped = p2p_map(&*comm.runtime, my, owner, &buffer)?;
            resources.send_mem_import = mapped.import;
            let local = resources
                .dev_mem
                .ok_or_else(|| P2pError::protocol("recv connect without a local buffer"))?;
            conn.tail = local.add(RECV_TAIL);
            conn.head = mapped.ptr.add(SEND_HEAD);
            conn.ptr_exchange = Some(mapped.ptr.add(SEND_PTR_EXCHANGE));
            conn.red_op_arg_exchange = Some(mapped.ptr.add(SEND_RED_OP_ARG_EXCHANGE));
            rem_dev_mem = Some(mapped.ptr);
        }

        let local = resources
            .dev_mem
            .ok_or_else(|| P2pError::protocol("recv connect without a local buffer"))?;
        let mut buff = local.add(RECV_MEM_SIZE);
        for p in 0..NUM_PROTOCOLS {
            if info.read && p == PROTO_SIMPLE {
                let rem = rem_dev_mem.ok_or_else(|| P2pError::protocol("read mode combined with copy-engine staging"))?;
                conn.buffs[p] = rem.add(SEND_MEM_SIZE);
            } else {
                conn.buffs[p] = buff;
                buff = buff.add(comm.buff_sizes[p]);
            }
        }

        if staged {
            let offsets = staged_offsets(comm, &info)?;
            let table = upload_offsets(&*comm.runtime, &offsets)?;
            resources.offs_fifo = Some(table);
            conn.offs_fifo = Some(table);
        }
        recv.conn = conn;
        Ok(())
    }

    /// Release everything the send connector holds, locally and at its proxy.
    pub fn send_free(&self, comm: &CommContext, send: &mut Connector<SendResources>) {
        let runtime = &*comm.runtime;
        if let Some(res) = send.resources.take() {
            release_import(runtime, res.send_mem_import);
            release_import(runtime, res.recv_mem_import);
            free_table(runtime, res.offs_fifo);
        }
        if let Some(conn) = send.proxy_conn.take() {
            comm.proxy.free(&conn);
        }
        send.conn = ConnInfo::default();
    }

    pub fn recv_free(&self, comm: &CommContext, recv: &mut Connector<RecvResources>) {
        let runtime = &*comm.runtime;
        if let Some(res) = recv.resources.take() {
            release_import(runtime, res.send_mem_import);
            release_import(runtime, res.recv_mem_import);
            free_table(runtime, res.offs_fifo);
            if let Some(shm) = res.shm {
                if let Err(e) = shm.close(runtime) {
                    log::warn!("closing shm segment failed: {}", e);
                }
            }
        }
        if let Some(conn) = recv.proxy_conn.take() {
            comm.proxy.free(&conn);
        }
        recv.conn = ConnInfo::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::P2pConfig;
    use crate::proxy::{LocalProxyRpc, P2pProxy};
    use crate::runtime::HostRuntime;
    use crate::topo::{FixedTopology, P2pPath};

    const BUFF: [usize; 3] = [1 << 16, 1 << 16, 1 << 20];

    fn comm(config: &P2pConfig, path: P2pPath, pid2: u64) -> (Arc<HostRuntime>, CommContext) {
        let rt = Arc::new(HostRuntime::new(vec![0x1000, 0x2000]));
        let rpc = Arc::new(LocalProxyRpc::new());
        for rank in 0..2 {
            rpc.register(P2pProxy::new(rt.clone(), config.clone(), rank, 1, BUFF));
        }
        let peers = vec![
            PeerInfo {
                rank: 0,
                pid_hash: 1,
                bus_id: 0x1000,
                cuda_dev: 0,
                ..PeerInfo::default()
            },
            PeerInfo {
                rank: 1,
                pid_hash: pid2,
                bus_id: 0x2000,
                cuda_dev: 1,
                ..PeerInfo::default()
            },
        ];
        let comm = CommContext {
            rank: 0,
            n_channels: 1,
            buff_sizes: BUFF,
            peer_info: peers,
            topo: Arc::new(FixedTopology { path }),
            proxy: rpc,
            runtime: rt.clone(),
        };
        (rt, comm)
    }

    #[test]
    fn direct_setup_sets_direct_flags() {
        let config = P2pConfig::direct();
        let (_rt, comm) = comm(&config, FixedTopology::connected().path, 1);
        let t = P2pTransport::new(config);
        let mut slot = ConnectSlot::default();
        let mut send = Connector::default();
        let (my, peer) = (comm.peer_info[0].clone(), comm.peer_info[1].clone());
        t.send_setup(&comm, &TopoGraph::default(), &my, &peer, &mut slot, &mut send, 0, 0)
            .unwrap();
        assert_eq!(send.conn.direct, DIRECT_WRITE);
        let desc = ConnectDescriptor::decode(&slot).unwrap();
        assert!(matches!(desc.buffer, Some(BufferDescriptor::Direct(_))));
        assert!(desc.staging.is_none());
        t.send_free(&comm, &mut send);
    }

    #[test]
    fn direct_disable_keeps_flags_clear() {
        let config = P2pConfig {
            direct_disable: true,
            ..P2pConfig::direct()
        };
        let (_rt, comm) = comm(&config, FixedTopology::connected().path, 1);
        let t = P2pTransport::new(config);
        let mut slot = ConnectSlot::default();
        let mut send = Connector::default();
        let (my, peer) = (comm.peer_info[0].clone(), comm.peer_info[1].clone());
        t.send_setup(&comm, &TopoGraph::default(), &my, &peer, &mut slot, &mut send, 0, 0)
            .unwrap();
        assert_eq!(send.conn.direct, 0);
        t.send_free(&comm, &mut send);
    }

    #[test]
    fn cross_process_peer_gets_ipc_handle() {
        let config = P2pConfig::direct();
        let (_rt, comm) = comm(&config, FixedTopology::connected().path, 2);
        let t = P2pTransport::new(config);
        let mut slot = ConnectSlot::default();
        let mut recv = Connector::default();
        let (my, peer) = (comm.peer_info[0].clone(), comm.peer_info[1].clone());
        t.recv_setup(&comm, &TopoGraph::default(), &my, &peer, &mut slot, &mut recv, 0, 0)
            .unwrap();
        assert_eq!(recv.conn.direct, IPC_WRITE);
        let desc = ConnectDescriptor::decode(&slot).unwrap();
        assert!(matches!(desc.buffer, Some(BufferDescriptor::Ipc(_))));
        t.recv_free(&comm, &mut recv);
    }

    #[test]
    fn read_mode_and_second_connection() {
        let config = P2pConfig {
            read_enable: None,
            ..P2pConfig::direct()
        };
        let path = P2pPath {
            can_connect: true,
            read: true,
            intermediate_rank: None,
        };
        let (_rt, comm) = comm(&config, path, 1);
        let t = P2pTransport::new(config);
        let (my, peer) = (comm.peer_info[0].clone(), comm.peer_info[1].clone());

        let mut slot = ConnectSlot::default();
        let mut send = Connector::default();
        t.send_setup(&comm, &TopoGraph::default(), &my, &peer, &mut slot, &mut send, 0, 0)
            .unwrap();
        assert!(ConnectDescriptor::decode(&slot).unwrap().read);
        assert_eq!(send.conn.direct, DIRECT_READ);

        let mut slot1 = ConnectSlot::default();
        let mut send1 = Connector::default();
        t.send_setup(&comm, &TopoGraph::default(), &my, &peer, &mut slot1, &mut send1, 0, 1)
            .unwrap();
        assert!(!ConnectDescriptor::decode(&slot1).unwrap().read);

        t.send_free(&comm, &mut send);
        t.send_free(&comm, &mut send1);
    }

    #[test]
    fn staged_setup_publishes_segment_name() {
        let config = P2pConfig::default();
        let (_rt, comm) = comm(&config, FixedTopology::connected().path, 1);
        let t = P2pTransport::new(config);
        let mut slot = ConnectSlot::default();
        let mut send = Connector::default();
        let (my, peer) = (comm.peer_info[0].clone(), comm.peer_info[1].clone());
        t.send_setup(&comm, &TopoGraph::default(), &my, &peer, &mut slot, &mut send, 0, 0)
            .unwrap();
        let desc = ConnectDescriptor::decode(&slot).unwrap();
        assert!(desc.buffer.is_none());
        assert!(!desc.read);
        let staging = desc.staging.unwrap();
        assert_eq!(Some(staging.name), send.staging().map(|s| s.shm_name));
        assert_eq!(send.conn.direct, IPC_WRITE);
        t.send_free(&comm, &mut send);
        assert!(!std::path::Path::new(&staging.name.path()).exists());
    }

    #[test]
    fn staged_relay_is_refused() {
        let config = P2pConfig::default();
        let path = P2pPath {
            can_connect: true,
            read: false,
            intermediate_rank: Some(1),
        };
        let (_rt, comm) = comm(&config, path, 1);
        let t = P2pTransport::new(config);
        let (my, peer) = (comm.peer_info[0].clone(), comm.peer_info[1].clone());
        let mut slot = ConnectSlot::default();
        let mut send = Connector::default();
        let err = t
            .send_setup(&comm, &TopoGraph::default(), &my, &peer, &mut slot, &mut send, 0, 0)
            .unwrap_err();
        assert!(matches!(err, P2pError::Protocol { .. }));
    }

    #[test]
    fn read_descriptor_with_staging_is_internal_fault() {
        let config = P2pConfig::default();
        let (_rt, comm) = comm(&config, FixedTopology::connected().path, 1);
        let t = P2pTransport::new(config);
        let (my, peer) = (comm.peer_info[0].clone(), comm.peer_info[1].clone());

        let mut send_slot = ConnectSlot::default();
        let mut send = Connector::default();
        t.send_setup(&comm, &TopoGraph::default(), &my, &peer, &mut send_slot, &mut send, 0, 0)
            .unwrap();
        let mut desc = ConnectDescriptor::decode(&send_slot).unwrap();
        desc.read = true;
        desc.encode_into(&mut send_slot).unwrap();

        let mut recv_slot = ConnectSlot::default();
        let mut recv = Connector::default();
        t.recv_setup(&comm, &TopoGraph::default(), &my, &peer, &mut recv_slot, &mut recv, 0, 0)
            .unwrap();
        let err = t.recv_connect(&comm, &send_slot, &mut recv).unwrap_err();
        assert!(matches!(err, P2pError::Protocol { .. }));

        t.recv_free(&comm, &mut recv);
        t.send_free(&comm, &mut send);
    }

    #[test]
    fn staging_layout_past_i32_is_refused() {
        let config = P2pConfig::default();
        let (_rt, mut comm) = comm(&config, FixedTopology::connected().path, 1);
        comm.n_channels = 32;
        comm.buff_sizes[PROTO_SIMPLE] = 32 << 20;
        let mut desc = ConnectDescriptor {
            rank: 1,
            read: false,
            graph_id: 0,
            channel_id: 31,
            buffer: None,
            staging: None,
        };
        let offsets = staged_offsets(&comm, &desc).unwrap();
        assert!(offsets.iter().all(|&off| off >= 0));
        desc.graph_id = 2;
        let err = staged_offsets(&comm, &desc).unwrap_err();
        assert!(matches!(err, P2pError::Protocol { .. }));
    }

    #[test]
    fn connect_before_setup_is_rejected() {
        let config = P2pConfig::direct();
        let (_rt, comm) = comm(&config, FixedTopology::connected().path, 1);
        let t = P2pTransport::new(config);
        let mut send = Connector::default();
        let err = t.send_connect(&comm, &ConnectSlot::default(), &mut send).unwrap_err();
        assert!(matches!(err, P2pError::Protocol { .. }));
    }
}
