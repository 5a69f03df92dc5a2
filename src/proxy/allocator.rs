//! Buffers handed out by the proxy.
//!
//! Direct mode gets a plain zeroed device buffer exported as an IPC handle.
//! Copy-engine mode gets a staging block: a slice of the shared staging buffer,
//! a host-pinned mirror of the receive header, and a shm segment carrying the
//! head/tail counters seen by the receiving GPU.

use serde::{Deserialize, Serialize};

use crate::common::error::{P2pError, Result};
use crate::common::layout::{
    load_counter, store_counter, NCCL_STEPS, P2P_SHM_SIZE, PROTO_SIMPLE, RECV_MEM_SIZE, RECV_SIZES_FIFO, RECV_TAIL,
    SHM_RECV_MEM, STAGING_SHAPES,
};
use crate::descriptor::ExportedBuffer;
use crate::runtime::{DevicePtr, DeviceRuntime, HostAlloc, StreamHandle};
use crate::shm::{ShmName, ShmSegment};
use crate::topo::get_hostname;

use super::events::EventBlock;
use super::{decode_exact, P2pProxy};

/// Plain buffer request: bytes wanted.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct SetupRequest {
    pub size: u64,
}

/// Staging block as seen by the sending endpoint (same process as its proxy).
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct StagingInfo {
    pub shm_name: ShmName,
    pub shm_size: u32,
    /// Device alias of the shm segment.
    pub dev_shm: DevicePtr,
    /// Device alias of the pinned receive mirror (tail + sizes fifo).
    pub ce_recv_mem: DevicePtr,
    pub ce_dev_buff: DevicePtr,
}

/// Where the proxy copies to, and how the shared layout is addressed.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectRequest {
    pub recv_fifo: DevicePtr,
    pub offsets: [i32; NCCL_STEPS],
    pub graph_id: i32,
}

/// One device allocation shared by several connections.
#[derive(Debug, Default)]
pub struct SharedAllocation {
    ptr: Option<DevicePtr>,
    size: usize,
    refs: usize,
}

impl SharedAllocation {
    /// Take a share, allocating on first use. Every sharer must agree on the size.
    pub fn acquire(&mut self, runtime: &dyn DeviceRuntime, size: usize) -> Result<DevicePtr> {
        match self.ptr {
            Some(ptr) => {
                if size != self.size {
                    return Err(P2pError::protocol(format!(
                        "shared allocation of {} bytes requested as {} bytes",
                        self.size, size
                    )));
                }
                self.refs += 1;
                Ok(ptr)
            }
            None => {
                let ptr = runtime.alloc_zeroed(size)?;
                self.ptr = Some(ptr);
                self.size = size;
                self.refs = 1;
                Ok(ptr)
            }
        }
    }

    /// Drop a share. Returns true once the last share physically freed the memory.
    pub fn release(&mut self, runtime: &dyn DeviceRuntime) -> Result<bool> {
        let ptr = self
            .ptr
            .ok_or_else(|| P2pError::protocol("release of an unshared allocation"))?;
        self.refs -= 1;
        if self.refs > 0 {
            return Ok(false);
        }
        self.ptr = None;
        self.size = 0;
        runtime.free(ptr)?;
        Ok(true)
    }

    pub fn refs(&self) -> usize {
        self.refs
    }

    pub fn ptr(&self) -> Option<DevicePtr> {
        self.ptr
    }
}

/// Proxy-side state of one copy-engine connection.
pub struct ProxyInfo {
    shm: ShmSegment,
    ce_recv_mem: HostAlloc,
    pub(crate) ce_dev_buff: DevicePtr,
    pub(crate) recv_fifo: DevicePtr,
    pub(crate) offsets: [i32; NCCL_STEPS],
    pub(crate) graph_id: i32,
    pub(crate) step: u64,
    pub(crate) stream: Option<StreamHandle>,
    pub(crate) events: Option<EventBlock>,
}

impl ProxyInfo {
    /// Steps fully handed to the consumer so far, across ops.
    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Tail published by the producing GPU into the pinned mirror.
    pub(crate) fn producer_tail(&self) -> u64 {
        unsafe { load_counter(self.ce_recv_mem.host.add(RECV_TAIL) as *const u64) }
    }

    pub(crate) fn slice_size(&self, slot: usize) -> i32 {
        unsafe {
            let fifo = self.ce_recv_mem.host.add(RECV_SIZES_FIFO) as *const i32;
            std::ptr::read_volatile(fifo.add(slot % NCCL_STEPS))
        }
    }

    /// Tail the receiving GPU polls through the shm segment.
    pub fn consumer_tail(&self) -> u64 {
        unsafe { load_counter(self.shm.host_ptr().add(SHM_RECV_MEM + RECV_TAIL) as *const u64) }
    }

    pub(crate) fn publish_tail(&self, value: u64) {
        unsafe { store_counter(self.shm.host_ptr().add(SHM_RECV_MEM + RECV_TAIL) as *mut u64, value) }
    }

    /// Destination and source of the slice held in `slot`.
    pub(crate) fn slot_span(&self, slot: usize) -> (DevicePtr, DevicePtr) {
        let off = self.offsets[slot % NCCL_STEPS] as usize;
        (self.recv_fifo.add(off), self.ce_dev_buff.add(off))
    }

    pub(crate) fn copy_target(&self) -> Result<(StreamHandle, EventBlock)> {
        match (self.stream, self.events) {
            (Some(stream), Some(events)) => Ok((stream, events)),
            _ => Err(P2pError::protocol("copy-engine connection used before proxy connect")),
        }
    }
}

/// What a proxy connection owns until it is freed.
pub(crate) enum ProxyResources {
    Empty,
    Buffer(DevicePtr),
    SharedRecv,
    Staged(Box<ProxyInfo>),
}

fn best_effort<T>(what: &str, res: Result<T>) {
    if let Err(e) = res {
        log::warn!("{} failed during teardown: {}", what, e);
    }
}

impl P2pProxy {
    fn set_resources(&mut self, id: u64, resources: ProxyResources) -> Result<()> {
        match self.connections.get_mut(&id) {
            Some(conn) if matches!(conn.resources, ProxyResources::Empty) => {
                conn.resources = resources;
                Ok(())
            }
            Some(_) => {
                self.release(resources);
                Err(P2pError::protocol(format!("proxy connection {} set up twice", id)))
            }
            None => {
                self.release(resources);
                Err(P2pError::protocol(format!("unknown proxy connection {}", id)))
            }
        }
    }

    fn device_alloc(&self, size: usize) -> Result<DevicePtr> {
        self.runtime.alloc_zeroed(size).map_err(|e| {
            log::error!("{} proxy {}: allocating {} bytes failed: {}", get_hostname(), self.rank, size, e);
            e
        })
    }

    fn release(&mut self, resources: ProxyResources) {
        self.recv_proxy_free(resources);
    }

    /// Export `ptr`, undoing the allocation behind `owner` if the export fails.
    fn export(&mut self, ptr: DevicePtr, owner: ProxyResources) -> Result<(ExportedBuffer, ProxyResources)> {
        match self.runtime.ipc_get_handle(ptr) {
            Ok(ipc) => Ok((ExportedBuffer { ptr, ipc }, owner)),
            Err(e) => {
                log::warn!("cudaIpcGetMemHandle failed : {}", e);
                self.release(owner);
                Err(e)
            }
        }
    }

    pub(crate) fn send_proxy_setup(&mut self, id: u64, req: &[u8]) -> Result<Vec<u8>> {
        if self.config.use_memcpy {
            if !req.is_empty() {
                return Err(P2pError::protocol(format!(
                    "staging setup takes no request, got {} bytes",
                    req.len()
                )));
            }
            let info = self.create_staging()?;
            let resp = StagingInfo {
                shm_name: info.shm.name(),
                shm_size: info.shm.size() as u32,
                dev_shm: info.shm.dev_ptr(),
                ce_recv_mem: info.ce_recv_mem.dev,
                ce_dev_buff: info.ce_dev_buff,
            };
            self.set_resources(id, ProxyResources::Staged(Box::new(info)))?;
            Ok(bincode::serialize(&resp)?)
        } else {
            let request: SetupRequest = decode_exact(req, "setup request")?;
            let ptr = self.device_alloc(request.size as usize)?;
            let (exported, owner) = self.export(ptr, ProxyResources::Buffer(ptr))?;
            self.set_resources(id, owner)?;
            Ok(bincode::serialize(&exported)?)
        }
    }

    fn create_staging(&mut self) -> Result<ProxyInfo> {
        let runtime = self.runtime.clone();
        let total = self.buff_sizes[PROTO_SIMPLE] * self.n_channels * STAGING_SHAPES;
        let ce_dev_buff = self.send_staging.acquire(&*runtime, total)?;

        let shm = match ShmSegment::create(&*runtime, P2P_SHM_SIZE) {
            Ok(shm) => shm,
            Err(e) => {
                best_effort("staging release", self.send_staging.release(&*runtime));
                return Err(e);
            }
        };
        log::trace!("Opened shmName {} shmSize {}", shm.name().path(), shm.size());

        let ce_recv_mem = match runtime.host_alloc_zeroed(RECV_MEM_SIZE) {
            Ok(mem) => mem,
            Err(e) => {
                best_effort("shm unlink", shm.unlink());
                best_effort("shm close", shm.close(&*runtime));
                best_effort("staging release", self.send_staging.release(&*runtime));
                return Err(e);
            }
        };

        Ok(ProxyInfo {
            shm,
            ce_recv_mem,
            ce_dev_buff,
            recv_fifo: DevicePtr::NULL,
            offsets: [0; NCCL_STEPS],
            graph_id: 0,
            step: 0,
            stream: None,
            events: None,
        })
    }

    pub(crate) fn recv_proxy_setup(&mut self, id: u64, req: &[u8]) -> Result<Vec<u8>> {
        let request: SetupRequest = decode_exact(req, "setup request")?;
        let size = request.size as usize;
        let runtime = self.runtime.clone();
        let (ptr, owner) = if self.config.use_memcpy {
            // Every channel and shape lands in one allocation so merged copies stay contiguous.
            let ptr = self
                .recv_shared
                .acquire(&*runtime, size * self.n_channels * STAGING_SHAPES)?;
            (ptr, ProxyResources::SharedRecv)
        } else {
            let ptr = self.device_alloc(size)?;
            (ptr, ProxyResources::Buffer(ptr))
        };
        let (exported, owner) = self.export(ptr, owner)?;
        self.set_resources(id, owner)?;
        Ok(bincode::serialize(&exported)?)
    }

    pub(crate) fn send_proxy_connect(&mut self, id: u64, req: &[u8]) -> Result<Vec<u8>> {
        let request: ConnectRequest = decode_exact(req, "connect request")?;
        if request.graph_id < 0 || request.graph_id as usize >= STAGING_SHAPES {
            return Err(P2pError::protocol(format!(
                "graph {} outside the staging layout",
                request.graph_id
            )));
        }
        let step = self.buff_sizes[PROTO_SIMPLE] / NCCL_STEPS;
        let layout = self.buff_sizes[PROTO_SIMPLE] * self.n_channels * STAGING_SHAPES;
        if let Some(off) = request
            .offsets
            .iter()
            .find(|&&off| off < 0 || off as usize + step > layout)
        {
            return Err(P2pError::protocol(format!(
                "step offset {} outside the {} byte staging layout",
                off, layout
            )));
        }
        if self.staged(id)?.is_connected() {
            return Err(P2pError::protocol(format!("proxy connection {} connected twice", id)));
        }

        let stream = self.runtime.stream_create()?;
        let events = match self.events.create_block() {
            Ok(block) => block,
            Err(e) => {
                best_effort("stream destroy", self.runtime.stream_destroy(stream));
                return Err(e);
            }
        };
        let info = self.staged_mut(id)?;
        info.recv_fifo = request.recv_fifo;
        info.offsets = request.offsets;
        info.graph_id = request.graph_id;
        info.stream = Some(stream);
        info.events = Some(events);
        Ok(Vec::new())
    }

    pub(crate) fn send_proxy_free(&mut self, resources: ProxyResources) {
        let runtime = self.runtime.clone();
        match resources {
            ProxyResources::Staged(info) => {
                let info = *info;
                // The receiver normally unlinked the name already.
                if let Err(e) = info.shm.unlink() {
                    log::trace!("shm {} not unlinked: {}", info.shm.name().path(), e);
                }
                best_effort("shm close", info.shm.close(&*runtime));
                best_effort("cudaFreeHost", runtime.host_free(&info.ce_recv_mem));
                best_effort("staging release", self.send_staging.release(&*runtime));
                if let Some(stream) = info.stream {
                    best_effort("cudaStreamDestroy", runtime.stream_destroy(stream));
                }
                if let Some(block) = info.events {
                    best_effort("event destroy", self.events.destroy_block(block));
                }
            }
            other => self.recv_proxy_free(other),
        }
    }

    pub(crate) fn recv_proxy_free(&mut self, resources: ProxyResources) {
        let runtime = self.runtime.clone();
        match resources {
            ProxyResources::Buffer(ptr) => best_effort("cudaFree", runtime.free(ptr)),
            ProxyResources::SharedRecv => best_effort("shared buffer release", self.recv_shared.release(&*runtime)),
            ProxyResources::Staged(info) => self.send_proxy_free(ProxyResources::Staged(info)),
            ProxyResources::Empty => {}
        }
    }
}
