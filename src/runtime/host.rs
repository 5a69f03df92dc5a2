use std::alloc::{self, Layout};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crate::common::error::{P2pError, Result};
use crate::common::layout::MEM_ALIGN;

use super::{DevicePtr, DeviceRuntime, EventHandle, EventStatus, HostAlloc, IpcHandle, PeerAccess, StreamHandle};

// Native codes reported by the host backend, numbered like the CUDA runtime.
const ERR_INVALID_VALUE: i32 = 1;
const ERR_MEMORY_ALLOCATION: i32 = 2;
const ERR_INVALID_DEVICE: i32 = 101;
const ERR_INVALID_RESOURCE_HANDLE: i32 = 400;
const ERR_NOT_SUPPORTED: i32 = 801;

const IPC_MAGIC: u64 = 0x6e63_636c_7032_7000;

/// Call counters, used to observe what the transport asked the device to do.
#[derive(Default, Clone, Debug)]
pub struct HostStats {
    pub allocations: usize,
    pub frees: usize,
    pub peer_queries: usize,
    pub peer_enables: usize,
    pub ipc_exports: usize,
    pub ipc_imports: usize,
    pub ipc_closes: usize,
    pub memcpy_async: usize,
    pub copy_sizes: Vec<usize>,
    pub events_recorded: usize,
    pub event_queries: usize,
}

enum StreamOp {
    Copy { dst: u64, src: u64, size: usize },
    Record(u64),
}

struct HostState {
    allocations: HashMap<u64, Layout>,
    registered: HashMap<u64, usize>,
    imports: HashMap<u64, usize>,
    streams: HashMap<u64, VecDeque<StreamOp>>,
    // event id -> pending
    events: HashMap<u64, bool>,
    peers_enabled: HashSet<(i32, i32)>,
    peers_denied: HashSet<(i32, i32)>,
    peer_query_fails: bool,
    ipc_supported: bool,
    manual_completion: bool,
    alloc_delay: Option<Duration>,
    next_handle: u64,
    stats: HostStats,
}

/// Host-memory implementation of the device surface.
///
/// Device pointers are plain host addresses, so every "device" in the
/// process shares one address space and IPC import hands back the exporting
/// address. Stream work runs immediately unless manual completion is on, in
/// which case copies and event records queue up until `complete_all`.
pub struct HostRuntime {
    bus_ids: Vec<i64>,
    version: i32,
    state: Mutex<HostState>,
}

impl HostRuntime {
    pub fn new(bus_ids: Vec<i64>) -> HostRuntime {
        HostRuntime {
            bus_ids,
            version: 12040,
            state: Mutex::new(HostState {
                allocations: HashMap::new(),
                registered: HashMap::new(),
                imports: HashMap::new(),
                streams: HashMap::new(),
                events: HashMap::new(),
                peers_enabled: HashSet::new(),
                peers_denied: HashSet::new(),
                peer_query_fails: false,
                ipc_supported: true,
                manual_completion: false,
                alloc_delay: None,
                next_handle: 1,
                stats: HostStats::default(),
            }),
        }
    }

    pub fn with_version(mut self, version: i32) -> HostRuntime {
        self.version = version;
        self
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_manual_completion(&self, manual: bool) {
        self.state().manual_completion = manual;
    }

    /// Make every `alloc_zeroed` sleep first, outside the state lock.
    pub fn set_alloc_delay(&self, delay: Option<Duration>) {
        self.state().alloc_delay = delay;
    }

    pub fn set_ipc_supported(&self, supported: bool) {
        self.state().ipc_supported = supported;
    }

    pub fn set_peer_query_fails(&self, fails: bool) {
        self.state().peer_query_fails = fails;
    }

    pub fn deny_peer(&self, dev: i32, peer: i32) {
        let mut state = self.state();
        state.peers_denied.insert((dev, peer));
        state.peers_denied.insert((peer, dev));
    }

    pub fn stats(&self) -> HostStats {
        self.state().stats.clone()
    }

    pub fn reset_stats(&self) {
        self.state().stats = HostStats::default();
    }

    pub fn live_allocations(&self) -> usize {
        self.state().allocations.len()
    }

    pub fn open_imports(&self) -> usize {
        self.state().imports.values().sum()
    }

    /// Run every queued stream operation in submission order.
    pub fn complete_all(&self) {
        let mut state = self.state();
        let streams: Vec<u64> = state.streams.keys().copied().collect();
        for id in streams {
            let ops: Vec<StreamOp> = match state.streams.get_mut(&id) {
                Some(queue) => queue.drain(..).collect(),
                None => continue,
            };
            for op in ops {
                Self::execute(&mut state, op);
            }
        }
    }

    fn execute(state: &mut HostState, op: StreamOp) {
        match op {
            StreamOp::Copy { dst, src, size } => unsafe {
                std::ptr::copy(src as *const u8, dst as *mut u8, size);
            },
            StreamOp::Record(event) => {
                if let Some(pending) = state.events.get_mut(&event) {
                    *pending = false;
                }
            }
        }
    }

    fn submit(state: &mut HostState, stream: StreamHandle, op: StreamOp) -> Result<()> {
        if state.manual_completion {
            let queue = state
                .streams
                .get_mut(&stream.0)
                .ok_or_else(|| P2pError::native("cudaStreamSubmit", ERR_INVALID_RESOURCE_HANDLE))?;
            queue.push_back(op);
        } else {
            if !state.streams.contains_key(&stream.0) {
                return Err(P2pError::native("cudaStreamSubmit", ERR_INVALID_RESOURCE_HANDLE));
            }
            Self::execute(state, op);
        }
        Ok(())
    }

    fn handle(state: &mut HostState) -> u64 {
        let h = state.next_handle;
        state.next_handle += 1;
        h
    }

    fn raw_alloc(state: &mut HostState, size: usize) -> Result<u64> {
        let layout = Layout::from_size_align(size.max(1), MEM_ALIGN)
            .map_err(|_| P2pError::native("cudaMalloc", ERR_INVALID_VALUE))?;
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(P2pError::native("cudaMalloc", ERR_MEMORY_ALLOCATION));
        }
        state.allocations.insert(ptr as u64, layout);
        state.stats.allocations += 1;
        Ok(ptr as u64)
    }

    fn raw_free(state: &mut HostState, addr: u64, call: &'static str) -> Result<()> {
        let layout = state
            .allocations
            .remove(&addr)
            .ok_or_else(|| P2pError::native(call, ERR_INVALID_VALUE))?;
        unsafe { alloc::dealloc(addr as *mut u8, layout) };
        state.stats.frees += 1;
        Ok(())
    }
}

impl DeviceRuntime for HostRuntime {
    fn version(&self) -> i32 {
        self.version
    }

    fn device_count(&self) -> Result<usize> {
        Ok(self.bus_ids.len())
    }

    fn device_bus_id(&self, dev: usize) -> Result<i64> {
        self.bus_ids
            .get(dev)
            .copied()
            .ok_or_else(|| P2pError::native("cudaDeviceGetPCIBusId", ERR_INVALID_DEVICE))
    }

    fn can_access_peer(&self, dev: i32, peer: i32) -> Result<bool> {
        let mut state = self.state();
        state.stats.peer_queries += 1;
        if state.peer_query_fails {
            return Err(P2pError::native("cudaDeviceCanAccessPeer", ERR_INVALID_DEVICE));
        }
        if dev < 0 || peer < 0 || dev as usize >= self.bus_ids.len() || peer as usize >= self.bus_ids.len() {
            return Err(P2pError::native("cudaDeviceCanAccessPeer", ERR_INVALID_DEVICE));
        }
        Ok(dev != peer && !state.peers_denied.contains(&(dev, peer)))
    }

    fn enable_peer_access(&self, dev: i32, peer: i32) -> Result<PeerAccess> {
        let mut state = self.state();
        if state.peers_denied.contains(&(dev, peer)) {
            return Err(P2pError::native("cudaDeviceEnablePeerAccess", ERR_NOT_SUPPORTED));
        }
        state.stats.peer_enables += 1;
        if state.peers_enabled.insert((dev, peer)) {
            Ok(PeerAccess::Enabled)
        } else {
            Ok(PeerAccess::AlreadyEnabled)
        }
    }

    fn alloc_zeroed(&self, size: usize) -> Result<DevicePtr> {
        let delay = self.state().alloc_delay;
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        let mut state = self.state();
        Self::raw_alloc(&mut state, size).map(DevicePtr)
    }

    fn free(&self, ptr: DevicePtr) -> Result<()> {
        let mut state = self.state();
        Self::raw_free(&mut state, ptr.0, "cudaFree")
    }

    fn host_alloc_zeroed(&self, size: usize) -> Result<HostAlloc> {
        let mut state = self.state();
        let addr = Self::raw_alloc(&mut state, size)?;
        Ok(HostAlloc {
            host: addr as *mut u8,
            dev: DevicePtr(addr),
            size,
        })
    }

    fn host_free(&self, alloc: &HostAlloc) -> Result<()> {
        let mut state = self.state();
        Self::raw_free(&mut state, alloc.host as u64, "cudaFreeHost")
    }

    fn host_register(&self, host: *mut u8, size: usize) -> Result<DevicePtr> {
        if host.is_null() {
            return Err(P2pError::native("cudaHostRegister", ERR_INVALID_VALUE));
        }
        self.state().registered.insert(host as u64, size);
        Ok(DevicePtr(host as u64))
    }

    fn host_unregister(&self, host: *mut u8) -> Result<()> {
        match self.state().registered.remove(&(host as u64)) {
            Some(_) => Ok(()),
            None => Err(P2pError::native("cudaHostUnregister", ERR_INVALID_VALUE)),
        }
    }

    fn ipc_get_handle(&self, ptr: DevicePtr) -> Result<IpcHandle> {
        let mut state = self.state();
        state.stats.ipc_exports += 1;
        if !state.ipc_supported {
            return Err(P2pError::native("cudaIpcGetMemHandle", ERR_NOT_SUPPORTED));
        }
        let layout = state
            .allocations
            .get(&ptr.0)
            .ok_or_else(|| P2pError::native("cudaIpcGetMemHandle", ERR_INVALID_VALUE))?;
        let mut words = [0u64; 8];
        words[0] = IPC_MAGIC;
        words[1] = std::process::id() as u64;
        words[2] = ptr.0;
        words[3] = layout.size() as u64;
        Ok(IpcHandle(words))
    }

    fn ipc_open_handle(&self, handle: &IpcHandle) -> Result<DevicePtr> {
        let mut state = self.state();
        if handle.0[0] != IPC_MAGIC || !state.allocations.contains_key(&handle.0[2]) {
            return Err(P2pError::native("cudaIpcOpenMemHandle", ERR_INVALID_RESOURCE_HANDLE));
        }
        let addr = handle.0[2];
        *state.imports.entry(addr).or_insert(0) += 1;
        state.stats.ipc_imports += 1;
        Ok(DevicePtr(addr))
    }

    fn ipc_close_handle(&self, ptr: DevicePtr) -> Result<()> {
        let mut state = self.state();
        let count = state
            .imports
            .get_mut(&ptr.0)
            .ok_or_else(|| P2pError::native("cudaIpcCloseMemHandle", ERR_INVALID_VALUE))?;
        *count -= 1;
        if *count == 0 {
            state.imports.remove(&ptr.0);
        }
        state.stats.ipc_closes += 1;
        Ok(())
    }

    fn stream_create(&self) -> Result<StreamHandle> {
        let mut state = self.state();
        let id = Self::handle(&mut state);
        state.streams.insert(id, VecDeque::new());
        Ok(StreamHandle(id))
    }

    fn stream_destroy(&self, stream: StreamHandle) -> Result<()> {
        let mut state = self.state();
        match state.streams.remove(&stream.0) {
            Some(queue) => {
                // Outstanding work still lands before the stream goes away.
                for op in queue {
                    Self::execute(&mut state, op);
                }
                Ok(())
            }
            None => Err(P2pError::native("cudaStreamDestroy", ERR_INVALID_RESOURCE_HANDLE)),
        }
    }

    fn event_create(&self) -> Result<EventHandle> {
        let mut state = self.state();
        let id = Self::handle(&mut state);
        state.events.insert(id, false);
        Ok(EventHandle(id))
    }

    fn event_destroy(&self, event: EventHandle) -> Result<()> {
        match self.state().events.remove(&event.0) {
            Some(_) => Ok(()),
            None => Err(P2pError::native("cudaEventDestroy", ERR_INVALID_RESOURCE_HANDLE)),
        }
    }

    fn event_record(&self, event: EventHandle, stream: StreamHandle) -> Result<()> {
        let mut state = self.state();
        match state.events.get_mut(&event.0) {
            Some(pending) => *pending = true,
            None => return Err(P2pError::native("cudaEventRecord", ERR_INVALID_RESOURCE_HANDLE)),
        }
        state.stats.events_recorded += 1;
        Self::submit(&mut state, stream, StreamOp::Record(event.0))
    }

    fn event_query(&self, event: EventHandle) -> Result<EventStatus> {
        let mut state = self.state();
        state.stats.event_queries += 1;
        match state.events.get(&event.0) {
            Some(true) => Ok(EventStatus::NotReady),
            Some(false) => Ok(EventStatus::Ready),
            None => Err(P2pError::native("cudaEventQuery", ERR_INVALID_RESOURCE_HANDLE)),
        }
    }

    fn memcpy_dtod_async(&self, dst: DevicePtr, src: DevicePtr, size: usize, stream: StreamHandle) -> Result<()> {
        if size > 0 && (dst.is_null() || src.is_null()) {
            return Err(P2pError::native("cudaMemcpyAsync", ERR_INVALID_VALUE));
        }
        let mut state = self.state();
        state.stats.memcpy_async += 1;
        state.stats.copy_sizes.push(size);
        Self::submit(
            &mut state,
            stream,
            StreamOp::Copy {
                dst: dst.0,
                src: src.0,
                size,
            },
        )
    }

    fn memcpy_htod(&self, dst: DevicePtr, src: &[u8]) -> Result<()> {
        if dst.is_null() {
            return Err(P2pError::native("cudaMemcpy", ERR_INVALID_VALUE));
        }
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), dst.0 as *mut u8, src.len()) };
        Ok(())
    }
}

impl Drop for HostRuntime {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        for (addr, layout) in state.allocations.drain() {
            unsafe { alloc::dealloc(addr as *mut u8, layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_completion_defers_copies_and_events() {
        let rt = HostRuntime::new(vec![0x1000, 0x2000]);
        rt.set_manual_completion(true);
        let src = rt.alloc_zeroed(64).unwrap();
        let dst = rt.alloc_zeroed(64).unwrap();
        unsafe { std::ptr::write_bytes(src.0 as *mut u8, 0xab, 64) };
        let stream = rt.stream_create().unwrap();
        let event = rt.event_create().unwrap();
        rt.memcpy_dtod_async(dst, src, 64, stream).unwrap();
        rt.event_record(event, stream).unwrap();

        assert_eq!(rt.event_query(event).unwrap(), EventStatus::NotReady);
        assert_eq!(unsafe { *(dst.0 as *const u8) }, 0);

        rt.complete_all();
        assert_eq!(rt.event_query(event).unwrap(), EventStatus::Ready);
        assert_eq!(unsafe { *(dst.0 as *const u8).add(63) }, 0xab);
    }

    #[test]
    fn ipc_round_trip_counts_imports() {
        let rt = HostRuntime::new(vec![0x1000]);
        let ptr = rt.alloc_zeroed(128).unwrap();
        let handle = rt.ipc_get_handle(ptr).unwrap();
        let mapped = rt.ipc_open_handle(&handle).unwrap();
        assert_eq!(mapped, ptr);
        assert_eq!(rt.open_imports(), 1);
        rt.ipc_close_handle(mapped).unwrap();
        assert_eq!(rt.open_imports(), 0);
        assert!(rt.ipc_close_handle(mapped).is_err());
    }

    #[test]
    fn ipc_export_can_be_unsupported() {
        let rt = HostRuntime::new(vec![0x1000]);
        rt.set_ipc_supported(false);
        let ptr = rt.alloc_zeroed(128).unwrap();
        assert!(rt.ipc_get_handle(ptr).is_err());
    }

    #[test]
    fn peer_access_is_idempotent() {
        let rt = HostRuntime::new(vec![0x1000, 0x2000]);
        assert!(rt.can_access_peer(0, 1).unwrap());
        assert!(!rt.can_access_peer(0, 0).unwrap());
        assert_eq!(rt.enable_peer_access(0, 1).unwrap(), PeerAccess::Enabled);
        assert_eq!(rt.enable_peer_access(0, 1).unwrap(), PeerAccess::AlreadyEnabled);
        rt.deny_peer(0, 1);
        assert!(!rt.can_access_peer(1, 0).unwrap());
    }

    #[test]
    fn free_of_unknown_pointer_is_native_fault() {
        let rt = HostRuntime::new(vec![0x1000]);
        let err = rt.free(DevicePtr(0xdead_0000)).unwrap_err();
        assert!(matches!(err, P2pError::Native { call: "cudaFree", .. }));
    }
}
