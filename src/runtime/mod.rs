//! Device capability surface consumed by the transport.
//!
//! The transport never talks to a GPU driver directly: allocation, IPC
//! export/import, streams, events and copies all go through `DeviceRuntime`.
//! `HostRuntime` backs the surface with host memory so the whole negotiation
//! and copy pipeline runs (and is tested) without a device.

use std::fmt::Debug;

use serde::{Deserialize, Serialize};

use crate::common::error::Result;

pub mod host;

pub use host::{HostRuntime, HostStats};

/// Device virtual address as seen by the owning process.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    pub const NULL: DevicePtr = DevicePtr(0);

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    pub fn add(&self, bytes: usize) -> DevicePtr {
        DevicePtr(self.0 + bytes as u64)
    }

    pub fn addr(&self) -> u64 {
        self.0
    }
}

/// Opaque 64-byte inter-process memory handle.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct IpcHandle(pub [u64; 8]);

impl Debug for IpcHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IPC:")?;
        for word in self.0.iter() {
            write!(f, " {:016x}", word)?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamHandle(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EventHandle(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventStatus {
    Ready,
    NotReady,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerAccess {
    Enabled,
    AlreadyEnabled,
}

/// Pinned host allocation mapped into the device address space.
#[derive(Debug)]
pub struct HostAlloc {
    pub host: *mut u8,
    pub dev: DevicePtr,
    pub size: usize,
}
unsafe impl Send for HostAlloc {}
unsafe impl Sync for HostAlloc {}

pub trait DeviceRuntime: Send + Sync {
    /// Runtime version, `major * 1000 + minor * 10`.
    fn version(&self) -> i32;
    fn device_count(&self) -> Result<usize>;
    fn device_bus_id(&self, dev: usize) -> Result<i64>;

    fn can_access_peer(&self, dev: i32, peer: i32) -> Result<bool>;
    fn enable_peer_access(&self, dev: i32, peer: i32) -> Result<PeerAccess>;

    fn alloc_zeroed(&self, size: usize) -> Result<DevicePtr>;
    fn free(&self, ptr: DevicePtr) -> Result<()>;
    fn host_alloc_zeroed(&self, size: usize) -> Result<HostAlloc>;
    fn host_free(&self, alloc: &HostAlloc) -> Result<()>;
    /// Map an existing host range for device access, returning its device alias.
    fn host_register(&self, host: *mut u8, size: usize) -> Result<DevicePtr>;
    fn host_unregister(&self, host: *mut u8) -> Result<()>;

    fn ipc_get_handle(&self, ptr: DevicePtr) -> Result<IpcHandle>;
    fn ipc_open_handle(&self, handle: &IpcHandle) -> Result<DevicePtr>;
    fn ipc_close_handle(&self, ptr: DevicePtr) -> Result<()>;

    fn stream_create(&self) -> Result<StreamHandle>;
    fn stream_destroy(&self, stream: StreamHandle) -> Result<()>;
    fn event_create(&self) -> Result<EventHandle>;
    fn event_destroy(&self, event: EventHandle) -> Result<()>;
    fn event_record(&self, event: EventHandle, stream: StreamHandle) -> Result<()>;
    /// Non-blocking completion poll.
    fn event_query(&self, event: EventHandle) -> Result<EventStatus>;

    fn memcpy_dtod_async(&self, dst: DevicePtr, src: DevicePtr, size: usize, stream: StreamHandle) -> Result<()>;
    fn memcpy_htod(&self, dst: DevicePtr, src: &[u8]) -> Result<()>;
}
