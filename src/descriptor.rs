//! Records that cross the endpoint boundary during negotiation.

use serde::{Deserialize, Serialize};

use crate::common::error::{P2pError, Result};
use crate::common::layout::CONNECT_SIZE;
use crate::runtime::{DevicePtr, IpcHandle};
use crate::shm::ShmName;
use crate::topo::PeerInfo;

/// How a consumer reaches a device allocation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferDescriptor {
    /// Same process as the owner: the address is directly usable.
    Direct(DevicePtr),
    /// Different process: the handle must be imported, and the mapping released.
    Ipc(IpcHandle),
}

/// What the allocator hands back: the owner's pointer and its exported handle.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExportedBuffer {
    pub ptr: DevicePtr,
    pub ipc: IpcHandle,
}

impl BufferDescriptor {
    /// Pick the form `consumer` can use for a buffer allocated by `owner`.
    pub fn for_consumer(owner: &PeerInfo, consumer: &PeerInfo, exported: &ExportedBuffer) -> BufferDescriptor {
        if owner.pid_hash == consumer.pid_hash {
            BufferDescriptor::Direct(exported.ptr)
        } else {
            BufferDescriptor::Ipc(exported.ipc)
        }
    }
}

/// Name and size of the staged-mode shared-memory segment.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct StagingSegment {
    pub name: ShmName,
    pub size: u32,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectDescriptor {
    /// Rank owning the buffer: the setup rank, or the relaying rank.
    pub rank: i32,
    pub read: bool,
    pub graph_id: i32,
    pub channel_id: i32,
    /// Absent only for a staged sender, whose peer maps the segment instead.
    pub buffer: Option<BufferDescriptor>,
    pub staging: Option<StagingSegment>,
}

impl ConnectDescriptor {
    /// Largest fixed-int encoding: scalars, tagged buffer with a 64-byte
    /// handle, tagged segment name + size.
    pub const MAX_ENCODED_LEN: usize = 4 + 1 + 4 + 4 + (1 + 4 + 64) + (1 + 7 + 4);

    pub fn encode_into(&self, slot: &mut ConnectSlot) -> Result<()> {
        let bytes = bincode::serialize(self)?;
        if bytes.len() > CONNECT_SIZE {
            return Err(P2pError::protocol(format!(
                "connect descriptor of {} bytes exceeds the {} byte slot",
                bytes.len(),
                CONNECT_SIZE
            )));
        }
        slot.0 = [0u8; CONNECT_SIZE];
        slot.0[..bytes.len()].copy_from_slice(&bytes);
        Ok(())
    }

    pub fn decode(slot: &ConnectSlot) -> Result<ConnectDescriptor> {
        Ok(bincode::deserialize(&slot.0)?)
    }
}

const _: () = assert!(ConnectDescriptor::MAX_ENCODED_LEN <= CONNECT_SIZE);

/// Fixed-size connect record handed to the rendezvous layer verbatim.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ConnectSlot(pub [u8; CONNECT_SIZE]);

impl Default for ConnectSlot {
    fn default() -> Self {
        ConnectSlot([0u8; CONNECT_SIZE])
    }
}

impl std::fmt::Debug for ConnectSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConnectSlot({} bytes)", CONNECT_SIZE)
    }
}
