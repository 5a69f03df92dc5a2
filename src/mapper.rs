use crate::common::error::{P2pError, Result};
use crate::descriptor::BufferDescriptor;
use crate::runtime::{DevicePtr, DeviceRuntime, PeerAccess};
use crate::topo::PeerInfo;

/// A peer buffer resolved into a locally usable address.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MappedBuffer {
    pub ptr: DevicePtr,
    /// Imported mapping that must be closed at teardown.
    pub import: Option<DevicePtr>,
}

/// Resolve `desc`, exported by `peer`, into an address `my` can use.
pub fn p2p_map(runtime: &dyn DeviceRuntime, my: &PeerInfo, peer: &PeerInfo, desc: &BufferDescriptor) -> Result<MappedBuffer> {
    match desc {
        BufferDescriptor::Direct(ptr) => {
            if my.pid_hash != peer.pid_hash {
                return Err(P2pError::protocol(format!(
                    "direct pointer from rank {} used outside its process by rank {}",
                    peer.rank, my.rank
                )));
            }
            if peer.cuda_dev != my.cuda_dev {
                match runtime.enable_peer_access(my.cuda_dev, peer.cuda_dev) {
                    Ok(PeerAccess::Enabled) => {
                        log::trace!("enabled peer access dev {} -> dev {}", my.cuda_dev, peer.cuda_dev);
                    }
                    Ok(PeerAccess::AlreadyEnabled) => {}
                    Err(e) => {
                        log::warn!("failed to peer with device {}(={:x}): {}", peer.cuda_dev, peer.bus_id, e);
                        return Err(e.on_device(peer.cuda_dev, peer.bus_id));
                    }
                }
            }
            Ok(MappedBuffer {
                ptr: *ptr,
                import: None,
            })
        }
        BufferDescriptor::Ipc(handle) => {
            log::trace!("{:?}", handle);
            let ptr = runtime
                .ipc_open_handle(handle)
                .map_err(|e| {
                    let e = e.on_device(my.cuda_dev, my.bus_id);
                    log::error!("importing buffer of rank {} failed: {}", peer.rank, e);
                    e
                })?;
            Ok(MappedBuffer {
                ptr,
                import: Some(ptr),
            })
        }
    }
}

/// Close an imported mapping, if any. Failures are logged, not escalated.
pub fn release_import(runtime: &dyn DeviceRuntime, import: Option<DevicePtr>) {
    if let Some(ptr) = import {
        if let Err(e) = runtime.ipc_close_handle(ptr) {
            log::warn!("closing imported mapping {:#x} failed: {}", ptr.addr(), e);
        }
    }
}
