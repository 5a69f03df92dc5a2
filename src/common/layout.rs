use std::mem::{offset_of, size_of};

use crate::common::error::{P2pError, Result};

/// Ring depth: number of in-flight steps per connection.
pub const NCCL_STEPS: usize = 8;

pub const NUM_PROTOCOLS: usize = 3;
pub const PROTO_LL: usize = 0;
pub const PROTO_LL128: usize = 1;
pub const PROTO_SIMPLE: usize = 2;

pub const CACHE_LINE_SIZE: usize = 128;
pub const MEM_ALIGN: usize = 4096;

/// Smallest allocation granularity that can be exported as an IPC handle.
pub const CUDA_IPC_MIN: usize = 2 * 1024 * 1024;

/// Size of the opaque connect slot exchanged between endpoints.
pub const CONNECT_SIZE: usize = 128;

/// Collective shapes (ring, tree, collnet) sharing one staging allocation.
pub const STAGING_SHAPES: usize = 3;

pub const DIRECT_WRITE: u32 = 0x01;
pub const DIRECT_READ: u32 = 0x02;
pub const IPC_WRITE: u32 = 0x08;
pub const IPC_READ: u32 = 0x10;

/// Header the receiver writes (head) and the sender polls.
#[repr(C, align(4096))]
pub struct SendMem {
    pub head: u64,
    _pad1: [u8; CACHE_LINE_SIZE - 8],
    pub ptr_exchange: u64,
    pub red_op_arg_exchange: [u64; 2],
    _pad2: [u8; CACHE_LINE_SIZE - 24],
    pub offs_fifo: [i32; NCCL_STEPS],
}

/// Header the sender writes (tail, sizes) and the receiver polls.
#[repr(C, align(4096))]
pub struct RecvMem {
    pub tail: u64,
    _pad1: [u8; CACHE_LINE_SIZE - 8],
    pub sizes_fifo: [i32; NCCL_STEPS],
    pub offs_fifo: [i32; NCCL_STEPS],
    pub flush: i32,
}

/// Shared-memory segment used in staged mode between the proxy and the
/// receiving GPU.
#[repr(C)]
pub struct P2pShm {
    pub send_mem: SendMem,
    pub recv_mem: RecvMem,
}

pub const SEND_MEM_SIZE: usize = size_of::<SendMem>();
pub const RECV_MEM_SIZE: usize = size_of::<RecvMem>();
pub const P2P_SHM_SIZE: usize = size_of::<P2pShm>();

pub const SEND_HEAD: usize = offset_of!(SendMem, head);
pub const SEND_PTR_EXCHANGE: usize = offset_of!(SendMem, ptr_exchange);
pub const SEND_RED_OP_ARG_EXCHANGE: usize = offset_of!(SendMem, red_op_arg_exchange);
pub const RECV_TAIL: usize = offset_of!(RecvMem, tail);
pub const RECV_SIZES_FIFO: usize = offset_of!(RecvMem, sizes_fifo);
pub const SHM_SEND_MEM: usize = offset_of!(P2pShm, send_mem);
pub const SHM_RECV_MEM: usize = offset_of!(P2pShm, recv_mem);

const _: () = assert!(SEND_MEM_SIZE == MEM_ALIGN);
const _: () = assert!(RECV_MEM_SIZE == MEM_ALIGN);

pub fn align_size(size: usize, align: usize) -> usize {
    size.div_ceil(align) * align
}

pub fn round_up(value: u64, multiple: u64) -> u64 {
    if multiple == 0 {
        return value;
    }
    value.div_ceil(multiple) * multiple
}

/// Byte offsets of every ring step for one channel inside the staging layout.
///
/// Consecutive `(step, channel)` pairs of one graph are adjacent, which is what
/// lets the copy engine merge runs of full slices. Offsets travel as `i32`, so
/// a layout reaching past `i32::MAX` bytes is refused.
pub fn step_offsets(
    step_size: usize,
    n_channels: usize,
    channel_id: usize,
    graph_id: usize,
) -> Result<[i32; NCCL_STEPS]> {
    let mut offsets = [0i32; NCCL_STEPS];
    for (i, off) in offsets.iter_mut().enumerate() {
        let bytes = (graph_id * NCCL_STEPS + i)
            .checked_mul(n_channels)
            .and_then(|slices| slices.checked_add(channel_id))
            .and_then(|slices| slices.checked_mul(step_size))
            .and_then(|bytes| i32::try_from(bytes).ok())
            .ok_or_else(|| {
                P2pError::protocol(format!(
                    "staging offset of step {} (channel {}, graph {}, {} channels of {} byte steps) exceeds i32",
                    i, channel_id, graph_id, n_channels, step_size
                ))
            })?;
        *off = bytes;
    }
    Ok(offsets)
}

/// Volatile load of a counter living in memory another agent writes.
///
/// # Safety
/// `ptr` must be valid and aligned for the duration of the call.
pub unsafe fn load_counter(ptr: *const u64) -> u64 {
    std::ptr::read_volatile(ptr)
}

/// # Safety
/// `ptr` must be valid and aligned for the duration of the call.
pub unsafe fn store_counter(ptr: *mut u64, value: u64) {
    std::ptr::write_volatile(ptr, value)
}
