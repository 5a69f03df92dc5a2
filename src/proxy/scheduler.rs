//! Copy-engine progress.
//!
//! For every staged send connection the proxy watches the tail the producing
//! GPU publishes, copies each finished slice from the staging buffer into the
//! peer's buffer, and republishes the tail to the consumer once the copy's
//! completion event resolves. In batched mode the slices seen during one pass
//! are grouped per destination and graph, and runs of full-size slices go out
//! as one copy with one event that every other slice of the run tracks.

use crate::common::error::{P2pError, Result};
use crate::common::layout::{round_up, NCCL_STEPS, PROTO_SIMPLE};
use crate::runtime::DevicePtr;

use super::P2pProxy;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpState {
    Ready,
    Progress,
    Done,
}

#[derive(Clone, Debug)]
pub struct ProxySubArgs {
    /// Proxy connection id of the staged send connection.
    pub connection: u64,
    pub channel_id: usize,
    pub nsteps: u64,
    pub base: u64,
    pub posted: u64,
    pub transmitted: u64,
    pub done: u64,
    finished: bool,
}

impl ProxySubArgs {
    pub fn new(connection: u64, channel_id: usize, nsteps: u64) -> ProxySubArgs {
        ProxySubArgs {
            connection,
            channel_id,
            nsteps,
            base: 0,
            posted: 0,
            transmitted: 0,
            done: 0,
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

#[derive(Clone, Debug)]
pub struct ProxyArgs {
    pub state: OpState,
    pub protocol: usize,
    pub slice_steps: u64,
    pub chunk_steps: u64,
    pub subs: Vec<ProxySubArgs>,
    /// Number of finished subs.
    pub done: usize,
    /// Nothing moved during the last call.
    pub idle: bool,
}

impl ProxyArgs {
    pub fn new(protocol: usize, slice_steps: u64, chunk_steps: u64, subs: Vec<ProxySubArgs>) -> ProxyArgs {
        ProxyArgs {
            state: OpState::Ready,
            protocol,
            slice_steps,
            chunk_steps,
            subs,
            done: 0,
            idle: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct PendingCopy {
    connection: u64,
    slot: usize,
    channel_id: usize,
}

#[derive(Debug)]
struct Batch {
    dst: DevicePtr,
    graph_id: i32,
    copies: Vec<PendingCopy>,
}

/// Slices waiting for the end-of-pass drain, grouped by destination buffer
/// and graph.
#[derive(Debug, Default)]
pub struct CopyBatcher {
    batches: Vec<Batch>,
}

impl CopyBatcher {
    fn push(&mut self, dst: DevicePtr, graph_id: i32, copy: PendingCopy) {
        match self.batches.iter_mut().find(|b| b.dst == dst && b.graph_id == graph_id) {
            Some(batch) => batch.copies.push(copy),
            None => self.batches.push(Batch {
                dst,
                graph_id,
                copies: vec![copy],
            }),
        }
    }

    pub fn pending(&self) -> usize {
        self.batches.iter().map(|b| b.copies.len()).sum()
    }

    pub(crate) fn discard(&mut self, connection: u64) {
        for batch in self.batches.iter_mut() {
            batch.copies.retain(|c| c.connection != connection);
        }
        self.batches.retain(|b| !b.copies.is_empty());
    }

    fn take(&mut self) -> Vec<Batch> {
        std::mem::take(&mut self.batches)
    }
}

impl P2pProxy {
    /// Advance one op without blocking.
    ///
    /// Batched slices are only issued by a call with `last_in_pass` set, so
    /// every pass over the active ops must end with one.
    pub fn progress(&mut self, args: &mut ProxyArgs, last_in_pass: bool) -> Result<()> {
        if args.state == OpState::Ready {
            for sub in args.subs.iter_mut() {
                let info = self.staged(sub.connection)?;
                sub.base = round_up(info.step, args.chunk_steps);
                sub.posted = 0;
                sub.transmitted = 0;
                sub.done = 0;
                sub.finished = false;
            }
            args.done = 0;
            args.state = OpState::Progress;
        }
        args.idle = true;
        if args.state == OpState::Progress {
            for sub in args.subs.iter_mut() {
                if sub.finished {
                    continue;
                }
                if args.protocol != PROTO_SIMPLE {
                    // Only SIMPLE goes through the copy engine.
                    self.staged_mut(sub.connection)?.step = sub.base + sub.nsteps;
                    sub.finished = true;
                    args.done += 1;
                    continue;
                }
                if self.progress_sub(sub, args.slice_steps)? {
                    args.idle = false;
                }
                if sub.finished {
                    args.done += 1;
                }
            }
            if args.done == args.subs.len() {
                args.state = OpState::Done;
            }
        }
        if last_in_pass && self.config.merge_memcpy {
            self.drain_batches()?;
        }
        Ok(())
    }

    /// One pass over `ops`, draining batched copies after the last one.
    pub fn progress_pass(&mut self, ops: &mut [ProxyArgs]) -> Result<()> {
        let last = ops.len().saturating_sub(1);
        for (i, args) in ops.iter_mut().enumerate() {
            self.progress(args, i == last)?;
        }
        if ops.is_empty() && self.config.merge_memcpy {
            self.drain_batches()?;
        }
        Ok(())
    }

    fn progress_sub(&mut self, sub: &mut ProxySubArgs, slice_steps: u64) -> Result<bool> {
        let merge = self.config.merge_memcpy;
        let P2pProxy {
            runtime,
            events,
            batcher,
            connections,
            ..
        } = self;
        let info = match connections.get_mut(&sub.connection).map(|c| &mut c.resources) {
            Some(super::allocator::ProxyResources::Staged(info)) => info,
            _ => {
                return Err(P2pError::protocol(format!(
                    "proxy connection {} has no staging",
                    sub.connection
                )))
            }
        };
        let (stream, block) = info.copy_target()?;
        let mut moved = false;

        while sub.done < sub.transmitted {
            let id = block.event(((sub.base + sub.done) % NCCL_STEPS as u64) as usize);
            if !events.query(id)? {
                break;
            }
            events.untrack(id)?;
            sub.done += slice_steps;
            info.publish_tail(sub.base + sub.done);
            moved = true;
        }
        if sub.done >= sub.nsteps {
            info.step = sub.base + sub.nsteps;
            sub.finished = true;
            return Ok(moved);
        }

        while sub.transmitted < sub.done + NCCL_STEPS as u64 && sub.transmitted < sub.nsteps {
            if info.producer_tail() <= sub.base + sub.transmitted {
                break;
            }
            let slot = ((sub.base + sub.transmitted) % NCCL_STEPS as u64) as usize;
            if merge {
                batcher.push(
                    info.recv_fifo,
                    info.graph_id,
                    PendingCopy {
                        connection: sub.connection,
                        slot,
                        channel_id: sub.channel_id,
                    },
                );
            } else {
                let size = slice_bytes(info.slice_size(slot))?;
                let (dst, src) = info.slot_span(slot);
                runtime
                    .memcpy_dtod_async(dst, src, size, stream)
                    .map_err(|e| copy_failed(sub.connection, size, e))?;
                events.record(block.event(slot), stream)?;
            }
            sub.transmitted += slice_steps;
            moved = true;
        }
        Ok(moved)
    }

    fn drain_batches(&mut self) -> Result<()> {
        let step_size = self.buff_sizes[PROTO_SIMPLE] / NCCL_STEPS;
        let n = self.n_channels;
        for batch in self.batcher.take() {
            // (slot, channel) grid in offset order: k = slot * n + channel.
            let mut grid: Vec<Option<(u64, usize)>> = vec![None; NCCL_STEPS * n];
            for copy in batch.copies.iter() {
                if copy.channel_id >= n {
                    return Err(P2pError::protocol(format!(
                        "channel {} beyond {} channels",
                        copy.channel_id, n
                    )));
                }
                let size = slice_bytes(self.staged(copy.connection)?.slice_size(copy.slot))?;
                grid[copy.slot * n + copy.channel_id] = Some((copy.connection, size));
            }
            log::trace!(
                "draining {} slices for graph {} into {:#x}",
                batch.copies.len(),
                batch.graph_id,
                batch.dst.addr()
            );

            let mut run_start: Option<usize> = None;
            let mut run_bytes = 0usize;
            for k in 0..grid.len() {
                let size = grid[k].map(|(_, s)| s).unwrap_or(0);
                let last = k == grid.len() - 1;
                if size < step_size || (size == step_size && last) {
                    match run_start.take() {
                        None => {
                            if let Some((conn, _)) = grid[k].filter(|_| size > 0) {
                                self.issue_copy(conn, k / n, size)?;
                            }
                        }
                        Some(start) => {
                            let (head_conn, _) = grid[start]
                                .ok_or_else(|| P2pError::protocol("copy run starts on an empty slice"))?;
                            let head = self.issue_copy(head_conn, start / n, run_bytes + size)?;
                            for m in start + 1..k {
                                self.track_slice(grid[m], m / n, head)?;
                            }
                            if size > 0 {
                                self.track_slice(grid[k], k / n, head)?;
                            }
                        }
                    }
                    run_bytes = 0;
                } else if size == step_size {
                    run_start.get_or_insert(k);
                    run_bytes += size;
                } else {
                    return Err(P2pError::protocol(format!(
                        "slice of {} bytes exceeds the {} byte step",
                        size, step_size
                    )));
                }
            }
        }
        Ok(())
    }

    /// Copy `size` bytes starting at `slot` of `conn` and arm that slot's event.
    fn issue_copy(&mut self, conn: u64, slot: usize, size: usize) -> Result<super::EventId> {
        let info = self.staged(conn)?;
        let (stream, block) = info.copy_target()?;
        let (dst, src) = info.slot_span(slot);
        self.runtime
            .memcpy_dtod_async(dst, src, size, stream)
            .map_err(|e| copy_failed(conn, size, e))?;
        let id = block.event(slot);
        self.events.record(id, stream)?;
        Ok(id)
    }

    fn track_slice(&mut self, cell: Option<(u64, usize)>, slot: usize, head: super::EventId) -> Result<()> {
        let (conn, _) = cell.ok_or_else(|| P2pError::protocol("copy run spans an empty slice"))?;
        let (_, block) = self.staged(conn)?.copy_target()?;
        self.events.track(block.event(slot), head)
    }
}

fn copy_failed(conn: u64, size: usize, e: P2pError) -> P2pError {
    log::error!("connection {}: copy of {} bytes failed: {}", conn, size, e);
    e
}

fn slice_bytes(size: i32) -> Result<usize> {
    usize::try_from(size).map_err(|_| P2pError::protocol(format!("negative slice size {}", size)))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::common::config::P2pConfig;
    use crate::common::layout::{step_offsets, RECV_SIZES_FIFO, RECV_TAIL};
    use crate::proxy::{decode_exact, ConnectRequest, ProxyMsg, StagingInfo};
    use crate::runtime::{DeviceRuntime, HostRuntime};

    const BUFF: [usize; 3] = [4096, 4096, 8192];
    const STEP: usize = 8192 / NCCL_STEPS;

    struct Rig {
        rt: Arc<HostRuntime>,
        proxy: P2pProxy,
        conns: Vec<(u64, StagingInfo)>,
        dst: DevicePtr,
    }

    fn rig(n_channels: usize, merge: bool) -> Rig {
        let rt = Arc::new(HostRuntime::new(vec![0x1000, 0x2000]));
        rt.set_manual_completion(true);
        let config = P2pConfig {
            merge_memcpy: merge,
            ..P2pConfig::default()
        };
        let mut proxy = P2pProxy::new(rt.clone(), config, 0, n_channels, BUFF);
        let dst = rt.alloc_zeroed(BUFF[PROTO_SIMPLE] * n_channels * 3).unwrap();
        let mut conns = Vec::new();
        for chan in 0..n_channels {
            let id = proxy.open(true);
            let info: StagingInfo = decode_exact(&proxy.handle(id, ProxyMsg::Setup, &[]).unwrap(), "staging").unwrap();
            let req = ConnectRequest {
                recv_fifo: dst,
                offsets: step_offsets(STEP, n_channels, chan, 0).unwrap(),
                graph_id: 0,
            };
            proxy
                .handle(id, ProxyMsg::Connect, &bincode::serialize(&req).unwrap())
                .unwrap();
            conns.push((id, info));
        }
        rt.reset_stats();
        Rig { rt, proxy, conns, dst }
    }

    fn produce(info: &StagingInfo, slot: usize, size: i32, tail: u64) {
        unsafe {
            let sizes = (info.ce_recv_mem.addr() as usize + RECV_SIZES_FIFO) as *mut i32;
            std::ptr::write_volatile(sizes.add(slot), size);
            std::ptr::write_volatile((info.ce_recv_mem.addr() as usize + RECV_TAIL) as *mut u64, tail);
        }
    }

    fn args(rig: &Rig, nsteps: u64) -> ProxyArgs {
        let subs = rig
            .conns
            .iter()
            .enumerate()
            .map(|(chan, (id, _))| ProxySubArgs::new(*id, chan, nsteps))
            .collect();
        ProxyArgs::new(PROTO_SIMPLE, 1, 1, subs)
    }

    fn consumer_tail(rig: &Rig, chan: usize) -> u64 {
        rig.proxy.proxy_info(rig.conns[chan].0).unwrap().consumer_tail()
    }

    #[test]
    fn full_cycle_on_two_channels_is_one_copy() {
        let mut rig = rig(2, true);
        for (_, info) in rig.conns.iter() {
            for slot in 0..NCCL_STEPS {
                produce(info, slot, STEP as i32, 8);
            }
        }
        let mut op = args(&rig, 8);
        rig.proxy.progress(&mut op, true).unwrap();
        let stats = rig.rt.stats();
        assert_eq!(stats.memcpy_async, 1);
        assert_eq!(stats.copy_sizes, vec![16 * STEP]);
        assert_eq!(stats.events_recorded, 1);
        assert_eq!(consumer_tail(&rig, 0), 0);

        rig.rt.complete_all();
        rig.proxy.progress(&mut op, true).unwrap();
        assert_eq!(consumer_tail(&rig, 0), 8);
        assert_eq!(consumer_tail(&rig, 1), 8);
        assert_eq!(op.state, OpState::Done);
        assert_eq!(rig.rt.stats().event_queries, 1);
    }

    #[test]
    fn partial_slice_terminates_run() {
        let mut rig = rig(1, true);
        let info = rig.conns[0].1;
        produce(&info, 0, STEP as i32, 1);
        produce(&info, 1, STEP as i32, 2);
        produce(&info, 2, 100, 3);
        let mut op = args(&rig, 4);
        rig.proxy.progress(&mut op, true).unwrap();
        // Two full slices and the partial terminator go out as one copy.
        assert_eq!(rig.rt.stats().copy_sizes, vec![2 * STEP + 100]);
        assert_eq!(rig.rt.stats().events_recorded, 1);
        assert_eq!(rig.proxy.batcher.pending(), 0);

        rig.rt.complete_all();
        rig.proxy.progress(&mut op, true).unwrap();
        assert_eq!(consumer_tail(&rig, 0), 3);
        assert_eq!(op.state, OpState::Progress);

        // A lone full slice ends at the empty cell after it.
        produce(&info, 3, STEP as i32, 4);
        rig.proxy.progress(&mut op, true).unwrap();
        assert_eq!(rig.rt.stats().copy_sizes, vec![2 * STEP + 100, STEP]);
        rig.rt.complete_all();
        rig.proxy.progress(&mut op, true).unwrap();
        assert_eq!(consumer_tail(&rig, 0), 4);
        assert_eq!(op.state, OpState::Done);
    }

    #[test]
    fn unbatched_copies_each_slice() {
        let mut rig = rig(2, false);
        for (_, info) in rig.conns.iter() {
            for slot in 0..4 {
                produce(info, slot, STEP as i32, 4);
            }
        }
        let mut op = args(&rig, 4);
        rig.proxy.progress(&mut op, true).unwrap();
        assert_eq!(rig.rt.stats().memcpy_async, 8);
        assert_eq!(rig.rt.stats().events_recorded, 8);
        rig.rt.complete_all();
        rig.proxy.progress(&mut op, true).unwrap();
        assert_eq!(consumer_tail(&rig, 0), 4);
        assert_eq!(consumer_tail(&rig, 1), 4);
        assert_eq!(op.state, OpState::Done);
    }

    #[test]
    fn transmit_waits_for_producer_and_ring_space() {
        let mut rig = rig(1, false);
        let info = rig.conns[0].1;
        let mut op = args(&rig, 12);
        rig.proxy.progress(&mut op, true).unwrap();
        assert!(op.idle);
        assert_eq!(op.subs[0].transmitted, 0);

        for slot in 0..NCCL_STEPS {
            produce(&info, slot, 16, 12);
        }
        rig.proxy.progress(&mut op, true).unwrap();
        // Ring depth bounds the slices in flight.
        assert_eq!(op.subs[0].transmitted, NCCL_STEPS as u64);
        rig.rt.complete_all();
        rig.proxy.progress(&mut op, true).unwrap();
        assert_eq!(op.subs[0].done, NCCL_STEPS as u64);
        assert_eq!(op.subs[0].transmitted, 12);
    }

    #[test]
    fn non_simple_protocols_finish_immediately_and_carry_step() {
        let mut rig = rig(1, true);
        let id = rig.conns[0].0;
        let mut op = ProxyArgs::new(0, 1, 4, vec![ProxySubArgs::new(id, 0, 6)]);
        rig.proxy.progress(&mut op, true).unwrap();
        assert_eq!(op.state, OpState::Done);
        assert_eq!(rig.proxy.proxy_info(id).unwrap().step(), 6);

        // The next op starts on the following chunk boundary.
        let mut next = ProxyArgs::new(0, 1, 4, vec![ProxySubArgs::new(id, 0, 0)]);
        rig.proxy.progress(&mut next, true).unwrap();
        assert_eq!(next.subs[0].base, 8);
        assert_eq!(next.state, OpState::Done);
        assert_eq!(rig.rt.stats().memcpy_async, 0);
    }

    #[test]
    fn oversized_slice_is_protocol_fault() {
        let mut rig = rig(1, true);
        let info = rig.conns[0].1;
        produce(&info, 0, STEP as i32 + 1, 1);
        let mut op = args(&rig, 1);
        assert!(matches!(
            rig.proxy.progress(&mut op, true),
            Err(P2pError::Protocol { .. })
        ));
    }

    #[test]
    fn copied_bytes_land_at_matching_offsets() {
        let mut rig = rig(2, true);
        let (_, info) = rig.conns[1];
        let offsets = step_offsets(STEP, 2, 1, 0).unwrap();
        let src = info.ce_dev_buff.add(offsets[0] as usize);
        rig.rt.memcpy_htod(src, &[7u8; 64]).unwrap();
        produce(&info, 0, 64, 1);
        let mut op = ProxyArgs::new(PROTO_SIMPLE, 1, 1, vec![ProxySubArgs::new(rig.conns[1].0, 1, 1)]);
        rig.proxy.progress_pass(std::slice::from_mut(&mut op)).unwrap();
        rig.rt.complete_all();
        rig.proxy.progress_pass(std::slice::from_mut(&mut op)).unwrap();
        let landed = unsafe { std::slice::from_raw_parts(rig.dst.add(offsets[0] as usize).addr() as *const u8, 64) };
        assert!(landed.iter().all(|&b| b == 7));
        assert_eq!(consumer_tail(&rig, 1), 1);
    }
}
