//! In-process transport and buffer utilities for tests and benches.
//!
//! [`LoopbackFabric`] implements the transport seam entirely in memory:
//! queue pairs registered on the same fabric deliver to each other by
//! copying between their arenas, and every submitted batch is logged so
//! tests can count doorbell rings. No hardware is required.

use std::alloc::Layout;
use std::collections::{HashMap, VecDeque};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

use crate::arena::Arena;
use crate::endpoint::{PeerEndpoint, QpIdentity};
use crate::error::{Error, Result};
use crate::transport::{
    full_access, AccessFlags, MemoryRegionAttr, RdmaTransport, WcOpcode, WcStatus, WorkCompletion,
    WorkRequest, WrOpcode,
};

/// Owned, page-aligned, zeroed buffer backing an [`Arena`] in tests.
pub struct ArenaBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

// The buffer may be handed to a broker thread other than its creator.
unsafe impl Send for ArenaBuffer {}

impl ArenaBuffer {
    pub fn new(len: usize) -> Self {
        let layout = Layout::from_size_align(len, 4096).expect("bad arena layout");
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        Self {
            ptr: NonNull::new(ptr).expect("arena allocation failed"),
            layout,
        }
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    pub fn base_addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    /// An arena over this buffer. The buffer must outlive the arena and
    /// the caller must not create overlapping mutable views.
    pub fn arena(&self) -> Arena {
        unsafe { Arena::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }

    pub fn slice(&self, offset: usize, len: usize) -> &[u8] {
        assert!(offset + len <= self.len());
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().add(offset), len) }
    }

    pub fn write(&mut self, offset: usize, bytes: &[u8]) {
        assert!(offset + bytes.len() <= self.len());
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.ptr.as_ptr().add(offset),
                bytes.len(),
            );
        }
    }
}

impl Drop for ArenaBuffer {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

#[derive(Debug, Clone, Copy)]
struct RecvSlot {
    laddr: u64,
    len: u32,
    slot: u64,
}

/// A descriptor-consuming operation waiting for the receiver to repost
/// credit, like a hardware receiver-not-ready stall.
#[derive(Debug, Clone, Copy)]
struct StalledSend {
    origin: QpIdentity,
    wr: WorkRequest,
}

#[derive(Default)]
struct QpState {
    recv_queue: VecDeque<RecvSlot>,
    send_cq: VecDeque<WorkCompletion>,
    recv_cq: VecDeque<WorkCompletion>,
    /// Send completions held back while deferred mode is on.
    deferred: VecDeque<WorkCompletion>,
    /// Inbound operations waiting for receive credit.
    stalled_in: VecDeque<StalledSend>,
}

#[derive(Default)]
struct FabricState {
    regions: HashMap<u64, MemoryRegionAttr>,
    qps: HashMap<QpIdentity, QpState>,
    defer_sends: bool,
    submissions: Vec<(QpIdentity, usize)>,
}

impl FabricState {
    fn complete_send(&mut self, origin: QpIdentity, wc: WorkCompletion) {
        let defer = self.defer_sends;
        let qp = self.qps.get_mut(&origin).expect("unknown origin qp");
        if defer {
            qp.deferred.push_back(wc);
        } else {
            qp.send_cq.push_back(wc);
        }
    }

    /// Consume one of `receiver`'s descriptors for `wr` and deliver both
    /// sides' completions. The caller has checked that credit exists.
    fn deliver(&mut self, origin: QpIdentity, receiver: QpIdentity, wr: WorkRequest) {
        let desc = self
            .qps
            .get_mut(&receiver)
            .and_then(|q| q.recv_queue.pop_front())
            .expect("delivery without receive descriptor");
        if matches!(wr.opcode, WrOpcode::Send | WrOpcode::SendWithImm) {
            assert!(wr.len <= desc.len, "payload exceeds receive buffer");
            unsafe {
                std::ptr::copy_nonoverlapping(
                    wr.laddr as *const u8,
                    desc.laddr as *mut u8,
                    wr.len as usize,
                );
            }
        }
        self.qps
            .get_mut(&receiver)
            .unwrap()
            .recv_cq
            .push_back(WorkCompletion {
                wr_id: desc.slot,
                opcode: WcOpcode::Recv,
                status: WcStatus::Success,
                byte_len: wr.len,
                imm: wr.imm,
            });
        let opcode = match wr.opcode {
            WrOpcode::Send | WrOpcode::SendWithImm => WcOpcode::Send,
            _ => WcOpcode::Write,
        };
        self.complete_send(
            origin,
            WorkCompletion {
                wr_id: wr.wr_id,
                opcode,
                status: WcStatus::Success,
                byte_len: wr.len,
                imm: wr.imm,
            },
        );
    }

    fn has_credit(&self, receiver: QpIdentity) -> bool {
        self.qps
            .get(&receiver)
            .is_some_and(|q| !q.recv_queue.is_empty())
    }

    fn park(&mut self, origin: QpIdentity, receiver: QpIdentity, wr: WorkRequest) {
        self.qps
            .get_mut(&receiver)
            .expect("unknown remote qp")
            .stalled_in
            .push_back(StalledSend { origin, wr });
    }
}

/// An in-memory fabric connecting loopback transports.
#[derive(Clone, Default)]
pub struct LoopbackFabric {
    state: Arc<Mutex<FabricState>>,
}

impl LoopbackFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport endpoint on this fabric.
    pub fn transport(&self) -> LoopbackTransport {
        LoopbackTransport {
            state: Arc::clone(&self.state),
        }
    }

    /// While on, send-class completions are parked instead of delivered;
    /// data still moves immediately. Used to hold a window full.
    pub fn defer_send_completions(&self, defer: bool) {
        self.state.lock().unwrap().defer_sends = defer;
    }

    /// Deliver every parked send-class completion.
    pub fn release_send_completions(&self) {
        let mut state = self.state.lock().unwrap();
        for qp in state.qps.values_mut() {
            while let Some(wc) = qp.deferred.pop_front() {
                qp.send_cq.push_back(wc);
            }
        }
    }

    /// Every batch submission so far, as (submitting QP, batch length).
    pub fn submissions(&self) -> Vec<(QpIdentity, usize)> {
        self.state.lock().unwrap().submissions.clone()
    }

    /// Enqueue a crafted completion on `id`'s send completion queue, for
    /// driving failure paths that normal traffic never produces.
    pub fn inject_send_completion(&self, id: QpIdentity, wc: WorkCompletion) {
        self.state
            .lock()
            .unwrap()
            .qps
            .get_mut(&id)
            .expect("unknown qp")
            .send_cq
            .push_back(wc);
    }

    /// Enqueue a crafted completion on `id`'s receive completion queue.
    pub fn inject_recv_completion(&self, id: QpIdentity, wc: WorkCompletion) {
        self.state
            .lock()
            .unwrap()
            .qps
            .get_mut(&id)
            .expect("unknown qp")
            .recv_cq
            .push_back(wc);
    }

    /// Batch lengths submitted by one QP, in order.
    pub fn submissions_for(&self, id: QpIdentity) -> Vec<usize> {
        self.state
            .lock()
            .unwrap()
            .submissions
            .iter()
            .filter(|(qp, _)| *qp == id)
            .map(|(_, len)| *len)
            .collect()
    }
}

/// One endpoint's view of a [`LoopbackFabric`].
pub struct LoopbackTransport {
    state: Arc<Mutex<FabricState>>,
}

/// Loopback completion queue. State lives in the fabric; the handle only
/// proves creation order.
pub struct LoopbackCq;

/// Loopback queue pair handle.
pub struct LoopbackQp {
    id: QpIdentity,
    remote: Option<QpIdentity>,
    remote_attr: Option<MemoryRegionAttr>,
}

impl LoopbackQp {
    pub fn id(&self) -> QpIdentity {
        self.id
    }
}

impl RdmaTransport for LoopbackTransport {
    type Cq = LoopbackCq;
    type Qp = LoopbackQp;

    fn register_memory(
        &self,
        memory_id: u64,
        base: u64,
        len: u64,
        _access: AccessFlags,
    ) -> Result<()> {
        self.state.lock().unwrap().regions.insert(
            memory_id,
            MemoryRegionAttr {
                addr: base,
                key: memory_id as u32,
                len,
            },
        );
        Ok(())
    }

    fn local_attr(&self, memory_id: u64) -> Result<MemoryRegionAttr> {
        self.state
            .lock()
            .unwrap()
            .regions
            .get(&memory_id)
            .copied()
            .ok_or(Error::RegistrationFailed(memory_id))
    }

    fn create_cq(&self, _depth: u32) -> Result<LoopbackCq> {
        Ok(LoopbackCq)
    }

    fn create_qp(
        &self,
        local: QpIdentity,
        _local_attr: &MemoryRegionAttr,
        _send_cq: LoopbackCq,
        _recv_cq: LoopbackCq,
    ) -> Result<LoopbackQp> {
        self.state
            .lock()
            .unwrap()
            .qps
            .insert(local, QpState::default());
        Ok(LoopbackQp {
            id: local,
            remote: None,
            remote_attr: None,
        })
    }

    fn fetch_remote_attr(
        &self,
        peer: &PeerEndpoint,
        _handshake_port: u16,
        memory_id: u64,
    ) -> Result<MemoryRegionAttr> {
        self.state
            .lock()
            .unwrap()
            .regions
            .get(&memory_id)
            .copied()
            .ok_or(Error::NotConnected(peer.server_id))
    }

    fn bind_remote_attr(&self, qp: &mut LoopbackQp, attr: &MemoryRegionAttr) -> Result<()> {
        qp.remote_attr = Some(*attr);
        Ok(())
    }

    fn connect(
        &self,
        qp: &mut LoopbackQp,
        peer: &PeerEndpoint,
        _handshake_port: u16,
        remote: QpIdentity,
    ) -> Result<()> {
        if !self.state.lock().unwrap().qps.contains_key(&remote) {
            return Err(Error::NotConnected(peer.server_id));
        }
        qp.remote = Some(remote);
        Ok(())
    }

    fn post_recv(&self, qp: &mut LoopbackQp, laddr: u64, len: u32, slot: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .qps
            .get_mut(&qp.id)
            .ok_or(Error::SubmitFailed(-1))?
            .recv_queue
            .push_back(RecvSlot { laddr, len, slot });
        // Fresh credit may unblock parked inbound operations.
        loop {
            let qp_state = state.qps.get_mut(&qp.id).unwrap();
            if qp_state.recv_queue.is_empty() {
                break;
            }
            let Some(stalled) = qp_state.stalled_in.pop_front() else {
                break;
            };
            state.deliver(stalled.origin, qp.id, stalled.wr);
        }
        Ok(())
    }

    fn post_send_batch(&self, qp: &mut LoopbackQp, batch: &[WorkRequest]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.submissions.push((qp.id, batch.len()));
        let remote_id = qp.remote.ok_or(Error::NotConnected(qp.id.index))?;

        for wr in batch {
            match wr.opcode {
                WrOpcode::Send | WrOpcode::SendWithImm => {
                    if state.has_credit(remote_id) {
                        state.deliver(qp.id, remote_id, *wr);
                    } else {
                        state.park(qp.id, remote_id, *wr);
                    }
                }
                WrOpcode::Write | WrOpcode::WriteWithImm => {
                    // One-sided data movement happens regardless of the
                    // receiver's credit.
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            wr.laddr as *const u8,
                            wr.remote_addr as *mut u8,
                            wr.len as usize,
                        );
                    }
                    if wr.opcode == WrOpcode::WriteWithImm {
                        // The tag notification still consumes a descriptor.
                        if state.has_credit(remote_id) {
                            state.deliver(qp.id, remote_id, *wr);
                        } else {
                            state.park(qp.id, remote_id, *wr);
                        }
                    } else {
                        state.complete_send(
                            qp.id,
                            WorkCompletion {
                                wr_id: wr.wr_id,
                                opcode: WcOpcode::Write,
                                status: WcStatus::Success,
                                byte_len: wr.len,
                                imm: wr.imm,
                            },
                        );
                    }
                }
                WrOpcode::Read => {
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            wr.remote_addr as *const u8,
                            wr.laddr as *mut u8,
                            wr.len as usize,
                        );
                    }
                    state.complete_send(
                        qp.id,
                        WorkCompletion {
                            wr_id: wr.wr_id,
                            opcode: WcOpcode::Read,
                            status: WcStatus::Success,
                            byte_len: wr.len,
                            imm: wr.imm,
                        },
                    );
                }
            }
        }
        Ok(())
    }

    fn poll_send_cq(
        &self,
        qp: &mut LoopbackQp,
        max: usize,
        out: &mut Vec<WorkCompletion>,
    ) -> usize {
        let mut state = self.state.lock().unwrap();
        let Some(qp_state) = state.qps.get_mut(&qp.id) else {
            return 0;
        };
        let mut n = 0;
        while n < max {
            let Some(wc) = qp_state.send_cq.pop_front() else {
                break;
            };
            out.push(wc);
            n += 1;
        }
        n
    }

    fn poll_recv_cq(
        &self,
        qp: &mut LoopbackQp,
        max: usize,
        out: &mut Vec<WorkCompletion>,
    ) -> usize {
        let mut state = self.state.lock().unwrap();
        let Some(qp_state) = state.qps.get_mut(&qp.id) else {
            return 0;
        };
        let mut n = 0;
        while n < max {
            let Some(wc) = qp_state.recv_cq.pop_front() else {
                break;
            };
            out.push(wc);
            n += 1;
        }
        n
    }
}

/// A hand-driven fake peer: registers a region, creates a queue pair, and
/// keeps its receive queue stocked, without running a broker of its own.
///
/// The first half of its buffer is the receive window (one slot per
/// descriptor), the second half the send window.
pub struct PeerStub {
    transport: LoopbackTransport,
    qp: LoopbackQp,
    buffer: ArenaBuffer,
    slot_size: usize,
    slot_count: usize,
    id: QpIdentity,
}

impl PeerStub {
    pub fn new(
        fabric: &LoopbackFabric,
        server_id: u32,
        thread_id: u32,
        counterpart: u32,
        max_in_flight: u32,
        max_msg_size: u32,
    ) -> Self {
        let transport = fabric.transport();
        let slot_size = max_msg_size as usize;
        let slot_count = max_in_flight as usize;
        let buffer = ArenaBuffer::new(2 * slot_size * slot_count);
        transport
            .register_memory(
                server_id as u64,
                buffer.base_addr(),
                buffer.len() as u64,
                full_access(),
            )
            .unwrap();
        let attr = transport.local_attr(server_id as u64).unwrap();
        let send_cq = transport.create_cq(max_in_flight).unwrap();
        let recv_cq = transport.create_cq(max_in_flight).unwrap();
        let id = QpIdentity::new(server_id, thread_id, counterpart);
        let mut qp = transport.create_qp(id, &attr, send_cq, recv_cq).unwrap();
        for slot in 0..slot_count {
            transport
                .post_recv(
                    &mut qp,
                    buffer.base_addr() + (slot * slot_size) as u64,
                    max_msg_size,
                    slot as u64,
                )
                .unwrap();
        }
        Self {
            transport,
            qp,
            buffer,
            slot_size,
            slot_count,
            id,
        }
    }

    pub fn id(&self) -> QpIdentity {
        self.id
    }

    pub fn region_attr(&self) -> MemoryRegionAttr {
        self.transport.local_attr(self.id.node_id as u64).unwrap()
    }

    /// Connect the stub's queue pair toward `remote`, for stub-initiated
    /// traffic. Receiving does not require it.
    pub fn connect_to(&mut self, remote: QpIdentity) {
        let endpoint = PeerEndpoint::new(
            remote.node_id,
            remote.worker_id,
            "127.0.0.1:0".parse().unwrap(),
        );
        self.transport
            .connect(&mut self.qp, &endpoint, 0, remote)
            .unwrap();
    }

    /// Drain received messages as (slot, payload, tag), reposting each
    /// consumed descriptor.
    pub fn drain_received(&mut self) -> Vec<(u64, Vec<u8>, u32)> {
        let mut wcs = Vec::new();
        let n = self
            .transport
            .poll_recv_cq(&mut self.qp, self.slot_count, &mut wcs);
        let mut out = Vec::with_capacity(n);
        for wc in &wcs {
            let offset = wc.wr_id as usize * self.slot_size;
            let payload = self.buffer.slice(offset, wc.byte_len as usize).to_vec();
            out.push((wc.wr_id, payload, wc.imm));
            self.transport
                .post_recv(
                    &mut self.qp,
                    self.buffer.base_addr() + offset as u64,
                    self.slot_size as u32,
                    wc.wr_id,
                )
                .unwrap();
        }
        out
    }

    /// Send one message from the stub's send window. Requires a prior
    /// [`connect_to`](Self::connect_to).
    pub fn send(&mut self, slot: u64, payload: &[u8], imm: u32) {
        assert!(payload.len() <= self.slot_size);
        let offset = (self.slot_count + slot as usize) * self.slot_size;
        self.buffer.write(offset, payload);
        let wr = WorkRequest {
            wr_id: slot,
            opcode: if imm != 0 {
                WrOpcode::SendWithImm
            } else {
                WrOpcode::Send
            },
            laddr: self.buffer.base_addr() + offset as u64,
            len: payload.len() as u32,
            imm,
            remote_addr: 0,
        };
        self.transport.post_send_batch(&mut self.qp, &[wr]).unwrap();
    }

    /// Discard the stub's own send completions, returning the count.
    pub fn drain_sent(&mut self) -> usize {
        let mut wcs = Vec::new();
        self.transport
            .poll_send_cq(&mut self.qp, usize::MAX, &mut wcs)
    }

    /// Write bytes at an offset inside the stub's registered region, as a
    /// target for remote reads and writes.
    pub fn write_at(&mut self, offset: usize, bytes: &[u8]) {
        self.buffer.write(offset, bytes);
    }

    /// Read bytes back from the stub's registered region.
    pub fn read_at(&self, offset: usize, len: usize) -> Vec<u8> {
        self.buffer.slice(offset, len).to_vec()
    }
}
