//! The reliable-connection message broker.
//!
//! One broker instance serves one worker thread. It carves the caller's
//! arena into per-peer receive and send windows, connects one reliable
//! queue pair per peer, and exposes post, flush, and poll operations on
//! top. All progress is caller driven: completions are only delivered,
//! and send slots only freed, from inside [`RcBroker::poll_send`] and
//! [`RcBroker::poll_recv`].

use std::sync::Arc;

use crate::arena::{layout_peer_regions, Arena, BackingRegion, SlotRegion};
use crate::callback::{Completion, CompletionHandler};
use crate::config::BrokerConfig;
use crate::device::{DeviceHandle, DeviceRegistry};
use crate::endpoint::{PeerEndpoint, PeerTable, QpIdentity};
use crate::error::{Error, Result};
use crate::retry::CancelToken;
use crate::transport::{
    MemoryRegionAttr, RdmaTransport, RemoteAddr, WcOpcode, WcStatus, WorkCompletion, WorkRequest,
    WrOpcode,
};

/// Byte written into a slot once its previous content is dead.
const SLOT_SCRUB: u8 = b'~';

struct PeerState<Q> {
    endpoint: PeerEndpoint,
    recv_region: SlotRegion,
    send_region: SlotRegion,
    qp: Option<Q>,
    remote_attr: Option<MemoryRegionAttr>,
    /// Posted-but-not-completed send-class operations. Never exceeds
    /// `max_in_flight`; reaching it blocks the poster.
    pending_sends: u32,
    /// Rotating send-slot cursor, wraps at `max_in_flight`.
    slot_cursor: u32,
    /// Accumulated, not yet submitted work requests.
    batch: Vec<WorkRequest>,
    /// Outstanding posted receive descriptors.
    recv_credit: u32,
}

/// Message broker over reliable queue pairs, one per remote peer.
pub struct RcBroker<T: RdmaTransport, C: CompletionHandler> {
    config: BrokerConfig,
    transport: Arc<T>,
    arena: Arena,
    peers: Vec<PeerState<T::Qp>>,
    peer_table: PeerTable,
    callback: C,
    wc_buf: Vec<WorkCompletion>,
    device: Option<DeviceHandle>,
    local_attr: Option<MemoryRegionAttr>,
}

impl<T: RdmaTransport, C: CompletionHandler> RcBroker<T, C> {
    /// Create a broker over `arena` for the given peer list.
    ///
    /// Partitions and zeroes the per-peer windows but opens no hardware
    /// resources; call [`establish`](Self::establish) before posting.
    /// The peer list must not contain the local server id.
    pub fn new(
        config: BrokerConfig,
        transport: Arc<T>,
        mut arena: Arena,
        peers: Vec<PeerEndpoint>,
        callback: C,
    ) -> Result<Self> {
        config.validate()?;
        if peers.iter().any(|p| p.server_id == config.server_id) {
            return Err(Error::InvalidConfig(
                "peer list must not contain the local server id".into(),
            ));
        }

        let regions = layout_peer_regions(
            peers.len(),
            config.max_in_flight,
            config.max_msg_size,
            arena.len(),
        )?;
        let peer_table = PeerTable::new(&peers);

        let mut states = Vec::with_capacity(peers.len());
        for (endpoint, (recv_region, send_region)) in peers.into_iter().zip(regions) {
            arena.fill(recv_region.base_offset(), recv_region.size(), 0);
            arena.fill(send_region.base_offset(), send_region.size(), 0);
            states.push(PeerState {
                endpoint,
                recv_region,
                send_region,
                qp: None,
                remote_attr: None,
                pending_sends: 0,
                slot_cursor: 0,
                batch: Vec::with_capacity(config.doorbell_batch_size as usize),
                recv_credit: 0,
            });
        }

        tracing::info!(
            thread_id = config.thread_id,
            server_id = config.server_id,
            max_in_flight = config.max_in_flight,
            max_msg_size = config.max_msg_size,
            doorbell_batch_size = config.doorbell_batch_size,
            arena_len = arena.len(),
            "created broker"
        );

        Ok(Self {
            wc_buf: Vec::with_capacity(config.max_in_flight as usize),
            config,
            transport,
            arena,
            peers: states,
            peer_table,
            callback,
            device: None,
            local_attr: None,
        })
    }

    /// Register the arena and connect every peer.
    ///
    /// Registration goes through `registry` so that brokers sharing one
    /// device register the region only once. Per peer, in list order:
    /// create the completion queues and the queue pair, fetch the peer's
    /// region attributes (retrying until the peer has registered), bind
    /// them, connect (retrying until the counterpart exists), then post
    /// `max_in_flight` receive descriptors to fill the receive credit.
    ///
    /// With the default unbounded retry policy an unreachable peer stalls
    /// this call forever; pass a [`CancelToken`] to make it abortable.
    pub fn establish(
        &mut self,
        registry: &DeviceRegistry,
        cancel: Option<&CancelToken>,
    ) -> Result<()> {
        tracing::info!(
            thread_id = self.config.thread_id,
            "establishing peer connections"
        );
        let region = BackingRegion::of_arena(&self.arena);
        let device = registry.ensure_registered(
            self.transport.as_ref(),
            self.config.device_index,
            self.config.server_id as u64,
            region,
        )?;
        let local_attr = self.transport.local_attr(device.memory_id)?;
        self.device = Some(device);
        self.local_attr = Some(local_attr);

        let RcBroker {
            config,
            transport,
            arena,
            peers,
            ..
        } = self;
        let base = arena.base_addr();

        for peer in peers.iter_mut() {
            let local_key =
                QpIdentity::new(config.server_id, config.thread_id, peer.endpoint.server_id);
            let remote_key = QpIdentity::new(
                peer.endpoint.server_id,
                peer.endpoint.thread_id,
                config.server_id,
            );
            let peer_memory_id = peer.endpoint.server_id as u64;
            tracing::info!(
                thread_id = config.thread_id,
                peer = peer.endpoint.server_id,
                addr = %peer.endpoint.addr,
                "connecting"
            );

            let send_cq = transport.create_cq(config.max_in_flight)?;
            let recv_cq = transport.create_cq(config.max_in_flight)?;
            let mut qp = transport.create_qp(local_key, &local_attr, send_cq, recv_cq)?;

            let remote_attr = config.retry_policy.run(cancel, || {
                transport.fetch_remote_attr(&peer.endpoint, config.handshake_port, peer_memory_id)
            })?;
            transport.bind_remote_attr(&mut qp, &remote_attr)?;
            config.retry_policy.run(cancel, || {
                transport.connect(&mut qp, &peer.endpoint, config.handshake_port, remote_key)
            })?;
            tracing::info!(
                thread_id = config.thread_id,
                peer = peer.endpoint.server_id,
                recvs = config.max_in_flight,
                "connected, posting receives"
            );

            for slot in 0..config.max_in_flight {
                let offset = peer.recv_region.offset_of(slot as usize);
                arena.fill(offset, 1, SLOT_SCRUB);
                transport.post_recv(&mut qp, base + offset as u64, config.max_msg_size, slot as u64)?;
                peer.recv_credit += 1;
            }

            peer.remote_attr = Some(remote_attr);
            peer.qp = Some(qp);
        }

        tracing::info!(thread_id = self.config.thread_id, "initialized");
        Ok(())
    }

    /// Post a two-sided send of `size` bytes to `server_id`.
    ///
    /// The payload is read from `localbuf` when given, otherwise from the
    /// current send slot (see [`send_slot_mut`](Self::send_slot_mut)). A
    /// non-zero `imm` is delivered as the receiver's tag. Returns the
    /// assigned slot id. Panics if `size` is not strictly below
    /// `max_msg_size`; that is a caller bug, not a runtime condition.
    pub fn post_send(
        &mut self,
        server_id: u32,
        localbuf: Option<u64>,
        size: u32,
        imm: u32,
    ) -> Result<u64> {
        assert!(
            size < self.config.max_msg_size,
            "send payload of {} bytes does not fit below max_msg_size {}",
            size,
            self.config.max_msg_size
        );
        let opcode = if imm != 0 {
            WrOpcode::SendWithImm
        } else {
            WrOpcode::Send
        };
        self.post_rdma(opcode, server_id, localbuf, size, 0, RemoteAddr::Absolute(0), imm)
    }

    /// Post a one-sided write of `size` bytes into the peer's memory.
    pub fn post_write(
        &mut self,
        server_id: u32,
        localbuf: Option<u64>,
        size: u32,
        remote: RemoteAddr,
        imm: u32,
    ) -> Result<u64> {
        let opcode = if imm != 0 {
            WrOpcode::WriteWithImm
        } else {
            WrOpcode::Write
        };
        self.post_rdma(opcode, server_id, localbuf, size, 0, remote, imm)
    }

    /// Post a one-sided read of `size` bytes from the peer's memory into
    /// the local buffer (the current send slot when `localbuf` is `None`),
    /// offset by `local_offset`.
    pub fn post_read(
        &mut self,
        server_id: u32,
        localbuf: Option<u64>,
        size: u32,
        local_offset: u64,
        remote: RemoteAddr,
    ) -> Result<u64> {
        self.post_rdma(WrOpcode::Read, server_id, localbuf, size, local_offset, remote, 0)
    }

    fn post_rdma(
        &mut self,
        opcode: WrOpcode,
        server_id: u32,
        localbuf: Option<u64>,
        size: u32,
        local_offset: u64,
        remote: RemoteAddr,
        imm: u32,
    ) -> Result<u64> {
        let qp_idx = self
            .peer_table
            .qp_index(server_id)
            .ok_or(Error::PeerNotFound(server_id))?;
        let RcBroker {
            config,
            transport,
            arena,
            peers,
            callback,
            wc_buf,
            ..
        } = self;
        let peer = &mut peers[qp_idx];
        if peer.qp.is_none() {
            return Err(Error::NotConnected(server_id));
        }

        let slot = peer.slot_cursor as u64;
        let slot_addr = arena.base_addr() + peer.send_region.offset_of(slot as usize) as u64;
        let laddr = localbuf.unwrap_or(slot_addr) + local_offset;
        let remote_addr = match opcode {
            WrOpcode::Send | WrOpcode::SendWithImm => 0,
            WrOpcode::Write | WrOpcode::WriteWithImm | WrOpcode::Read => match remote {
                RemoteAddr::Absolute(addr) => addr,
                RemoteAddr::Offset(offset) => {
                    let attr = peer.remote_attr.ok_or(Error::NotConnected(server_id))?;
                    attr.addr + offset
                }
            },
        };

        peer.batch.push(WorkRequest {
            wr_id: slot,
            opcode,
            laddr,
            len: size,
            imm,
            remote_addr,
        });
        peer.slot_cursor += 1;
        peer.pending_sends += 1;
        tracing::trace!(
            thread_id = config.thread_id,
            peer = server_id,
            ?opcode,
            wr = slot,
            imm,
            size,
            pending = peer.pending_sends,
            "queued request"
        );

        if peer.batch.len() == config.doorbell_batch_size as usize {
            submit_batch(transport.as_ref(), peer, config.thread_id)?;
        }

        // The window is exhausted; drain this peer's send queue until a
        // slot frees up.
        while peer.pending_sends == config.max_in_flight {
            drain_send(
                transport.as_ref(),
                peer,
                arena,
                callback,
                wc_buf,
                config.max_in_flight,
                config.thread_id,
            );
        }

        if peer.slot_cursor == config.max_in_flight {
            peer.slot_cursor = 0;
        }
        Ok(slot)
    }

    /// Submit the peer's accumulated batch, if any. A no-op for the local
    /// server id and for an empty batch.
    pub fn flush(&mut self, server_id: u32) -> Result<()> {
        if server_id == self.config.server_id {
            return Ok(());
        }
        let qp_idx = self
            .peer_table
            .qp_index(server_id)
            .ok_or(Error::PeerNotFound(server_id))?;
        submit_batch(
            self.transport.as_ref(),
            &mut self.peers[qp_idx],
            self.config.thread_id,
        )
    }

    /// Submit every peer's accumulated batch.
    pub fn flush_all(&mut self) -> Result<()> {
        for qp_idx in 0..self.peers.len() {
            submit_batch(
                self.transport.as_ref(),
                &mut self.peers[qp_idx],
                self.config.thread_id,
            )?;
        }
        Ok(())
    }

    /// Drain the peer's send completion queue, invoking the callback per
    /// completion and freeing its slot. Returns the number drained; 0 for
    /// the local server id, an unknown peer, or when nothing is pending.
    pub fn poll_send(&mut self, server_id: u32) -> u32 {
        if server_id == self.config.server_id {
            return 0;
        }
        let Some(qp_idx) = self.peer_table.qp_index(server_id) else {
            return 0;
        };
        let RcBroker {
            config,
            transport,
            arena,
            peers,
            callback,
            wc_buf,
            ..
        } = self;
        drain_send(
            transport.as_ref(),
            &mut peers[qp_idx],
            arena,
            callback,
            wc_buf,
            config.max_in_flight,
            config.thread_id,
        )
    }

    /// Drain every peer's send completion queue; returns the aggregate.
    pub fn poll_send_all(&mut self) -> u32 {
        let RcBroker {
            config,
            transport,
            arena,
            peers,
            callback,
            wc_buf,
            ..
        } = self;
        let mut drained = 0;
        for peer in peers.iter_mut() {
            drained += drain_send(
                transport.as_ref(),
                peer,
                arena,
                callback,
                wc_buf,
                config.max_in_flight,
                config.thread_id,
            );
        }
        drained
    }

    /// Drain the peer's receive completion queue. Per completion: invoke
    /// the callback with the received bytes, then repost the slot as a
    /// fresh receive descriptor so credit stays saturated. Afterwards any
    /// accumulated sends toward the peer are flushed. Returns the number
    /// drained; 0 for the local server id.
    pub fn poll_recv(&mut self, server_id: u32) -> Result<u32> {
        if server_id == self.config.server_id {
            return Ok(0);
        }
        let qp_idx = self
            .peer_table
            .qp_index(server_id)
            .ok_or(Error::PeerNotFound(server_id))?;
        let RcBroker {
            config,
            transport,
            arena,
            peers,
            callback,
            wc_buf,
            ..
        } = self;
        let peer = &mut peers[qp_idx];
        let n = drain_recv(
            transport.as_ref(),
            peer,
            arena,
            callback,
            wc_buf,
            config.max_in_flight,
            config.max_msg_size,
            config.thread_id,
        )?;
        submit_batch(transport.as_ref(), peer, config.thread_id)?;
        Ok(n)
    }

    /// Drain every peer's receive completion queue; returns the aggregate.
    pub fn poll_recv_all(&mut self) -> Result<u32> {
        let mut drained = 0;
        for qp_idx in 0..self.peers.len() {
            let server_id = self.peers[qp_idx].endpoint.server_id;
            drained += self.poll_recv(server_id)?;
        }
        Ok(drained)
    }

    /// Borrow the peer's current send slot. The view is valid until the
    /// slot cursor wraps back around to this index.
    pub fn send_slot(&self, server_id: u32) -> Result<&[u8]> {
        let qp_idx = self
            .peer_table
            .qp_index(server_id)
            .ok_or(Error::PeerNotFound(server_id))?;
        let peer = &self.peers[qp_idx];
        let offset = peer.send_region.offset_of(peer.slot_cursor as usize);
        Ok(self.arena.slice(offset, peer.send_region.slot_size()))
    }

    /// Mutably borrow the peer's current send slot. Write the payload
    /// here, then post with `localbuf = None`.
    pub fn send_slot_mut(&mut self, server_id: u32) -> Result<&mut [u8]> {
        let qp_idx = self
            .peer_table
            .qp_index(server_id)
            .ok_or(Error::PeerNotFound(server_id))?;
        let peer = &self.peers[qp_idx];
        let offset = peer.send_region.offset_of(peer.slot_cursor as usize);
        let len = peer.send_region.slot_size();
        Ok(self.arena.slice_mut(offset, len))
    }

    /// Posted-but-not-completed send-class operations toward the peer.
    pub fn pending_sends(&self, server_id: u32) -> Option<u32> {
        let qp_idx = self.peer_table.qp_index(server_id)?;
        Some(self.peers[qp_idx].pending_sends)
    }

    /// Outstanding posted receive descriptors for the peer.
    pub fn recv_credit(&self, server_id: u32) -> Option<u32> {
        let qp_idx = self.peer_table.qp_index(server_id)?;
        Some(self.peers[qp_idx].recv_credit)
    }

    /// The peer's registered-region attributes, once established.
    pub fn remote_attr(&self, server_id: u32) -> Option<MemoryRegionAttr> {
        let qp_idx = self.peer_table.qp_index(server_id)?;
        self.peers[qp_idx].remote_attr
    }

    /// The local registered-region attributes, once established.
    pub fn local_attr(&self) -> Option<MemoryRegionAttr> {
        self.local_attr
    }

    /// The device registration, once established.
    pub fn device(&self) -> Option<DeviceHandle> {
        self.device
    }

    /// The broker's arena.
    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    /// The broker's configuration.
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Number of configured peers.
    pub fn num_peers(&self) -> usize {
        self.peers.len()
    }
}

fn submit_batch<T: RdmaTransport>(
    transport: &T,
    peer: &mut PeerState<T::Qp>,
    thread_id: u32,
) -> Result<()> {
    if peer.batch.is_empty() {
        return Ok(());
    }
    let PeerState {
        qp, batch, endpoint, ..
    } = peer;
    let qp = qp
        .as_mut()
        .ok_or(Error::NotConnected(endpoint.server_id))?;
    tracing::debug!(
        thread_id,
        peer = endpoint.server_id,
        requests = batch.len(),
        "posting batch"
    );
    transport.post_send_batch(qp, batch)?;
    batch.clear();
    Ok(())
}

fn drain_send<T: RdmaTransport, C: CompletionHandler>(
    transport: &T,
    peer: &mut PeerState<T::Qp>,
    arena: &mut Arena,
    callback: &mut C,
    wc_buf: &mut Vec<WorkCompletion>,
    max_in_flight: u32,
    thread_id: u32,
) -> u32 {
    if peer.pending_sends == 0 {
        return 0;
    }
    let Some(qp) = peer.qp.as_mut() else {
        return 0;
    };
    wc_buf.clear();
    let n = transport.poll_send_cq(qp, max_in_flight as usize, wc_buf);
    let server_id = peer.endpoint.server_id;
    for wc in wc_buf.iter() {
        assert!(
            wc.status == WcStatus::Success,
            "rdma-rc[{}]: send completion toward server {} failed: {}",
            thread_id,
            server_id,
            wc.status
        );
        tracing::trace!(
            thread_id,
            peer = server_id,
            wr = wc.wr_id,
            ?wc.opcode,
            "send complete"
        );
        let slot = wc.wr_id as usize;
        let offset = peer.send_region.offset_of(slot);
        let payload = arena.slice(offset, peer.send_region.slot_size());
        let completion = match wc.opcode {
            WcOpcode::Send => Completion::SendDone {
                peer: server_id,
                slot: wc.wr_id,
                payload,
                imm: wc.imm,
            },
            WcOpcode::Write => Completion::WriteDone {
                peer: server_id,
                slot: wc.wr_id,
                payload,
                imm: wc.imm,
            },
            WcOpcode::Read => Completion::ReadDone {
                peer: server_id,
                slot: wc.wr_id,
                payload,
                imm: wc.imm,
            },
            WcOpcode::Recv => {
                panic!("receive completion surfaced on a send queue")
            }
        };
        callback.on_completion(completion);
        // The slot content is dead now.
        arena.fill(offset, 1, SLOT_SCRUB);
        peer.pending_sends -= 1;
    }
    n as u32
}

#[allow(clippy::too_many_arguments)]
fn drain_recv<T: RdmaTransport, C: CompletionHandler>(
    transport: &T,
    peer: &mut PeerState<T::Qp>,
    arena: &mut Arena,
    callback: &mut C,
    wc_buf: &mut Vec<WorkCompletion>,
    max_in_flight: u32,
    max_msg_size: u32,
    thread_id: u32,
) -> Result<u32> {
    let base = arena.base_addr();
    let PeerState {
        qp,
        recv_region,
        recv_credit,
        endpoint,
        ..
    } = peer;
    let server_id = endpoint.server_id;
    let recv_region = *recv_region;
    let qp = qp.as_mut().ok_or(Error::NotConnected(server_id))?;

    wc_buf.clear();
    let n = transport.poll_recv_cq(qp, max_in_flight as usize, wc_buf);
    for wc in wc_buf.iter() {
        let slot = wc.wr_id;
        assert!(
            slot < max_in_flight as u64,
            "rdma-rc[{}]: receive slot {} from server {} out of range",
            thread_id,
            slot,
            server_id
        );
        assert!(
            wc.status == WcStatus::Success,
            "rdma-rc[{}]: receive completion from server {} failed: {}",
            thread_id,
            server_id,
            wc.status
        );
        // A length beyond the slot would alias the neighboring window.
        assert!(
            wc.byte_len <= max_msg_size,
            "rdma-rc[{}]: receive of {} bytes from server {} exceeds max_msg_size {}",
            thread_id,
            wc.byte_len,
            server_id,
            max_msg_size
        );
        tracing::trace!(
            thread_id,
            peer = server_id,
            wr = slot,
            imm = wc.imm,
            len = wc.byte_len,
            "received"
        );
        let offset = recv_region.offset_of(slot as usize);
        let payload = arena.slice(offset, wc.byte_len as usize);
        callback.on_completion(Completion::Received {
            peer: server_id,
            slot,
            payload,
            imm: wc.imm,
        });
        *recv_credit -= 1;
        // Repost the same slot so credit stays saturated.
        arena.fill(offset, 1, SLOT_SCRUB);
        transport.post_recv(qp, base + offset as u64, max_msg_size, slot)?;
        *recv_credit += 1;
    }
    Ok(n as u32)
}
