//! Transport seam between the broker and the RDMA device layer.
//!
//! The broker drives connection establishment, posting, and completion
//! draining through [`RdmaTransport`]; the concrete implementation owns
//! device handles, verbs calls, and the out-of-band handshake channel.
//! [`crate::testing::LoopbackTransport`] implements the same seam in
//! process for tests and benches.

use bitflags::bitflags;

use crate::endpoint::{PeerEndpoint, QpIdentity};
use crate::error::Result;

bitflags! {
    /// Access rights requested when registering the memory region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessFlags: u32 {
        const LOCAL_WRITE = 1 << 0;
        const REMOTE_WRITE = 1 << 1;
        const REMOTE_READ = 1 << 2;
    }
}

/// Attributes of a registered memory region, local or remote.
///
/// The remote side's attributes are obtained through the out-of-band
/// handshake and bound to the local queue pair before connecting.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegionAttr {
    /// Region base address.
    pub addr: u64,
    /// Region protection key.
    pub key: u32,
    /// Region length in bytes.
    pub len: u64,
}

/// Work request opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrOpcode {
    /// Two-sided send, consumes a receive descriptor at the peer.
    Send,
    /// Send carrying an immediate tag.
    SendWithImm,
    /// One-sided remote write.
    Write,
    /// Remote write that additionally consumes a receive descriptor at
    /// the peer to deliver the immediate tag.
    WriteWithImm,
    /// One-sided remote read.
    Read,
}

/// Completion opcode, reported by the hardware per finished operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcOpcode {
    Send,
    Write,
    Read,
    Recv,
}

/// Completion status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcStatus {
    Success,
    /// Vendor error code. Any non-success status is fatal for the broker.
    Error(u32),
}

impl std::fmt::Display for WcStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WcStatus::Success => write!(f, "success"),
            WcStatus::Error(code) => write!(f, "error({})", code),
        }
    }
}

/// Remote address for a one-sided operation: absolute, or relative to the
/// peer's registered region base.
#[derive(Debug, Clone, Copy)]
pub enum RemoteAddr {
    Absolute(u64),
    Offset(u64),
}

/// One work descriptor as handed to the device.
///
/// `laddr` is an absolute address inside the registered region; the
/// transport supplies the matching local key itself. `remote_addr` is
/// absolute and already resolved against the peer's region base; it is
/// zero for send-class operations.
#[derive(Debug, Clone, Copy)]
pub struct WorkRequest {
    /// Caller-visible work id; the broker uses the send slot index.
    pub wr_id: u64,
    pub opcode: WrOpcode,
    /// Local buffer address.
    pub laddr: u64,
    /// Payload length in bytes.
    pub len: u32,
    /// Immediate tag, delivered to the remote completion; 0 when unused.
    pub imm: u32,
    /// Absolute remote address; 0 for send-class operations.
    pub remote_addr: u64,
}

/// One finished operation as reported by a completion queue.
#[derive(Debug, Clone, Copy)]
pub struct WorkCompletion {
    /// The `wr_id` of the completed work request, or the receive slot id
    /// for receive completions.
    pub wr_id: u64,
    pub opcode: WcOpcode,
    pub status: WcStatus,
    /// Bytes transferred.
    pub byte_len: u32,
    /// Immediate tag carried by the operation; 0 when none.
    pub imm: u32,
}

/// The RDMA device layer the broker is written against.
///
/// One transport instance stands for one opened device. Registration
/// covers the whole backing region once per process per device (see
/// [`crate::device::DeviceRegistry`]); every broker then creates its own
/// completion queues and reliable queue pairs against it.
///
/// Failure contract: `fetch_remote_attr` and `connect` fail transiently
/// while the peer is still starting up and are driven by the broker's
/// retry loop; every other operation's failure is unrecoverable.
pub trait RdmaTransport {
    /// Completion queue handle. Moved into the queue pair at creation.
    type Cq;
    /// Reliable queue pair handle, bound to one remote peer.
    type Qp;

    /// Register the backing memory region under `memory_id`.
    fn register_memory(
        &self,
        memory_id: u64,
        base: u64,
        len: u64,
        access: AccessFlags,
    ) -> Result<()>;

    /// Attributes of the locally registered region.
    fn local_attr(&self, memory_id: u64) -> Result<MemoryRegionAttr>;

    /// Create a completion queue of the given depth.
    fn create_cq(&self, depth: u32) -> Result<Self::Cq>;

    /// Create a reliable queue pair bound to the registered region.
    fn create_qp(
        &self,
        local: QpIdentity,
        local_attr: &MemoryRegionAttr,
        send_cq: Self::Cq,
        recv_cq: Self::Cq,
    ) -> Result<Self::Qp>;

    /// Fetch the peer's registered-region attributes over the out-of-band
    /// channel. Fails while the peer has not registered yet.
    fn fetch_remote_attr(
        &self,
        peer: &PeerEndpoint,
        handshake_port: u16,
        memory_id: u64,
    ) -> Result<MemoryRegionAttr>;

    /// Bind the fetched remote attributes to the queue pair.
    fn bind_remote_attr(&self, qp: &mut Self::Qp, attr: &MemoryRegionAttr) -> Result<()>;

    /// Connect the queue pair to its remote counterpart. Fails while the
    /// counterpart has not been created yet.
    fn connect(
        &self,
        qp: &mut Self::Qp,
        peer: &PeerEndpoint,
        handshake_port: u16,
        remote: QpIdentity,
    ) -> Result<()>;

    /// Post one receive descriptor for the buffer at `laddr`.
    fn post_recv(&self, qp: &mut Self::Qp, laddr: u64, len: u32, slot: u64) -> Result<()>;

    /// Submit a chain of work requests as a single hardware post. One
    /// call rings the doorbell exactly once.
    fn post_send_batch(&self, qp: &mut Self::Qp, batch: &[WorkRequest]) -> Result<()>;

    /// Drain up to `max` send completions into `out`, returning the count.
    fn poll_send_cq(
        &self,
        qp: &mut Self::Qp,
        max: usize,
        out: &mut Vec<WorkCompletion>,
    ) -> usize;

    /// Drain up to `max` receive completions into `out`, returning the count.
    fn poll_recv_cq(
        &self,
        qp: &mut Self::Qp,
        max: usize,
        out: &mut Vec<WorkCompletion>,
    ) -> usize;
}

/// Access rights the broker registers its region with.
pub fn full_access() -> AccessFlags {
    AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE | AccessFlags::REMOTE_READ
}
