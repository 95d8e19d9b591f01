//! rcbroker - Reliable-connection RDMA message broker with per-peer
//! circular buffer windows, doorbell batching, and window flow control.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      RcBroker (1 per thread)                 │
//! │  ┌──────────────────────────── arena ─────────────────────┐  │
//! │  │ peer0 recv window │ peer0 send window │ peer1 recv │ …  │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! │   per peer: RC QP, send/recv CQ, doorbell batch,             │
//! │             pending-send counter, rotating slot cursor       │
//! └──────────────────────────────────────────────────────────────┘
//!            │ post_send / post_write / post_read / flush
//!            │ poll_send / poll_recv  →  CompletionHandler
//!            ▼
//!       RdmaTransport (device, registration, handshake, post/poll)
//! ```
//!
//! - One broker per worker thread; no internal synchronization.
//! - Slots rotate modulo `max_in_flight`; a full window blocks the
//!   poster until completions drain.
//! - Receive credit is kept saturated: every drained receive completion
//!   reposts its slot before the poll call returns.
//!
//! Nothing makes progress without polling: the application drives
//! [`RcBroker::poll_recv_all`] and [`RcBroker::poll_send_all`] in a tight
//! loop and consumes completions through its [`CompletionHandler`].

pub mod arena;
pub mod broker;
pub mod callback;
pub mod config;
pub mod device;
pub mod endpoint;
pub mod error;
pub mod retry;
pub mod testing;
pub mod transport;

pub use arena::{Arena, BackingRegion, SlotRegion};
pub use broker::RcBroker;
pub use callback::{Completion, CompletionHandler, NopHandler};
pub use config::BrokerConfig;
pub use device::{DeviceHandle, DeviceRegistry};
pub use endpoint::{PeerEndpoint, QpIdentity};
pub use error::{Error, Result};
pub use retry::{CancelToken, RetryPolicy};
pub use transport::{
    AccessFlags, MemoryRegionAttr, RdmaTransport, RemoteAddr, WcOpcode, WcStatus, WorkCompletion,
    WorkRequest, WrOpcode,
};
