//! # Capture Pipeline
//!
//! Host side of the device connection, leaves first:
//!
//! - **`frame`**: byte stream → length-prefixed packets
//! - **`batch`**: packet → typed alloc/free lines or command acks
//! - **`store`**: append-only records plus the free index
//! - **`session`**: tokio TCP session driving the three above
//! - **`agent`**: model of the device send loop (loopback device, load shedding)

pub mod agent;
pub mod batch;
pub mod frame;
pub mod session;
pub mod store;

pub use agent::{AgentBuffer, SendLoop, SendStats};
pub use batch::{BatchDecoder, DecodedBatch, Packet, RecordLine};
pub use frame::FrameReassembler;
pub use session::{CaptureSession, SessionControl, SessionEvent, SessionStats, StopReason};
pub use store::{AllocationRecord, CallStack, Frame, FreeIndex, RecordStore};
