//! Receive path of a UDP-based low-latency messaging media driver.
//!
//! A *destination* is one bound UDP endpoint. Inbound datagrams are
//! demultiplexed by channel and session, and each session's payload bytes are
//! rebuilt into a term buffer at the offset carried by the frame header. Two
//! control frames flow back to the source: Status Messages advertising the
//! highest contiguous position plus the receiver window, and NAKs requesting
//! retransmission of detected gaps.
//!
//! # Architecture
//!
//! Two cooperating single-threaded actors, each a non-blocking event loop:
//!
//! - **Receiver thread**: owns the UDP transports, the subscription and
//!   session registries, term-buffer writes, SM/NAK emission, and loss
//!   scanning.
//! - **Conductor thread**: owns term-buffer provisioning and subscription
//!   admission.
//!
//! The threads exchange work over single-producer single-consumer channels:
//! a byte ring buffer carrying length-prefixed commands in each direction,
//! plus a bounded typed queue that transfers term-buffer ownership from the
//! conductor to the receiver.
//!
//! ```text
//! UDP datagram ──> UdpTransport ──> DataFrameHandler ──> SubscribedSession
//!                                        │    ▲                │
//!                      create_term_buffer│    │new buffer      │gap
//!                                        ▼    │                ▼
//!                                      Conductor          GapTracker ──> NAK
//! ```
//!
//! # Example
//!
//! ```no_run
//! use gale::driver::{Driver, DriverConfig};
//!
//! let driver = Driver::spawn(DriverConfig::default())?;
//! driver.add_subscription("udp://127.0.0.1:40123", &[17])?;
//! // ... data flows until the application tears the subscription down ...
//! driver.remove_subscription("udp://127.0.0.1:40123", &[17])?;
//! driver.shutdown();
//! # Ok::<(), gale::driver::DriverError>(())
//! ```

pub mod driver;
pub mod net;
pub mod protocol;
pub mod sync;

mod trace;

pub use trace::init_tracing;
