//! Driver runtime: the receiver/conductor thread pair and its public handle.
//!
//! # Architecture
//!
//! [`Driver::spawn`] starts two threads:
//!
//! - **Receiver**: non-blocking selector loop owning the UDP transports,
//!   subscription/session registries, term-buffer rebuilds, and SM/NAK
//!   emission.
//! - **Conductor**: admits application subscription commands and provisions
//!   term buffers on request.
//!
//! ```text
//!  application          conductor                  receiver
//!      │  ClientCommand     │   ADD/REMOVE_SUBSCRIBER   │
//!      │───────────────────>│──────────────────────────>│
//!      │                    │                           │  DATA frame
//!      │                    │     CREATE_TERM_BUFFER    │<────────── source
//!      │                    │<──────────────────────────│
//!      │                    │  buffer event + NEW_      │
//!      │                    │  RECEIVE_BUFFER_NOTIF.    │
//!      │                    │──────────────────────────>│
//!      │                    │                           │  SM / NAK
//!      │                    │                           │──────────> source
//! ```
//!
//! Work crosses the boundary over SPSC channels only: a byte command ring in
//! each direction, plus the bounded buffer event queue. Each thread is the
//! sole owner of its state, so nothing in the frame path takes a lock.

pub mod commands;
pub mod conductor;
pub mod handler;
pub mod loss;
pub mod proxy;
pub mod receiver;
pub mod subscription;
pub mod transport;

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;

use crate::net::{Destination, DestinationError};
use crate::protocol::frame::{
    FRAME_ALIGNMENT, LayoutError, check_header_length, check_max_frame_length,
};
use crate::sync::{ring, spsc};
use crate::trace::{debug, error, info};
use commands::{CLIENT_COMMAND_QUEUE_CAPACITY, ClientCommand};
use conductor::Conductor;
use proxy::{ConductorProxy, ReceiverProxy};
use receiver::Receiver;

/// Configuration for the driver.
///
/// Layout-related values are validated by [`Driver::spawn`] before any
/// thread starts.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Capacity of each term buffer; a multiple of the frame alignment, at
    /// least one max-length frame.
    pub term_buffer_length: usize,
    /// Largest frame accepted on the wire; a multiple of the frame
    /// alignment.
    pub max_frame_length: usize,
    /// Header space reserved per logged frame; word aligned.
    pub frame_header_length: usize,
    /// Receiver window advertised in SMs.
    ///
    /// The fixed initial value stands in for a future feedback-driven
    /// strategy.
    pub initial_window: u32,
    /// How long a gap must stand before it is NAKed, and the minimum pause
    /// between repeated NAKs for the same gap.
    pub nak_delay: Duration,
    /// Capacity in bytes of each command ring; a power of two.
    pub command_buffer_length: usize,
    /// `SO_RCVBUF` for destination sockets.
    pub socket_rcvbuf: Option<usize>,
    /// `SO_SNDBUF` for destination sockets.
    pub socket_sndbuf: Option<usize>,
    /// Selector poll timeout; bounds command latency while idle.
    pub poll_timeout: Duration,
    /// Pin the receiver thread to this core.
    pub receiver_core: Option<usize>,
    /// Pin the conductor thread to this core.
    pub conductor_core: Option<usize>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            term_buffer_length: 64 * 1024,
            max_frame_length: 1408,
            frame_header_length: 40,
            initial_window: 1000,
            nak_delay: Duration::from_millis(60),
            command_buffer_length: 64 * 1024,
            socket_rcvbuf: None,
            socket_sndbuf: None,
            poll_timeout: Duration::from_millis(1),
            receiver_core: None,
            conductor_core: None,
        }
    }
}

impl DriverConfig {
    /// Validates the layout invariants.
    ///
    /// # Errors
    ///
    /// Returns the specific [`DriverError`] for the first violated
    /// invariant.
    pub fn validate(&self) -> Result<(), DriverError> {
        check_header_length(self.frame_header_length)?;
        check_max_frame_length(self.max_frame_length)?;
        if self.term_buffer_length % FRAME_ALIGNMENT != 0
            || self.term_buffer_length < self.max_frame_length
        {
            return Err(DriverError::InvalidTermBufferLength(
                self.term_buffer_length,
            ));
        }
        if !self.command_buffer_length.is_power_of_two() || self.command_buffer_length < 1024 {
            return Err(DriverError::InvalidCommandBufferLength(
                self.command_buffer_length,
            ));
        }
        Ok(())
    }
}

/// Errors surfaced by the driver.
#[derive(Debug, Error)]
pub enum DriverError {
    /// Configured frame layout is invalid; prevents startup.
    #[error(transparent)]
    Layout(#[from] LayoutError),
    /// Term buffer length not frame aligned or below the max frame length.
    #[error("invalid term buffer length {0}")]
    InvalidTermBufferLength(usize),
    /// Command ring capacity not a power of two of at least 1024 bytes.
    #[error("invalid command buffer length {0}")]
    InvalidCommandBufferLength(usize),
    /// Channel URI failed to parse.
    #[error(transparent)]
    Destination(#[from] DestinationError),
    /// Application command queue is full; back off and retry.
    #[error("client command queue full")]
    CommandQueueFull,
    /// Term buffer notification for a channel with no subscription.
    #[error("term buffer ready for unknown channel {0}")]
    UnknownChannel(u64),
    /// Term buffer notification for a session never seen on the wire.
    #[error("term buffer ready for unknown session {0}")]
    UnknownSession(u64),
    /// Term buffer notification for a destination with no transport.
    #[error("term buffer ready for unknown destination {0}")]
    UnknownDestination(String),
    /// Buffer notification arrived with an empty event queue.
    #[error("buffer notification without a queued buffer event")]
    MissingBufferEvent,
    /// Transport-level I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Handle to a running driver.
///
/// Dropping the handle flags shutdown without joining; use
/// [`Driver::shutdown`] for a joined stop.
pub struct Driver {
    shutdown: Arc<AtomicBool>,
    client_commands: spsc::Producer<ClientCommand, CLIENT_COMMAND_QUEUE_CAPACITY>,
    receiver_handle: Option<JoinHandle<()>>,
    conductor_handle: Option<JoinHandle<()>>,
}

impl Driver {
    /// Validates the configuration and spawns the receiver and conductor
    /// threads.
    ///
    /// # Errors
    ///
    /// Returns an error when a layout invariant fails or the selector
    /// cannot be created.
    ///
    /// # Panics
    ///
    /// Panics if thread spawning fails.
    pub fn spawn(config: DriverConfig) -> Result<Self, DriverError> {
        config.validate()?;
        info!(
            term_buffer_length = config.term_buffer_length,
            max_frame_length = config.max_frame_length,
            initial_window = config.initial_window,
            "driver starting"
        );

        let (receiver_ring_tx, receiver_ring_rx) = ring::ring_buffer(config.command_buffer_length);
        let (conductor_ring_tx, conductor_ring_rx) =
            ring::ring_buffer(config.command_buffer_length);
        let (buffer_event_tx, buffer_event_rx) = spsc::channel();
        let (client_tx, client_rx) = spsc::channel();

        let shutdown = Arc::new(AtomicBool::new(false));

        let mut receiver = Receiver::new(
            config.clone(),
            receiver_ring_rx,
            buffer_event_rx,
            ConductorProxy::new(conductor_ring_tx),
            Arc::clone(&shutdown),
        )?;
        let mut conductor = Conductor::new(
            &config,
            client_rx,
            conductor_ring_rx,
            ReceiverProxy::new(receiver_ring_tx, buffer_event_tx),
            Arc::clone(&shutdown),
        );

        debug!("spawning receiver thread");
        let receiver_core = config.receiver_core;
        let receiver_handle = thread::Builder::new()
            .name("gale-receiver".into())
            .spawn(move || {
                if let Some(id) = receiver_core {
                    core_affinity::set_for_current(core_affinity::CoreId { id });
                }
                if let Err(_e) = receiver.run() {
                    error!(error = %_e, "receiver thread failed");
                }
            })
            .expect("failed to spawn receiver thread");

        debug!("spawning conductor thread");
        let conductor_core = config.conductor_core;
        let conductor_handle = thread::Builder::new()
            .name("gale-conductor".into())
            .spawn(move || {
                if let Some(id) = conductor_core {
                    core_affinity::set_for_current(core_affinity::CoreId { id });
                }
                conductor.run();
            })
            .expect("failed to spawn conductor thread");

        info!("driver started");
        Ok(Self {
            shutdown,
            client_commands: client_tx,
            receiver_handle: Some(receiver_handle),
            conductor_handle: Some(conductor_handle),
        })
    }

    /// Subscribes to channels on a destination, binding its transport on
    /// first use.
    ///
    /// # Errors
    ///
    /// Returns an error when the URI does not parse or the command queue is
    /// full.
    pub fn add_subscription(&self, channel_uri: &str, channel_ids: &[u64]) -> Result<(), DriverError> {
        Destination::parse(channel_uri)?;
        self.client_commands
            .push(ClientCommand::AddSubscription {
                channel_uri: channel_uri.to_owned(),
                channel_ids: channel_ids.to_vec(),
            })
            .map_err(|_| DriverError::CommandQueueFull)
    }

    /// Releases a previous subscription.
    ///
    /// # Errors
    ///
    /// Returns an error when the URI does not parse or the command queue is
    /// full. An unknown channel surfaces on the receiver thread, not here.
    pub fn remove_subscription(
        &self,
        channel_uri: &str,
        channel_ids: &[u64],
    ) -> Result<(), DriverError> {
        Destination::parse(channel_uri)?;
        self.client_commands
            .push(ClientCommand::RemoveSubscription {
                channel_uri: channel_uri.to_owned(),
                channel_ids: channel_ids.to_vec(),
            })
            .map_err(|_| DriverError::CommandQueueFull)
    }

    /// Flags shutdown and joins both threads.
    pub fn shutdown(mut self) {
        info!("driver shutdown initiated");
        self.shutdown.store(true, Ordering::Relaxed);

        if let Some(handle) = self.receiver_handle.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.conductor_handle.take() {
            let _ = handle.join();
        }
        info!("driver shutdown complete");
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}
