//! Single-producer single-consumer channels crossing the receiver/conductor
//! thread boundary.
//!
//! Two flavours, both lock-free and allocation-free in steady state:
//!
//! - [`spsc`]: a typed bounded queue; used where ownership of a value (most
//!   importantly a term buffer) transfers between threads.
//! - [`ring`]: a ring buffer of raw bytes carrying length-prefixed command
//!   records; used for the command channels so the hot path never allocates
//!   per command.

pub mod ring;
pub mod spsc;
