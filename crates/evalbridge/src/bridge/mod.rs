//! Wire layer between the driver and the worker.
//!
//! # Architecture
//!
//! - **protocol**: message types (DriverMessage, WorkerMessage)
//! - **codec**: JSON framing codec for AsyncRead/AsyncWrite
//! - **channel**: typed duplex endpoints over pipes, stdio or memory

pub mod channel;
pub mod codec;
pub mod protocol;
