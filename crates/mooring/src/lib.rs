//! Session-oriented network acceptor core.
//!
//! Two subsystems make up the concurrency contract of the framework:
//!
//! * [`sync::CompletionFuture`], a one-shot latch for the outcome of any
//!   asynchronous operation, with blocking waits and attach-anytime
//!   listeners that fire exactly once.
//! * [`net::TcpAcceptor`], which binds endpoints atomically, throttles live
//!   sessions through a semaphore-backed admission gate, drives accept
//!   loops on a worker pool and hands accepted sessions to a
//!   [`net::SessionProcessor`]. The admission slot of a session is returned
//!   exactly when that session is destroyed.
//!
//! Background failures (accept errors, session setup, listener callbacks)
//! have no caller to unwind to and are delivered to the process-wide
//! [`fault`] sink instead.

pub mod fault;
pub mod io;
pub mod net;
pub mod rt;
pub mod sync;

pub use net::{TcpAcceptor, TcpAcceptorBuilder};
pub use sync::CompletionFuture;
