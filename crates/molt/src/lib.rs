//! # molt
//!
//! A parent-watchdog / worker-child supervisor for long-lived network
//! services, with zero-downtime upgrades.
//!
//! ## Overview
//!
//! One binary, three roles:
//!
//! 1. The **parent** binds every TCP listener up front, then spawns a child
//!    that inherits the listener fds plus a pair of control pipes on fds 3
//!    and 4.
//! 2. The **child** rebuilds its listeners from the inherited fds, reports
//!    readiness over the control channel, and serves until asked to drain.
//! 3. A hot upgrade (`SIGUSR2`, or re-running the binary with the upgrade
//!    flag) re-executes the program as a fresh child on the same listener
//!    fds; the old child is retired only after the new one reports ready,
//!    so the listening sockets never close.
//!
//! Crashed children are restarted until a configurable budget runs out, at
//! which point the parent exits non-zero and an outer process manager takes
//! over.
//!
//! ## Signal conventions
//!
//! - `SIGINT` / `SIGTERM` — graceful shutdown
//! - `SIGUSR2` — hot upgrade
//!
//! ## Platform
//!
//! Unix only: the model is built on fd inheritance across fork/exec and on
//! Unix signals.

#[cfg(not(unix))]
compile_error!("molt requires a Unix platform");

mod buffer;
mod child;
mod error;
pub mod listener;
mod pipe;
mod protocol;
mod supervisor;

pub use buffer::ByteBuffer;
pub use child::{ChildCmd, CHILD_FD_BASE, CONTROL_READ_FD, CONTROL_WRITE_FD};
pub use error::{MoltError, PipeError};
pub use pipe::{FramedPipe, FRAME_HEADER_LEN};
pub use protocol::{decode_fd_map, encode_fd_map, ControlFrame, TcpFdMap};
pub use supervisor::{Supervisor, DEFAULT_REBOOT_BUDGET};
