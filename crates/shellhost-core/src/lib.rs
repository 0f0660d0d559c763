//! shellhost-core: Core library for shellhost
//!
//! The host-side broker of a single-device OS shell. It supervises sandboxed
//! application processes, negotiates the shared pixel buffers their windows
//! paint into, and reacts to system memory pressure.
//!
//! # Architecture
//!
//! ```text
//! IPC / control sockets ──▶ BrokerEvent channel ──▶ Broker (single task)
//!                                          ├─ ProcessSupervisor ── ProcessSpawner
//!                                          ├─ ConnectionRegistry ─ BufferNegotiator
//!                                          ├─ MemoryPressureGovernor
//!                                          ├─ InstanceCache / HeadlessWatchdog
//!                                          └─ BootSequencer
//!                                                  │
//!                               PresentationSink / NoticeSink
//! ```
//!
//! # Modules
//!
//! - `broker`: Context object, event types and the event loop
//! - `supervisor`: Launch, kill, nuke queue, priorities
//! - `spawn`: Process spawning and sandbox wrappers
//! - `connection`: Per-connection window routing and the close protocol
//! - `buffer`: Shared buffer allocation, resize and flip
//! - `memory_pressure`: Pressure state machine, quotas, launch admission
//! - `proc_stats`: RSS and meminfo readers
//! - `instance_cache`: Instance arena and the keep-alive cache
//! - `watchdog`: Headless instance reaping
//! - `boot`: Startup completion
//! - `ipc`: Wire messages and the Unix socket transport
//! - `control`: Shell control socket (launch, close, caching)
//! - `events`: Presentation and notice sinks
//! - `config`: Configuration management
//! - `logging`: Structured logging setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod boot;
pub mod broker;
pub mod buffer;
pub mod config;
pub mod connection;
pub mod control;
pub mod error;
pub mod events;
pub mod ids;
pub mod instance_cache;
pub mod ipc;
pub mod logging;
pub mod memory_pressure;
pub mod proc_stats;
pub mod spawn;
pub mod supervisor;
pub mod watchdog;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
