//! A TCP stream reassembly core for a network intrusion detection/prevention
//! engine.
//!
//! For each observed TCP connection this crate ingests out-of-order,
//! overlapping, retransmitted, and possibly malicious segments and produces
//! two ordered per-direction byte streams that downstream consumers -- an
//! application-layer protocol parser and a raw pattern-matcher -- can scan
//! as if they were reading the endpoints' own receive buffers. It
//! faithfully emulates the receive-side overlap semantics of several
//! end-host TCP stacks (the [`config::OsPolicy`] table) so an attacker can't
//! evade detection by exploiting OS-specific reassembly quirks, bounds
//! memory under adversarial input via a single shared [`memory::BufferPool`],
//! and operates under a strict per-flow locking discipline: every entry
//! point in [`engine`] assumes its `&mut Session` is already exclusively
//! held by the caller and performs no further locking itself.
//!
//! Packet capture and decoding, IP defragmentation, the TCP
//! handshake/state-machine tracker, the rule language, and alert/output
//! formatting are external collaborators -- this crate only consumes their
//! decisions (a stream's initial sequence number, its current
//! [`stream::State`]) and calls back out through the [`app::AppLayerSink`]
//! and [`raw::RawMatcherSink`] trait seams.
//!
//! A minimal embedding looks like:
//!
//! ```rust
//! use reassembly_core::config::{default_config, OsPolicy};
//! use reassembly_core::engine;
//! use reassembly_core::error::EventSink;
//! use reassembly_core::app::NullSink;
//! use reassembly_core::raw::NullRawSink;
//! use reassembly_core::runtime::{PerThreadContext, ReassemblyRuntime};
//! use reassembly_core::stream::{Direction, Session, SegmentInputFlags};
//!
//! let runtime = ReassemblyRuntime::new(default_config());
//! let ctx = PerThreadContext::new();
//! let mut session = Session::new(/* isn_client */ 1000, /* isn_server */ 9000, OsPolicy::Linux);
//! let mut app_sink = NullSink;
//! let mut raw_sink = NullRawSink;
//! let mut events = EventSink::new();
//!
//! engine::on_data_segment(
//!     &mut session, &runtime, &ctx, Direction::ToServer, 1001, b"GET / HTTP/1.1\r\n\r\n",
//!     SegmentInputFlags::none(), None, /* flow_id */ 1, &mut app_sink, &mut raw_sink, &mut events,
//! );
//! engine::on_ack(
//!     &mut session, &runtime, &ctx, Direction::ToClient, 1020, 65535, 1, &mut app_sink, &mut raw_sink, &mut events,
//! ).unwrap();
//! engine::on_session_destroy(&mut session, &runtime);
//! ```

pub mod app;
pub mod config;
pub mod depth;
pub mod engine;
pub mod error;
pub mod flowvar;
pub mod memory;
pub mod overlap;
pub mod pruner;
pub mod raw;
pub mod runtime;
pub mod segment;
pub mod seq;
pub mod stream;

pub use engine::{on_ack, on_data_segment, on_session_destroy, on_trigger_raw, SegmentOutcome};
pub use runtime::{PerThreadContext, ReassemblyRuntime};
pub use stream::{Direction, Session, Stream};
