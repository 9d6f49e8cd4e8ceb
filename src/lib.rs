//! Session-oriented remote messaging core: ships typed application messages
//!  between peers over stream (reliable, ordered) and datagram (best-effort,
//!  connection-emulated) transports, and multiplexes synchronous
//!  request/response exchanges over the asynchronous message flow.
//!
//! ## Design goals
//!
//! * The abstraction is a per-peer *session* owning one socket: connect or
//!   accept, send typed messages, issue rpcs, disconnect - with optional
//!   transparent reconnect for client-initiated sessions.
//! * Applications register one codec per message type in a registry that is
//!   frozen before the first session starts; payloads are otherwise opaque
//!   to the core (bring your own serializer).
//! * I/O runs on runtime worker tasks, but user handlers run on an
//!   application-owned context: a dispatcher queue hands decoded messages to
//!   a `drain` call issued from the application's own tick (e.g. a game
//!   loop), preserving per-session delivery order.
//! * Rpc exchanges are correlated by a signed 16-bit id so a receiver can
//!   tell unsolicited messages (`0`), requests expecting a reply (`> 0`) and
//!   replies to its own requests (`< 0`) apart without extra framing.
//! * Datagram peers get connection emulation on a single shared socket: a
//!   handshake packet with a reserved message id creates a virtual session,
//!   subsequent datagrams are demultiplexed by sender address.
//!
//! ## Wire format
//!
//! Every packet starts with a fixed 8-byte header, all fields little-endian:
//!
//! ```ascii
//! 0: len (u16)        - total packet length including the header; authoritative
//! 2: message_id (i32) - registry key identifying the payload codec
//! 6: rpc_id (i16)     - rpc correlation id, 0 for plain messages
//! ```
//!
//! Streams carry packets back to back and are re-framed via `len`; one
//!  datagram carries exactly one packet.

pub mod buffer_pool;
pub mod config;
pub mod context;
pub mod error;
pub mod event_hooks;
pub mod message_dispatcher;
pub mod message_registry;
pub mod packet_header;
pub mod rpc_pool;
pub mod session;

#[cfg(test)]
pub mod test_util;
