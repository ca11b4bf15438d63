//! A reliable file transfer protocol (RFTP) on top of unreliable datagram
//!  delivery. A client requests a batch of files (each with an optional byte
//!  offset to resume from) in a single shot, and the server streams their
//!  contents back with loss detection, selective retransmission, AIMD rate
//!  adaptation and end-to-end integrity verification.
//!
//! ## Design goals
//!
//! * Best-effort bulk transport for finite file sets - explicitly not a
//!   general message channel
//!   * one datagram per 1024-byte file chunk, no IP-level fragmentation games
//!   * no encryption, no peer authentication, no in-order delivery guarantee
//!     at the socket; ordering is reconstructed per file from chunk offsets
//! * The receiver drives reliability: it computes the gaps in what has
//!   arrived and asks for exactly those ranges back (negative acknowledgement
//!   in spirit), while a high-water offset per file acts as the positive ack
//! * Rate adaptation is sender-side AIMD, bounded by a rate the client may
//!   advertise in its request and in every ack
//! * One peer address maps to at most one live session; sessions are
//!   reclaimed by an idle watchdog rather than an explicit teardown handshake
//!
//! ## Wire format
//!
//! Every datagram starts with a 3-byte header (all integers network byte
//!  order):
//!
//! ```ascii
//! 0: (version << 4) | msgType    - version is 1; msgType 0..4
//! 1: ackNum (u8)                 - piggybacked ack sequence number; see below
//! 2: optionLen (u8)              - number of options that follow
//! *: options, each {otype (u8), len (u8), len value bytes}
//! ```
//!
//! Unknown options are carried opaquely and ignored. The message body
//!  follows directly after the options:
//!
//! ```ascii
//! 0 ClientRequest:   maxTransmissionRate (u32), fileCount (u16),
//!                    repeated {offset (u56), nameLen (u16), name}
//! 1 ServerMetadata:  reserved (u8, 0), status (u8), fileIndex (u16),
//!                    size (u64), MD5 checksum (16 bytes)
//! 2 ServerPayload:   fileIndex (u16), offset (u56), chunk bytes (remainder)
//! 3 ClientAck:       fileIndex (u16), status (u8), maxTransmissionRate (u32),
//!                    offset (u56), repeated {fileIndex (u16), offset (u56),
//!                    length (u8)}
//! 4 CloseConnection: reason (u16)
//! ```
//!
//! Offsets are 7-byte big-endian (at most `2^56 - 1`). A ServerPayload's
//!  `offset` counts 1024-byte *chunks* from the requested resume offset,
//!  while a ClientRequest's `offset` is in *bytes* - the receiver translates
//!  with `byteOffset = chunkOffset * 1024 + requestOffset`. This asymmetry
//!  saves wire bits and is deliberate.
//!
//! A resend entry `{fileIndex, offset, length}` asks for `length + 1` chunks
//!  starting at `offset`; an entry with `length == 0` additionally asks for
//!  the file's metadata to be re-issued. Gaps wider than 256 chunks are split
//!  across several entries.
//!
//! The client stamps a monotonically increasing (mod 256) `ackNum` on its
//!  acks; the server echoes the most recently seen value on every payload and
//!  metadata frame it sends, which gives the client a cheap round-trip-time
//!  signal.
//!
//! ## Server anatomy
//!
//! Per peer the server runs exactly three long-lived tasks wired together
//!  with channels:
//!
//! * the *producer* walks the requested files in order, reading 1024-byte
//!   chunks and hashing as it goes, and finishes each file with a terminal
//!   metadata (size + MD5)
//! * the *scheduler* is the single socket writer: it paces sends through the
//!   AIMD governor, stamps the latest observed `ackNum` on every frame and
//!   caches every sent payload for retransmission
//! * the *rescheduler* turns incoming acks into resend work against the
//!   payload cache, deduplicating requests until the scheduler confirms them
//!
//! Cancellation flows exclusively through the per-session [cleaner::Cleaner]:
//!  every loop subscribes to its close broadcast, and its idle deadline is
//!  refreshed on every scheduler iteration.

pub mod chunk_queue;
pub mod cleaner;
pub mod client;
pub mod config;
pub mod congestion;
pub mod connection;
pub mod file_provider;
pub mod messages;
pub mod server;

pub use client::{Client, FileOutcome, FileRequest};
pub use config::{ClientConfig, DuplicateRequestPolicy, ServerConfig};
pub use server::Server;
