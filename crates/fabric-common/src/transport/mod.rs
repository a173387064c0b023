//! Fabric Transport Layer
//!
//! Socket plumbing shared by the wire protocols.
//!
//! # Components
//!
//! - **[`TcpTransport`]**: async TCP connect (optionally TLS) and chunk IO
//! - **[`VstCodec`]**: encode/decode VST message payloads
//! - **[`ChunkAssembler`]** / [`split_message`]: VST chunk framing
//!
//! # VST Wire Format
//!
//! A VST socket starts with the preamble `VST/1.1\r\n\r\n`. Every message is
//! then sent as one or more chunks, each with a 24-byte little-endian header.
//! Chunks of different messages may interleave, which is what lets many
//! requests share one socket. Messages larger than 100 MB are rejected.

pub mod codec;
pub mod tcp;

pub use codec::{
    split_message, Chunk, ChunkAssembler, ChunkHeader, VstCodec, CHUNK_HEADER_SIZE,
    DEFAULT_CHUNK_SIZE, MAX_MESSAGE_SIZE, VST_HANDSHAKE,
};
pub use tcp::{BoxedStream, IoStream, TcpTransport, DEFAULT_CONNECT_TIMEOUT};
