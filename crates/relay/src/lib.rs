//! Intercepting TCP relay for the Silkroad gateway/agent/download
//! protocol. Sits between clients and the real backend, rewrites the
//! gateway's redirect packets to point back at itself, and rebinds each
//! client's follow-up connection to the target the backend really named.

pub mod codec;
pub mod filter;
pub mod handoff;
pub mod listener;
pub mod netaddr;
pub mod opcode;
pub mod packet;
pub mod pipeline;
pub mod session;
pub mod transport;
