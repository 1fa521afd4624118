//! Opcodes the relay cares about. Everything else is forwarded blind.

/// Security handshake, exchanged before any application packet. Fully
/// owned by the codec; must never reach the opposite peer.
pub const GLOBAL_HANDSHAKE: u16 = 0x5000;
/// Client acknowledgement of the security handshake. Codec-owned too.
pub const GLOBAL_HANDSHAKE_OK: u16 = 0x9000;
/// Module identification sent by the client right after the handshake.
pub const GLOBAL_IDENTIFICATION: u16 = 0x2001;

/// Gateway patch response. Carries the download server address when the
/// client needs an update.
pub const GATEWAY_PATCH_RESPONSE: u16 = 0xA100;
/// Gateway login response. Carries the agent server address on success.
pub const GATEWAY_LOGIN_RESPONSE: u16 = 0xA102;
