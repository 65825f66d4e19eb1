//! Handshake magic markers.
//!
//! Opaque 4-byte values whose only role is telling protocol states apart.

const fn tag(bytes: &[u8; 4]) -> i32 {
    i32::from_le_bytes(*bytes)
}

/// Initiator opens a login (also opens the nested login inside registration)
pub const C_CONNECT: i32 = tag(b"CCON");
/// Responder acknowledges `C_CONNECT`
pub const S_CONNECT: i32 = tag(b"SCON");
/// Initiator opens a registration
pub const C_NEW: i32 = tag(b"CNEW");
/// Responder acknowledges `C_NEW`
pub const S_NEW: i32 = tag(b"SNEW");
/// First message through a freshly established cipher, sent by the responder
pub const FS_CONNECT: i32 = tag(b"FSCN");
/// Initiator's confirmation of `FS_CONNECT`
pub const FC_CONNECT: i32 = tag(b"FCCN");
/// Exchanged by both sides once the permanent registration cipher is up
pub const SUB_NEW: i32 = tag(b"SUBN");
/// Sent instead of `FS_CONNECT` when the requested name is already registered
pub const S_NAME_TAKEN: i32 = tag(b"STKN");
/// Out-of-band notice that a newer session replaced this one
pub const LOG_OUT: i32 = tag(b"LOUT");
