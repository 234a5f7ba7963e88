//! Authentication entry (`0x7C`). Only the well-known bearer type is produced; the
//! token is opaque to the mesh.

use bytes::{BufMut, Bytes, BytesMut};

use super::{wire::WireReader, ProtocolError};

const WELL_KNOWN_AUTH_FLAG: u8 = 0x80;
const BEARER_AUTH_ID: u8 = 0x01;

pub fn encode_bearer(token: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(token.len() + 1);
    buf.put_u8(WELL_KNOWN_AUTH_FLAG | BEARER_AUTH_ID);
    buf.put_slice(token.as_bytes());
    buf.freeze()
}

pub fn decode_bearer(content: Bytes) -> Result<String, ProtocolError> {
    let mut reader = WireReader::new(content, "bearer token");
    let auth_type = reader.u8()?;
    if auth_type != (WELL_KNOWN_AUTH_FLAG | BEARER_AUTH_ID) {
        return Err(ProtocolError::UnsupportedAuthType(auth_type));
    }
    let len = reader.remaining();
    reader.string(len)
}
