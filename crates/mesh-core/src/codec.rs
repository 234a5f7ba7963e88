//! Payload codecs.
//!
//! The mesh never looks inside payload bodies; it only needs to turn typed values into
//! bytes tagged with a mime type and back. JSON ships in-tree, other formats implement
//! [`PayloadCodec`].

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use crate::protocol::MimeType;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CodecError {
    #[error("failed to encode {type_name} as {mime}: {message}")]
    Encode { type_name: &'static str, mime: String, message: String },

    #[error("failed to decode {type_name} from {mime}: {message}")]
    Decode { type_name: &'static str, mime: String, message: String },

    #[error("codec for {supported} cannot handle {requested}")]
    UnsupportedMime { supported: String, requested: String },
}

pub trait PayloadCodec: Send + Sync + 'static {
    fn mime_type(&self) -> &MimeType;

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes, CodecError>;

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, CodecError>;

    /// Decodes `data` after checking that it was written with this codec's mime type.
    fn decode_as<T: DeserializeOwned>(&self, data: &[u8], mime: &MimeType) -> Result<T, CodecError> {
        if mime != self.mime_type() {
            return Err(CodecError::UnsupportedMime {
                supported: self.mime_type().to_string(),
                requested: mime.to_string(),
            });
        }
        self.decode(data)
    }
}

static JSON: MimeType = MimeType::APPLICATION_JSON;

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn mime_type(&self) -> &MimeType {
        &JSON
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes, CodecError> {
        serde_json::to_vec(value).map(Bytes::from).map_err(|e| CodecError::Encode {
            type_name: std::any::type_name::<T>(),
            mime: MimeType::APPLICATION_JSON.to_string(),
            message: e.to_string(),
        })
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(data).map_err(|e| CodecError::Decode {
            type_name: std::any::type_name::<T>(),
            mime: MimeType::APPLICATION_JSON.to_string(),
            message: e.to_string(),
        })
    }
}
