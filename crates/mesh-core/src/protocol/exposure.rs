//! Service-exposure notification, pushed as metadata after every (re)connect.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::{composite::CompositeMetadata, mime::MimeType, ProtocolError};
use crate::service::ServiceLocator;

/// Full set of services a process exposes. Receivers replace, never merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicesExposed {
    pub instance_id: String,
    pub services: Vec<ServiceLocator>,
}

impl ServicesExposed {
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let json = serde_json::to_vec(self).map_err(|e| ProtocolError::Malformed {
            context: "services exposed",
            message: e.to_string(),
        })?;
        CompositeMetadata::new().with(MimeType::SERVICES_EXPOSED, Bytes::from(json)).encode()
    }

    /// Returns `Ok(None)` when the metadata push carries some other control message.
    pub fn decode(metadata: Bytes) -> Result<Option<Self>, ProtocolError> {
        let composite = CompositeMetadata::decode(metadata)?;
        let Some(content) = composite.find(&MimeType::SERVICES_EXPOSED) else {
            return Ok(None);
        };
        serde_json::from_slice(content).map(Some).map_err(|e| ProtocolError::Malformed {
            context: "services exposed",
            message: e.to_string(),
        })
    }
}
