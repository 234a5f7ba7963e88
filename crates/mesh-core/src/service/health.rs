//! Reserved health service.
//!
//! Every registry carries it. Probes call its `check` handler with no payload and read
//! back a JSON integer status.

use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc, LazyLock,
};

use bytes::Bytes;

use super::{
    definition::{Handler, HandlerFuture, InboundCall, ServiceDefinition},
    ServiceLocator,
};
use crate::{
    protocol::{CallMetadata, MimeType, ProtocolError, RoutingKey},
    transport::Payload,
};

pub const HEALTH_SERVICE_NAME: &str = "mesh.health.HealthService";
pub const HEALTH_HANDLER: &str = "check";

static HEALTH_LOCATOR: LazyLock<ServiceLocator> =
    LazyLock::new(|| ServiceLocator::new("", HEALTH_SERVICE_NAME, ""));

static HEALTH_METADATA: LazyLock<Result<Bytes, ProtocolError>> = LazyLock::new(|| {
    CallMetadata::new(health_routing_key(), MimeType::APPLICATION_JSON)
        .with_route(HEALTH_LOCATOR.handler_key(HEALTH_HANDLER))
        .encode()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HealthStatus {
    Unknown = 0,
    Serving = 1,
    NotServing = 2,
    ServiceUnknown = 3,
}

impl HealthStatus {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Unknown),
            1 => Some(Self::Serving),
            2 => Some(Self::NotServing),
            3 => Some(Self::ServiceUnknown),
            _ => None,
        }
    }

    pub fn encode(self) -> Bytes {
        Bytes::from(self.code().to_string())
    }

    /// Parses the JSON integer body of a health response.
    pub fn decode(data: &[u8]) -> Option<Self> {
        serde_json::from_slice::<u8>(data).ok().and_then(Self::from_code)
    }
}

pub fn health_locator() -> &'static ServiceLocator {
    &HEALTH_LOCATOR
}

pub fn health_routing_key() -> RoutingKey {
    RoutingKey::for_handler(&HEALTH_LOCATOR, HEALTH_HANDLER)
}

pub fn is_reserved(locator: &ServiceLocator) -> bool {
    locator == &*HEALTH_LOCATOR
}

/// Metadata-only probe payload.
pub fn health_check_payload() -> Result<Payload, ProtocolError> {
    let metadata = HEALTH_METADATA.clone()?;
    Ok(Payload::new(metadata, Bytes::new()))
}

pub(crate) fn health_service(status: Arc<AtomicU8>) -> ServiceDefinition {
    let check = move |_call: InboundCall| -> HandlerFuture<Bytes> {
        let code = status.load(Ordering::Acquire);
        Box::pin(async move { Ok(Bytes::from(code.to_string())) })
    };
    ServiceDefinition::untyped(HEALTH_LOCATOR.clone())
        .raw(HEALTH_HANDLER, Handler::RequestResponse(Arc::new(check)), "()", "HealthStatus")
        .build()
}
