//! Inbound dispatch: decode routing metadata, look up the handler, invoke it.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{future, StreamExt};
use tracing::{debug, warn};

use super::{
    definition::{CallContext, Handler, InboundCall, InteractionModel, MethodDescriptor},
    exposure::ExposedServiceTable,
    ServiceRegistry,
};
use crate::{
    protocol::{CallMetadata, ServicesExposed},
    transport::{Payload, PayloadStream, RpcHandler},
    upstream::{error_codes, UpstreamError},
};

pub struct ServiceDispatcher {
    registry: Arc<ServiceRegistry>,
    exposures: Arc<ExposedServiceTable>,
}

impl ServiceDispatcher {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self::with_exposures(registry, Arc::new(ExposedServiceTable::new()))
    }

    pub fn with_exposures(registry: Arc<ServiceRegistry>, exposures: Arc<ExposedServiceTable>) -> Self {
        Self { registry, exposures }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn exposures(&self) -> &Arc<ExposedServiceTable> {
        &self.exposures
    }

    fn resolve(
        &self,
        peer: &str,
        payload: Payload,
        expected: InteractionModel,
    ) -> Result<(Arc<MethodDescriptor>, InboundCall), UpstreamError> {
        let metadata = CallMetadata::decode(payload.metadata).map_err(|e| {
            UpstreamError::application(error_codes::INVALID, format!("malformed call metadata: {e}"))
        })?;
        let routing = &metadata.routing;

        let method = self.registry.find_handler(routing.handler_id).ok_or_else(|| {
            UpstreamError::application(
                error_codes::INVALID,
                format!(
                    "no handler {:#010x} for service {:#010x} ({})",
                    routing.handler_id,
                    routing.service_id,
                    metadata.route.as_deref().unwrap_or("unnamed route")
                ),
            )
        })?;
        if method.service.id() != routing.service_id {
            return Err(UpstreamError::application(
                error_codes::INVALID,
                format!("handler {} does not belong to service {:#010x}", method.key(), routing.service_id),
            ));
        }
        if method.model() != expected {
            return Err(UpstreamError::application(
                error_codes::INVALID,
                format!("handler {} is {}, called as {expected}", method.key(), method.model()),
            ));
        }

        debug!(peer = %peer, handler = %method.key(), model = %expected, "dispatching call");
        let call = InboundCall {
            context: CallContext { metadata, peer: Arc::from(peer) },
            data: payload.data,
        };
        Ok((method, call))
    }
}

fn to_payload_stream(stream: super::definition::HandlerStream) -> PayloadStream {
    stream.map(|item| item.map(Payload::data_only).map_err(UpstreamError::from)).boxed()
}

#[async_trait]
impl RpcHandler for ServiceDispatcher {
    async fn request_response(&self, peer: &str, payload: Payload) -> Result<Payload, UpstreamError> {
        let (method, call) = self.resolve(peer, payload, InteractionModel::RequestResponse)?;
        let Handler::RequestResponse(handler) = &method.handler else {
            return Err(UpstreamError::application(error_codes::INVALID, "interaction model mismatch"));
        };
        let data = handler(call).await?;
        Ok(Payload::data_only(data))
    }

    async fn fire_and_forget(&self, peer: &str, payload: Payload) -> Result<(), UpstreamError> {
        let (method, call) = self.resolve(peer, payload, InteractionModel::FireAndForget)?;
        let Handler::FireAndForget(handler) = &method.handler else {
            return Err(UpstreamError::application(error_codes::INVALID, "interaction model mismatch"));
        };
        if let Err(e) = handler(call).await {
            warn!(peer = %peer, handler = %method.key(), error = %e, "fire-and-forget handler failed");
        }
        Ok(())
    }

    async fn request_stream(&self, peer: &str, payload: Payload) -> Result<PayloadStream, UpstreamError> {
        let (method, call) = self.resolve(peer, payload, InteractionModel::RequestStream)?;
        let Handler::RequestStream(handler) = &method.handler else {
            return Err(UpstreamError::application(error_codes::INVALID, "interaction model mismatch"));
        };
        Ok(to_payload_stream(handler(call)))
    }

    async fn request_channel(
        &self,
        peer: &str,
        initial: Payload,
        inbound: PayloadStream,
    ) -> Result<PayloadStream, UpstreamError> {
        let (method, call) = self.resolve(peer, initial, InteractionModel::RequestChannel)?;
        let Handler::RequestChannel(handler) = &method.handler else {
            return Err(UpstreamError::application(error_codes::INVALID, "interaction model mismatch"));
        };
        // The inbound side ends at its first error.
        let inbound = inbound
            .take_while(|item| future::ready(item.is_ok()))
            .filter_map(|item| future::ready(item.ok().map(|payload| payload.data)))
            .boxed();
        Ok(to_payload_stream(handler(call, inbound)))
    }

    async fn metadata_push(&self, peer: &str, metadata: Bytes) -> Result<(), UpstreamError> {
        match ServicesExposed::decode(metadata) {
            Ok(Some(event)) => {
                self.exposures.replace(peer, event);
                Ok(())
            }
            Ok(None) => {
                debug!(peer = %peer, "ignoring unrecognised metadata push");
                Ok(())
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "malformed metadata push");
                Err(e.into())
            }
        }
    }

    fn peer_closed(&self, peer: &str) {
        if self.exposures.remove_peer(peer) {
            debug!(peer = %peer, "dropped exposure view of closed peer");
        }
    }
}
