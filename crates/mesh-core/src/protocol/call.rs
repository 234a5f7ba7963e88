//! Per-call metadata and its composite encoding.

use bytes::Bytes;

use super::{
    auth::{decode_bearer, encode_bearer},
    composite::{CompositeMetadata, MetadataEntry},
    mime::MimeType,
    routing::{decode_routing_tags, encode_routing_tags, BinaryRouting, RoutingKey},
    trace::TraceContext,
    ProtocolError,
};

/// Everything a receiver needs to dispatch a call, independent of the payload body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallMetadata {
    pub routing: RoutingKey,
    /// Human-readable `gsv.handler` key, for diagnostics only.
    pub route: Option<String>,
    pub data_mime: MimeType,
    /// Acceptable response encodings in preference order. Empty means "same as request".
    pub accept_mimes: Vec<MimeType>,
    pub bearer_token: Option<String>,
    pub trace: Option<TraceContext>,
    pub routing_tags: Vec<String>,
    /// Entries this codec does not interpret, kept in arrival order.
    pub extra: Vec<MetadataEntry>,
}

impl CallMetadata {
    pub fn new(routing: RoutingKey, data_mime: MimeType) -> Self {
        Self {
            routing,
            route: None,
            data_mime,
            accept_mimes: Vec::new(),
            bearer_token: None,
            trace: None,
            routing_tags: Vec::new(),
            extra: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    #[must_use]
    pub fn with_accept(mut self, mimes: Vec<MimeType>) -> Self {
        self.accept_mimes = mimes;
        self
    }

    #[must_use]
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    #[must_use]
    pub fn with_trace(mut self, trace: TraceContext) -> Self {
        self.trace = Some(trace);
        self
    }

    /// First acceptable response encoding among `supported`, honouring the caller's order.
    pub fn negotiate_response_mime<'a>(&self, supported: &'a [MimeType]) -> Option<&'a MimeType> {
        if self.accept_mimes.is_empty() {
            return supported.iter().find(|mime| **mime == self.data_mime);
        }
        self.accept_mimes
            .iter()
            .find_map(|wanted| supported.iter().find(|mime| *mime == wanted))
    }

    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        RoutingMetadataCodec::encode(self)
    }

    pub fn decode(metadata: Bytes) -> Result<Self, ProtocolError> {
        RoutingMetadataCodec::decode(metadata)
    }
}

/// Encoder/decoder for [`CallMetadata`].
///
/// The binary routing entry is written first so receivers can stop scanning early;
/// the decoder accepts entries in any order. A call without a data-encoding entry is
/// treated as `application/json`.
pub struct RoutingMetadataCodec;

impl RoutingMetadataCodec {
    pub fn encode(call: &CallMetadata) -> Result<Bytes, ProtocolError> {
        let mut composite = CompositeMetadata::new();
        let routing = BinaryRouting { key: call.routing.clone(), route: call.route.clone() };
        composite.push(MimeType::BINARY_ROUTING, routing.encode()?);
        composite.push(MimeType::DATA_MIME, call.data_mime.encode_single()?);
        if !call.accept_mimes.is_empty() {
            composite.push(MimeType::ACCEPT_MIMES, MimeType::encode_list(&call.accept_mimes)?);
        }
        if !call.routing_tags.is_empty() {
            composite.push(MimeType::ROUTING_TAGS, encode_routing_tags(&call.routing_tags)?);
        }
        if let Some(token) = &call.bearer_token {
            composite.push(MimeType::AUTHENTICATION, encode_bearer(token));
        }
        if let Some(trace) = &call.trace {
            composite.push(MimeType::TRACING_ZIPKIN, trace.encode());
        }
        for entry in &call.extra {
            composite.push(entry.mime.clone(), entry.content.clone());
        }
        composite.encode()
    }

    pub fn decode(metadata: Bytes) -> Result<CallMetadata, ProtocolError> {
        let composite = CompositeMetadata::decode(metadata)?;
        let mut routing = None;
        let mut call = CallMetadata::new(RoutingKey::new(0, 0), MimeType::APPLICATION_JSON);

        for entry in composite.entries() {
            let content = entry.content.clone();
            if entry.mime == MimeType::BINARY_ROUTING {
                routing = Some(BinaryRouting::decode(content)?);
            } else if entry.mime == MimeType::DATA_MIME {
                call.data_mime = MimeType::decode_single(content)?;
            } else if entry.mime == MimeType::ACCEPT_MIMES {
                call.accept_mimes = MimeType::decode_list(content)?;
            } else if entry.mime == MimeType::ROUTING_TAGS {
                call.routing_tags = decode_routing_tags(content)?;
            } else if entry.mime == MimeType::AUTHENTICATION {
                call.bearer_token = Some(decode_bearer(content)?);
            } else if entry.mime == MimeType::TRACING_ZIPKIN {
                call.trace = TraceContext::decode(content)?;
            } else {
                call.extra.push(entry.clone());
            }
        }

        let routing = routing.ok_or(ProtocolError::MissingRouting)?;
        call.routing = routing.key;
        call.route = routing.route;
        Ok(call)
    }

    /// Reads only the routing entry, skipping everything else.
    pub fn decode_routing(metadata: Bytes) -> Result<RoutingKey, ProtocolError> {
        let composite = CompositeMetadata::decode(metadata)?;
        let content = composite
            .find(&MimeType::BINARY_ROUTING)
            .cloned()
            .ok_or(ProtocolError::MissingRouting)?;
        Ok(BinaryRouting::decode(content)?.key)
    }
}
