use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use futures::{
    future,
    stream::{self, BoxStream},
    Stream, StreamExt,
};
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    codec::PayloadCodec,
    protocol::{CallMetadata, MimeType, ProtocolError, RoutingKey, TraceContext},
    service::ServiceLocator,
    transport::Payload,
    upstream::{CallOptions, LoadBalancedRequester, SelectionHint, UpstreamClusterManager, UpstreamError},
};

/// Per-stub call settings, copied into every method stub.
#[derive(Debug, Clone, Default)]
pub struct StubOptions {
    pub timeout: Option<Duration>,
    /// Pins calls to one instance, by URI or `ip:<host>`.
    pub endpoint: Option<String>,
    pub sticky: bool,
    pub bearer_token: Option<String>,
    /// Response encodings the caller accepts; empty means any.
    pub accept: Vec<MimeType>,
}

/// Typed entry point to one remote service.
pub struct ServiceStub<C: PayloadCodec> {
    manager: Arc<UpstreamClusterManager>,
    locator: ServiceLocator,
    codec: Arc<C>,
    options: StubOptions,
}

impl<C: PayloadCodec> ServiceStub<C> {
    pub fn new(manager: Arc<UpstreamClusterManager>, locator: ServiceLocator, codec: C) -> Self {
        Self { manager, locator, codec: Arc::new(codec), options: StubOptions::default() }
    }

    #[must_use]
    pub fn with_options(mut self, options: StubOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.options.endpoint = Some(endpoint.into());
        self
    }

    #[must_use]
    pub fn with_sticky(mut self, sticky: bool) -> Self {
        self.options.sticky = sticky;
        self
    }

    #[must_use]
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.options.bearer_token = Some(token.into());
        self
    }

    pub fn locator(&self) -> &ServiceLocator {
        &self.locator
    }

    /// Builds the stub for handler `name`, encoding its metadata once.
    ///
    /// # Errors
    ///
    /// Fails if the metadata cannot be encoded, e.g. an endpoint hint longer than the
    /// routing block allows.
    pub fn method(&self, name: &str) -> Result<MethodStub<C>, ProtocolError> {
        let mut routing = RoutingKey::for_handler(&self.locator, name).with_sticky(self.options.sticky);
        if let Some(endpoint) = &self.options.endpoint {
            routing = routing.with_endpoint(endpoint.clone());
        }
        let mut call = CallMetadata::new(routing, self.codec.mime_type().clone())
            .with_route(self.locator.handler_key(name));
        if !self.options.accept.is_empty() {
            call = call.with_accept(self.options.accept.clone());
        }
        if let Some(token) = &self.options.bearer_token {
            call = call.with_bearer_token(token.clone());
        }
        let metadata = call.encode()?;

        let hint = SelectionHint { endpoint: self.options.endpoint.clone(), sticky: self.options.sticky };
        Ok(MethodStub {
            manager: self.manager.clone(),
            locator: self.locator.clone(),
            codec: self.codec.clone(),
            name: name.to_string(),
            call,
            metadata,
            options: CallOptions { hint, timeout: self.options.timeout },
        })
    }
}

/// One remote handler with its cached routing metadata.
pub struct MethodStub<C: PayloadCodec> {
    manager: Arc<UpstreamClusterManager>,
    locator: ServiceLocator,
    codec: Arc<C>,
    name: String,
    call: CallMetadata,
    metadata: Bytes,
    options: CallOptions,
}

impl<C: PayloadCodec> MethodStub<C> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metadata(&self) -> &Bytes {
        &self.metadata
    }

    fn requester(&self) -> Result<LoadBalancedRequester, UpstreamError> {
        let cluster = self.manager.select_locator(&self.locator)?;
        Ok(cluster.requester().clone())
    }

    fn payload<Req: Serialize + ?Sized>(&self, metadata: Bytes, request: &Req) -> Result<Payload, UpstreamError> {
        Ok(Payload::new(metadata, self.codec.encode(request)?))
    }

    fn decode<Resp: DeserializeOwned>(codec: &C, payload: &Payload) -> Result<Resp, UpstreamError> {
        Ok(codec.decode(&payload.data)?)
    }

    pub async fn request_response<Req, Resp>(&self, request: &Req) -> Result<Resp, UpstreamError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        self.send_request(self.metadata.clone(), request).await
    }

    /// Same as [`Self::request_response`] with a trace context attached.
    pub async fn request_response_traced<Req, Resp>(
        &self,
        request: &Req,
        trace: TraceContext,
    ) -> Result<Resp, UpstreamError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let metadata = self.call.clone().with_trace(trace).encode()?;
        self.send_request(metadata, request).await
    }

    async fn send_request<Req, Resp>(&self, metadata: Bytes, request: &Req) -> Result<Resp, UpstreamError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let payload = self.payload(metadata, request)?;
        let response = self.requester()?.request_response(payload, &self.options).await?;
        Self::decode(&self.codec, &response)
    }

    pub async fn fire_and_forget<Req: Serialize + ?Sized>(&self, request: &Req) -> Result<(), UpstreamError> {
        let payload = self.payload(self.metadata.clone(), request)?;
        self.requester()?.fire_and_forget(payload, &self.options).await
    }

    pub fn request_stream<Req, Resp>(&self, request: &Req) -> BoxStream<'static, Result<Resp, UpstreamError>>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned + Send + 'static,
    {
        let opened = self.payload(self.metadata.clone(), request).and_then(|payload| {
            let requester = self.requester()?;
            Ok(requester.request_stream(payload, self.options.clone()))
        });
        self.decode_stream(opened)
    }

    /// Opens a channel: `first` travels with the routing metadata, `rest` follows as
    /// data-only frames.
    pub fn request_channel<Req, Resp, S>(&self, first: &Req, rest: S) -> BoxStream<'static, Result<Resp, UpstreamError>>
    where
        Req: Serialize + Send + 'static,
        Resp: DeserializeOwned + Send + 'static,
        S: Stream<Item = Req> + Send + 'static,
    {
        let codec = self.codec.clone();
        let outbound = rest
            .map(move |item| -> Result<Payload, UpstreamError> { Ok(Payload::data_only(codec.encode(&item)?)) })
            .boxed();
        let opened = self.payload(self.metadata.clone(), first).and_then(|initial| {
            let requester = self.requester()?;
            Ok(requester.request_channel(initial, outbound, self.options.clone()))
        });
        self.decode_stream(opened)
    }

    fn decode_stream<Resp>(
        &self,
        opened: Result<crate::transport::PayloadStream, UpstreamError>,
    ) -> BoxStream<'static, Result<Resp, UpstreamError>>
    where
        Resp: DeserializeOwned + Send + 'static,
    {
        match opened {
            Ok(responses) => {
                let codec = self.codec.clone();
                responses
                    .map(move |item| item.and_then(|payload| Self::decode(&codec, &payload)))
                    .boxed()
            }
            Err(e) => stream::once(future::ready(Err(e))).boxed(),
        }
    }
}
