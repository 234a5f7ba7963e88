//! Explicit service definitions.
//!
//! Handlers are registered as plain function values with their parameter and return
//! types stated at registration. The typed builder methods wrap a function with the
//! service's [`PayloadCodec`] so the dispatcher only ever moves bytes.

use std::{any::type_name, fmt, future::Future, sync::Arc};

use bytes::Bytes;
use futures::{
    future::{self, BoxFuture},
    stream::{self, BoxStream},
    Stream, StreamExt,
};
use serde::{de::DeserializeOwned, Serialize};

use super::ServiceLocator;
use crate::{
    codec::{CodecError, PayloadCodec},
    protocol::CallMetadata,
    upstream::{error_codes, UpstreamError},
};

/// Error a handler answers with. Travels back to the caller as an application error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    pub code: u32,
    pub message: String,
}

impl HandlerError {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn application(message: impl Into<String>) -> Self {
        Self::new(error_codes::APPLICATION_ERROR, message)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(error_codes::INVALID, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(error_codes::REJECTED, message)
    }

    fn request_decode(err: CodecError) -> Self {
        Self::invalid(err.to_string())
    }

    fn response_encode(err: CodecError) -> Self {
        Self::application(err.to_string())
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}: {}", self.code, self.message)
    }
}

impl std::error::Error for HandlerError {}

impl From<HandlerError> for UpstreamError {
    fn from(err: HandlerError) -> Self {
        UpstreamError::Application { code: err.code, message: err.message }
    }
}

/// What the handler sees about the call besides its body.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub metadata: CallMetadata,
    /// Session the call arrived on.
    pub peer: Arc<str>,
}

impl CallContext {
    pub fn bearer_token(&self) -> Option<&str> {
        self.metadata.bearer_token.as_deref()
    }
}

#[derive(Debug, Clone)]
pub struct InboundCall {
    pub context: CallContext,
    pub data: Bytes,
}

pub type HandlerFuture<T> = BoxFuture<'static, Result<T, HandlerError>>;
pub type HandlerStream = BoxStream<'static, Result<Bytes, HandlerError>>;
pub type InboundStream = BoxStream<'static, Bytes>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InteractionModel {
    RequestResponse,
    FireAndForget,
    RequestStream,
    RequestChannel,
}

impl fmt::Display for InteractionModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::RequestResponse => "request-response",
            Self::FireAndForget => "fire-and-forget",
            Self::RequestStream => "request-stream",
            Self::RequestChannel => "request-channel",
        })
    }
}

/// Byte-level handler function, one variant per interaction model.
#[derive(Clone)]
pub enum Handler {
    RequestResponse(Arc<dyn Fn(InboundCall) -> HandlerFuture<Bytes> + Send + Sync>),
    FireAndForget(Arc<dyn Fn(InboundCall) -> HandlerFuture<()> + Send + Sync>),
    RequestStream(Arc<dyn Fn(InboundCall) -> HandlerStream + Send + Sync>),
    RequestChannel(Arc<dyn Fn(InboundCall, InboundStream) -> HandlerStream + Send + Sync>),
}

impl Handler {
    pub fn model(&self) -> InteractionModel {
        match self {
            Self::RequestResponse(_) => InteractionModel::RequestResponse,
            Self::FireAndForget(_) => InteractionModel::FireAndForget,
            Self::RequestStream(_) => InteractionModel::RequestStream,
            Self::RequestChannel(_) => InteractionModel::RequestChannel,
        }
    }
}

/// A registered handler: routing identity, declared types and the function itself.
#[derive(Clone)]
pub struct MethodDescriptor {
    pub service: ServiceLocator,
    pub name: String,
    pub handler_id: u32,
    pub param_type: &'static str,
    pub return_type: &'static str,
    pub handler: Handler,
}

impl MethodDescriptor {
    pub fn model(&self) -> InteractionModel {
        self.handler.model()
    }

    /// The `gsv.handler` key the handler id is hashed from.
    pub fn key(&self) -> String {
        self.service.handler_key(&self.name)
    }
}

impl fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("key", &self.key())
            .field("handler_id", &format_args!("{:#010x}", self.handler_id))
            .field("model", &self.model())
            .field("param_type", &self.param_type)
            .field("return_type", &self.return_type)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ServiceDefinition {
    pub locator: ServiceLocator,
    pub methods: Vec<MethodDescriptor>,
}

impl ServiceDefinition {
    /// Builder whose typed methods encode and decode with `codec`.
    pub fn builder<C: PayloadCodec>(locator: ServiceLocator, codec: C) -> ServiceDefinitionBuilder<C> {
        ServiceDefinitionBuilder { locator, codec: Arc::new(codec), methods: Vec::new() }
    }

    /// Builder for byte-level handlers only.
    pub fn untyped(locator: ServiceLocator) -> ServiceDefinitionBuilder<crate::codec::JsonCodec> {
        Self::builder(locator, crate::codec::JsonCodec)
    }
}

pub struct ServiceDefinitionBuilder<C> {
    locator: ServiceLocator,
    codec: Arc<C>,
    methods: Vec<MethodDescriptor>,
}

fn decode_request<C: PayloadCodec, T: DeserializeOwned>(
    codec: &C,
    call: &InboundCall,
) -> Result<T, HandlerError> {
    let metadata = &call.context.metadata;
    if !metadata.accept_mimes.is_empty() &&
        metadata.negotiate_response_mime(std::slice::from_ref(codec.mime_type())).is_none()
    {
        return Err(HandlerError::invalid(format!(
            "no acceptable response encoding, handler produces {}",
            codec.mime_type()
        )));
    }
    codec.decode_as(&call.data, &metadata.data_mime).map_err(HandlerError::request_decode)
}

impl<C: PayloadCodec> ServiceDefinitionBuilder<C> {
    /// Registers a byte-level handler with explicit type descriptors.
    #[must_use]
    pub fn raw(
        mut self,
        name: &str,
        handler: Handler,
        param_type: &'static str,
        return_type: &'static str,
    ) -> Self {
        self.methods.push(MethodDescriptor {
            service: self.locator.clone(),
            name: name.to_string(),
            handler_id: self.locator.handler_id(name),
            param_type,
            return_type,
            handler,
        });
        self
    }

    #[must_use]
    pub fn request_response<Req, Resp, F, Fut>(self, name: &str, f: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, HandlerError>> + Send + 'static,
    {
        let codec = self.codec.clone();
        let f = Arc::new(f);
        let handler = move |call: InboundCall| -> HandlerFuture<Bytes> {
            let codec = codec.clone();
            let f = f.clone();
            Box::pin(async move {
                let request: Req = decode_request(&*codec, &call)?;
                let response = f(request, call.context).await?;
                codec.encode(&response).map_err(HandlerError::response_encode)
            })
        };
        self.raw(name, Handler::RequestResponse(Arc::new(handler)), type_name::<Req>(), type_name::<Resp>())
    }

    #[must_use]
    pub fn fire_and_forget<Req, F, Fut>(self, name: &str, f: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        F: Fn(Req, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let codec = self.codec.clone();
        let f = Arc::new(f);
        let handler = move |call: InboundCall| -> HandlerFuture<()> {
            let request = codec.decode_as::<Req>(&call.data, &call.context.metadata.data_mime);
            let f = f.clone();
            Box::pin(async move {
                let request = request.map_err(HandlerError::request_decode)?;
                f(request, call.context).await
            })
        };
        self.raw(name, Handler::FireAndForget(Arc::new(handler)), type_name::<Req>(), "()")
    }

    #[must_use]
    pub fn request_stream<Req, Resp, F, S>(self, name: &str, f: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req, CallContext) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<Resp, HandlerError>> + Send + 'static,
    {
        let codec = self.codec.clone();
        let handler = move |call: InboundCall| -> HandlerStream {
            let request: Req = match decode_request(&*codec, &call) {
                Ok(request) => request,
                Err(e) => return stream::once(future::ready(Err(e))).boxed(),
            };
            let codec = codec.clone();
            f(request, call.context)
                .map(move |item| {
                    item.and_then(|resp| codec.encode(&resp).map_err(HandlerError::response_encode))
                })
                .boxed()
        };
        self.raw(name, Handler::RequestStream(Arc::new(handler)), type_name::<Req>(), type_name::<Resp>())
    }

    /// The first request arrives decoded; the rest come through the inbound stream.
    #[must_use]
    pub fn request_channel<Req, Resp, F, S>(self, name: &str, f: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req, BoxStream<'static, Result<Req, HandlerError>>, CallContext) -> S
            + Send
            + Sync
            + 'static,
        S: Stream<Item = Result<Resp, HandlerError>> + Send + 'static,
    {
        let codec = self.codec.clone();
        let handler = move |call: InboundCall, inbound: InboundStream| -> HandlerStream {
            let first: Req = match decode_request(&*codec, &call) {
                Ok(request) => request,
                Err(e) => return stream::once(future::ready(Err(e))).boxed(),
            };
            let inbound_codec = codec.clone();
            let rest = inbound
                .map(move |data| {
                    inbound_codec.decode::<Req>(&data).map_err(HandlerError::request_decode)
                })
                .boxed();
            let codec = codec.clone();
            f(first, rest, call.context)
                .map(move |item| {
                    item.and_then(|resp| codec.encode(&resp).map_err(HandlerError::response_encode))
                })
                .boxed()
        };
        self.raw(name, Handler::RequestChannel(Arc::new(handler)), type_name::<Req>(), type_name::<Resp>())
    }

    pub fn build(self) -> ServiceDefinition {
        ServiceDefinition { locator: self.locator, methods: self.methods }
    }
}
