//! Service identity and the receiving side of the mesh.
//!
//! - [`ServiceLocator`] names services and derives their wire ids.
//! - [`ServiceRegistry`] maps handler ids to explicitly registered handlers.
//! - [`ServiceDispatcher`] decodes inbound metadata and invokes the handler.
//! - [`ExposedServiceTable`] tracks what each connected peer exposes.

pub mod definition;
pub mod dispatcher;
pub mod exposure;
pub mod health;
pub mod locator;
pub mod registry;

pub use definition::{
    CallContext, Handler, HandlerError, InboundCall, InteractionModel, MethodDescriptor,
    ServiceDefinition, ServiceDefinitionBuilder,
};
pub use dispatcher::ServiceDispatcher;
pub use exposure::{ExposedServiceTable, PeerServices};
pub use health::HealthStatus;
pub use locator::{gsv, handler_key, routing_hash, LocatorError, ServiceLocator};
pub use registry::{RegistryError, ServiceRegistry};
