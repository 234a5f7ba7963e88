//! Local table of exposed services and their handlers.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
};

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{info, warn};

use super::{
    definition::{MethodDescriptor, ServiceDefinition},
    health::{self, HealthStatus},
    ServiceLocator,
};

/// Registration failures. Id collisions are configuration errors and always reject the
/// incoming registration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RegistryError {
    #[error("service {0} is already registered")]
    DuplicateService(String),

    #[error("service {0} is reserved")]
    ReservedService(String),

    #[error("service id {id:#010x} of {incoming} collides with registered service {existing}")]
    ServiceIdCollision { id: u32, existing: String, incoming: String },

    #[error("handler id {id:#010x} of {incoming} collides with registered handler {existing}")]
    HandlerIdCollision { id: u32, existing: String, incoming: String },

    #[error("handler {handler} is declared twice on {service}")]
    DuplicateHandler { service: String, handler: String },
}

#[derive(Default)]
struct RegistryTables {
    services: HashMap<u32, ServiceLocator>,
    handlers: HashMap<u32, Arc<MethodDescriptor>>,
}

/// Services this process exposes, keyed by wire ids.
///
/// One instance is created by the composition root and shared by reference with the
/// dispatcher and the requesters that re-announce it.
pub struct ServiceRegistry {
    tables: RwLock<RegistryTables>,
    health: Arc<AtomicU8>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        let health = Arc::new(AtomicU8::new(HealthStatus::Serving.code()));
        let registry = Self { tables: RwLock::new(RegistryTables::default()), health };
        registry.insert(health::health_service(registry.health.clone()));
        registry
    }

    /// Registers every handler of `definition`, or none of them.
    ///
    /// # Errors
    ///
    /// Rejects reserved and already-registered services, duplicate handler names, and any
    /// service or handler id that collides with one already in the table.
    pub fn register(&self, definition: ServiceDefinition) -> Result<(), RegistryError> {
        let locator = &definition.locator;
        if health::is_reserved(locator) {
            return Err(RegistryError::ReservedService(locator.gsv().to_string()));
        }

        let mut tables = self.tables.write();
        match tables.services.get(&locator.id()) {
            Some(existing) if existing == locator => {
                return Err(RegistryError::DuplicateService(locator.gsv().to_string()));
            }
            Some(existing) => {
                warn!(id = locator.id(), existing = %existing, incoming = %locator, "service id collision");
                return Err(RegistryError::ServiceIdCollision {
                    id: locator.id(),
                    existing: existing.gsv().to_string(),
                    incoming: locator.gsv().to_string(),
                });
            }
            None => {}
        }

        let mut pending: HashMap<u32, &MethodDescriptor> = HashMap::new();
        for method in &definition.methods {
            if let Some(previous) = pending.get(&method.handler_id) {
                if previous.name == method.name {
                    return Err(RegistryError::DuplicateHandler {
                        service: locator.gsv().to_string(),
                        handler: method.name.clone(),
                    });
                }
                return Err(RegistryError::HandlerIdCollision {
                    id: method.handler_id,
                    existing: previous.key(),
                    incoming: method.key(),
                });
            }
            if let Some(existing) = tables.handlers.get(&method.handler_id) {
                warn!(id = method.handler_id, existing = %existing.key(), incoming = %method.key(), "handler id collision");
                return Err(RegistryError::HandlerIdCollision {
                    id: method.handler_id,
                    existing: existing.key(),
                    incoming: method.key(),
                });
            }
            pending.insert(method.handler_id, method);
        }

        info!(service = %definition.locator, handlers = definition.methods.len(), "service registered");
        Self::insert_into(&mut tables, definition);
        Ok(())
    }

    fn insert(&self, definition: ServiceDefinition) {
        Self::insert_into(&mut self.tables.write(), definition);
    }

    fn insert_into(tables: &mut RegistryTables, definition: ServiceDefinition) {
        tables.services.insert(definition.locator.id(), definition.locator);
        for method in definition.methods {
            tables.handlers.insert(method.handler_id, Arc::new(method));
        }
    }

    /// Removes a service and its handlers. The reserved health service stays.
    pub fn unregister(&self, locator: &ServiceLocator) -> bool {
        if health::is_reserved(locator) {
            return false;
        }
        let mut tables = self.tables.write();
        if tables.services.remove(&locator.id()).is_none() {
            return false;
        }
        tables.handlers.retain(|_, method| &method.service != locator);
        info!(service = %locator, "service unregistered");
        true
    }

    pub fn find_handler(&self, handler_id: u32) -> Option<Arc<MethodDescriptor>> {
        self.tables.read().handlers.get(&handler_id).cloned()
    }

    pub fn find_service(&self, service_id: u32) -> Option<ServiceLocator> {
        self.tables.read().services.get(&service_id).cloned()
    }

    /// Locally registered services, reserved ones excluded, ordered by GSV.
    pub fn exposed_services(&self) -> Vec<ServiceLocator> {
        let mut services: Vec<_> = self
            .tables
            .read()
            .services
            .values()
            .filter(|locator| !health::is_reserved(locator))
            .cloned()
            .collect();
        services.sort_by(|a, b| a.gsv().cmp(b.gsv()));
        services
    }

    /// A process exposing services is a provider; otherwise it only consumes.
    pub fn has_exposed_services(&self) -> bool {
        self.tables.read().services.values().any(|locator| !health::is_reserved(locator))
    }

    pub fn health_status(&self) -> HealthStatus {
        HealthStatus::from_code(self.health.load(Ordering::Acquire)).unwrap_or(HealthStatus::Unknown)
    }

    /// Switching to `NotServing` makes peers' probes fail so they drain traffic away.
    pub fn set_health_status(&self, status: HealthStatus) {
        let previous = self.health.swap(status.code(), Ordering::AcqRel);
        if previous != status.code() {
            info!(status = ?status, "health status changed");
        }
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
