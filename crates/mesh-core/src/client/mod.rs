//! Explicit client stubs.
//!
//! A [`ServiceStub`] binds a service identity, a payload codec and the cluster
//! manager; each [`MethodStub`] carries the pre-encoded routing metadata of one handler.

pub mod stub;

pub use stub::{MethodStub, ServiceStub, StubOptions};
