//! Self-describing call metadata.
//!
//! Every call carries a composite metadata block next to its payload. The block is a
//! list of typed entries; the binary routing entry is authoritative for dispatch and the
//! rest (encodings, bearer token, trace context, routing tags) are optional.
//!
//! ```text
//! ┌──────────────┬────────────┬──────────────────────┐
//! │ mime (1..129)│ length u24 │ content              │  × N entries
//! └──────────────┴────────────┴──────────────────────┘
//! ```

pub mod auth;
pub mod call;
pub mod composite;
pub mod errors;
pub mod exposure;
pub mod mime;
pub mod routing;
pub mod trace;
mod wire;

pub use call::{CallMetadata, RoutingMetadataCodec};
pub use composite::{CompositeMetadata, MetadataEntry};
pub use errors::ProtocolError;
pub use exposure::ServicesExposed;
pub use mime::MimeType;
pub use routing::{BinaryRouting, RoutingKey};
pub use trace::TraceContext;
