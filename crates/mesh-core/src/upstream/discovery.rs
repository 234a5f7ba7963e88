//! Address updates pushed by an external discovery source.

use serde::{Deserialize, Serialize};

/// Latest address list for one service.
///
/// `service_id` is the textual service identity (`[group!]name[:version]`); an empty
/// `uris` list drains the cluster after its grace delay but keeps it routable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryEvent {
    pub service_id: String,
    pub uris: Vec<String>,
}

impl DiscoveryEvent {
    pub fn new<I, S>(service_id: impl Into<String>, uris: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { service_id: service_id.into(), uris: uris.into_iter().map(Into::into).collect() }
    }
}
