//! Write transport contract.
//!
//! The HTTP layer (auth, retries, timeouts) lives outside this crate. The
//! coordinator only needs a way to send one entity's fields, and optionally
//! several entities' fields in one request. Implementations must:
//!
//! - attach [`WriteRequest::if_match`] as the conditional-write precondition
//!   when present;
//! - map a precondition rejection (HTTP 412) to
//!   [`FailureReason::Conflict`](crate::error::FailureReason::Conflict);
//! - report timeouts as [`FailureReason::Network`](crate::error::FailureReason::Network).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::WriteFailure;
use crate::model::{EntityId, Fields, ResourceKey, VersionToken};

/// One entity's write as handed to the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteRequest {
    pub resource_key: ResourceKey,
    pub entity_id: EntityId,
    pub fields: Fields,
    /// Latest known version token for `resource_key`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub if_match: Option<VersionToken>,
}

/// Successful write response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteAck {
    /// Fresh version token for the written resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<VersionToken>,
    /// Server-computed values to reconcile over the optimistic ones.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_fields: Option<Fields>,
}

impl WriteAck {
    #[must_use]
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: Some(VersionToken::new(token)),
            server_fields: None,
        }
    }
}

/// Per-entity outcome inside a bulk response.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkItemResult {
    pub entity_id: EntityId,
    pub result: Result<WriteAck, WriteFailure>,
}

/// Sends writes to the backend.
#[async_trait]
pub trait WriteTransport: Send + Sync {
    /// Write one entity.
    async fn send(&self, request: WriteRequest) -> Result<WriteAck, WriteFailure>;

    /// Whether [`send_bulk`](Self::send_bulk) is backed by a real endpoint.
    fn supports_bulk(&self) -> bool {
        false
    }

    /// Write several entities in one request.
    ///
    /// `Err` means the request as a whole failed; `Ok` carries one result per
    /// entity the server processed.
    async fn send_bulk(
        &self,
        _requests: Vec<WriteRequest>,
    ) -> Result<Vec<BulkItemResult>, WriteFailure> {
        Err(WriteFailure::unknown("bulk endpoint not available"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureReason;

    struct SingleOnly;

    #[async_trait]
    impl WriteTransport for SingleOnly {
        async fn send(&self, _request: WriteRequest) -> Result<WriteAck, WriteFailure> {
            Ok(WriteAck::with_token("v1"))
        }
    }

    #[tokio::test]
    async fn default_bulk_endpoint_is_unavailable() {
        let transport = SingleOnly;
        let id = EntityId::from("e1");
        let request = WriteRequest {
            resource_key: ResourceKey::for_entity("assignments", &id),
            entity_id: id,
            fields: Fields::new(),
            if_match: None,
        };

        assert!(!transport.supports_bulk());
        let failure = transport
            .send_bulk(vec![request])
            .await
            .expect_err("no bulk endpoint");
        assert_eq!(failure.reason, FailureReason::Unknown);
    }
}
