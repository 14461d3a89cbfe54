//! Typed request/reply surface of the connector.
//!
//! Peers hand requests to the connector over bounded mpsc channels; every
//! request carries a oneshot reply channel typed for its success payload.
//! [`ConnectorClient`] is the caller-side handle.

use common::protocol::{BlobMetadataDetails, CipherKeyDetails};
use common::ConnectorError;
use tokio::sync::{mpsc, oneshot};

/// One requested cipher key: its id, plus the domain when the caller knows it.
#[derive(Debug, Clone)]
pub struct CipherKeyRef {
    /// Identifier of the requested base cipher.
    pub base_cipher_id: u64,
    /// Domain the key is expected to belong to.
    pub domain_id: Option<i64>,
}

/// Reply payload of both cipher lookup kinds.
pub type CipherKeysReply = Result<Vec<CipherKeyDetails>, ConnectorError>;
/// Reply payload of blob-metadata lookups.
pub type BlobMetadataReply = Result<Vec<BlobMetadataDetails>, ConnectorError>;

/// Lookup of specific cipher keys by id.
#[derive(Debug)]
pub struct LookupKeysByKeyIdsRequest {
    /// Requested keys, in caller order.
    pub keys: Vec<CipherKeyRef>,
    /// Optional identifier for cross-system request tracing.
    pub debug_id: Option<String>,
    /// Where the reply goes.
    pub reply: oneshot::Sender<CipherKeysReply>,
}

/// Lookup of the latest cipher key for each listed domain.
#[derive(Debug)]
pub struct LookupKeysByDomainIdsRequest {
    /// Requested domains, in caller order.
    pub domain_ids: Vec<i64>,
    /// Optional identifier for cross-system request tracing.
    pub debug_id: Option<String>,
    /// Where the reply goes.
    pub reply: oneshot::Sender<CipherKeysReply>,
}

/// Lookup of blob-storage location metadata for each listed domain.
#[derive(Debug)]
pub struct LookupBlobMetadataRequest {
    /// Requested domains, in caller order.
    pub domain_ids: Vec<i64>,
    /// Optional identifier for cross-system request tracing.
    pub debug_id: Option<String>,
    /// Where the reply goes.
    pub reply: oneshot::Sender<BlobMetadataReply>,
}

/// Receiving halves of the three request streams, owned by the connector
/// loop.
pub struct RequestStreams {
    pub(crate) by_key_ids: mpsc::Receiver<LookupKeysByKeyIdsRequest>,
    pub(crate) by_domain_ids: mpsc::Receiver<LookupKeysByDomainIdsRequest>,
    pub(crate) blob_metadata: mpsc::Receiver<LookupBlobMetadataRequest>,
}

/// Caller-side handle over the connector's request streams.
///
/// Cheap to clone; dropping every clone closes the streams and lets the
/// connector loop drain and exit.
#[derive(Clone)]
pub struct ConnectorClient {
    by_key_ids: mpsc::Sender<LookupKeysByKeyIdsRequest>,
    by_domain_ids: mpsc::Sender<LookupKeysByDomainIdsRequest>,
    blob_metadata: mpsc::Sender<LookupBlobMetadataRequest>,
}

impl ConnectorClient {
    /// Create a client plus the matching [`RequestStreams`].
    pub fn channels(capacity: usize) -> (Self, RequestStreams) {
        let (by_key_ids_tx, by_key_ids) = mpsc::channel(capacity);
        let (by_domain_ids_tx, by_domain_ids) = mpsc::channel(capacity);
        let (blob_metadata_tx, blob_metadata) = mpsc::channel(capacity);
        (
            Self {
                by_key_ids: by_key_ids_tx,
                by_domain_ids: by_domain_ids_tx,
                blob_metadata: blob_metadata_tx,
            },
            RequestStreams {
                by_key_ids,
                by_domain_ids,
                blob_metadata,
            },
        )
    }

    /// Fetch specific cipher keys by id.
    pub async fn fetch_keys_by_key_ids(
        &self,
        keys: Vec<CipherKeyRef>,
        debug_id: Option<String>,
    ) -> CipherKeysReply {
        let (reply, rx) = oneshot::channel();
        self.by_key_ids
            .send(LookupKeysByKeyIdsRequest {
                keys,
                debug_id,
                reply,
            })
            .await
            .map_err(|_| connector_stopped())?;
        rx.await.map_err(|_| connector_stopped())?
    }

    /// Fetch the latest cipher key for each domain.
    pub async fn fetch_latest_keys_by_domain_ids(
        &self,
        domain_ids: Vec<i64>,
        debug_id: Option<String>,
    ) -> CipherKeysReply {
        let (reply, rx) = oneshot::channel();
        self.by_domain_ids
            .send(LookupKeysByDomainIdsRequest {
                domain_ids,
                debug_id,
                reply,
            })
            .await
            .map_err(|_| connector_stopped())?;
        rx.await.map_err(|_| connector_stopped())?
    }

    /// Fetch blob-storage location metadata for each domain.
    pub async fn fetch_blob_metadata(
        &self,
        domain_ids: Vec<i64>,
        debug_id: Option<String>,
    ) -> BlobMetadataReply {
        let (reply, rx) = oneshot::channel();
        self.blob_metadata
            .send(LookupBlobMetadataRequest {
                domain_ids,
                debug_id,
                reply,
            })
            .await
            .map_err(|_| connector_stopped())?;
        rx.await.map_err(|_| connector_stopped())?
    }
}

fn connector_stopped() -> ConnectorError {
    ConnectorError::OperationFailed("KMS connector is not running".into())
}
