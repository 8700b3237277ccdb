//! Collaborators the service provider delegates to
//!
//! The core never interprets data sets beyond the command set. Storing,
//! matching and loading instances is left to implementations of these
//! traits.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dicom_object::InMemDicomObject;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Result;

/// Metadata of a data set received through C-STORE
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceMetadata {
    /// Unique identifier for this reception
    pub id: Uuid,
    pub sop_class_uid: String,
    pub sop_instance_uid: String,
    /// Transfer syntax the data set bytes are encoded in
    pub transfer_syntax: String,
    /// AE title of the sender
    pub calling_ae_title: String,
    /// Set when the store is a C-MOVE sub-operation
    pub move_originator_ae_title: Option<String>,
    pub received_at: chrono::DateTime<chrono::Utc>,
    pub size_bytes: u64,
}

/// Receives data sets from C-STORE requests.
#[async_trait]
pub trait StorageSink: Send + Sync {
    /// Writes the data set and finalizes it under a name derived from the
    /// SOP Instance UID. Returns the DIMSE status to answer with, usually
    /// success or one of the coercion warnings. An error answers with
    /// "out of resources".
    async fn store(&self, metadata: &InstanceMetadata, data: Bytes) -> Result<u16>;
}

/// Query issued by a peer through C-FIND, C-MOVE or C-GET
#[derive(Debug, Clone)]
pub struct Query {
    /// Information model (SOP class) the query was issued under
    pub sop_class_uid: String,
    pub identifier: InMemDicomObject,
    pub calling_ae_title: String,
}

/// Lazy, finite sequence of matches. Restart by issuing the query again.
pub type Matches = Box<dyn Iterator<Item = Result<InMemDicomObject>> + Send>;

/// Answers C-FIND queries.
#[async_trait]
pub trait FindProvider: Send + Sync {
    async fn find(&self, query: &Query) -> Result<Matches>;
}

/// A stored instance selected by a retrieve
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRef {
    pub sop_class_uid: String,
    pub sop_instance_uid: String,
    pub transfer_syntax: String,
}

/// Selects and loads instances for C-MOVE and C-GET.
#[async_trait]
pub trait RetrieveProvider: Send + Sync {
    /// Instances matching the identifier; their count is reported as the
    /// initial number of remaining sub-operations.
    async fn retrieve(&self, query: &Query) -> Result<Vec<InstanceRef>>;

    /// Data set bytes of one instance, encoded in its `transfer_syntax`.
    async fn load(&self, instance: &InstanceRef) -> Result<Bytes>;
}

/// Providers handed to the connection dispatcher. Services without a
/// provider are answered with "SOP class not supported".
#[derive(Clone, Default)]
pub struct Providers {
    pub storage: Option<Arc<dyn StorageSink>>,
    pub find: Option<Arc<dyn FindProvider>>,
    pub retrieve: Option<Arc<dyn RetrieveProvider>>,
}

impl Providers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_storage(mut self, storage: Arc<dyn StorageSink>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_find(mut self, find: Arc<dyn FindProvider>) -> Self {
        self.find = Some(find);
        self
    }

    pub fn with_retrieve(mut self, retrieve: Arc<dyn RetrieveProvider>) -> Self {
        self.retrieve = Some(retrieve);
        self
    }
}

impl std::fmt::Debug for Providers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Providers")
            .field("storage", &self.storage.is_some())
            .field("find", &self.find.is_some())
            .field("retrieve", &self.retrieve.is_some())
            .finish()
    }
}
