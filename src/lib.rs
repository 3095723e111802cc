//! # EntityVault
//!
//! A versioned, partitioned entity-property storage engine with a
//! probabilistic linking graph.
//!
//! Every entity and property value carries a signed version array: positive
//! entries are writes, negative entries are tombstones, and the effective state
//! at any point in time is derived from the array. Likely-duplicate entities
//! are grouped under a canonical linking id, and deletions are orchestrated
//! across entities, their association edges and their linking state.

pub mod blob;
pub mod catalog;
pub mod config;
pub mod deletion;
pub mod dsu;
pub mod error;
pub mod graph;
pub mod indexing;
pub mod linking;
pub mod locks;
pub mod model;
pub mod partitions;
pub mod persistence;
pub mod property_store;
pub mod query;
pub mod store;
pub mod version;

// Re-export main types for convenience
pub use config::VaultConfig;
pub use error::{StoreError, StoreResult};
pub use model::{EntityDataKey, EntityKeyId, EntitySetId, LinkingId, PropertyTypeId, PropertyValue};
pub use store::{MemoryBackend, StorageBackend};
pub use version::{Version, VersionClock};

use anyhow::Result;
use blob::{BlobStore, LocalBlobStore, MemoryBlobStore};
use catalog::{Authorizer, EntityMetadata, InMemoryAuthorizer, InMemoryCatalog};
use deletion::DeletionOrchestrator;
use graph::GraphService;
use indexing::IndexingTracker;
use linking::{InMemoryFeedback, LinkingFeedback, LinkingService, ThresholdClusterer};
use partitions::PartitionResolver;
use persistence::RocksBackend;
use property_store::PropertyStore;
use query::EntityReader;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use version::SystemClock;

/// Main API: one backend wired into every component.
pub struct EntityVault {
    config: VaultConfig,
    backend: Arc<dyn StorageBackend>,
    resolver: Arc<PartitionResolver>,
    store: Arc<PropertyStore>,
    reader: EntityReader,
    indexing: IndexingTracker,
    graph: Arc<GraphService>,
    linking: Arc<LinkingService>,
    deletion: DeletionOrchestrator,
}

impl EntityVault {
    pub fn builder(config: VaultConfig) -> EntityVaultBuilder {
        EntityVaultBuilder {
            config,
            backend: None,
            blobs: None,
            clock: None,
            metadata: None,
            authorizer: None,
            feedback: None,
        }
    }

    /// In-memory instance with default configuration and collaborators.
    pub fn in_memory() -> Result<Self> {
        Self::builder(VaultConfig::default()).build()
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub fn partitions(&self) -> &PartitionResolver {
        &self.resolver
    }

    pub fn store(&self) -> &PropertyStore {
        &self.store
    }

    pub fn reader(&self) -> &EntityReader {
        &self.reader
    }

    pub fn indexing(&self) -> &IndexingTracker {
        &self.indexing
    }

    pub fn graph(&self) -> &GraphService {
        &self.graph
    }

    pub fn linking(&self) -> &LinkingService {
        &self.linking
    }

    pub fn deletion(&self) -> &DeletionOrchestrator {
        &self.deletion
    }

    /// Default clustering work using the configured match threshold.
    pub fn threshold_clusterer(
        &self,
        scores: Vec<(EntityDataKey, EntityDataKey, f64)>,
    ) -> ThresholdClusterer {
        ThresholdClusterer::new(self.config.linking.match_threshold, scores)
    }

    pub fn flush(&self) -> Result<()> {
        self.backend.flush()
    }

    pub fn checkpoint(&self, path: impl AsRef<Path>) -> Result<()> {
        self.backend.checkpoint(path.as_ref())
    }
}

/// Collaborators left unset fall back to in-memory implementations; the
/// backend falls back to RocksDB under `storage.data_dir` when configured.
pub struct EntityVaultBuilder {
    config: VaultConfig,
    backend: Option<Arc<dyn StorageBackend>>,
    blobs: Option<Arc<dyn BlobStore>>,
    clock: Option<Arc<dyn VersionClock>>,
    metadata: Option<Arc<dyn EntityMetadata>>,
    authorizer: Option<Arc<dyn Authorizer>>,
    feedback: Option<Arc<dyn LinkingFeedback>>,
}

impl EntityVaultBuilder {
    pub fn backend(mut self, backend: Arc<dyn StorageBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn blobs(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn VersionClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn metadata(mut self, metadata: Arc<dyn EntityMetadata>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    pub fn feedback(mut self, feedback: Arc<dyn LinkingFeedback>) -> Self {
        self.feedback = Some(feedback);
        self
    }

    pub fn build(self) -> Result<EntityVault> {
        let config = self.config;
        let data_dir = config.storage.data_dir.clone();

        let backend: Arc<dyn StorageBackend> = match (self.backend, &data_dir) {
            (Some(backend), _) => backend,
            (None, Some(dir)) => {
                info!(path = %dir.display(), "opening persistent backend");
                Arc::new(RocksBackend::open_with_options(
                    dir.join("db"),
                    config.rocks_options(),
                )?)
            }
            (None, None) => Arc::new(MemoryBackend::new()),
        };
        let blobs: Arc<dyn BlobStore> = match (self.blobs, &data_dir) {
            (Some(blobs), _) => blobs,
            (None, Some(dir)) => Arc::new(LocalBlobStore::open(dir.join("blobs"))?),
            (None, None) => Arc::new(MemoryBlobStore::new()),
        };
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock::new()));
        let metadata = self
            .metadata
            .unwrap_or_else(|| Arc::new(InMemoryCatalog::new()));
        let authorizer = self
            .authorizer
            .unwrap_or_else(|| Arc::new(InMemoryAuthorizer::new()));
        let feedback = self
            .feedback
            .unwrap_or_else(|| Arc::new(InMemoryFeedback::new()));

        let resolver = Arc::new(PartitionResolver::new(
            Arc::clone(&backend),
            config.partitions.default_partition_count,
        ));
        let store = Arc::new(PropertyStore::new(
            Arc::clone(&backend),
            Arc::clone(&resolver),
            Arc::clone(&blobs),
            Arc::clone(&clock),
            config.store_options(),
        ));
        let reader = EntityReader::new(
            Arc::clone(&backend),
            Arc::clone(&blobs),
            config.batching.read_page_size,
        );
        let indexing = IndexingTracker::new(Arc::clone(&backend), config.batching.read_page_size);
        let graph = Arc::new(GraphService::new(Arc::clone(&backend), Arc::clone(&clock)));
        let linking = Arc::new(LinkingService::new(
            Arc::clone(&backend),
            Arc::clone(&clock),
            config.linking_options(),
        ));
        let deletion = DeletionOrchestrator::new(
            Arc::clone(&store),
            Arc::clone(&graph),
            Arc::clone(&linking),
            metadata,
            authorizer,
            feedback,
            config.store_options().delete_chunk_size,
        );

        Ok(EntityVault {
            config,
            backend,
            resolver,
            store,
            reader,
            indexing,
            graph,
            linking,
            deletion,
        })
    }
}
