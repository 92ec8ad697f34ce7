use std::collections::HashMap;
use std::sync::Arc;

use dbvault_core::{CancelFlag, EngineError, Target};
use dbvault_storage::{ArtifactLayout, CatalogStore};

use crate::collaborators::{CloudUploader, LogNotifier, Notifier};
use crate::locks::TargetLocks;
use crate::pg_tools::{PgTools, ToolConfig};
use crate::registry::SchemaRegistry;

pub struct TargetEntry {
    pub target: Target,
    pub registry: SchemaRegistry,
}

/// Configured targets by id.
#[derive(Default)]
pub struct TargetSet {
    entries: HashMap<String, Arc<TargetEntry>>,
}

impl TargetSet {
    pub fn from_targets(targets: Vec<Target>) -> Self {
        let mut set = Self::default();
        for target in targets {
            let registry = SchemaRegistry::for_target(&target);
            set.insert(target, registry);
        }
        set
    }

    pub fn insert(&mut self, target: Target, registry: SchemaRegistry) {
        self.entries.insert(
            target.id.clone(),
            Arc::new(TargetEntry { target, registry }),
        );
    }

    pub fn get(&self, target_id: &str) -> Result<Arc<TargetEntry>, EngineError> {
        self.entries
            .get(target_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("target", target_id))
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Everything the engine components share.
pub struct EngineContext {
    pub catalog: Arc<dyn CatalogStore>,
    pub layout: ArtifactLayout,
    pub targets: TargetSet,
    pub tools: PgTools,
    pub locks: TargetLocks,
    pub notifier: Arc<dyn Notifier>,
    pub uploader: Option<Arc<dyn CloudUploader>>,
    /// Raised on shutdown; long operations stop at their next checkpoint.
    pub shutdown: CancelFlag,
}

impl EngineContext {
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        layout: ArtifactLayout,
        targets: TargetSet,
        tools: ToolConfig,
    ) -> Self {
        Self {
            catalog,
            layout,
            targets,
            tools: PgTools::new(tools),
            locks: TargetLocks::default(),
            notifier: Arc::new(LogNotifier),
            uploader: None,
            shutdown: CancelFlag::new(),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_uploader(mut self, uploader: Arc<dyn CloudUploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }
}
