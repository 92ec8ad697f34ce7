pub mod collaborators;
pub mod context;
pub mod creator;
pub mod locks;
pub mod pg_tools;
pub mod postgres_table;
pub mod process;
pub mod registry;
pub mod restore;
pub mod retention;
pub mod scheduler;
pub mod service;
mod sqlite_file;
pub mod sqlite_table;

pub use collaborators::{
    Audience, CloudUploader, LogNotifier, MirrorUploader, Notifier, Priority, UploadOutcome,
};
pub use context::{EngineContext, TargetEntry, TargetSet};
pub use creator::{creation_plan, BackupCreator, CreateOptions, CreationStrategy};
pub use pg_tools::{PgTools, ToolConfig};
pub use registry::{Backupable, SchemaRegistry};
pub use restore::{
    select_strategy, RestoreEngine, RestoreResult, RestoreStrategy, RowFailure, RESTORE_CHAIN,
};
pub use retention::{RetentionManager, RetentionReport};
pub use scheduler::{Clock, Scheduler, SystemClock};
pub use service::BackupService;
