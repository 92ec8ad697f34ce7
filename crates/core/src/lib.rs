pub mod backup;
pub mod cancel;
pub mod error;
pub mod fixture;
pub mod format;
pub mod hash;
pub mod schedule;
pub mod target;

pub use backup::{BackupFormat, BackupKind, BackupRecord, BackupStatus, RestoreEvent};
pub use cancel::CancelFlag;
pub use error::EngineError;
pub use fixture::{read_fixture, read_fixture_bytes, FixtureEntry, FixtureWriter, RowRecord};
pub use format::{classify, classify_bytes, Classification};
pub use hash::{content_hash, file_checksum, verify_file, VerifyError};
pub use schedule::{Frequency, NewSchedule, ScheduleDefinition, ScheduleState};
pub use target::{
    is_protected_table, ForeignKeySpec, PgConnection, TableSpec, Target, TargetConnection,
    TargetEngine,
};
