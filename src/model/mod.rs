//! Entities shared by every component (spec §3).

pub mod audit;
pub mod bulk;
pub mod container;
pub mod job;

pub use audit::{AuditOutcome, AuditRecord, DigestCacheEntry};
pub use bulk::{BulkProgress, BulkState, BulkStrategy, BulkUpdate};
pub use container::{
    ContainerStatus, DesiredConfig, HealthCheckSpec, ImageRef, ManagedContainer, MountSpec,
    PolicyMode, PortMapping, ResourceLimits, RestartPolicy, UpdatePolicy, UpdateStrategy,
};
pub use job::{
    AvailableUpdate, JobState, RiskLevel, StepOutcome, TriggerSource, UpdateJob, UpdateStepRecord,
};
