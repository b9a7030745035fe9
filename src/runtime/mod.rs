//! Container Runtime Adapter (C2).

pub mod docker;
pub mod traits;

pub use docker::{run_health_check, DockerRuntimeAdapter};
pub use traits::{
    CreateSpec, InspectInfo, ListFilter, PullProgress, PullProgressCallback, RuntimeAdapter,
    StatsSnapshot,
};
