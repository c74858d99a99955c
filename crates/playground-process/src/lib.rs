pub mod group;
pub mod kill;
pub mod probe;
pub mod runtime_files;

pub use group::{
    GroupError, ProcessGroup, ServiceExit, ShutdownSignal, SpawnError, SupervisedProcess,
    spawn_supervised,
};
pub use kill::{Signal, is_pid_running, kill_process_or_group};
pub use probe::{ProbeOutcome, probe_liveness};
pub use runtime_files::{
    ClaimGuard, PidRecord, RuntimeFileError, claim, cleanup_stale, wait_stopped,
};
