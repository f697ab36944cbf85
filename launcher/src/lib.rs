pub mod context;
pub mod error;
pub mod group;
pub mod post_mortem;
pub mod spawn;
pub mod spec;

use std::{future::Future, process};

use log::{error, info};
use serde::{Serialize, de::DeserializeOwned};
use tokio::runtime::Builder;

pub use context::{DeviceAssignment, WorkerContext};
pub use error::{CollectiveError, LaunchError, Result};
pub use group::{GroupOptions, ProcessGroup};
pub use post_mortem::PostMortem;
pub use spec::{AUTO_DIST_URL, Backend, DeviceKind, JobSpec, RendezvousAddr, Topology};

/// Runs `spec.entry_point` on every process of this machine.
///
/// With a single process in the whole job the entry point runs in the calling process.
/// Otherwise the current executable is started again once per local worker with the same
/// arguments, each of those processes calls `launch` again with the same spec and ends up
/// running the entry point inside the process group. The calling process becomes their
/// supervisor and never runs the entry point itself.
///
/// # Returns
/// The value returned by the first worker of this machine, or the first failure. Spawned
/// workers never return from this function, they exit with a status reflecting the
/// outcome of their entry point.
pub fn launch<F, Fut, A, R>(spec: JobSpec<F, A>) -> Result<R>
where
    F: FnOnce(WorkerContext, ProcessGroup, A) -> Fut,
    Fut: Future<Output = anyhow::Result<R>>,
    R: Serialize + DeserializeOwned,
{
    spec.validate()?;
    let runtime = Builder::new_multi_thread().enable_all().build()?;

    if let Some(local_rank) = spawn::spawned_local_rank()? {
        let code = match runtime.block_on(run_spawned(spec, local_rank)) {
            Ok(()) => 0,
            Err(e) => {
                error!("{e}");
                1
            }
        };

        drop(runtime);
        process::exit(code);
    }

    let topology = spec.topology;
    if topology.world_size() == 1 {
        return runtime.block_on(run_in_process(spec));
    }

    let addr = spec.rendezvous_addr()?;
    info!(
        world_size = topology.world_size(), machine_rank = topology.machine_rank();
        "launching {} local worker(s), rendezvous at {addr}",
        topology.num_processes_per_machine()
    );

    runtime.block_on(spawn::supervise(&topology, spec.device, &addr))
}

async fn run_in_process<F, Fut, A, R>(spec: JobSpec<F, A>) -> Result<R>
where
    F: FnOnce(WorkerContext, ProcessGroup, A) -> Fut,
    Fut: Future<Output = anyhow::Result<R>>,
{
    let ctx = spec.topology.context(0, spec.device)?;
    let group = ProcessGroup::solo();

    let entry = (spec.entry_point)(ctx.clone(), group, spec.entry_args);
    post_mortem::intercept(&ctx, spec.post_mortem, entry)
        .await
        .map_err(|source| LaunchError::Entry { rank: 0, source })
}

async fn run_spawned<F, Fut, A, R>(spec: JobSpec<F, A>, local_rank: usize) -> Result<()>
where
    F: FnOnce(WorkerContext, ProcessGroup, A) -> Fut,
    Fut: Future<Output = anyhow::Result<R>>,
    R: Serialize,
{
    let ctx = spec.topology.context(local_rank, spec.device)?;
    let addr = spawn::spawned_rendezvous_addr()?;
    let options = GroupOptions {
        collective_timeout: spec.collective_timeout,
        join_timeout: spec.join_timeout,
    };

    let group = ProcessGroup::rendezvous(&ctx, &addr, spec.backend, options).await?;

    let rank = ctx.global_rank();
    let entry = (spec.entry_point)(ctx.clone(), group, spec.entry_args);
    let result = post_mortem::intercept(&ctx, spec.post_mortem, entry)
        .await
        .map_err(|source| LaunchError::Entry { rank, source })?;

    if ctx.is_local_leader() {
        spawn::report_result(&result).await?;
    }

    Ok(())
}
