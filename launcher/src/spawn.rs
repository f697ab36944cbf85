//! The supervising side of a multi-process launch: re-executes the current binary once
//! per local worker and collects the local leader's result.

use std::{
    env,
    ffi::OsString,
    io,
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

use comms::msg::{Command, Msg};
use futures::{StreamExt, stream::FuturesUnordered};
use log::{debug, error, info, warn};
use serde::{Serialize, de::DeserializeOwned};
use tokio::{
    net::{TcpListener, TcpStream},
    process::{Child, Command as Process},
    time,
};

use crate::{
    context::WorkerContext,
    error::{LaunchError, Result},
    spec::{DeviceKind, RendezvousAddr, Topology},
};

/// Set on spawned workers, holds their local rank.
pub const LOCAL_RANK_ENV: &str = "ORCHESTRA_LOCAL_RANK";
/// Set on spawned workers, holds the resolved rendezvous address.
pub const DIST_URL_ENV: &str = "ORCHESTRA_DIST_URL";
/// Set on spawned workers, where the local leader hands back its result.
pub const RESULT_ADDR_ENV: &str = "ORCHESTRA_RESULT_ADDR";

/// How long the supervisor waits for the result once every worker exited cleanly.
const RESULT_GRACE: Duration = Duration::from_secs(5);

/// Returns the local rank this process was spawned with, if it's a spawned worker.
pub(crate) fn spawned_local_rank() -> Result<Option<usize>> {
    let Ok(value) = env::var(LOCAL_RANK_ENV) else {
        return Ok(None);
    };

    value.parse().map(Some).map_err(|_| {
        LaunchError::InvalidSpec(format!("{LOCAL_RANK_ENV} holds a non numeric value {value:?}"))
    })
}

/// Returns the rendezvous address the supervisor resolved for this worker.
pub(crate) fn spawned_rendezvous_addr() -> Result<RendezvousAddr> {
    let url = env::var(DIST_URL_ENV)
        .map_err(|_| LaunchError::InvalidSpec(format!("{DIST_URL_ENV} is not set")))?;

    RendezvousAddr::parse(&url)
}

fn worker_env(ctx: &WorkerContext, addr: &RendezvousAddr, sink: SocketAddr) -> Vec<(&'static str, String)> {
    vec![
        (LOCAL_RANK_ENV, ctx.local_rank().to_string()),
        (DIST_URL_ENV, format!("tcp://{addr}")),
        (RESULT_ADDR_ENV, sink.to_string()),
        ("RANK", ctx.global_rank().to_string()),
        ("LOCAL_RANK", ctx.local_rank().to_string()),
        ("WORLD_SIZE", ctx.world_size().to_string()),
        ("MASTER_ADDR", addr.host().to_string()),
        ("MASTER_PORT", addr.port().to_string()),
    ]
}

/// Spawns every local worker and waits for all of them.
///
/// # Arguments
/// * `topology` - The shape of the job.
/// * `device` - The kind of device workers get bound to.
/// * `addr` - The resolved rendezvous address.
///
/// # Returns
/// The local leader's result, or the first failure among the local workers.
pub(crate) async fn supervise<R>(topology: &Topology, device: DeviceKind, addr: &RendezvousAddr) -> Result<R>
where
    R: DeserializeOwned,
{
    let sink = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    let sink_addr = sink.local_addr()?;

    let program = env::current_exe()?;
    let args: Vec<OsString> = env::args_os().skip(1).collect();

    let mut children = Vec::with_capacity(topology.num_processes_per_machine());
    spawn_all(topology, device, addr, sink_addr, &mut children, |_| {
        let mut process = Process::new(&program);
        process.args(&args);
        process
    })
    .await?;

    let collector = tokio::spawn(collect_result(sink));
    let failure = wait_all(&mut children).await;

    if let Some(e) = failure {
        collector.abort();
        return Err(e);
    }

    let value = match time::timeout(RESULT_GRACE, collector).await {
        Ok(Ok(result)) => result?,
        Ok(Err(e)) => {
            warn!("result collector stopped: {e}");
            return Err(LaunchError::MissingResult);
        }
        Err(_) => return Err(LaunchError::MissingResult),
    };

    serde_json::from_value(value).map_err(|e| LaunchError::Io(e.into()))
}

/// Starts one worker per local rank, pushing each child onto `children`.
///
/// If any of them fails to start, the ones already running are killed and reaped before
/// returning `Spawn`, the job never runs with a partial group.
async fn spawn_all<F>(
    topology: &Topology,
    device: DeviceKind,
    addr: &RendezvousAddr,
    sink: SocketAddr,
    children: &mut Vec<Child>,
    mut command: F,
) -> Result<()>
where
    F: FnMut(&WorkerContext) -> Process,
{
    for ctx in topology.local_contexts(device) {
        let mut process = command(&ctx);
        process.envs(worker_env(&ctx, addr, sink)).kill_on_drop(true);

        match process.spawn() {
            Ok(child) => {
                info!(rank = ctx.global_rank(); "spawned local worker {} (pid {:?})", ctx.local_rank(), child.id());
                children.push(child);
            }
            Err(source) => {
                error!(rank = ctx.global_rank(); "failed to spawn local worker {}: {source}", ctx.local_rank());
                abort(children).await;
                return Err(LaunchError::Spawn {
                    local_rank: ctx.local_rank(),
                    source,
                });
            }
        }
    }

    Ok(())
}

/// Waits for every child, logging exits in the order they happen.
async fn wait_all(children: &mut [Child]) -> Option<LaunchError> {
    let mut waits: FuturesUnordered<_> = children
        .iter_mut()
        .enumerate()
        .map(|(local_rank, child)| async move { (local_rank, child.wait().await) })
        .collect();

    let mut failure = None;
    while let Some((local_rank, status)) = waits.next().await {
        match status {
            Ok(status) if status.success() => {
                debug!("local worker {local_rank} finished");
            }
            Ok(status) => {
                error!("local worker {local_rank} exited with {status}");
                failure.get_or_insert(LaunchError::WorkerExited { local_rank, status });
            }
            Err(e) => {
                error!("could not wait on local worker {local_rank}: {e}");
                failure.get_or_insert(LaunchError::Io(e));
            }
        }
    }

    failure
}

async fn abort(children: &mut [Child]) {
    for child in children.iter_mut() {
        if let Err(e) = child.kill().await {
            warn!("could not kill worker {:?}: {e}", child.id());
        }
    }
}

async fn collect_result(sink: TcpListener) -> Result<serde_json::Value> {
    let (stream, peer) = sink.accept().await?;
    debug!("receiving result from {peer}");

    let (rx, tx) = stream.into_split();
    let (mut rx, _) = comms::channel(rx, tx);

    let mut buf: Vec<u32> = Vec::new();
    let msg: Msg = rx.recv_into(&mut buf).await?;
    match msg {
        Msg::Control(Command::Return(value)) => Ok(value),
        other => Err(LaunchError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("expected a result, got {}", other.kind()),
        ))),
    }
}

/// Hands `result` back to the supervisor that spawned this worker.
pub(crate) async fn report_result<R: Serialize>(result: &R) -> Result<()> {
    let addr = env::var(RESULT_ADDR_ENV)
        .map_err(|_| LaunchError::InvalidSpec(format!("{RESULT_ADDR_ENV} is not set")))?;

    let value = serde_json::to_value(result).map_err(io::Error::from)?;

    let stream = TcpStream::connect(&addr).await?;
    let (rx, tx) = stream.into_split();
    let (_, mut tx) = comms::channel(rx, tx);
    tx.send(&Msg::Control(Command::Return(value))).await?;

    Ok(())
}
