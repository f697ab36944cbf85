use std::{
    fmt,
    net::{Ipv4Addr, TcpListener},
    str::FromStr,
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    context::{DeviceAssignment, WorkerContext},
    error::{LaunchError, Result},
    post_mortem::PostMortem,
};

/// The dist url asking the launcher to pick a free local port.
pub const AUTO_DIST_URL: &str = "auto";

/// How long followers keep trying to reach the rendezvous host, mirrors the usual
/// process group initialization timeout.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// The shape of a job: how many processes run on how many machines, and which machine
/// this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topology {
    num_processes_per_machine: usize,
    num_machines: usize,
    machine_rank: usize,
}

impl Topology {
    /// Creates a new `Topology`.
    ///
    /// # Arguments
    /// * `num_processes_per_machine` - Worker processes spawned on every machine.
    /// * `num_machines` - Machines taking part in the job.
    /// * `machine_rank` - The index of the machine this process runs on.
    ///
    /// # Returns
    /// The topology or `InvalidSpec` if any of the values are out of range.
    pub fn new(
        num_processes_per_machine: usize,
        num_machines: usize,
        machine_rank: usize,
    ) -> Result<Self> {
        if num_processes_per_machine == 0 {
            return Err(LaunchError::InvalidSpec(
                "num_processes_per_machine must be greater than 0".into(),
            ));
        }

        if num_machines == 0 {
            return Err(LaunchError::InvalidSpec(
                "num_machines must be greater than 0".into(),
            ));
        }

        if machine_rank >= num_machines {
            return Err(LaunchError::InvalidSpec(format!(
                "machine_rank ({machine_rank}) must be lower than num_machines ({num_machines})"
            )));
        }

        Ok(Self {
            num_processes_per_machine,
            num_machines,
            machine_rank,
        })
    }

    pub fn num_processes_per_machine(&self) -> usize {
        self.num_processes_per_machine
    }

    pub fn num_machines(&self) -> usize {
        self.num_machines
    }

    pub fn machine_rank(&self) -> usize {
        self.machine_rank
    }

    pub fn world_size(&self) -> usize {
        self.num_processes_per_machine * self.num_machines
    }

    /// The global rank of the `local_rank`-th process of this machine.
    pub fn global_rank(&self, local_rank: usize) -> usize {
        self.machine_rank * self.num_processes_per_machine + local_rank
    }

    /// Builds the identity of the `local_rank`-th process of this machine.
    ///
    /// # Arguments
    /// * `local_rank` - The index of the process on this machine.
    /// * `device` - The kind of device processes get bound to.
    ///
    /// # Returns
    /// The worker context or `InvalidSpec` if `local_rank` is out of range.
    pub fn context(&self, local_rank: usize, device: DeviceKind) -> Result<WorkerContext> {
        if local_rank >= self.num_processes_per_machine {
            return Err(LaunchError::InvalidSpec(format!(
                "local rank {local_rank} is out of range for {} process(es) per machine",
                self.num_processes_per_machine
            )));
        }

        Ok(self.context_at(local_rank, device))
    }

    /// The identities of every process this machine spawns, in local rank order.
    pub fn local_contexts(&self, device: DeviceKind) -> impl Iterator<Item = WorkerContext> + '_ {
        (0..self.num_processes_per_machine).map(move |local_rank| self.context_at(local_rank, device))
    }

    fn context_at(&self, local_rank: usize, device: DeviceKind) -> WorkerContext {
        WorkerContext::new(
            self.global_rank(local_rank),
            local_rank,
            self.world_size(),
            self.machine_rank,
            self.num_processes_per_machine,
            device.assign(local_rank),
        )
    }
}

/// The communication backend used to form the process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// A star of TCP links around rank 0.
    #[default]
    Tcp,
}

impl FromStr for Backend {
    type Err = LaunchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            other => Err(LaunchError::InvalidSpec(format!(
                "unsupported backend {other:?}, available: tcp"
            ))),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
        }
    }
}

/// The kind of device workers run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    #[default]
    Cpu,
    Cuda,
}

impl DeviceKind {
    /// Accelerators are bound one per process, following the local rank.
    fn assign(self, local_rank: usize) -> DeviceAssignment {
        match self {
            Self::Cpu => DeviceAssignment::Cpu,
            Self::Cuda => DeviceAssignment::Accelerator(local_rank),
        }
    }
}

/// A concrete `host:port` where the leader listens for the rest of the group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendezvousAddr {
    host: String,
    port: u16,
}

impl RendezvousAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses a dist url of the form `tcp://host:port` or `host:port`.
    pub fn parse(url: &str) -> Result<Self> {
        let bare = url.strip_prefix("tcp://").unwrap_or(url);
        let invalid = || {
            LaunchError::InvalidSpec(format!(
                "invalid dist url {url:?}, expected tcp://host:port or {AUTO_DIST_URL:?}"
            ))
        };

        let (host, port) = bare.rsplit_once(':').ok_or_else(invalid)?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid());
        }

        let port = port.parse().map_err(|_| invalid())?;
        Ok(Self::new(host, port))
    }

    /// Picks a currently free port on the loopback interface.
    pub fn free_local() -> Result<Self> {
        let probe = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
        let port = probe.local_addr()?.port();
        Ok(Self::new(Ipv4Addr::LOCALHOST.to_string(), port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for RendezvousAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// The immutable description of a launch request.
///
/// It's consumed by `launch`, nothing in it changes once workers are spawned.
pub struct JobSpec<F, A> {
    pub topology: Topology,
    /// Where the group meets, `tcp://host:port` or `auto` for single machine jobs.
    pub dist_url: String,
    pub backend: Backend,
    pub device: DeviceKind,
    /// Deadline for every collective, `None` waits forever.
    pub collective_timeout: Option<Duration>,
    pub join_timeout: Duration,
    pub post_mortem: PostMortem,
    /// The function every worker runs once the group is formed.
    pub entry_point: F,
    pub entry_args: A,
}

impl<F, A> JobSpec<F, A> {
    /// Creates a new `JobSpec` with an automatic dist url, the tcp backend, cpu
    /// devices, no collective deadline and the post-mortem mode from the environment.
    ///
    /// # Arguments
    /// * `topology` - The shape of the job.
    /// * `entry_point` - The function every worker runs.
    /// * `entry_args` - The arguments handed to `entry_point`.
    pub fn new(topology: Topology, entry_point: F, entry_args: A) -> Self {
        Self {
            topology,
            dist_url: AUTO_DIST_URL.to_string(),
            backend: Backend::default(),
            device: DeviceKind::default(),
            collective_timeout: None,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            post_mortem: PostMortem::from_env(),
            entry_point,
            entry_args,
        }
    }

    pub fn with_dist_url(mut self, dist_url: impl Into<String>) -> Self {
        self.dist_url = dist_url.into();
        self
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_device(mut self, device: DeviceKind) -> Self {
        self.device = device;
        self
    }

    pub fn with_collective_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.collective_timeout = timeout;
        self
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    pub fn with_post_mortem(mut self, post_mortem: PostMortem) -> Self {
        self.post_mortem = post_mortem;
        self
    }

    /// Checks the parts of the spec that can't be enforced by construction.
    pub fn validate(&self) -> Result<()> {
        if self.dist_url == AUTO_DIST_URL {
            if self.topology.num_machines() > 1 {
                return Err(LaunchError::InvalidSpec(
                    "dist url \"auto\" only works on a single machine".into(),
                ));
            }
            return Ok(());
        }

        RendezvousAddr::parse(&self.dist_url).map(|_| ())
    }

    /// Resolves the dist url into the address the group meets at.
    pub(crate) fn rendezvous_addr(&self) -> Result<RendezvousAddr> {
        if self.dist_url == AUTO_DIST_URL {
            RendezvousAddr::free_local()
        } else {
            RendezvousAddr::parse(&self.dist_url)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    #[test]
    fn ranks_are_unique_across_machines() {
        for per_machine in 1..=4 {
            for machines in 1..=3 {
                let mut seen = BTreeSet::new();
                for machine_rank in 0..machines {
                    let topology = Topology::new(per_machine, machines, machine_rank).unwrap();
                    for ctx in topology.local_contexts(DeviceKind::Cpu) {
                        assert_eq!(ctx.world_size(), per_machine * machines);
                        assert!(seen.insert(ctx.global_rank()));
                    }
                }

                let expected: BTreeSet<_> = (0..per_machine * machines).collect();
                assert_eq!(seen, expected);
            }
        }
    }

    #[test]
    fn only_the_first_process_of_the_first_machine_leads() {
        let topology = Topology::new(2, 2, 1).unwrap();
        let contexts: Vec<_> = topology.local_contexts(DeviceKind::Cpu).collect();

        assert_eq!(contexts[0].global_rank(), 2);
        assert!(contexts[0].is_local_leader());
        assert!(!contexts[0].is_leader());

        let first = Topology::new(2, 2, 0).unwrap().context(0, DeviceKind::Cpu).unwrap();
        assert!(first.is_leader());
    }

    #[test]
    fn local_contexts_match_contexts_by_local_rank() {
        let topology = Topology::new(3, 2, 1).unwrap();

        let listed: Vec<_> = topology.local_contexts(DeviceKind::Cuda).collect();
        let built: Vec<_> = (0..3)
            .map(|local_rank| topology.context(local_rank, DeviceKind::Cuda).unwrap())
            .collect();

        assert_eq!(listed, built);
        assert!(topology.context(3, DeviceKind::Cuda).is_err());
    }

    #[test]
    fn accelerators_follow_the_local_rank() {
        let topology = Topology::new(3, 2, 1).unwrap();
        let ctx = topology.context(2, DeviceKind::Cuda).unwrap();

        assert_eq!(ctx.global_rank(), 5);
        assert_eq!(ctx.device(), DeviceAssignment::Accelerator(2));
        assert_eq!(
            topology.context(2, DeviceKind::Cpu).unwrap().device(),
            DeviceAssignment::Cpu
        );
    }

    #[test]
    fn invalid_topologies_are_rejected() {
        assert!(Topology::new(0, 1, 0).is_err());
        assert!(Topology::new(1, 0, 0).is_err());
        assert!(Topology::new(1, 2, 2).is_err());
        assert!(Topology::new(2, 1, 0).unwrap().context(2, DeviceKind::Cpu).is_err());
    }

    #[test]
    fn dist_urls_parse() {
        let addr = RendezvousAddr::parse("tcp://10.0.0.7:29500").unwrap();
        assert_eq!(addr.host(), "10.0.0.7");
        assert_eq!(addr.port(), 29500);
        assert_eq!(addr.to_string(), "10.0.0.7:29500");

        let addr = RendezvousAddr::parse("[::1]:1234").unwrap();
        assert_eq!(addr.host(), "::1");
        assert_eq!(addr.to_string(), "[::1]:1234");

        assert!(RendezvousAddr::parse("tcp://nowhere").is_err());
        assert!(RendezvousAddr::parse(":80").is_err());
        assert!(RendezvousAddr::parse("host:http").is_err());
    }

    #[test]
    fn auto_dist_url_needs_a_single_machine() {
        let single = JobSpec::new(Topology::new(2, 1, 0).unwrap(), (), ());
        assert!(single.validate().is_ok());

        let multi = JobSpec::new(Topology::new(2, 2, 0).unwrap(), (), ());
        assert!(multi.validate().is_err());

        let multi = multi.with_dist_url("tcp://127.0.0.1:29500");
        assert!(multi.validate().is_ok());
    }

    #[test]
    fn backends_parse() {
        assert_eq!("TCP".parse::<Backend>().unwrap(), Backend::Tcp);
        assert!("nccl".parse::<Backend>().is_err());
    }
}
