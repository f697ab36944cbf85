use serde::{Deserialize, Serialize};

/// The device a worker process is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceAssignment {
    Cpu,
    /// An accelerator ordinal on the local machine.
    Accelerator(usize),
}

/// The runtime identity of one worker process inside a job.
///
/// It's created by the launcher inside the worker process and handed to the entry point,
/// every function that needs to know who it's running as receives it explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerContext {
    global_rank: usize,
    local_rank: usize,
    world_size: usize,
    machine_rank: usize,
    num_processes_per_machine: usize,
    device: DeviceAssignment,
}

impl WorkerContext {
    pub(crate) fn new(
        global_rank: usize,
        local_rank: usize,
        world_size: usize,
        machine_rank: usize,
        num_processes_per_machine: usize,
        device: DeviceAssignment,
    ) -> Self {
        Self {
            global_rank,
            local_rank,
            world_size,
            machine_rank,
            num_processes_per_machine,
            device,
        }
    }

    /// The rank of this worker across the whole job, unique in `0..world_size`.
    pub fn global_rank(&self) -> usize {
        self.global_rank
    }

    /// The index of this worker among the ones spawned on the same machine.
    pub fn local_rank(&self) -> usize {
        self.local_rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn machine_rank(&self) -> usize {
        self.machine_rank
    }

    pub fn num_processes_per_machine(&self) -> usize {
        self.num_processes_per_machine
    }

    pub fn device(&self) -> DeviceAssignment {
        self.device
    }

    /// Whether this worker is rank 0, the only one whose side effects and result count.
    pub fn is_leader(&self) -> bool {
        self.global_rank == 0
    }

    /// Whether this worker is the first one on its machine.
    pub fn is_local_leader(&self) -> bool {
        self.local_rank == 0
    }
}
