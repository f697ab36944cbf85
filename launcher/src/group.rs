use std::{future::Future, io, sync::Arc, time::Duration};

use comms::{
    OnoReceiver, OnoSender,
    msg::{Command, Msg, Payload},
};
use half::f16;
use log::{debug, info};
use serde::{Serialize, de::DeserializeOwned};
use tokio::{
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::Mutex,
    time::{self, Instant},
};

use crate::{
    context::WorkerContext,
    error::{CollectiveError, LaunchError, Result},
    spec::{Backend, RendezvousAddr},
};

const CONNECT_RETRY: Duration = Duration::from_millis(200);

type CollectiveResult<T> = std::result::Result<T, CollectiveError>;

/// Deadlines applied while forming and using a group.
#[derive(Debug, Clone, Copy)]
pub struct GroupOptions {
    pub collective_timeout: Option<Duration>,
    pub join_timeout: Duration,
}

/// How received values are folded into the local buffer.
#[derive(Clone, Copy)]
enum Fold {
    Add,
    Overwrite,
}

impl Fold {
    fn apply(self, dst: &mut [f32], src: impl Iterator<Item = f32>) {
        match self {
            Fold::Add => dst.iter_mut().zip(src).for_each(|(d, s)| *d += s),
            Fold::Overwrite => dst.iter_mut().zip(src).for_each(|(d, s)| *d = s),
        }
    }
}

/// A connection to another member of the group.
struct Link {
    rank: usize,
    rx: OnoReceiver<OwnedReadHalf>,
    tx: OnoSender<OwnedWriteHalf>,
    buf: Vec<u32>,
    half: Vec<f16>,
}

impl Link {
    fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        let (rx, tx) = stream.into_split();
        let (rx, tx) = comms::channel(rx, tx);

        Ok(Self {
            rank: 0,
            rx,
            tx,
            buf: Vec::new(),
            half: Vec::new(),
        })
    }

    async fn send_command(&mut self, cmd: Command) -> io::Result<()> {
        self.tx.send(&Msg::Control(cmd)).await
    }

    async fn send_err(&mut self, reason: &str) -> io::Result<()> {
        self.tx.send(&Msg::Err(reason.into())).await
    }

    async fn recv_command(&mut self, expected: &'static str) -> CollectiveResult<Command> {
        let msg: Msg = self.rx.recv_into(&mut self.buf).await?;
        match msg {
            Msg::Control(cmd) => Ok(cmd),
            other => Err(unexpected(expected, other)),
        }
    }

    async fn expect(&mut self, expected: Command, name: &'static str) -> CollectiveResult<()> {
        match self.recv_command(name).await? {
            cmd if cmd == expected => Ok(()),
            other => Err(CollectiveError::Protocol {
                expected: name,
                got: format!("{other:?}"),
            }),
        }
    }

    async fn send_tensor(&mut self, src: &[f32], compress: bool) -> io::Result<()> {
        let Self { tx, half, .. } = self;

        if compress {
            half.clear();
            half.extend(src.iter().map(|x| f16::from_f32(*x)));
            tx.send(&Msg::Data(Payload::HalfTensor(half.as_slice()))).await
        } else {
            tx.send(&Msg::Data(Payload::Tensor(src))).await
        }
    }

    async fn recv_tensor(&mut self, dst: &mut [f32], fold: Fold) -> CollectiveResult<()> {
        let Self { rank, rx, buf, .. } = self;
        let expected = dst.len();

        let msg: Msg = rx.recv_into(buf).await?;
        match msg {
            Msg::Data(Payload::Tensor(src)) if src.len() == expected => {
                fold.apply(dst, src.iter().copied());
            }
            Msg::Data(Payload::HalfTensor(src)) if src.len() == expected => {
                fold.apply(dst, src.iter().map(|h| h.to_f32()));
            }
            Msg::Data(payload) => {
                return Err(CollectiveError::SizeMismatch {
                    rank: *rank,
                    got: payload.len(),
                    expected,
                });
            }
            other => return Err(unexpected("tensor", other)),
        }

        Ok(())
    }
}

fn unexpected(expected: &'static str, msg: Msg<'_>) -> CollectiveError {
    match msg {
        Msg::Err(reason) => CollectiveError::Remote(reason.into_owned()),
        Msg::Control(cmd) => CollectiveError::Protocol {
            expected,
            got: format!("{cmd:?}"),
        },
        other => CollectiveError::Protocol {
            expected,
            got: other.kind().to_string(),
        },
    }
}

/// Rounds every value through half precision, the same loss the wire applies.
fn round_half(buf: &mut [f32]) {
    buf.iter_mut()
        .for_each(|x| *x = f16::from_f32(*x).to_f32());
}

/// The shape of the group as seen from this member.
enum Star {
    /// A group of one, every collective is local.
    Solo,
    /// Rank 0, linked to every other member in rank order.
    Hub(Vec<Link>),
    /// Any other rank, linked to rank 0.
    Spoke(Link),
}

impl Star {
    async fn barrier(&mut self) -> CollectiveResult<()> {
        match self {
            Star::Solo => {}
            Star::Hub(links) => {
                for link in links.iter_mut() {
                    link.expect(Command::Barrier, "barrier").await?;
                }
                for link in links.iter_mut() {
                    link.send_command(Command::Release).await?;
                }
            }
            Star::Spoke(link) => {
                link.send_command(Command::Barrier).await?;
                link.expect(Command::Release, "release").await?;
            }
        }

        Ok(())
    }

    async fn all_reduce(&mut self, buf: &mut [f32], compress: bool) -> CollectiveResult<()> {
        match self {
            Star::Solo => {
                if compress {
                    round_half(buf);
                }
            }
            Star::Hub(links) => {
                if compress {
                    round_half(buf);
                }
                for link in links.iter_mut() {
                    link.recv_tensor(buf, Fold::Add).await?;
                }
                if compress {
                    round_half(buf);
                }
                for link in links.iter_mut() {
                    link.send_tensor(buf, compress).await?;
                }
            }
            Star::Spoke(link) => {
                link.send_tensor(buf, compress).await?;
                link.recv_tensor(buf, Fold::Overwrite).await?;
            }
        }

        Ok(())
    }

    async fn broadcast(&mut self, buf: &mut [f32]) -> CollectiveResult<()> {
        match self {
            Star::Solo => {}
            Star::Hub(links) => {
                for link in links.iter_mut() {
                    link.send_tensor(buf, false).await?;
                }
            }
            Star::Spoke(link) => link.recv_tensor(buf, Fold::Overwrite).await?,
        }

        Ok(())
    }

    async fn gather(&mut self, own: serde_json::Value) -> CollectiveResult<Option<Vec<serde_json::Value>>> {
        match self {
            Star::Solo => Ok(Some(vec![own])),
            Star::Hub(links) => {
                let mut values = Vec::with_capacity(links.len() + 1);
                values.push(own);

                for link in links.iter_mut() {
                    match link.recv_command("gather").await? {
                        Command::Gather(value) => values.push(value),
                        other => {
                            return Err(CollectiveError::Protocol {
                                expected: "gather",
                                got: format!("{other:?}"),
                            });
                        }
                    }
                }

                Ok(Some(values))
            }
            Star::Spoke(link) => {
                link.send_command(Command::Gather(own)).await?;
                Ok(None)
            }
        }
    }
}

/// The communication group every worker of a job belongs to.
///
/// Rank 0 hosts the rendezvous and sits in the middle of every collective. Handles are
/// cheap to clone and share the same underlying links, collectives issued through
/// clones are serialized.
#[derive(Clone)]
pub struct ProcessGroup {
    rank: usize,
    world_size: usize,
    timeout: Option<Duration>,
    star: Arc<Mutex<Star>>,
}

impl ProcessGroup {
    /// A group made of a single process.
    pub fn solo() -> Self {
        Self::with_star(0, 1, None, Star::Solo)
    }

    fn with_star(rank: usize, world_size: usize, timeout: Option<Duration>, star: Star) -> Self {
        Self {
            rank,
            world_size,
            timeout,
            star: Arc::new(Mutex::new(star)),
        }
    }

    /// Forms the group, returning once every member has joined.
    ///
    /// # Arguments
    /// * `ctx` - The identity of this worker.
    /// * `addr` - Where rank 0 listens.
    /// * `backend` - The backend to connect with.
    /// * `options` - Join and collective deadlines.
    ///
    /// # Returns
    /// The group or `Rendezvous` if it couldn't be formed before `join_timeout`.
    pub async fn rendezvous(
        ctx: &WorkerContext,
        addr: &RendezvousAddr,
        backend: Backend,
        options: GroupOptions,
    ) -> Result<Self> {
        let (rank, world_size) = (ctx.global_rank(), ctx.world_size());
        if world_size == 1 {
            return Ok(Self::with_star(0, 1, options.collective_timeout, Star::Solo));
        }

        let Backend::Tcp = backend;
        let forming = async {
            if rank == 0 {
                host(addr, world_size).await.map(Star::Hub)
            } else {
                join(addr, rank, world_size, options.join_timeout).await.map(Star::Spoke)
            }
        };

        let star = time::timeout(options.join_timeout, forming)
            .await
            .map_err(|_| {
                LaunchError::Rendezvous(format!(
                    "the group was not complete within {:?}",
                    options.join_timeout
                ))
            })??;

        info!(rank = rank, world_size = world_size; "joined the process group at {addr}");
        Ok(Self::with_star(rank, world_size, options.collective_timeout, star))
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn is_leader(&self) -> bool {
        self.rank == 0
    }

    async fn bounded<T>(&self, op: impl Future<Output = CollectiveResult<T>>) -> CollectiveResult<T> {
        match self.timeout {
            Some(limit) => time::timeout(limit, op)
                .await
                .map_err(|_| CollectiveError::Timeout(limit))?,
            None => op.await,
        }
    }

    /// Blocks until every member reaches the barrier.
    pub async fn barrier(&self) -> CollectiveResult<()> {
        let mut star = self.star.lock().await;
        debug!(rank = self.rank; "entering barrier");
        self.bounded(star.barrier()).await
    }

    /// Sums `buf` element-wise across the group, every member ends with the same values.
    ///
    /// With `compress` values travel as half precision floats and are rounded the same way
    /// on every member.
    pub async fn all_reduce_sum(&self, buf: &mut [f32], compress: bool) -> CollectiveResult<()> {
        let mut star = self.star.lock().await;
        self.bounded(star.all_reduce(buf, compress)).await
    }

    /// Like `all_reduce_sum` but divides the result by the world size.
    pub async fn all_reduce_mean(&self, buf: &mut [f32], compress: bool) -> CollectiveResult<()> {
        self.all_reduce_sum(buf, compress).await?;

        let n = self.world_size as f32;
        buf.iter_mut().for_each(|x| *x /= n);
        Ok(())
    }

    /// Overwrites `buf` on every member with rank 0's values.
    pub async fn broadcast(&self, buf: &mut [f32]) -> CollectiveResult<()> {
        let mut star = self.star.lock().await;
        self.bounded(star.broadcast(buf)).await
    }

    /// Collects one value per member on rank 0.
    ///
    /// # Returns
    /// `Some` with the values in rank order on rank 0, `None` everywhere else.
    pub async fn gather<T>(&self, value: &T) -> CollectiveResult<Option<Vec<T>>>
    where
        T: Serialize + DeserializeOwned,
    {
        let own = serde_json::to_value(value)?;

        let mut star = self.star.lock().await;
        let Some(values) = self.bounded(star.gather(own)).await? else {
            return Ok(None);
        };

        values
            .into_iter()
            .map(serde_json::from_value)
            .collect::<serde_json::Result<_>>()
            .map(Some)
            .map_err(CollectiveError::from)
    }
}

async fn host(addr: &RendezvousAddr, world_size: usize) -> Result<Vec<Link>> {
    let listener = TcpListener::bind(addr.to_string())
        .await
        .map_err(|e| LaunchError::Rendezvous(format!("failed to listen on {addr}: {e}")))?;

    info!(world_size = world_size; "waiting for {} peer(s) on {addr}", world_size - 1);

    let mut slots: Vec<Option<Link>> = (1..world_size).map(|_| None).collect();
    let mut joined = 0;

    while joined < slots.len() {
        let (stream, peer) = listener.accept().await?;
        let mut link = Link::new(stream)?;

        let (rank, their_world) = match link.recv_command("join").await {
            Ok(Command::Join { rank, world_size }) => (rank, world_size),
            Ok(other) => {
                return Err(LaunchError::Rendezvous(format!(
                    "{peer} sent {other:?} instead of joining"
                )));
            }
            Err(e) => {
                return Err(LaunchError::Rendezvous(format!("{peer} failed to join: {e}")));
            }
        };

        let rejection = if their_world != world_size {
            Some(format!(
                "rank {rank} expects a world size of {their_world}, the group has {world_size}"
            ))
        } else if rank == 0 || rank >= world_size {
            Some(format!("rank {rank} is out of range for a world size of {world_size}"))
        } else if slots[rank - 1].is_some() {
            Some(format!("rank {rank} joined twice"))
        } else {
            None
        };

        if let Some(reason) = rejection {
            let _ = link.send_err(&reason).await;
            return Err(LaunchError::Rendezvous(reason));
        }

        debug!(rank = rank; "peer joined from {peer}");
        link.rank = rank;
        slots[rank - 1] = Some(link);
        joined += 1;
    }

    let mut links: Vec<Link> = slots.into_iter().flatten().collect();
    for link in links.iter_mut() {
        link.send_command(Command::Welcome).await?;
    }

    Ok(links)
}

async fn join(
    addr: &RendezvousAddr,
    rank: usize,
    world_size: usize,
    join_timeout: Duration,
) -> Result<Link> {
    let started = Instant::now();
    let stream = loop {
        match TcpStream::connect(addr.to_string()).await {
            Ok(stream) => break stream,
            Err(e) if started.elapsed() < join_timeout => {
                debug!(rank = rank; "rendezvous host not reachable yet: {e}");
                time::sleep(CONNECT_RETRY).await;
            }
            Err(e) => {
                return Err(LaunchError::Rendezvous(format!("could not reach {addr}: {e}")));
            }
        }
    };

    let mut link = Link::new(stream)?;
    link.send_command(Command::Join { rank, world_size }).await?;
    link.expect(Command::Welcome, "welcome")
        .await
        .map_err(|e| LaunchError::Rendezvous(e.to_string()))?;

    Ok(link)
}
