//! TCP collective for ranks running as separate processes.
//!
//! Star topology through rank 0:
//! 1. Rank 0 listens on `MASTER_PORT`; every other rank connects to
//!    `MASTER_ADDR:MASTER_PORT` and announces its rank.
//! 2. For a collective, non-root ranks send their contribution; rank 0 folds
//!    all contributions in rank order and sends the result back.
//!
//! Frames (little-endian):
//! - hello: `MAGIC u32 | rank u64`
//! - contribution: `op u8 | ndims u64 | dims u64.. | data f64..`
//! - reply: `0u8 | data f64..` on success, `1u8 | ndims u64 | dims u64..`
//!   when rank 0 rejected the contribution's shape.
//!
//! Calls block without timeout; a crashed peer surfaces as an I/O error on the
//! ranks that talk to it.

use std::io::{BufReader, BufWriter, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use candle_core::Tensor;

use super::communicator::{
    from_host_buffer, reduce_rank_ordered, to_host_buffer, DeviceCommunicator, ReduceOp,
};
use super::error::{DistributedError, Result};
use super::launcher::DistributedConfig;
use super::process_group::ProcessGroup;

const MAGIC: u32 = 0x4D4F_4545; // "MOEE"
const STATUS_OK: u8 = 0;
const STATUS_SHAPE_MISMATCH: u8 = 1;
const CONNECT_RETRIES: usize = 300;
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);

enum Link {
    /// Rank 0: one stream per peer, indexed by `rank - 1`.
    Root(Vec<TcpStream>),
    /// Every other rank: the stream to rank 0.
    Leaf(TcpStream),
}

/// Process group membership established over TCP.
#[derive(Debug, Clone)]
pub struct TcpProcessGroup {
    config: DistributedConfig,
}

impl ProcessGroup for TcpProcessGroup {
    fn rank(&self) -> usize {
        self.config.rank
    }

    fn world_size(&self) -> usize {
        self.config.world_size
    }

    fn local_rank(&self) -> usize {
        self.config.local_rank
    }
}

/// Communicator joining OS processes through rank 0.
pub struct TcpCommunicator {
    process_group: TcpProcessGroup,
    link: Mutex<Link>,
}

impl TcpCommunicator {
    /// Join the process group described by `config`.
    ///
    /// Rank 0 blocks until all `world_size - 1` peers have connected; other
    /// ranks retry the connection while rank 0 is still starting.
    pub fn connect(config: &DistributedConfig) -> Result<Self> {
        if config.world_size == 0 {
            return Err(DistributedError::EmptyGroup);
        }
        if config.rank >= config.world_size {
            return Err(DistributedError::InvalidRank {
                rank: config.rank,
                world_size: config.world_size,
            });
        }

        tracing::info!(
            rank = config.rank,
            world_size = config.world_size,
            master_addr = %config.master_addr,
            master_port = config.master_port,
            "joining TCP process group"
        );

        let link = if config.rank == 0 {
            Link::Root(accept_peers(config)?)
        } else {
            Link::Leaf(connect_to_root(config)?)
        };

        tracing::info!(rank = config.rank, "TCP process group ready");

        Ok(Self {
            process_group: TcpProcessGroup {
                config: config.clone(),
            },
            link: Mutex::new(link),
        })
    }
}

impl DeviceCommunicator for TcpCommunicator {
    fn process_group(&self) -> &dyn ProcessGroup {
        &self.process_group
    }

    fn all_reduce(&self, tensor: &Tensor, op: ReduceOp) -> Result<Tensor> {
        let dims = tensor.dims().to_vec();
        let data = to_host_buffer(tensor)?;
        let mut link = self.link.lock().unwrap_or_else(PoisonError::into_inner);

        let reduced = match &mut *link {
            Link::Root(peers) => root_all_reduce(peers, op, &dims, data)?,
            Link::Leaf(root) => leaf_all_reduce(root, op, &dims, &data)?,
        };

        from_host_buffer(reduced, &dims, tensor.dtype(), tensor.device())
    }

    fn barrier(&self) -> Result<()> {
        let token = Tensor::zeros(1, candle_core::DType::F32, &candle_core::Device::Cpu)?;
        self.all_reduce(&token, ReduceOp::Sum)?;
        Ok(())
    }
}

fn accept_peers(config: &DistributedConfig) -> Result<Vec<TcpStream>> {
    let addr = format!("0.0.0.0:{}", config.master_port);
    let listener = TcpListener::bind(&addr)
        .map_err(|e| DistributedError::Bootstrap(format!("failed to bind {addr}: {e}")))?;

    tracing::debug!(port = config.master_port, "rank 0 waiting for peers");

    let mut slots: Vec<Option<TcpStream>> = (1..config.world_size).map(|_| None).collect();
    let mut connected = 0;
    while connected < slots.len() {
        let (mut stream, peer) = listener.accept()?;
        stream.set_nodelay(true)?;

        let magic = read_u32(&mut stream)?;
        if magic != MAGIC {
            return Err(DistributedError::Bootstrap(format!(
                "unexpected handshake from {peer}"
            )));
        }
        let rank = read_u64(&mut stream)? as usize;
        if rank == 0 || rank >= config.world_size {
            return Err(DistributedError::InvalidRank {
                rank,
                world_size: config.world_size,
            });
        }
        let slot = &mut slots[rank - 1];
        if slot.is_some() {
            return Err(DistributedError::Bootstrap(format!(
                "rank {rank} connected twice"
            )));
        }

        tracing::trace!(peer = %peer, rank, "peer joined");
        *slot = Some(stream);
        connected += 1;
    }

    Ok(slots.into_iter().flatten().collect())
}

fn connect_to_root(config: &DistributedConfig) -> Result<TcpStream> {
    let addr = format!("{}:{}", config.master_addr, config.master_port);

    for attempt in 0..CONNECT_RETRIES {
        match TcpStream::connect(&addr) {
            Ok(mut stream) => {
                stream.set_nodelay(true)?;
                write_u32(&mut stream, MAGIC)?;
                write_u64(&mut stream, config.rank as u64)?;
                stream.flush()?;
                return Ok(stream);
            }
            Err(e) if attempt + 1 < CONNECT_RETRIES => {
                tracing::trace!(attempt, addr = %addr, error = %e, "retrying connection to rank 0");
                std::thread::sleep(CONNECT_RETRY_DELAY);
            }
            Err(e) => {
                return Err(DistributedError::Bootstrap(format!(
                    "failed to connect to {addr} after {CONNECT_RETRIES} attempts: {e}"
                )));
            }
        }
    }

    Err(DistributedError::Bootstrap(format!(
        "failed to connect to {addr}"
    )))
}

fn root_all_reduce(
    peers: &mut [TcpStream],
    op: ReduceOp,
    dims: &[usize],
    own: Vec<f64>,
) -> Result<Vec<f64>> {
    let mut contributions = Vec::with_capacity(peers.len() + 1);
    contributions.push(own);

    let mut mismatch = None;
    for (offset, stream) in peers.iter_mut().enumerate() {
        let rank = offset + 1;
        let mut reader = BufReader::new(&*stream);
        let (peer_op, peer_dims, peer_data) = read_contribution(&mut reader, rank)?;
        if peer_op != op {
            return Err(DistributedError::PeerFailure {
                rank,
                reason: format!("reduce op {peer_op:?} does not match {op:?}"),
            });
        }
        if peer_dims != dims && mismatch.is_none() {
            mismatch = Some(peer_dims);
        }
        contributions.push(peer_data);
    }

    if let Some(actual) = mismatch {
        for stream in peers.iter_mut() {
            let mut writer = BufWriter::new(&*stream);
            writer.write_all(&[STATUS_SHAPE_MISMATCH])?;
            write_dims(&mut writer, dims)?;
            writer.flush()?;
        }
        return Err(DistributedError::ShapeMismatch {
            expected: dims.to_vec(),
            actual,
        });
    }

    let buffers: Vec<&[f64]> = contributions.iter().map(Vec::as_slice).collect();
    let reduced = reduce_rank_ordered(op, &buffers)?;

    for stream in peers.iter_mut() {
        let mut writer = BufWriter::new(&*stream);
        writer.write_all(&[STATUS_OK])?;
        write_f64s(&mut writer, &reduced)?;
        writer.flush()?;
    }

    Ok(reduced)
}

fn leaf_all_reduce(
    root: &mut TcpStream,
    op: ReduceOp,
    dims: &[usize],
    data: &[f64],
) -> Result<Vec<f64>> {
    {
        let mut writer = BufWriter::new(&*root);
        writer.write_all(&[op.as_u8()])?;
        write_dims(&mut writer, dims)?;
        write_f64s(&mut writer, data)?;
        writer.flush()?;
    }

    let mut reader = BufReader::new(&*root);
    let mut status = [0u8; 1];
    reader.read_exact(&mut status)?;
    match status[0] {
        STATUS_OK => read_f64s(&mut reader, data.len()),
        STATUS_SHAPE_MISMATCH => {
            let expected = read_dims(&mut reader)?;
            Err(DistributedError::ShapeMismatch {
                expected,
                actual: dims.to_vec(),
            })
        }
        other => Err(DistributedError::PeerFailure {
            rank: 0,
            reason: format!("unknown reply status {other}"),
        }),
    }
}

fn read_contribution<R: Read>(
    reader: &mut R,
    rank: usize,
) -> Result<(ReduceOp, Vec<usize>, Vec<f64>)> {
    let mut tag = [0u8; 1];
    reader.read_exact(&mut tag)?;
    let op = ReduceOp::from_u8(tag[0]).ok_or_else(|| DistributedError::PeerFailure {
        rank,
        reason: format!("unknown reduce op tag {}", tag[0]),
    })?;
    let dims = read_dims(reader)?;
    let len = dims.iter().product();
    let data = read_f64s(reader, len)?;
    Ok((op, dims, data))
}

fn write_u32<W: Write>(writer: &mut W, value: u32) -> Result<()> {
    writer.write_all(&value.to_le_bytes())?;
    Ok(())
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn write_u64<W: Write>(writer: &mut W, value: u64) -> Result<()> {
    writer.write_all(&value.to_le_bytes())?;
    Ok(())
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn write_dims<W: Write>(writer: &mut W, dims: &[usize]) -> Result<()> {
    write_u64(writer, dims.len() as u64)?;
    for &d in dims {
        write_u64(writer, d as u64)?;
    }
    Ok(())
}

fn read_dims<R: Read>(reader: &mut R) -> Result<Vec<usize>> {
    let ndims = read_u64(reader)? as usize;
    (0..ndims).map(|_| Ok(read_u64(reader)? as usize)).collect()
}

fn write_f64s<W: Write>(writer: &mut W, values: &[f64]) -> Result<()> {
    for v in values {
        writer.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}

fn read_f64s<R: Read>(reader: &mut R, len: usize) -> Result<Vec<f64>> {
    let mut values = Vec::with_capacity(len);
    let mut buf = [0u8; 8];
    for _ in 0..len {
        reader.read_exact(&mut buf)?;
        values.push(f64::from_le_bytes(buf));
    }
    Ok(values)
}
