// Distributed — Gradient and parameter synchronization across replicas
//
// Data-parallel training keeps R replicas of one model, each with its own
// flat parameter store. After every replica has run backward, their
// gradients must be summed so that all replicas take the same step.
//
// COMPONENTS:
//
//   ShardTable          — Splits the flat store into R contiguous shards.
//                         Shard i is "owned" by replica i.
//
//   Communicator        — The collective operations over the replicas:
//                         scatter-reduce, all-gather, all-reduce, and the
//                         parameter push/pull/swap used by optimizers that
//                         keep sharded state.
//
//   DefaultCommunicator — Single-process implementation. Every collective
//                         runs one scoped thread per shard, and each thread
//                         only writes its own shard.
//
//   create_communicator — Factory over a set of graphs.

use std::sync::Arc;

use vole_core::{bail, kernels};
use vole_core::{Error, ExpressionGraph, Parameters, Result, Tensor, TensorAllocator};

use crate::transport::ProcessGroup;

// Shards

/// One contiguous slice of the flat parameter store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shard {
    pub index: usize,
    pub pos: usize,
    pub size: usize,
}

/// Partition of `total` elements into `replicas` contiguous shards.
///
/// Every shard has `ceil(total / replicas)` elements except the tail, which
/// gets whatever is left (possibly nothing).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardTable {
    total: usize,
    shards: Vec<Shard>,
}

impl ShardTable {
    pub fn new(total: usize, replicas: usize) -> Self {
        let shard_size = if replicas == 0 {
            0
        } else {
            total.div_ceil(replicas)
        };
        let shards = (0..replicas)
            .map(|index| {
                let pos = (index * shard_size).min(total);
                let size = shard_size.min(total - pos);
                Shard { index, pos, size }
            })
            .collect();
        ShardTable { total, shards }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn shards(&self) -> &[Shard] {
        &self.shards
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }
}

// Communicator

/// Collective operations over the parameter stores of all replicas.
///
/// Each collective takes `&mut self`: a second collective on the same
/// communicator cannot start while one is running.
pub trait Communicator: Send {
    /// Sum every replica's gradient shard `i` into replica `i`'s shard `i`.
    fn scatter_reduce(&mut self) -> Result<()>;

    /// Copy every shard from its owner to all other replicas. `vals` picks
    /// the value block, otherwise the gradient block.
    fn all_gather(&mut self, vals: bool) -> Result<()>;

    /// Leave the summed gradients on every replica.
    fn all_reduce_grads(&mut self) -> Result<()>;

    /// Reduce gradients towards `root`.
    ///
    /// `root` is currently ignored: every replica ends up with the full sum,
    /// exactly as after [`Communicator::all_reduce_grads`].
    fn reduce_grads(&mut self, root: usize) -> Result<()>;

    /// Copy replica `i`'s value shard `i` into `out[i]`.
    fn push_params(&mut self, out: &[Tensor]) -> Result<()>;

    /// Copy `input[i]` into value shard `i` of every replica.
    fn pull_params(&mut self, input: &[Tensor]) -> Result<()>;

    /// Exchange value shards with externally held `shards`; needs at least
    /// two replicas.
    fn swap_params(&mut self, shards: &[Tensor]) -> Result<()>;

    /// Number of replicas.
    fn replicas(&self) -> usize;
}

/// In-process communicator over a fixed set of replica parameter stores.
#[derive(Debug)]
pub struct DefaultCommunicator {
    params: Vec<Arc<Parameters>>,
    table: ShardTable,
    tmp: Vec<Tensor>,
}

impl DefaultCommunicator {
    /// Build over the given replicas. Multi-node transports are not
    /// supported by this implementation.
    pub fn new(
        params: Vec<Arc<Parameters>>,
        transport: Option<Arc<dyn ProcessGroup>>,
    ) -> Result<Self> {
        if let Some(group) = transport {
            return Err(Error::Unsupported(format!(
                "DefaultCommunicator cannot run over a process group \
                 (rank {} of {})",
                group.my_rank(),
                group.world_size()
            )));
        }
        let first = params
            .first()
            .ok_or_else(|| Error::msg("communicator needs at least one replica"))?;
        let total = first.size()?;
        let dtype = first.dtype();
        for (i, p) in params.iter().enumerate().skip(1) {
            let size = p.size()?;
            if size != total {
                bail!("replica {i} holds {size} parameter elements, replica 0 holds {total}");
            }
            if p.dtype() != dtype {
                return Err(Error::DTypeMismatch {
                    expected: dtype,
                    got: p.dtype(),
                });
            }
        }
        let table = ShardTable::new(total, params.len());
        log::debug!(
            "communicator: {} replicas, {} elements, shard size {}",
            params.len(),
            total,
            table.shards().first().map_or(0, |s| s.size)
        );
        Ok(DefaultCommunicator {
            params,
            table,
            tmp: Vec::new(),
        })
    }

    /// Build over the parameter stores of `graphs`.
    pub fn from_graphs(
        graphs: &[&ExpressionGraph],
        transport: Option<Arc<dyn ProcessGroup>>,
    ) -> Result<Self> {
        let params = graphs.iter().map(|g| Arc::clone(g.params())).collect();
        Self::new(params, transport)
    }

    pub fn table(&self) -> &ShardTable {
        &self.table
    }

    /// Rebuild the shard table if the stores grew since the last collective.
    fn refresh(&mut self) -> Result<()> {
        let total = self.params[0].size()?;
        for (i, p) in self.params.iter().enumerate().skip(1) {
            let size = p.size()?;
            if size != total {
                bail!("replica {i} holds {size} parameter elements, replica 0 holds {total}");
            }
        }
        if total != self.table.total() {
            log::debug!("communicator: store size {} -> {}", self.table.total(), total);
            self.table = ShardTable::new(total, self.params.len());
            self.tmp.clear();
        }
        Ok(())
    }

    /// One scratch tensor per shard, reserved once.
    fn scratch(&mut self) -> Result<()> {
        if !self.tmp.is_empty() {
            return Ok(());
        }
        let dtype = self.params[0].dtype();
        let mut tmp = Vec::with_capacity(self.table.len());
        for shard in self.table.shards() {
            let mut alloc = TensorAllocator::new(dtype);
            alloc.reserve_exact(shard.size * dtype.size_in_bytes());
            tmp.push(alloc.allocate(shard.size)?);
        }
        self.tmp = tmp;
        Ok(())
    }

    fn blocks(&self, vals: bool) -> Result<Vec<Tensor>> {
        self.params
            .iter()
            .map(|p| if vals { p.vals() } else { p.grads() })
            .collect()
    }

    fn check_shards(&self, op: &str, tensors: &[Tensor]) -> Result<()> {
        if tensors.len() != self.table.len() {
            bail!(
                "{op}: expected {} shard tensors, got {}",
                self.table.len(),
                tensors.len()
            );
        }
        Ok(())
    }

    /// Run `f` for every shard on its own scoped thread and join all of them.
    fn foreach<F>(&self, f: F) -> Result<()>
    where
        F: Fn(&Shard) -> Result<()> + Sync,
    {
        let f = &f;
        std::thread::scope(|s| {
            let handles: Vec<_> = self
                .table
                .shards()
                .iter()
                .map(|shard| s.spawn(move || f(shard)))
                .collect();
            let mut first_err = None;
            for (i, handle) in handles.into_iter().enumerate() {
                match handle.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        first_err.get_or_insert(e);
                    }
                    Err(_) => {
                        first_err.get_or_insert(Error::WorkerPanicked(i));
                    }
                }
            }
            first_err.map_or(Ok(()), Err)
        })
    }
}

impl Communicator for DefaultCommunicator {
    fn scatter_reduce(&mut self) -> Result<()> {
        self.refresh()?;
        self.scratch()?;
        log::debug!("scatter_reduce over {} replicas", self.params.len());
        let grads = self.blocks(false)?;
        let tmp = &self.tmp;
        self.foreach(|shard| {
            if shard.size == 0 {
                return Ok(());
            }
            let i = shard.index;
            let dst = grads[i].subtensor(shard.pos, shard.size)?;
            for (j, g) in grads.iter().enumerate() {
                if j == i {
                    continue;
                }
                tmp[i].copy_from(&g.subtensor(shard.pos, shard.size)?)?;
                kernels::element(&dst, &[&tmp[i]], |d, a| d + a[0])?;
            }
            Ok(())
        })
    }

    fn all_gather(&mut self, vals: bool) -> Result<()> {
        self.refresh()?;
        log::debug!(
            "all_gather {} over {} replicas",
            if vals { "values" } else { "gradients" },
            self.params.len()
        );
        let blocks = self.blocks(vals)?;
        self.foreach(|shard| {
            if shard.size == 0 {
                return Ok(());
            }
            let src = blocks[shard.index].subtensor(shard.pos, shard.size)?;
            for (j, b) in blocks.iter().enumerate() {
                if j != shard.index {
                    b.subtensor(shard.pos, shard.size)?.copy_from(&src)?;
                }
            }
            Ok(())
        })
    }

    fn all_reduce_grads(&mut self) -> Result<()> {
        if self.params.len() <= 1 {
            return Ok(());
        }
        self.scatter_reduce()?;
        self.all_gather(false)
    }

    fn reduce_grads(&mut self, root: usize) -> Result<()> {
        log::debug!("reduce_grads(root={root}) performs a full all-reduce");
        self.all_reduce_grads()
    }

    fn push_params(&mut self, out: &[Tensor]) -> Result<()> {
        self.refresh()?;
        self.check_shards("push_params", out)?;
        log::debug!("push_params into {} shards", out.len());
        let vals = self.blocks(true)?;
        self.foreach(|shard| {
            let src = vals[shard.index].subtensor(shard.pos, shard.size)?;
            out[shard.index].copy_from(&src)
        })
    }

    fn pull_params(&mut self, input: &[Tensor]) -> Result<()> {
        self.refresh()?;
        self.check_shards("pull_params", input)?;
        log::debug!("pull_params from {} shards", input.len());
        let vals = self.blocks(true)?;
        self.foreach(|shard| {
            for v in &vals {
                v.subtensor(shard.pos, shard.size)?
                    .copy_from(&input[shard.index])?;
            }
            Ok(())
        })
    }

    fn swap_params(&mut self, shards: &[Tensor]) -> Result<()> {
        let replicas = self.params.len();
        if replicas < 2 {
            return Err(Error::InsufficientReplicas {
                op: "swap_params",
                required: 2,
                got: replicas,
            });
        }
        self.refresh()?;
        self.check_shards("swap_params", shards)?;
        log::debug!("swap_params over {replicas} replicas");
        let vals = self.blocks(true)?;
        self.foreach(|shard| {
            let i = shard.index;
            let last = vals[replicas - 1].subtensor(shard.pos, shard.size)?;
            for v in &vals[..replicas - 1] {
                v.subtensor(shard.pos, shard.size)?.copy_from(&shards[i])?;
            }
            shards[i].copy_from(&last)?;
            last.copy_from(&vals[0].subtensor(shard.pos, shard.size)?)
        })
    }

    fn replicas(&self) -> usize {
        self.params.len()
    }
}

/// Build the communicator for a set of replica graphs.
pub fn create_communicator(
    graphs: &[&ExpressionGraph],
    transport: Option<Arc<dyn ProcessGroup>>,
) -> Result<Box<dyn Communicator>> {
    Ok(Box::new(DefaultCommunicator::from_graphs(graphs, transport)?))
}
