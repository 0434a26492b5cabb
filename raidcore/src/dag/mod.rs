// vim: tw=80
//! Operation graphs
//!
//! Every array access is serviced by a directed acyclic graph of nodes: disk
//! reads, then computations (XOR, encode, decode), then a commit point, then
//! disk writes.  The graph owns every buffer that its nodes use.  They're all
//! released when the graph is dropped.

use divbuf::{DivBuf, DivBufMut, DivBufShared};
use fixedbitset::FixedBitSet;

use crate::{
    disk_queue::Priority,
    layout::{AccessMap, ArrayLayout},
    raid::codec::{self, EvenOddCodec},
    types::*,
};

mod builder;
mod degraded;
pub mod engine;
mod fault_free;

pub use self::builder::DagBuilder;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum OpKind {
    Read,
    Write,
}

/// The shape of graph chosen for one parity stripe of an access
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum DagTemplate {
    /// Read the data columns directly
    Read,
    /// Read from the surviving half of a mirrored pair
    MirrorDegradedRead,
    /// Rebuild one failed data column by XOR through the row parity
    DegradedRead,
    /// Rebuild failed data columns with help from the diagonal parity
    DiagDegradedRead,
    /// Write both halves of a mirrored pair
    MirrorWrite,
    /// Write only the surviving half of a mirrored pair
    MirrorDegradedWrite,
    /// Overwrite a whole stripe, computing fresh redundancy
    LargeWrite,
    /// Read-modify-write of the redundancy units
    SmallWrite,
    /// Read-modify-write while two untouched data columns are missing.  Both
    /// redundancy units must be updated.
    DoubleDegradedSmallWrite,
    /// Read the surviving columns, decode, overlay the new data, re-encode
    ReconstructWrite,
}

pub type NodeId = usize;

/// Index into a graph's buffer list
pub type BufId = usize;

/// A byte range within one of a graph's buffers
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BufRange {
    pub buf: BufId,
    pub off: usize,
    pub len: usize,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NodeKind {
    /// Read a whole buffer from disk
    Read {
        disk: DiskT,
        sector: SectorT,
        buf: BufId
    },
    Write {
        disk: DiskT,
        sector: SectorT,
        src: BufRange
    },
    /// `dest = srcs[0] ^ srcs[1] ^ ...`
    Xor {
        srcs: Vec<BufRange>,
        dest: BufRange
    },
    Copy {
        src: BufRange,
        dest: BufRange
    },
    /// Compute EVENODD row and diagonal parity from whole data columns
    Encode {
        data: Vec<BufId>,
        row: BufId,
        diag: BufId
    },
    /// Rebuild erased EVENODD columns in place
    Decode {
        cols: Vec<BufId>,
        erasures: FixedBitSet
    },
    /// Apply a data column's delta to an EVENODD diagonal parity unit
    DiagDelta {
        k: usize,
        col: usize,
        delta: BufId,
        diag: BufId
    },
    /// Marks the point after which the graph begins to modify disks
    Commit,
}

impl NodeKind {
    /// Does this node perform disk I/O?
    pub fn is_io(&self) -> bool {
        matches!(self, NodeKind::Read{..} | NodeKind::Write{..})
    }
}

#[derive(Clone, Debug)]
pub struct Node {
    pub kind: NodeKind,
    /// Nodes that must complete before this one may start
    pub deps: Vec<NodeId>,
    /// Parity stripe that this node works on behalf of
    pub psid: PsidT,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DagStatus {
    Pending,
    Complete,
    Aborted(Error),
}

/// An operation graph servicing one whole access
#[derive(Debug)]
pub struct Dag {
    op: OpKind,
    templates: Vec<(PsidT, DagTemplate)>,
    nodes: Vec<Node>,
    /// Every buffer used by the graph
    bufs: Vec<DivBufShared>,
    /// For reads, the buffer ranges that make up the result, in logical order
    outputs: Vec<BufRange>,
    priority: Priority,
    status: DagStatus,
}

impl Dag {
    pub fn op(&self) -> OpKind {
        self.op
    }

    /// The template chosen for each parity stripe, in logical order
    pub fn templates(&self) -> &[(PsidT, DagTemplate)] {
        &self.templates
    }

    pub fn psids(&self) -> impl Iterator<Item=PsidT> + '_ {
        self.templates.iter().map(|(psid, _)| *psid)
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Number of buffers on the graph's allocation list
    pub fn nbufs(&self) -> usize {
        self.bufs.len()
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Set the queueing priority of every disk request that this graph issues
    pub fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
    }

    pub fn status(&self) -> DagStatus {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: DagStatus) {
        self.status = status;
    }

    /// Disk reads issued by this graph, as `(disk, sector, bytes)`
    pub fn reads(&self) -> impl Iterator<Item=(DiskT, SectorT, usize)> + '_ {
        self.nodes.iter().filter_map(move |n| match n.kind {
            NodeKind::Read{disk, sector, buf} =>
                Some((disk, sector, self.bufs[buf].len())),
            _ => None
        })
    }

    /// Disk writes issued by this graph, as `(disk, sector, bytes)`
    pub fn writes(&self) -> impl Iterator<Item=(DiskT, SectorT, usize)> + '_ {
        self.nodes.iter().filter_map(|n| match n.kind {
            NodeKind::Write{disk, sector, src} => Some((disk, sector, src.len)),
            _ => None
        })
    }

    /// Assemble the data read by a completed graph
    pub fn read_result(&self) -> Result<Vec<u8>> {
        match self.status {
            DagStatus::Complete => (),
            DagStatus::Aborted(e) => return Err(e),
            DagStatus::Pending => return Err(Error::EDOOFUS),
        }
        let len = self.outputs.iter().map(|r| r.len).sum();
        let mut out = Vec::with_capacity(len);
        for r in self.outputs.iter() {
            out.extend_from_slice(&self.const_range(r)?[..]);
        }
        Ok(out)
    }

    fn const_range(&self, r: &BufRange) -> Result<DivBuf> {
        let db = self.bufs.get(r.buf)
            .ok_or(Error::EDOOFUS)?
            .try_const()
            .map_err(|_| Error::EDOOFUS)?;
        if r.off + r.len > db.len() {
            return Err(Error::EDOOFUS);
        }
        Ok(db.slice(r.off, r.off + r.len))
    }

    fn const_buf(&self, buf: BufId) -> Result<DivBuf> {
        self.bufs.get(buf)
            .ok_or(Error::EDOOFUS)?
            .try_const()
            .map_err(|_| Error::EDOOFUS)
    }

    /// Exclusive access to a whole buffer.  Fails if any other reference to it
    /// is outstanding.
    pub(crate) fn mut_buf(&self, buf: BufId) -> Result<DivBufMut> {
        self.bufs.get(buf)
            .ok_or(Error::EDOOFUS)?
            .try_mut()
            .map_err(|_| Error::EDOOFUS)
    }

    /// Data source of a `Write` node
    pub(crate) fn write_buf(&self, src: &BufRange) -> Result<IoVec> {
        self.const_range(src)
    }

    /// Execute a computation node in place.
    pub(crate) fn run_compute(&self, id: NodeId) -> Result<()> {
        let node = self.nodes.get(id).ok_or(Error::EDOOFUS)?;
        match &node.kind {
            NodeKind::Xor{srcs, dest} => {
                let sbufs = srcs.iter()
                    .map(|r| self.const_range(r))
                    .collect::<Result<Vec<_>>>()?;
                let srefs = sbufs.iter().map(|b| &b[..]).collect::<Vec<_>>();
                let mut d = self.mut_buf(dest.buf)?;
                let dslice = d.get_mut(dest.off..dest.off + dest.len)
                    .ok_or(Error::EDOOFUS)?;
                if srefs.is_empty() ||
                    srefs.iter().any(|s| s.len() != dslice.len())
                {
                    return Err(Error::EDOOFUS);
                }
                codec::combine(dslice, &srefs);
            }
            NodeKind::Copy{src, dest} => {
                let s = self.const_range(src)?;
                let mut d = self.mut_buf(dest.buf)?;
                let dslice = d.get_mut(dest.off..dest.off + dest.len)
                    .filter(|ds| ds.len() == s.len())
                    .ok_or(Error::EDOOFUS)?;
                dslice.copy_from_slice(&s[..]);
            }
            NodeKind::Encode{data, row, diag} => {
                let dbufs = data.iter()
                    .map(|b| self.const_buf(*b))
                    .collect::<Result<Vec<_>>>()?;
                let drefs = dbufs.iter().map(|b| &b[..]).collect::<Vec<_>>();
                let mut r = self.mut_buf(*row)?;
                let mut d = self.mut_buf(*diag)?;
                let codec = EvenOddCodec::new(drefs.len(), r.len());
                codec.encode(&drefs, &mut r[..], &mut d[..]);
            }
            NodeKind::Decode{cols, erasures} => {
                let mut bufs = cols.iter()
                    .map(|b| self.mut_buf(*b))
                    .collect::<Result<Vec<_>>>()?;
                let len = bufs.first().map(|b| b.len()).ok_or(Error::EDOOFUS)?;
                let codec = EvenOddCodec::new(cols.len() - 2, len);
                let mut refs = bufs.iter_mut()
                    .map(|b| &mut b[..])
                    .collect::<Vec<_>>();
                codec.decode(&mut refs, erasures);
            }
            NodeKind::DiagDelta{k, col, delta, diag} => {
                let dl = self.const_buf(*delta)?;
                let mut d = self.mut_buf(*diag)?;
                let codec = EvenOddCodec::new(*k, d.len());
                codec.diag_delta(*col, &dl[..], &mut d[..]);
            }
            NodeKind::Commit => (),
            NodeKind::Read{..} | NodeKind::Write{..} => {
                return Err(Error::EDOOFUS);
            }
        }
        Ok(())
    }
}

/// Build one graph servicing the whole access `map`.
///
/// Every stripe's template is chosen before anything is allocated, so an
/// access that touches any unserviceable stripe fails with `ETOOMANYFAULTS`
/// without building anything.  `data` is required for writes and must hold
/// exactly the access's bytes.
#[tracing::instrument(skip(layout, map, data), fields(raid_addr = map.raid_addr, nsectors = map.nsectors))]
pub fn build_degraded_dag(layout: &ArrayLayout, op: OpKind, map: &AccessMap,
                          data: Option<&[u8]>) -> Result<Dag>
{
    let scheme = layout.scheme();
    let templates = map.stripes.iter()
        .map(|asm| scheme.select_dag(op, asm).map(|t| (asm.psid, t)))
        .collect::<Result<Vec<_>>>()?;
    let bps = layout.bytes_per_sector;
    let data = match (op, data) {
        (OpKind::Read, None) => &[][..],
        (OpKind::Write, Some(d)) if d.len() as u64 == map.nsectors * bps as u64
            => d,
        _ => return Err(Error::EINVAL)
    };

    let mut b = DagBuilder::new(layout);
    let mut data_off = 0;
    for (asm, (_, template)) in map.stripes.iter().zip(templates.iter()) {
        b.stripe(asm.psid);
        let sdata = if op == OpKind::Write {
            let len = asm.nsectors as usize * bps;
            let s = &data[data_off..data_off + len];
            data_off += len;
            s
        } else {
            &[][..]
        };
        match template {
            DagTemplate::Read => fault_free::read(&mut b, asm)?,
            DagTemplate::MirrorDegradedRead =>
                degraded::mirror_degraded_read(&mut b, asm)?,
            DagTemplate::DegradedRead => degraded::degraded_read(&mut b, asm)?,
            DagTemplate::DiagDegradedRead =>
                degraded::diag_degraded_read(&mut b, asm)?,
            DagTemplate::MirrorWrite | DagTemplate::MirrorDegradedWrite =>
                fault_free::mirror_write(&mut b, asm, sdata)?,
            DagTemplate::LargeWrite =>
                fault_free::large_write(&mut b, asm, sdata)?,
            DagTemplate::SmallWrite | DagTemplate::DoubleDegradedSmallWrite =>
                fault_free::small_write(&mut b, asm, sdata)?,
            DagTemplate::ReconstructWrite =>
                degraded::reconstruct_write(&mut b, asm, sdata)?,
        }
    }
    let dag = b.finish(op, templates);
    tracing::debug!(nodes = dag.nodes.len(), bufs = dag.bufs.len(),
                    "built graph");
    Ok(dag)
}
