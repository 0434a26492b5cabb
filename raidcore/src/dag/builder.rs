// vim: tw=80
//! Incremental construction of an operation graph

use divbuf::DivBufShared;

use crate::{
    disk_queue::Priority,
    layout::{ArrayLayout, PhysDiskAddr},
    types::*,
};
use super::*;

/// Accumulates nodes and buffers for a [`Dag`].
///
/// Nodes may only depend on nodes that were added before them, so the graph
/// is acyclic by construction.
pub struct DagBuilder<'a> {
    layout: &'a ArrayLayout,
    nodes: Vec<Node>,
    bufs: Vec<DivBufShared>,
    outputs: Vec<BufRange>,
    /// Stripe that new nodes belong to
    psid: PsidT,
}

impl<'a> DagBuilder<'a> {
    pub fn new(layout: &'a ArrayLayout) -> Self {
        DagBuilder {
            layout,
            nodes: Vec::new(),
            bufs: Vec::new(),
            outputs: Vec::new(),
            psid: 0
        }
    }

    /// Attribute subsequently added nodes to parity stripe `psid`
    pub fn stripe(&mut self, psid: PsidT) {
        self.psid = psid;
    }

    pub fn bytes_per_su(&self) -> usize {
        self.layout.bytes_per_su()
    }

    /// Convert a sector count to bytes
    pub fn bytes(&self, sectors: SectorT) -> usize {
        sectors as usize * self.layout.bytes_per_sector
    }

    /// Allocate a zero-filled buffer
    pub fn alloc(&mut self, len: usize) -> BufId {
        self.bufs.push(DivBufShared::from(vec![0u8; len]));
        self.bufs.len() - 1
    }

    /// Allocate a buffer holding a copy of `data`
    pub fn alloc_from(&mut self, data: &[u8]) -> BufId {
        self.bufs.push(DivBufShared::from(data.to_vec()));
        self.bufs.len() - 1
    }

    /// A range covering all of `buf`
    pub fn whole(&self, buf: BufId) -> BufRange {
        BufRange{buf, off: 0, len: self.bufs[buf].len()}
    }

    pub fn range(&self, buf: BufId, off: usize, len: usize) -> BufRange {
        debug_assert!(off + len <= self.bufs[buf].len());
        BufRange{buf, off, len}
    }

    pub fn node(&mut self, kind: NodeKind, deps: Vec<NodeId>) -> NodeId {
        let id = self.nodes.len();
        debug_assert!(deps.iter().all(|d| *d < id));
        self.nodes.push(Node{kind, deps, psid: self.psid});
        id
    }

    /// Read the extent `pda` into a freshly allocated buffer
    pub fn read(&mut self, pda: &PhysDiskAddr) -> (NodeId, BufId) {
        let buf = self.alloc(self.bytes(pda.nsectors));
        let kind = NodeKind::Read{disk: pda.disk, sector: pda.sector, buf};
        (self.node(kind, Vec::new()), buf)
    }

    pub fn write(&mut self, pda: &PhysDiskAddr, src: BufRange,
                 deps: Vec<NodeId>) -> NodeId
    {
        debug_assert_eq!(src.len, self.bytes(pda.nsectors));
        let kind = NodeKind::Write{disk: pda.disk, sector: pda.sector, src};
        self.node(kind, deps)
    }

    pub fn commit(&mut self, deps: Vec<NodeId>) -> NodeId {
        self.node(NodeKind::Commit, deps)
    }

    /// Append a range to a read's result
    pub fn output(&mut self, r: BufRange) {
        self.outputs.push(r);
    }

    pub fn finish(self, op: OpKind, templates: Vec<(PsidT, DagTemplate)>)
        -> Dag
    {
        Dag {
            op,
            templates,
            nodes: self.nodes,
            bufs: self.bufs,
            outputs: self.outputs,
            priority: Priority::Normal,
            status: DagStatus::Pending,
        }
    }
}
