// vim: tw=80
//! RAID-1: disks are arranged in pairs, each holding a copy of the other

use crate::{
    dag::{DagTemplate, OpKind},
    layout::AccessStripeMap,
    types::*,
};
use super::{RedundancyScheme, SchemeKind};

/// Mirrored pairs `(2i, 2i + 1)`.
///
/// Consecutive stripe units are spread round-robin across the pairs.  Every
/// stripe unit is its own parity stripe, with the even disk as its data column
/// and the odd disk as its redundancy column.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Mirror {
    npairs: DiskT,
    sectors_per_disk: SectorT,
    sectors_per_su: SectorT,
}

impl Mirror {
    pub fn new(ndisks: DiskT, sectors_per_disk: SectorT,
               sectors_per_su: SectorT) -> Self
    {
        assert!(ndisks >= 2 && ndisks % 2 == 0,
            "mirrors need an even number of disks");
        Mirror{npairs: ndisks / 2, sectors_per_disk, sectors_per_su}
    }
}

impl RedundancyScheme for Mirror {
    fn kind(&self) -> SchemeKind {
        SchemeKind::Mirror
    }

    fn fault_tolerance(&self) -> usize {
        1
    }

    fn data_cols(&self) -> usize {
        1
    }

    fn redundancy_cols(&self) -> usize {
        1
    }

    fn ndisks(&self) -> DiskT {
        self.npairs * 2
    }

    fn stripes(&self) -> PsidT {
        PsidT::from(self.npairs) * (self.sectors_per_disk / self.sectors_per_su)
    }

    fn sectors_per_su(&self) -> SectorT {
        self.sectors_per_su
    }

    fn stripe_disks(&self, psid: PsidT) -> Vec<DiskT> {
        let pair = (psid % PsidT::from(self.npairs)) as DiskT;
        vec![2 * pair, 2 * pair + 1]
    }

    fn stripe_start(&self, psid: PsidT) -> SectorT {
        psid / PsidT::from(self.npairs) * self.sectors_per_su
    }

    fn select_dag(&self, op: OpKind, asm: &AccessStripeMap)
        -> Result<DagTemplate>
    {
        self.check_tolerance(asm)?;
        let t = match op {
            OpKind::Read if asm.is_failed(0) => DagTemplate::MirrorDegradedRead,
            OpKind::Read => DagTemplate::Read,
            OpKind::Write if asm.num_failed() > 0 =>
                DagTemplate::MirrorDegradedWrite,
            OpKind::Write => DagTemplate::MirrorWrite,
        };
        Ok(t)
    }

    fn compute_redundancy(&self, data: &[&[u8]], out: &mut [&mut [u8]]) {
        out[0].copy_from_slice(data[0]);
    }
}
