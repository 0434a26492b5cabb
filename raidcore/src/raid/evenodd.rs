// vim: tw=80
//! EVENODD: `k` data columns protected by a row parity column and a diagonal
//! parity column.  Any two member disks may fail.

use crate::{
    dag::{DagTemplate, OpKind},
    layout::AccessStripeMap,
    types::*,
};
use super::{RedundancyScheme, SchemeKind, codec::EvenOddCodec};

/// EVENODD with rotating placement.
///
/// Every parity stripe spans all `k + 2` disks, one stripe unit per disk.  The
/// row parity unit walks backwards across the disks from stripe to stripe, the
/// diagonal parity unit follows it, and the data units fill in the rest in
/// order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EvenOdd {
    /// Data columns per stripe
    k: usize,
    sectors_per_disk: SectorT,
    sectors_per_su: SectorT,
}

impl EvenOdd {
    pub fn new(ndisks: DiskT, sectors_per_disk: SectorT,
               sectors_per_su: SectorT) -> Self
    {
        assert!(ndisks >= 4, "evenodd needs at least 4 disks");
        EvenOdd{k: usize::from(ndisks) - 2, sectors_per_disk, sectors_per_su}
    }

    fn n(&self) -> PsidT {
        self.k as PsidT + 2
    }

    /// Disk holding the row parity unit of stripe `psid`
    fn row_disk(&self, psid: PsidT) -> PsidT {
        self.n() - 1 - psid % self.n()
    }
}

impl RedundancyScheme for EvenOdd {
    fn kind(&self) -> SchemeKind {
        SchemeKind::EvenOdd
    }

    fn fault_tolerance(&self) -> usize {
        2
    }

    fn data_cols(&self) -> usize {
        self.k
    }

    fn redundancy_cols(&self) -> usize {
        2
    }

    fn ndisks(&self) -> DiskT {
        self.n() as DiskT
    }

    fn stripes(&self) -> PsidT {
        self.sectors_per_disk / self.sectors_per_su
    }

    fn sectors_per_su(&self) -> SectorT {
        self.sectors_per_su
    }

    fn stripe_disks(&self, psid: PsidT) -> Vec<DiskT> {
        let n = self.n();
        let row = self.row_disk(psid);
        let diag = (row + 1) % n;
        (0..self.k as PsidT)
            .map(|j| (diag + 1 + j) % n)
            .chain([row, diag])
            .map(|d| d as DiskT)
            .collect()
    }

    fn stripe_start(&self, psid: PsidT) -> SectorT {
        psid * self.sectors_per_su
    }

    fn select_dag(&self, op: OpKind, asm: &AccessStripeMap)
        -> Result<DagTemplate>
    {
        self.check_tolerance(asm)?;
        let touched_failed = asm.failed_data().next().is_some();
        let data_failed = asm.failed_data_cols().len();
        let row_failed = asm.is_failed(self.k);
        let t = match op {
            OpKind::Read if !touched_failed => DagTemplate::Read,
            OpKind::Read if data_failed == 1 && !row_failed =>
                DagTemplate::DegradedRead,
            OpKind::Read => DagTemplate::DiagDegradedRead,
            OpKind::Write if asm.is_full_stripe() => DagTemplate::LargeWrite,
            OpKind::Write if touched_failed => DagTemplate::ReconstructWrite,
            OpKind::Write if data_failed == 2 =>
                DagTemplate::DoubleDegradedSmallWrite,
            OpKind::Write => DagTemplate::SmallWrite,
        };
        Ok(t)
    }

    fn compute_redundancy(&self, data: &[&[u8]], out: &mut [&mut [u8]]) {
        let codec = EvenOddCodec::new(self.k, data[0].len());
        let (row, diag) = out.split_at_mut(1);
        codec.encode(data, row[0], diag[0]);
    }
}
