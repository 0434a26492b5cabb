// vim: tw=80
//! Redundancy schemes
//!
//! A redundancy scheme decides where each logical sector lives, which disks
//! make up each parity stripe, how redundancy is computed, and which operation
//! graph services an access under a given set of failures.  The scheme is
//! chosen once, when the array is activated, and thereafter is only used
//! through the [`RedundancyScheme`] trait.

use fixedbitset::FixedBitSet;
use serde_derive::{Deserialize, Serialize};
use std::{fmt::Debug, sync::Arc};

use crate::{
    config::ArrayConfig,
    dag::{DagTemplate, OpKind},
    layout::AccessStripeMap,
    types::*,
};

pub mod codec;
mod evenodd;
mod mirror;

pub use self::evenodd::EvenOdd;
pub use self::mirror::Mirror;

/// Names a redundancy scheme in an [`ArrayConfig`]
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemeKind {
    /// RAID-1 pairs
    Mirror,
    /// EVENODD double parity
    EvenOdd,
}

/// Interface that every redundancy scheme implements.
///
/// Stripe columns are always ordered data columns first, then redundancy
/// columns.  For schemes with two redundancy columns, the row parity comes
/// before the diagonal parity.
pub trait RedundancyScheme: Debug + Send + Sync {
    fn kind(&self) -> SchemeKind;

    /// Most failed columns that a single stripe may have and still be
    /// serviceable
    fn fault_tolerance(&self) -> usize;

    /// Data columns per parity stripe
    fn data_cols(&self) -> usize;

    /// Redundancy columns per parity stripe
    fn redundancy_cols(&self) -> usize;

    /// Member disks in the array
    fn ndisks(&self) -> DiskT;

    /// Number of parity stripes in the array
    fn stripes(&self) -> PsidT;

    fn sectors_per_su(&self) -> SectorT;

    /// Logical sectors in the array
    fn capacity(&self) -> SectorT {
        self.stripes() * self.data_cols() as SectorT * self.sectors_per_su()
    }

    /// Parity stripe holding the logical sector `raid_addr`
    fn psid_of(&self, raid_addr: SectorT) -> PsidT {
        raid_addr / (self.data_cols() as SectorT * self.sectors_per_su())
    }

    /// Lowest logical sector belonging to parity stripe `psid`
    fn stripe_addr(&self, psid: PsidT) -> SectorT {
        psid * self.data_cols() as SectorT * self.sectors_per_su()
    }

    /// Disk of every column of parity stripe `psid`
    fn stripe_disks(&self, psid: PsidT) -> Vec<DiskT>;

    /// Sector on each member disk where parity stripe `psid`'s stripe units
    /// begin
    fn stripe_start(&self, psid: PsidT) -> SectorT;

    /// Return the disks making up the parity stripe that holds `raid_addr`,
    /// along with that stripe's PSID.
    fn identify_stripe(&self, raid_addr: SectorT) -> (Vec<DiskT>, PsidT) {
        let psid = self.psid_of(raid_addr);
        (self.stripe_disks(psid), psid)
    }

    /// Physical location of the data at logical sector `raid_addr`
    fn map_data(&self, raid_addr: SectorT) -> (DiskT, SectorT) {
        let spsu = self.sectors_per_su();
        let psid = self.psid_of(raid_addr);
        let col = ((raid_addr / spsu) % self.data_cols() as SectorT) as usize;
        let disks = self.stripe_disks(psid);
        (disks[col], self.stripe_start(psid) + raid_addr % spsu)
    }

    /// Physical locations of the redundancy protecting logical sector
    /// `raid_addr`, one per redundancy column.
    fn map_redundancy(&self, raid_addr: SectorT) -> Vec<(DiskT, SectorT)> {
        let spsu = self.sectors_per_su();
        let psid = self.psid_of(raid_addr);
        let sector = self.stripe_start(psid) + raid_addr % spsu;
        self.stripe_disks(psid)[self.data_cols()..].iter()
            .map(|d| (*d, sector))
            .collect()
    }

    /// Choose the graph template that services `op` on this stripe, given
    /// its failed columns.
    fn select_dag(&self, op: OpKind, asm: &AccessStripeMap)
        -> Result<DagTemplate>;

    /// Compute every redundancy column from a full stripe's data columns.
    ///
    /// All buffers must have the same length.
    fn compute_redundancy(&self, data: &[&[u8]], out: &mut [&mut [u8]]);

    /// Check a stripe's redundancy against its data.
    ///
    /// Returns the set of redundancy columns whose contents don't match.
    fn verify(&self, data: &[&[u8]], redundancy: &[&[u8]]) -> FixedBitSet {
        let len = data.first().map(|d| d.len()).unwrap_or(0);
        let mut expected = vec![vec![0u8; len]; redundancy.len()];
        {
            let mut out = expected.iter_mut()
                .map(|v| &mut v[..])
                .collect::<Vec<_>>();
            self.compute_redundancy(data, &mut out);
        }
        let mut bad = FixedBitSet::with_capacity(redundancy.len());
        for (i, (e, r)) in expected.iter().zip(redundancy.iter()).enumerate() {
            if e[..] != r[..] {
                bad.insert(i);
            }
        }
        bad
    }

    /// Fail if `asm` has more failed columns than this scheme can survive
    fn check_tolerance(&self, asm: &AccessStripeMap) -> Result<()> {
        let nfailed = asm.num_failed();
        if nfailed > self.fault_tolerance() {
            tracing::warn!(psid = asm.psid, nfailed,
                tolerance = self.fault_tolerance(),
                "Fault tolerance exceeded");
            Err(Error::ETOOMANYFAULTS)
        } else {
            Ok(())
        }
    }
}

/// Instantiate the redundancy scheme described by `config`
pub fn scheme_for(config: &ArrayConfig) -> Result<Arc<dyn RedundancyScheme>> {
    config.validate()?;
    let scheme: Arc<dyn RedundancyScheme> = match config.scheme {
        SchemeKind::Mirror => Arc::new(Mirror::new(config.disks,
            config.sectors_per_disk, config.sectors_per_su)),
        SchemeKind::EvenOdd => Arc::new(EvenOdd::new(config.disks,
            config.sectors_per_disk, config.sectors_per_su)),
    };
    Ok(scheme)
}
