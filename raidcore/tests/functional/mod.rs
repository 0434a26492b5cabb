// vim: tw=80

// rstest_reuse must be imported at the crate root for macro reasons
// https://github.com/la10736/rstest/issues/128
#![allow(clippy::single_component_path_imports)]
use rstest_reuse;

use std::sync::Arc;

use divbuf::DivBufShared;
use rand::{RngCore, SeedableRng};
use rand_xorshift::XorShiftRng;
use rstest_reuse::template;

use raidcore::{
    array::Array,
    config::ArrayConfig,
    raid::SchemeKind,
    transport::MemTransport,
    types::*,
};

mod array;
mod rebuild;
mod recon;
mod verify;

const SECTORS_PER_DISK: SectorT = 64;
const SECTORS_PER_SU: SectorT = 4;
const BYTES_PER_SECTOR: usize = 32;

/// Array geometries worth exercising
#[template]
#[rstest::rstest]
#[case::mirror(SchemeKind::Mirror, 4)]
#[case::evenodd_narrow(SchemeKind::EvenOdd, 4)]
#[case::evenodd_wide(SchemeKind::EvenOdd, 7)]
fn layouts(#[case] scheme: SchemeKind, #[case] ndisks: DiskT) {}

/// An array backed by RAM disks
struct Harness {
    array: Array,
    mt: Arc<MemTransport>,
    rng: XorShiftRng,
}

impl Harness {
    fn new(scheme: SchemeKind, ndisks: DiskT) -> Self {
        let mut config = ArrayConfig::new(scheme, ndisks, SECTORS_PER_DISK);
        config.sectors_per_su = SECTORS_PER_SU;
        config.bytes_per_sector = BYTES_PER_SECTOR;
        let mt = Arc::new(MemTransport::new(ndisks, SECTORS_PER_DISK,
                                            BYTES_PER_SECTOR));
        let array = Array::new(config, mt.clone()).unwrap();
        let rng = XorShiftRng::seed_from_u64(u64::from(ndisks));
        Harness{array, mt, rng}
    }

    fn capacity(&self) -> SectorT {
        self.array.capacity()
    }

    fn ndisks(&self) -> DiskT {
        self.array.layout().ndisks
    }

    fn random(&mut self, nsectors: SectorT) -> Vec<u8> {
        let mut v = vec![0u8; nsectors as usize * BYTES_PER_SECTOR];
        self.rng.fill_bytes(&mut v);
        v
    }

    async fn write(&self, addr: SectorT, data: &[u8]) -> Result<()> {
        let dbs = DivBufShared::from(data.to_vec());
        self.array.write_at(dbs.try_const().unwrap(), addr).await
    }

    async fn read(&self, addr: SectorT, nsectors: SectorT) -> Result<Vec<u8>> {
        let dbs = DivBufShared::from(
            vec![0u8; nsectors as usize * BYTES_PER_SECTOR]);
        self.array.read_at(dbs.try_mut().unwrap(), addr).await?;
        Ok(dbs.try_const().unwrap().to_vec())
    }

    /// Fill the entire array with random data, and return it
    async fn fill(&mut self) -> Vec<u8> {
        let data = self.random(self.capacity());
        self.write(0, &data).await.unwrap();
        data
    }

    /// Fail a disk, both physically and in the array's eyes
    fn fail(&self, disk: DiskT) {
        self.mt.fail(disk);
        self.array.fail_disk(disk).unwrap();
    }

    /// Replace a failed disk with a blank one
    fn replace(&self, disk: DiskT) {
        self.mt.replace(disk);
        self.array.replace_disk(disk).unwrap();
    }

    /// Total reads and writes completed by every disk
    fn io_counts(&self) -> Vec<(u64, u64)> {
        (0..self.ndisks()).map(|d| self.mt.io_counts(d)).collect()
    }
}

/// Sets of disks whose simultaneous failure the layout must survive
fn survivable(scheme: SchemeKind, ndisks: DiskT) -> Vec<Vec<DiskT>> {
    use itertools::Itertools;

    match scheme {
        SchemeKind::Mirror => (0..ndisks).map(|d| vec![d]).collect(),
        SchemeKind::EvenOdd => (1..=2)
            .flat_map(|n| (0..ndisks).combinations(n))
            .collect()
    }
}
