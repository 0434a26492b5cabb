// vim: tw=80
//! Redundancy verification and correction

use pretty_assertions::assert_eq;
use rstest::rstest;

use raidcore::array::ParityStatus;
use super::*;

/// Physical location of one redundancy unit of the stripe holding `addr`
fn redundancy_unit(h: &Harness, addr: SectorT, which: usize)
    -> (DiskT, SectorT)
{
    h.array.layout().scheme().map_redundancy(addr)[which]
}

#[tokio::test]
async fn clean() {
    let mut h = Harness::new(SchemeKind::EvenOdd, 5);
    h.fill().await;
    for addr in (0..h.capacity()).step_by(12) {
        assert_eq!(h.array.verify_redundancy(addr, true).await.unwrap(),
                   ParityStatus::Okay);
    }
}

/// Stale redundancy is reported, and only rewritten when asked to
#[rstest]
#[case::mirror(SchemeKind::Mirror, 2, 0)]
#[case::row_parity(SchemeKind::EvenOdd, 5, 0)]
#[case::diagonal_parity(SchemeKind::EvenOdd, 5, 1)]
#[tokio::test]
async fn corrupt(#[case] scheme: SchemeKind, #[case] ndisks: DiskT,
                 #[case] which: usize)
{
    let mut h = Harness::new(scheme, ndisks);
    let data = h.fill().await;
    let addr = 13;
    let (disk, sector) = redundancy_unit(&h, addr, which);
    h.mt.corrupt(disk, sector);
    let corrupted = h.mt.contents(disk);

    assert_eq!(h.array.verify_redundancy(addr, false).await.unwrap(),
               ParityStatus::Bad);
    // Reporting has no side effects
    assert!(h.mt.contents(disk) == corrupted);
    assert_eq!(h.array.verify_redundancy(addr, false).await.unwrap(),
               ParityStatus::Bad);

    assert_eq!(h.array.verify_redundancy(addr, true).await.unwrap(),
               ParityStatus::Corrected);
    assert_eq!(h.array.verify_redundancy(addr, false).await.unwrap(),
               ParityStatus::Okay);
    let cap = h.capacity();
    assert!(h.read(0, cap).await.unwrap() == data);
}

/// A missing redundancy unit doesn't prevent checking the rest
#[tokio::test]
async fn redundancy_missing() {
    let mut h = Harness::new(SchemeKind::EvenOdd, 5);
    h.fill().await;
    let (row, _) = redundancy_unit(&h, 0, 0);
    let (diag, diag_sector) = redundancy_unit(&h, 0, 1);
    h.fail(row);
    assert_eq!(h.array.verify_redundancy(0, false).await.unwrap(),
               ParityStatus::Okay);
    h.mt.corrupt(diag, diag_sector);
    assert_eq!(h.array.verify_redundancy(0, false).await.unwrap(),
               ParityStatus::Bad);
}

/// Without every data column, there's nothing to verify against
#[tokio::test]
async fn data_missing() {
    let mut h = Harness::new(SchemeKind::EvenOdd, 5);
    h.fill().await;
    let (disk, _) = h.array.layout().scheme().map_data(0);
    h.fail(disk);
    assert_eq!(h.array.verify_redundancy(0, true).await.unwrap(),
               ParityStatus::CouldNotVerify);
}

#[tokio::test]
async fn out_of_range() {
    let h = Harness::new(SchemeKind::Mirror, 2);
    let cap = h.capacity();
    assert_eq!(h.array.verify_redundancy(cap, false).await,
               Err(Error::ENOSPC));
}
