// vim: tw=80
//! Rebuilding replaced disks

use pretty_assertions::assert_eq;
use rstest_reuse::apply;

use raidcore::{
    array::{DiskState, ParityStatus},
    health::Health,
};
use super::*;

/// Every stripe's redundancy is consistent
async fn assert_consistent(h: &Harness) {
    let layout = h.array.layout();
    let stripe_len = layout.scheme().data_cols() as SectorT * SECTORS_PER_SU;
    for psid in 0..layout.stripes() {
        let addr = psid * stripe_len;
        assert_eq!(h.array.verify_redundancy(addr, false).await.unwrap(),
                   ParityStatus::Okay, "stripe {psid} is inconsistent");
    }
}

/// A rebuilt disk holds exactly what it held before it failed
#[apply(layouts)]
#[test_log::test(tokio::test)]
async fn restores_contents(#[case] scheme: SchemeKind, #[case] ndisks: DiskT)
{
    for disk in 0..ndisks {
        let mut h = Harness::new(scheme, ndisks);
        let data = h.fill().await;
        let original = h.mt.contents(disk);
        h.fail(disk);
        assert!(matches!(h.array.health(), Health::Degraded(_)));
        h.replace(disk);
        assert_eq!(h.array.health(), Health::Rebuilding);
        h.array.rebuild(disk).await.unwrap();
        assert_eq!(h.array.disk_state(disk), Some(DiskState::Online));
        assert_eq!(h.array.health(), Health::Online);
        assert!(h.mt.contents(disk) == original, "disk {disk} differs");
        let cap = h.capacity();
        assert!(h.read(0, cap).await.unwrap() == data);
    }
}

/// Writes made while a disk was missing land on its replacement
#[apply(layouts)]
#[tokio::test]
async fn after_degraded_writes(#[case] scheme: SchemeKind,
                               #[case] ndisks: DiskT)
{
    let mut h = Harness::new(scheme, ndisks);
    let mut data = h.fill().await;
    h.fail(1);
    let new = h.random(17);
    h.write(6, &new).await.unwrap();
    let lo = 6 * BYTES_PER_SECTOR;
    data[lo..lo + new.len()].copy_from_slice(&new);
    h.replace(1);
    h.array.rebuild(1).await.unwrap();
    assert_consistent(&h).await;
    // Lose a different disk.  The rebuilt one must now carry its weight.
    h.fail(0);
    let cap = h.capacity();
    assert!(h.read(0, cap).await.unwrap() == data);
}

/// Both failed EvenOdd members can be rebuilt, one after the other
#[tokio::test]
async fn evenodd_double_rebuild() {
    let mut h = Harness::new(SchemeKind::EvenOdd, 6);
    let data = h.fill().await;
    let originals = [h.mt.contents(2), h.mt.contents(5)];
    h.fail(2);
    h.fail(5);
    h.replace(2);
    h.replace(5);
    h.array.rebuild(2).await.unwrap();
    assert_eq!(h.array.disk_state(5), Some(DiskState::Rebuilding{upto: 0}));
    h.array.rebuild(5).await.unwrap();
    assert!(h.mt.contents(2) == originals[0]);
    assert!(h.mt.contents(5) == originals[1]);
    assert_eq!(h.array.health(), Health::Online);
    let cap = h.capacity();
    assert!(h.read(0, cap).await.unwrap() == data);
}

/// Foreground I/O may proceed while a rebuild runs
#[tokio::test]
async fn concurrent_foreground_io() {
    let mut h = Harness::new(SchemeKind::EvenOdd, 5);
    let mut data = h.fill().await;
    h.fail(4);
    h.replace(4);
    let writes = (0..6u64)
        .map(|i| (i * 29, h.random(3)))
        .collect::<Vec<_>>();
    let foreground = async {
        for (addr, buf) in writes.iter() {
            h.write(*addr, buf).await.unwrap();
        }
    };
    let (r, ()) = futures::join!(h.array.rebuild(4), foreground);
    r.unwrap();
    for (addr, buf) in writes.iter() {
        let lo = *addr as usize * BYTES_PER_SECTOR;
        data[lo..lo + buf.len()].copy_from_slice(buf);
    }
    assert_consistent(&h).await;
    let cap = h.capacity();
    assert!(h.read(0, cap).await.unwrap() == data);
}

/// A rebuild can't proceed if too many other members are missing
#[tokio::test]
async fn too_many_faults() {
    let mut h = Harness::new(SchemeKind::EvenOdd, 5);
    h.fill().await;
    for d in [0, 1, 2] {
        h.fail(d);
    }
    h.replace(0);
    assert_eq!(h.array.rebuild(0).await, Err(Error::ETOOMANYFAULTS));
    assert_eq!(h.array.disk_state(0), Some(DiskState::Rebuilding{upto: 0}));
}

/// Only one rebuild may run at a time
#[tokio::test]
async fn one_at_a_time() {
    let mut h = Harness::new(SchemeKind::Mirror, 4);
    h.fill().await;
    h.fail(0);
    h.fail(3);
    h.replace(0);
    h.replace(3);
    let (r0, r3) = futures::join!(h.array.rebuild(0), h.array.rebuild(3));
    r0.unwrap();
    assert_eq!(r3, Err(Error::EBUSY));
    h.array.rebuild(3).await.unwrap();
    assert_eq!(h.array.health(), Health::Online);
}

/// A rebuild abandoned partway through can be started again, and finishes the
/// job
#[apply(layouts)]
#[tokio::test]
async fn cancel_then_retry(#[case] scheme: SchemeKind, #[case] ndisks: DiskT)
{
    for polls in [1, 2, 3, 4, 6] {
        let mut h = Harness::new(scheme, ndisks);
        let data = h.fill().await;
        let original = h.mt.contents(1);
        let nfloating = h.array.recon_pool().nfloating();
        h.fail(1);
        h.replace(1);
        let mut fut = Box::pin(h.array.rebuild(1));
        for _ in 0..polls {
            assert!(futures::poll!(fut.as_mut()).is_pending());
            tokio::task::yield_now().await;
        }
        drop(fut);
        assert!(matches!(h.array.disk_state(1),
                         Some(DiskState::Rebuilding{..})));
        h.array.rebuild(1).await.unwrap();
        assert_eq!(h.array.disk_state(1), Some(DiskState::Online));
        assert_eq!(h.array.recon_pool().nfloating(), nfloating);
        assert!(h.mt.contents(1) == original, "polls={polls}");
        let cap = h.capacity();
        assert!(h.read(0, cap).await.unwrap() == data);
    }
}
