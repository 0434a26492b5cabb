// vim: tw=80
//! Reads and writes through a complete array, healthy and degraded

use futures::future;
use std::num::NonZeroU8;
use pretty_assertions::assert_eq;
use rstest_reuse::apply;

use raidcore::{array::ParityStatus, health::Health};
use super::*;

/// A degraded read returns exactly what a healthy read would have, for every
/// survivable failure pattern
#[apply(layouts)]
#[test_log::test(tokio::test)]
async fn degraded_read(#[case] scheme: SchemeKind, #[case] ndisks: DiskT) {
    for failed in survivable(scheme, ndisks) {
        let mut h = Harness::new(scheme, ndisks);
        let data = h.fill().await;
        for d in failed.iter() {
            h.fail(*d);
        }
        let cap = h.capacity();
        assert!(h.read(0, cap).await.unwrap() == data,
                "whole-array read with {failed:?} failed");
        // Unaligned accesses, within one stripe unit and across several
        for (addr, len) in [(1, 2), (3, 7), (5, 13), (cap - 5, 5)] {
            let lo = addr as usize * BYTES_PER_SECTOR;
            let hi = (addr + len) as usize * BYTES_PER_SECTOR;
            let got = h.read(addr, len).await.unwrap();
            assert!(got[..] == data[lo..hi],
                    "read of {len} at {addr} with {failed:?} failed");
        }
    }
}

/// Data written while degraded reads back correctly, both before and after
/// the failure set grows
#[apply(layouts)]
#[tokio::test]
async fn degraded_write(#[case] scheme: SchemeKind, #[case] ndisks: DiskT) {
    for failed in survivable(scheme, ndisks) {
        let mut h = Harness::new(scheme, ndisks);
        let mut data = h.fill().await;
        h.fail(failed[0]);
        for (addr, len) in [(0, 1), (2, 9), (13, 24), (40, 3)] {
            let new = h.random(len);
            h.write(addr, &new).await.unwrap();
            let lo = addr as usize * BYTES_PER_SECTOR;
            data[lo..lo + new.len()].copy_from_slice(&new);
        }
        let cap = h.capacity();
        assert!(h.read(0, cap).await.unwrap() == data,
                "read after degraded write with {failed:?} failed");
        for d in failed.iter().skip(1) {
            h.fail(*d);
        }
        assert!(h.read(0, cap).await.unwrap() == data,
                "read after further failures {failed:?} failed");
    }
}

/// With one half of a mirror down, a write spanning three stripe units is
/// exactly three writes to the survivor, and no reads
#[tokio::test]
async fn mirror_degraded_write_io() {
    let mut h = Harness::new(SchemeKind::Mirror, 2);
    h.fail(0);
    let before = h.io_counts();
    let data = h.random(3 * SECTORS_PER_SU);
    h.write(0, &data).await.unwrap();
    let after = h.io_counts();
    assert_eq!(after[0], (0, 0));
    assert_eq!(after[1].0 - before[1].0, 0);
    assert_eq!(after[1].1 - before[1].1, 3);
    assert!(h.read(0, 3 * SECTORS_PER_SU).await.unwrap() == data);
}

/// Two failed EvenOdd members are survivable
#[tokio::test]
async fn evenodd_two_failures() {
    let mut h = Harness::new(SchemeKind::EvenOdd, 6);
    let data = h.fill().await;
    h.fail(1);
    h.fail(4);
    assert_eq!(h.array.health(), Health::Degraded(NonZeroU8::new(2).unwrap()));
    let cap = h.capacity();
    assert!(h.read(0, cap).await.unwrap() == data);
}

/// A third failed EvenOdd member is not, and nothing reaches the disks
#[tokio::test]
async fn evenodd_three_failures() {
    let mut h = Harness::new(SchemeKind::EvenOdd, 6);
    h.fill().await;
    for d in [0, 2, 5] {
        h.fail(d);
    }
    assert_eq!(h.array.health(), Health::Faulted);
    let before = h.io_counts();
    assert_eq!(h.read(0, 8).await, Err(Error::ETOOMANYFAULTS));
    let data = h.random(8);
    assert_eq!(h.write(0, &data).await, Err(Error::ETOOMANYFAULTS));
    assert_eq!(before, h.io_counts());
}

/// An I/O error from a disk the array still thinks is healthy fails the
/// access rather than returning garbage
#[tokio::test]
async fn unexpected_eio() {
    let mut h = Harness::new(SchemeKind::EvenOdd, 5);
    h.fill().await;
    h.mt.fail(2);
    let cap = h.capacity();
    assert_eq!(h.read(0, cap).await, Err(Error::EIO));
    // Once the array knows, the same read succeeds
    h.array.fail_disk(2).unwrap();
    assert!(h.read(0, cap).await.is_ok());
}

#[tokio::test]
async fn out_of_range() {
    let h = Harness::new(SchemeKind::Mirror, 2);
    let cap = h.capacity();
    assert_eq!(h.read(cap - 1, 2).await, Err(Error::ENOSPC));
    assert_eq!(h.read(0, 0).await, Err(Error::EINVAL));
}

/// Concurrent small writes to one degraded stripe leave its redundancy
/// consistent
#[tokio::test]
async fn concurrent_writes_same_stripe() {
    let mut h = Harness::new(SchemeKind::EvenOdd, 5);
    let mut data = h.fill().await;
    h.fail(3);
    let writes = (0..8u64).map(|i| (i % 12, h.random(1))).collect::<Vec<_>>();
    future::join_all(writes.iter()
        .map(|(addr, buf)| h.write(*addr, buf))
    ).await
        .into_iter()
        .collect::<Result<Vec<_>>>()
        .unwrap();
    for (addr, buf) in writes.iter() {
        let lo = *addr as usize * BYTES_PER_SECTOR;
        data[lo..lo + BYTES_PER_SECTOR].copy_from_slice(buf);
    }
    assert!(h.read(0, 12).await.unwrap()[..] ==
            data[..12 * BYTES_PER_SECTOR]);
    // Verification needs every data column, so bring a fresh disk in first
    h.replace(3);
    h.array.rebuild(3).await.unwrap();
    assert_eq!(h.array.verify_redundancy(0, false).await.unwrap(),
               ParityStatus::Okay);
}
