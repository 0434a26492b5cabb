// vim: tw=80
//! The reconstruction buffer pool under concurrent producers and consumers

use futures::future;
use pretty_assertions::assert_eq;
use rand::seq::SliceRandom;
use std::collections::BTreeMap;

use raidcore::{
    config::ReconConfig,
    raid::codec,
    recon::{ReconBuffer, ReconBufferPool, Submitted},
};
use super::*;

const NDATA: usize = 4;
const NSTRIPES: PsidT = 16;
const LEN: usize = 256;

fn contribution(rng: &mut XorShiftRng, psid: PsidT, col: usize)
    -> ReconBuffer
{
    let rbuf = ReconBuffer::new(LEN, psid, col, psid * 4);
    rng.fill_bytes(&mut rbuf.io_buf().unwrap()[..]);
    rbuf
}

/// Submit, waiting for a floating buffer whenever necessary
async fn submit(pool: &ReconBufferPool, mut rbuf: ReconBuffer,
                keep_interim: bool)
{
    loop {
        match pool.submit(rbuf, keep_interim, false).unwrap() {
            Submitted::Accepted{..} => return,
            Submitted::Blocked{rbuf: rb, wait} => {
                wait.await.unwrap();
                rbuf = rb;
            }
        }
    }
}

/// Many producers contribute to many stripes in random order, with few
/// floating buffers, while one consumer drains completed stripes.  Every
/// stripe completes exactly once, with the XOR of its contributions.
#[test_log::test(tokio::test)]
async fn shuffled_producers() {
    for (floating, accumulate, keep_interim) in
        [(1, 1, true), (2, 3, true), (4, 2, false), (0, 1, false)]
    {
        let mut rng = XorShiftRng::seed_from_u64(floating as u64);
        let config = ReconConfig {
            floating_buffers: floating,
            bufs_to_accumulate: accumulate
        };
        let pool = Arc::new(ReconBufferPool::new(NDATA, NDATA + 2, LEN,
                                                 &config));
        let mut expected = BTreeMap::new();
        let mut work = Vec::new();
        for psid in 0..NSTRIPES {
            let mut acc = vec![0u8; LEN];
            for col in 0..NDATA {
                let rbuf = contribution(&mut rng, psid, col);
                codec::accumulate(&mut acc,
                                  &[&rbuf.contents().unwrap()[..]]);
                work.push(rbuf);
            }
            expected.insert(psid, acc);
        }
        work.shuffle(&mut rng);

        let consumer = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let mut got = BTreeMap::new();
                for _ in 0..NSTRIPES {
                    let full = pool.get_full().await.unwrap();
                    let psid = full.psid;
                    let v = full.contents().unwrap().to_vec();
                    pool.release_floating(full);
                    pool.complete_stripe(psid).unwrap();
                    assert!(got.insert(psid, v).is_none(),
                            "stripe {psid} completed twice");
                }
                got
            })
        };
        future::join_all(work.into_iter()
            .map(|rbuf| submit(&pool, rbuf, keep_interim))
        ).await;
        let got = consumer.await.unwrap();
        assert_eq!(got.len(), expected.len());
        for (psid, v) in got.iter() {
            assert!(*v == expected[psid], "stripe {psid} is wrong");
        }
        assert_eq!(pool.nfloating(), floating);
    }
}

/// Aborting releases a consumer blocked on an empty pool
#[tokio::test]
async fn abort_releases_consumer() {
    let pool = Arc::new(ReconBufferPool::new(NDATA, NDATA + 2, LEN,
                                             &ReconConfig::default()));
    let pool2 = pool.clone();
    let consumer = tokio::spawn(async move { pool2.get_full().await });
    tokio::task::yield_now().await;
    pool.abort();
    assert_eq!(consumer.await.unwrap().unwrap_err(), Error::ECANCELED);
}
