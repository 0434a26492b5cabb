// vim: tw=80
//! Graph templates for stripes whose accessed columns include failed disks

use std::cmp;

use crate::{
    layout::AccessStripeMap,
    types::*,
};
use super::{BufId, BufRange, DagBuilder, NodeId, NodeKind};

/// Read every surviving column's whole stripe unit and decode the failed ones.
///
/// Returns the node that completes the decode and each column's buffer.
fn read_and_decode(b: &mut DagBuilder, asm: &AccessStripeMap)
    -> (NodeId, Vec<BufId>)
{
    let su = b.bytes_per_su();
    let mut reads = Vec::new();
    let mut cols = Vec::with_capacity(asm.ncols());
    for col in 0..asm.ncols() {
        if asm.is_failed(col) {
            cols.push(b.alloc(su));
        } else {
            let (rd, buf) = b.read(&asm.stripe_unit(col));
            reads.push(rd);
            cols.push(buf);
        }
    }
    let erasures = asm.failed.clone();
    let dec = b.node(NodeKind::Decode{cols: cols.clone(), erasures}, reads);
    (dec, cols)
}

/// Read from the mirror half that survives
pub(super) fn mirror_degraded_read(b: &mut DagBuilder, asm: &AccessStripeMap)
    -> Result<()>
{
    let survivor = (0..asm.ncols())
        .find(|c| !asm.is_failed(*c))
        .ok_or(Error::ETOOMANYFAULTS)?;
    for pda in asm.data.iter() {
        let ext = asm.extent(survivor, pda.su_offset, pda.su_end());
        let (_, buf) = b.read(&ext);
        let r = b.whole(buf);
        b.output(r);
    }
    Ok(())
}

/// Recover a single failed data column by XORing the row parity with every
/// other data column.
///
/// Each surviving column is read once, over the union of its own touched
/// range and the range being recovered.
pub(super) fn degraded_read(b: &mut DagBuilder, asm: &AccessStripeMap)
    -> Result<()>
{
    let k = asm.data_cols;
    let failed = asm.failed_data().next().ok_or(Error::EDOOFUS)?;
    let j = failed.col;
    let (flo, fhi) = (failed.su_offset, failed.su_end());

    // (column, first sector offset read, buffer)
    let mut survivors: Vec<(usize, SectorT, BufId)> = Vec::new();
    let mut reads = Vec::new();
    for col in (0..k).filter(|c| *c != j).chain([k]) {
        let (lo, hi) = match asm.data_for(col) {
            Some(pda) => (cmp::min(pda.su_offset, flo),
                          cmp::max(pda.su_end(), fhi)),
            None => (flo, fhi)
        };
        let (rd, buf) = b.read(&asm.extent(col, lo, hi));
        reads.push(rd);
        survivors.push((col, lo, buf));
    }
    let recovered = b.alloc(b.bytes(fhi - flo));
    let srcs = survivors.iter()
        .map(|(_, lo, buf)| {
            b.range(*buf, b.bytes(flo - lo), b.bytes(fhi - flo))
        }).collect::<Vec<_>>();
    let dest = b.whole(recovered);
    b.node(NodeKind::Xor{srcs, dest}, reads);

    for pda in asm.data.iter() {
        let r = if pda.col == j {
            b.whole(recovered)
        } else {
            let (_, lo, buf) = survivors.iter()
                .find(|(c, _, _)| *c == pda.col)
                .ok_or(Error::EDOOFUS)?;
            b.range(*buf, b.bytes(pda.su_offset - lo), b.bytes(pda.nsectors))
        };
        b.output(r);
    }
    Ok(())
}

/// Recover failed data columns using both parities
pub(super) fn diag_degraded_read(b: &mut DagBuilder, asm: &AccessStripeMap)
    -> Result<()>
{
    let (_, cols) = read_and_decode(b, asm);
    for pda in asm.data.iter() {
        let r = b.range(cols[pda.col], b.bytes(pda.su_offset),
                        b.bytes(pda.nsectors));
        b.output(r);
    }
    Ok(())
}

/// Write to a stripe when some of the touched columns have failed.
///
/// Rebuilds the whole stripe in memory, overlays the new data, and recomputes
/// both parities.  Then writes the new data and parity to every surviving
/// column.
pub(super) fn reconstruct_write(b: &mut DagBuilder, asm: &AccessStripeMap,
                                data: &[u8]) -> Result<()>
{
    let k = asm.data_cols;
    if asm.ncols() != k + 2 {
        return Err(Error::EDOOFUS);
    }
    let (dec, cols) = read_and_decode(b, asm);
    let mut overlays = Vec::with_capacity(asm.data.len());
    let mut new_bufs: Vec<BufRange> = Vec::with_capacity(asm.data.len());
    for pda in asm.data.iter() {
        let off = b.bytes(pda.raid_addr - asm.raid_addr);
        let new = b.alloc_from(&data[off..off + b.bytes(pda.nsectors)]);
        let src = b.whole(new);
        let dest = b.range(cols[pda.col], b.bytes(pda.su_offset), src.len);
        overlays.push(b.node(NodeKind::Copy{src, dest}, vec![dec]));
        new_bufs.push(src);
    }
    let encode = b.node(NodeKind::Encode {
        data: cols[..k].to_vec(),
        row: cols[k],
        diag: cols[k + 1]
    }, overlays);
    let commit = b.commit(vec![encode]);
    for (pda, src) in asm.data.iter().zip(new_bufs.into_iter()) {
        if !asm.is_failed(pda.col) {
            b.write(pda, src, vec![commit]);
        }
    }
    for col in [k, k + 1] {
        if !asm.is_failed(col) {
            let src = b.whole(cols[col]);
            b.write(&asm.stripe_unit(col), src, vec![commit]);
        }
    }
    Ok(())
}
