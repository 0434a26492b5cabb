// vim: tw=80
//! XOR combination and the EVENODD two-fault-tolerant code built upon it

use fixedbitset::FixedBitSet;
use std::mem;

const WORD: usize = mem::size_of::<u64>();

/// The prime that dimensions every EVENODD stripe.
///
/// A stripe unit is divided into `EVENODD_P - 1` symbols, and a stripe may have
/// at most `EVENODD_P` data columns.
pub const EVENODD_P: usize = 17;

#[inline]
fn word(b: &[u8]) -> u64 {
    let mut w = [0u8; WORD];
    w.copy_from_slice(b);
    u64::from_ne_bytes(w)
}

fn check_lengths(dest: &[u8], srcs: &[&[u8]]) {
    for (i, s) in srcs.iter().enumerate() {
        assert_eq!(s.len(), dest.len(),
            "source {i} has length {} but destination has length {}",
            s.len(), dest.len());
    }
}

/// Fixed-arity inner loop.  The compiler unrolls the fold over `srcs`.
fn combine_fixed<const N: usize>(dest: &mut [u8], srcs: [&[u8]; N]) {
    let words = dest.len() / WORD;
    let (dhead, dtail) = dest.split_at_mut(words * WORD);
    for (i, dw) in dhead.chunks_exact_mut(WORD).enumerate() {
        let off = i * WORD;
        let acc = srcs.iter()
            .fold(0u64, |acc, s| acc ^ word(&s[off..off + WORD]));
        dw.copy_from_slice(&acc.to_ne_bytes());
    }
    let base = words * WORD;
    for (i, db) in dtail.iter_mut().enumerate() {
        *db = srcs.iter().fold(0u8, |acc, s| acc ^ s[base + i]);
    }
}

/// XOR every source into `dest`, which keeps its prior contents.
///
/// This is the "accumulate into self" form of [`combine`].
///
/// # Panics
///
/// Panics if any source's length differs from `dest`'s.
pub fn accumulate(dest: &mut [u8], srcs: &[&[u8]]) {
    check_lengths(dest, srcs);
    let words = dest.len() / WORD;
    let (dhead, dtail) = dest.split_at_mut(words * WORD);
    for (i, dw) in dhead.chunks_exact_mut(WORD).enumerate() {
        let off = i * WORD;
        let acc = srcs.iter()
            .fold(word(dw), |acc, s| acc ^ word(&s[off..off + WORD]));
        dw.copy_from_slice(&acc.to_ne_bytes());
    }
    let base = words * WORD;
    for (i, db) in dtail.iter_mut().enumerate() {
        *db = srcs.iter().fold(*db, |acc, s| acc ^ s[base + i]);
    }
}

/// Set `dest = srcs[0] ^ srcs[1] ^ ... ^ srcs[n - 1]`.
///
/// Any fan-in is accepted.  The result does not depend on the order of
/// `srcs`.
///
/// # Panics
///
/// Panics if `srcs` is empty or if any source's length differs from `dest`'s.
pub fn combine(dest: &mut [u8], srcs: &[&[u8]]) {
    assert!(!srcs.is_empty(), "combine requires at least one source");
    check_lengths(dest, srcs);
    match *srcs {
        [a] => dest.copy_from_slice(a),
        [a, b] => combine_fixed(dest, [a, b]),
        [a, b, c] => combine_fixed(dest, [a, b, c]),
        [a, b, c, d] => combine_fixed(dest, [a, b, c, d]),
        [a, b, c, d, ref rest @ ..] => {
            combine_fixed(dest, [a, b, c, d]);
            accumulate(dest, rest);
        }
        [] => unreachable!()
    }
}

/// Encoder/decoder for the EVENODD code.
///
/// Each stripe has `k` data columns, a row parity column, and a diagonal
/// parity column.  Columns are indexed `0..k` for data, `k` for row parity and
/// `k + 1` for diagonal parity.  Any two columns may be lost.
#[derive(Clone, Copy, Debug)]
pub struct EvenOddCodec {
    /// Number of data columns
    k: usize,
    /// Bytes per symbol.  Each column holds `EVENODD_P - 1` symbols.
    symbol: usize,
}

impl EvenOddCodec {
    /// Create a codec for `k` data columns of `len` bytes each.
    ///
    /// # Panics
    ///
    /// Panics if `k` is zero or larger than `EVENODD_P`, or if `len` is not a
    /// multiple of `EVENODD_P - 1`.
    pub fn new(k: usize, len: usize) -> Self {
        assert!(k > 0 && k <= EVENODD_P, "unsupported data column count {k}");
        assert_eq!(len % (EVENODD_P - 1), 0,
            "column length must be a multiple of {}", EVENODD_P - 1);
        EvenOddCodec{k, symbol: len / (EVENODD_P - 1)}
    }

    /// Length of one column in bytes
    pub fn column_len(&self) -> usize {
        self.symbol * (EVENODD_P - 1)
    }

    pub fn data_columns(&self) -> usize {
        self.k
    }

    fn sym<'a>(&self, col: &'a [u8], row: usize) -> &'a [u8] {
        &col[row * self.symbol..(row + 1) * self.symbol]
    }

    fn sym_mut<'a>(&self, col: &'a mut [u8], row: usize) -> &'a mut [u8] {
        &mut col[row * self.symbol..(row + 1) * self.symbol]
    }

    /// XOR of every data column's cell on diagonal `d`, excluding the columns
    /// in `skip`.  Cells in the imaginary all-zero row are omitted.
    fn diag_syndrome(&self, cols: &[&mut [u8]], d: usize, skip: &[usize])
        -> Vec<u8>
    {
        let mut acc = vec![0u8; self.symbol];
        for (l, col) in cols.iter().take(self.k).enumerate() {
            let r = (d + EVENODD_P - l) % EVENODD_P;
            if r != EVENODD_P - 1 && !skip.contains(&l) {
                accumulate(&mut acc, &[self.sym(col, r)]);
            }
        }
        acc
    }

    /// XOR of row `r`'s row parity and its data cells, excluding `skip`.
    fn row_syndrome(&self, cols: &[&mut [u8]], r: usize, skip: &[usize])
        -> Vec<u8>
    {
        let mut acc = self.sym(cols[self.k], r).to_vec();
        for (l, col) in cols.iter().take(self.k).enumerate() {
            if !skip.contains(&l) {
                accumulate(&mut acc, &[self.sym(col, r)]);
            }
        }
        acc
    }

    /// Compute both redundancy columns from `k` data columns.
    pub fn encode(&self, data: &[&[u8]], row: &mut [u8], diag: &mut [u8]) {
        assert_eq!(data.len(), self.k);
        combine(row, data);

        // The adjuster is the XOR of the diagonal that passes through the
        // imaginary row's first cell.
        let mut s = vec![0u8; self.symbol];
        for (l, col) in data.iter().enumerate().skip(1) {
            accumulate(&mut s, &[self.sym(col, EVENODD_P - 1 - l)]);
        }
        for i in 0..EVENODD_P - 1 {
            let q = self.sym_mut(diag, i);
            q.copy_from_slice(&s);
            for (l, col) in data.iter().enumerate() {
                let r = (i + EVENODD_P - l) % EVENODD_P;
                if r != EVENODD_P - 1 {
                    accumulate(q, &[self.sym(col, r)]);
                }
            }
        }
    }

    /// Rebuild the erased columns of a stripe in place.
    ///
    /// `cols` holds all `k + 2` columns.  The contents of erased columns are
    /// ignored on input.  Surviving columns are never modified.
    ///
    /// # Panics
    ///
    /// Panics if more than two columns are erased.
    pub fn decode(&self, cols: &mut [&mut [u8]], erasures: &FixedBitSet) {
        let k = self.k;
        assert_eq!(cols.len(), k + 2);
        assert!(erasures.count_ones(..) <= 2, "too many erasures");
        let data_erased = erasures.ones()
            .filter(|&c| c < k)
            .collect::<Vec<_>>();
        let row_erased = erasures.contains(k);
        match data_erased.as_slice() {
            [] => (),
            [j] if !row_erased => self.recover_from_row(cols, *j),
            [j] => self.recover_from_diag(cols, *j),
            [j, m] => self.recover_two(cols, *j, *m),
            _ => unreachable!()
        }
        let diag_erased = erasures.contains(k + 1);
        if row_erased || diag_erased {
            let len = self.column_len();
            let mut row = vec![0u8; len];
            let mut diag = vec![0u8; len];
            {
                let data = cols[..k].iter().map(|c| &**c).collect::<Vec<_>>();
                self.encode(&data, &mut row, &mut diag);
            }
            if row_erased {
                cols[k].copy_from_slice(&row);
            }
            if diag_erased {
                cols[k + 1].copy_from_slice(&diag);
            }
        }
    }

    fn recover_from_row(&self, cols: &mut [&mut [u8]], j: usize) {
        let mut acc = cols[self.k].to_vec();
        for (l, col) in cols.iter().take(self.k).enumerate() {
            if l != j {
                accumulate(&mut acc, &[&**col]);
            }
        }
        cols[j].copy_from_slice(&acc);
    }

    /// Recover data column `j` when the row parity is also gone.
    fn recover_from_diag(&self, cols: &mut [&mut [u8]], j: usize) {
        let p = EVENODD_P;
        let diagc = self.k + 1;
        // Diagonal j - 1 crosses column j only in the imaginary row, so it
        // yields the adjuster without knowing column j.
        let s = if j == 0 {
            self.diag_syndrome(cols, p - 1, &[j])
        } else {
            let mut s = self.diag_syndrome(cols, j - 1, &[j]);
            accumulate(&mut s, &[self.sym(cols[diagc], j - 1)]);
            s
        };
        for r in 0..p - 1 {
            let d = (r + j) % p;
            let mut v = self.diag_syndrome(cols, d, &[j]);
            accumulate(&mut v, &[&s[..]]);
            if d != p - 1 {
                accumulate(&mut v, &[self.sym(cols[diagc], d)]);
            }
            self.sym_mut(cols[j], r).copy_from_slice(&v);
        }
    }

    /// Recover data columns `j` and `m` (`j < m`) from both parities.
    fn recover_two(&self, cols: &mut [&mut [u8]], j: usize, m: usize) {
        let p = EVENODD_P;
        let (rowc, diagc) = (self.k, self.k + 1);
        let mut s = vec![0u8; self.symbol];
        for i in 0..p - 1 {
            accumulate(&mut s,
                &[self.sym(cols[rowc], i), self.sym(cols[diagc], i)]);
        }
        // Start on the diagonal where column j's cell is imaginary, then
        // alternate between diagonals and rows until column m's imaginary
        // cell is reached.
        let mut d = (j + p - 1) % p;
        let mut prev = vec![0u8; self.symbol];
        loop {
            let rm = (d + p - m) % p;
            if rm == p - 1 {
                break;
            }
            let mut vm = self.diag_syndrome(cols, d, &[j, m]);
            accumulate(&mut vm, &[&s[..], &prev[..]]);
            if d != p - 1 {
                accumulate(&mut vm, &[self.sym(cols[diagc], d)]);
            }
            self.sym_mut(cols[m], rm).copy_from_slice(&vm);
            let mut vj = self.row_syndrome(cols, rm, &[j, m]);
            accumulate(&mut vj, &[&vm[..]]);
            self.sym_mut(cols[j], rm).copy_from_slice(&vj);
            prev = vj;
            d = (rm + j) % p;
        }
    }

    /// Update a diagonal parity column after data column `col` changed.
    ///
    /// `delta` is the XOR of the column's old and new contents.
    pub fn diag_delta(&self, col: usize, delta: &[u8], diag: &mut [u8]) {
        let p = EVENODD_P;
        assert!(col < self.k);
        for r in 0..p - 1 {
            let dsym = self.sym(delta, r);
            if dsym.iter().all(|b| *b == 0) {
                continue;
            }
            let d = (r + col) % p;
            if d == p - 1 {
                // The adjuster changed, so every diagonal parity symbol does
                for i in 0..p - 1 {
                    accumulate(self.sym_mut(diag, i), &[dsym]);
                }
            } else {
                accumulate(self.sym_mut(diag, d), &[dsym]);
            }
        }
    }
}
