// Abacus refinement: local re-optimization of a bounded window of columns.
//
// A window of the live column chain is extracted into a dense rows x
// (3 * window) byte grid with all-gap left/right workspaces. Candidate
// rearrangements (left shift, right shift, and an allele-aware mixed shift)
// are produced on private clones and scored by weighted edit distance; only
// the best-scoring clone is committed back into the live structure. Windows
// wider than the safety cutoff are skipped outright: a window that wide is
// usually a real polymorphism that shifting would destroy.

use log::{debug, warn};

use crate::basecall::{base_call, CallPolicy};
use crate::cns_opt::CnsOptions;
use crate::defaults::{
    MAX_SIZE_OF_ADJUSTED_REGION, MSTRING_SIZE, QV_FOR_MULTI_GAP, STABWIDTH, STAB_GAP_RATE,
    STAB_MISMATCH_RATE,
};
use crate::refresh::{
    refresh_manode, sort_alleles_by_length, var_region_from_rows, RefreshMode, VarRegion,
};
use crate::store::{BaseCount, BeadId, CnsSession, ColId, GAP};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ShiftStatus {
    Unshifted,
    Left,
    Right,
    Mixed,
}

/// Window identification heuristic.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum RefineLevel {
    /// Grow while the consensus call is a gap.
    Smooth,
    /// Grow across a run of one repeated symbol (plus flanking gap columns).
    PolyX,
    /// Grow while a trailing stability buffer stays noisy.
    Indel,
}

/// Dense transient view of a window: rows x (3 * window_width) cells with a
/// one-cell 'n' border on each row. The left and right thirds are all-gap
/// workspaces for shifting; the center third holds the live bases.
#[derive(Clone)]
pub struct Abacus {
    pub start_column: ColId,
    pub end_column: ColId,
    pub rows: usize,
    pub columns: usize,
    pub window_width: usize,
    pub shift: ShiftStatus,
    beads: Vec<u8>,
    calls: Vec<u8>,
}

impl Abacus {
    #[inline]
    pub fn get(&self, i: usize, j: usize) -> u8 {
        self.beads[i * (self.columns + 2) + j + 1]
    }

    /// Border-aware read: j may be -1 or `columns`, returning the 'n'
    /// sentinel that stops boundary scans.
    #[inline]
    fn cell(&self, i: usize, j: i64) -> u8 {
        debug_assert!(j >= -1 && j <= self.columns as i64);
        self.beads[i * (self.columns + 2) + (j + 1) as usize]
    }

    #[inline]
    fn set(&mut self, i: usize, j: usize, c: u8) {
        assert!(i < self.rows, "abacus row {i} out of range ({} rows)", self.rows);
        assert!(j < self.columns, "abacus column {j} out of range ({} columns)", self.columns);
        self.beads[i * (self.columns + 2) + j + 1] = c;
    }

    fn reset_calls(&mut self) {
        self.calls.fill(b'n');
    }

    /// Row contents as owned vectors (for allele clustering).
    fn rows_vec(&self) -> Vec<Vec<u8>> {
        (0..self.rows)
            .map(|i| (0..self.columns).map(|j| self.get(i, j)).collect())
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn from_rows(rows: &[&[u8]]) -> Abacus {
        let width = rows[0].len();
        let mut a = Abacus {
            start_column: ColId::INVALID,
            end_column: ColId::INVALID,
            rows: rows.len(),
            columns: 3 * width,
            window_width: width,
            shift: ShiftStatus::Unshifted,
            beads: vec![b'n'; rows.len() * (3 * width + 2)],
            calls: vec![b'n'; 3 * width],
        };
        for i in 0..a.rows {
            for j in 0..width {
                a.set(i, j, GAP);
                a.set(i, width + j, rows[i][j]);
                a.set(i, 2 * width + j, GAP);
            }
        }
        a
    }

    #[cfg(test)]
    pub(crate) fn non_gap_multiset(&self, row: usize) -> Vec<u8> {
        let mut v: Vec<u8> = (0..self.columns)
            .map(|j| self.get(row, j))
            .filter(|&b| b != GAP && b != b'n')
            .collect();
        v.sort_unstable();
        v
    }
}

// ---- construction ----------------------------------------------------------

/// Extract the window [from, end_excl) of the live chain into an abacus.
/// Every fragment touching any window column gets a row (exact membership
/// scan; short reads strictly inside the window are found by construction).
pub fn create_abacus(cns: &mut CnsSession, from: ColId, end_excl: ColId) -> Abacus {
    // window width and last interior column
    let mut width = 1usize;
    let mut last = from;
    while cns.columns[last.idx()].next.is_valid() && cns.columns[last.idx()].next != end_excl {
        last = cns.columns[last.idx()].next;
        width += 1;
    }

    // exact row assignment
    cns.abacus_rows.clear();
    cns.abacus_rows.resize(cns.frags.len(), 0);
    let mut rows = 0usize;
    let mut cid = from;
    loop {
        for bid in cns.column_bead_ids(cid) {
            let fi = cns.beads[bid.idx()].frag.idx();
            if cns.abacus_rows[fi] == 0 {
                rows += 1;
                cns.abacus_rows[fi] = rows as i32;
            }
        }
        if cid == last {
            break;
        }
        cid = cns.columns[cid.idx()].next;
    }

    let mut a = Abacus {
        start_column: from,
        end_column: last,
        rows,
        columns: 3 * width,
        window_width: width,
        shift: ShiftStatus::Unshifted,
        beads: vec![b'n'; rows * (3 * width + 2)],
        calls: vec![b'n'; 3 * width],
    };

    // center third: live bases; outer thirds: gap workspaces
    let mut cid = from;
    let mut j = 0usize;
    loop {
        for bid in cns.column_bead_ids(cid) {
            let fi = cns.beads[bid.idx()].frag.idx();
            let row = (cns.abacus_rows[fi] - 1) as usize;
            a.set(row, width + j, cns.base(bid));
        }
        if cid == last {
            break;
        }
        cid = cns.columns[cid.idx()].next;
        j += 1;
    }
    for i in 0..rows {
        for j in 0..width {
            a.set(i, j, GAP);
            a.set(i, 2 * width + j, GAP);
        }
    }
    a.reset_calls();
    a
}

// ---- scoring ---------------------------------------------------------------

/// Majority-call every column and sum the per-column mismatch counts.
/// A gap adjacent to a null cell is itself treated as null (a read boundary,
/// not a disagreement). Returns (mismatch score, non-null column count) and
/// leaves the per-column calls in place.
pub fn score_abacus(a: &mut Abacus) -> (i32, i32) {
    let mut counts: Vec<BaseCount> = vec![BaseCount::default(); a.columns];
    let mut cols = 0;
    let mut score = 0;

    for i in 0..a.rows {
        for j in 0..a.columns {
            let mut b = a.get(i, j);
            if b == GAP && j > 0 && j < a.columns - 1 {
                if a.get(i, j - 1) == b'n' || a.get(i, j + 1) == b'n' {
                    b = b'n';
                }
            }
            counts[j].inc(b);
        }
    }

    for j in 0..a.columns {
        let c = &counts[j];
        if c.get(GAP) + c.get(b'N') == c.depth {
            a.calls[j] = b'n';
        } else {
            cols += 1;
            a.calls[j] = c.max_base(0);
            score += c.depth - c.get(a.calls[j]) - c.get(b'N');
        }
    }
    (score, cols)
}

/// Count distinct gap-open events in the active third of the matrix; run
/// length does not matter. Used to break ties in favor of fewer, longer gaps.
pub fn affine_score_abacus(a: &Abacus) -> i32 {
    let (start, end) = match a.shift {
        ShiftStatus::Left => (0, a.columns / 3),
        ShiftStatus::Right => (2 * a.columns / 3, a.columns),
        _ => (a.columns / 3, 2 * a.columns / 3),
    };

    let mut score = 0;
    for i in 0..a.rows {
        let mut in_gap = false;
        for j in start..end {
            if a.get(i, j) != GAP {
                in_gap = false;
            } else if !in_gap {
                in_gap = true;
                score += 1;
            }
        }
    }
    score
}

// ---- merging ---------------------------------------------------------------

/// Sweep the grid merging neighbor columns wherever every row has a gap on
/// one side (or null on both), compacting toward `merge_dir` (< 0 left,
/// > 0 right). Returns the number of columns merged away.
pub fn merge_abacus(a: &mut Abacus, merge_dir: i32) -> i32 {
    let mut last_non_null = a.columns - 1;
    let mut first_non_null = 0;

    for j in (1..a.columns).rev() {
        let null_column = (0..a.rows).all(|i| a.get(i, j) == GAP);
        if !null_column {
            break;
        }
        last_non_null = j;
    }
    for j in 0..a.columns {
        let null_column = (0..a.rows).all(|i| a.get(i, j) == GAP);
        if !null_column {
            break;
        }
        first_non_null = j;
    }

    let mut columns_merged = 0;

    if merge_dir < 0 {
        let mut j = 0usize;
        while j < last_non_null {
            let mut mergeok = true;
            let mut next_column_good = false;
            let mut num_gaps = 0;
            let mut num_ns = 0;
            for i in 0..a.rows {
                let curr = a.get(i, j);
                let next = a.get(i, j + 1);
                if curr != GAP && next != GAP {
                    if curr != b'n' || next != b'n' {
                        mergeok = false;
                        break;
                    }
                    num_ns += 1;
                } else {
                    num_gaps += 1;
                }
                if next != GAP && next != b'n' {
                    next_column_good = true;
                }
            }
            if mergeok && next_column_good && num_gaps > num_ns {
                columns_merged += 1;
                for i in 0..a.rows {
                    let curr = a.get(i, j);
                    let next = a.get(i, j + 1);
                    if curr == b'n' && next == b'n' {
                        continue;
                    }
                    if next != GAP && next != b'n' {
                        a.set(i, j, next);
                        a.set(i, j + 1, curr);
                    }
                }
                // column j+1 is now all gap/null; squeeze it out by sliding
                // the remaining columns left
                for i in 0..a.rows {
                    let curr = a.get(i, j);
                    let next = a.get(i, j + 1);
                    if curr == b'n' && next == b'n' {
                        continue;
                    }
                    for k in (j + 1)..last_non_null {
                        let next = a.get(i, k + 1);
                        a.set(i, k, next);
                    }
                    a.set(i, last_non_null, GAP);
                }
                // retry the same column
                continue;
            }
            j += 1;
        }
    } else {
        let mut j = last_non_null as i64 - 1;
        while j > first_non_null as i64 {
            let ju = j as usize;
            let mut mergeok = true;
            let mut curr_column_good = false;
            let mut num_gaps = 0;
            let mut num_ns = 0;
            for i in 0..a.rows {
                let curr = a.get(i, ju);
                let next = a.get(i, ju + 1);
                if curr != GAP && next != GAP {
                    if curr != b'n' || next != b'n' {
                        mergeok = false;
                        break;
                    }
                    num_ns += 1;
                } else {
                    num_gaps += 1;
                }
                if curr != GAP && curr != b'n' {
                    curr_column_good = true;
                }
            }
            if mergeok && curr_column_good && num_gaps > num_ns {
                columns_merged += 1;
                for i in 0..a.rows {
                    let curr = a.get(i, ju);
                    let next = a.get(i, ju + 1);
                    if curr == b'n' && next == b'n' {
                        continue;
                    }
                    if curr != GAP && curr != b'n' {
                        a.set(i, ju, next);
                        a.set(i, ju + 1, curr);
                    }
                }
                // column j is now all gap; slide the earlier columns right
                for i in 0..a.rows {
                    let curr = a.get(i, ju);
                    let next = a.get(i, ju + 1);
                    if curr == b'n' && next == b'n' {
                        continue;
                    }
                    for k in ((first_non_null + 1)..=ju).rev() {
                        let prev = a.get(i, k - 1);
                        a.set(i, k, prev);
                    }
                    a.set(i, first_non_null, GAP);
                }
                // retry the same column
                continue;
            }
            j -= 1;
        }
    }

    columns_merged
}

// ---- shifting --------------------------------------------------------------

/// Force the rows of each confirmed allele to the alignment of the allele's
/// last read, so same-allele reads cannot disagree on gap placement before
/// scoring.
fn refine_orig_abacus(a: &mut Abacus, vreg: &VarRegion) {
    a.reset_calls();
    for j in a.window_width..2 * a.window_width {
        for k in 0..vreg.nca {
            let al = &vreg.alleles[k];
            let last_row = al.read_ids[al.read_ids.len() - 1];
            let c = a.get(last_row, j);
            for &row in &al.read_ids[..al.read_ids.len() - 1] {
                a.set(row, j, c);
            }
        }
    }
}

/// Slide every non-gap base as far left as a compatible column allows.
/// An unset ('n') call is claimed by the first base that lands on it.
pub fn left_shift(a: &mut Abacus, vreg: &VarRegion) -> (i32, i32) {
    a.reset_calls();
    for j in a.window_width..2 * a.window_width {
        for k in 0..vreg.na {
            for l in 0..vreg.alleles[k].read_ids.len() {
                let i = vreg.alleles[k].read_ids[l];
                let c = a.get(i, j);
                if c == GAP {
                    continue;
                }
                let mut ccol = j;
                while a.cell(i, ccol as i64 - 1) == GAP {
                    ccol -= 1;
                }
                for pcol in ccol..j {
                    let call = a.calls[pcol];
                    if call != b'n' && call != c && c != b'n' {
                        continue;
                    }
                    if call == b'n' {
                        a.calls[pcol] = c;
                    }
                    if a.calls[pcol] == c || c == b'n' {
                        a.set(i, j, GAP);
                        a.set(i, pcol, c);
                        break;
                    }
                }
                if a.get(i, j) != GAP {
                    a.calls[j] = c;
                }
            }
        }
    }
    merge_abacus(a, -1);
    a.shift = ShiftStatus::Left;
    score_abacus(a)
}

/// Mirror image of left_shift.
pub fn right_shift(a: &mut Abacus, vreg: &VarRegion) -> (i32, i32) {
    a.reset_calls();
    for j in (a.window_width..2 * a.window_width).rev() {
        for k in 0..vreg.na {
            for l in 0..vreg.alleles[k].read_ids.len() {
                let i = vreg.alleles[k].read_ids[l];
                let c = a.get(i, j);
                if c == GAP {
                    continue;
                }
                let mut ccol = j;
                while a.cell(i, ccol as i64 + 1) == GAP {
                    ccol += 1;
                }
                for pcol in ((j + 1)..=ccol).rev() {
                    let call = a.calls[pcol];
                    if call != b'n' && call != c && c != b'n' {
                        continue;
                    }
                    if call == b'n' {
                        a.calls[pcol] = c;
                    }
                    if a.calls[pcol] == c || c == b'n' {
                        a.set(i, j, GAP);
                        a.set(i, pcol, c);
                        break;
                    }
                }
                if a.get(i, j) != GAP {
                    a.calls[j] = c;
                }
            }
        }
    }
    merge_abacus(a, 1);
    a.shift = ShiftStatus::Right;
    score_abacus(a)
}

/// Shift only the short allele's rows: left within [window_beg, lpos],
/// right within (rpos, window_end). Template positions outside the agreed
/// interval are 'n' ("don't care") so the fixed long-allele consensus is
/// not fought over.
#[allow(clippy::too_many_arguments)]
fn mixed_shift(
    a: &mut Abacus,
    vreg: &VarRegion,
    lpos: i64,
    rpos: i64,
    tmpl: &[u8],
    short_allele: i32,
) -> (i32, i32) {
    a.reset_calls();

    let (window_beg, window_end) = match a.shift {
        ShiftStatus::Left => (0, a.window_width),
        ShiftStatus::Unshifted => (a.window_width, 2 * a.window_width),
        _ => (2 * a.window_width, 3 * a.window_width),
    };

    a.calls[window_beg..window_end].copy_from_slice(&tmpl[window_beg..window_end]);

    // left shift of the short allele
    let lstop = (window_end as i64).min(lpos);
    let mut j = window_beg as i64;
    while j <= lstop {
        let ju = j as usize;
        for k in 0..vreg.na {
            for l in 0..vreg.alleles[k].read_ids.len() {
                let i = vreg.alleles[k].read_ids[l];
                if vreg.reads[i].allele_id != short_allele {
                    continue;
                }
                let c = a.get(i, ju);
                if c == GAP {
                    continue;
                }
                let mut ccol = ju;
                while ccol > window_beg && a.get(i, ccol - 1) == GAP {
                    ccol -= 1;
                }
                for pcol in ccol..ju {
                    let call = a.calls[pcol];
                    if call != b'n' && call != c && c != b'n' {
                        continue;
                    }
                    if call == b'n' {
                        a.calls[pcol] = c;
                    }
                    if a.calls[pcol] == c || c == b'n' {
                        a.set(i, ju, GAP);
                        a.set(i, pcol, c);
                        break;
                    }
                }
                if a.get(i, ju) != GAP {
                    a.calls[ju] = c;
                }
            }
        }
        j += 1;
    }

    // right shift of the short allele
    let rstop = if rpos > 0 { rpos } else { window_end as i64 };
    let mut j = window_end as i64 - 1;
    while j > rstop {
        let ju = j as usize;
        for k in 0..vreg.na {
            for l in 0..vreg.alleles[k].read_ids.len() {
                let i = vreg.alleles[k].read_ids[l];
                if vreg.reads[i].allele_id != short_allele {
                    continue;
                }
                let c = a.get(i, ju);
                if c == GAP {
                    continue;
                }
                let mut ccol = ju;
                while ccol + 1 < window_end && a.get(i, ccol + 1) == GAP {
                    ccol += 1;
                }
                for pcol in ((ju + 1)..=ccol).rev() {
                    let call = a.calls[pcol];
                    if call != b'n' && call != c && c != b'n' {
                        continue;
                    }
                    if call == b'n' {
                        a.calls[pcol] = c;
                    }
                    if a.calls[pcol] == c || c == b'n' {
                        a.set(i, ju, GAP);
                        a.set(i, pcol, c);
                        break;
                    }
                }
                if a.get(i, ju) != GAP {
                    a.calls[ju] = c;
                }
            }
        }
        j -= 1;
    }

    a.shift = ShiftStatus::Mixed;
    score_abacus(a)
}

// ---- two-allele consensus helpers for the mixed shift ----------------------

/// Per-position majority call of each of the top two alleles across the full
/// grid; ties call 'N'.
fn consensus_for_abacus(a: &Abacus, vreg: &VarRegion) -> [Vec<u8>; 2] {
    let mut cons = [vec![GAP; a.columns], vec![GAP; a.columns]];
    for j in 0..a.columns {
        for which in 0..2 {
            let mut counts = [0i32; 6];
            for (i, read) in vreg.reads.iter().enumerate() {
                let in_allele = (read.allele_id == 0) == (which == 0);
                if in_allele {
                    counts[crate::store::base_index(a.get(i, j))] += 1;
                }
            }
            let mut best = 0;
            let mut second = 0;
            let mut cbase = GAP;
            for (bi, &cnt) in counts.iter().enumerate() {
                if cnt > best {
                    second = best;
                    best = cnt;
                    cbase = crate::store::ALPHABET[bi];
                } else if cnt > second {
                    second = cnt;
                }
            }
            cons[which][j] = if best == second { b'N' } else { cbase };
        }
    }
    cons
}

/// Ungapped consensi plus a map from ungapped to gapped positions.
fn map_consensus(cons: &[Vec<u8>; 2]) -> ([Vec<u8>; 2], [Vec<usize>; 2]) {
    let mut ug = [Vec::new(), Vec::new()];
    let mut imap = [Vec::new(), Vec::new()];
    for i in 0..2 {
        for (j, &b) in cons[i].iter().enumerate() {
            if b != GAP {
                ug[i].push(b);
                imap[i].push(j);
            }
        }
    }
    (ug, imap)
}

/// Internal gap counts of each consensus (gaps past the last base excluded).
fn count_gaps(cons: &[Vec<u8>; 2]) -> [i32; 2] {
    let mut out = [0; 2];
    for i in 0..2 {
        let mut last_base = cons[i].len() - 1;
        while last_base > 0 && cons[i][last_base] == GAP {
            last_base -= 1;
        }
        let mut first_seen = false;
        for j in 0..=last_base {
            if cons[i][j] != GAP {
                first_seen = true;
            }
            if first_seen && cons[i][j] == GAP {
                out[i] += 1;
            }
        }
    }
    out
}

/// Leftmost co-occurring k-mer of the two ungapped consensi: the adjusted
/// left boundary from which the alleles can be made to agree.
fn find_adjusted_left_bounds(ug: &[Vec<u8>; 2], short: usize, long: usize) -> [i64; 2] {
    let mut adj = [0i64; 2];
    adj[short] = ug[short].len() as i64 - 1;
    adj[long] = ug[long].len() as i64 - 1;

    if ug[short].len() >= MSTRING_SIZE && ug[long].len() >= MSTRING_SIZE {
        for s in 0..=(ug[short].len() - MSTRING_SIZE) {
            for l in 0..=(ug[long].len() - MSTRING_SIZE) {
                if ug[short][s..s + MSTRING_SIZE] == ug[long][l..l + MSTRING_SIZE]
                    && adj[0] + adj[1] > (s + l) as i64
                {
                    adj[long] = l as i64;
                    adj[short] = s as i64;
                }
            }
        }
    }
    if adj[long] == ug[long].len() as i64 - 1 && adj[short] == ug[short].len() as i64 - 1 {
        adj = [0, 0];
    }
    adj
}

fn find_adjusted_right_bounds(ug: &[Vec<u8>; 2], short: usize, long: usize) -> [i64; 2] {
    let mut adj = [0i64; 2];
    adj[short] = ug[short].len() as i64 - 1;
    adj[long] = ug[long].len() as i64 - 1;

    if ug[short].len() >= MSTRING_SIZE && ug[long].len() >= MSTRING_SIZE {
        for s in (0..=(ug[short].len() - MSTRING_SIZE)).rev() {
            for l in (0..=(ug[long].len() - MSTRING_SIZE)).rev() {
                if ug[short][s..s + MSTRING_SIZE] == ug[long][l..l + MSTRING_SIZE] {
                    let s_tail = ug[short].len() as i64 - 1 - (s + MSTRING_SIZE) as i64;
                    let l_tail = ug[long].len() as i64 - 1 - (l + MSTRING_SIZE) as i64;
                    if adj[0] + adj[1] > s_tail + l_tail {
                        adj[long] = l_tail;
                        adj[short] = s_tail;
                    }
                }
            }
        }
    }
    if adj[long] == ug[long].len() as i64 - 1 && adj[short] == ug[short].len() as i64 - 1 {
        adj = [0, 0];
    }
    adj
}

/// Running agreement score scanning rightward from the adjusted left bounds;
/// returns (max score, gapped position of the maximum).
fn left_score(
    ug: &[Vec<u8>; 2],
    imap: &[Vec<usize>; 2],
    adjleft: &[i64; 2],
    short: usize,
    long: usize,
) -> (i32, i64) {
    let mut maxscore = 0;
    let mut maxpos = adjleft[short];
    let mut score = 0;
    let mut i = 0i64;
    while (i < ug[short].len() as i64 - adjleft[short]) && (i < ug[long].len() as i64 - adjleft[long]) {
        let lpos = (i + adjleft[long]) as usize;
        let spos = (i + adjleft[short]) as usize;
        if ug[short][spos] == ug[long][lpos] {
            score += 1;
        } else {
            score -= 1;
        }
        if maxscore < score {
            maxscore = score;
            maxpos = spos as i64;
        }
        i += 1;
    }
    (maxscore, imap[short][maxpos as usize] as i64)
}

fn right_score(
    ug: &[Vec<u8>; 2],
    imap: &[Vec<usize>; 2],
    adjright: &[i64; 2],
    short: usize,
    long: usize,
) -> (i32, i64) {
    let mut maxscore = 0;
    let mut maxpos = ug[short].len() as i64 - 1 - adjright[short];
    let mut score = 0;
    let mut i = ug[long].len() as i64 - 1;
    let mut j = ug[short].len() as i64 - 1;
    while j >= adjright[short] && i >= adjright[long] {
        let lpos = (i - adjright[long]) as usize;
        let spos = (j - adjright[short]) as usize;
        if ug[short][spos] == ug[long][lpos] {
            score += 1;
        } else {
            score -= 1;
        }
        if maxscore < score {
            maxscore = score;
            maxpos = spos as i64;
        }
        i -= 1;
        j -= 1;
    }
    (maxscore, imap[short][maxpos as usize] as i64)
}

/// Reconcile the left/right shifting interfaces; a large adjusted region on
/// the long allele disables that side entirely.
fn adjust_shifting_interfaces(
    lpos: &mut i64,
    rpos: &mut i64,
    mut lscore: i32,
    mut rscore: i32,
    adjleft: &[i64; 2],
    adjright: &[i64; 2],
    long: usize,
) {
    if adjleft[long] > 5 {
        *lpos = -1;
        lscore = -1;
    }
    if adjright[long] > i64::from(MAX_SIZE_OF_ADJUSTED_REGION) {
        *rpos = -1;
        rscore = -1;
    }

    if *lpos <= *rpos {
        return;
    }
    if lscore > 0 && rscore > 0 {
        if lscore > rscore {
            *rpos = *lpos;
        } else {
            *lpos = *rpos;
        }
    } else if lscore > 0 {
        *rpos = -1;
    } else {
        *lpos = -1;
    }
}

/// Long-allele consensus with disagreement positions (outside [lpos, rpos])
/// masked to 'n'.
#[allow(clippy::too_many_arguments)]
fn template_for_abacus(
    cons: &[Vec<u8>; 2],
    ug: &[Vec<u8>; 2],
    imap: &[Vec<usize>; 2],
    lpos: i64,
    rpos: i64,
    adjleft: &[i64; 2],
    adjright: &[i64; 2],
    short: usize,
    long: usize,
) -> Vec<u8> {
    let len = cons[long].len();
    let mut tmpl: Vec<u8> = cons[long].clone();

    // left part: mask mismatching long-allele bases up to lpos
    let mut i = 0i64;
    while (i + adjleft[long]) < ug[long].len() as i64
        && imap[long][(i + adjleft[long]) as usize] as i64 <= lpos
        && i < ug[short].len() as i64 - adjleft[short]
        && i < ug[long].len() as i64 - adjleft[long]
    {
        let l = (i + adjleft[long]) as usize;
        let s = (i + adjleft[short]) as usize;
        if ug[short][s] != ug[long][l] && tmpl[imap[long][l]] != GAP {
            tmpl[imap[long][l]] = b'n';
        }
        i += 1;
    }

    // bases before the adjusted left boundary are unknowable
    if adjleft[long] > 0 && lpos > 0 {
        let mut i = imap[long][(adjleft[long] - 1) as usize] as i64;
        let mut j = 0i64;
        while j < adjleft[short] && i >= 0 {
            if cons[long][i as usize] != GAP {
                tmpl[i as usize] = b'n';
                j += 1;
            }
            i -= 1;
        }
    }

    // right part
    let mut i = ug[long].len() as i64 - 1 - adjright[long];
    let mut j = ug[short].len() as i64 - 1 - adjright[short];
    while i >= adjleft[long] && j >= adjleft[short] && (imap[long][i as usize] as i64) > rpos {
        if ug[short][j as usize] != ug[long][i as usize] && tmpl[imap[long][i as usize]] != GAP {
            tmpl[imap[long][i as usize]] = b'n';
        }
        i -= 1;
        j -= 1;
    }

    // bases past the adjusted right boundary are unknowable
    if adjright[long] > 0 && rpos > 0 {
        for i in (ug[long].len() as i64 - adjright[long])..(ug[long].len() as i64) {
            let j = imap[long][i as usize];
            if cons[long][j] != GAP {
                tmpl[j] = b'n';
            }
        }
    }

    debug_assert_eq!(tmpl.len(), len);
    tmpl
}

// ---- committing back into the live structure -------------------------------

/// Move a bead's content leftward to `bid`'s position: either a single
/// exchange across a pure-gap run, or bubbling an end gap left one swap at
/// a time.
fn left_end_shift_bead(cns: &mut CnsSession, bid: BeadId, eid: BeadId) {
    let aid = cns.beads[bid.idx()].prev;
    if cns.base(eid) != GAP {
        cns.lateral_exchange_beads(bid, eid);
    } else {
        while cns.beads[eid.idx()].prev != aid {
            let p = cns.beads[eid.idx()].prev;
            cns.lateral_exchange_beads(p, eid);
        }
    }
}

fn right_end_shift_bead(cns: &mut CnsSession, bid: BeadId, eid: BeadId) {
    let aid = cns.beads[eid.idx()].next;
    if cns.base(bid) != GAP {
        cns.lateral_exchange_beads(bid, eid);
    } else {
        while cns.beads[bid.idx()].next != aid {
            let n = cns.beads[bid.idx()].next;
            cns.lateral_exchange_beads(bid, n);
        }
    }
}

/// Commit the winning abacus back into the live chain: walk the active zone
/// in lockstep with the window columns, unaligning beads the grid voids,
/// exchanging beads into agreement, inserting gap beads/columns as needed,
/// and re-calling each finalized column.
pub fn apply_abacus(cns: &mut CnsSession, a: &Abacus, opt: &CnsOptions) {
    match a.shift {
        ShiftStatus::Left => apply_forward(cns, a, 0, opt),
        ShiftStatus::Mixed => apply_forward(cns, a, a.window_width, opt),
        ShiftStatus::Right => apply_backward(cns, a, opt),
        ShiftStatus::Unshifted => {}
    }
}

fn apply_forward(cns: &mut CnsSession, a: &Abacus, zone_offset: usize, opt: &CnsOptions) {
    let mut column = a.start_column;
    for columns in 0..a.window_width {
        let mut bid = cns.beads[cns.columns[column.idx()].call.idx()].down;

        while bid.is_valid() {
            let fi = cns.beads[bid.idx()].frag.idx();
            let row = (cns.abacus_rows[fi] - 1) as usize;
            let a_entry = a.get(row, zone_offset + columns);
            let exch;

            if a_entry == b'n' {
                exch = cns.beads[bid.idx()].up;
                cns.unalign_trailing_gap_beads(bid);
            } else if a_entry != cns.base(bid) {
                // search right along the fragment for the wanted base,
                // growing the fragment (and the chain) when we run out
                let mut eid = bid;
                while a_entry != cns.base(eid) {
                    let next = cns.beads[eid.idx()].next;
                    let eidp = if !next.is_valid() {
                        let g = cns.append_gap_bead(eid);
                        let ecol = cns.beads[eid.idx()].column;
                        let ncol = cns.columns[ecol.idx()].next;
                        assert!(ncol.is_valid(), "gap bead walked off the column chain");
                        cns.align_bead_to_column(ncol, g);
                        g
                    } else if cns.beads[eid.idx()].column == a.end_column {
                        let g = cns.append_gap_bead(eid);
                        let ecol = cns.beads[eid.idx()].column;
                        cns.column_append(ecol, g);
                        g
                    } else {
                        next
                    };
                    eid = eidp;
                }
                left_end_shift_bead(cns, bid, eid);
                exch = eid;
            } else {
                exch = bid;
            }

            bid = cns.beads[exch.idx()].down;
        }

        base_call(cns, column, CallPolicy::Weighted, None, opt, None);
        column = cns.columns[column.idx()].next;
    }
}

fn apply_backward(cns: &mut CnsSession, a: &Abacus, opt: &CnsOptions) {
    let mut column = a.end_column;
    for columns in 0..a.window_width {
        let mut bid = cns.beads[cns.columns[column.idx()].call.idx()].down;

        while bid.is_valid() {
            let fi = cns.beads[bid.idx()].frag.idx();
            let row = (cns.abacus_rows[fi] - 1) as usize;
            let a_entry = a.get(row, a.columns - columns - 1);
            let exch;

            if a_entry == b'n' {
                exch = cns.beads[bid.idx()].up;
                cns.unalign_trailing_gap_beads(bid);
            } else if a_entry != cns.base(bid) {
                let mut eid = bid;
                while a_entry != cns.base(eid) {
                    let prev = cns.beads[eid.idx()].prev;
                    let eidp = if !prev.is_valid() {
                        let g = cns.prepend_gap_bead(eid);
                        let ecol = cns.beads[eid.idx()].column;
                        let pcol = cns.columns[ecol.idx()].prev;
                        assert!(pcol.is_valid(), "gap bead walked off the column chain");
                        cns.align_bead_to_column(pcol, g);
                        g
                    } else if cns.beads[eid.idx()].column == a.start_column {
                        let g = cns.append_gap_bead(prev);
                        let ecol = cns.beads[eid.idx()].column;
                        let pcol = cns.columns[ecol.idx()].prev;
                        assert!(pcol.is_valid(), "no room left of the refinement window");
                        cns.column_append(pcol, g);
                        g
                    } else {
                        prev
                    };
                    eid = eidp;
                }
                right_end_shift_bead(cns, eid, bid);
                exch = eid;
            } else {
                exch = bid;
            }

            bid = cns.beads[exch.idx()].down;
        }

        base_call(cns, column, CallPolicy::Weighted, None, opt, None);
        column = cns.columns[column.idx()].prev;
    }
}

// ---- window identification -------------------------------------------------

fn call_base_of(cns: &CnsSession, cid: ColId) -> u8 {
    cns.base(cns.columns[cid.idx()].call)
}

fn column_mismatch(cns: &CnsSession, cid: ColId) -> i32 {
    let c = &cns.columns[cid.idx()].counts;
    c.depth - c.get(c.max_base(0))
}

pub struct Window {
    pub start: ColId,
    pub width: usize,
    /// First column after the window (start of the stable region).
    pub stab_bgn: ColId,
}

/// Find the next candidate refinement window at `start`, or None when the
/// column does not open one under the given heuristic.
pub fn identify_window(cns: &CnsSession, start: ColId, level: RefineLevel) -> Option<Window> {
    let mut start = start;
    let mut stab_bgn = cns.columns[start.idx()].next;
    if !stab_bgn.is_valid() {
        return None;
    }
    let mut stab = stab_bgn;
    let mut win_length = 1usize;

    match level {
        RefineLevel::Smooth => {
            if call_base_of(cns, start) != GAP {
                return None;
            }
            while call_base_of(cns, stab) == GAP {
                if cns.columns[stab.idx()].next.is_valid() {
                    stab_bgn = cns.columns[stab.idx()].next;
                    stab = stab_bgn;
                    win_length += 1;
                } else {
                    break;
                }
            }
            if win_length > 1 {
                Some(Window { start, width: win_length, stab_bgn })
            } else {
                None
            }
        }

        RefineLevel::PolyX => {
            let mut gap_count = cns.columns[start.idx()].counts.get(GAP);
            let poly = call_base_of(cns, start);
            if poly == GAP {
                return None;
            }
            loop {
                let cb = call_base_of(cns, stab);
                if cb != poly && cb != GAP {
                    break;
                }
                if cns.columns[stab.idx()].next.is_valid() {
                    stab_bgn = cns.columns[stab.idx()].next;
                    gap_count += cns.columns[stab.idx()].counts.get(GAP);
                    stab = stab_bgn;
                    win_length += 1;
                } else {
                    break;
                }
            }
            if win_length <= 2 {
                return None;
            }
            // absorb trailing gap-called columns dominated by the run symbol
            while call_base_of(cns, stab) == GAP {
                if cns.columns[stab.idx()].counts.max_base(1) != poly {
                    break;
                }
                if cns.columns[stab.idx()].next.is_valid() {
                    stab_bgn = cns.columns[stab.idx()].next;
                    gap_count += cns.columns[stab.idx()].counts.get(GAP);
                    stab = stab_bgn;
                    win_length += 1;
                } else {
                    break;
                }
            }
            // and leading ones
            while cns.columns[start.idx()].prev.is_valid() {
                let pre = cns.columns[start.idx()].prev;
                let cb = call_base_of(cns, pre);
                if cb != GAP && cb != poly {
                    break;
                }
                start = pre;
                gap_count += cns.columns[pre.idx()].counts.get(GAP);
                win_length += 1;
            }
            if cns.columns[start.idx()].prev.is_valid() && win_length > 2 && gap_count > 0 {
                Some(Window { start, width: win_length, stab_bgn })
            } else {
                None
            }
        }

        RefineLevel::Indel => {
            let cum_mm = column_mismatch(cns, start);
            if cum_mm <= 0 || cns.columns[start.idx()].counts.get(GAP) <= 0 {
                return None;
            }
            let mut stab = cns.columns[start.idx()].next;
            let mut stab_end = stab;
            let mut stab_mm = 0i32;
            let mut stab_gaps = 0i32;
            let mut stab_bases = 0i32;
            let mut stab_width = 0usize;

            while cns.columns[stab_end.idx()].next.is_valid() && stab_width < STABWIDTH {
                stab_mm += column_mismatch(cns, stab_end);
                stab_gaps += cns.columns[stab_end.idx()].counts.get(GAP);
                stab_bases += cns.columns[stab_end.idx()].counts.depth;
                stab_end = cns.columns[stab_end.idx()].next;
                stab_width += 1;
            }
            if stab_bases == 0 {
                return None;
            }
            while f64::from(stab_mm) / f64::from(stab_bases) > STAB_MISMATCH_RATE
                || f64::from(stab_gaps) / f64::from(stab_bases) > STAB_GAP_RATE
            {
                let mm = column_mismatch(cns, stab);
                let gp = cns.columns[stab.idx()].counts.get(GAP);
                let bps = cns.columns[stab.idx()].counts.depth;
                if cns.columns[stab_end.idx()].next.is_valid() {
                    stab_mm += column_mismatch(cns, stab_end);
                    stab_bases += cns.columns[stab_end.idx()].counts.depth;
                    stab_gaps += cns.columns[stab_end.idx()].counts.get(GAP);
                    stab_end = cns.columns[stab_end.idx()].next;
                    stab_mm -= mm;
                    stab_gaps -= gp;
                    stab_bases -= bps;
                    stab = cns.columns[stab.idx()].next;
                    win_length += 1;
                } else {
                    break;
                }
            }
            stab_bgn = stab;
            if win_length > 1 {
                Some(Window { start, width: win_length, stab_bgn })
            } else {
                None
            }
        }
    }
}

// ---- one window ------------------------------------------------------------

/// Refine one identified window: build the abacus, cluster its rows into
/// alleles, score the candidate shifts, and commit the winner. Returns the
/// score reduction achieved.
pub fn refine_window(
    cns: &mut CnsSession,
    start_column: ColId,
    stab_bgn: ColId,
    opt: &CnsOptions,
) -> i32 {
    let mut orig = create_abacus(cns, start_column, stab_bgn);

    let mut vreg = var_region_from_rows(orig.rows_vec(), QV_FOR_MULTI_GAP);
    sort_alleles_by_length(&mut vreg);

    refine_orig_abacus(&mut orig, &vreg);
    let (orig_mm, orig_cols) = score_abacus(&mut orig);

    let mut left = orig.clone();
    let (left_mm, left_cols) = left_shift(&mut left, &vreg);
    let mut right = orig.clone();
    let (right_mm, right_cols) = right_shift(&mut right, &vreg);

    let orig_gap = affine_score_abacus(&orig);
    let left_gap = affine_score_abacus(&left);
    let right_gap = affine_score_abacus(&right);

    let orig_total = orig_mm + orig_cols + orig_gap;
    let left_total = left_mm + left_cols + left_gap;
    let right_total = right_mm + right_cols + right_gap;

    let mut best = &orig;
    let mut best_mm = orig_mm;
    let mut best_cols = orig_cols;
    let mut best_gap = orig_gap;
    let mut score_reduction = 0;

    if left_total < orig_total || right_total < orig_total {
        if left_total <= right_total {
            score_reduction += orig_total - left_total;
            best = &left;
            best_mm = left_mm;
            best_cols = left_cols;
            best_gap = left_gap;
        } else {
            score_reduction += orig_total - right_total;
            best = &right;
            best_mm = right_mm;
            best_cols = right_cols;
            best_gap = right_gap;
        }
    }

    debug!(
        "refine_window: rows={} width={} mm orig/left/right = {}/{}/{} cols = {}/{}/{} gaps = {}/{}/{}",
        orig.rows, orig.window_width,
        orig_mm, left_mm, right_mm,
        orig_cols, left_cols, right_cols,
        orig_gap, left_gap, right_gap
    );

    // Mixed shift: keep the long allele fixed, slide only the short one,
    // within the interval where the two allele consensi agree.
    let cons = consensus_for_abacus(best, &vreg);
    let gapcount = count_gaps(&cons);
    let short = if gapcount[0] >= gapcount[1] { 0 } else { 1 };
    let long = 1 - short;

    let mut mixed: Option<Abacus> = None;
    if gapcount[short] > 0 {
        let (ug, imap) = map_consensus(&cons);
        if ug[0].len() >= MSTRING_SIZE && ug[1].len() >= MSTRING_SIZE {
            let adjleft = find_adjusted_left_bounds(&ug, short, long);
            let adjright = find_adjusted_right_bounds(&ug, short, long);
            let (lscore, mut lpos) = left_score(&ug, &imap, &adjleft, short, long);
            let (rscore, mut rpos) = right_score(&ug, &imap, &adjright, short, long);
            adjust_shifting_interfaces(
                &mut lpos, &mut rpos, lscore, rscore, &adjleft, &adjright, long,
            );
            let tmpl = template_for_abacus(
                &cons, &ug, &imap, lpos, rpos, &adjleft, &adjright, short, long,
            );

            let mut m = orig.clone();
            let (mixed_mm, mixed_cols) = mixed_shift(&mut m, &vreg, lpos, rpos, &tmpl, short as i32);
            let mixed_gap = affine_score_abacus(&m);

            let better = mixed_gap < best_gap
                || (mixed_gap == best_gap && mixed_cols < best_cols)
                || (mixed_gap == best_gap && mixed_cols == best_cols && mixed_mm < best_mm);
            if better {
                mixed = Some(m);
            }
        }
    }

    match mixed {
        Some(m) => apply_abacus(cns, &m, opt),
        None => apply_abacus(cns, best, opt),
    }

    score_reduction
}

// ---- top-level sweep -------------------------------------------------------

/// Sweep [from, to] (MANode column-list indices; `to` < 0 means the last
/// column) for candidate windows under the given heuristic, refine each
/// qualifying window, and finish with a major-allele refresh. Returns the
/// cumulative score reduction (informational).
pub fn abacus_refine(
    cns: &mut CnsSession,
    mid: usize,
    from: usize,
    to: i64,
    level: RefineLevel,
    opt: &CnsOptions,
) -> i32 {
    let ma_length = cns.manodes[mid].columns.len();
    if ma_length < 2 {
        return 0;
    }
    let to = if to < 0 { ma_length - 1 } else { to as usize };
    assert!(from < ma_length, "abacus_refine range start out of bounds");
    assert!(to > from && to < ma_length, "abacus_refine range end out of bounds");

    let eid = cns.manodes[mid].columns[to];
    let mut start_column = cns.manodes[mid].columns[from];
    let mut score_reduction = 0;

    while start_column != eid {
        match identify_window(cns, start_column, level) {
            Some(w) => {
                if !cns.columns[w.start.idx()].prev.is_valid() {
                    // the window abuts the chain head; append a gap column
                    // right after the first column for maneuvering room
                    let firstbead =
                        cns.beads[cns.columns[w.start.idx()].call.idx()].down;
                    let newbead = cns.append_gap_bead(firstbead);
                    let fcol = cns.beads[firstbead.idx()].column;
                    debug!("abacus_refine: adding maneuvering gap column at the chain head");
                    cns.column_append(fcol, newbead);
                }

                if w.width < opt.max_abacus_window {
                    score_reduction += refine_window(cns, w.start, w.stab_bgn, opt);
                } else {
                    // too wide to shift safely; likely a polymorphism
                    warn!(
                        "abacus_refine: skipping window of width {} (cutoff {})",
                        w.width, opt.max_abacus_window
                    );
                }
                start_column = w.stab_bgn;
            }
            None => {
                let next = cns.columns[start_column.idx()].next;
                if !next.is_valid() {
                    break;
                }
                start_column = next;
            }
        }
    }

    refresh_manode(cns, mid, opt, RefreshMode::SmoothAlleles, true);
    score_reduction
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refresh::var_region_from_rows;

    #[test]
    fn left_shift_compacts_disagreeing_gap_placement() {
        let mut a = Abacus::from_rows(&[b"AC-GT", b"ACG-T", b"AC-GT"]);
        let mut vreg = var_region_from_rows(a.rows_vec(), QV_FOR_MULTI_GAP);
        crate::refresh::sort_alleles_by_length(&mut vreg);

        let before_multisets: Vec<Vec<u8>> =
            (0..a.rows).map(|i| a.non_gap_multiset(i)).collect();
        let (_, orig_cols) = score_abacus(&mut a.clone());

        let mut shifted = a.clone();
        let (mm, cols) = left_shift(&mut shifted, &vreg);

        assert!(cols < orig_cols, "left shift must reduce non-null columns");
        assert_eq!(mm, 0, "agreeing bases must not score as mismatches");
        for i in 0..shifted.rows {
            assert_eq!(
                shifted.non_gap_multiset(i),
                before_multisets[i],
                "row {i} content changed"
            );
        }
    }

    #[test]
    fn merge_abacus_terminates_and_clears_gap_separators() {
        let mut a = Abacus::from_rows(&[b"A--C", b"A--C", b"A--C"]);
        let mut total = 0;
        loop {
            let merged = merge_abacus(&mut a, -1);
            if merged == 0 {
                break;
            }
            total += merged;
            assert!(total <= a.columns as i32, "merge failed to terminate");
        }

        // no fully-gap column may remain between two non-null columns
        for i in 0..a.rows {
            let row: Vec<u8> = (0..a.columns).map(|j| a.get(i, j)).collect();
            let first = row.iter().position(|&b| b != GAP && b != b'n');
            let last = row.iter().rposition(|&b| b != GAP && b != b'n');
            if let (Some(f), Some(l)) = (first, last) {
                for j in f..=l {
                    let all_gap = (0..a.rows).all(|r| a.get(r, j) == GAP);
                    assert!(!all_gap, "internal all-gap column {j} survived merging");
                }
            }
        }
    }

    #[test]
    fn score_abacus_counts_disagreements() {
        let mut a = Abacus::from_rows(&[b"ACGT", b"ACGT", b"ACTT"]);
        let (mm, cols) = score_abacus(&mut a);
        assert_eq!(cols, 4);
        assert_eq!(mm, 1);
    }

    #[test]
    fn affine_score_counts_gap_opens_not_lengths() {
        let a = Abacus::from_rows(&[b"A--CG", b"A-C-G"]);
        // row 0: one run of two gaps; row 1: two runs of one
        assert_eq!(affine_score_abacus(&a), 3);
    }

    #[test]
    fn shifts_never_make_things_worse_when_committed() {
        let mut a = Abacus::from_rows(&[b"AC-GT", b"ACG-T", b"AC-GT", b"AC-GT"]);
        let mut vreg = var_region_from_rows(a.rows_vec(), QV_FOR_MULTI_GAP);
        crate::refresh::sort_alleles_by_length(&mut vreg);

        let (orig_mm, orig_cols) = score_abacus(&mut a);
        let orig_gap = affine_score_abacus(&a);

        let mut left = a.clone();
        let (lmm, lcols) = left_shift(&mut left, &vreg);
        let lgap = affine_score_abacus(&left);

        let mut right = a.clone();
        let (rmm, rcols) = right_shift(&mut right, &vreg);
        let rgap = affine_score_abacus(&right);

        let orig_total = orig_mm + orig_cols + orig_gap;
        let best = (lmm + lcols + lgap).min(rmm + rcols + rgap).min(orig_total);
        assert!(best <= orig_total);
    }
}
