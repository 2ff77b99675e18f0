// Full left-to-right refresh of a MANode: recompute every column's ordinal
// and consensus call, smooth the per-column variation scores, group maximal
// runs of variation into regions, cluster each region's reads into alleles,
// and either re-call the consensus from the major allele or emit structured
// variant records (with cross-region phasing).

use log::{debug, warn};

use crate::basecall::{base_call, AlleleSplit, BaseCallResult, CallPolicy, ColumnSnapshot};
use crate::cns_opt::CnsOptions;
use crate::defaults::QV_FOR_MULTI_GAP;
use crate::store::{CnsSession, ColId, FragKind, GAP};

const ZERO_PLUS: f64 = 1e-6;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum RefreshMode {
    /// Reindex and re-call every column; no region processing.
    CallOnly,
    /// Additionally overwrite each variant region's consensus with the
    /// major allele's bases (quick smoothing pass).
    SmoothAlleles,
    /// Additionally emit structured variant records with phasing.
    VarRecords,
}

/// One reported allele of a variant region.
#[derive(Clone, Debug)]
pub struct VarAllele {
    /// Gapped consensus of the allele across the region.
    pub bases: Vec<u8>,
    pub weight: i32,
    pub num_reads: usize,
    pub read_iids: Vec<u32>,
}

/// Externally visible record of one detected variant region.
#[derive(Clone, Debug)]
pub struct VarRecord {
    /// Column range in refreshed ma_index coordinates, half open.
    pub begin: usize,
    pub end: usize,
    pub num_reads: usize,
    pub num_conf_alleles: usize,
    pub min_anchor_size: i32,
    /// True when this record's alleles correspond 1:1 with the previous
    /// record's (same phase group).
    pub phased_with_prev: bool,
    /// Reported alleles, strongest first (always at least two).
    pub alleles: Vec<VarAllele>,
    /// Read iids of all confirmed alleles, grouped by allele.
    pub conf_read_iids: Vec<u32>,
}

// ---- per-region read bundle -----------------------------------------------

#[derive(Clone, Debug)]
pub(crate) struct VarRead {
    pub(crate) iid: u32,
    pub(crate) bases: Vec<u8>,
    pub(crate) qvs: Vec<i32>,
    pub(crate) ave_qv: f64,
    pub(crate) uglen: i32,
    pub(crate) allele_id: i32,
}

#[derive(Clone, Debug)]
pub(crate) struct Allele {
    pub(crate) id: i32,
    pub(crate) read_ids: Vec<usize>,
    pub(crate) read_iids: Vec<u32>,
    pub(crate) weight: i32,
    pub(crate) uglen: i32,
}

pub(crate) struct VarRegion {
    pub(crate) beg: usize,
    pub(crate) end: usize,
    pub(crate) iids: Vec<u32>,
    pub(crate) reads: Vec<VarRead>,
    pub(crate) alleles: Vec<Allele>,
    /// total detected alleles
    pub(crate) na: usize,
    /// confirmed alleles (>=2 reads each)
    pub(crate) nca: usize,
    pub(crate) dist: Vec<Vec<i32>>,
}

// ---- read clustering -------------------------------------------------------

/// Hamming-like distance between two gapped reads: the smaller of the
/// gapped and ungapped distances, so that a pure gap-placement difference
/// does not separate reads into different alleles.
fn read_distance(a: &[u8], b: &[u8]) -> i32 {
    let mut gapped = 0;
    let mut ua: Vec<u8> = Vec::with_capacity(a.len());
    let mut ub: Vec<u8> = Vec::with_capacity(b.len());
    for k in 0..a.len() {
        if a[k] != b[k] {
            gapped += 1;
        }
        if a[k] != GAP {
            ua.push(a[k]);
        }
        if b[k] != GAP {
            ub.push(b[k]);
        }
    }
    let mut ungapped = 0;
    for k in 0..ua.len().max(ub.len()) {
        match (ua.get(k), ub.get(k)) {
            (Some(x), Some(y)) if x != y => ungapped += 1,
            (Some(_), None) | (None, Some(_)) => ungapped += 1,
            _ => {}
        }
    }
    gapped.min(ungapped)
}

fn populate_dist_matrix(reads: &[VarRead]) -> Vec<Vec<i32>> {
    let nr = reads.len();
    let mut m = vec![vec![0i32; nr]; nr];
    for i in 0..nr {
        for j in i..nr {
            let d = read_distance(&reads[i].bases, &reads[j].bases);
            m[i][j] = d;
            m[j][i] = d;
        }
    }
    m
}

/// Greedy zero-distance clustering: identical read pairs found first seed
/// alleles (these are the confirmable ones), every remaining read then
/// becomes its own singleton allele. Returns (alleles, confirmed_count).
fn cluster_reads(reads: &mut [VarRead], dist: &[Vec<i32>]) -> (Vec<Allele>, usize) {
    let nr = reads.len();
    let mut alleles: Vec<Allele> = Vec::new();

    for row in 0..nr {
        for col in row + 1..nr {
            if dist[row][col] != 0 {
                continue;
            }
            match (reads[row].allele_id, reads[col].allele_id) {
                (r, c) if r < 0 && c < 0 => {
                    let id = alleles.len() as i32;
                    reads[row].allele_id = id;
                    reads[col].allele_id = id;
                    alleles.push(Allele {
                        id,
                        read_ids: vec![row, col],
                        read_iids: vec![reads[row].iid, reads[col].iid],
                        weight: reads[row].ave_qv.round() as i32 + reads[col].ave_qv.round() as i32,
                        uglen: reads[row].uglen,
                    });
                }
                (r, c) if r < 0 && c >= 0 => {
                    let aid = c as usize;
                    reads[row].allele_id = c;
                    alleles[aid].weight += reads[row].ave_qv.round() as i32;
                    alleles[aid].read_ids.push(row);
                    alleles[aid].read_iids.push(reads[row].iid);
                }
                (r, c) if r >= 0 && c < 0 => {
                    let aid = r as usize;
                    reads[col].allele_id = r;
                    alleles[aid].weight += reads[col].ave_qv.round() as i32;
                    alleles[aid].read_ids.push(col);
                    alleles[aid].read_iids.push(reads[col].iid);
                }
                _ => {}
            }
        }
    }

    let nca = alleles.len();

    for row in 0..nr {
        if reads[row].allele_id < 0 {
            let id = alleles.len() as i32;
            reads[row].allele_id = id;
            alleles.push(Allele {
                id,
                read_ids: vec![row],
                read_iids: vec![reads[row].iid],
                weight: reads[row].ave_qv.round() as i32,
                uglen: reads[row].uglen,
            });
        }
    }

    (alleles, nca)
}

fn reassign_read_alleles(alleles: &[Allele], reads: &mut [VarRead]) {
    for (pos, al) in alleles.iter().enumerate() {
        for &rid in &al.read_ids {
            reads[rid].allele_id = pos as i32;
        }
    }
}

/// Reverse sort by weight; reads' allele ids follow.
fn sort_alleles_by_weight(alleles: &mut [Allele], reads: &mut [VarRead]) {
    alleles.sort_by(|a, b| b.weight.cmp(&a.weight));
    reassign_read_alleles(alleles, reads);
}

/// Reverse sort confirmed alleles by ungapped length; reads follow.
pub(crate) fn sort_alleles_by_length(vreg: &mut VarRegion) {
    let nca = vreg.nca;
    vreg.alleles[..nca].sort_by(|a, b| b.uglen.cmp(&a.uglen));
    reassign_read_alleles(&vreg.alleles, &mut vreg.reads);
}

/// Reorder confirmed alleles so that allele with original index `j` lands at
/// position `allele_map[j]`; reads' allele ids follow.
fn sort_alleles_by_mapping(alleles: &mut Vec<Allele>, nca: usize, reads: &mut [VarRead], map: &[i32]) {
    let mut reordered: Vec<Allele> = Vec::with_capacity(alleles.len());
    for pos in 0..nca {
        let j = map.iter().position(|&m| m == pos as i32).expect("phase map is a permutation");
        let k = alleles.iter().position(|a| a.id == j as i32).expect("allele id vanished");
        reordered.push(alleles[k].clone());
    }
    for a in alleles.iter() {
        if reordered.iter().all(|r| r.id != a.id) {
            reordered.push(a.clone());
        }
    }
    *alleles = reordered;
    for (pos, al) in alleles.iter_mut().enumerate() {
        al.id = pos as i32;
    }
    reassign_read_alleles(alleles, reads);
}

// ---- phasing ---------------------------------------------------------------

/// Confirmed-allele state of the previous variant region, for phasing.
#[derive(Default)]
struct PrevAlleles {
    nca: usize,
    /// reads per confirmed allele, in allele order
    counts: Vec<usize>,
    /// confirmed read iids, concatenated in allele order
    iids: Vec<u32>,
}

/// Try to map current confirmed alleles 1:1 onto the previous region's.
/// Returns allele_map[current] = previous on success.
fn phase_with_prev(alleles: &[Allele], nca: usize, prev: &PrevAlleles) -> Option<Vec<i32>> {
    if prev.nca != nca || nca < 2 {
        return None;
    }

    // shared-read counts: m[current][previous]
    let mut m = vec![vec![0i32; nca]; nca];
    for (i, al) in alleles.iter().take(nca).enumerate() {
        for &iid in &al.read_iids {
            let mut pos = 0usize;
            for (l, &cnt) in prev.counts.iter().enumerate() {
                for _ in 0..cnt {
                    if prev.iids[pos] == iid {
                        m[i][l] += 1;
                    }
                    pos += 1;
                }
            }
        }
    }

    // rows dominant: every current allele has a majority prev partner, all
    // partners distinct
    let mut map = vec![-1i32; nca];
    let mut taken = vec![false; nca];
    let mut ok = true;
    for i in 0..nca {
        let sum: i32 = m[i].iter().sum();
        let (j_best, &max) = m[i]
            .iter()
            .enumerate()
            .max_by_key(|&(_, &v)| v)
            .expect("nca >= 2");
        if 2 * max > sum && !taken[j_best] {
            map[i] = j_best as i32;
            taken[j_best] = true;
        } else {
            ok = false;
            break;
        }
    }
    if ok {
        return Some(map);
    }

    // columns dominant
    let mut map = vec![-1i32; nca];
    let mut assigned = vec![false; nca];
    let mut ok = true;
    for j in 0..nca {
        let sum: i32 = (0..nca).map(|i| m[i][j]).sum();
        let (i_best, max) = (0..nca)
            .map(|i| (i, m[i][j]))
            .max_by_key(|&(_, v)| v)
            .expect("nca >= 2");
        if 2 * max > sum && !assigned[i_best] {
            map[i_best] = j as i32;
            assigned[i_best] = true;
        } else {
            ok = false;
            break;
        }
    }
    if ok && map.iter().all(|&v| v >= 0) {
        return Some(map);
    }

    // diploid fallback: a strict global maximum decides the pairing
    if nca == 2 {
        let mut max = -1;
        let mut max2 = -1;
        let mut best = (0usize, 0usize);
        for i in 0..2 {
            for j in 0..2 {
                if m[i][j] > max {
                    max2 = max;
                    max = m[i][j];
                    best = (i, j);
                } else if m[i][j] > max2 {
                    max2 = m[i][j];
                }
            }
        }
        if max > max2 {
            let (i_best, j_best) = best;
            let mut map = vec![-1i32; 2];
            map[i_best] = j_best as i32;
            map[1 - i_best] = (1 - j_best) as i32;
            return Some(map);
        }
    }

    None
}

// ---- variation smoothing ---------------------------------------------------

/// Symmetric moving-window smoothing of the variation scores. Positions
/// where the consensus is a gap (negative score) do not widen the window;
/// their magnitude still contributes so a closable gap attracts the region.
fn smoothen_variation(var: &[f64], window: i32) -> Vec<f64> {
    let len = var.len();
    if window <= 0 {
        return var.to_vec();
    }
    let max_left = window / 2;
    let max_right = window - max_left;
    let mut out = vec![0f64; len];

    for i in 0..len {
        let mut left = 0;
        let mut right = 0;
        let mut sum = if var[i] > -ZERO_PLUS {
            var[i]
        } else if var[i] < -1.0 {
            0.0
        } else {
            -var[i]
        };

        let mut j = i as i64 - 1;
        while j >= 0 && left <= max_left {
            let v = var[j as usize];
            if v > -ZERO_PLUS {
                left += 1;
                sum += v;
            } else if v > -1.0 + ZERO_PLUS {
                sum -= v;
            }
            j -= 1;
        }
        let mut j = i + 1;
        while j < len && right <= max_right {
            let v = var[j];
            if v > -ZERO_PLUS {
                right += 1;
                sum += v;
            } else if v > -1.0 + ZERO_PLUS {
                sum -= v;
            }
            j += 1;
        }
        out[i] = if left + right > 0 {
            sum / f64::from(left + right)
        } else {
            var[i]
        };
    }
    out
}

// ---- region extraction -----------------------------------------------------

fn collect_region_iids(cns: &CnsSession, cids: &[ColId], beg: usize, end: usize) -> Vec<u32> {
    let mut iids: Vec<u32> = Vec::new();
    for &cid in &cids[beg..end] {
        for bid in cns.column_bead_ids(cid) {
            let b = cns.base(bid);
            if b == b'N' || b == b'n' {
                continue;
            }
            let frag = &cns.frags[cns.beads[bid.idx()].frag.idx()];
            if frag.kind == FragKind::Read && !iids.contains(&frag.iid) {
                iids.push(frag.iid);
            }
        }
    }
    iids
}

/// Pull the aligned bases/qualities of every spanning read across the
/// region's columns. Boundary gaps inherit the quality of their non-gap
/// neighbors; runs of gaps get min(first, last) flanking quality, falling
/// back to QV_FOR_MULTI_GAP inside multi-gap stretches.
fn collect_region_reads(
    cns: &CnsSession,
    cids: &[ColId],
    beg: usize,
    end: usize,
    iids: &[u32],
) -> Vec<VarRead> {
    let len = end - beg;
    let mut reads: Vec<VarRead> = iids
        .iter()
        .map(|&iid| VarRead {
            iid,
            bases: vec![GAP; len],
            qvs: vec![0; len],
            ave_qv: 0.0,
            uglen: 0,
            allele_id: -1,
        })
        .collect();

    for (k, &cid) in cids[beg..end].iter().enumerate() {
        for bid in cns.column_bead_ids(cid) {
            let frag = &cns.frags[cns.beads[bid.idx()].frag.idx()];
            if frag.kind != FragKind::Read {
                continue;
            }
            let Some(ri) = iids.iter().position(|&i| i == frag.iid) else {
                continue;
            };
            let base = cns.base(bid);
            let qv = if base != GAP {
                cns.qv(bid)
            } else {
                let mut qv = 0;
                let prev = cns.beads[bid.idx()].prev;
                if prev.is_valid() && cns.base(prev) != GAP {
                    qv = cns.qv(prev);
                }
                let next = cns.beads[bid.idx()].next;
                if next.is_valid() && cns.base(next) != GAP {
                    let nqv = cns.qv(next);
                    if qv == 0 || qv > nqv {
                        qv = nqv;
                    }
                }
                qv
            };
            reads[ri].bases[k] = base;
            reads[ri].qvs[k] = qv;
        }
    }

    // normalize internal gap qualities and compute averages
    for r in reads.iter_mut() {
        let m = len;
        let mut i = 0;
        r.uglen = 0;
        r.ave_qv = 0.0;
        while i < m {
            if r.bases[i] != GAP {
                r.ave_qv += f64::from(r.qvs[i]);
                r.uglen += 1;
                i += 1;
                continue;
            }
            let first_gap = i;
            let mut first_qv = r.qvs[first_gap];
            if first_qv == 0 && i > 0 {
                first_qv = r.qvs[i - 1];
            }
            let mut last_gap = i;
            while last_gap < m && r.bases[last_gap] == GAP {
                last_gap += 1;
            }
            if last_gap == m || r.bases[last_gap] != GAP {
                last_gap -= 1;
            }
            let mut last_qv = r.qvs[last_gap];
            if last_qv == 0 && last_gap < m - 1 {
                last_qv = r.qvs[last_gap + 1];
            }
            let min_qv = match (first_qv, last_qv) {
                (0, 0) => QV_FOR_MULTI_GAP,
                (0, l) => l,
                (f, 0) => f,
                (f, l) => f.min(l),
            };
            for j in first_gap..=last_gap {
                r.qvs[j] = min_qv;
                r.ave_qv += f64::from(min_qv);
            }
            i = last_gap + 1;
        }
        r.ave_qv /= m as f64;
    }

    reads
}

/// Build a VarRegion directly from a dense row grid (the abacus view):
/// one pseudo-read per row, a flat default quality, gap-aware distances,
/// and the same clustering as the column-based path.
pub(crate) fn var_region_from_rows(rows: Vec<Vec<u8>>, default_qv: i32) -> VarRegion {
    let len = rows.first().map_or(0, Vec::len);
    let mut reads: Vec<VarRead> = rows
        .into_iter()
        .enumerate()
        .map(|(i, bases)| {
            let uglen = bases.iter().filter(|&&b| b != GAP).count() as i32;
            VarRead {
                iid: i as u32,
                qvs: vec![default_qv; bases.len()],
                ave_qv: 20.0,
                uglen,
                allele_id: -1,
                bases,
            }
        })
        .collect();
    let dist = populate_dist_matrix(&reads);
    let (alleles, nca) = cluster_reads(&mut reads, &dist);
    let na = alleles.len();
    let iids = reads.iter().map(|r| r.iid).collect();
    VarRegion { beg: 0, end: len, iids, reads, alleles, na, nca, dist }
}

pub(crate) fn build_var_region(
    cns: &CnsSession,
    cids: &[ColId],
    beg: usize,
    end: usize,
) -> Option<VarRegion> {
    let iids = collect_region_iids(cns, cids, beg, end);
    if iids.is_empty() {
        return None;
    }
    let mut reads = collect_region_reads(cns, cids, beg, end, &iids);
    let dist = populate_dist_matrix(&reads);
    let (alleles, nca) = cluster_reads(&mut reads, &dist);
    let na = alleles.len();
    Some(VarRegion { beg, end, iids, reads, alleles, na, nca, dist })
}

// ---- consensus rewrite / record emission -----------------------------------

fn set_consensus_to_major_allele(cns: &mut CnsSession, cids: &[ColId], vreg: &VarRegion) {
    let read_id = vreg.alleles[0].read_ids[0];
    for m in 0..(vreg.end - vreg.beg) {
        let cid = cids[vreg.beg + m];
        let call = cns.columns[cid.idx()].call;
        cns.set_base(call, vreg.reads[read_id].bases[m]);
    }
}

/// The read at maximal distance from the given read, used to fabricate a
/// second reported allele when only one is confirmed.
fn most_distant_read(vreg: &VarRegion, from: usize) -> usize {
    let mut best = from;
    let mut max = -1;
    for i in 0..vreg.reads.len() {
        if i != from && vreg.dist[from][i] > max {
            max = vreg.dist[from][i];
            best = i;
        }
    }
    best
}

fn populate_var_record(
    cns: &mut CnsSession,
    cids: &[ColId],
    vreg: &VarRegion,
    opt: &CnsOptions,
    phased: bool,
) -> VarRecord {
    let len = vreg.end - vreg.beg;
    let num_reported = vreg.nca.max(2);

    let distant_read = if vreg.nca < 2 {
        most_distant_read(vreg, vreg.alleles[0].read_ids[0])
    } else {
        0
    };

    let mut allele_bases: Vec<Vec<u8>> = vec![Vec::with_capacity(len); num_reported];
    let allele_ids: Vec<i32> = vreg.reads.iter().map(|r| r.allele_id).collect();
    let split = AlleleSplit { iids: &vreg.iids, allele_ids: &allele_ids, target: None };

    for m in 0..len {
        for al in (0..num_reported).rev() {
            let base = if al == 0 || al < vreg.nca {
                let read_id = vreg.alleles[al].read_ids[0];
                vreg.reads[read_id].bases[m]
            } else {
                vreg.reads[distant_read].bases[m]
            };
            if al == 0 {
                // quality from the full-coverage call, base from the allele
                let cid = cids[vreg.beg + m];
                base_call(cns, cid, CallPolicy::Weighted, Some(&split), opt, None);
                let call = cns.columns[cid.idx()].call;
                cns.set_base(call, base);
            }
            allele_bases[al].push(base);
        }
    }

    let mut conf_read_iids = Vec::new();
    for al in vreg.alleles.iter().take(vreg.nca) {
        conf_read_iids.extend_from_slice(&al.read_iids);
    }

    let alleles = (0..num_reported)
        .map(|al| {
            let (weight, num_reads, read_iids) = if al < vreg.na {
                (
                    vreg.alleles[al].weight,
                    vreg.alleles[al].read_ids.len(),
                    vreg.alleles[al].read_iids.clone(),
                )
            } else {
                (0, 0, Vec::new())
            };
            VarAllele { bases: allele_bases[al].clone(), weight, num_reads, read_iids }
        })
        .collect();

    VarRecord {
        begin: vreg.beg,
        end: vreg.end,
        num_reads: vreg.reads.len(),
        num_conf_alleles: vreg.nca,
        min_anchor_size: opt.smooth_win,
        phased_with_prev: phased,
        alleles,
        conf_read_iids,
    }
}

// ---- the refresh pass ------------------------------------------------------

/// Walk the whole column chain of `mid`: rebuild ma_index and the column id
/// list, re-call every column (weighted or majority policy), then detect and
/// process variant regions according to `mode`. Returns the emitted variant
/// records (empty unless mode is VarRecords).
pub fn refresh_manode(
    cns: &mut CnsSession,
    mid: usize,
    opt: &CnsOptions,
    mode: RefreshMode,
    weighted: bool,
) -> Vec<VarRecord> {
    let policy = if weighted { CallPolicy::Weighted } else { CallPolicy::Majority };

    cns.manodes[mid].columns.clear();
    let mut cid = cns.manodes[mid].first;
    if !cid.is_valid() {
        return Vec::new();
    }

    let mut varf: Vec<f64> = Vec::new();
    let mut cids: Vec<ColId> = Vec::new();
    let mut snapshot = ColumnSnapshot::default();
    let mut prev_snapshot = ColumnSnapshot::default();
    let mut gap_runs: u64 = 0;
    let mut consensus_gaps: u64 = 0;
    let mut index: i32 = 0;

    while cid.is_valid() {
        let r: BaseCallResult = base_call(cns, cid, policy, None, opt, Some(&mut snapshot));
        varf.push(r.var);
        cids.push(cid);

        cns.columns[cid.idx()].ma_index = index;
        cns.manodes[mid].columns.push(cid);

        // column chain sanity: refreshed order must match the links
        if index > 0 {
            let prev = cids[index as usize - 1];
            assert_eq!(cns.columns[cid.idx()].prev, prev, "column chain broken at {cid:?}");
            assert_eq!(cns.columns[prev.idx()].next, cid, "column chain broken at {prev:?}");
        }

        if r.base == GAP {
            consensus_gaps += 1;
        }
        for (i, &pb) in prev_snapshot.bases.iter().enumerate() {
            if pb == GAP {
                continue;
            }
            for (j, &cb) in snapshot.bases.iter().enumerate() {
                if cb == GAP && prev_snapshot.iids[i] == snapshot.iids[j] {
                    gap_runs += 1;
                }
            }
        }
        std::mem::swap(&mut prev_snapshot, &mut snapshot);

        cid = cns.columns[cid.idx()].next;
        index += 1;
    }

    debug!(
        "refresh: manode {} columns={} consensus_gaps={} read_gap_runs={}",
        mid, index, consensus_gaps, gap_runs
    );

    if mode == RefreshMode::CallOnly || !opt.split_alleles || !weighted {
        return Vec::new();
    }

    let len = varf.len();
    let mut records: Vec<VarRecord> = Vec::new();
    let mut prev_alleles = PrevAlleles::default();

    // clamp the raw scores: gap-consensus markers become magnitudes
    let svarf = smoothen_variation(&varf, opt.smooth_win);
    for v in varf.iter_mut() {
        if *v < -ZERO_PLUS {
            *v = if *v < -1.0 { 0.0 } else { -*v };
        }
    }

    let mut i = 0usize;
    while i < len {
        if svarf[i] <= ZERO_PLUS {
            i += 1;
            continue;
        }

        // region bounds: unsmoothed scores delimit the core, the smoothed
        // run delimits how far the scan skips
        let mut beg = i;
        let mut svend = i;
        if opt.smooth_win > 0 {
            while beg < len - 1 && varf[beg].abs() <= ZERO_PLUS {
                beg += 1;
            }
            while svend < len - 1 && svarf[svend] > ZERO_PLUS {
                svend += 1;
            }
        } else if svend < len - 1 {
            svend += 1;
        }
        let mut end = beg;
        if opt.smooth_win > 0 {
            while end < len - 1 && varf[end] > ZERO_PLUS {
                end += 1;
            }
        } else if end < len - 1 {
            end += 1;
        }
        let next_i = if opt.smooth_win > 0 { svend.max(i + 1) } else { i + 1 };

        if end <= beg {
            i = next_i;
            continue;
        }

        let Some(mut vreg) = build_var_region(cns, &cids, beg, end) else {
            // sparse boundary data can legitimately leave a scored region
            // with no spanning reads; skip it
            warn!("refresh: no reads span variant region [{beg},{end}); skipping");
            i = next_i;
            continue;
        };

        let phase_map = if mode == RefreshMode::VarRecords {
            phase_with_prev(&vreg.alleles, vreg.nca, &prev_alleles)
        } else {
            None
        };
        let phased = phase_map.is_some();
        if let Some(map) = phase_map {
            let nca = vreg.nca;
            sort_alleles_by_mapping(&mut vreg.alleles, nca, &mut vreg.reads, &map);
        } else {
            sort_alleles_by_weight(&mut vreg.alleles, &mut vreg.reads);
        }

        prev_alleles = PrevAlleles {
            nca: vreg.nca,
            counts: vreg.alleles[..vreg.nca].iter().map(|a| a.read_ids.len()).collect(),
            iids: vreg.alleles[..vreg.nca]
                .iter()
                .flat_map(|a| a.read_iids.iter().copied())
                .collect(),
        };

        if mode == RefreshMode::VarRecords {
            records.push(populate_var_record(cns, &cids, &vreg, opt, phased));
        } else {
            set_consensus_to_major_allele(cns, &cids, &vreg);
        }

        i = next_i;
    }

    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply_alignment::{apply_alignment, Anchor};
    use crate::manode::{create_manode, get_manode_consensus, seed_manode_with_fragment};
    use crate::store::{CnsSession, FragId, FragKind};

    fn qv(n: usize, q: u8) -> Vec<u8> {
        vec![b'0' + q; n]
    }

    /// Stack identical-length reads into one MANode with trivial traces.
    fn stack_reads(reads: &[&[u8]]) -> (CnsSession, usize, Vec<FragId>) {
        let mut cns = CnsSession::new();
        let mut fids = Vec::new();
        for (i, r) in reads.iter().enumerate() {
            fids.push(cns.register_fragment(
                i as u32 + 1,
                FragKind::Read,
                false,
                r,
                &qv(r.len(), 30),
                Vec::new(),
            ));
        }
        let mid = create_manode(&mut cns, 1);
        seed_manode_with_fragment(&mut cns, mid, fids[0]);
        for &fid in &fids[1..] {
            apply_alignment(&mut cns, Anchor::Fragment(fids[0]), fid, 0, &[]);
        }
        (cns, mid, fids)
    }

    #[test]
    fn refresh_calls_unanimous_consensus() {
        let (mut cns, mid, _) = stack_reads(&[b"ACGTACGT", b"ACGTACGT", b"ACGTACGT"]);
        let opt = CnsOptions::default();
        refresh_manode(&mut cns, mid, &opt, RefreshMode::CallOnly, true);
        let (seq, _) = get_manode_consensus(&cns, mid);
        assert_eq!(seq, b"ACGTACGT");
    }

    #[test]
    fn two_haplotypes_cluster_into_two_confirmed_alleles() {
        // planted SNP column: two reads per haplotype, no noise
        let (mut cns, mid, _) = stack_reads(&[
            b"ACGTACGTACGT",
            b"ACGTACGTACGT",
            b"ACGTTCGTACGT",
            b"ACGTTCGTACGT",
        ]);
        let opt = CnsOptions::default();
        refresh_manode(&mut cns, mid, &opt, RefreshMode::CallOnly, true);
        let records = refresh_manode(&mut cns, mid, &opt, RefreshMode::VarRecords, true);

        assert_eq!(records.len(), 1);
        let rec = &records[0];
        assert_eq!(rec.num_conf_alleles, 2);
        assert_eq!(rec.num_reads, 4);
        // allele membership matches the planted haplotypes exactly
        let a0: Vec<u32> = rec.alleles[0].read_iids.clone();
        let a1: Vec<u32> = rec.alleles[1].read_iids.clone();
        assert_eq!(a0.len(), 2);
        assert_eq!(a1.len(), 2);
        let mut all: Vec<u32> = a0.iter().chain(a1.iter()).copied().collect();
        all.sort_unstable();
        assert_eq!(all, vec![1, 2, 3, 4]);
        assert!(
            (a0 == vec![1, 2] && a1 == vec![3, 4]) || (a0 == vec![3, 4] && a1 == vec![1, 2]),
            "haplotype split mixed reads: {a0:?} vs {a1:?}"
        );
    }

    #[test]
    fn phasing_links_consistent_regions() {
        // two SNP columns far enough apart for distinct regions, with the
        // same read partition at both
        let (mut cns, mid, _) = stack_reads(&[
            b"ACGTACGTACGTACGTACGTA",
            b"ACGTACGTACGTACGTACGTA",
            b"ACGTTCGTACGTACGTGCGTA",
            b"ACGTTCGTACGTACGTGCGTA",
        ]);
        let mut opt = CnsOptions::default();
        opt.smooth_win = 2;
        refresh_manode(&mut cns, mid, &opt, RefreshMode::CallOnly, true);
        let records = refresh_manode(&mut cns, mid, &opt, RefreshMode::VarRecords, true);

        assert_eq!(records.len(), 2, "expected two separate variant regions");
        assert!(!records[0].phased_with_prev);
        assert!(records[1].phased_with_prev, "second region should phase with the first");
    }

    #[test]
    fn smoothing_widens_regions() {
        let var = vec![0.0, 0.0, 1.0, 0.0, 0.0];
        let s = smoothen_variation(&var, 4);
        assert!(s[1] > 0.0 && s[3] > 0.0);
        assert!(s[0] > 0.0 || s[4] > 0.0);
    }

    #[test]
    fn read_distance_ignores_pure_gap_shifts() {
        assert_eq!(read_distance(b"AC-GT", b"ACG-T"), 0);
        assert_eq!(read_distance(b"ACCGT", b"ACGGT"), 1);
    }
}
