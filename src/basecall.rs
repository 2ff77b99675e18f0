// Consensus base calling for one column.
//
// Two interchangeable policies:
//   - Majority: plain occurrence counts, ties broken by summed quality,
//     then by fixed symbol order. Consensus quality is a low-confidence
//     sentinel (qv 0).
//   - Weighted: Bayesian mixture over {-, A, C, G, T} driven by per-quality
//     correct/error probability tables, with a strict group override order:
//     reads of the target allele beat other reads beat guide (tig)
//     sequences. Log-domain accumulation keeps deep columns from
//     underflowing.
//
// Either way a variation score is produced for the refresh pass: 1.0 when a
// second, quality-supported symbol is present, 0.0 otherwise, sign-flipped
// when the consensus itself is a gap so smoothing can tell "gap that may
// close" from "real mismatch".

use std::sync::OnceLock;

use crate::cns_opt::CnsOptions;
use crate::defaults::{
    CNS_MAX_QV, CNS_MIN_QV, MIN_AVE_QV_FOR_VARIATION, MIN_SUM_QVS_FOR_VARIATION, TAU_MISMATCH,
};
use crate::store::{base_index, CnsSession, ColId, FragKind, ALPHABET, GAP};

const EPS: f64 = 1e-6;

/// Per-quality error and correct-call probabilities, qv 0..=60.
fn prob_tables() -> &'static (Vec<f64>, Vec<f64>) {
    static TABLES: OnceLock<(Vec<f64>, Vec<f64>)> = OnceLock::new();
    TABLES.get_or_init(|| {
        let n = (CNS_MAX_QV - CNS_MIN_QV + 1) as usize;
        let mut eprob = Vec::with_capacity(n);
        let mut prob = Vec::with_capacity(n);
        for qv in CNS_MIN_QV..=CNS_MAX_QV {
            let e = 10f64.powf(-f64::from(qv) / 10.0);
            eprob.push(e);
            prob.push(1.0 - e);
        }
        (eprob, prob)
    })
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum CallPolicy {
    Majority,
    Weighted,
}

#[derive(Copy, Clone, Debug)]
pub struct BaseCallResult {
    pub base: u8,
    pub qual: u8,
    /// Column variation score; negative values flag gap-consensus columns
    /// for the smoothing pass (-2.0 = quiet gap column).
    pub var: f64,
}

/// Allele bookkeeping for the weighted policy: which allele each spanning
/// read belongs to, and which allele (if any) the call should favor. With
/// no target every read lands in the favored group.
pub struct AlleleSplit<'a> {
    pub iids: &'a [u32],
    pub allele_ids: &'a [i32],
    pub target: Option<i32>,
}

impl<'a> AlleleSplit<'a> {
    fn allele_of(&self, iid: u32) -> i32 {
        for (k, &i) in self.iids.iter().enumerate() {
            if i == iid {
                return self.allele_ids[k];
            }
        }
        -1
    }
}

/// Read-level bases and iids observed in a column, in stack order. The
/// refresh pass uses consecutive snapshots to count gap-run statistics.
#[derive(Clone, Debug, Default)]
pub struct ColumnSnapshot {
    pub bases: Vec<u8>,
    pub iids: Vec<u32>,
}

/// Call the consensus base/quality for `cid` and write it to the column's
/// call bead. Idempotent on an unmutated column.
pub fn base_call(
    cns: &mut CnsSession,
    cid: ColId,
    policy: CallPolicy,
    split: Option<&AlleleSplit<'_>>,
    opt: &CnsOptions,
    mut snapshot: Option<&mut ColumnSnapshot>,
) -> BaseCallResult {
    if let Some(snap) = snapshot.as_deref_mut() {
        snap.bases.clear();
        snap.iids.clear();
    }
    match policy {
        CallPolicy::Majority => majority_call(cns, cid, snapshot),
        CallPolicy::Weighted => weighted_call(cns, cid, split, opt, snapshot),
    }
}

fn majority_call(
    cns: &mut CnsSession,
    cid: ColId,
    mut snapshot: Option<&mut ColumnSnapshot>,
) -> BaseCallResult {
    let mut counts = [0i64; 6];
    let mut qv_sums = [0i64; 6];

    for bid in cns.column_bead_ids(cid) {
        let b = cns.base(bid);
        let frag = &cns.frags[cns.beads[bid.idx()].frag.idx()];
        counts[base_index(b)] += 1;
        qv_sums[base_index(b)] += i64::from(cns.qv(bid));
        if frag.kind == FragKind::Read {
            if let Some(snap) = snapshot.as_deref_mut() {
                snap.bases.push(b);
                snap.iids.push(frag.iid);
            }
        }
    }

    let mut best = 0usize;
    for i in 1..6 {
        if counts[i] > counts[best]
            || (counts[i] == counts[best] && qv_sums[i] > qv_sums[best])
        {
            best = i;
        }
    }

    let call = cns.columns[cid.idx()].call;
    cns.set_base(call, ALPHABET[best]);
    cns.set_qual_char(call, b'0');

    BaseCallResult { base: ALPHABET[best], qual: b'0', var: 0.0 }
}

fn weighted_call(
    cns: &mut CnsSession,
    cid: ColId,
    split: Option<&AlleleSplit<'_>>,
    opt: &CnsOptions,
    mut snapshot: Option<&mut ColumnSnapshot>,
) -> BaseCallResult {
    let (eprob, prob) = prob_tables();

    // group membership: (bead base index, effective qv) per group
    let mut best_reads: Vec<(usize, i32)> = Vec::new();
    let mut other_reads: Vec<(usize, i32)> = Vec::new();
    let mut guides: Vec<(usize, i32)> = Vec::new();

    let mut best_base_count = [0i32; 6];
    let mut best_qv_count = [0i64; 6];
    let mut highest_qv = [0i32; 6];
    let mut highest2_qv = [0i32; 6];

    let mut read_cov = 0i32;
    let mut last_read_qv = 0i32;

    for bid in cns.column_bead_ids(cid) {
        let b = cns.base(bid);
        if b == b'N' || b == b'n' {
            // N carries no signal; skip it entirely
            continue;
        }
        let bi = base_index(b);
        let qv = cns.qv(bid);
        let frag = &cns.frags[cns.beads[bid.idx()].frag.idx()];

        if frag.kind == FragKind::Read {
            if let Some(snap) = snapshot.as_deref_mut() {
                snap.bases.push(b);
                snap.iids.push(frag.iid);
            }

            let in_best = match split {
                Some(sp) => match sp.target {
                    Some(t) if opt.split_alleles => sp.allele_of(frag.iid) == t,
                    _ => true,
                },
                None => true,
            };
            if in_best {
                best_base_count[bi] += 1;
                best_qv_count[bi] += i64::from(qv);
                best_reads.push((bi, qv));
            } else {
                other_reads.push((bi, qv));
            }

            if highest_qv[bi] < qv {
                highest2_qv[bi] = highest_qv[bi];
                highest_qv[bi] = qv;
            } else if highest2_qv[bi] < qv {
                highest2_qv[bi] = qv;
            }

            read_cov += 1;
            last_read_qv = qv;
        } else {
            guides.push((bi, qv));
        }
    }

    // Strict override order: the highest-priority non-empty group supplies
    // the probability mass, it does not blend with the others.
    let group: &[(usize, i32)] = if !best_reads.is_empty() {
        &best_reads
    } else if !other_reads.is_empty() {
        &other_reads
    } else {
        &guides
    };
    let used_guides = best_reads.is_empty() && other_reads.is_empty() && !guides.is_empty();

    if group.is_empty() {
        // no usable coverage at all: call N at rock-bottom quality
        let call = cns.columns[cid.idx()].call;
        cns.set_base(call, b'N');
        cns.set_qual_char(call, b'0');
        return BaseCallResult { base: b'N', qual: b'0', var: 0.0 };
    }

    // log-domain tau accumulation over the 5-symbol simplex
    let mut ltau = [0f64; 5];
    for &(bi, qv) in group {
        let q = qv.clamp(CNS_MIN_QV, CNS_MAX_QV).max(0) as usize;
        let q = if q == 0 { 5 } else { q };
        for (i, lt) in ltau.iter_mut().enumerate() {
            if i == bi {
                *lt += prob[q].ln();
            } else {
                *lt += (TAU_MISMATCH * eprob[q]).ln();
            }
        }
    }

    // rescale by the max before exponentiating, then normalize
    let lmax = ltau.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let mut cw = [0f64; 5];
    let mut total = 0f64;
    for i in 0..5 {
        cw[i] = (ltau[i] - lmax).exp() * 0.2;
        total += cw[i];
    }
    if total > 0.0 {
        for w in cw.iter_mut() {
            *w /= total;
        }
    }

    // argmax with fixed-order tie resolution (gap < A < C < G < T)
    let mut max_ind = 0usize;
    let mut max_cw = 0f64;
    for i in 0..5 {
        if cw[i] > max_cw + EPS {
            max_ind = i;
            max_cw = cw[i];
        }
    }
    if max_cw <= EPS {
        max_ind = 0;
    }

    let cbase = ALPHABET[max_ind];
    let cqv: u8 = if (max_cw - 1.0).abs() < EPS {
        (b'0' as i32 + CNS_MAX_QV) as u8
    } else if read_cov == 1 && !used_guides {
        // a single uncorroborated read keeps its own quality
        (i32::from(b'0') + last_read_qv.clamp(CNS_MIN_QV, CNS_MAX_QV)) as u8
    } else {
        let tmpqv = -10.0 * (1.0 - max_cw).log10();
        let qv = (tmpqv + 0.5).floor() as i32;
        (i32::from(b'0') + qv.clamp(CNS_MIN_QV, CNS_MAX_QV)) as u8
    };

    let call = cns.columns[cid.idx()].call;
    cns.set_base(call, cbase);
    cns.set_qual_char(call, cqv);

    // Variation detection over the favored group: a second symbol counts
    // when it is backed by at least two reads (as is the consensus) and
    // clears the quality bar -- average qv for substitutions, top-two qv
    // sum for gap/non-gap differences.
    let bi_cons = base_index(cbase);
    let mut best_read_count = 0i64;
    let mut sum_qv_all = 0i64;

    for bi in 0..5 {
        best_read_count += i64::from(best_base_count[bi]);
    }
    for bi in 0..5 {
        if bi == bi_cons {
            continue;
        }
        if best_base_count[bi] <= 1 || best_base_count[bi_cons] <= 1 {
            continue;
        }
        let qualifies = if cbase != GAP && ALPHABET[bi] != GAP {
            let ave = best_qv_count[bi] as f64 / f64::from(best_base_count[bi]);
            ave >= f64::from(MIN_AVE_QV_FOR_VARIATION)
        } else {
            highest_qv[bi] + highest2_qv[bi] >= MIN_SUM_QVS_FOR_VARIATION
        };
        if qualifies {
            sum_qv_all += best_qv_count[bi];
        }
    }

    let mut var = if best_read_count <= 1 || sum_qv_all == 0 {
        if opt.smooth_win > 0 && cbase == GAP {
            -2.0
        } else {
            0.0
        }
    } else {
        1.0
    };
    if opt.smooth_win > 0 && cbase == GAP && var > 0.0 {
        var = -var;
    }

    BaseCallResult { base: cbase, qual: cqv, var }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CnsSession, FragKind};

    fn one_column(entries: &[(u8, i32)]) -> (CnsSession, ColId) {
        let mut cns = CnsSession::new();
        let mut cid = ColId::INVALID;
        for (i, &(b, qv)) in entries.iter().enumerate() {
            let fid = cns.register_fragment(
                i as u32 + 1,
                FragKind::Read,
                false,
                &[b],
                &[(b'0' as i32 + qv) as u8],
                Vec::new(),
            );
            let bid = cns.frags[fid.idx()].firstbead;
            if i == 0 {
                cid = cns.create_column(bid);
            } else {
                cns.align_bead_to_column(cid, bid);
            }
        }
        (cns, cid)
    }

    #[test]
    fn majority_prefers_count_over_quality() {
        // two A's at modest quality beat one high-quality C
        let (mut cns, cid) = one_column(&[(b'A', 30), (b'A', 28), (b'C', 20)]);
        let opt = CnsOptions::default();
        let r = base_call(&mut cns, cid, CallPolicy::Majority, None, &opt, None);
        assert_eq!(r.base, b'A');
        assert_eq!(r.qual, b'0');
    }

    #[test]
    fn majority_tie_breaks_on_quality_sum() {
        let (mut cns, cid) = one_column(&[(b'A', 10), (b'C', 40)]);
        let opt = CnsOptions::default();
        let r = base_call(&mut cns, cid, CallPolicy::Majority, None, &opt, None);
        assert_eq!(r.base, b'C');
    }

    #[test]
    fn weighted_call_matches_depth() {
        let (mut cns, cid) = one_column(&[(b'G', 30), (b'G', 30), (b'G', 30)]);
        let opt = CnsOptions::default();
        let r = base_call(&mut cns, cid, CallPolicy::Weighted, None, &opt, None);
        assert_eq!(r.base, b'G');
        assert!(r.qual > b'0' + 30, "deep agreement should boost quality");
    }

    #[test]
    fn weighted_call_is_idempotent() {
        let (mut cns, cid) = one_column(&[(b'T', 25), (b'T', 25), (b'A', 20)]);
        let opt = CnsOptions::default();
        let r1 = base_call(&mut cns, cid, CallPolicy::Weighted, None, &opt, None);
        let r2 = base_call(&mut cns, cid, CallPolicy::Weighted, None, &opt, None);
        assert_eq!(r1.base, r2.base);
        assert_eq!(r1.qual, r2.qual);
    }

    #[test]
    fn single_read_inherits_its_quality() {
        let (mut cns, cid) = one_column(&[(b'C', 17)]);
        let opt = CnsOptions::default();
        let r = base_call(&mut cns, cid, CallPolicy::Weighted, None, &opt, None);
        assert_eq!(r.base, b'C');
        assert_eq!(r.qual, b'0' + 17);
    }

    #[test]
    fn all_n_column_calls_n() {
        let (mut cns, cid) = one_column(&[(b'N', 10), (b'N', 10)]);
        let opt = CnsOptions::default();
        let r = base_call(&mut cns, cid, CallPolicy::Weighted, None, &opt, None);
        assert_eq!(r.base, b'N');
        assert_eq!(r.qual, b'0');
    }

    #[test]
    fn variation_detected_for_supported_second_allele() {
        let (mut cns, cid) = one_column(&[
            (b'A', 30),
            (b'A', 30),
            (b'C', 30),
            (b'C', 30),
        ]);
        let opt = CnsOptions::default();
        let r = base_call(&mut cns, cid, CallPolicy::Weighted, None, &opt, None);
        assert!(r.var > 0.0, "two well-supported symbols must score as variation");
    }

    #[test]
    fn weak_second_allele_scores_zero() {
        let (mut cns, cid) = one_column(&[(b'A', 30), (b'A', 30), (b'C', 8), (b'C', 9)]);
        let opt = CnsOptions::default();
        let r = base_call(&mut cns, cid, CallPolicy::Weighted, None, &opt, None);
        assert_eq!(r.var, 0.0, "low-quality disagreement is not variation");
    }

    #[test]
    fn deep_column_does_not_underflow() {
        // 500 agreeing reads would underflow naive linear-domain products
        let entries: Vec<(u8, i32)> = (0..500).map(|_| (b'A', 35)).collect();
        let (mut cns, cid) = one_column(&entries);
        let opt = CnsOptions::default();
        let r = base_call(&mut cns, cid, CallPolicy::Weighted, None, &opt, None);
        assert_eq!(r.base, b'A');
        assert_eq!(r.qual, (b'0' as i32 + CNS_MAX_QV) as u8);
    }
}
