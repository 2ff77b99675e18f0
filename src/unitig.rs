// Unitig consensus driver: place each read of a layout against a running
// anchor consensus, splice it into the multi-alignment, and refine.
//
// The anchor is a compact byte buffer (plus the matching consensus-call
// bead handles) rebuilt after every placement; querying the live
// multi-alignment for every new read would cost far more than maintaining
// the running buffer. Columns whose majority is a gap contribute a
// lowercase base to the anchor, never '-', so the pairwise aligner sees a
// plain sequence.

use anyhow::{anyhow, bail, Result};
use log::{debug, info, warn};

use crate::abacus::{abacus_refine, RefineLevel};
use crate::aligner::{get_alignment_trace, Overlap, TraceAligner};
use crate::apply_alignment::{apply_alignment, Anchor};
use crate::cns_opt::CnsOptions;
use crate::manode::{
    create_manode, get_manode_consensus, get_manode_positions, seed_manode_with_fragment,
};
use crate::refresh::{refresh_manode, RefreshMode};
use crate::store::{BeadId, CnsSession, FragId, FragKind, GAP};
use crate::MultiAlignRecord;

/// One read of a unitig layout. begin > end means reverse complement.
#[derive(Clone, Debug)]
pub struct LayoutRead {
    pub iid: u32,
    pub bases: Vec<u8>,
    pub quals: Vec<u8>,
    pub begin: i32,
    pub end: i32,
}

#[derive(Clone, Debug, Default)]
pub struct UnitigLayout {
    pub iid: u32,
    pub reads: Vec<LayoutRead>,
}

pub(crate) struct TigDriver<'a> {
    pub(crate) cns: CnsSession,
    pub(crate) mid: usize,
    fids: Vec<FragId>,
    /// layout positions, normalized to begin < end
    utgpos: Vec<(i32, i32)>,
    /// positions in the current anchor; (0,0) = unplaced
    cnspos: Vec<(i32, i32)>,
    anchor_bases: Vec<u8>,
    anchor_beads: Vec<BeadId>,
    aligners: &'a [&'a dyn TraceAligner],
    opt: &'a CnsOptions,
}

impl<'a> TigDriver<'a> {
    pub(crate) fn new(
        iid: u32,
        aligners: &'a [&'a dyn TraceAligner],
        opt: &'a CnsOptions,
        num_bases: usize,
        num_frags: usize,
    ) -> Self {
        let mut cns = CnsSession::with_capacity(num_bases, num_frags, num_bases);
        let mid = create_manode(&mut cns, iid);
        TigDriver {
            cns,
            mid,
            fids: Vec::new(),
            utgpos: Vec::new(),
            cnspos: Vec::new(),
            anchor_bases: Vec::new(),
            anchor_beads: Vec::new(),
            aligners,
            opt,
        }
    }

    pub(crate) fn add_fragment(
        &mut self,
        iid: u32,
        kind: FragKind,
        bases: &[u8],
        quals: &[u8],
        begin: i32,
        end: i32,
        components: Vec<crate::store::Component>,
    ) -> FragId {
        let complement = begin > end;
        let fid = self.cns.register_fragment(iid, kind, complement, bases, quals, components);
        self.utgpos.push((begin.min(end), begin.max(end)));
        self.cnspos.push((0, 0));
        self.fids.push(fid);
        fid
    }

    /// Seed the MANode with the first fragment and initialize the anchor.
    pub(crate) fn seed(&mut self) {
        seed_manode_with_fragment(&mut self.cns, self.mid, self.fids[0]);
        self.rebuild(false);
        self.cnspos[0] = (0, self.anchor_bases.len() as i32);
    }

    /// Recompute the anchor from the live columns (majority base, lowercase
    /// when the majority is a gap) and refresh every placed fragment's
    /// anchor coordinates. With `full`, first re-run consensus + all three
    /// abacus passes (expensive; used when placements stop working).
    pub(crate) fn rebuild(&mut self, full: bool) {
        if full {
            refresh_manode(&mut self.cns, self.mid, self.opt, RefreshMode::CallOnly, false);
            abacus_refine(&mut self.cns, self.mid, 0, -1, RefineLevel::Smooth, self.opt);
            abacus_refine(&mut self.cns, self.mid, 0, -1, RefineLevel::PolyX, self.opt);
            abacus_refine(&mut self.cns, self.mid, 0, -1, RefineLevel::Indel, self.opt);
        }

        self.anchor_bases.clear();
        self.anchor_beads.clear();
        self.cns.manodes[self.mid].columns.clear();

        let mut cid = self.cns.manodes[self.mid].first;
        let mut index = 0i32;
        while cid.is_valid() {
            let counts = self.cns.columns[cid.idx()].counts;
            let mut nn = 0;
            let mut call = b'N';
            for &b in &[b'A', b'C', b'G', b'T'] {
                if counts.get(b) > nn {
                    nn = counts.get(b);
                    call = b;
                }
            }
            // a gap-majority column still contributes its most prevalent
            // base, lowercased; the anchor never contains '-'
            if counts.get(GAP) > nn {
                call = call.to_ascii_lowercase();
            }
            assert_ne!(call, GAP);

            let call_bead = self.cns.columns[cid.idx()].call;
            self.cns.set_base(call_bead, call);

            self.anchor_bases.push(call);
            self.anchor_beads.push(call_bead);

            self.cns.columns[cid.idx()].ma_index = index;
            self.cns.manodes[self.mid].columns.push(cid);

            cid = self.cns.columns[cid.idx()].next;
            index += 1;
        }

        for t in 0..self.fids.len() {
            if self.cnspos[t] == (0, 0) || self.cns.frags[self.fids[t].idx()].manode < 0 {
                continue;
            }
            let frag = &self.cns.frags[self.fids[t].idx()];
            let first = frag.firstbead;
            let last = BeadId(first.0 + frag.length - 1);
            let bgn = self.cns.columns[self.cns.beads[first.idx()].column.idx()].ma_index;
            let end = self.cns.columns[self.cns.beads[last.idx()].column.idx()].ma_index + 1;
            assert!(bgn < end);
            self.cnspos[t] = (bgn, end);
        }
    }

    /// Project a placement for read `tiid` from the layout via the placed
    /// read it overlaps most thickly.
    fn position_from_layout(&self, tiid: usize) -> Option<(i32, i32)> {
        let mut thickest = 0i32;
        let mut best = None;
        for q in (0..tiid).rev() {
            if self.cnspos[q] == (0, 0) {
                continue;
            }
            if self.utgpos[tiid].0 >= self.utgpos[q].1 || self.utgpos[tiid].1 <= self.utgpos[q].0 {
                continue;
            }
            let bgn = self.cnspos[q].0 + self.utgpos[tiid].0 - self.utgpos[q].0;
            let end = self.cnspos[q].1 + self.utgpos[tiid].1 - self.utgpos[q].1;
            if bgn >= end || bgn >= self.anchor_bases.len() as i32 {
                continue;
            }
            let ooo = end.min(self.anchor_bases.len() as i32) - bgn;
            if ooo > thickest {
                thickest = ooo;
                best = Some((bgn, end));
            }
        }
        if thickest >= self.min_overlap_for(tiid) as i32 {
            best
        } else {
            None
        }
    }

    /// Last resort: find the read's place by aligning it against the whole
    /// anchor.
    fn position_from_alignment(&self, tiid: usize, erate: f64) -> Option<(i32, i32)> {
        let bases = self.cns.fragment_bases(self.fids[tiid]).to_vec();
        let o = get_alignment_trace(
            self.aligners,
            &self.anchor_bases,
            &bases,
            erate,
            self.min_overlap_for(tiid),
            true,
            true,
        )?;
        Some((o.ahang, self.anchor_bases.len() as i32 + o.bhang))
    }

    fn min_overlap_for(&self, tiid: usize) -> usize {
        let blen = self.cns.frags[self.fids[tiid].idx()].length as usize;
        self.opt.min_overlap.min(blen)
    }

    /// Align the read against the anchor window around its expected
    /// position. Returns the anchor-absolute ahang and trace.
    fn align_fragment(&self, tiid: usize, cnspos: (i32, i32), erate: f64) -> Option<(i32, Vec<i32>)> {
        let (bgn, end) = cnspos;
        if bgn >= end {
            return None;
        }
        let alen = self.anchor_bases.len() as i32;
        let blen = self.cns.frags[self.fids[tiid].idx()].length as i32;
        let extra = 10.max((erate * f64::from(blen)).ceil() as i32);

        let frank_bgn = (bgn - extra).max(0);
        let frank_end = (end + extra).min(alen);
        let allow_ahang = frank_bgn == 0;
        let allow_bhang = frank_end == alen;

        let window = &self.anchor_bases[frank_bgn as usize..frank_end as usize];
        let bases = self.cns.fragment_bases(self.fids[tiid]).to_vec();

        let o: Overlap = get_alignment_trace(
            self.aligners,
            window,
            &bases,
            erate + 0.02,
            self.min_overlap_for(tiid),
            allow_ahang,
            allow_bhang,
        )?;

        // lift the window-relative trace to anchor coordinates
        let trace_bgn = frank_bgn + o.ahang;
        let trace: Vec<i32> =
            o.trace.iter().map(|&t| if t < 0 { t - frank_bgn } else { t }).collect();
        Some((trace_bgn, trace))
    }

    /// Splice the read into the live structure along the obtained trace.
    pub(crate) fn apply(&mut self, tiid: usize, trace_bgn: i32, trace: &[i32]) {
        let beads = std::mem::take(&mut self.anchor_beads);
        apply_alignment(&mut self.cns, Anchor::Beads(&beads), self.fids[tiid], trace_bgn, trace);
        self.anchor_beads = beads;

        #[cfg(debug_assertions)]
        crate::manode::check_columns(&self.cns, self.mid);
    }

    /// Placement ladder for one read: layout projection, then whole-anchor
    /// alignment, escalating the error rate, with one full consensus
    /// rebuild in between. True when the read was placed.
    pub(crate) fn place_fragment(&mut self, tiid: usize) -> bool {
        for round in 0..4u32 {
            if round == 2 {
                debug!("place_fragment: recomputing full consensus before retrying read {tiid}");
                self.rebuild(true);
            }
            let attempt = match round {
                0 => 0,
                1 => 1,
                2 => 0,
                _ => 2,
            };
            let erate = self.opt.escalated_error_rate(attempt);

            if let Some(pos) = self.position_from_layout(tiid) {
                if let Some((trace_bgn, trace)) = self.align_fragment(tiid, pos, erate) {
                    self.cnspos[tiid] = pos;
                    self.apply(tiid, trace_bgn, &trace);
                    self.rebuild(false);
                    return true;
                }
            }
            if let Some(pos) = self.position_from_alignment(tiid, erate) {
                if let Some((trace_bgn, trace)) = self.align_fragment(tiid, pos, erate) {
                    self.cnspos[tiid] = pos;
                    self.apply(tiid, trace_bgn, &trace);
                    self.rebuild(false);
                    return true;
                }
            }
        }
        false
    }

    /// Final refinement and extraction.
    pub(crate) fn generate_record(&mut self, iid: u32) -> MultiAlignRecord {
        refresh_manode(&mut self.cns, self.mid, self.opt, RefreshMode::CallOnly, false);

        abacus_refine(&mut self.cns, self.mid, 0, -1, RefineLevel::Smooth, self.opt);
        abacus_refine(&mut self.cns, self.mid, 0, -1, RefineLevel::PolyX, self.opt);
        abacus_refine(&mut self.cns, self.mid, 0, -1, RefineLevel::Indel, self.opt);

        let variants =
            refresh_manode(&mut self.cns, self.mid, self.opt, RefreshMode::VarRecords, true);

        #[cfg(debug_assertions)]
        crate::manode::check_columns(&self.cns, self.mid);

        let (consensus, quality) = get_manode_consensus(&self.cns, self.mid);
        let placements = get_manode_positions(&self.cns, self.mid);

        MultiAlignRecord { iid, consensus, quality, placements, variants }
    }
}

/// Build the consensus of one unitig from its layout. Fails whole (with no
/// partial record) when any read cannot be placed.
pub fn multi_align_unitig(
    layout: &UnitigLayout,
    aligners: &[&dyn TraceAligner],
    opt: &CnsOptions,
) -> Result<MultiAlignRecord> {
    if layout.reads.is_empty() {
        bail!("unitig {} has no reads", layout.iid);
    }

    let num_bases: usize = layout.reads.iter().map(|r| r.bases.len()).sum();
    let mut driver = TigDriver::new(layout.iid, aligners, opt, num_bases, layout.reads.len());

    let mut seen = std::collections::HashSet::new();
    for r in &layout.reads {
        if r.begin == r.end {
            bail!("unitig {}: read {} has an empty layout interval", layout.iid, r.iid);
        }
        if !seen.insert(r.iid) {
            bail!("unitig {}: read {} appears twice", layout.iid, r.iid);
        }
        if r.bases.len() != r.quals.len() {
            bail!("unitig {}: read {} length/quality mismatch", layout.iid, r.iid);
        }
        driver.add_fragment(r.iid, FragKind::Read, &r.bases, &r.quals, r.begin, r.end, Vec::new());
    }

    driver.seed();
    info!(
        "multi_align_unitig: unitig {} seeded with read {} ({} reads total)",
        layout.iid,
        layout.reads[0].iid,
        layout.reads.len()
    );

    let mut failed: Vec<u32> = Vec::new();
    for tiid in 1..layout.reads.len() {
        if !driver.place_fragment(tiid) {
            warn!(
                "multi_align_unitig: unitig {} failed to place read {}",
                layout.iid, layout.reads[tiid].iid
            );
            failed.push(layout.reads[tiid].iid);
        }
    }

    if !failed.is_empty() {
        return Err(anyhow!(
            "unitig {} failed: could not place {} read(s): {:?}",
            layout.iid,
            failed.len(),
            failed
        ));
    }

    Ok(driver.generate_record(layout.iid))
}
