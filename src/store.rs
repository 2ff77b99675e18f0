// Arena storage for the multi-alignment: sequence/quality byte pools, beads,
// columns, and fragments, all owned by one CnsSession and addressed through
// typed integer handles.
//
// Handles are append-only: buffers may reallocate on growth but a handle,
// once issued, stays valid for the life of the session. All intrusive links
// (bead prev/next/up/down, column prev/next) are handles, never references,
// so growth can never dangle a live link.

use crate::manode::MANode;

/// Gap symbol used throughout the alignment.
pub const GAP: u8 = b'-';

/// Symbol order for base counting and consensus calling: gap first, then
/// the four bases, then N. Ties are resolved in this order.
pub const ALPHABET: [u8; 6] = [b'-', b'A', b'C', b'G', b'T', b'N'];

/// Map a base byte to its index in [`ALPHABET`]. Case-insensitive; anything
/// unrecognized counts as N.
#[inline]
pub fn base_index(b: u8) -> usize {
    match b {
        b'-' => 0,
        b'A' | b'a' => 1,
        b'C' | b'c' => 2,
        b'G' | b'g' => 3,
        b'T' | b't' => 4,
        _ => 5,
    }
}

#[inline]
pub fn complement_base(b: u8) -> u8 {
    match b {
        b'A' | b'a' => b'T',
        b'C' | b'c' => b'G',
        b'G' | b'g' => b'C',
        b'T' | b't' => b'A',
        b'-' => b'-',
        _ => b'N',
    }
}

macro_rules! handle_type {
    ($name:ident) => {
        #[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
        pub struct $name(pub u32);

        impl $name {
            pub const INVALID: $name = $name(u32::MAX);

            #[inline]
            pub fn is_valid(self) -> bool {
                self.0 != u32::MAX
            }

            #[inline]
            pub fn idx(self) -> usize {
                debug_assert!(self.is_valid());
                self.0 as usize
            }
        }
    };
}

handle_type!(BeadId);
handle_type!(ColId);
handle_type!(FragId);

/// One aligned residue occurrence: a single base of a single fragment at a
/// single column of the multi-alignment.
#[derive(Copy, Clone, Debug)]
pub struct Bead {
    /// Offset of this bead's base/quality in the session byte pools.
    pub soffset: u32,
    /// Position of this bead within its fragment (gap beads share the
    /// neighborhood of the base they pad).
    pub foffset: i32,
    /// Intra-sequence links (through gap beads).
    pub prev: BeadId,
    pub next: BeadId,
    /// Intra-column links (vertical stack).
    pub up: BeadId,
    pub down: BeadId,
    /// Owning fragment; invalid for consensus-call beads.
    pub frag: FragId,
    /// Column membership; invalid while the bead is pending/unaligned.
    pub column: ColId,
}

/// Running per-symbol histogram for one column, kept current by every
/// align/unalign/exchange so majority queries are O(1).
#[derive(Copy, Clone, Debug, Default)]
pub struct BaseCount {
    pub count: [i32; 6],
    pub depth: i32,
}

impl BaseCount {
    pub fn inc(&mut self, b: u8) {
        self.count[base_index(b)] += 1;
        self.depth += 1;
    }

    pub fn dec(&mut self, b: u8) {
        let i = base_index(b);
        self.count[i] -= 1;
        self.depth -= 1;
        assert!(self.count[i] >= 0, "base count underflow for {:?}", b as char);
    }

    #[inline]
    pub fn get(&self, b: u8) -> i32 {
        self.count[base_index(b)]
    }

    /// Majority symbol, scanning from `start_index` (pass 1 to disallow the
    /// gap). Ties never resolve to '-' when a real base has the same count;
    /// among real bases the fixed symbol order wins.
    pub fn max_base(&self, start_index: usize) -> u8 {
        let mut max_count = 0;
        for i in start_index..5 {
            if self.count[i] > max_count {
                max_count = self.count[i];
            }
        }
        if max_count == 0 {
            return ALPHABET[start_index];
        }
        for i in 1..5 {
            if i >= start_index && self.count[i] == max_count {
                return ALPHABET[i];
            }
        }
        ALPHABET[start_index]
    }
}

/// One vertical alignment position: a stack of beads (via up/down links on
/// its members) plus a designated consensus-call bead.
#[derive(Clone, Debug)]
pub struct Column {
    pub call: BeadId,
    pub prev: ColId,
    pub next: ColId,
    /// Owning MANode (index into session.manodes), -1 when unowned.
    pub ma: i32,
    /// Ordinal within the MANode; refreshed only periodically.
    pub ma_index: i32,
    pub counts: BaseCount,
}

/// Fragment kind: a raw read, or an already-consensed sub-assembly placed
/// as a pseudo-read.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum FragKind {
    Read,
    Tig,
}

/// Component placement carried by a Tig fragment: where each member read
/// (or nested tig) sits in the tig's own ungapped coordinates.
#[derive(Clone, Debug)]
pub enum Component {
    Read { iid: u32, begin: i32, end: i32 },
    Tig { iid: u32, begin: i32, end: i32 },
}

/// Metadata for one contributing sequence.
#[derive(Clone, Debug)]
pub struct Fragment {
    pub iid: u32,
    pub kind: FragKind,
    pub complement: bool,
    pub length: u32,
    /// Offset of the first (ungapped) base in the session sequence pool.
    pub sequence: u32,
    pub firstbead: BeadId,
    pub deleted: bool,
    /// MANode this fragment is placed in, -1 when unplaced.
    pub manode: i32,
    pub components: Vec<Component>,
}

/// Owner of all arenas for one consensus run. One session per tig; never
/// shared across threads.
pub struct CnsSession {
    pub seqs: Vec<u8>,
    pub quals: Vec<u8>,
    pub beads: Vec<Bead>,
    pub columns: Vec<Column>,
    pub frags: Vec<Fragment>,
    pub manodes: Vec<MANode>,
    /// Running count of gap beads inserted, for diagnostics.
    pub gaps_in_alignment: u64,
    /// Scratch: per-fragment abacus row assignment (0 = absent, row+1
    /// otherwise). Sized to the fragment count on demand.
    pub abacus_rows: Vec<i32>,
}

impl CnsSession {
    pub fn new() -> Self {
        CnsSession {
            seqs: Vec::new(),
            quals: Vec::new(),
            beads: Vec::new(),
            columns: Vec::new(),
            frags: Vec::new(),
            manodes: Vec::new(),
            gaps_in_alignment: 0,
            abacus_rows: Vec::new(),
        }
    }

    /// Pre-size the arenas for an expected workload.
    pub fn with_capacity(num_bases: usize, num_frags: usize, num_columns: usize) -> Self {
        let mut s = CnsSession::new();
        s.seqs.reserve(num_bases + num_columns);
        s.quals.reserve(num_bases + num_columns);
        s.beads.reserve(num_bases + num_columns);
        s.columns.reserve(num_columns);
        s.frags.reserve(num_frags);
        s
    }

    // ---- byte pool accessors -------------------------------------------

    #[inline]
    pub fn base(&self, bid: BeadId) -> u8 {
        self.seqs[self.beads[bid.idx()].soffset as usize]
    }

    #[inline]
    pub fn qual_char(&self, bid: BeadId) -> u8 {
        self.quals[self.beads[bid.idx()].soffset as usize]
    }

    /// Quality value of a bead (phred, decoded from the '0'-based byte).
    #[inline]
    pub fn qv(&self, bid: BeadId) -> i32 {
        i32::from(self.qual_char(bid)) - i32::from(b'0')
    }

    #[inline]
    pub fn set_base(&mut self, bid: BeadId, b: u8) {
        let off = self.beads[bid.idx()].soffset as usize;
        self.seqs[off] = b;
    }

    #[inline]
    pub fn set_qual_char(&mut self, bid: BeadId, q: u8) {
        let off = self.beads[bid.idx()].soffset as usize;
        self.quals[off] = q;
    }

    #[inline]
    pub fn bead(&self, bid: BeadId) -> &Bead {
        &self.beads[bid.idx()]
    }

    #[inline]
    pub fn column(&self, cid: ColId) -> &Column {
        &self.columns[cid.idx()]
    }

    #[inline]
    pub fn fragment(&self, fid: FragId) -> &Fragment {
        &self.frags[fid.idx()]
    }

    /// The original (ungapped) bases of a fragment, contiguous in the pool.
    pub fn fragment_bases(&self, fid: FragId) -> &[u8] {
        let f = &self.frags[fid.idx()];
        let s = f.sequence as usize;
        &self.seqs[s..s + f.length as usize]
    }

    pub fn fragment_quals(&self, fid: FragId) -> &[u8] {
        let f = &self.frags[fid.idx()];
        let s = f.sequence as usize;
        &self.quals[s..s + f.length as usize]
    }

    // ---- fragment registration -----------------------------------------

    /// Register one sequence with the store: copies bases/qualities into the
    /// pools (reverse-complementing when asked) and builds the bead chain,
    /// one bead per base, all pending (no column membership).
    pub fn register_fragment(
        &mut self,
        iid: u32,
        kind: FragKind,
        complement: bool,
        bases: &[u8],
        quals: &[u8],
        components: Vec<Component>,
    ) -> FragId {
        assert_eq!(bases.len(), quals.len(), "sequence/quality length mismatch");
        assert!(!bases.is_empty(), "empty sequence for fragment {iid}");

        let fid = FragId(self.frags.len() as u32);
        let soffset = self.seqs.len() as u32;
        let firstbead = BeadId(self.beads.len() as u32);
        let n = bases.len();

        if complement {
            for i in (0..n).rev() {
                self.seqs.push(complement_base(bases[i]));
                self.quals.push(quals[i]);
            }
        } else {
            self.seqs.extend_from_slice(bases);
            self.quals.extend_from_slice(quals);
        }

        for i in 0..n {
            self.beads.push(Bead {
                soffset: soffset + i as u32,
                foffset: i as i32,
                prev: if i == 0 { BeadId::INVALID } else { BeadId(firstbead.0 + i as u32 - 1) },
                next: if i == n - 1 { BeadId::INVALID } else { BeadId(firstbead.0 + i as u32 + 1) },
                up: BeadId::INVALID,
                down: BeadId::INVALID,
                frag: fid,
                column: ColId::INVALID,
            });
        }

        self.frags.push(Fragment {
            iid,
            kind,
            complement,
            length: n as u32,
            sequence: soffset,
            firstbead,
            deleted: false,
            manode: -1,
            components,
        });

        fid
    }

    /// Bead ids of a fragment in intra-sequence order, gap beads included.
    pub fn fragment_bead_ids(&self, fid: FragId) -> Vec<BeadId> {
        let mut out = Vec::with_capacity(self.frags[fid.idx()].length as usize);
        let mut bid = self.frags[fid.idx()].firstbead;
        while bid.is_valid() {
            out.push(bid);
            bid = self.beads[bid.idx()].next;
        }
        out
    }

    /// Bead ids of a column's stack, top to bottom (call bead excluded).
    pub fn column_bead_ids(&self, cid: ColId) -> Vec<BeadId> {
        let mut out = Vec::new();
        let mut bid = self.beads[self.columns[cid.idx()].call.idx()].down;
        while bid.is_valid() {
            out.push(bid);
            bid = self.beads[bid.idx()].down;
        }
        out
    }

    pub fn column_depth(&self, cid: ColId) -> i32 {
        self.columns[cid.idx()].counts.depth
    }

    // ---- gap beads -----------------------------------------------------

    fn gap_qual_near(&self, a: BeadId, b: BeadId) -> u8 {
        let mut qv = self.qual_char(a);
        if b.is_valid() {
            qv = qv.min(self.qual_char(b));
        }
        if qv == b'0' {
            qv = b'0' + 5;
        }
        qv
    }

    /// Allocate a new gap bead in the same fragment immediately after `bid`,
    /// relinking the intra-sequence chain. The bead is pending: the caller
    /// must align it to a column.
    pub fn append_gap_bead(&mut self, bid: BeadId) -> BeadId {
        let nid = BeadId(self.beads.len() as u32);
        let prev = self.beads[bid.idx()];
        let qv = self.gap_qual_near(bid, prev.next);

        self.seqs.push(GAP);
        self.quals.push(qv);
        self.beads.push(Bead {
            soffset: (self.seqs.len() - 1) as u32,
            foffset: prev.foffset + 1,
            prev: bid,
            next: prev.next,
            up: BeadId::INVALID,
            down: BeadId::INVALID,
            frag: prev.frag,
            column: ColId::INVALID,
        });

        self.beads[bid.idx()].next = nid;
        if prev.next.is_valid() {
            self.beads[prev.next.idx()].prev = nid;
        }
        self.gaps_in_alignment += 1;
        nid
    }

    /// Allocate a new gap bead in the same fragment immediately before `bid`.
    pub fn prepend_gap_bead(&mut self, bid: BeadId) -> BeadId {
        let nid = BeadId(self.beads.len() as u32);
        let next = self.beads[bid.idx()];
        assert!(next.frag.is_valid(), "prepend_gap_bead on a call bead");
        let qv = self.gap_qual_near(bid, next.prev);

        self.seqs.push(GAP);
        self.quals.push(qv);
        self.beads.push(Bead {
            soffset: (self.seqs.len() - 1) as u32,
            foffset: next.foffset,
            prev: next.prev,
            next: bid,
            up: BeadId::INVALID,
            down: BeadId::INVALID,
            frag: next.frag,
            column: ColId::INVALID,
        });

        self.beads[bid.idx()].prev = nid;
        if next.prev.is_valid() {
            self.beads[next.prev.idx()].next = nid;
        }
        self.gaps_in_alignment += 1;
        nid
    }

    // ---- column construction -------------------------------------------

    /// Create a fresh column containing exactly the seed bead, detached from
    /// any column chain. The consensus-call bead is allocated here ('n', qv 0).
    pub fn create_column(&mut self, bid: BeadId) -> ColId {
        assert!(
            !self.beads[bid.idx()].column.is_valid(),
            "create_column: seed bead already belongs to a column"
        );
        let cid = ColId(self.columns.len() as u32);
        let call = BeadId(self.beads.len() as u32);

        self.seqs.push(b'n');
        self.quals.push(b'0');
        self.beads.push(Bead {
            soffset: (self.seqs.len() - 1) as u32,
            foffset: 0,
            prev: BeadId::INVALID,
            next: BeadId::INVALID,
            up: BeadId::INVALID,
            down: bid,
            frag: FragId::INVALID,
            column: cid,
        });

        let mut counts = BaseCount::default();
        counts.inc(self.seqs[self.beads[bid.idx()].soffset as usize]);

        self.columns.push(Column {
            call,
            prev: ColId::INVALID,
            next: ColId::INVALID,
            ma: -1,
            ma_index: -1,
            counts,
        });

        self.beads[bid.idx()].up = call;
        self.beads[bid.idx()].column = cid;
        cid
    }

    /// The single fundamental alignment primitive: insert `bid` at the top
    /// of `cid`'s stack and record the membership. Panics if the bead is
    /// already aligned (upstream bug, not a data condition).
    pub fn align_bead_to_column(&mut self, cid: ColId, bid: BeadId) {
        assert!(
            !self.beads[bid.idx()].column.is_valid(),
            "align_bead_to_column: bead already aligned (frag {:?})",
            self.beads[bid.idx()].frag
        );

        let call = self.columns[cid.idx()].call;
        let first = self.beads[call.idx()].down;

        self.beads[bid.idx()].down = first;
        self.beads[bid.idx()].up = call;
        self.beads[call.idx()].down = bid;
        if first.is_valid() {
            self.beads[first.idx()].up = bid;
        }
        self.beads[bid.idx()].column = cid;

        let b = self.base(bid);
        self.columns[cid.idx()].counts.inc(b);
    }

    /// Remove a bead from its column, returning the bead above it. No-op on
    /// unaligned beads.
    pub fn unalign_bead(&mut self, bid: BeadId) -> BeadId {
        let bead = self.beads[bid.idx()];
        if !bead.column.is_valid() {
            return BeadId::INVALID;
        }
        let b = self.base(bid);

        self.beads[bead.up.idx()].down = bead.down;
        if bead.down.is_valid() {
            self.beads[bead.down.idx()].up = bead.up;
        }
        self.columns[bead.column.idx()].counts.dec(b);

        self.beads[bid.idx()].up = BeadId::INVALID;
        self.beads[bid.idx()].down = BeadId::INVALID;
        self.beads[bid.idx()].column = ColId::INVALID;
        bead.up
    }

    /// Detach a maximal run of gap beads containing `bid` from their columns
    /// and from the fragment's chain, returning the surviving anchor bead.
    /// Every removed bead must be a gap.
    pub fn unalign_trailing_gap_beads(&mut self, bid: BeadId) -> BeadId {
        let mut bead = bid;

        // Decide which side survives: walk forward over gaps; if a non-gap
        // follows, the run is internal-left and the anchor is on the right.
        let mut anchor = self.beads[bead.idx()].prev;
        while self.beads[bead.idx()].next.is_valid()
            && self.base(self.beads[bead.idx()].next) == GAP
        {
            bead = self.beads[bead.idx()].next;
        }
        if self.beads[bead.idx()].next.is_valid() {
            anchor = self.beads[bead.idx()].next;
            while self.beads[bead.idx()].prev.is_valid()
                && self.base(self.beads[bead.idx()].prev) == GAP
            {
                bead = self.beads[bead.idx()].prev;
            }
        }

        while bead.is_valid() && bead != anchor {
            let cur = self.beads[bead.idx()];
            assert_eq!(self.base(bead), GAP, "unalign_trailing_gap_beads hit a base");

            self.beads[cur.up.idx()].down = cur.down;
            if cur.down.is_valid() {
                self.beads[cur.down.idx()].up = cur.up;
            }
            self.columns[cur.column.idx()].counts.dec(GAP);

            self.beads[bead.idx()].up = BeadId::INVALID;
            self.beads[bead.idx()].down = BeadId::INVALID;
            self.beads[bead.idx()].column = ColId::INVALID;

            if !cur.next.is_valid() {
                let prev = cur.prev;
                self.beads[prev.idx()].next = BeadId::INVALID;
                self.beads[bead.idx()].prev = BeadId::INVALID;
                bead = prev;
            } else {
                let next = cur.next;
                self.beads[next.idx()].prev = BeadId::INVALID;
                self.beads[bead.idx()].next = BeadId::INVALID;
                bead = next;
            }
        }
        anchor
    }

    /// Exchange the structural positions of two beads of one fragment. Only
    /// gap beads may lie between them; anything else is an invariant
    /// violation. Column membership, links, and base counts all follow the
    /// swap so that callers holding either id see the beads trade places.
    pub fn lateral_exchange_beads(&mut self, lid: BeadId, rid: BeadId) {
        // verify the run between lid and rid is pure gap
        {
            let mut ib = self.beads[lid.idx()].next;
            let mut bases = 0;
            while ib.is_valid() && ib != rid {
                if self.base(ib) != GAP {
                    bases += 1;
                }
                ib = self.beads[ib.idx()].next;
            }
            assert!(
                bases == 0,
                "lateral_exchange_beads: non-gap beads between {:?} and {:?}",
                lid,
                rid
            );
        }

        let left = self.beads[lid.idx()];
        let right = self.beads[rid.idx()];
        let leftchar = self.base(lid);
        let rightchar = self.base(rid);
        let leftcol = left.column;
        let rightcol = right.column;

        self.beads[rid.idx()].up = left.up;
        self.beads[rid.idx()].down = left.down;
        self.beads[rid.idx()].prev = left.prev;
        self.beads[rid.idx()].next = left.next;
        if left.up.is_valid() {
            self.beads[left.up.idx()].down = rid;
        }
        if left.down.is_valid() {
            self.beads[left.down.idx()].up = rid;
        }
        if left.prev.is_valid() {
            self.beads[left.prev.idx()].next = rid;
        }

        self.beads[lid.idx()].up = right.up;
        self.beads[lid.idx()].down = right.down;
        self.beads[lid.idx()].prev = right.prev;
        self.beads[lid.idx()].next = right.next;
        if right.up.is_valid() {
            self.beads[right.up.idx()].down = lid;
        }
        if right.down.is_valid() {
            self.beads[right.down.idx()].up = lid;
        }
        if right.next.is_valid() {
            self.beads[right.next.idx()].prev = lid;
        }

        if right.prev == lid {
            // adjacent beads: close the two-cycle directly
            self.beads[rid.idx()].next = lid;
            self.beads[lid.idx()].prev = rid;
        } else {
            let rnext = self.beads[rid.idx()].next;
            if rnext.is_valid() {
                self.beads[rnext.idx()].prev = rid;
            }
            let lprev = self.beads[lid.idx()].prev;
            if lprev.is_valid() {
                self.beads[lprev.idx()].next = lid;
            }
        }

        self.beads[rid.idx()].column = leftcol;
        self.beads[lid.idx()].column = rightcol;

        self.columns[leftcol.idx()].counts.dec(leftchar);
        self.columns[leftcol.idx()].counts.inc(rightchar);
        self.columns[rightcol.idx()].counts.dec(rightchar);
        self.columns[rightcol.idx()].counts.inc(leftchar);
    }

    /// Append a new column immediately after `cid`, seeded with `bid`; every
    /// other fragment present in `cid` that continues past it receives a gap
    /// bead in the new column.
    pub fn column_append(&mut self, cid: ColId, bid: BeadId) -> ColId {
        let ncid = self.create_column(bid);

        let prev_next = self.columns[cid.idx()].next;
        let prev_call = self.columns[cid.idx()].call;
        let call = self.columns[ncid.idx()].call;

        self.columns[ncid.idx()].next = prev_next;
        self.columns[ncid.idx()].prev = cid;
        self.beads[call.idx()].next = self.beads[prev_call.idx()].next;
        self.beads[call.idx()].prev = prev_call;
        self.columns[cid.idx()].next = ncid;
        self.beads[prev_call.idx()].next = call;

        if prev_next.is_valid() {
            self.columns[prev_next.idx()].prev = ncid;
        }
        let call_next = self.beads[call.idx()].next;
        if call_next.is_valid() {
            self.beads[call_next.idx()].prev = call;
        }

        // pad other fragments passing through cid
        let members = self.column_bead_ids(cid);
        for nid in members {
            let next = self.beads[nid.idx()].next;
            if next.is_valid() && next != bid {
                let gap = self.append_gap_bead(nid);
                self.align_bead_to_column(ncid, gap);
            }
        }

        let ma = self.columns[cid.idx()].ma;
        self.columns[ncid.idx()].ma = ma;
        self.columns[ncid.idx()].ma_index = self.columns[cid.idx()].ma_index + 1;
        if ma >= 0 {
            crate::manode::add_column_to_manode(self, ma as usize, ncid);
        }
        ncid
    }

    /// Insert a new column immediately before `cid`, seeded with `bid`;
    /// fragments already present in `cid` whose chains extend left of it
    /// receive a gap bead in the new column.
    pub fn column_prepend(&mut self, cid: ColId, bid: BeadId) -> ColId {
        let ncid = self.create_column(bid);

        let next_prev = self.columns[cid.idx()].prev;
        let next_call = self.columns[cid.idx()].call;
        let call = self.columns[ncid.idx()].call;

        self.columns[ncid.idx()].prev = next_prev;
        self.columns[ncid.idx()].next = cid;
        self.beads[call.idx()].prev = self.beads[next_call.idx()].prev;
        self.beads[call.idx()].next = next_call;
        self.columns[cid.idx()].prev = ncid;
        self.beads[next_call.idx()].prev = call;

        if next_prev.is_valid() {
            self.columns[next_prev.idx()].next = ncid;
        }
        let call_prev = self.beads[call.idx()].prev;
        if call_prev.is_valid() {
            self.beads[call_prev.idx()].next = call;
        }

        // a fragment whose bead has no prev starts here; it gets no padding
        let members = self.column_bead_ids(cid);
        for nid in members {
            let prev = self.beads[nid.idx()].prev;
            if prev.is_valid() && prev != bid {
                let gap = self.prepend_gap_bead(nid);
                self.align_bead_to_column(ncid, gap);
            }
        }

        let ma = self.columns[cid.idx()].ma;
        self.columns[ncid.idx()].ma = ma;
        self.columns[ncid.idx()].ma_index = self.columns[cid.idx()].ma_index - 1;
        if ma >= 0 {
            crate::manode::add_column_to_manode(self, ma as usize, ncid);
        }
        ncid
    }
}

impl Default for CnsSession {
    fn default() -> Self {
        CnsSession::new()
    }
}
