// Tig layout and read loading for the CLI driver.
//
// Layout format, one directive per line (gzip-transparent):
//
//   unitig <iid>
//   frg <iid> <begin> <end>
//
// begin > end places the read reverse-complemented. Reads come separately
// as FASTA or FASTQ (optionally .gz) with numeric record ids matching the
// layout's read iids.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use flate2::read::MultiGzDecoder;
use log::debug;

use crate::defaults::{CNS_MAX_QV, CNS_MIN_QV};
use crate::unitig::{LayoutRead, UnitigLayout};

/// Default quality for FASTA input, which carries none.
const DEFAULT_FASTA_QV: u8 = 20;

/// Open a path for reading, decompressing .gz transparently.
pub fn open_maybe_gz(path: &Path) -> Result<Box<dyn Read>> {
    let f = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    if path.extension().is_some_and(|e| e == "gz") {
        Ok(Box::new(MultiGzDecoder::new(f)))
    } else {
        Ok(Box::new(f))
    }
}

/// Parse a layout file into per-unitig read skeletons (sequences are
/// attached separately).
pub fn read_layouts(path: &Path) -> Result<Vec<UnitigLayout>> {
    let reader = BufReader::new(open_maybe_gz(path)?);
    let mut layouts: Vec<UnitigLayout> = Vec::new();

    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields[0] {
            "unitig" => {
                if fields.len() != 2 {
                    bail!("{}:{}: malformed unitig line", path.display(), lineno + 1);
                }
                let iid = fields[1]
                    .parse()
                    .with_context(|| format!("{}:{}: bad unitig id", path.display(), lineno + 1))?;
                layouts.push(UnitigLayout { iid, reads: Vec::new() });
            }
            "frg" => {
                if fields.len() != 4 {
                    bail!("{}:{}: malformed frg line", path.display(), lineno + 1);
                }
                let layout = layouts
                    .last_mut()
                    .ok_or_else(|| anyhow!("{}:{}: frg before any unitig", path.display(), lineno + 1))?;
                layout.reads.push(LayoutRead {
                    iid: fields[1].parse().with_context(|| {
                        format!("{}:{}: bad frg id", path.display(), lineno + 1)
                    })?,
                    bases: Vec::new(),
                    quals: Vec::new(),
                    begin: fields[2].parse().with_context(|| {
                        format!("{}:{}: bad frg begin", path.display(), lineno + 1)
                    })?,
                    end: fields[3].parse().with_context(|| {
                        format!("{}:{}: bad frg end", path.display(), lineno + 1)
                    })?,
                });
            }
            other => bail!("{}:{}: unknown directive '{other}'", path.display(), lineno + 1),
        }
    }

    debug!("read_layouts: {} unitigs from {}", layouts.len(), path.display());
    Ok(layouts)
}

fn encode_qual(phred33: &[u8]) -> Vec<u8> {
    phred33
        .iter()
        .map(|&q| {
            let qv = i32::from(q) - 33;
            (b'0' as i32 + qv.clamp(CNS_MIN_QV, CNS_MAX_QV)) as u8
        })
        .collect()
}

fn looks_like_fastq(path: &Path) -> bool {
    let name = path.to_string_lossy();
    let name = name.strip_suffix(".gz").unwrap_or(&name);
    name.ends_with(".fq") || name.ends_with(".fastq")
}

/// Load reads keyed by numeric record id. FASTQ qualities are re-encoded
/// into the internal '0'-based range; FASTA records get a flat default.
pub fn load_reads(path: &Path) -> Result<HashMap<u32, (Vec<u8>, Vec<u8>)>> {
    let reader = open_maybe_gz(path)?;
    let mut out = HashMap::new();

    if looks_like_fastq(path) {
        for rec in bio::io::fastq::Reader::new(reader).records() {
            let rec = rec.with_context(|| format!("reading {}", path.display()))?;
            let iid: u32 = rec
                .id()
                .parse()
                .with_context(|| format!("{}: non-numeric read id '{}'", path.display(), rec.id()))?;
            out.insert(iid, (rec.seq().to_ascii_uppercase(), encode_qual(rec.qual())));
        }
    } else {
        for rec in bio::io::fasta::Reader::new(reader).records() {
            let rec = rec.with_context(|| format!("reading {}", path.display()))?;
            let iid: u32 = rec
                .id()
                .parse()
                .with_context(|| format!("{}: non-numeric read id '{}'", path.display(), rec.id()))?;
            let seq = rec.seq().to_ascii_uppercase();
            let quals = vec![b'0' + DEFAULT_FASTA_QV; seq.len()];
            out.insert(iid, (seq, quals));
        }
    }

    debug!("load_reads: {} reads from {}", out.len(), path.display());
    Ok(out)
}

/// Attach loaded sequences to layout skeletons. Every layout read must have
/// a sequence.
pub fn attach_reads(
    layouts: &mut [UnitigLayout],
    reads: &HashMap<u32, (Vec<u8>, Vec<u8>)>,
) -> Result<()> {
    for layout in layouts.iter_mut() {
        for r in layout.reads.iter_mut() {
            let (bases, quals) = reads
                .get(&r.iid)
                .ok_or_else(|| anyhow!("unitig {}: read {} not in reads file", layout.iid, r.iid))?;
            r.bases = bases.clone();
            r.quals = quals.clone();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(name: &str, content: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn parses_layouts() {
        let path = write_temp(
            "tigcns_layout_test.txt",
            "# comment\nunitig 7\nfrg 1 0 100\nfrg 2 150 50\nunitig 8\nfrg 3 0 80\n",
        );
        let layouts = read_layouts(&path).unwrap();
        assert_eq!(layouts.len(), 2);
        assert_eq!(layouts[0].iid, 7);
        assert_eq!(layouts[0].reads.len(), 2);
        assert_eq!(layouts[0].reads[1].begin, 150);
        assert_eq!(layouts[0].reads[1].end, 50);
        assert_eq!(layouts[1].reads.len(), 1);
    }

    #[test]
    fn rejects_frg_before_unitig() {
        let path = write_temp("tigcns_layout_bad.txt", "frg 1 0 100\n");
        assert!(read_layouts(&path).is_err());
    }

    #[test]
    fn loads_fasta_reads_with_default_quality() {
        let path = write_temp("tigcns_reads_test.fa", ">1\nACGT\n>2\nGGCC\n");
        let reads = load_reads(&path).unwrap();
        assert_eq!(reads.len(), 2);
        let (seq, qual) = &reads[&1];
        assert_eq!(seq, b"ACGT");
        assert_eq!(qual[0], b'0' + DEFAULT_FASTA_QV);
    }

    #[test]
    fn fastq_quality_is_reencoded() {
        let path = write_temp("tigcns_reads_test.fq", "@1\nACGT\n+\nIIII\n");
        let reads = load_reads(&path).unwrap();
        let (_, qual) = &reads[&1];
        // 'I' is phred 40
        assert_eq!(qual[0], b'0' + 40);
    }
}
