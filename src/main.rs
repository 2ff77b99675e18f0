use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rayon::prelude::*;

use tigcns::aligner::{DpAligner, TraceAligner};
use tigcns::layout::{attach_reads, load_reads, read_layouts};
use tigcns::unitig::multi_align_unitig;
use tigcns::{CnsOptions, MultiAlignRecord};

#[derive(Parser)]
#[command(name = "tigcns")]
#[command(about = "Multiple-sequence consensus for shotgun assembly tigs", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute consensus for every unitig in a layout
    Consensus {
        /// Layout file (unitig/frg directives, optionally .gz)
        #[arg(short = 'l', long, value_name = "LAYOUT")]
        layout: PathBuf,

        /// Reads as FASTA/FASTQ with numeric ids (optionally .gz)
        #[arg(short = 'r', long, value_name = "READS")]
        reads: PathBuf,

        /// Output FASTA of ungapped consensus sequences (default: stdout)
        #[arg(short = 'o', long, value_name = "OUT.FA")]
        output: Option<PathBuf>,

        /// Also write per-read placements to this TSV file
        #[arg(long, value_name = "TSV")]
        placements: Option<PathBuf>,

        /// Also write detected variants to this TSV file
        #[arg(long, value_name = "TSV")]
        variants: Option<PathBuf>,

        /// Worker threads; tigs are processed in parallel, never split
        #[arg(short = 't', long, value_name = "INT", default_value = "1")]
        threads: usize,

        /// Variation smoothing window
        #[arg(long, value_name = "INT", default_value = "4")]
        smooth_win: i32,

        /// Disable allele splitting during base calling
        #[arg(long)]
        no_split_alleles: bool,

        /// Alignment error rate for read placement
        #[arg(short = 'e', long, value_name = "FLOAT", default_value = "0.06")]
        error_rate: f64,

        /// Minimum accepted read/anchor overlap
        #[arg(long, value_name = "INT", default_value = "40")]
        min_overlap: usize,

        /// Skip abacus refinement of windows at least this wide
        #[arg(long, value_name = "INT", default_value = "100")]
        max_abacus_window: usize,

        /// Verbosity: 1=error 2=warn 3=info 4=debug
        #[arg(short = 'v', long, value_name = "INT", default_value = "3")]
        verbosity: u8,
    },
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 | 1 => log::LevelFilter::Error,
        2 => log::LevelFilter::Warn,
        3 => log::LevelFilter::Info,
        _ => log::LevelFilter::Debug,
    };
    env_logger::Builder::from_default_env().filter_level(level).init();
}

fn write_fasta(records: &[MultiAlignRecord], out: &mut dyn Write) -> Result<()> {
    for rec in records {
        let (seq, _) = rec.ungapped();
        writeln!(out, ">utg{}", rec.iid)?;
        for chunk in seq.chunks(70) {
            out.write_all(chunk)?;
            writeln!(out)?;
        }
    }
    Ok(())
}

fn write_placements(records: &[MultiAlignRecord], path: &PathBuf) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "#tig\tread\tbegin\tend\tndeltas")?;
    for rec in records {
        for p in &rec.placements {
            writeln!(out, "{}\t{}\t{}\t{}\t{}", rec.iid, p.iid, p.begin, p.end, p.deltas.len())?;
        }
    }
    Ok(())
}

fn write_variants(records: &[MultiAlignRecord], path: &PathBuf) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "#tig\tbegin\tend\tnreads\tnconf\tphased\talleles\tweights\tconf_reads")?;
    for rec in records {
        for v in &rec.variants {
            let alleles: Vec<String> = v
                .alleles
                .iter()
                .map(|a| String::from_utf8_lossy(&a.bases).into_owned())
                .collect();
            let weights: Vec<String> = v.alleles.iter().map(|a| a.weight.to_string()).collect();
            let conf: Vec<String> = v.conf_read_iids.iter().map(u32::to_string).collect();
            writeln!(
                out,
                "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
                rec.iid,
                v.begin,
                v.end,
                v.num_reads,
                v.num_conf_alleles,
                v.phased_with_prev as u8,
                alleles.join("/"),
                weights.join("/"),
                conf.join("/"),
            )?;
        }
    }
    Ok(())
}

fn run_consensus(
    layout_path: PathBuf,
    reads_path: PathBuf,
    output: Option<PathBuf>,
    placements: Option<PathBuf>,
    variants: Option<PathBuf>,
    threads: usize,
    opt: CnsOptions,
) -> Result<()> {
    let mut layouts = read_layouts(&layout_path)?;
    let reads = load_reads(&reads_path)?;
    attach_reads(&mut layouts, &reads)?;

    if threads > 1 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .context("building thread pool")?;
    }

    log::info!("processing {} unitigs on {} thread(s)", layouts.len(), threads.max(1));

    // one session per tig; parallelism stops at the tig boundary
    let results: Vec<(u32, Result<MultiAlignRecord>)> = layouts
        .par_iter()
        .map(|layout| {
            let dp = DpAligner;
            let aligners: [&dyn TraceAligner; 1] = [&dp];
            (layout.iid, multi_align_unitig(layout, &aligners, &opt))
        })
        .collect();

    let mut records = Vec::new();
    let mut failures = 0usize;
    for (iid, res) in results {
        match res {
            Ok(rec) => records.push(rec),
            Err(e) => {
                log::error!("unitig {iid} failed: {e}");
                failures += 1;
            }
        }
    }

    match output {
        Some(path) => {
            let mut out = BufWriter::new(File::create(&path)?);
            write_fasta(&records, &mut out)?;
        }
        None => {
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            write_fasta(&records, &mut out)?;
        }
    }
    if let Some(path) = placements {
        write_placements(&records, &path)?;
    }
    if let Some(path) = variants {
        write_variants(&records, &path)?;
    }

    log::info!("{} unitigs finished, {} failed", records.len(), failures);
    if failures > 0 {
        anyhow::bail!("{failures} unitig(s) failed");
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Consensus {
            layout,
            reads,
            output,
            placements,
            variants,
            threads,
            smooth_win,
            no_split_alleles,
            error_rate,
            min_overlap,
            max_abacus_window,
            verbosity,
        } => {
            init_logging(verbosity);

            let opt = CnsOptions {
                split_alleles: !no_split_alleles,
                smooth_win,
                error_rate,
                min_overlap,
                max_abacus_window,
                ..CnsOptions::default()
            };

            run_consensus(layout, reads, output, placements, variants, threads, opt)
        }
    }
}
