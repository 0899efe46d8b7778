//! CLI surface: one `clap`-derive subcommand per top-level operation,
//! mirroring the reference toolkit's pattern of a flat `Commands` enum with
//! one `Args` struct per subcommand.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::util::SamTag;

#[derive(Parser, Debug)]
#[command(name = "demux", version, about = "Barcode/spatial/adapter record processing")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Decode barcodes into per-record RG tags and split read groups.
    Decode(DecodeArgs),
    /// Build or apply a spatial-filter file from CIGAR/MD tile statistics.
    SpatialFilter(SpatialFilterArgs),
    /// Scan records for adapter contamination and paired-overlap readthrough.
    FindAdapters(FindAdaptersArgs),
    /// Excise spans from records into named tags and compact what remains.
    TagsFromSpans(TagsFromSpansArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct CommonIoArgs {
    #[arg(long)]
    pub input: String,
    #[arg(long)]
    pub output: String,
    #[arg(long, default_value = "bam")]
    pub input_fmt: String,
    #[arg(long, default_value = "bam")]
    pub output_fmt: String,
    #[arg(long, default_value_t = 6)]
    pub compression_level: u32,
    #[arg(long, default_value_t = 1)]
    pub threads: usize,
    #[arg(long)]
    pub verbose: bool,
    #[arg(long)]
    pub metrics_file: Option<PathBuf>,
    #[arg(long)]
    pub log_filepath: Option<PathBuf>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct DecodeArgs {
    #[command(flatten)]
    pub io: CommonIoArgs,
    #[arg(long)]
    pub barcode_file: PathBuf,
    #[arg(long, default_value = "BC")]
    pub barcode_tag_name: String,
    #[arg(long, default_value = "QT")]
    pub quality_tag_name: String,
    #[arg(long, default_value_t = 0)]
    pub max_low_quality_to_convert: u8,
    #[arg(long)]
    pub convert_low_quality: bool,
    #[arg(long, default_value_t = 1)]
    pub max_no_calls: usize,
    #[arg(long, default_value_t = 1)]
    pub max_mismatches: usize,
    #[arg(long, default_value_t = 1)]
    pub min_mismatch_delta: usize,
    #[arg(long)]
    pub change_read_name: bool,
    #[arg(long)]
    pub ignore_pf: bool,
    /// 1-based position to split a concatenated dual index at, instead of
    /// splitting at the first separator run.
    #[arg(long)]
    pub dual_tag: Option<usize>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct SpatialFilterArgs {
    #[command(flatten)]
    pub io: CommonIoArgs,
    /// Dump mode: prints a filter file's lane headers and exits.
    #[arg(short = 'D', default_value_t = false)]
    pub dump: bool,
    /// Create mode: scans the input, builds the region table, writes a
    /// filter file to `--output`.
    #[arg(short = 'c', default_value_t = false)]
    pub create: bool,
    /// Apply mode: reads `-F` filter file(s) and drops or flags filtered
    /// records from the input.
    #[arg(short = 'a', default_value_t = false)]
    pub apply: bool,
    #[arg(short = 'F', value_delimiter = ',')]
    pub filters: Vec<PathBuf>,
    #[arg(short = 's')]
    pub snp_file: Option<PathBuf>,
    /// Emits the per-lane promotion summary table instead of (or alongside)
    /// the filter bytes.
    #[arg(short = 'r')]
    pub report: bool,
    #[arg(long, default_value_t = 0.1)]
    pub region_mismatch_threshold: f64,
    #[arg(long, default_value_t = 0.1)]
    pub region_insertion_threshold: f64,
    #[arg(long, default_value_t = 0.1)]
    pub region_deletion_threshold: f64,
    #[arg(long, default_value_t = 2)]
    pub region_scale_factor: u32,
    #[arg(long, default_value_t = 100)]
    pub region_size: i32,
    #[arg(long, default_value_t = 1000)]
    pub coord_shift: i32,
    #[arg(long, default_value_t = 1)]
    pub coord_factor: i32,
    /// Mark filtered records QC-fail instead of dropping them, in apply mode.
    #[arg(short = 'f')]
    pub mark_qc_fail: bool,
}

#[derive(clap::Args, Debug, Clone)]
pub struct FindAdaptersArgs {
    #[command(flatten)]
    pub io: CommonIoArgs,
    #[arg(long)]
    pub adapter_file: PathBuf,
    #[arg(long, default_value_t = 10)]
    pub min_score: i32,
    #[arg(long, default_value_t = 0.5)]
    pub min_frac: f64,
    #[arg(long, default_value_t = 0.5)]
    pub min_pfrac: f64,
    #[arg(long, default_value_t = 3_000_000_000)]
    pub genome_size: u64,
}

#[derive(clap::Args, Debug, Clone)]
pub struct TagsFromSpansArgs {
    #[command(flatten)]
    pub io: CommonIoArgs,
    /// One or more `record_index:from:to:barcode_tag:quality_tag` spans, e.g.
    /// `0:1:9:BC:QT`.
    #[arg(long = "span", required = true)]
    pub spans: Vec<String>,
    #[arg(long, default_value = "reject")]
    pub collision_policy: String,
    /// Two-character tag names to copy from an emptied mate onto its
    /// surviving sibling.
    #[arg(long = "merge-keep", value_delimiter = ',')]
    pub merge_keep: Vec<String>,
}

pub fn parse_sam_tag(raw: &str) -> Result<SamTag, String> {
    SamTag::from_str(raw).map_err(|e| e.to_string())
}
