//! Thin CLI binary: parses a subcommand, initializes logging, and wires the
//! library's record stream / worker pool / per-subcommand processing
//! together. Exit code 0 on success, 1 on failure, matching §6.

use std::fs::File;
use std::io::{BufWriter, Write as _};
use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, warn};
use rust_htslib::bam;
use rustc_hash::FxHashSet;

use demux_core::adapter::index::AdapterIndex;
use demux_core::adapter::matcher::{self, MatcherConfig};
use demux_core::adapter::metrics::AdapterMetricsTable;
use demux_core::aux_codec::{self, AuxValue};
use demux_core::barcode::decoder::{self, DecoderConfig, TagHopTable};
use demux_core::barcode::metrics::BarcodeMetricsWriter;
use demux_core::barcode::table::{BarcodeTable, LoadOptions};
use demux_core::cli::{
    Cli, Commands, CommonIoArgs, DecodeArgs, FindAdaptersArgs, SpatialFilterArgs, TagsFromSpansArgs,
};
use demux_core::header_mutator;
use demux_core::logging;
use demux_core::read_to_tags::{self, CollisionPolicy, Span, TagSpan};
use demux_core::record_stream::{RecordStream, Template};
use demux_core::spatial::filter_codec::{self, FilterFile};
use demux_core::spatial::region_table::{
    self, RegionTableBuilder, SpatialThresholds,
};
use demux_core::util::SamTag;
use demux_core::worker_pool::{self, Accumulator};
use demux_core::writers::OutWriter;

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Decode(args) => run_decode(args),
        Commands::SpatialFilter(args) => run_spatial_filter(args),
        Commands::FindAdapters(args) => run_find_adapters(args),
        Commands::TagsFromSpans(args) => run_tags_from_spans(args),
    }
}

fn output_format(raw: &str) -> Result<bam::Format> {
    match raw.to_ascii_lowercase().as_str() {
        "bam" => Ok(bam::Format::Bam),
        "sam" => Ok(bam::Format::Sam),
        "cram" => Ok(bam::Format::Cram),
        other => bail!("unsupported output format {other}"),
    }
}

fn open_writer(
    io: &CommonIoArgs,
    header: &bam::Header,
) -> Result<bam::Writer> {
    demux_core::util::create_out_directory(&io.output)?;
    let fmt = output_format(&io.output_fmt)?;
    let writer = bam::Writer::from_path(&io.output, header, fmt)
        .with_context(|| format!("opening output {}", io.output))?;
    Ok(writer)
}

#[derive(Clone)]
struct NullAccumulator;
impl Accumulator for NullAccumulator {
    fn merge(&mut self, _other: Self) {}
}

fn batches_from_stream(stream: &mut RecordStream, threads: usize) -> Result<Vec<Vec<Template>>> {
    let batch_size = if threads <= 1 { usize::MAX } else { 64 };
    let spinner = demux_core::util::get_spinner();
    spinner.set_message("reading templates");
    let mut batches = Vec::new();
    let mut current = Vec::new();
    for template in stream.templates() {
        current.push(template.map_err(anyhow::Error::from)?);
        spinner.inc(1);
        if current.len() >= batch_size {
            batches.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }
    spinner.finish_with_message("done reading");
    Ok(batches)
}

fn write_templates(writer: &mut bam::Writer, templates: &[Template]) -> Result<()> {
    for template in templates {
        for record in &template.records {
            writer.write(record)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------
// decode
// ---------------------------------------------------------------------

#[derive(Clone)]
struct DecodeAccumulator {
    table: BarcodeTable,
    tag_hops: TagHopTable,
}

impl Accumulator for DecodeAccumulator {
    fn merge(&mut self, other: Self) {
        for (i, entry) in other.table.entries.into_iter().enumerate() {
            if let Some(mine) = self.table.entries.get_mut(i) {
                mine.counters.merge(&entry.counters);
            }
        }
        self.tag_hops.merge(other.tag_hops);
    }
}

fn run_decode(args: DecodeArgs) -> Result<()> {
    logging::init_logging("decode", args.io.log_filepath.as_deref(), args.io.verbose)?;
    info!("loading barcode file {}", args.barcode_file.display());

    let table = BarcodeTable::load(
        &args.barcode_file,
        &LoadOptions { explicit_split: args.dual_tag },
    )?;

    let config = DecoderConfig {
        barcode_tag: SamTag::from_str(&args.barcode_tag_name)?,
        quality_tag: SamTag::from_str(&args.quality_tag_name)?,
        max_low_quality_to_convert: args.max_low_quality_to_convert,
        convert_low_quality: args.convert_low_quality,
        max_no_calls: args.max_no_calls,
        max_mismatches: args.max_mismatches,
        min_mismatch_delta: args.min_mismatch_delta,
        change_read_name: args.change_read_name,
        ignore_pf: args.ignore_pf,
        explicit_split: args.dual_tag,
    };

    let mut stream = RecordStream::from_path(&args.io.input)?;
    let header_view = stream.header();
    let in_header = bam::Header::from_template(&header_view);
    let out_header = header_mutator::split_read_groups_by_barcode(&in_header, &table.entries)?;
    let mut writer = open_writer(&args.io, &out_header)?;

    let batches = batches_from_stream(&mut stream, args.io.threads)?;
    let seed = DecodeAccumulator { table, tag_hops: TagHopTable::default() };
    let (out, result) = worker_pool::run(args.io.threads, batches, seed, move |template, acc| {
        decoder::decode_template(template, &mut acc.table, &mut acc.tag_hops, &config)
            .map(|_| ())
    })
    .map_err(anyhow::Error::from)?;

    write_templates(&mut writer, &out)?;

    if let Some(path) = &args.io.metrics_file {
        let file = File::create(path)?;
        let mut metrics_writer = BarcodeMetricsWriter::new(file);
        metrics_writer.write((&result.table, &result.tag_hops))?;
    }
    info!("decode complete: {} templates", out.len());
    Ok(())
}

// ---------------------------------------------------------------------
// spatial-filter
// ---------------------------------------------------------------------

fn load_snp_positions(path: &Path) -> Result<FxHashSet<String>> {
    let text = std::fs::read_to_string(path)?;
    let mut set = FxHashSet::default();
    for line in text.lines() {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 3 {
            continue;
        }
        set.insert(format!("{}:{}", fields[1], fields[2]));
    }
    Ok(set)
}

fn run_spatial_filter(args: SpatialFilterArgs) -> Result<()> {
    logging::init_logging("spatial-filter", args.io.log_filepath.as_deref(), args.io.verbose)?;

    let mode_count = [args.dump, args.create, args.apply].iter().filter(|b| **b).count();
    if mode_count != 1 {
        bail!("exactly one of -D/-c/-a must be given");
    }

    if args.dump {
        let mut file = File::open(&args.io.input)?;
        let filter = filter_codec::read_filter(&mut file).map_err(anyhow::Error::from)?;
        for lane in &filter.lanes {
            println!(
                "lane={} tiles={} nregions={} region_size={} nreads={}",
                lane.lane,
                lane.tiles.len(),
                lane.region_index_map.len(),
                lane.region_size,
                lane.nreads,
            );
        }
        return Ok(());
    }

    if args.create {
        let snps = match &args.snp_file {
            Some(p) => load_snp_positions(p)?,
            None => FxHashSet::default(),
        };
        let mut stream = RecordStream::from_path(&args.io.input)?;
        let header_view = stream.header();
        let mut builder =
            RegionTableBuilder::new(args.region_size, args.coord_shift, args.coord_factor);
        let ticker = demux_core::util::get_ticker();
        ticker.set_message("scanning records");
        while let Some(record) = stream.next().map_err(anyhow::Error::from)? {
            let chrom = if record.tid() >= 0 {
                String::from_utf8_lossy(header_view.tid2name(record.tid() as u32)).to_string()
            } else {
                String::new()
            };
            builder.scan_record(&record, &chrom, &snps).map_err(anyhow::Error::from)?;
            ticker.inc(1);
        }
        ticker.finish_with_message("scan complete");

        let thresholds = SpatialThresholds {
            mismatch: args.region_mismatch_threshold,
            insertion: args.region_insertion_threshold,
            deletion: args.region_deletion_threshold,
            scale_factor: args.region_scale_factor,
        };
        let mut lanes: Vec<_> = builder.finish(&thresholds).into_values().collect();
        lanes.sort_by_key(|l| l.lane);

        if args.report {
            let mut tab = demux_core::util::get_human_readable_table();
            tab.set_titles(prettytable::Row::new(
                ["lane", "tiles", "nregions_x", "nregions_y", "total_reads"]
                    .iter()
                    .map(|h| prettytable::Cell::new(h))
                    .collect(),
            ));
            for lane in &lanes {
                tab.add_row(prettytable::Row::new(
                    [
                        lane.lane.to_string(),
                        lane.tiles.len().to_string(),
                        lane.nregions_x.to_string(),
                        lane.nregions_y.to_string(),
                        lane.total_reads().to_string(),
                    ]
                    .iter()
                    .map(|f| prettytable::Cell::new(f))
                    .collect(),
                ));
            }
            tab.printstd();
        }

        let command_line = std::env::args().collect::<Vec<_>>().join(" ");
        let out = File::create(&args.io.output)?;
        let mut w = BufWriter::new(out);
        filter_codec::write_filter(&mut w, &command_line, &lanes).map_err(anyhow::Error::from)?;
        w.flush()?;
        info!("spatial filter created: {} lanes", lanes.len());
        return Ok(());
    }

    // apply
    let mut all_lanes = Vec::new();
    for path in &args.filters {
        let mut f = File::open(path)?;
        let file = filter_codec::read_filter(&mut f).map_err(anyhow::Error::from)?;
        let (kept, discarded) = filter_codec::discard_insufficient_lanes(file);
        for lane in &discarded {
            info!("lane {lane} discarded: insufficient reads");
        }
        all_lanes.extend(kept.lanes);
    }
    let filter = FilterFile { lanes: all_lanes };

    let mut stream = RecordStream::from_path(&args.io.input)?;
    let header_view = stream.header();
    let header = bam::Header::from_template(&header_view);
    let mut writer = open_writer(&args.io, &header)?;

    let mut kept = 0u64;
    let mut flagged = 0u64;
    let mut unfiltered_tiles = FxHashSet::default();
    while let Some(mut record) = stream.next().map_err(anyhow::Error::from)? {
        let qname = String::from_utf8_lossy(record.qname()).to_string();
        let filtered = region_table::parse_qname_coords(&qname).and_then(|(lane, tile, x, y)| {
            filter.lanes.iter().find(|l| l.lane == lane).map(|fl| {
                if !fl.has_tile(tile) {
                    if unfiltered_tiles.insert((lane, tile)) {
                        warn!(
                            "lane {lane} tile {tile}: no filter data (culled for insufficient \
                             reads, or never observed at create time); passing through unfiltered"
                        );
                    }
                    return false;
                }
                let (rx, ry) = region_table::region_coords_for(
                    x,
                    y,
                    fl.coord_shift,
                    fl.coord_factor,
                    fl.region_size,
                );
                let region = (rx as i32) * fl.nregions_y + ry as i32;
                let read = if !record.is_paired() {
                    0
                } else if record.is_first_in_template() {
                    1
                } else {
                    2
                };
                fl.should_filter(tile, read, record.seq_len(), region)
            })
        }).unwrap_or(false);

        if filtered {
            if args.mark_qc_fail {
                record.set_quality_check_failed();
                writer.write(&record)?;
                flagged += 1;
            }
        } else {
            writer.write(&record)?;
            kept += 1;
        }
    }
    info!("spatial filter apply complete: kept={kept} flagged={flagged}");
    Ok(())
}

// ---------------------------------------------------------------------
// find-adapters
// ---------------------------------------------------------------------

#[derive(Clone)]
struct AdapterAccumulator {
    index: AdapterIndex,
    config: MatcherConfig,
    metrics: AdapterMetricsTable,
}

impl Accumulator for AdapterAccumulator {
    fn merge(&mut self, other: Self) {
        self.metrics.merge(other.metrics);
    }
}

fn read_group_of(record: &bam::Record) -> String {
    match aux_codec::get_aux(record, &SamTag::from_str("RG").unwrap()) {
        Some(AuxValue::Str(s)) => s,
        _ => "unknown".to_string(),
    }
}

fn run_find_adapters(args: FindAdaptersArgs) -> Result<()> {
    logging::init_logging("find-adapters", args.io.log_filepath.as_deref(), args.io.verbose)?;

    let text = std::fs::read_to_string(&args.adapter_file)?;
    let index = AdapterIndex::load_fasta(&text, args.min_score as usize)
        .map_err(anyhow::Error::from)?;
    let config = MatcherConfig {
        min_score: args.min_score,
        min_frac: args.min_frac,
        min_pfrac: args.min_pfrac,
        genome_size: args.genome_size,
    };

    let mut stream = RecordStream::from_path(&args.io.input)?;
    let header_view = stream.header();
    let header = bam::Header::from_template(&header_view);
    let mut writer = open_writer(&args.io, &header)?;

    let batches = batches_from_stream(&mut stream, args.io.threads)?;
    let seed = AdapterAccumulator { index, config, metrics: AdapterMetricsTable::default() };
    let (out, result) = worker_pool::run(args.io.threads, batches, seed, move |template, acc| {
        process_adapter_template(template, acc)
    })
    .map_err(anyhow::Error::from)?;

    write_templates(&mut writer, &out)?;

    if let Some(path) = &args.io.metrics_file {
        let mut file = File::create(path)?;
        let tab = demux_core::adapter::metrics::human_readable_table(&result.metrics);
        tab.print(&mut file)?;
    }
    info!("find-adapters complete: {} templates", out.len());
    Ok(())
}

fn process_adapter_template(
    template: &mut Template,
    acc: &mut AdapterAccumulator,
) -> demux_core::errors::DemuxResult<()> {
    for record in template.records.iter_mut() {
        let seq = record.seq().as_bytes();
        let rg = read_group_of(record);
        let is_read2 = record.is_paired() && !record.is_first_in_template();
        let hit = matcher::match_read(&seq, &acc.index, &acc.config);
        let matched = hit.is_some();
        let seqstart = hit.as_ref().map(|h| h.seqstart).unwrap_or(0);
        if let Some(hit) = &hit {
            matcher::apply_hit_tags(record, hit)?;
        }
        let metrics = acc.metrics.entry(&rg);
        if is_read2 {
            metrics.record_reverse(matched, seqstart);
        } else {
            metrics.record_forward(matched, seqstart);
        }
    }

    if template.records.len() == 2 {
        let seq1 = template.records[0].seq().as_bytes();
        let seq2 = template.records[1].seq().as_bytes();
        if let Some(overlap) = matcher::find_paired_overlap(&seq1, &seq2) {
            let (left, right) = template.records.split_at_mut(1);
            matcher::apply_paired_overlap_tags(&mut left[0], &mut right[0], &overlap)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------
// tags-from-spans
// ---------------------------------------------------------------------

fn parse_collision_policy(raw: &str) -> Result<CollisionPolicy> {
    match raw.to_ascii_lowercase().as_str() {
        "reject" => Ok(CollisionPolicy::Reject),
        "overwrite" => Ok(CollisionPolicy::Overwrite),
        "concatenate" => Ok(CollisionPolicy::Concatenate),
        other => bail!("unknown collision policy {other}"),
    }
}

fn parse_span(raw: &str) -> Result<TagSpan> {
    let parts: Vec<&str> = raw.split(':').collect();
    if parts.len() != 5 {
        bail!("span {raw:?} must have form record_index:from:to:barcode_tag:quality_tag");
    }
    let record_index: u8 = parts[0].parse().context("parsing record_index")?;
    let from: usize = parts[1].parse().context("parsing from")?;
    let to: usize = parts[2].parse().context("parsing to")?;
    let barcode_tag = SamTag::from_str(parts[3]).map_err(anyhow::Error::from)?;
    let quality_tag = SamTag::from_str(parts[4]).map_err(anyhow::Error::from)?;
    Ok(TagSpan { span: Span { record_index, from, to }, barcode_tag, quality_tag })
}

fn run_tags_from_spans(args: TagsFromSpansArgs) -> Result<()> {
    logging::init_logging("tags-from-spans", args.io.log_filepath.as_deref(), args.io.verbose)?;

    let spans: Vec<TagSpan> =
        args.spans.iter().map(|s| parse_span(s)).collect::<Result<_>>()?;
    let policy = parse_collision_policy(&args.collision_policy)?;
    let merge_keep: Vec<SamTag> = args
        .merge_keep
        .iter()
        .map(|s| SamTag::from_str(s).map_err(anyhow::Error::from))
        .collect::<Result<_>>()?;

    let mut stream = RecordStream::from_path(&args.io.input)?;
    let header_view = stream.header();
    let header = bam::Header::from_template(&header_view);
    let mut writer = open_writer(&args.io, &header)?;

    let batches = batches_from_stream(&mut stream, args.io.threads)?;
    let (out, _) = worker_pool::run(args.io.threads, batches, NullAccumulator, move |template, _| {
        read_to_tags::apply_spans(template, &spans, policy, &merge_keep)
    })
    .map_err(anyhow::Error::from)?;

    write_templates(&mut writer, &out)?;
    info!("tags-from-spans complete: {} templates", out.len());
    Ok(())
}
