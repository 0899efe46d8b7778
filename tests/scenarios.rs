//! Cross-module end-to-end scenarios, run against the library's public API
//! the way a caller of the `demux` binary's subcommands would exercise it.

use demux_core::adapter::index::AdapterIndex;
use demux_core::adapter::matcher::{self, MatcherConfig};
use demux_core::aux_codec::{self, AuxValue};
use demux_core::barcode::decoder::{decode_template, DecoderConfig, TagHopTable};
use demux_core::barcode::table::{BarcodeTable, LoadOptions};
use demux_core::header_mutator;
use demux_core::record_stream::Template;
use demux_core::spatial::filter_codec::{lane_table_to_filter_lane, read_filter, write_filter};
use demux_core::spatial::region_table::{
    RegionTableBuilder, SpatialThresholds, DELETION, INSERTION, MISMATCH,
};
use demux_core::util::SamTag;

use rust_htslib::bam::record::{Cigar, CigarString, Record as HtsRecord};
use rust_htslib::bam::Record;
use rustc_hash::FxHashSet;

fn record_with_tags(qname: &str, seq: &[u8], tags: &[(&str, &str)]) -> Record {
    let mut r = HtsRecord::new();
    let qual = vec![35u8; seq.len()];
    r.set(qname.as_bytes(), None, seq, &qual);
    for (name, value) in tags {
        let tag = SamTag::from_str(name).unwrap();
        aux_codec::append_typed(&mut r, &tag, &AuxValue::Str(value.to_string())).unwrap();
    }
    r
}

fn load_table(lines: &str) -> BarcodeTable {
    use std::io::Write;
    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(lines.as_bytes()).unwrap();
    BarcodeTable::load(f.path(), &LoadOptions::default()).unwrap()
}

fn decoder_config(max_mismatches: usize, min_mismatch_delta: usize) -> DecoderConfig {
    DecoderConfig {
        barcode_tag: SamTag::from_str("BC").unwrap(),
        quality_tag: SamTag::from_str("QT").unwrap(),
        max_low_quality_to_convert: 0,
        convert_low_quality: false,
        max_no_calls: 1,
        max_mismatches,
        min_mismatch_delta,
        change_read_name: false,
        ignore_pf: false,
        explicit_split: None,
    }
}

// Scenario 1: exact decode.
#[test]
fn scenario_exact_decode_rewrites_rg_and_counts_perfect() {
    let mut table = load_table("h\nACGT\tA\t\t\t\nTTTT\tB\t\t\t\n");
    let mut tag_hops = TagHopTable::default();
    let config = decoder_config(1, 1);

    let mut template = Template {
        records: vec![record_with_tags("q1", b"ACGTACGT", &[("BC", "ACGT")])],
    };
    let outcome = decode_template(&mut template, &mut table, &mut tag_hops, &config).unwrap();
    assert_eq!(outcome.entry_index, 1);

    let rg = SamTag::from_str("RG").unwrap();
    assert_eq!(
        aux_codec::get_aux(&template.records[0], &rg),
        Some(AuxValue::Str("#A".to_string()))
    );
    assert_eq!(table.entries[1].counters.reads, 1);
    assert_eq!(table.entries[1].counters.perfect, 1);
    assert_eq!(table.entries[1].counters.one_mismatch, 0);
    assert!(tag_hops.entries.is_empty());
}

// Scenario 2: one mismatch accepted.
#[test]
fn scenario_one_mismatch_accepted() {
    let mut table = load_table("h\nACGT\tA\t\t\t\nTTTT\tB\t\t\t\n");
    let mut tag_hops = TagHopTable::default();
    let config = decoder_config(1, 1);

    let mut template = Template {
        records: vec![record_with_tags("q1", b"ACGTACGT", &[("BC", "ACGA")])],
    };
    decode_template(&mut template, &mut table, &mut tag_hops, &config).unwrap();
    assert_eq!(table.entries[1].counters.one_mismatch, 1);
}

// Scenario 3: ambiguous match rejected to the synthetic entry.
#[test]
fn scenario_ambiguous_match_rejected() {
    let mut table = load_table("h\nAAAA\tA\t\t\t\nAAAT\tB\t\t\t\n");
    let mut tag_hops = TagHopTable::default();
    let config = decoder_config(1, 2);

    let mut template = Template {
        records: vec![record_with_tags("q1", b"ACGTACGT", &[("BC", "AAAC")])],
    };
    let outcome = decode_template(&mut template, &mut table, &mut tag_hops, &config).unwrap();
    assert_eq!(outcome.entry_index, 0);
    assert_eq!(table.entries[0].counters.reads, 1);
}

// Scenario 4: dual-index tag hop.
#[test]
fn scenario_tag_hop_recorded_against_synthetic_entry() {
    let mut table = load_table("h\nAAAA-CCCC\tA\t\t\t\nTTTT-GGGG\tB\t\t\t\n");
    let mut tag_hops = TagHopTable::default();
    let config = decoder_config(1, 1);

    let mut template = Template {
        records: vec![record_with_tags("q1", b"ACGTACGT", &[("BC", "AAAA-GGGG")])],
    };
    let outcome = decode_template(&mut template, &mut table, &mut tag_hops, &config).unwrap();
    assert_eq!(outcome.entry_index, 0);
    assert_eq!(tag_hops.order, vec!["AAAA-GGGG".to_string()]);
    assert_eq!(tag_hops.entries["AAAA-GGGG"].counters.reads, 1);
}

// Scenario 5: adapter cut, end to end through the index/matcher pipeline.
#[test]
fn scenario_adapter_cut_tags_the_record() {
    let adapter = b"ACGTTGCAGGTCATGCAGTCGGATCAGTCAGGTACGTCA".to_vec();
    assert_eq!(adapter.len(), 39);
    let adapters = vec![("illumina".to_string(), adapter.clone())];
    let index = AdapterIndex::build(&adapters, 16);

    let mut read = b"TTTTTTTTTTTTTT".to_vec(); // 14 T's
    read.extend_from_slice(&adapter);
    read.extend_from_slice(b"GG");

    let config = MatcherConfig { min_score: 16, min_frac: 0.75, min_pfrac: 0.75, genome_size: 3_000_000_000 };
    let hit = matcher::match_read(&read, &index, &config).expect("adapter must be found");
    assert_eq!(hit.adapter_name, "illumina");
    assert!(hit.pfrac >= 0.75);

    let mut record = record_with_tags("q1", &read, &[]);
    matcher::apply_hit_tags(&mut record, &hit).unwrap();

    let aa = SamTag::from_str("aa").unwrap();
    let as_tag = SamTag::from_str("as").unwrap();
    assert_eq!(
        aux_codec::get_aux(&record, &aa),
        Some(AuxValue::Str("illumina".to_string()))
    );
    assert!(matches!(aux_codec::get_aux(&record, &as_tag), Some(AuxValue::I32(_))));
}

// Scenario 6: spatial filter create+apply identity.
#[test]
fn scenario_spatial_filter_mismatch_bit_does_not_leak_into_should_filter() {
    let mut builder = RegionTableBuilder::new(5000, 0, 1);
    let snps = FxHashSet::default();

    // A thousand single-base records landing on the same lane/tile/region/
    // cycle, every one a mismatch at its one cycle -- enough reads to clear
    // both region_min_count (for thresholds of 0.5) and the tile-level
    // minimum-reads floor, so the tile survives culling and the MISMATCH
    // bit is the only thing keeping it out of `should_filter`.
    for i in 0..1000 {
        let qname = format!("INST:{i}:FC1:1:1101:1000:2000");
        let mut record = HtsRecord::new();
        let qual = vec![30u8];
        record.set(qname.as_bytes(), Some(&CigarString(vec![Cigar::Match(1)])), b"A", &qual);
        record.set_pos(0);
        record
            .push_aux(b"MD", rust_htslib::bam::record::Aux::String("A"))
            .unwrap();
        builder.scan_record(&record, "chr1", &snps).unwrap();
    }

    let thresholds = SpatialThresholds { mismatch: 0.5, insertion: 0.5, deletion: 0.5, scale_factor: 1 };
    let lanes: Vec<_> = builder.finish(&thresholds).into_values().collect();
    assert_eq!(lanes.len(), 1);
    let lane = &lanes[0];
    assert_eq!(lane.cell(1101, 0, 0, 0).unwrap().mismatch, 1000);
    assert_ne!(lane.cell(1101, 0, 0, 0).unwrap().state & MISMATCH, 0);
    assert_eq!(lane.cell(1101, 0, 0, 0).unwrap().state & (INSERTION | DELETION), 0);

    let filter_lane = lane_table_to_filter_lane(lane);

    let mut buf = Vec::new();
    write_filter(&mut buf, "demux spatial-filter -c", std::slice::from_ref(lane)).unwrap();
    let mut cursor = std::io::Cursor::new(buf);
    let file = read_filter(&mut cursor).unwrap();
    let round_tripped = &file.lanes[0];

    // `should_filter` only checks INSERTION|DELETION, so a tile whose only
    // problem is MISMATCH is never flagged through the public apply path...
    assert!(!round_tripped.should_filter(1101, 0, 1, 0));
    assert!(!filter_lane.should_filter(1101, 0, 1, 0));

    // ...even though the MISMATCH bit is present in the raw byte plane for
    // a caller that inspects `filter_at` directly (the state-inclusive
    // apply mode the distilled spec calls out as useful for a unit test,
    // not wired up as a CLI mask).
    let state = round_tripped.filter_at(1101, 0, 0, 0).unwrap();
    assert_ne!(state & MISMATCH, 0);
}

// Header mutation round trip: one RG per barcode entry, PU/LB/SM/DS rules.
#[test]
fn header_mutation_round_trip_preserves_non_id_tags() {
    use demux_core::barcode::table::BarcodeEntry;
    use rust_htslib::bam::header::HeaderRecord;
    use rust_htslib::bam::Header;

    let mut header = Header::new();
    let mut rg = HeaderRecord::new(b"RG");
    rg.push_tag(b"ID", &"flowcell.1".to_owned());
    rg.push_tag(b"PU", &"flowcell.1".to_owned());
    header.push_record(&rg);

    let entries = vec![
        BarcodeEntry::synthetic_unassigned(4),
        BarcodeEntry {
            seq: "ACGT".to_string(),
            idx1: "ACGT".to_string(),
            idx2: String::new(),
            name: "sampleA".to_string(),
            library: "lib1".to_string(),
            sample: "s1".to_string(),
            description: "d1".to_string(),
            counters: Default::default(),
        },
    ];
    let out = header_mutator::split_read_groups_by_barcode(&header, &entries).unwrap();
    let text = String::from_utf8(out.to_bytes()).unwrap();
    let rg_lines: Vec<&str> = text.lines().filter(|l| l.starts_with("@RG")).collect();
    assert_eq!(rg_lines.len(), entries.len());
    assert!(rg_lines[1].contains("ID:flowcell.1#sampleA"));
    assert!(rg_lines[1].contains("PU:flowcell.1#sampleA"));
    assert!(rg_lines[1].contains("LB:lib1"));
}
