//! Region Table and state promotion. CIGAR/MD are walked together by a
//! small two-pointer state machine (per the redesign note: no pointer
//! arithmetic over sentinel character sets, a plain `(op, len)` walk) to
//! build a per-cycle classification array, which two-phase region
//! discovery then folds into per-(lane,tile,read,cycle,region) cells.

use std::collections::HashMap;

use indexmap::IndexMap;
use log::warn;
use rust_htslib::bam::record::{Aux, Cigar};
use rust_htslib::bam::Record;
use rustc_hash::FxHashSet;

use crate::errors::{DemuxError, DemuxResult};

pub const COVERAGE: u8 = 1 << 0;
pub const MISMATCH: u8 = 1 << 1;
pub const INSERTION: u8 = 1 << 2;
pub const DELETION: u8 = 1 << 3;
pub const SOFT_CLIP: u8 = 1 << 4;
pub const BAD: u8 = 1 << 5;

const TILE_REGION_THRESHOLD: f64 = 0.75;
const N_READS_PRESENT: u64 = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum Call {
    #[default]
    None,
    Align,
    Mismatch,
    Insertion,
    KnownSnp,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RegionCell {
    pub align: u32,
    pub mismatch: u32,
    pub insertion: u32,
    pub deletion: u32,
    pub soft_clip: u32,
    pub known_snp: u32,
    pub quality_sum: u64,
    pub state: u8,
}

impl RegionCell {
    pub fn n(&self) -> u32 {
        self.align + self.insertion + self.deletion + self.soft_clip + self.known_snp
    }

    fn absorb(&mut self, other: &RegionCell) {
        self.align += other.align;
        self.mismatch += other.mismatch;
        self.insertion += other.insertion;
        self.deletion += other.deletion;
        self.soft_clip += other.soft_clip;
        self.known_snp += other.known_snp;
        self.quality_sum += other.quality_sum;
    }
}

#[derive(Debug, Clone, Copy)]
enum MdOp {
    Match(u32),
    Mismatch,
    Del(u32),
}

fn parse_md(md: &str) -> Vec<MdOp> {
    let bytes = md.as_bytes();
    let mut ops = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i].is_ascii_digit() {
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            let n: u32 = md[start..i].parse().unwrap_or(0);
            ops.push(MdOp::Match(n));
        } else if bytes[i] == b'^' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_alphabetic() {
                i += 1;
            }
            ops.push(MdOp::Del((i - start) as u32));
        } else if bytes[i].is_ascii_alphabetic() {
            ops.push(MdOp::Mismatch);
            i += 1;
        } else {
            i += 1;
        }
    }
    ops
}

/// Walks CIGAR and MD together, producing one `Call` per read cycle plus a
/// per-cycle deletion flag (deletions consume no read base, so they are
/// attributed to the read position immediately preceding the gap).
fn classify_record(
    record: &Record,
    snp_positions: &FxHashSet<String>,
    chrom: &str,
) -> DemuxResult<(Vec<Call>, Vec<bool>)> {
    let read_len = record.seq_len();
    let mut calls = vec![Call::None; read_len];
    let mut deletions = vec![false; read_len];

    let md = match record.aux(b"MD") {
        Ok(Aux::String(s)) => s.to_string(),
        _ => String::new(),
    };
    let md_ops = parse_md(&md);
    let mut md_idx = 0usize;
    let mut md_remaining = 0u32;
    let mut current_is_mismatch = false;

    let mut read_pos = 0usize;
    let mut ref_pos = record.pos();

    for c in record.cigar().iter() {
        match *c {
            Cigar::SoftClip(len) => {
                // left as Call::None, the soft-clip sentinel; only read_pos advances.
                read_pos += len as usize;
            }
            Cigar::Ins(len) => {
                for _ in 0..len {
                    if read_pos < read_len {
                        calls[read_pos] = Call::Insertion;
                    }
                    read_pos += 1;
                }
            }
            Cigar::Match(len) | Cigar::Equal(len) | Cigar::Diff(len) => {
                let mut remaining = len;
                while remaining > 0 {
                    if md_remaining == 0 {
                        match md_ops.get(md_idx) {
                            Some(MdOp::Match(n)) => {
                                md_remaining = *n;
                                current_is_mismatch = false;
                                md_idx += 1;
                            }
                            Some(MdOp::Mismatch) => {
                                md_remaining = 1;
                                current_is_mismatch = true;
                                md_idx += 1;
                            }
                            Some(MdOp::Del(_)) => {
                                md_idx += 1;
                                continue;
                            }
                            None => {
                                md_remaining = remaining;
                                current_is_mismatch = false;
                            }
                        }
                    }
                    let take = remaining.min(md_remaining.max(1));
                    for _ in 0..take {
                        if read_pos < read_len {
                            let is_snp = snp_positions
                                .contains(&format!("{chrom}:{ref_pos}"));
                            calls[read_pos] = if is_snp {
                                Call::KnownSnp
                            } else if current_is_mismatch {
                                Call::Mismatch
                            } else {
                                Call::Align
                            };
                        }
                        read_pos += 1;
                        ref_pos += 1;
                    }
                    md_remaining = md_remaining.saturating_sub(take);
                    remaining -= take;
                }
            }
            Cigar::Del(len) | Cigar::RefSkip(len) => {
                if read_pos > 0 && read_pos - 1 < read_len {
                    deletions[read_pos - 1] = true;
                }
                ref_pos += len as i64;
                if matches!(md_ops.get(md_idx), Some(MdOp::Del(_))) {
                    md_idx += 1;
                }
            }
            Cigar::HardClip(_) | Cigar::Pad(_) => {}
        }
    }

    Ok((calls, deletions))
}

#[derive(Debug)]
struct ScanEvent {
    tile: i32,
    read: u8,
    rx: u32,
    ry: u32,
    cells: Vec<RegionCell>, // one per cycle, to be folded in
}

#[derive(Debug, Clone)]
pub struct SpatialThresholds {
    pub mismatch: f64,
    pub insertion: f64,
    pub deletion: f64,
    pub scale_factor: u32,
}

#[derive(Debug)]
pub struct LaneRegionTable {
    pub lane: i32,
    pub coord_shift: i32,
    pub coord_factor: i32,
    pub region_size: i32,
    pub nregions_x: u32,
    pub nregions_y: u32,
    pub read_lengths: [u32; 3],
    /// tile -> read -> cycle -> region cells (dense grid, row-major rx*ny+ry).
    pub tiles: IndexMap<i32, Vec<Vec<Vec<RegionCell>>>>,
    /// Region grid indices that received at least one scan event; every
    /// other index is unobserved and maps to -1 in the filter file.
    pub observed_regions: FxHashSet<u32>,
}

impl LaneRegionTable {
    pub fn nregions(&self) -> usize {
        (self.nregions_x * self.nregions_y) as usize
    }

    pub fn cell(&self, tile: i32, read: usize, cycle: usize, region: usize) -> Option<&RegionCell> {
        self.tiles.get(&tile)?.get(read)?.get(cycle)?.get(region)
    }

    pub fn total_reads(&self) -> u64 {
        self.tiles
            .values()
            .flat_map(|per_read| per_read.iter())
            .flat_map(|cycles| cycles.iter())
            .flat_map(|regions| regions.iter())
            .map(|c| c.n() as u64)
            .sum()
    }

    /// True if `cull_bad_tiles` marked every cell of this tile `BAD`
    /// (insufficient reads). Consulted by the filter-file writer, which
    /// substitutes tile number -1 for a culled tile per §7.
    pub fn tile_is_culled(&self, tile: i32) -> bool {
        let Some(per_read) = self.tiles.get(&tile) else {
            return false;
        };
        let mut saw_cell = false;
        for cell in per_read
            .iter()
            .flat_map(|cycles| cycles.iter())
            .flat_map(|regions| regions.iter())
        {
            saw_cell = true;
            if cell.state & BAD == 0 {
                return false;
            }
        }
        saw_cell
    }

    pub fn tile_read_count(&self, tile: i32) -> u64 {
        self.tiles
            .get(&tile)
            .map(|per_read| {
                per_read
                    .iter()
                    .flat_map(|cycles| cycles.iter())
                    .flat_map(|regions| regions.iter())
                    .map(|c| c.n() as u64)
                    .sum()
            })
            .unwrap_or(0)
    }
}

pub struct RegionTableBuilder {
    region_size: i32,
    coord_shift: i32,
    coord_factor: i32,
    events: HashMap<i32, Vec<ScanEvent>>, // lane -> events
    read_lengths: HashMap<i32, [u32; 3]>,
    tile_seen: HashMap<i32, std::collections::HashSet<i32>>,
}

/// Standalone region-grid coordinate computation, shared by the create-side
/// builder and the apply-side filter lookup so both compute the same `(rx,
/// ry)` for a given `(x, y)` cluster coordinate.
pub fn region_coords_for(
    x: i32,
    y: i32,
    coord_shift: i32,
    coord_factor: i32,
    region_size: i32,
) -> (u32, u32) {
    let coord_factor = coord_factor.max(1);
    let region_size = region_size.max(1);
    let nx = ((x - coord_shift) / coord_factor / region_size).max(0) as u32;
    let ny = ((y - coord_shift) / coord_factor / region_size).max(0) as u32;
    (nx, ny)
}

pub fn parse_qname_coords(qname: &str) -> Option<(i32, i32, i32, i32)> {
    let trimmed = qname.split(['/', ' ']).next().unwrap_or(qname);
    let parts: Vec<&str> = trimmed.split(':').collect();
    if parts.len() < 4 {
        return None;
    }
    let n = parts.len();
    let lane = parts[n - 4].parse().ok()?;
    let tile = parts[n - 3].parse().ok()?;
    let x = parts[n - 2].parse().ok()?;
    let y = parts[n - 1].parse().ok()?;
    Some((lane, tile, x, y))
}

impl RegionTableBuilder {
    pub fn new(region_size: i32, coord_shift: i32, coord_factor: i32) -> Self {
        Self {
            region_size: region_size.max(1),
            coord_shift,
            coord_factor: coord_factor.max(1),
            events: HashMap::new(),
            read_lengths: HashMap::new(),
            tile_seen: HashMap::new(),
        }
    }

    fn region_coords(&self, x: i32, y: i32) -> (u32, u32) {
        region_coords_for(x, y, self.coord_shift, self.coord_factor, self.region_size)
    }

    /// Scans one record into the builder's event list. Skips records that
    /// are unmapped, QC-fail, secondary, supplementary, or paired-but-not
    /// proper, per §4.6.
    pub fn scan_record(
        &mut self,
        record: &Record,
        chrom: &str,
        snp_positions: &FxHashSet<String>,
    ) -> DemuxResult<()> {
        if record.is_unmapped()
            || record.is_quality_check_failed()
            || record.is_secondary()
            || record.is_supplementary()
            || (record.is_paired() && !record.is_proper_pair())
        {
            return Ok(());
        }

        let qname = String::from_utf8_lossy(record.qname()).to_string();
        let Some((lane, tile, x, y)) = parse_qname_coords(&qname) else {
            return Err(DemuxError::InvalidQueryName(qname));
        };

        let read: u8 = if !record.is_paired() {
            0
        } else if record.is_first_in_template() {
            1
        } else {
            2
        };

        let read_len = record.seq_len();
        let lengths = self.read_lengths.entry(lane).or_insert([0u32; 3]);
        if read as usize >= 3 {
            return Err(DemuxError::Format(
                "spatial filter supports at most 3 read positions".to_string(),
            ));
        }
        lengths[read as usize] = lengths[read as usize].max(read_len as u32);

        let (calls, deletions) = classify_record(record, snp_positions, chrom)?;
        let qual = record.qual();
        let mut cells = vec![RegionCell::default(); read_len];
        for i in 0..read_len {
            let cell = &mut cells[i];
            match calls[i] {
                Call::Align => {
                    cell.align += 1;
                    cell.quality_sum += qual.get(i).copied().unwrap_or(0) as u64;
                }
                Call::Mismatch => {
                    cell.mismatch += 1;
                    cell.quality_sum += qual.get(i).copied().unwrap_or(0) as u64;
                }
                Call::Insertion => {
                    cell.insertion += 1;
                    cell.quality_sum += qual.get(i).copied().unwrap_or(0) as u64;
                }
                Call::KnownSnp => {
                    cell.known_snp += 1;
                    cell.quality_sum += qual.get(i).copied().unwrap_or(0) as u64;
                }
                Call::None => {
                    cell.soft_clip += 1;
                    cell.quality_sum += qual.get(i).copied().unwrap_or(0) as u64;
                }
            }
            if deletions[i] {
                cell.deletion += 1;
            }
        }

        let (rx, ry) = self.region_coords(x, y);
        self.tile_seen.entry(lane).or_default().insert(tile);
        self.events.entry(lane).or_default().push(ScanEvent {
            tile,
            read,
            rx,
            ry,
            cells,
        });
        Ok(())
    }

    /// Phase two: now that every event is in hand, determine each lane's
    /// region grid size once, allocate dense cycle-indexed cells exactly
    /// once, fold events in, then run state promotion.
    pub fn finish(
        self,
        thresholds: &SpatialThresholds,
    ) -> HashMap<i32, LaneRegionTable> {
        let mut out = HashMap::new();
        for (lane, events) in self.events {
            let nregions_x =
                events.iter().map(|e| e.rx).max().map(|m| m + 1).unwrap_or(1);
            let nregions_y =
                events.iter().map(|e| e.ry).max().map(|m| m + 1).unwrap_or(1);
            let nregions = (nregions_x * nregions_y) as usize;
            let read_lengths =
                self.read_lengths.get(&lane).copied().unwrap_or([0; 3]);

            let mut tiles: IndexMap<i32, Vec<Vec<Vec<RegionCell>>>> =
                IndexMap::new();
            for tile in self.tile_seen.get(&lane).into_iter().flatten() {
                let per_read = (0..3)
                    .map(|r| {
                        let len = read_lengths[r] as usize;
                        vec![vec![RegionCell::default(); nregions]; len]
                    })
                    .collect::<Vec<_>>();
                tiles.insert(*tile, per_read);
            }

            let mut observed_regions = FxHashSet::default();
            for event in &events {
                observed_regions.insert(event.rx * nregions_y + event.ry);
            }

            for event in events {
                let region_idx = (event.rx * nregions_y + event.ry) as usize;
                if let Some(per_read) = tiles.get_mut(&event.tile) {
                    let cycles = &mut per_read[event.read as usize];
                    for (cycle, cell) in event.cells.into_iter().enumerate() {
                        if let Some(target) = cycles.get_mut(cycle) {
                            target[region_idx].absorb(&cell);
                        }
                    }
                }
            }

            let mut lane_table = LaneRegionTable {
                lane,
                coord_shift: self.coord_shift,
                coord_factor: self.coord_factor,
                region_size: self.region_size,
                nregions_x,
                nregions_y,
                read_lengths,
                tiles,
                observed_regions,
            };
            promote_states(&mut lane_table, thresholds);
            cull_bad_tiles(&mut lane_table);
            out.insert(lane, lane_table);
        }
        out
    }
}

fn region_min_count(thresholds: &SpatialThresholds) -> u32 {
    let min_t = thresholds
        .mismatch
        .min(thresholds.insertion)
        .min(thresholds.deletion);
    if min_t <= 0.0 {
        return u32::MAX;
    }
    (2.0 / min_t).ceil() as u32
}

fn avg_reads_per_region(table: &LaneRegionTable) -> f64 {
    let total_reads: u64 = table
        .tiles
        .values()
        .flat_map(|per_read| per_read.iter())
        .flat_map(|cycles| cycles.iter())
        .flat_map(|regions| regions.iter())
        .map(|c| c.n() as u64)
        .sum();
    let nregions = table.nregions().max(1);
    let n_region_slots: u64 = table
        .tiles
        .values()
        .map(|per_read| per_read.iter().map(|cycles| cycles.len()).sum::<usize>())
        .sum::<usize>() as u64
        * nregions as u64;
    if n_region_slots == 0 {
        0.0
    } else {
        total_reads as f64 / n_region_slots as f64
    }
}

/// Implements §4.6 state promotion: per-cell thresholding plus the
/// per-tile/per-cycle majority rule. Region enlargement (step 2) repeatedly
/// aggregates `scale_factor × scale_factor` blocks of cells until the
/// lane-wide average reads-per-region clears `region_min_count`, capping
/// once the whole tile collapses to a single region (`enlarge_regions`
/// becomes a no-op at that point, so the loop always terminates).
fn promote_states(table: &mut LaneRegionTable, thresholds: &SpatialThresholds) {
    let min_count = region_min_count(thresholds);

    if thresholds.scale_factor > 1 {
        while avg_reads_per_region(table) < min_count as f64
            && (table.nregions_x > 1 || table.nregions_y > 1)
        {
            let before = (table.nregions_x, table.nregions_y);
            enlarge_regions(table, thresholds.scale_factor);
            if (table.nregions_x, table.nregions_y) == before {
                break;
            }
        }
    }

    let min_count = min_count as f64;
    for per_read in table.tiles.values_mut() {
        for cycles in per_read.iter_mut() {
            for regions in cycles.iter_mut() {
                for cell in regions.iter_mut() {
                    let n = cell.n();
                    let n_prime = (n as f64).max(min_count);
                    let mut state = 0u8;
                    if (n as f64) < min_count {
                        state |= COVERAGE;
                    }
                    if cell.mismatch as f64 / n_prime >= thresholds.mismatch {
                        state |= MISMATCH;
                    }
                    if cell.insertion as f64 / n_prime >= thresholds.insertion {
                        state |= INSERTION;
                    }
                    if cell.deletion as f64 / n_prime >= thresholds.deletion {
                        state |= DELETION;
                    }
                    cell.state = state;
                }
            }
        }
    }

    apply_majority_rule(table);
}

fn enlarge_regions(table: &mut LaneRegionTable, scale_factor: u32) {
    let scale = scale_factor.max(1);
    let new_nx = (table.nregions_x + scale - 1) / scale;
    let new_ny = (table.nregions_y + scale - 1) / scale;
    let new_nx = new_nx.max(1);
    let new_ny = new_ny.max(1);
    if new_nx == table.nregions_x && new_ny == table.nregions_y {
        return;
    }
    let new_nregions = (new_nx * new_ny) as usize;

    for per_read in table.tiles.values_mut() {
        for cycles in per_read.iter_mut() {
            for regions in cycles.iter_mut() {
                let mut aggregated = vec![RegionCell::default(); new_nregions];
                for (idx, cell) in regions.iter().enumerate() {
                    let rx = idx as u32 / table.nregions_y;
                    let ry = idx as u32 % table.nregions_y;
                    let new_idx = (rx / scale) * new_ny + (ry / scale);
                    aggregated[new_idx as usize].absorb(cell);
                }
                *regions = aggregated;
            }
        }
    }
    let old_ny = table.nregions_y;
    table.observed_regions = table
        .observed_regions
        .iter()
        .map(|&idx| {
            let rx = idx / old_ny;
            let ry = idx % old_ny;
            (rx / scale) * new_ny + (ry / scale)
        })
        .collect();
    table.nregions_x = new_nx;
    table.nregions_y = new_ny;
}

fn apply_majority_rule(table: &mut LaneRegionTable) {
    for per_read in table.tiles.values_mut() {
        for cycles in per_read.iter_mut() {
            for regions in cycles.iter_mut() {
                if regions.is_empty() {
                    continue;
                }
                let mut counts: HashMap<u8, usize> = HashMap::new();
                for cell in regions.iter() {
                    let non_coverage = cell.state & !COVERAGE;
                    if non_coverage != 0 {
                        *counts.entry(non_coverage).or_insert(0) += 1;
                    }
                }
                let all_nonzero_equal = counts.len() == 1;
                if let Some((&state, &count)) = counts.iter().next() {
                    if all_nonzero_equal
                        && (count as f64) / (regions.len() as f64)
                            > TILE_REGION_THRESHOLD
                    {
                        for cell in regions.iter_mut() {
                            let coverage = cell.state & COVERAGE;
                            cell.state = state | coverage;
                        }
                    }
                }
            }
        }
    }
}

/// §4.6: a tile with fewer than `N_READS_PRESENT * 1000` reads across all
/// its cells is marked bad rather than promoted. Every cell in the tile
/// gets the `BAD` bit so `LaneRegionTable::tile_is_culled` (consulted by
/// the filter-file writer, which substitutes tile number -1 for it) can
/// recognize it later.
fn cull_bad_tiles(table: &mut LaneRegionTable) {
    let min_tile_reads = N_READS_PRESENT * 1000;
    let bad_tiles: Vec<(i32, u64)> = table
        .tiles
        .iter()
        .filter_map(|(tile, per_read)| {
            let total: u64 = per_read
                .iter()
                .flat_map(|cycles| cycles.iter())
                .flat_map(|regions| regions.iter())
                .map(|c| c.n() as u64)
                .sum();
            if total < min_tile_reads {
                Some((*tile, total))
            } else {
                None
            }
        })
        .collect();
    for (tile, total) in bad_tiles {
        warn!(
            "lane {}: culling tile {tile}, {total} reads is below the \
             {min_tile_reads}-read minimum; excluded from filter application",
            table.lane
        );
        if let Some(per_read) = table.tiles.get_mut(&tile) {
            for cycles in per_read.iter_mut() {
                for regions in cycles.iter_mut() {
                    for cell in regions.iter_mut() {
                        cell.state |= BAD;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_min_count_uses_smallest_threshold() {
        let t = SpatialThresholds {
            mismatch: 0.1,
            insertion: 0.5,
            deletion: 0.25,
            scale_factor: 2,
        };
        assert_eq!(region_min_count(&t), 20);
    }

    #[test]
    fn coverage_bit_set_iff_below_min_count() {
        let thresholds = SpatialThresholds {
            mismatch: 1.0,
            insertion: 1.0,
            deletion: 1.0,
            scale_factor: 1,
        };
        let min_count = region_min_count(&thresholds);
        let mut cell = RegionCell { align: 1, ..Default::default() };
        let n_prime = (cell.n() as f64).max(min_count as f64);
        let mut state = 0u8;
        if (cell.n() as f64) < min_count as f64 {
            state |= COVERAGE;
        }
        cell.state = state;
        assert_eq!(cell.state & COVERAGE, COVERAGE);
        let _ = n_prime;
    }

    #[test]
    fn parse_qname_extracts_lane_tile_xy() {
        let (lane, tile, x, y) =
            parse_qname_coords("INST1:1:FC1:4:1101:12345:6789").unwrap();
        assert_eq!((lane, tile, x, y), (4, 1101, 12345, 6789));
    }

    #[test]
    fn md_parser_handles_mixed_ops() {
        let ops = parse_md("10A2^GG3");
        assert!(matches!(ops[0], MdOp::Match(10)));
        assert!(matches!(ops[1], MdOp::Mismatch));
        assert!(matches!(ops[2], MdOp::Match(2)));
        assert!(matches!(ops[3], MdOp::Del(2)));
        assert!(matches!(ops[4], MdOp::Match(3)));
    }
}
