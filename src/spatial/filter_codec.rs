//! Binary filter file codec: serializes a set of `LaneRegionTable`s to the
//! `"RGF3\0"` layout and reads them back for apply-side lookup. `"RGF2"`
//! files are accepted on read with `nreads` narrowed to `int32`.

use std::io::{Read, Write};

use crate::errors::{DemuxError, DemuxResult};
use crate::spatial::region_table::{LaneRegionTable, DELETION, INSERTION};

const MAGIC_V3: &[u8; 5] = b"RGF3\0";
const MAGIC_V2: &[u8; 4] = b"RGF2";
const COMMAND_LINE_BUF_LEN: usize = 1024;

fn write_i32<W: Write>(w: &mut W, v: i32) -> DemuxResult<()> {
    Ok(w.write_all(&v.to_le_bytes())?)
}

fn write_u32<W: Write>(w: &mut W, v: u32) -> DemuxResult<()> {
    Ok(w.write_all(&v.to_le_bytes())?)
}

fn write_u64<W: Write>(w: &mut W, v: u64) -> DemuxResult<()> {
    Ok(w.write_all(&v.to_le_bytes())?)
}

fn read_i32<R: Read>(r: &mut R) -> DemuxResult<i32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

fn read_u32<R: Read>(r: &mut R) -> DemuxResult<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(r: &mut R) -> DemuxResult<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

/// Writes the file header and every lane's block, in the order given.
pub fn write_filter<W: Write>(
    w: &mut W,
    command_line: &str,
    lanes: &[LaneRegionTable],
) -> DemuxResult<()> {
    w.write_all(MAGIC_V3)?;
    let mut cmd_buf = vec![0u8; COMMAND_LINE_BUF_LEN];
    let cmd_bytes = command_line.as_bytes();
    let n = cmd_bytes.len().min(COMMAND_LINE_BUF_LEN);
    cmd_buf[..n].copy_from_slice(&cmd_bytes[..n]);
    w.write_all(&cmd_buf)?;

    for lane in lanes {
        write_lane(w, lane)?;
    }
    Ok(())
}

fn write_lane<W: Write>(w: &mut W, lane: &LaneRegionTable) -> DemuxResult<()> {
    write_i32(w, lane.lane)?;
    write_i32(w, lane.coord_shift)?;
    write_i32(w, lane.coord_factor)?;

    write_u64(w, lane.tiles.len() as u64)?;
    for (tile, _) in lane.tiles.iter() {
        let tile_id = if lane.tile_is_culled(*tile) { -1 } else { *tile };
        write_i32(w, tile_id)?;
        write_u64(w, lane.tile_read_count(*tile))?;
    }

    let nregions = lane.nregions();
    write_i32(w, nregions as i32)?;
    let mut next_compact = 0i32;
    for idx in 0..nregions as u32 {
        if lane.observed_regions.contains(&idx) {
            write_i32(w, next_compact)?;
            next_compact += 1;
        } else {
            write_i32(w, -1)?;
        }
    }

    write_i32(w, lane.region_size)?;
    write_i32(w, lane.nregions_x as i32)?;
    write_i32(w, lane.nregions_y as i32)?;

    write_u64(w, lane.total_reads())?;
    for len in lane.read_lengths {
        write_i32(w, len as i32)?;
    }

    let total_read_length: u32 = lane.read_lengths.iter().sum();
    let filter_data_size = lane.tiles.len() as u64 * total_read_length as u64 * nregions as u64;
    write_u32(w, filter_data_size as u32)?;

    for (_, per_read) in lane.tiles.iter() {
        for cycles in per_read.iter() {
            for regions in cycles.iter() {
                for cell in regions.iter() {
                    w.write_all(&[cell.state])?;
                }
            }
        }
    }
    Ok(())
}

#[derive(Debug)]
pub struct FilterLane {
    pub lane: i32,
    pub coord_shift: i32,
    pub coord_factor: i32,
    pub tiles: Vec<(i32, u64)>,
    pub region_index_map: Vec<i32>,
    pub region_size: i32,
    pub nregions_x: i32,
    pub nregions_y: i32,
    pub nreads: u64,
    pub read_lengths: [i32; 3],
    pub states: Vec<u8>,
}

impl FilterLane {
    fn nregions(&self) -> usize {
        self.region_index_map.len()
    }

    fn total_read_length(&self) -> i64 {
        self.read_lengths.iter().map(|&l| l as i64).sum()
    }

    fn tile_index(&self, tile: i32) -> Option<usize> {
        self.tiles.iter().position(|(t, _)| *t == tile)
    }

    /// False for a tile never observed by `-c`, and for one culled at
    /// create time: its on-disk tile number was rewritten to -1 (§4.6), so
    /// it can never match a real tile number here. Callers applying a
    /// filter use this to tell "no spatial data for this tile" apart from
    /// a clean pass-through and log a diagnostic accordingly.
    pub fn has_tile(&self, tile: i32) -> bool {
        self.tile_index(tile).is_some()
    }

    /// `filter_at`: returns the state byte for `(tile, read, cycle, region)`,
    /// or `None` when the tile is absent from this lane's filter (never
    /// observed, or culled and written back as tile number -1).
    pub fn filter_at(&self, tile: i32, read: usize, cycle: usize, region: i32) -> Option<u8> {
        let tile_idx = self.tile_index(tile)?;
        let cycle_offset: i64 = self.read_lengths[..read].iter().map(|&l| l as i64).sum();
        let offset = tile_idx as i64 * self.total_read_length() * self.nregions() as i64
            + (cycle_offset + cycle as i64) * self.nregions() as i64
            + region as i64;
        self.states.get(offset.max(0) as usize).copied()
    }

    /// A record is filtered iff any cycle in the given read carries
    /// INSERTION or DELETION at its region.
    pub fn should_filter(&self, tile: i32, read: usize, n_cycles: usize, region: i32) -> bool {
        (0..n_cycles).any(|cycle| {
            self.filter_at(tile, read, cycle, region)
                .map(|state| state & (INSERTION | DELETION) != 0)
                .unwrap_or(false)
        })
    }
}

#[derive(Debug)]
pub struct FilterFile {
    pub lanes: Vec<FilterLane>,
}

pub fn read_filter<R: Read>(r: &mut R) -> DemuxResult<FilterFile> {
    let mut magic5 = [0u8; 5];
    r.read_exact(&mut magic5)?;
    let is_v3 = &magic5 == MAGIC_V3;
    let is_v2 = &magic5[..4] == MAGIC_V2;
    if !is_v3 && !is_v2 {
        return Err(DemuxError::FilterMagicMismatch(magic5.to_vec()));
    }

    if is_v2 {
        // RGF2 has no trailing NUL; the 5th magic byte already belongs to
        // the command-line buffer, so only 1023 more bytes remain.
        let mut rest = vec![0u8; COMMAND_LINE_BUF_LEN - 1];
        r.read_exact(&mut rest)?;
    } else {
        let mut cmd_buf = vec![0u8; COMMAND_LINE_BUF_LEN];
        r.read_exact(&mut cmd_buf)?;
    }

    let mut lanes = Vec::new();
    loop {
        match read_lane(r, is_v2) {
            Ok(Some(lane)) => lanes.push(lane),
            Ok(None) => break,
            Err(DemuxError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
    }
    Ok(FilterFile { lanes })
}

fn read_lane<R: Read>(r: &mut R, v2: bool) -> DemuxResult<Option<FilterLane>> {
    let lane = match read_i32(r) {
        Ok(v) => v,
        Err(DemuxError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    let coord_shift = read_i32(r)?;
    let coord_factor = read_i32(r)?;

    let ntiles = read_u64(r)?;
    let mut tiles = Vec::with_capacity(ntiles as usize);
    for _ in 0..ntiles {
        let tile = read_i32(r)?;
        let read_count = read_u64(r)?;
        tiles.push((tile, read_count));
    }

    let nregions = read_i32(r)?;
    let mut region_index_map = Vec::with_capacity(nregions.max(0) as usize);
    for _ in 0..nregions {
        region_index_map.push(read_i32(r)?);
    }

    let region_size = read_i32(r)?;
    let nregions_x = read_i32(r)?;
    let nregions_y = read_i32(r)?;

    let nreads = if v2 { read_i32(r)? as u64 } else { read_u64(r)? };
    let mut read_lengths = [0i32; 3];
    for len in read_lengths.iter_mut() {
        *len = read_i32(r)?;
    }

    let filter_data_size = read_u32(r)?;
    let mut states = vec![0u8; filter_data_size as usize];
    r.read_exact(&mut states)?;

    Ok(Some(FilterLane {
        lane,
        coord_shift,
        coord_factor,
        tiles,
        region_index_map,
        region_size,
        nregions_x,
        nregions_y,
        nreads,
        read_lengths,
        states,
    }))
}

/// Drops lanes below the whole-filter discard threshold (`ntiles × 1000`
/// total reads) and reports which lanes survived, for §4.6/§7's
/// "entire lane with insufficient reads discards its filter" behavior.
pub fn discard_insufficient_lanes(file: FilterFile) -> (FilterFile, Vec<i32>) {
    let mut kept = Vec::new();
    let mut discarded = Vec::new();
    for lane in file.lanes {
        let min_reads = lane.tiles.len() as u64 * 1000;
        if lane.nreads < min_reads {
            discarded.push(lane.lane);
        } else {
            kept.push(lane);
        }
    }
    (FilterFile { lanes: kept }, discarded)
}

/// Converts a built `LaneRegionTable` into its on-disk `FilterLane`
/// representation without a round trip through bytes, for in-process apply
/// immediately after `-c` create.
pub fn lane_table_to_filter_lane(lane: &LaneRegionTable) -> FilterLane {
    let nregions = lane.nregions();
    let mut next_compact = 0i32;
    let region_index_map: Vec<i32> = (0..nregions as u32)
        .map(|idx| {
            if lane.observed_regions.contains(&idx) {
                let v = next_compact;
                next_compact += 1;
                v
            } else {
                -1
            }
        })
        .collect();

    let mut states = Vec::new();
    for (_, per_read) in lane.tiles.iter() {
        for cycles in per_read.iter() {
            for regions in cycles.iter() {
                for cell in regions.iter() {
                    states.push(cell.state);
                }
            }
        }
    }

    let tiles: Vec<(i32, u64)> = lane
        .tiles
        .keys()
        .map(|t| {
            let tile_id = if lane.tile_is_culled(*t) { -1 } else { *t };
            (tile_id, lane.tile_read_count(*t))
        })
        .collect();

    FilterLane {
        lane: lane.lane,
        coord_shift: lane.coord_shift,
        coord_factor: lane.coord_factor,
        tiles,
        region_index_map,
        region_size: lane.region_size,
        nregions_x: lane.nregions_x as i32,
        nregions_y: lane.nregions_y as i32,
        nreads: lane.total_reads(),
        read_lengths: [
            lane.read_lengths[0] as i32,
            lane.read_lengths[1] as i32,
            lane.read_lengths[2] as i32,
        ],
        states,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spatial::region_table::{RegionTableBuilder, SpatialThresholds};
    use rust_htslib::bam::record::{Cigar, CigarString};
    use rust_htslib::bam::Record;
    use rustc_hash::FxHashSet;

    fn make_record(qname: &str, seq: &[u8], cigar: &[Cigar], md: &str, pos: i64) -> Record {
        let mut record = Record::new();
        let qual = vec![30u8; seq.len()];
        record.set(qname.as_bytes(), Some(&CigarString(cigar.to_vec())), seq, &qual);
        record.set_pos(pos);
        record
            .push_aux(b"MD", rust_htslib::bam::record::Aux::String(md))
            .unwrap();
        record
    }

    #[test]
    fn filter_round_trips_through_bytes() {
        let mut builder = RegionTableBuilder::new(100, 1000, 1);
        let seq = b"ACGTACGTAC";
        let record = make_record(
            "INST1:1:FC1:1:1101:11000:21000",
            seq,
            &[Cigar::Match(10)],
            "10",
            0,
        );
        let snps = FxHashSet::default();
        builder.scan_record(&record, "chr1", &snps).unwrap();
        let thresholds = SpatialThresholds {
            mismatch: 0.2,
            insertion: 0.2,
            deletion: 0.2,
            scale_factor: 2,
        };
        let lanes: Vec<LaneRegionTable> = builder.finish(&thresholds).into_values().collect();

        let mut buf = Vec::new();
        write_filter(&mut buf, "demux spatial-filter -c", &lanes).unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let file = read_filter(&mut cursor).unwrap();
        assert_eq!(file.lanes.len(), 1);
        assert_eq!(file.lanes[0].lane, 1);
        assert_eq!(file.lanes[0].tiles.len(), 1);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let buf = b"XXXX\0".to_vec();
        let mut cursor = std::io::Cursor::new(buf);
        let err = read_filter(&mut cursor).unwrap_err();
        assert!(matches!(err, DemuxError::FilterMagicMismatch(_)));
    }

    #[test]
    fn insufficient_lane_reads_are_discarded() {
        let lane = FilterLane {
            lane: 1,
            coord_shift: 0,
            coord_factor: 1,
            tiles: vec![(1101, 5), (1102, 5)],
            region_index_map: vec![0],
            region_size: 100,
            nregions_x: 1,
            nregions_y: 1,
            nreads: 10,
            read_lengths: [10, 0, 0],
            states: vec![0],
        };
        let (kept, discarded) = discard_insufficient_lanes(FilterFile { lanes: vec![lane] });
        assert!(kept.lanes.is_empty());
        assert_eq!(discarded, vec![1]);
    }
}
