//! Adapter Matcher: seed-prefiltered local alignment against every
//! fragment/position pair, Poisson confidence scoring, and paired-overlap
//! adapter detection for templates with two mates.

use crate::adapter::index::{pack_seed, revcomp, AdapterFragment, AdapterIndex, SEED_LEN};
use crate::aux_codec::AuxValue;
use crate::util::SamTag;

const MATCH_SCORE: i32 = 1;
const MISMATCH_PENALTY: i32 = 2;
const GENOME_SIZE_DEFAULT: u64 = 3_000_000_000;

#[derive(Debug, Clone)]
pub struct MatcherConfig {
    pub min_score: i32,
    pub min_frac: f64,
    pub min_pfrac: f64,
    pub genome_size: u64,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            min_score: 10,
            min_frac: 0.5,
            min_pfrac: 0.5,
            genome_size: GENOME_SIZE_DEFAULT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdapterHit {
    pub adapter_name: String,
    pub pfrac: f64,
    pub confidence: f64,
    pub clip_len: i32,
    pub seqstart: usize,
}

/// Local alignment: `+1`/match, `-2`/mismatch, score clamps to 0, tracking
/// the best-scoring `(begin, end)` window within `read[s..]` against
/// `fragment`.
fn local_align(read: &[u8], s: usize, fragment: &[u8]) -> (i32, usize, usize) {
    let mut score = 0i32;
    let mut max_score = 0i32;
    let mut begin = 0usize;
    let mut end = 0usize;
    let mut window_start = 0usize;

    let n = fragment.len().min(read.len() - s);
    for i in 0..n {
        if read[s + i].to_ascii_uppercase() == fragment[i].to_ascii_uppercase() {
            score += MATCH_SCORE;
        } else {
            score -= MISMATCH_PENALTY;
        }
        if score < 0 {
            score = 0;
            window_start = i + 1;
        }
        if score > max_score {
            max_score = score;
            begin = window_start;
            end = i + 1;
        }
    }
    (max_score, begin, end)
}

/// Counts A/C/G/T multiplicities over `window`, distributing non-ACGT
/// bases uniformly at random across the four bins (deterministically, by
/// round-robin, since the matcher must not call into a real RNG here).
fn base_multiplicities(window: &[u8]) -> [u32; 4] {
    let mut counts = [0u32; 4];
    let mut next_bin = 0usize;
    for &b in window {
        let idx = match b.to_ascii_uppercase() {
            b'A' => 0,
            b'C' => 1,
            b'G' => 2,
            b'T' => 3,
            _ => {
                let idx = next_bin % 4;
                next_bin += 1;
                idx
            }
        };
        counts[idx] += 1;
    }
    counts
}

/// `1/exp(lambda)` with `lambda = (L + 1 - K) * 0.25^fA * 0.25^fC * 0.25^fG
/// * 0.25^fT`, `L` the effective genome size, `K` the window length.
fn poisson_confidence(window: &[u8], genome_size: u64) -> f64 {
    let counts = base_multiplicities(window);
    let k: u32 = counts.iter().sum();
    let l = genome_size as f64;
    let lambda = (l + 1.0 - k as f64) * counts.iter().map(|&f| 0.25f64.powi(f as i32)).product::<f64>();
    1.0 / lambda.exp()
}

/// Scans one read against every adapter fragment/start-position pair,
/// keeping the best hit passing `frac`/`pfrac`/`score` thresholds.
pub fn match_read(read: &[u8], index: &AdapterIndex, config: &MatcherConfig) -> Option<AdapterHit> {
    if read.len() < config.min_score as usize {
        return None;
    }
    let mut best: Option<(i32, AdapterHit)> = None;

    for frag in &index.fragments {
        if frag.sequence.len() < SEED_LEN {
            continue;
        }
        let frag_seed = pack_seed(&frag.sequence);
        let last_start = read.len().saturating_sub(config.min_score as usize);
        for s in 0..last_start {
            if read.len() - s < SEED_LEN {
                continue;
            }
            let read_seed = pack_seed(&read[s..]);
            if crate::adapter::index::seed_distance(read_seed, frag_seed) > 2 {
                continue;
            }
            let (score, begin, end) = local_align(read, s, &frag.sequence);
            if score < config.min_score {
                continue;
            }
            let matched = (end - begin) as f64;
            let frac = matched / (frag.sequence.len() + frag.offset) as f64;
            let pfrac = matched
                / (frag.sequence.len().min(read.len() - s) + frag.offset) as f64;
            if frac < config.min_frac || pfrac < config.min_pfrac {
                continue;
            }
            let seqstart = s + begin;
            let window_end = (frag.sequence.len() - begin).min(read.len() - seqstart);
            let window = &read[seqstart..seqstart + window_end];
            let confidence = poisson_confidence(window, config.genome_size);
            let clip_len = (read.len() as i32 - seqstart as i32) + frag.offset as i32;

            let is_better = match &best {
                None => true,
                Some((best_score, _)) => score > *best_score,
            };
            if is_better {
                best = Some((
                    score,
                    AdapterHit {
                        adapter_name: frag.name.clone(),
                        pfrac,
                        confidence,
                        clip_len,
                        seqstart,
                    },
                ));
            }
        }
    }
    best.map(|(_, hit)| hit)
}

/// Applies a hit's tags (`aa`, `af`, `ar`, `as`) to a record.
pub fn apply_hit_tags(
    record: &mut rust_htslib::bam::Record,
    hit: &AdapterHit,
) -> crate::errors::DemuxResult<()> {
    crate::aux_codec::append_typed(
        record,
        &SamTag::from_str("aa").unwrap(),
        &AuxValue::Str(hit.adapter_name.clone()),
    )?;
    crate::aux_codec::append_typed(
        record,
        &SamTag::from_str("af").unwrap(),
        &AuxValue::Float(hit.pfrac as f32),
    )?;
    crate::aux_codec::append_typed(
        record,
        &SamTag::from_str("ar").unwrap(),
        &AuxValue::Float(hit.confidence as f32),
    )?;
    crate::aux_codec::append_typed(
        record,
        &SamTag::from_str("as").unwrap(),
        &AuxValue::I32(hit.clip_len),
    )?;
    Ok(())
}

pub const MIN_OVERLAP: usize = 32;
pub const MAX_OVERLAP_MISMATCH_RATE: f64 = 0.1;
pub const IMPLIED_ADAPTER_CHECK_LEN: usize = 12;

#[derive(Debug, Clone, Copy)]
pub struct PairedOverlap {
    pub adapter_len: i32,
}

/// Paired overlap detection per §4.9: reverse-complement read 2, slide
/// read 1's tail against read 2's head, then verify the implied adapter
/// stub with zero mismatches before tagging.
pub fn find_paired_overlap(read1: &[u8], read2: &[u8]) -> Option<PairedOverlap> {
    let read2_rc = revcomp(read2);
    let max_overlap = read1.len().min(read2_rc.len());

    let mut best_overlap: Option<usize> = None;
    for overlap in (MIN_OVERLAP..=max_overlap).rev() {
        let tail = &read1[read1.len() - overlap..];
        let head = &read2_rc[..overlap];
        let mismatches = tail
            .iter()
            .zip(head.iter())
            .filter(|(a, b)| a.to_ascii_uppercase() != b.to_ascii_uppercase())
            .count();
        if (mismatches as f64) / (overlap as f64) <= MAX_OVERLAP_MISMATCH_RATE {
            best_overlap = Some(overlap);
            break;
        }
    }

    let overlap = best_overlap?;
    let adapter_len = read1.len() as i32 - overlap as i32;
    if adapter_len <= 0 {
        return None;
    }

    let check_len = IMPLIED_ADAPTER_CHECK_LEN
        .min(read1.len() - overlap)
        .min(read2_rc.len().saturating_sub(overlap));
    if check_len == 0 {
        return Some(PairedOverlap { adapter_len });
    }
    let stub1 = &read1[overlap..overlap + check_len];
    let stub2_region = &read2_rc[overlap..overlap + check_len.min(read2_rc.len() - overlap)];
    let stub2_rc = revcomp(stub2_region);
    if stub1.len() == stub2_rc.len()
        && stub1
            .iter()
            .zip(stub2_rc.iter())
            .all(|(a, b)| a.to_ascii_uppercase() == b.to_ascii_uppercase())
    {
        Some(PairedOverlap { adapter_len })
    } else {
        None
    }
}

/// Tags both mates of a detected paired-overlap adapter readthrough.
pub fn apply_paired_overlap_tags(
    read1: &mut rust_htslib::bam::Record,
    read2: &mut rust_htslib::bam::Record,
    overlap: &PairedOverlap,
) -> crate::errors::DemuxResult<()> {
    for record in [read1, read2] {
        crate::aux_codec::append_typed(
            record,
            &SamTag::from_str("ah").unwrap(),
            &AuxValue::I32(1),
        )?;
        crate::aux_codec::append_typed(
            record,
            &SamTag::from_str("a3").unwrap(),
            &AuxValue::I32(overlap.adapter_len),
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::index::AdapterIndex;

    #[test]
    fn local_align_finds_perfect_match() {
        let read = b"NNNNNACGTACGTACGTACGTACGT";
        let (score, begin, end) = local_align(read, 5, b"ACGTACGTACGTACGTACGT");
        assert_eq!(score, 20);
        assert_eq!(end - begin, 20);
    }

    #[test]
    fn match_read_finds_known_adapter() {
        let adapters = vec![(
            "illumina".to_string(),
            b"AGATCGGAAGAGCACACGTCTGAACTCCAGTCA".to_vec(),
        )];
        let index = AdapterIndex::build(&adapters, 10);
        let mut read = b"ACGTACGTACGTACGTACGT".to_vec();
        read.extend_from_slice(b"AGATCGGAAGAGCACACGTCTGAACTCCAGTCA");
        let config = MatcherConfig::default();
        let hit = match_read(&read, &index, &config);
        assert!(hit.is_some());
    }

    #[test]
    fn poisson_confidence_in_unit_interval() {
        let conf = poisson_confidence(b"ACGTACGTACGT", GENOME_SIZE_DEFAULT);
        assert!((0.0..=1.0).contains(&conf));
    }

    #[test]
    fn paired_overlap_detects_adapter_readthrough() {
        let insert = b"ACGTACGTACGTACGTACGTACGTACGTACGTACGT".to_vec();
        let adapter = b"AGATCGGAAGAGC".to_vec();
        let mut read1 = insert.clone();
        read1.extend_from_slice(&adapter);
        let mut read2_insert = revcomp(&insert);
        let mut read2 = revcomp(&adapter);
        read2.append(&mut read2_insert);
        let hit = find_paired_overlap(&read1, &read2);
        assert!(hit.is_some());
    }

    #[test]
    fn no_overlap_returns_none() {
        let read1 = b"ACGTACGTACGTACGTACGTACGTACGTACGTACGT".to_vec();
        let read2 = b"TTTTTTTTTTTTTTTTTTTTTTTTTTTTTTTTTTTT".to_vec();
        assert!(find_paired_overlap(&read1, &read2).is_none());
    }
}
