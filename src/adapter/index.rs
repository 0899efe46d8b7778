//! Adapter Index: fragments each base adapter into offset suffixes (forward
//! and reverse-complement), and packs a 22-base seed into a 64-bit word for
//! a cheap prefilter before the full local alignment in `matcher`.

use crate::errors::{DemuxError, DemuxResult};

pub const SEED_LEN: usize = 22;
/// `1` at the low-order bit of every 3-bit symbol nibble.
const SEEDMASK: u64 = {
    let mut mask = 0u64;
    let mut i = 0;
    while i < SEED_LEN {
        mask |= 1u64 << (i * 3);
        i += 1;
    }
    mask
};

fn symbol_bits(base: u8) -> u64 {
    match base.to_ascii_uppercase() {
        b'A' => 0b000,
        b'C' => 0b001,
        b'G' => 0b010,
        b'T' => 0b011,
        _ => 0b100,
    }
}

/// Packs the first `SEED_LEN` bases of `seq` into the low 64 bits, 3 bits
/// per symbol. Shorter input is zero-padded (packs as all-`A`).
pub fn pack_seed(seq: &[u8]) -> u64 {
    let mut word = 0u64;
    for i in 0..SEED_LEN {
        let base = seq.get(i).copied().unwrap_or(b'A');
        word |= symbol_bits(base) << (i * 3);
    }
    word
}

/// Hamming distance in symbol positions between two packed seeds.
pub fn seed_distance(x: u64, y: u64) -> u32 {
    let diff = x ^ y;
    ((diff | (diff >> 1) | (diff >> 2)) & SEEDMASK).count_ones()
}

pub fn revcomp(seq: &[u8]) -> Vec<u8> {
    bio::alphabets::dna::revcomp(seq)
}

#[derive(Debug, Clone)]
pub struct AdapterFragment {
    pub name: String,
    pub sequence: Vec<u8>,
    pub offset: usize,
    pub forward: bool,
    pub seed: u64,
}

#[derive(Debug, Default, Clone)]
pub struct AdapterIndex {
    pub fragments: Vec<AdapterFragment>,
}

impl AdapterIndex {
    /// Builds the fragmented index from a FASTA-style `(name, sequence)`
    /// list, per §4.8: every suffix starting at `p in [1, L - min_score)`
    /// is indexed both forward and as its reverse complement.
    pub fn build(adapters: &[(String, Vec<u8>)], min_score: usize) -> Self {
        let mut fragments = Vec::new();
        for (name, seq) in adapters {
            let len = seq.len();
            if len <= min_score {
                continue;
            }
            for p in 1..(len - min_score) {
                let suffix = &seq[p..];
                fragments.push(AdapterFragment {
                    name: name.clone(),
                    sequence: suffix.to_vec(),
                    offset: p,
                    forward: true,
                    seed: pack_seed(suffix),
                });
                let rc = revcomp(suffix);
                let seed = pack_seed(&rc);
                fragments.push(AdapterFragment {
                    name: name.clone(),
                    sequence: rc,
                    offset: p,
                    forward: false,
                    seed,
                });
            }
        }
        Self { fragments }
    }

    /// Parses a FASTA adapter file: alternating `>name` / sequence lines,
    /// blank lines disallowed.
    pub fn load_fasta(text: &str, min_score: usize) -> DemuxResult<Self> {
        let mut adapters = Vec::new();
        let mut lines = text.lines().peekable();
        while let Some(line) = lines.next() {
            if line.is_empty() {
                return Err(DemuxError::Format(
                    "blank line in adapter FASTA".to_string(),
                ));
            }
            let Some(name) = line.strip_prefix('>') else {
                return Err(DemuxError::Format(format!(
                    "expected '>' header, got {line:?}"
                )));
            };
            let seq_line = lines.next().ok_or_else(|| {
                DemuxError::Format(format!("adapter {name} is missing a sequence line"))
            })?;
            if seq_line.is_empty() {
                return Err(DemuxError::Format(
                    "blank line in adapter FASTA".to_string(),
                ));
            }
            adapters.push((name.to_string(), seq_line.as_bytes().to_vec()));
        }
        Ok(Self::build(&adapters, min_score))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_seed_is_deterministic_and_order_sensitive() {
        let a = pack_seed(b"ACGTACGTACGTACGTACGTAA");
        let b = pack_seed(b"ACGTACGTACGTACGTACGTAC");
        assert_ne!(a, b);
    }

    #[test]
    fn seed_distance_zero_for_identical_seed() {
        let a = pack_seed(b"ACGTACGTACGTACGTACGTAA");
        assert_eq!(seed_distance(a, a), 0);
    }

    #[test]
    fn seed_distance_counts_mismatched_symbols() {
        let a = pack_seed(b"AAAAAAAAAAAAAAAAAAAAAA");
        let b = pack_seed(b"AAAAAAAAAAAAAAAAAAAAAC");
        assert_eq!(seed_distance(a, b), 1);
    }

    #[test]
    fn revcomp_reverses_and_complements() {
        assert_eq!(revcomp(b"ACGT"), b"ACGT");
        assert_eq!(revcomp(b"AACC"), b"GGTT");
    }

    #[test]
    fn build_fragments_forward_and_reverse_per_offset() {
        let adapters = vec![("ad1".to_string(), b"ACGTACGTACGTACGTACGTACGTACGT".to_vec())];
        let index = AdapterIndex::build(&adapters, 10);
        assert!(!index.fragments.is_empty());
        assert!(index.fragments.iter().any(|f| f.forward));
        assert!(index.fragments.iter().any(|f| !f.forward));
    }

    #[test]
    fn load_fasta_rejects_blank_lines() {
        let err = AdapterIndex::load_fasta(">a\nACGT\n\n>b\nTTTT\n", 2).unwrap_err();
        assert!(matches!(err, DemuxError::Format(_)));
    }
}
