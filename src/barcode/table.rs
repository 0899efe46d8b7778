//! Barcode Table: loads the tab-delimited barcode sheet, validates index
//! lengths, splits dual indexes, and builds the exact-match hash. Adapted
//! from the reference toolkit's `read_sequence_lengths_file` line-reading
//! pattern in `util.rs`.

use std::io::{BufRead, BufReader};
use std::path::Path;

use rustc_hash::FxHashMap;

use crate::errors::{DemuxError, DemuxResult};

pub const SYNTHETIC_NAME: &str = "0";
const SPLIT_SEPARATORS: [char; 3] = ['-', '/', '|'];

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BarcodeCounters {
    pub reads: u64,
    pub pf_reads: u64,
    pub perfect: u64,
    pub pf_perfect: u64,
    pub one_mismatch: u64,
    pub pf_one_mismatch: u64,
}

impl BarcodeCounters {
    pub fn merge(&mut self, other: &BarcodeCounters) {
        self.reads += other.reads;
        self.pf_reads += other.pf_reads;
        self.perfect += other.perfect;
        self.pf_perfect += other.pf_perfect;
        self.one_mismatch += other.one_mismatch;
        self.pf_one_mismatch += other.pf_one_mismatch;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarcodeEntry {
    pub seq: String,
    pub idx1: String,
    pub idx2: String,
    pub name: String,
    pub library: String,
    pub sample: String,
    pub description: String,
    pub counters: BarcodeCounters,
}

impl BarcodeEntry {
    pub fn synthetic_unassigned(common_len: usize) -> Self {
        let ns = "N".repeat(common_len);
        Self {
            seq: ns.clone(),
            idx1: ns.clone(),
            idx2: String::new(),
            name: SYNTHETIC_NAME.to_string(),
            library: String::new(),
            sample: String::new(),
            description: String::new(),
            counters: BarcodeCounters::default(),
        }
    }

    pub fn synthetic_unassigned_dual(idx1_len: usize, idx2_len: usize) -> Self {
        let n1 = "N".repeat(idx1_len);
        let n2 = "N".repeat(idx2_len);
        Self {
            seq: format!("{n1}-{n2}"),
            idx1: n1,
            idx2: n2,
            name: SYNTHETIC_NAME.to_string(),
            library: String::new(),
            sample: String::new(),
            description: String::new(),
            counters: BarcodeCounters::default(),
        }
    }

    #[cfg(test)]
    pub fn new_for_test(
        seq: &str,
        name: &str,
        library: &str,
        sample: &str,
        description: &str,
    ) -> Self {
        let (idx1, idx2) = split_seq(seq, None);
        Self {
            seq: seq.to_string(),
            idx1,
            idx2,
            name: name.to_string(),
            library: library.to_string(),
            sample: sample.to_string(),
            description: description.to_string(),
            counters: BarcodeCounters::default(),
        }
    }

    pub fn is_dual(&self) -> bool {
        !self.idx2.is_empty()
    }
}

/// Splits `seq` into `(idx1, idx2)`. With `explicit_split` given (1-based
/// position), splits there; otherwise splits at the first run of separator
/// characters. If no separator is found, `idx2` is empty (single index).
pub fn split_seq(seq: &str, explicit_split: Option<usize>) -> (String, String) {
    if let Some(pos) = explicit_split {
        let bytes = seq.as_bytes();
        let pos = pos.min(bytes.len());
        let idx1 = String::from_utf8_lossy(&bytes[..pos]).to_string();
        let idx2 = String::from_utf8_lossy(&bytes[pos..]).to_string();
        return (idx1, idx2);
    }
    if let Some(start) = seq.find(SPLIT_SEPARATORS) {
        let end = seq[start..]
            .find(|c: char| !SPLIT_SEPARATORS.contains(&c))
            .map(|rel| start + rel)
            .unwrap_or(seq.len());
        (seq[..start].to_string(), seq[end..].to_string())
    } else {
        (seq.to_string(), String::new())
    }
}

#[derive(Debug, Clone)]
pub struct BarcodeTable {
    pub entries: Vec<BarcodeEntry>,
    pub exact_hash: FxHashMap<String, usize>,
    /// Keyed by `(idx1, idx2)` rather than the raw `seq` literal so the
    /// decoder's fast path can match against a freshly split observed
    /// sequence without needing to know which separator character the
    /// barcode file happened to use for this entry.
    pub exact_by_idx: FxHashMap<(String, String), usize>,
    pub idx1_len: usize,
    pub idx2_len: usize,
}

pub struct LoadOptions {
    pub explicit_split: Option<usize>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self { explicit_split: None }
    }
}

impl BarcodeTable {
    pub fn load(path: &Path, opts: &LoadOptions) -> DemuxResult<Self> {
        let file = std::fs::File::open(path)
            .map_err(|e| DemuxError::Io(e))?;
        let mut lines = BufReader::new(file).lines();
        lines.next(); // skip column header line

        let mut entries = Vec::new();
        let mut idx1_len: Option<usize> = None;
        let mut idx2_len: Option<usize> = None;

        for line in lines {
            let line = line.map_err(DemuxError::Io)?;
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split('\t').collect();
            let seq = fields.first().copied().unwrap_or("").to_string();
            let name = fields.get(1).copied().unwrap_or("").to_string();
            let library = fields.get(2).copied().unwrap_or("").to_string();
            let sample = fields.get(3).copied().unwrap_or("").to_string();
            let description = fields.get(4).copied().unwrap_or("").to_string();

            let (idx1, idx2) = split_seq(&seq, opts.explicit_split);

            match idx1_len {
                None => idx1_len = Some(idx1.len()),
                Some(expected) if expected != idx1.len() => {
                    return Err(DemuxError::InconsistentBarcodeLength {
                        name,
                        idx1_len: idx1.len(),
                        idx2_len: idx2.len(),
                        expected_idx1_len: expected,
                        expected_idx2_len: idx2_len.unwrap_or(idx2.len()),
                    });
                }
                _ => {}
            }
            match idx2_len {
                None => idx2_len = Some(idx2.len()),
                Some(expected) if expected != idx2.len() => {
                    return Err(DemuxError::InconsistentBarcodeLength {
                        name,
                        idx1_len: idx1.len(),
                        idx2_len: idx2.len(),
                        expected_idx1_len: idx1_len.unwrap_or(idx1.len()),
                        expected_idx2_len: expected,
                    });
                }
                _ => {}
            }

            entries.push(BarcodeEntry {
                seq,
                idx1,
                idx2,
                name,
                library,
                sample,
                description,
                counters: BarcodeCounters::default(),
            });
        }

        let idx1_len = idx1_len.unwrap_or(0);
        let idx2_len = idx2_len.unwrap_or(0);

        let mut seen_names = std::collections::HashSet::new();
        for entry in &entries {
            if entry.name.is_empty() {
                return Err(DemuxError::Format(
                    "barcode entry name must be non-empty".to_string(),
                ));
            }
            if !seen_names.insert(entry.name.clone()) {
                return Err(DemuxError::Format(format!(
                    "duplicate barcode name {}",
                    entry.name
                )));
            }
        }

        let synthetic = if idx2_len > 0 {
            BarcodeEntry::synthetic_unassigned_dual(idx1_len, idx2_len)
        } else {
            BarcodeEntry::synthetic_unassigned(idx1_len)
        };
        entries.insert(0, synthetic);

        let mut exact_hash = FxHashMap::default();
        let mut exact_by_idx = FxHashMap::default();
        for (i, entry) in entries.iter().enumerate() {
            exact_hash.insert(entry.seq.clone(), i);
            exact_by_idx.insert((entry.idx1.clone(), entry.idx2.clone()), i);
        }

        Ok(Self { entries, exact_hash, exact_by_idx, idx1_len, idx2_len })
    }

    pub fn is_dual(&self) -> bool {
        self.idx2_len > 0
    }

    pub fn lookup_exact(&self, seq: &str) -> Option<usize> {
        self.exact_hash.get(seq).copied()
    }

    pub fn lookup_exact_idx(&self, idx1: &str, idx2: &str) -> Option<usize> {
        self.exact_by_idx
            .get(&(idx1.to_string(), idx2.to_string()))
            .copied()
    }

    pub fn non_synthetic(&self) -> impl Iterator<Item = (usize, &BarcodeEntry)> {
        self.entries.iter().enumerate().skip(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_table(contents: &str) -> tempfile::TempPath {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f.into_temp_path()
    }

    #[test]
    fn loads_single_index_table_with_synthetic_entry() {
        let path = write_table(
            "barcode_sequence_1\tbarcode_name\tlibrary_name\tsample_name\tdescription\n\
             ACGT\tA\tlib\ts1\td1\n\
             TTTT\tB\tlib\ts2\td2\n",
        );
        let table = BarcodeTable::load(path.as_ref(), &LoadOptions::default())
            .unwrap();
        assert_eq!(table.entries.len(), 3);
        assert_eq!(table.entries[0].name, SYNTHETIC_NAME);
        assert_eq!(table.entries[0].seq, "NNNN");
        assert_eq!(table.entries[1].name, "A");
        assert_eq!(table.lookup_exact("ACGT"), Some(1));
        assert_eq!(table.lookup_exact("NNNN"), Some(0));
        assert!(!table.is_dual());
    }

    #[test]
    fn splits_dual_index_on_separator() {
        let (idx1, idx2) = split_seq("AAAA-CCCC", None);
        assert_eq!(idx1, "AAAA");
        assert_eq!(idx2, "CCCC");
    }

    #[test]
    fn split_at_boundary_yields_empty_half() {
        let (idx1, idx2) = split_seq("-CCCC", None);
        assert_eq!(idx1, "");
        assert_eq!(idx2, "CCCC");
        let (idx1, idx2) = split_seq("AAAA-", None);
        assert_eq!(idx1, "AAAA");
        assert_eq!(idx2, "");
    }

    #[test]
    fn inconsistent_length_is_rejected() {
        let path = write_table(
            "header\n\
             ACGT\tA\t\t\t\n\
             ACG\tB\t\t\t\n",
        );
        let err = BarcodeTable::load(path.as_ref(), &LoadOptions::default())
            .unwrap_err();
        assert!(matches!(err, DemuxError::InconsistentBarcodeLength { .. }));
    }
}
