//! Small shared helpers, adapted from the reference toolkit's `util.rs`:
//! progress bar styling, output directory creation, and the two-character
//! `SamTag` key used throughout the aux-tag codec and worker accumulators.

use std::path::Path;

use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use rust_htslib::bam;

use crate::errors::DemuxError;

pub fn create_out_directory<T: AsRef<std::ffi::OsStr>>(
    raw_path: T,
) -> anyhow::Result<()> {
    if let Some(p) = Path::new(&raw_path).parent() {
        if !p.exists() && p != Path::new("") {
            info!("creating directory at {p:?}");
            std::fs::create_dir_all(p)?;
        }
    }
    Ok(())
}

pub fn get_ticker() -> ProgressBar {
    let ticker = ProgressBar::new_spinner();
    ticker.set_style(ProgressStyle::with_template("> {pos} {msg}").unwrap());
    ticker
}

pub fn get_spinner() -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template(
            "{spinner:.blue} [{elapsed_precise}] {pos} {msg}",
        )
        .unwrap()
        .tick_strings(&[
            "▹▹▹▹▹", "▸▹▹▹▹", "▹▸▹▹▹", "▹▹▸▹▹", "▹▹▹▸▹", "▹▹▹▹▸", "▪▪▪▪▪",
        ]),
    );
    spinner
}

pub fn get_human_readable_table() -> prettytable::Table {
    let mut tab = prettytable::Table::new();
    tab.set_format(*prettytable::format::consts::FORMAT_NO_LINESEP_WITH_TITLE);
    tab
}

pub fn format_int_with_commas(val: isize) -> String {
    let mut num = val
        .abs()
        .to_string()
        .as_bytes()
        .rchunks(3)
        .rev()
        .map(std::str::from_utf8)
        .collect::<Result<Vec<&str>, _>>()
        .unwrap()
        .join(",");
    if val < 0 {
        num = format!("-{num}")
    }
    num
}

pub(crate) fn get_query_name_string(
    record: &bam::Record,
) -> Result<String, DemuxError> {
    String::from_utf8(record.qname().to_vec())
        .map_err(|e| DemuxError::InvalidQueryName(e.to_string()))
}

/// A two-character auxiliary tag name, the key used by every tag on a
/// `Record`. Stored as a fixed `[u8; 2]` rather than a `String` so map keys
/// used in the hot per-record loops (aux lookups, partition tags) are
/// `Copy` and allocation-free.
#[derive(derive_new::new, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Copy, Clone)]
pub struct SamTag {
    inner: [u8; 2],
}

impl SamTag {
    pub fn from_str(raw: &str) -> Result<Self, DemuxError> {
        let bytes = raw.as_bytes();
        if bytes.len() != 2 {
            return Err(DemuxError::Format(format!(
                "tag {raw} must be exactly two characters"
            )));
        }
        Ok(Self { inner: [bytes[0], bytes[1]] })
    }

    pub fn as_bytes(&self) -> &[u8; 2] {
        &self.inner
    }
}

impl std::fmt::Display for SamTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.inner[0] as char, self.inner[1] as char)
    }
}

/// Count of no-call symbols ('N', 'n', '.') in an observed barcode sequence.
pub(crate) fn no_calls(obs: &[u8]) -> usize {
    obs.iter().filter(|&&b| b == b'N' || b == b'n' || b == b'.').count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sam_tag_round_trips_display() {
        let tag = SamTag::from_str("RG").unwrap();
        assert_eq!(tag.to_string(), "RG");
        assert_eq!(tag.as_bytes(), b"RG");
    }

    #[test]
    fn sam_tag_rejects_wrong_length() {
        assert!(SamTag::from_str("R").is_err());
        assert!(SamTag::from_str("RGB").is_err());
    }

    #[test]
    fn no_calls_counts_n_dot_lowercase() {
        assert_eq!(no_calls(b"ACGTN.n"), 3);
        assert_eq!(no_calls(b"ACGT"), 0);
    }

    #[test]
    fn format_int_with_commas_groups_thousands() {
        assert_eq!(format_int_with_commas(1234567), "1,234,567");
        assert_eq!(format_int_with_commas(-42), "-42");
    }
}
