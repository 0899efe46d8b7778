//! Barcode metrics rendering: one row per `BarcodeEntry` plus one row per
//! `TagHopEntry`, as a tab-delimited sink. Percentages are computed
//! defensively so a single-entry table never divides by zero.

use std::io::{BufWriter, Write};

use crate::barcode::decoder::TagHopTable;
use crate::barcode::table::{BarcodeEntry, BarcodeTable};
use crate::writers::OutWriter;

fn pct(num: u64, denom: u64) -> f64 {
    if denom == 0 {
        0.0
    } else {
        num as f64 / denom as f64
    }
}

pub struct BarcodeMetricsRow<'a> {
    pub entry: &'a BarcodeEntry,
    pub best_pf_reads: u64,
}

fn row_fields(entry: &BarcodeEntry, best_pf_reads: u64) -> Vec<String> {
    let c = &entry.counters;
    vec![
        entry.name.clone(),
        entry.library.clone(),
        entry.sample.clone(),
        entry.description.clone(),
        c.reads.to_string(),
        c.pf_reads.to_string(),
        c.perfect.to_string(),
        c.pf_perfect.to_string(),
        c.one_mismatch.to_string(),
        c.pf_one_mismatch.to_string(),
        format!("{:.6}", pct(c.pf_perfect + c.pf_one_mismatch, c.pf_reads)),
        format!("{:.6}", pct(c.pf_reads, best_pf_reads)),
    ]
}

const HEADER: &[&str] = &[
    "barcode_name",
    "library_name",
    "sample_name",
    "description",
    "reads",
    "pf_reads",
    "perfect",
    "pf_perfect",
    "one_mismatch",
    "pf_one_mismatch",
    "pf_normalized_matches",
    "ratio_this_barcode_to_best_barcode",
];

pub struct BarcodeMetricsWriter<T: Write> {
    writer: BufWriter<T>,
}

impl<T: Write> BarcodeMetricsWriter<T> {
    pub fn new(inner: T) -> Self {
        Self { writer: BufWriter::new(inner) }
    }
}

impl<T: Write> OutWriter<(&BarcodeTable, &TagHopTable)> for BarcodeMetricsWriter<T> {
    fn write(
        &mut self,
        (table, tag_hops): (&BarcodeTable, &TagHopTable),
    ) -> anyhow::Result<u64> {
        let mut rows_written = 0u64;
        writeln!(self.writer, "{}", HEADER.join("\t"))?;
        rows_written += 1;

        let best_pf_reads = table
            .non_synthetic()
            .map(|(_, e)| e.counters.pf_reads)
            .max()
            .unwrap_or(0);

        for entry in table.entries.iter() {
            writeln!(
                self.writer,
                "{}",
                row_fields(entry, best_pf_reads).join("\t")
            )?;
            rows_written += 1;
        }

        writeln!(self.writer)?;
        for key in &tag_hops.order {
            if let Some(entry) = tag_hops.entries.get(key) {
                writeln!(
                    self.writer,
                    "{}",
                    row_fields(entry, best_pf_reads).join("\t")
                )?;
                rows_written += 1;
            }
        }

        self.writer.flush()?;
        Ok(rows_written)
    }
}

pub fn human_readable_table(
    table: &BarcodeTable,
) -> prettytable::Table {
    let mut tab = crate::util::get_human_readable_table();
    tab.set_titles(prettytable::Row::new(
        HEADER.iter().map(|h| prettytable::Cell::new(h)).collect(),
    ));
    let best_pf_reads = table
        .non_synthetic()
        .map(|(_, e)| e.counters.pf_reads)
        .max()
        .unwrap_or(0);
    for entry in table.entries.iter() {
        let fields = row_fields(entry, best_pf_reads);
        tab.add_row(prettytable::Row::new(
            fields.iter().map(|f| prettytable::Cell::new(f)).collect(),
        ));
    }
    tab
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::barcode::table::{BarcodeTable, LoadOptions};
    use std::io::Write as _;

    #[test]
    fn single_entry_table_has_no_div_by_zero() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"h\nACGT\tA\t\t\t\n").unwrap();
        let table = BarcodeTable::load(f.path(), &LoadOptions::default()).unwrap();
        let tag_hops = TagHopTable::default();
        let mut buf = Vec::new();
        let mut writer = BarcodeMetricsWriter::new(&mut buf);
        let n = writer.write((&table, &tag_hops)).unwrap();
        assert!(n >= 2);
        drop(writer);
        let text = String::from_utf8(buf).unwrap();
        assert!(!text.contains("NaN"));
    }
}
