//! Header Mutator: appends PG provenance and, for the decoder, splits each
//! input read group into one copy per barcode entry. Adapted from the
//! reference toolkit's `add_modkit_pg_records`/`header_to_hashmap` pair in
//! `util.rs`, generalized to also rewrite `RG` lines.

use std::collections::HashMap;

use linear_map::LinearMap;
use log::{debug, error};
use rust_htslib::bam::header::HeaderRecord;
use rust_htslib::bam::Header;

use crate::barcode::table::BarcodeEntry;

fn header_to_hashmap(
    header: &Header,
) -> anyhow::Result<HashMap<String, Vec<LinearMap<String, String>>>> {
    let mut header_map: HashMap<String, Vec<LinearMap<String, String>>> =
        HashMap::default();

    let header_string = String::from_utf8(header.to_bytes())
        .map_err(|e| anyhow::anyhow!("failed to parse header bytes: {e}"))?;

    for line in header_string.split('\n').filter(|l| !l.is_empty()) {
        let parts: Vec<&str> =
            line.split('\t').filter(|p| !p.is_empty()).collect();
        if parts.is_empty() {
            continue;
        }
        let Some(record_type) = parts[0].strip_prefix('@') else {
            debug!("encountered illegal record type in line {line}");
            continue;
        };
        if record_type == "CO" {
            continue;
        }
        let mut field = LinearMap::default();
        for part in parts.iter().skip(1) {
            if let Some((tag, value)) = part.split_once(':') {
                field.insert(tag.to_string(), value.to_string());
            } else {
                debug!("encountered illegal tag in line {line}");
            }
        }
        header_map
            .entry(record_type.to_string())
            .or_insert_with(Vec::new)
            .push(field);
    }
    Ok(header_map)
}

/// Appends one `@PG` record naming `component`/`version`/the current
/// command line, following the chain of any prior invocations of this
/// same component already present in the header.
pub fn add_pg_record(header: &mut Header, component: &str, version: &str) {
    let header_map = match header_to_hashmap(header) {
        Ok(hm) => hm,
        Err(e) => {
            error!(
                "failed to parse input header ({e}), not adding PG record \
                 for {component}"
            );
            return;
        }
    };

    let (id, pp) = if let Some(pg_tags) = header_map.get("PG") {
        let prior_runs = pg_tags.iter().filter_map(|tags| {
            tags.get("ID").and_then(|v| {
                v.strip_prefix(&format!("{component}."))
                    .and_then(|suffix| suffix.parse::<usize>().ok())
            })
        });
        if let Some(latest) = prior_runs.max() {
            let pp = Some(format!("{component}.{latest}"));
            (format!("{component}.{}", latest + 1), pp)
        } else {
            (component.to_string(), None)
        }
    } else {
        (component.to_string(), None)
    };

    let command_line = std::env::args().collect::<Vec<String>>().join(" ");
    let mut record = HeaderRecord::new(b"PG");
    record.push_tag(b"ID", &id);
    record.push_tag(b"PN", &component.to_owned());
    record.push_tag(b"VN", &version.to_owned());
    if let Some(pp) = pp {
        record.push_tag(b"PP", &pp);
    }
    record.push_tag(b"CL", &command_line);
    header.push_record(&record);
}

/// Replaces each input `@RG ID:x` with one copy per barcode entry, named
/// `x#<entry name>` (entry 0's synthetic name `"0"` included), updating
/// `PU` by appending `#<name>` and overriding `LB`/`SM`/`DS` when the entry
/// provides a non-empty value. No two output read groups share an `ID`.
pub fn split_read_groups_by_barcode(
    header: &Header,
    entries: &[BarcodeEntry],
) -> anyhow::Result<Header> {
    let header_map = header_to_hashmap(header)?;
    let mut out = Header::new();
    for (record_type, records) in header_map.iter() {
        if record_type == "RG" {
            continue;
        }
        for fields in records {
            let mut rec = HeaderRecord::new(record_type.as_bytes());
            for (tag, value) in fields.iter() {
                rec.push_tag(tag.as_bytes(), value);
            }
            out.push_record(&rec);
        }
    }

    if let Some(rg_records) = header_map.get("RG") {
        for fields in rg_records {
            let Some(base_id) = fields.get("ID") else {
                debug!("RG record missing ID, skipping split");
                continue;
            };
            for entry in entries {
                let mut rec = HeaderRecord::new(b"RG");
                let new_id = format!("{base_id}#{}", entry.name);
                rec.push_tag(b"ID", &new_id);
                for (tag, value) in fields.iter() {
                    if tag == "ID" {
                        continue;
                    }
                    let value = match tag.as_str() {
                        "PU" => format!("{value}#{}", entry.name),
                        "LB" if !entry.library.is_empty() => {
                            entry.library.clone()
                        }
                        "SM" if !entry.sample.is_empty() => {
                            entry.sample.clone()
                        }
                        "DS" if !entry.description.is_empty() => {
                            entry.description.clone()
                        }
                        _ => value.clone(),
                    };
                    rec.push_tag(tag.as_bytes(), &value);
                }
                for (tag, field_name) in
                    [("LB", &entry.library), ("SM", &entry.sample), ("DS", &entry.description)]
                {
                    if !field_name.is_empty() && !fields.contains_key(tag) {
                        rec.push_tag(tag.as_bytes(), field_name);
                    }
                }
                out.push_record(&rec);
            }
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::barcode::table::BarcodeEntry;

    fn sample_header() -> Header {
        let mut h = Header::new();
        let mut rg = HeaderRecord::new(b"RG");
        rg.push_tag(b"ID", &"x".to_owned());
        rg.push_tag(b"PU", &"flowcell.lane".to_owned());
        h.push_record(&rg);
        h
    }

    #[test]
    fn splits_one_rg_per_barcode_entry() {
        let header = sample_header();
        let entries = vec![
            BarcodeEntry::synthetic_unassigned(4),
            BarcodeEntry::new_for_test("ACGT", "sampleA", "lib1", "s1", "d1"),
        ];
        let out = split_read_groups_by_barcode(&header, &entries).unwrap();
        let out_str = String::from_utf8(out.to_bytes()).unwrap();
        let rg_lines: Vec<&str> =
            out_str.lines().filter(|l| l.starts_with("@RG")).collect();
        assert_eq!(rg_lines.len(), entries.len());
        assert!(rg_lines[0].contains("ID:x#0"));
        assert!(rg_lines[1].contains("ID:x#sampleA"));
        assert!(rg_lines[1].contains("PU:flowcell.lane#sampleA"));
        assert!(rg_lines[1].contains("LB:lib1"));
        assert!(rg_lines[1].contains("SM:s1"));
        assert!(rg_lines[1].contains("DS:d1"));
    }
}
