//! Read-to-Tags Transformer: excises 1-based half-open spans from a
//! record's sequence/quality into caller-named barcode/quality tags,
//! compacts what remains, and merges an emptied mate into its sibling.

use rust_htslib::bam::Record;

use crate::aux_codec::{self, AuxValue, GrowableBuffer};
use crate::errors::{DemuxError, DemuxResult};
use crate::record_stream::Template;
use crate::util::SamTag;

#[derive(Debug, Clone, Copy)]
pub struct Span {
    pub record_index: u8, // 0 unpaired, 1 read1, 2 read2
    pub from: usize,      // 1-based, inclusive
    pub to: usize,        // 1-based, exclusive
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollisionPolicy {
    Reject,
    Overwrite,
    Concatenate,
}

#[derive(Debug, Clone)]
pub struct TagSpan {
    pub span: Span,
    pub barcode_tag: SamTag,
    pub quality_tag: SamTag,
}

fn record_index_for(template_len: usize, is_read2: bool) -> u8 {
    if template_len <= 1 {
        0
    } else if is_read2 {
        2
    } else {
        1
    }
}

/// Applies every matching span to the record at `record_index` within the
/// template: appends the sliced bases/qualities onto the named tags
/// (accumulating across spans for the same tag name), marks excised
/// positions with the `0x01` sentinel, then compacts.
pub fn apply_spans(
    template: &mut Template,
    spans: &[TagSpan],
    policy: CollisionPolicy,
    merge_keep_list: &[SamTag],
) -> DemuxResult<()> {
    let template_len = template.records.len();
    let mut pending: Vec<(SamTag, GrowableBuffer)> = Vec::new();
    let mut pending_qual: Vec<(SamTag, GrowableBuffer)> = Vec::new();

    for record in template.records.iter_mut() {
        let is_read2 = record.is_paired() && !record.is_first_in_template();
        let idx = record_index_for(template_len, is_read2);

        let matching: Vec<&TagSpan> =
            spans.iter().filter(|s| s.span.record_index == idx).collect();
        if matching.is_empty() {
            continue;
        }

        let seq = record.seq().as_bytes();
        let qual = record.qual().to_vec();
        let mut mask = vec![false; seq.len()];

        pending.clear();
        pending_qual.clear();

        for tag_span in &matching {
            let from = tag_span.span.from.saturating_sub(1);
            let to = tag_span.span.to.min(seq.len());
            if from >= to {
                continue;
            }
            for p in from..to {
                mask[p] = true;
            }
            push_accum(&mut pending, &tag_span.barcode_tag, &seq[from..to]);
            push_accum(&mut pending_qual, &tag_span.quality_tag, &qual[from..to]);
        }

        let mut new_seq = GrowableBuffer::with_capacity_hint(seq.len());
        let mut new_qual = GrowableBuffer::with_capacity_hint(seq.len());
        for (p, &excised) in mask.iter().enumerate() {
            if !excised {
                new_seq.push(seq[p]);
                new_qual.push(qual[p]);
            }
        }

        record.set(
            &record.qname().to_vec(),
            None,
            new_seq.as_slice(),
            new_qual.as_slice(),
        );

        for (tag, buf) in pending.drain(..) {
            write_tag(record, &tag, buf.as_slice(), policy, false)?;
        }
        for (tag, buf) in pending_qual.drain(..) {
            write_tag(record, &tag, buf.as_slice(), policy, true)?;
        }
    }

    let barcode_quality_tags: Vec<SamTag> = spans
        .iter()
        .flat_map(|s| [s.barcode_tag, s.quality_tag])
        .collect();
    merge_emptied_mate(template, policy, merge_keep_list, &barcode_quality_tags)
}

fn push_accum(pending: &mut Vec<(SamTag, GrowableBuffer)>, tag: &SamTag, slice: &[u8]) {
    if let Some((_, buf)) = pending.iter_mut().find(|(t, _)| t == tag) {
        buf.extend_from_slice(slice);
    } else {
        let mut buf = GrowableBuffer::with_capacity_hint(slice.len());
        buf.extend_from_slice(slice);
        pending.push((*tag, buf));
    }
}

fn write_tag(
    record: &mut Record,
    tag: &SamTag,
    bytes: &[u8],
    policy: CollisionPolicy,
    is_quality: bool,
) -> DemuxResult<()> {
    let text = if is_quality {
        bytes.iter().map(|&q| (q + 33) as char).collect::<String>()
    } else {
        String::from_utf8_lossy(bytes).to_string()
    };

    match aux_codec::get_aux(record, tag) {
        Some(AuxValue::Str(existing)) => match policy {
            CollisionPolicy::Reject => {
                return Err(DemuxError::DuplicateTag {
                    tag: tag.to_string(),
                    qname: String::from_utf8_lossy(record.qname()).to_string(),
                })
            }
            CollisionPolicy::Overwrite => aux_codec::update_str(record, tag, &text)?,
            CollisionPolicy::Concatenate => {
                aux_codec::update_str(record, tag, &format!("{existing}{text}"))?
            }
        },
        Some(_) => {
            return Err(DemuxError::TagTypeMismatch { tag: tag.to_string() })
        }
        None => aux_codec::append_typed(record, tag, &AuxValue::Str(text))?,
    }
    Ok(())
}

/// If exactly one mate of a pair is left with zero bases after excision,
/// folds `merge_keep_list` tags from the empty mate into the non-empty one
/// (applying `policy` only for tags that are also barcode/quality tags)
/// and emits a single merged record. A keep-list tag absent from `keep`
/// is copied as-is; one already present and not barcode/quality-tagged is
/// left untouched, since no collision rule is specified for it.
fn merge_emptied_mate(
    template: &mut Template,
    policy: CollisionPolicy,
    merge_keep_list: &[SamTag],
    barcode_quality_tags: &[SamTag],
) -> DemuxResult<()> {
    if template.records.len() != 2 {
        return Ok(());
    }
    let empty_idx = template.records.iter().position(|r| r.seq_len() == 0);
    let Some(empty_idx) = empty_idx else { return Ok(()) };
    let keep_idx = 1 - empty_idx;
    if template.records[keep_idx].seq_len() == 0 {
        return Ok(()); // both empty: nothing sensible to merge into
    }

    let empty = template.records[empty_idx].clone();
    {
        let keep = &mut template.records[keep_idx];
        for tag in merge_keep_list {
            let Some(value) = aux_codec::get_aux(&empty, tag) else { continue };
            let already_present = aux_codec::get_aux(keep, tag).is_some();
            if !already_present {
                aux_codec::append_typed(keep, tag, &value)?;
            } else if barcode_quality_tags.contains(tag) {
                if let AuxValue::Str(s) = &value {
                    write_tag(keep, tag, s.as_bytes(), policy, false)?;
                }
            }
        }
        keep.unset_paired();
        keep.unset_first_in_template();
        keep.unset_last_in_template();
    }
    template.records.remove(empty_idx);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_htslib::bam::record::Record as HtsRecord;

    fn record(qname: &str, seq: &[u8]) -> HtsRecord {
        let mut r = HtsRecord::new();
        let qual = vec![40u8; seq.len()];
        r.set(qname.as_bytes(), None, seq, &qual);
        r
    }

    #[test]
    fn excises_span_into_tag_and_compacts() {
        let mut template = Template { records: vec![record("q1", b"AAACGTACGT")] };
        let spans = vec![TagSpan {
            span: Span { record_index: 0, from: 1, to: 4 },
            barcode_tag: SamTag::from_str("BC").unwrap(),
            quality_tag: SamTag::from_str("QT").unwrap(),
        }];
        apply_spans(&mut template, &spans, CollisionPolicy::Reject, &[]).unwrap();
        assert_eq!(template.records[0].seq().as_bytes(), b"CGTACGT");
        let tag = SamTag::from_str("BC").unwrap();
        assert_eq!(
            aux_codec::get_aux(&template.records[0], &tag),
            Some(AuxValue::Str("AAA".to_string()))
        );
    }

    #[test]
    fn duplicate_tag_rejected_by_default_policy() {
        let mut template = Template { records: vec![record("q1", b"AAACGTACGT")] };
        let tag = SamTag::from_str("BC").unwrap();
        aux_codec::append_typed(
            &mut template.records[0],
            &tag,
            &AuxValue::Str("X".to_string()),
        )
        .unwrap();
        let spans = vec![TagSpan {
            span: Span { record_index: 0, from: 1, to: 4 },
            barcode_tag: tag,
            quality_tag: SamTag::from_str("QT").unwrap(),
        }];
        let err = apply_spans(&mut template, &spans, CollisionPolicy::Reject, &[]).unwrap_err();
        assert!(matches!(err, DemuxError::DuplicateTag { .. }));
    }
}
