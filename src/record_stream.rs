//! Record Stream: delivers aligned records grouped into templates (runs of
//! records sharing a query name). Adapted from the reference toolkit's
//! `get_serial_reader` plumbing in `command_utils.rs`, generalized from a
//! single flat iterator into a peekable, template-aware one.

use rust_htslib::bam::{self, Read as HtsRead};

use crate::errors::{DemuxError, DemuxResult};
use crate::util::get_query_name_string;

/// A single aligned-read record. The crate treats `rust_htslib::bam::Record`
/// as the concrete "opaque aligned-read record" the design calls for; no
/// algorithmic module reaches past `Record`/`Aux` into htslib internals.
pub type Record = bam::Record;

/// All records in the input that share a query name, in input order.
#[derive(Debug, Default)]
pub struct Template {
    pub records: Vec<Record>,
}

impl Template {
    pub fn qname(&self) -> Option<&[u8]> {
        self.records.first().map(|r| r.qname())
    }

    pub fn qname_string(&self) -> DemuxResult<String> {
        self.records
            .first()
            .ok_or_else(|| {
                DemuxError::InvalidQueryName("empty template".to_string())
            })
            .and_then(|r| {
                get_query_name_string(r)
                    .map_err(|e| DemuxError::InvalidQueryName(e.to_string()))
            })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Wraps a `rust_htslib::bam::Reader` with a one-record lookahead so callers
/// can peek the next qname without consuming it, matching the distilled
/// `next()` / `peek()` / `hasNext()` contract.
pub struct RecordStream {
    reader: bam::Reader,
    lookahead: Option<Record>,
    exhausted: bool,
}

impl RecordStream {
    pub fn new(mut reader: bam::Reader) -> DemuxResult<Self> {
        let lookahead = Self::pull(&mut reader)?;
        let exhausted = lookahead.is_none();
        Ok(Self { reader, lookahead, exhausted })
    }

    pub fn from_path(path: &str) -> DemuxResult<Self> {
        let reader = if path == "-" || path == "stdin" {
            bam::Reader::from_stdin()
        } else {
            bam::Reader::from_path(path)
        }
        .map_err(|e| DemuxError::SourceRead(e.to_string()))?;
        Self::new(reader)
    }

    pub fn header(&self) -> bam::HeaderView {
        self.reader.header().clone()
    }

    fn pull(reader: &mut bam::Reader) -> DemuxResult<Option<Record>> {
        let mut record = Record::new();
        match reader.read(&mut record) {
            Some(Ok(())) => Ok(Some(record)),
            Some(Err(e)) => Err(DemuxError::SourceRead(e.to_string())),
            None => Ok(None),
        }
    }

    pub fn has_next(&self) -> bool {
        !self.exhausted
    }

    pub fn peek(&self) -> Option<&Record> {
        self.lookahead.as_ref()
    }

    pub fn next(&mut self) -> DemuxResult<Option<Record>> {
        if self.exhausted {
            return Ok(None);
        }
        let next_lookahead = Self::pull(&mut self.reader)?;
        let current =
            std::mem::replace(&mut self.lookahead, next_lookahead);
        if self.lookahead.is_none() {
            self.exhausted = true;
        }
        Ok(current)
    }

    /// Consumes records while the lookahead's qname matches `qname`,
    /// building one template. Returns `None` once the stream is drained.
    pub fn load_template(&mut self) -> DemuxResult<Option<Template>> {
        let qname = match self.peek() {
            Some(r) => r.qname().to_vec(),
            None => return Ok(None),
        };
        let mut template = Template::default();
        loop {
            match self.peek() {
                Some(r) if r.qname() == qname.as_slice() => {
                    if let Some(record) = self.next()? {
                        template.records.push(record);
                    }
                }
                _ => break,
            }
        }
        Ok(Some(template))
    }
}

/// Iterator adapter over whole templates, for callers that prefer `for`.
pub struct Templates<'a> {
    stream: &'a mut RecordStream,
}

impl RecordStream {
    pub fn templates(&mut self) -> Templates<'_> {
        Templates { stream: self }
    }
}

impl<'a> Iterator for Templates<'a> {
    type Item = DemuxResult<Template>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.stream.load_template() {
            Ok(Some(t)) => Some(Ok(t)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_htslib::bam::record::Record as HtsRecord;
    use rust_htslib::bam::Header;

    fn make_record(qname: &[u8]) -> HtsRecord {
        let mut rec = HtsRecord::new();
        rec.set(qname, None, b"ACGT", &[30, 30, 30, 30]);
        rec
    }

    fn write_temp_bam(records: &[HtsRecord]) -> tempfile::TempPath {
        let mut header = Header::new();
        header.push_record(
            rust_htslib::bam::header::HeaderRecord::new(b"HD")
                .push_tag(b"VN", "1.6"),
        );
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let path = tmp.into_temp_path();
        {
            let mut writer = bam::Writer::from_path(
                &path,
                &header,
                bam::Format::Sam,
            )
            .unwrap();
            for r in records {
                writer.write(r).unwrap();
            }
        }
        path
    }

    #[test]
    fn groups_records_by_qname_run() {
        let records = vec![
            make_record(b"r1"),
            make_record(b"r1"),
            make_record(b"r2"),
        ];
        let path = write_temp_bam(&records);
        let reader = bam::Reader::from_path(&path).unwrap();
        let mut stream = RecordStream::new(reader).unwrap();
        let t1 = stream.load_template().unwrap().unwrap();
        assert_eq!(t1.len(), 2);
        assert_eq!(t1.qname(), Some(&b"r1"[..]));
        let t2 = stream.load_template().unwrap().unwrap();
        assert_eq!(t2.len(), 1);
        assert!(stream.load_template().unwrap().is_none());
    }
}
