//! Aux-Tag Codec: typed read/update/append/delete over a record's auxiliary
//! tags, plus the growable buffer used anywhere this crate owns its own
//! byte buffer (the Read-to-Tags transformer's compacted sequence, in
//! particular) rather than delegating storage to `rust_htslib`.

use rust_htslib::bam::record::Aux;
use rust_htslib::bam::Record;

use crate::errors::{DemuxError, DemuxResult};
use crate::util::SamTag;

/// A type-erased auxiliary value, independent of `rust_htslib::Aux`'s
/// lifetime so callers can hold values across record mutations.
#[derive(Debug, Clone, PartialEq)]
pub enum AuxValue {
    Str(String),
    Char(u8),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    Float(f32),
    Double(f64),
}

impl AuxValue {
    /// In-record byte length of this value once serialized, used by
    /// binary-layout sizing code (one tag byte for the type code is not
    /// included here; callers that need the full on-wire tag size add 3 for
    /// the two-character name plus the type code).
    pub fn encoded_len(&self) -> usize {
        match self {
            AuxValue::Str(s) => s.len() + 1, // NUL-terminated
            AuxValue::Char(_) | AuxValue::I8(_) | AuxValue::U8(_) => 1,
            AuxValue::I16(_) | AuxValue::U16(_) => 2,
            AuxValue::I32(_) | AuxValue::U32(_) | AuxValue::Float(_) => 4,
            AuxValue::Double(_) => 8,
        }
    }

    fn as_aux(&self) -> Aux<'_> {
        match self {
            AuxValue::Str(s) => Aux::String(s.as_str()),
            AuxValue::Char(c) => Aux::Char(*c),
            AuxValue::I8(v) => Aux::I8(*v),
            AuxValue::U8(v) => Aux::U8(*v),
            AuxValue::I16(v) => Aux::I16(*v),
            AuxValue::U16(v) => Aux::U16(*v),
            AuxValue::I32(v) => Aux::I32(*v),
            AuxValue::U32(v) => Aux::U32(*v),
            AuxValue::Float(v) => Aux::Float(*v),
            AuxValue::Double(v) => Aux::Double(*v),
        }
    }

    fn type_matches(&self, other: &Aux) -> bool {
        matches!(
            (self, other),
            (AuxValue::Str(_), Aux::String(_))
                | (AuxValue::Char(_), Aux::Char(_))
                | (AuxValue::I8(_), Aux::I8(_))
                | (AuxValue::U8(_), Aux::U8(_))
                | (AuxValue::I16(_), Aux::I16(_))
                | (AuxValue::U16(_), Aux::U16(_))
                | (AuxValue::I32(_), Aux::I32(_))
                | (AuxValue::U32(_), Aux::U32(_))
                | (AuxValue::Float(_), Aux::Float(_))
                | (AuxValue::Double(_), Aux::Double(_))
        )
    }
}

pub(crate) fn from_aux(aux: &Aux) -> Option<AuxValue> {
    match aux {
        Aux::String(s) => Some(AuxValue::Str(s.to_string())),
        Aux::Char(c) => Some(AuxValue::Char(*c)),
        Aux::I8(v) => Some(AuxValue::I8(*v)),
        Aux::U8(v) => Some(AuxValue::U8(*v)),
        Aux::I16(v) => Some(AuxValue::I16(*v)),
        Aux::U16(v) => Some(AuxValue::U16(*v)),
        Aux::I32(v) => Some(AuxValue::I32(*v)),
        Aux::U32(v) => Some(AuxValue::U32(*v)),
        Aux::Float(v) => Some(AuxValue::Float(*v)),
        Aux::Double(v) => Some(AuxValue::Double(*v)),
        _ => None,
    }
}

/// Reads a tag's value, if present and of a recognized scalar type.
pub fn get_aux(record: &Record, tag: &SamTag) -> Option<AuxValue> {
    record.aux(tag.as_bytes()).ok().as_ref().and_then(from_aux)
}

/// Replaces an existing `Z`-typed tag's bytes in place (by remove + push,
/// since `rust_htslib` offers no direct in-place rewrite). Fails with
/// `TagTypeMismatch` if the tag exists under a different type.
pub fn update_str(
    record: &mut Record,
    tag: &SamTag,
    value: &str,
) -> DemuxResult<()> {
    if let Ok(existing) = record.aux(tag.as_bytes()) {
        if !matches!(existing, Aux::String(_)) {
            return Err(DemuxError::TagTypeMismatch { tag: tag.to_string() });
        }
        record
            .remove_aux(tag.as_bytes())
            .map_err(|e| DemuxError::Format(e.to_string()))?;
    }
    record
        .push_aux(tag.as_bytes(), Aux::String(value))
        .map_err(|e| DemuxError::Format(e.to_string()))
}

/// Adds a new tag of the given type. Does not itself police duplicates;
/// callers who need a "fail on existing" policy should check `get_aux`
/// first (the Read-to-Tags transformer's collision policy does exactly
/// this).
pub fn append_typed(
    record: &mut Record,
    tag: &SamTag,
    value: &AuxValue,
) -> DemuxResult<()> {
    record
        .push_aux(tag.as_bytes(), value.as_aux())
        .map_err(|e| DemuxError::Format(e.to_string()))
}

/// Overwrites a tag regardless of prior type, failing only on the
/// `rust_htslib` call itself.
pub fn set_typed(
    record: &mut Record,
    tag: &SamTag,
    value: &AuxValue,
) -> DemuxResult<()> {
    if record.aux(tag.as_bytes()).is_ok() {
        record
            .remove_aux(tag.as_bytes())
            .map_err(|e| DemuxError::Format(e.to_string()))?;
    }
    append_typed(record, tag, value)
}

/// Deletes a tag if present; deleting an absent tag is a no-op.
pub fn delete_tag(record: &mut Record, tag: &SamTag) -> DemuxResult<()> {
    match record.remove_aux(tag.as_bytes()) {
        Ok(()) => Ok(()),
        Err(_) => Ok(()),
    }
}

#[inline]
pub(crate) fn next_pow2(n: usize) -> usize {
    if n <= 1 {
        return 1;
    }
    1usize << (usize::BITS - (n - 1).leading_zeros())
}

/// A byte buffer this crate owns directly (not delegated to `rust_htslib`),
/// used by the Read-to-Tags transformer when it builds the compacted
/// sequence/quality arrays. Growth rounds capacity up to the next power of
/// two, per the aux-tag codec's reallocation invariant generalized to any
/// buffer this crate mutates in place.
#[derive(Debug, Default)]
pub struct GrowableBuffer {
    data: Vec<u8>,
}

impl GrowableBuffer {
    pub fn with_capacity_hint(hint: usize) -> Self {
        Self { data: Vec::with_capacity(next_pow2(hint.max(1))) }
    }

    pub fn push(&mut self, byte: u8) {
        if self.data.len() == self.data.capacity() {
            self.data.reserve(next_pow2(self.data.len() + 1) - self.data.len());
        }
        self.data.push(byte);
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        let needed = self.data.len() + bytes.len();
        if needed > self.data.capacity() {
            self.data.reserve(next_pow2(needed) - self.data.len());
        }
        self.data.extend_from_slice(bytes);
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_htslib::bam::record::Record as HtsRecord;

    fn bare_record() -> HtsRecord {
        let mut rec = HtsRecord::new();
        rec.set(b"q1", None, b"ACGT", &[30, 30, 30, 30]);
        rec
    }

    #[test]
    fn update_str_round_trips() {
        let mut rec = bare_record();
        let tag = SamTag::from_str("RG").unwrap();
        append_typed(&mut rec, &tag, &AuxValue::Str("grp1".to_string()))
            .unwrap();
        assert_eq!(get_aux(&rec, &tag), Some(AuxValue::Str("grp1".to_string())));
        update_str(&mut rec, &tag, "grp2").unwrap();
        assert_eq!(get_aux(&rec, &tag), Some(AuxValue::Str("grp2".to_string())));
        // no other tag's value changes
        let other = SamTag::from_str("ci").unwrap();
        append_typed(&mut rec, &other, &AuxValue::I32(7)).unwrap();
        update_str(&mut rec, &tag, "grp3").unwrap();
        assert_eq!(get_aux(&rec, &other), Some(AuxValue::I32(7)));
    }

    #[test]
    fn update_str_rejects_type_mismatch() {
        let mut rec = bare_record();
        let tag = SamTag::from_str("ci").unwrap();
        append_typed(&mut rec, &tag, &AuxValue::I32(3)).unwrap();
        let err = update_str(&mut rec, &tag, "nope").unwrap_err();
        assert!(matches!(err, DemuxError::TagTypeMismatch { .. }));
    }

    #[test]
    fn delete_missing_tag_is_noop() {
        let mut rec = bare_record();
        let tag = SamTag::from_str("zz").unwrap();
        assert!(delete_tag(&mut rec, &tag).is_ok());
    }

    #[test]
    fn next_pow2_rounds_up() {
        assert_eq!(next_pow2(1), 1);
        assert_eq!(next_pow2(2), 2);
        assert_eq!(next_pow2(3), 4);
        assert_eq!(next_pow2(5), 8);
        assert_eq!(next_pow2(16), 16);
        assert_eq!(next_pow2(17), 32);
    }

    #[test]
    fn growable_buffer_extends() {
        let mut buf = GrowableBuffer::with_capacity_hint(2);
        buf.extend_from_slice(b"ACGT");
        assert_eq!(buf.as_slice(), b"ACGT");
        assert_eq!(buf.len(), 4);
    }
}
