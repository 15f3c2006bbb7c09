use byteorder::{ByteOrder, LittleEndian};
use std::io::{self, Cursor, Read, Write};

#[derive(Debug, Eq, PartialEq)]
pub enum DecodeError {
    UnexpectedEof,
    UnknownTagType(u8),
    InvalidUtf8,
}

#[derive(Debug, Eq, PartialEq)]
pub enum EncodeError {
    StringTooLongForShortForm,
    UnsupportedValue,
}

impl From<io::Error> for DecodeError {
    fn from(_: io::Error) -> Self {
        DecodeError::UnexpectedEof
    }
}

/// A tag key is either a numeric opcode (the common case, and the only representation new-style
/// tags allow) or a short textual name (old-style only).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TagKey {
    Opcode(u8),
    Name(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    Hash([u8; 16]),
    Str(String),
    U32(u32),
    F32(f32),
    Blob(Vec<u8>),
    U16(u16),
    U8(u8),
    U64(u64),
}

impl TagValue {
    /// Picks the narrowest integer representation that fits `v`. Widths below u32 are only
    /// legal in new-style tags, so callers pass `allow_new_style = false` to force u32/u64.
    pub fn auto_uint(v: u64, allow_new_style: bool) -> TagValue {
        if allow_new_style && v <= u64::from(u8::MAX) {
            TagValue::U8(v as u8)
        } else if allow_new_style && v <= u64::from(u16::MAX) {
            TagValue::U16(v as u16)
        } else if v <= u64::from(u32::MAX) {
            TagValue::U32(v as u32)
        } else {
            TagValue::U64(v)
        }
    }
}

/// A decoded tag. `new_style` records which wire form it arrived in so a caller re-encoding it
/// can reproduce the same bytes, as required for canonical round-tripping.
#[derive(Debug, Clone, PartialEq)]
pub struct Tag {
    pub key: TagKey,
    pub value: TagValue,
    pub new_style: bool,
}

/// Result of attempting to decode one tag from the wire.
pub enum TagOutcome {
    Tag(Tag),
    /// A recognized-but-uninterpreted type (BOOL / BOOL_ARRAY / BSOB); bytes were consumed, the
    /// tag carries no information the engine interprets.
    Skipped,
}

const TYPE_HASH: u8 = 0x01;
const TYPE_STRING: u8 = 0x02;
const TYPE_UINT32: u8 = 0x03;
const TYPE_FLOAT32: u8 = 0x04;
const TYPE_BOOL: u8 = 0x05;
const TYPE_BOOL_ARRAY: u8 = 0x06;
const TYPE_BLOB: u8 = 0x07;
const TYPE_UINT16: u8 = 0x08;
const TYPE_UINT8: u8 = 0x09;
const TYPE_BSOB: u8 = 0x0A;
const TYPE_UINT64: u8 = 0x0B;
const SHORT_STRING_LO: u8 = 0x11;
const SHORT_STRING_HI: u8 = 0x20;
const NEW_STYLE_BIT: u8 = 0x80;

fn read_u8(cursor: &mut Cursor<&[u8]>) -> Result<u8, DecodeError> {
    let mut buf = [0u8; 1];
    cursor.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u16(cursor: &mut Cursor<&[u8]>) -> Result<u16, DecodeError> {
    let mut buf = [0u8; 2];
    cursor.read_exact(&mut buf)?;
    Ok(LittleEndian::read_u16(&buf))
}

fn read_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32, DecodeError> {
    let mut buf = [0u8; 4];
    cursor.read_exact(&mut buf)?;
    Ok(LittleEndian::read_u32(&buf))
}

fn read_u64(cursor: &mut Cursor<&[u8]>) -> Result<u64, DecodeError> {
    let mut buf = [0u8; 8];
    cursor.read_exact(&mut buf)?;
    Ok(LittleEndian::read_u64(&buf))
}

fn read_f32(cursor: &mut Cursor<&[u8]>) -> Result<f32, DecodeError> {
    let mut buf = [0u8; 4];
    cursor.read_exact(&mut buf)?;
    Ok(LittleEndian::read_f32(&buf))
}

fn read_exact_vec(cursor: &mut Cursor<&[u8]>, len: usize) -> Result<Vec<u8>, DecodeError> {
    let mut buf = vec![0u8; len];
    cursor.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_key(cursor: &mut Cursor<&[u8]>, new_style: bool) -> Result<TagKey, DecodeError> {
    if new_style {
        Ok(TagKey::Opcode(read_u8(cursor)?))
    } else {
        let len = read_u16(cursor)? as usize;
        if len == 1 {
            Ok(TagKey::Opcode(read_u8(cursor)?))
        } else {
            let bytes = read_exact_vec(cursor, len)?;
            String::from_utf8(bytes)
                .map(TagKey::Name)
                .map_err(|_| DecodeError::InvalidUtf8)
        }
    }
}

/// Decodes a single tag from `cursor`. Returns `Ok(None)` only at end of input with nothing
/// left to read; any partial tag is an error.
pub fn decode_tag(cursor: &mut Cursor<&[u8]>) -> Result<TagOutcome, DecodeError> {
    let raw_type = read_u8(cursor)?;
    let new_style = raw_type & NEW_STYLE_BIT != 0;
    let type_code = raw_type & !NEW_STYLE_BIT;

    let key = read_key(cursor, new_style)?;

    match type_code {
        TYPE_HASH => {
            let bytes = read_exact_vec(cursor, 16)?;
            let mut hash = [0u8; 16];
            hash.copy_from_slice(&bytes);
            Ok(TagOutcome::Tag(Tag {
                key,
                value: TagValue::Hash(hash),
                new_style,
            }))
        }
        TYPE_STRING => {
            let len = read_u16(cursor)? as usize;
            let bytes = read_exact_vec(cursor, len)?;
            let s = String::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8)?;
            Ok(TagOutcome::Tag(Tag {
                key,
                value: TagValue::Str(s),
                new_style,
            }))
        }
        TYPE_UINT32 => Ok(TagOutcome::Tag(Tag {
            key,
            value: TagValue::U32(read_u32(cursor)?),
            new_style,
        })),
        TYPE_FLOAT32 => Ok(TagOutcome::Tag(Tag {
            key,
            value: TagValue::F32(read_f32(cursor)?),
            new_style,
        })),
        TYPE_BLOB => {
            let len = read_u32(cursor)? as usize;
            let bytes = read_exact_vec(cursor, len)?;
            Ok(TagOutcome::Tag(Tag {
                key,
                value: TagValue::Blob(bytes),
                new_style,
            }))
        }
        TYPE_UINT16 => Ok(TagOutcome::Tag(Tag {
            key,
            value: TagValue::U16(read_u16(cursor)?),
            new_style,
        })),
        TYPE_UINT8 => Ok(TagOutcome::Tag(Tag {
            key,
            value: TagValue::U8(read_u8(cursor)?),
            new_style,
        })),
        TYPE_UINT64 => Ok(TagOutcome::Tag(Tag {
            key,
            value: TagValue::U64(read_u64(cursor)?),
            new_style,
        })),
        TYPE_BOOL => {
            read_u8(cursor)?;
            Ok(TagOutcome::Skipped)
        }
        TYPE_BOOL_ARRAY => {
            let bits = read_u16(cursor)? as usize;
            let bytes = (bits + 7) / 8;
            read_exact_vec(cursor, bytes)?;
            Ok(TagOutcome::Skipped)
        }
        TYPE_BSOB => {
            let len = read_u8(cursor)? as usize;
            read_exact_vec(cursor, len)?;
            Ok(TagOutcome::Skipped)
        }
        t if new_style && (SHORT_STRING_LO..=SHORT_STRING_HI).contains(&t) => {
            let len = (t - 0x10) as usize;
            let bytes = read_exact_vec(cursor, len)?;
            let s = String::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8)?;
            Ok(TagOutcome::Tag(Tag {
                key,
                value: TagValue::Str(s),
                new_style,
            }))
        }
        other => Err(DecodeError::UnknownTagType(other)),
    }
}

/// Decodes as many tags as fit entirely within `cursor`, stopping (without erroring) the moment
/// fewer bytes remain than the next tag would need, or the list's declared count is reached.
pub fn decode_tag_list(cursor: &mut Cursor<&[u8]>, count: u32) -> Vec<Tag> {
    let mut tags = Vec::with_capacity(count as usize);

    for _ in 0..count {
        let before = cursor.position();
        match decode_tag(cursor) {
            Ok(TagOutcome::Tag(tag)) => tags.push(tag),
            Ok(TagOutcome::Skipped) => {}
            Err(_) => {
                cursor.set_position(before);
                break;
            }
        }
    }

    tags
}

fn write_key(out: &mut Vec<u8>, key: &TagKey, new_style: bool) {
    match key {
        TagKey::Opcode(op) => {
            if new_style {
                out.push(*op);
            } else {
                let mut len_bytes = [0u8; 2];
                LittleEndian::write_u16(&mut len_bytes, 1);
                out.extend_from_slice(&len_bytes);
                out.push(*op);
            }
        }
        TagKey::Name(name) => {
            debug_assert!(!new_style, "new-style tags only support opcode keys");
            let mut len_bytes = [0u8; 2];
            LittleEndian::write_u16(&mut len_bytes, name.len() as u16);
            out.extend_from_slice(&len_bytes);
            out.extend_from_slice(name.as_bytes());
        }
    }
}

/// Encodes one tag. `new_style` requests the compact wire form (high type bit, single-byte
/// opcode key, inline-length short strings); it is silently ignored for `TagKey::Name` keys,
/// which only old-style tags support.
pub fn encode_tag(tag: &Tag, out: &mut Vec<u8>) -> Result<(), EncodeError> {
    let new_style = tag.new_style && matches!(tag.key, TagKey::Opcode(_));

    match &tag.value {
        TagValue::Str(s) if new_style && s.len() <= 16 => {
            out.push((0x10 + s.len() as u8) | NEW_STYLE_BIT);
            write_key(out, &tag.key, true);
            out.extend_from_slice(s.as_bytes());
        }
        TagValue::Hash(bytes) => {
            out.push(TYPE_HASH | if new_style { NEW_STYLE_BIT } else { 0 });
            write_key(out, &tag.key, new_style);
            out.extend_from_slice(bytes);
        }
        TagValue::Str(s) => {
            out.push(TYPE_STRING | if new_style { NEW_STYLE_BIT } else { 0 });
            write_key(out, &tag.key, new_style);
            let mut len_bytes = [0u8; 2];
            LittleEndian::write_u16(&mut len_bytes, s.len() as u16);
            out.extend_from_slice(&len_bytes);
            out.extend_from_slice(s.as_bytes());
        }
        TagValue::U32(v) => {
            out.push(TYPE_UINT32 | if new_style { NEW_STYLE_BIT } else { 0 });
            write_key(out, &tag.key, new_style);
            let mut bytes = [0u8; 4];
            LittleEndian::write_u32(&mut bytes, *v);
            out.extend_from_slice(&bytes);
        }
        TagValue::F32(v) => {
            out.push(TYPE_FLOAT32 | if new_style { NEW_STYLE_BIT } else { 0 });
            write_key(out, &tag.key, new_style);
            let mut bytes = [0u8; 4];
            LittleEndian::write_f32(&mut bytes, *v);
            out.extend_from_slice(&bytes);
        }
        TagValue::Blob(bytes) => {
            out.push(TYPE_BLOB | if new_style { NEW_STYLE_BIT } else { 0 });
            write_key(out, &tag.key, new_style);
            let mut len_bytes = [0u8; 4];
            LittleEndian::write_u32(&mut len_bytes, bytes.len() as u32);
            out.extend_from_slice(&len_bytes);
            out.extend_from_slice(bytes);
        }
        TagValue::U16(v) => {
            if !new_style {
                return Err(EncodeError::UnsupportedValue);
            }
            out.push(TYPE_UINT16 | NEW_STYLE_BIT);
            write_key(out, &tag.key, true);
            let mut bytes = [0u8; 2];
            LittleEndian::write_u16(&mut bytes, *v);
            out.extend_from_slice(&bytes);
        }
        TagValue::U8(v) => {
            if !new_style {
                return Err(EncodeError::UnsupportedValue);
            }
            out.push(TYPE_UINT8 | NEW_STYLE_BIT);
            write_key(out, &tag.key, true);
            out.push(*v);
        }
        TagValue::U64(v) => {
            out.push(TYPE_UINT64 | if new_style { NEW_STYLE_BIT } else { 0 });
            write_key(out, &tag.key, new_style);
            let mut bytes = [0u8; 8];
            LittleEndian::write_u64(&mut bytes, *v);
            out.extend_from_slice(&bytes);
        }
    }

    Ok(())
}

pub fn encode_tag_list(tags: &[Tag], out: &mut Vec<u8>) -> Result<(), EncodeError> {
    let mut count_bytes = [0u8; 4];
    LittleEndian::write_u32(&mut count_bytes, tags.len() as u32);
    out.extend_from_slice(&count_bytes);

    for tag in tags {
        encode_tag(tag, out)?;
    }

    Ok(())
}

/// Writes a little-endian `u32` -- a thin wrapper kept around for call sites that build wire
/// buffers by hand outside the tag system (packet headers live in `frame.rs`).
pub fn write_u32_le<W: Write>(writer: &mut W, value: u32) -> io::Result<()> {
    let mut bytes = [0u8; 4];
    LittleEndian::write_u32(&mut bytes, value);
    writer.write_all(&bytes)
}
