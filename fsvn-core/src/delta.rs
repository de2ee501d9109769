//! Binary delta codec
//!
//! A [`DeltaWindow`] rebuilds a target text from a view of a source text using
//! two instructions: copy a run of bytes out of the source view, or copy the
//! next run of bytes out of the window's inline new data. Every window carries
//! the checksum of the text it produces, and applying it refuses to read past
//! the declared source view or to yield a text with a different checksum.
//!
//! Windows travel in svndiff form:
//!
//! ```text
//! "SVN\0"
//! varint source_offset | varint source_len | varint target_len
//! varint instructions_len | varint new_data_len
//! instructions | new data
//! u8 checksum_kind | varint digest_len | digest
//! ```

use std::collections::HashMap;

use crate::checksum::{Checksum, ChecksumKind};
use crate::error::{FsError, Result};

/// Largest run of new data a single instruction carries
pub const MAX_DATA_CHUNK: usize = 100 * 1024;

/// Length of the source blocks indexed by the encoder
const MATCH_BLOCK: usize = 8;

const SVNDIFF_HEADER: &[u8; 4] = b"SVN\0";

const ACTION_SOURCE: u8 = 0;
const ACTION_TARGET: u8 = 1;
const ACTION_NEW: u8 = 2;

/// One delta instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOp {
    /// Copy `len` bytes starting at `offset` within the source view
    CopySource { offset: u64, len: u64 },
    /// Copy the next `len` bytes of the window's new data
    NewData { len: u64 },
}

/// A self-describing delta between a source view and a target text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaWindow {
    pub source_offset: u64,
    pub source_len: u64,
    pub target_len: u64,
    pub ops: Vec<DeltaOp>,
    pub new_data: Vec<u8>,
    pub checksum: Checksum,
}

impl DeltaWindow {
    /// A window that rebuilds `data` without reading any source
    pub fn replacement(kind: ChecksumKind, data: &[u8]) -> Self {
        let mut window = DeltaWindow {
            source_offset: 0,
            source_len: 0,
            target_len: data.len() as u64,
            ops: Vec::new(),
            new_data: Vec::with_capacity(data.len()),
            checksum: Checksum::compute(kind, data),
        };
        window.push_new_data(data);
        window
    }

    pub fn is_replacement(&self) -> bool {
        self.source_len == 0
            && self
                .ops
                .iter()
                .all(|op| matches!(op, DeltaOp::NewData { .. }))
    }

    fn push_new_data(&mut self, data: &[u8]) {
        for chunk in data.chunks(MAX_DATA_CHUNK) {
            match self.ops.last_mut() {
                Some(DeltaOp::NewData { len })
                    if (*len as usize) + chunk.len() <= MAX_DATA_CHUNK =>
                {
                    *len += chunk.len() as u64;
                }
                _ => self.ops.push(DeltaOp::NewData {
                    len: chunk.len() as u64,
                }),
            }
            self.new_data.extend_from_slice(chunk);
        }
    }

    /// Serialize to svndiff
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut instructions = Vec::with_capacity(self.ops.len() * 4);
        for op in &self.ops {
            match *op {
                DeltaOp::CopySource { offset, len } => {
                    write_instruction(&mut instructions, ACTION_SOURCE, len);
                    write_varint(&mut instructions, offset);
                }
                DeltaOp::NewData { len } => {
                    write_instruction(&mut instructions, ACTION_NEW, len);
                }
            }
        }

        let mut out = Vec::with_capacity(64 + instructions.len() + self.new_data.len());
        out.extend_from_slice(SVNDIFF_HEADER);
        write_varint(&mut out, self.source_offset);
        write_varint(&mut out, self.source_len);
        write_varint(&mut out, self.target_len);
        write_varint(&mut out, instructions.len() as u64);
        write_varint(&mut out, self.new_data.len() as u64);
        out.extend_from_slice(&instructions);
        out.extend_from_slice(&self.new_data);
        out.push(self.checksum.kind.tag());
        write_varint(&mut out, self.checksum.digest.len() as u64);
        out.extend_from_slice(&self.checksum.digest);
        out
    }

    /// Parse an svndiff-encoded window
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < SVNDIFF_HEADER.len() || &data[..4] != SVNDIFF_HEADER {
            return Err(FsError::corrupt_delta("missing svndiff header"));
        }
        let mut reader = Reader { data, pos: 4 };
        let source_offset = reader.varint()?;
        let source_len = reader.varint()?;
        let target_len = reader.varint()?;
        let instructions_len = reader.varint()?;
        let new_data_len = reader.varint()?;

        let instructions = reader.take(instructions_len, "instruction section")?;
        let new_data = reader.take(new_data_len, "new data section")?.to_vec();

        let mut ops = Vec::new();
        let mut ins = Reader {
            data: instructions,
            pos: 0,
        };
        while !ins.at_end() {
            let byte = ins.byte()?;
            let action = byte >> 6;
            let len = match (byte & 0x3f) as u64 {
                0 => ins.varint()?,
                n => n,
            };
            match action {
                ACTION_SOURCE => {
                    let offset = ins.varint()?;
                    ops.push(DeltaOp::CopySource { offset, len });
                }
                ACTION_NEW => ops.push(DeltaOp::NewData { len }),
                ACTION_TARGET => {
                    return Err(FsError::corrupt_delta(
                        "copy-from-target instructions are not supported",
                    ));
                }
                _ => {
                    return Err(FsError::corrupt_delta(format!(
                        "invalid instruction action {}",
                        action
                    )));
                }
            }
        }

        let kind = ChecksumKind::from_tag(reader.byte()?)?;
        let digest_len = reader.varint()?;
        let digest = reader.take(digest_len, "checksum")?.to_vec();
        let checksum = Checksum::from_digest(kind, digest)?;

        if !reader.at_end() {
            return Err(FsError::corrupt_delta(format!(
                "{} trailing bytes after window",
                data.len() - reader.pos
            )));
        }

        Ok(DeltaWindow {
            source_offset,
            source_len,
            target_len,
            ops,
            new_data,
            checksum,
        })
    }
}

/// Compute a window that rebuilds `target` from `source`.
///
/// Source copies are preferred wherever a run of at least eight bytes
/// matches; everything else travels as new data. Identical inputs always
/// produce identical windows. When nothing matches the result is a
/// replacement window.
pub fn encode(kind: ChecksumKind, source: &[u8], target: &[u8]) -> DeltaWindow {
    if source.len() < MATCH_BLOCK || target.len() < MATCH_BLOCK {
        return DeltaWindow::replacement(kind, target);
    }

    // First occurrence of each aligned source block
    let mut index: HashMap<&[u8], usize> = HashMap::with_capacity(source.len() / MATCH_BLOCK);
    for start in (0..=source.len() - MATCH_BLOCK).step_by(MATCH_BLOCK) {
        index
            .entry(&source[start..start + MATCH_BLOCK])
            .or_insert(start);
    }

    let mut window = DeltaWindow {
        source_offset: 0,
        source_len: source.len() as u64,
        target_len: target.len() as u64,
        ops: Vec::new(),
        new_data: Vec::new(),
        checksum: Checksum::compute(kind, target),
    };

    let mut pending = 0;
    let mut pos = 0;
    let mut copied = false;
    while pos + MATCH_BLOCK <= target.len() {
        let Some(&found) = index.get(&target[pos..pos + MATCH_BLOCK]) else {
            pos += 1;
            continue;
        };

        // Grow the match backwards into pending new data, then forwards
        let (mut src, mut tgt) = (found, pos);
        while src > 0 && tgt > pending && source[src - 1] == target[tgt - 1] {
            src -= 1;
            tgt -= 1;
        }
        let mut len = pos + MATCH_BLOCK - tgt;
        while src + len < source.len() && tgt + len < target.len() && source[src + len] == target[tgt + len]
        {
            len += 1;
        }

        window.push_new_data(&target[pending..tgt]);
        window.ops.push(DeltaOp::CopySource {
            offset: src as u64,
            len: len as u64,
        });
        copied = true;
        pos = tgt + len;
        pending = pos;
    }
    window.push_new_data(&target[pending..]);

    if !copied {
        return DeltaWindow::replacement(kind, target);
    }
    window
}

/// Rebuild the target text of `window` from `source`.
///
/// Fails with `CorruptDelta` when the source view lies outside `source`, when
/// an instruction reaches past the source view or the new data, when the
/// output length disagrees with the declared target length, or when the
/// result does not match the window checksum.
pub fn apply(window: &DeltaWindow, source: &[u8]) -> Result<Vec<u8>> {
    let overflow = || FsError::corrupt_delta("source view overflows");
    let view_start = usize::try_from(window.source_offset).map_err(|_| overflow())?;
    let view_end = window
        .source_offset
        .checked_add(window.source_len)
        .and_then(|end| usize::try_from(end).ok())
        .ok_or_else(overflow)?;
    if window.source_len > 0 && view_end > source.len() {
        return Err(FsError::corrupt_delta(format!(
            "source view {}..{} exceeds source of {} bytes",
            view_start,
            view_end,
            source.len()
        )));
    }
    let view: &[u8] = if window.source_len > 0 {
        &source[view_start..view_end]
    } else {
        &[]
    };

    let target_len = usize::try_from(window.target_len)
        .map_err(|_| FsError::corrupt_delta("target length overflows"))?;
    let mut out = Vec::with_capacity(target_len.min(64 * 1024 * 1024));
    let mut cursor = 0usize;
    for op in &window.ops {
        let len = match *op {
            DeltaOp::CopySource { len, .. } | DeltaOp::NewData { len } => len,
        };
        let produced = usize::try_from(len)
            .ok()
            .and_then(|len| out.len().checked_add(len))
            .filter(|produced| *produced <= target_len);
        if produced.is_none() {
            return Err(FsError::corrupt_delta(format!(
                "instructions produce more than the declared {} bytes",
                target_len
            )));
        }
        match *op {
            DeltaOp::CopySource { offset, len } => {
                let end = offset
                    .checked_add(len)
                    .filter(|end| *end <= window.source_len)
                    .ok_or_else(|| {
                        FsError::corrupt_delta(format!(
                            "copy of {} bytes at offset {} reads past source length {}",
                            len, offset, window.source_len
                        ))
                    })?;
                out.extend_from_slice(&view[offset as usize..end as usize]);
            }
            DeltaOp::NewData { len } => {
                let end = usize::try_from(len)
                    .ok()
                    .and_then(|len| cursor.checked_add(len))
                    .filter(|end| *end <= window.new_data.len())
                    .ok_or_else(|| {
                        FsError::corrupt_delta(format!(
                            "new data copy of {} bytes at {} exceeds {} bytes of new data",
                            len,
                            cursor,
                            window.new_data.len()
                        ))
                    })?;
                out.extend_from_slice(&window.new_data[cursor..end]);
                cursor = end;
            }
        }
    }

    if out.len() != target_len {
        return Err(FsError::corrupt_delta(format!(
            "produced {} bytes, window declares {}",
            out.len(),
            target_len
        )));
    }
    if cursor != window.new_data.len() {
        return Err(FsError::corrupt_delta(format!(
            "{} bytes of new data left unused",
            window.new_data.len() - cursor
        )));
    }
    let actual = Checksum::compute(window.checksum.kind, &out);
    if actual != window.checksum {
        return Err(FsError::corrupt_delta(format!(
            "checksum mismatch: expected {}, actual {}",
            window.checksum, actual
        )));
    }
    Ok(out)
}

fn write_instruction(out: &mut Vec<u8>, action: u8, len: u64) {
    if (1..=0x3f).contains(&len) {
        out.push((action << 6) | len as u8);
    } else {
        out.push(action << 6);
        write_varint(out, len);
    }
}

/// Big-endian base-128 integer, high bit set on every byte but the last
fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    let mut buf = [0u8; 10];
    let mut i = buf.len();
    loop {
        i -= 1;
        buf[i] = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            break;
        }
    }
    let last = buf.len() - 1;
    for b in &mut buf[i..last] {
        *b |= 0x80;
    }
    out.extend_from_slice(&buf[i..]);
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn byte(&mut self) -> Result<u8> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or_else(|| FsError::corrupt_delta("unexpected end of window"))?;
        self.pos += 1;
        Ok(b)
    }

    fn varint(&mut self) -> Result<u64> {
        let mut value: u64 = 0;
        for _ in 0..10 {
            let b = self.byte()?;
            value = value
                .checked_shl(7)
                .filter(|v| v >> 7 == value)
                .ok_or_else(|| FsError::corrupt_delta("varint overflow"))?
                | (b & 0x7f) as u64;
            if b & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(FsError::corrupt_delta("varint too long"))
    }

    fn take(&mut self, len: u64, what: &str) -> Result<&'a [u8]> {
        let end = (self.pos as u64)
            .checked_add(len)
            .filter(|end| *end <= self.data.len() as u64)
            .ok_or_else(|| FsError::corrupt_delta(format!("truncated {}", what)))?
            as usize;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const KIND: ChecksumKind = ChecksumKind::Sha256;

    #[test]
    fn test_hello_world_delta() {
        let source = b"hello\nthis line stays the same\n";
        let target = b"hello world\nthis line stays the same\n";
        let window = encode(KIND, source, target);

        assert!(!window.is_replacement());
        assert!(
            window
                .ops
                .iter()
                .any(|op| matches!(op, DeltaOp::CopySource { .. }))
        );
        assert!(window.new_data.len() < target.len());
        assert_eq!(apply(&window, source).unwrap(), target);
    }

    #[test]
    fn test_replacement_for_unrelated_content() {
        let window = encode(KIND, b"abcdefghijklmnop", b"0123456789012345");
        assert!(window.is_replacement());
        assert_eq!(window.source_len, 0);
        assert_eq!(apply(&window, b"").unwrap(), b"0123456789012345");
    }

    #[test]
    fn test_encode_is_deterministic() {
        let source: Vec<u8> = (0..4096).map(|i| (i % 251) as u8).collect();
        let mut target = source.clone();
        target[1000] ^= 0xff;
        target.extend_from_slice(b"tail");
        assert_eq!(encode(KIND, &source, &target), encode(KIND, &source, &target));
    }

    #[test]
    fn test_empty_target() {
        let window = encode(KIND, b"some source text", b"");
        assert_eq!(window.target_len, 0);
        assert_eq!(apply(&window, b"some source text").unwrap(), b"");
    }

    #[test]
    fn test_copy_past_source_length_is_corrupt() {
        let mut window = encode(KIND, b"0123456789abcdef", b"0123456789abcdef!");
        window.ops[0] = DeltaOp::CopySource { offset: 10, len: 16 };
        let err = apply(&window, b"0123456789abcdef").unwrap_err();
        assert!(matches!(err, FsError::CorruptDelta { .. }));
    }

    #[test]
    fn test_source_view_outside_source_is_corrupt() {
        let window = encode(KIND, b"0123456789abcdef", b"0123456789abcdef");
        let err = apply(&window, b"0123").unwrap_err();
        assert!(matches!(err, FsError::CorruptDelta { .. }));
    }

    #[test]
    fn test_checksum_mismatch_is_corrupt() {
        let source = b"0123456789abcdef0123";
        let window = encode(KIND, source, b"0123456789abcdefXYZ");
        let mut other = source.to_vec();
        other[3] = b'!';
        let err = apply(&window, &other).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn test_new_data_overrun_is_corrupt() {
        let mut window = DeltaWindow::replacement(KIND, b"abc");
        window.ops = vec![DeltaOp::NewData { len: 4 }];
        window.target_len = 4;
        assert!(apply(&window, b"").is_err());
    }

    #[test]
    fn test_wire_window_with_huge_lengths_is_corrupt() {
        let mut window = DeltaWindow::replacement(KIND, b"a");
        window.ops = vec![DeltaOp::NewData { len: 1 }, DeltaOp::NewData { len: u64::MAX }];
        let parsed = DeltaWindow::from_bytes(&window.to_bytes()).unwrap();
        assert!(matches!(apply(&parsed, b""), Err(FsError::CorruptDelta { .. })));

        let mut window = DeltaWindow::replacement(KIND, b"a");
        window.target_len = u64::MAX;
        window.ops = vec![DeltaOp::NewData { len: 1 }, DeltaOp::NewData { len: u64::MAX - 1 }];
        let parsed = DeltaWindow::from_bytes(&window.to_bytes()).unwrap();
        assert!(matches!(apply(&parsed, b""), Err(FsError::CorruptDelta { .. })));

        let mut window = DeltaWindow::replacement(KIND, b"");
        window.source_offset = u64::MAX;
        window.source_len = 2;
        window.ops = vec![DeltaOp::CopySource { offset: 0, len: 1 }];
        window.target_len = 1;
        let parsed = DeltaWindow::from_bytes(&window.to_bytes()).unwrap();
        assert!(matches!(apply(&parsed, b"xy"), Err(FsError::CorruptDelta { .. })));
    }

    #[test]
    fn test_svndiff_roundtrip_and_layout() {
        let source = b"The quick brown fox jumps over the lazy dog";
        let target = b"The quick brown cat jumps over the lazy dog!";
        let window = encode(ChecksumKind::Sha1, source, target);
        let bytes = window.to_bytes();

        assert_eq!(&bytes[..4], b"SVN\0");
        let parsed = DeltaWindow::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, window);
        assert_eq!(apply(&parsed, source).unwrap(), target);
    }

    #[test]
    fn test_svndiff_rejects_garbage() {
        assert!(DeltaWindow::from_bytes(b"").is_err());
        assert!(DeltaWindow::from_bytes(b"GIT\0").is_err());

        let bytes = DeltaWindow::replacement(KIND, b"payload").to_bytes();
        assert!(DeltaWindow::from_bytes(&bytes[..bytes.len() - 3]).is_err());

        let mut trailing = bytes.clone();
        trailing.push(0);
        assert!(DeltaWindow::from_bytes(&trailing).is_err());
    }

    #[test]
    fn test_svndiff_rejects_target_copies() {
        // source view 0/0, target 1, one instruction byte, no new data
        let mut bytes = b"SVN\0".to_vec();
        bytes.extend_from_slice(&[0, 0, 1, 2, 0]);
        bytes.extend_from_slice(&[(ACTION_TARGET << 6) | 1, 0]);
        assert!(DeltaWindow::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_varint_encoding() {
        let mut out = Vec::new();
        write_varint(&mut out, 0);
        write_varint(&mut out, 0x7f);
        write_varint(&mut out, 0x80);
        write_varint(&mut out, 300);
        assert_eq!(out, vec![0x00, 0x7f, 0x81, 0x00, 0x82, 0x2c]);

        let mut reader = Reader { data: &out, pos: 0 };
        assert_eq!(reader.varint().unwrap(), 0);
        assert_eq!(reader.varint().unwrap(), 0x7f);
        assert_eq!(reader.varint().unwrap(), 0x80);
        assert_eq!(reader.varint().unwrap(), 300);
    }

    #[test]
    fn test_long_instruction_lengths() {
        let data = vec![7u8; 1000];
        let window = DeltaWindow::replacement(KIND, &data);
        let parsed = DeltaWindow::from_bytes(&window.to_bytes()).unwrap();
        assert_eq!(parsed.ops, vec![DeltaOp::NewData { len: 1000 }]);
    }

    #[test]
    fn test_replacement_chunks_new_data() {
        let data = vec![1u8; MAX_DATA_CHUNK * 2 + 10];
        let window = DeltaWindow::replacement(KIND, &data);
        assert_eq!(window.ops.len(), 3);
        assert_eq!(apply(&window, b"").unwrap(), data);
    }

    proptest! {
        #[test]
        fn prop_apply_inverts_encode(
            source in proptest::collection::vec(any::<u8>(), 0..2048),
            target in proptest::collection::vec(any::<u8>(), 0..2048),
        ) {
            let window = encode(KIND, &source, &target);
            prop_assert_eq!(apply(&window, &source).unwrap(), target);
        }

        #[test]
        fn prop_edited_text_roundtrips(
            source in proptest::collection::vec(any::<u8>(), 64..4096),
            at in any::<prop::sample::Index>(),
            insert in proptest::collection::vec(any::<u8>(), 0..64),
        ) {
            let cut = at.index(source.len());
            let mut target = source[..cut].to_vec();
            target.extend_from_slice(&insert);
            target.extend_from_slice(&source[cut..]);

            let window = encode(KIND, &source, &target);
            let parsed = DeltaWindow::from_bytes(&window.to_bytes()).unwrap();
            prop_assert_eq!(apply(&parsed, &source).unwrap(), target);
        }
    }
}
