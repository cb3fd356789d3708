//! Binary container codec for compiled Ark programs.
//!
//! A container is a single byte stream holding a fixed header, the symbol and
//! constant tables, and one framed code segment per page:
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0      | 4    | Magic `a r k 0x00` |
//! | 4      | 2    | Major version (big-endian u16) |
//! | 6      | 2    | Minor version |
//! | 8      | 2    | Patch version |
//! | 10     | 8    | Unix seconds since epoch (big-endian u64) |
//! | 18     | 32   | SHA-256 of everything from offset 50 to EOF |
//! | 50     | …    | Symbol table, constant table, code segments |
//!
//! Each code segment is `CODE_SEGMENT_START · u16 length · length-1 bytes ·
//! HALT`.  The container is stable: identical tables and pages produce
//! identical bytes, barring the timestamp and the recomputed hash.
//!
//! [`serialize`] writes a container; [`Image::read`] parses and verifies one
//! into the runtime image the VM executes.

use sha2::{Digest, Sha256};

use crate::bytecode::{ConstValue, Instruction, Page};

// ─────────────────────────────────────────────────────────────────────────────
// Format constants
// ─────────────────────────────────────────────────────────────────────────────

/// The four magic bytes opening every container.
pub const MAGIC: [u8; 4] = [b'a', b'r', b'k', 0x00];

pub const VERSION_MAJOR: u16 = 0;
pub const VERSION_MINOR: u16 = 4;
pub const VERSION_PATCH: u16 = 0;

/// Bytes before the hash: magic + three version words + timestamp.
const HEADER_LEN: usize = 18;
/// SHA-256 digest width.
const HASH_LEN: usize = 32;
/// Offset of the hashed region (tables + code segments).
const BODY_START: usize = HEADER_LEN + HASH_LEN;

// ─────────────────────────────────────────────────────────────────────────────
// Container error
// ─────────────────────────────────────────────────────────────────────────────

/// A fatal error raised while writing or loading a container.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContainerError {
    #[error("not an ark container (bad magic bytes)")]
    BadMagic,

    #[error("incompatible container version {0}.{1}.{2} (runtime is {VERSION_MAJOR}.{VERSION_MINOR}.{VERSION_PATCH})")]
    VersionMismatch(u16, u16, u16),

    #[error("container hash mismatch: the file is corrupted or was tampered with")]
    HashMismatch,

    #[error("truncated container while reading {0}")]
    Truncated(&'static str),

    #[error("malformed {0} in container")]
    Malformed(&'static str),

    #[error("unknown opcode {byte:#04x} in page {page}")]
    UnknownOpcode { byte: u8, page: usize },

    #[error("code page {0} exceeds the maximum segment size")]
    PageTooLarge(usize),
}

type ContainerResult<T> = Result<T, ContainerError>;

// ─────────────────────────────────────────────────────────────────────────────
// Serialisation
// ─────────────────────────────────────────────────────────────────────────────

/// Serialise tables and pages into a complete container.
///
/// `timestamp` is recorded verbatim so that callers (and tests) control the
/// only non-deterministic header field.
pub fn serialize(
    symbols: &[String],
    constants: &[ConstValue],
    pages: &[Page],
    timestamp: u64,
) -> ContainerResult<Vec<u8>> {
    let mut body = Vec::new();

    // Symbol table.
    body.push(Instruction::SymTableStart as u8);
    push_u16(&mut body, symbols.len() as u16);
    for symbol in symbols {
        body.extend_from_slice(symbol.as_bytes());
        body.push(0);
    }

    // Constant table.
    body.push(Instruction::ValTableStart as u8);
    push_u16(&mut body, constants.len() as u16);
    for constant in constants {
        match constant {
            ConstValue::Number(n) => {
                body.push(Instruction::NumberType as u8);
                body.extend_from_slice(format!("{n}").as_bytes());
            }
            ConstValue::Str(s) => {
                body.push(Instruction::StringType as u8);
                body.extend_from_slice(s.as_bytes());
            }
            ConstValue::PageAddr(page) => {
                body.push(Instruction::FuncType as u8);
                push_u16(&mut body, *page);
            }
        }
        body.push(0);
    }

    // Code segments: length counts the page bytes plus the closing HALT.
    let write_segment = |body: &mut Vec<u8>, page_id: usize, bytes: &[u8]| {
        if bytes.len() + 1 > u16::MAX as usize {
            return Err(ContainerError::PageTooLarge(page_id));
        }
        body.push(Instruction::CodeSegmentStart as u8);
        push_u16(body, (bytes.len() + 1) as u16);
        body.extend_from_slice(bytes);
        body.push(Instruction::Halt as u8);
        Ok(())
    };
    if pages.is_empty() {
        write_segment(&mut body, 0, &[])?;
    } else {
        for (page_id, page) in pages.iter().enumerate() {
            write_segment(&mut body, page_id, page.as_bytes())?;
        }
    }

    // Header, hash, body.
    let mut out = Vec::with_capacity(BODY_START + body.len());
    out.extend_from_slice(&MAGIC);
    push_u16(&mut out, VERSION_MAJOR);
    push_u16(&mut out, VERSION_MINOR);
    push_u16(&mut out, VERSION_PATCH);
    out.extend_from_slice(&timestamp.to_be_bytes());
    out.extend_from_slice(&Sha256::digest(&body));
    out.extend_from_slice(&body);
    Ok(out)
}

#[inline]
fn push_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_be_bytes());
}

// ─────────────────────────────────────────────────────────────────────────────
// Image
// ─────────────────────────────────────────────────────────────────────────────

/// A verified, loaded container: everything the VM needs to execute.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
    pub timestamp: u64,
    /// Symbol names, indexed by symbol id.
    pub symbols: Vec<String>,
    /// Constants, indexed by constant id.
    pub constants: Vec<ConstValue>,
    /// Plugin paths referenced by `PLUGIN` instructions, in first-use order.
    pub plugins: Vec<String>,
    /// All page bytes, concatenated.
    pub pages: Vec<u8>,
    /// Page `p` spans `pages[page_offsets[p]..page_offsets[p + 1]]` (or to the
    /// end of `pages` for the last page).
    pub page_offsets: Vec<usize>,
}

impl Image {
    /// Parse and verify a container.
    ///
    /// Verification is mandatory: bad magic, an incompatible version or a
    /// hash mismatch all fail here, before any instruction executes.
    pub fn read(bytes: &[u8]) -> ContainerResult<Image> {
        if bytes.len() < BODY_START {
            return Err(ContainerError::Truncated("header"));
        }
        if bytes[0..4] != MAGIC {
            return Err(ContainerError::BadMagic);
        }

        let major = read_u16(bytes, 4);
        let minor = read_u16(bytes, 6);
        let patch = read_u16(bytes, 8);
        // Accept containers from the same major line, up to our own minor.
        if major != VERSION_MAJOR || minor > VERSION_MINOR {
            return Err(ContainerError::VersionMismatch(major, minor, patch));
        }

        let timestamp = u64::from_be_bytes(
            bytes[10..18]
                .try_into()
                .map_err(|_| ContainerError::Truncated("timestamp"))?,
        );

        let digest = Sha256::digest(&bytes[BODY_START..]);
        if digest.as_slice() != &bytes[HEADER_LEN..BODY_START] {
            return Err(ContainerError::HashMismatch);
        }

        let mut reader = Reader {
            bytes,
            pos: BODY_START,
        };
        let symbols = read_symbol_table(&mut reader)?;
        let constants = read_constant_table(&mut reader)?;
        let (pages, page_offsets) = read_code_segments(&mut reader)?;

        let mut image = Image {
            major,
            minor,
            patch,
            timestamp,
            symbols,
            constants,
            plugins: Vec::new(),
            pages,
            page_offsets,
        };
        image.plugins = image.collect_plugins()?;
        Ok(image)
    }

    /// Number of pages in the image.
    pub fn page_count(&self) -> usize {
        self.page_offsets.len()
    }

    /// The bytes of page `p`.
    pub fn page(&self, p: usize) -> &[u8] {
        let start = self.page_offsets[p];
        let end = self
            .page_offsets
            .get(p + 1)
            .copied()
            .unwrap_or(self.pages.len());
        &self.pages[start..end]
    }

    /// Re-serialise the image.  Loading a container and serialising the
    /// result reproduces the input bytes exactly.
    pub fn serialize(&self) -> ContainerResult<Vec<u8>> {
        let pages: Vec<Page> = (0..self.page_count())
            .map(|p| {
                let bytes = self.page(p);
                // Strip the framing HALT; serialize() re-appends it.
                let bytes = bytes.strip_suffix(&[Instruction::Halt as u8]).unwrap_or(bytes);
                let mut page = Page::new();
                for byte in bytes {
                    page.push_byte(*byte);
                }
                page
            })
            .collect();
        serialize(&self.symbols, &self.constants, &pages, self.timestamp)
    }

    /// Decode every page, validating opcodes and collecting the paths of
    /// `PLUGIN` instructions in first-use order.
    fn collect_plugins(&self) -> ContainerResult<Vec<String>> {
        let mut plugins = Vec::new();
        for page_id in 0..self.page_count() {
            let code = self.page(page_id);
            let mut offset = 0;
            while offset < code.len() {
                let byte = code[offset];
                let op = Instruction::try_from(byte)
                    .map_err(|byte| ContainerError::UnknownOpcode { byte, page: page_id })?;
                if op.has_operand() {
                    if offset + 3 > code.len() {
                        return Err(ContainerError::Truncated("instruction operand"));
                    }
                    if op == Instruction::Plugin {
                        let id = read_u16(code, offset + 1) as usize;
                        match self.constants.get(id) {
                            Some(ConstValue::Str(path)) => {
                                if !plugins.contains(path) {
                                    plugins.push(path.clone());
                                }
                            }
                            _ => return Err(ContainerError::Malformed("plugin path constant")),
                        }
                    }
                    offset += 3;
                } else {
                    offset += 1;
                }
            }
        }
        Ok(plugins)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Reading helpers
// ─────────────────────────────────────────────────────────────────────────────

#[inline]
fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([bytes[offset], bytes[offset + 1]])
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn u8(&mut self, what: &'static str) -> ContainerResult<u8> {
        let byte = *self
            .bytes
            .get(self.pos)
            .ok_or(ContainerError::Truncated(what))?;
        self.pos += 1;
        Ok(byte)
    }

    fn u16(&mut self, what: &'static str) -> ContainerResult<u16> {
        if self.pos + 2 > self.bytes.len() {
            return Err(ContainerError::Truncated(what));
        }
        let value = read_u16(self.bytes, self.pos);
        self.pos += 2;
        Ok(value)
    }

    fn take(&mut self, n: usize, what: &'static str) -> ContainerResult<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(ContainerError::Truncated(what));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Read bytes up to (and consuming) the next NUL terminator.
    fn until_nul(&mut self, what: &'static str) -> ContainerResult<&'a [u8]> {
        let start = self.pos;
        while let Some(byte) = self.bytes.get(self.pos) {
            self.pos += 1;
            if *byte == 0 {
                return Ok(&self.bytes[start..self.pos - 1]);
            }
        }
        Err(ContainerError::Truncated(what))
    }
}

fn read_symbol_table(reader: &mut Reader) -> ContainerResult<Vec<String>> {
    if reader.u8("symbol table marker")? != Instruction::SymTableStart as u8 {
        return Err(ContainerError::Malformed("symbol table marker"));
    }
    let count = reader.u16("symbol count")?;
    let mut symbols = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let raw = reader.until_nul("symbol name")?;
        let name = std::str::from_utf8(raw).map_err(|_| ContainerError::Malformed("symbol name"))?;
        symbols.push(name.to_string());
    }
    Ok(symbols)
}

fn read_constant_table(reader: &mut Reader) -> ContainerResult<Vec<ConstValue>> {
    if reader.u8("constant table marker")? != Instruction::ValTableStart as u8 {
        return Err(ContainerError::Malformed("constant table marker"));
    }
    let count = reader.u16("constant count")?;
    let mut constants = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let tag = reader.u8("constant tag")?;
        let constant = match Instruction::try_from(tag) {
            Ok(Instruction::NumberType) => {
                let raw = reader.until_nul("number constant")?;
                let text = std::str::from_utf8(raw)
                    .map_err(|_| ContainerError::Malformed("number constant"))?;
                let n = text
                    .parse::<f64>()
                    .map_err(|_| ContainerError::Malformed("number constant"))?;
                ConstValue::Number(n)
            }
            Ok(Instruction::StringType) => {
                let raw = reader.until_nul("string constant")?;
                let s = std::str::from_utf8(raw)
                    .map_err(|_| ContainerError::Malformed("string constant"))?;
                ConstValue::Str(s.to_string())
            }
            Ok(Instruction::FuncType) => {
                let page = reader.u16("page address constant")?;
                if reader.u8("page address terminator")? != 0 {
                    return Err(ContainerError::Malformed("page address terminator"));
                }
                ConstValue::PageAddr(page)
            }
            _ => return Err(ContainerError::Malformed("constant tag")),
        };
        constants.push(constant);
    }
    Ok(constants)
}

fn read_code_segments(reader: &mut Reader) -> ContainerResult<(Vec<u8>, Vec<usize>)> {
    let mut pages = Vec::new();
    let mut page_offsets = Vec::new();
    while !reader.at_end() {
        if reader.u8("code segment marker")? != Instruction::CodeSegmentStart as u8 {
            return Err(ContainerError::Malformed("code segment marker"));
        }
        let len = reader.u16("code segment length")? as usize;
        let code = reader.take(len, "code segment")?;
        page_offsets.push(pages.len());
        pages.extend_from_slice(code);
    }
    if page_offsets.is_empty() {
        return Err(ContainerError::Truncated("code segments"));
    }
    Ok((pages, page_offsets))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_container() -> Vec<u8> {
        let mut page = Page::new();
        page.push_op(Instruction::LoadConst);
        page.push_u16(0);
        let symbols = vec!["x".to_string(), "long_name".to_string()];
        let constants = vec![
            ConstValue::Number(42.5),
            ConstValue::Str("hello\nworld".to_string()),
            ConstValue::PageAddr(0),
        ];
        serialize(&symbols, &constants, &[page], 1_700_000_000).unwrap()
    }

    #[test]
    fn test_read_roundtrip() {
        let bytes = sample_container();
        let image = Image::read(&bytes).unwrap();
        assert_eq!(image.symbols, vec!["x", "long_name"]);
        assert_eq!(image.constants.len(), 3);
        assert_eq!(image.constants[0], ConstValue::Number(42.5));
        assert_eq!(image.constants[2], ConstValue::PageAddr(0));
        assert_eq!(image.timestamp, 1_700_000_000);
        assert_eq!(image.page_count(), 1);
        // Page bytes include the framing HALT.
        assert_eq!(image.page(0).last(), Some(&(Instruction::Halt as u8)));
        // Serialising the image reproduces the input bytes exactly.
        assert_eq!(image.serialize().unwrap(), bytes);
    }

    #[test]
    fn test_empty_page_set_still_emits_one_halt_segment() {
        let bytes = serialize(&[], &[], &[], 0).unwrap();
        let image = Image::read(&bytes).unwrap();
        assert_eq!(image.page_count(), 1);
        assert_eq!(image.page(0), &[Instruction::Halt as u8]);
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = sample_container();
        bytes[0] = b'z';
        assert_eq!(Image::read(&bytes), Err(ContainerError::BadMagic));
    }

    #[test]
    fn test_version_mismatch() {
        let mut bytes = sample_container();
        bytes[4] = 0xff; // major
        assert!(matches!(
            Image::read(&bytes),
            Err(ContainerError::VersionMismatch(..))
        ));
        let mut bytes = sample_container();
        bytes[7] = 0xff; // minor, far beyond ours
        assert!(matches!(
            Image::read(&bytes),
            Err(ContainerError::VersionMismatch(..))
        ));
    }

    #[test]
    fn test_flipped_code_byte_fails_hash_verification() {
        let mut bytes = sample_container();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        assert_eq!(Image::read(&bytes), Err(ContainerError::HashMismatch));
    }

    #[test]
    fn test_truncated_container() {
        let bytes = sample_container();
        assert!(matches!(
            Image::read(&bytes[..10]),
            Err(ContainerError::Truncated(_))
        ));
    }

    #[test]
    fn test_timestamp_does_not_affect_hash_verification() {
        let mut bytes = sample_container();
        bytes[17] ^= 0xff; // low timestamp byte is outside the hashed region
        let image = Image::read(&bytes).unwrap();
        assert_ne!(image.timestamp, 1_700_000_000);
    }
}
