//! # Module
//!
//! The immutable, shared module a debugged instance was created from.
//!
//! A [`Module`] owns the canonical binary bytes (the address space every
//! [`BytecodeOffset`](crate::types::BytecodeOffset) points into) together with
//! a section directory built by a single framing pass over those bytes. Only
//! section headers and custom-section names are read here; decoding and
//! validating function bodies is the compiler's job.
//!
//! Modules are handed around as [`SharedModule`] (`Arc<Module>`) because any
//! number of instances may be created from the same bytes.

use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

use gimli::{EndianSlice, LittleEndian, Reader};

use crate::error::{map_reader_error, Result, TraplineError};

/// Binary module magic number (`\0asm`).
pub const MODULE_MAGIC: [u8; 4] = [0x00, 0x61, 0x73, 0x6d];

/// The only supported binary format version.
pub const MODULE_VERSION: u32 = 1;

/// Name of the custom section carrying the source map URL.
pub const SOURCE_MAPPING_URL_SECTION: &str = "sourceMappingURL";

/// Section id reserved for custom sections.
const CUSTOM_SECTION_ID: u8 = 0;

/// Reference-counted module handle.
pub type SharedModule = Arc<Module>;

/// Immutable byte buffer that can be shared between modules and code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareableBytes
{
    bytes: Vec<u8>,
}

impl ShareableBytes
{
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self
    {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8]
    {
        &self.bytes
    }

    /// Heap bytes owned by the buffer.
    #[must_use]
    pub fn size_of_excluding_this(&self) -> usize
    {
        self.bytes.capacity()
    }
}

/// One entry of the module's section directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionHeader
{
    /// Binary section id (0 for custom sections).
    pub id: u8,
    /// Custom section name; `None` for known sections.
    pub name: Option<String>,
    /// Byte range of the section payload (after the name, for custom sections).
    pub payload: Range<usize>,
}

impl SectionHeader
{
    /// Human-readable section kind.
    #[must_use]
    pub fn kind(&self) -> &str
    {
        match self.id {
            CUSTOM_SECTION_ID => self.name.as_deref().unwrap_or("custom"),
            1 => "type",
            2 => "import",
            3 => "function",
            4 => "table",
            5 => "memory",
            6 => "global",
            7 => "export",
            8 => "start",
            9 => "element",
            10 => "code",
            11 => "data",
            12 => "datacount",
            13 => "tag",
            _ => "unknown",
        }
    }
}

/// Immutable binary module.
#[derive(Debug)]
pub struct Module
{
    bytecode: Arc<ShareableBytes>,
    sections: Vec<SectionHeader>,
}

impl Module
{
    /// Build a module from its binary bytes.
    ///
    /// ## Errors
    ///
    /// - `InvalidModule`: bad magic/version or a section overruns the buffer
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self>
    {
        let sections = scan_sections(&bytes)?;
        tracing::debug!(len = bytes.len(), sections = sections.len(), "module loaded");
        Ok(Self {
            bytecode: Arc::new(ShareableBytes::new(bytes)),
            sections,
        })
    }

    /// Read and scan a module file.
    ///
    /// ## Errors
    ///
    /// - `Io`: the file could not be read
    /// - `InvalidModule`: see [`Module::from_bytes`]
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self>
    {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(bytes)
    }

    /// Canonical module bytes used for debugger bytecode access.
    #[must_use]
    pub fn debug_bytecode(&self) -> &[u8]
    {
        self.bytecode.as_slice()
    }

    /// Shared handle to the module bytes.
    #[must_use]
    pub fn bytecode_handle(&self) -> &Arc<ShareableBytes>
    {
        &self.bytecode
    }

    /// All sections in file order.
    #[must_use]
    pub fn sections(&self) -> &[SectionHeader]
    {
        &self.sections
    }

    /// Custom sections in file order.
    pub fn custom_sections(&self) -> impl Iterator<Item = &SectionHeader>
    {
        self.sections.iter().filter(|s| s.id == CUSTOM_SECTION_ID)
    }

    /// Payload of the first custom section called `name`.
    #[must_use]
    pub fn custom_section(&self, name: &str) -> Option<&[u8]>
    {
        self.custom_sections()
            .find(|s| s.name.as_deref() == Some(name))
            .and_then(|s| self.debug_bytecode().get(s.payload.clone()))
    }

    /// URL stored in the `sourceMappingURL` custom section, if any.
    ///
    /// The payload is a LEB128 length followed by UTF-8 bytes. A missing or
    /// malformed section yields `None`.
    #[must_use]
    pub fn source_mapping_url(&self) -> Option<String>
    {
        let payload = self.custom_section(SOURCE_MAPPING_URL_SECTION)?;
        match decode_name(&mut EndianSlice::new(payload, LittleEndian)) {
            Ok(url) => Some(url),
            Err(err) => {
                tracing::debug!("ignoring malformed {SOURCE_MAPPING_URL_SECTION} section: {err}");
                None
            }
        }
    }
}

fn scan_sections(bytes: &[u8]) -> Result<Vec<SectionHeader>>
{
    let mut reader = EndianSlice::new(bytes, LittleEndian);
    let magic = reader.split(4).map_err(|e| map_reader_error("reading magic", e))?;
    if magic.slice() != MODULE_MAGIC {
        return Err(TraplineError::InvalidModule("bad magic number".to_string()));
    }
    let version = reader.read_u32().map_err(|e| map_reader_error("reading version", e))?;
    if version != MODULE_VERSION {
        return Err(TraplineError::InvalidModule(format!("unsupported version {version}")));
    }

    let mut sections = Vec::new();
    while !reader.is_empty() {
        let id = reader.read_u8().map_err(|e| map_reader_error("reading section id", e))?;
        let size = gimli::leb128::read::unsigned(&mut reader).map_err(|e| map_reader_error("reading section size", e))?;
        let size = usize::try_from(size)
            .map_err(|_| TraplineError::InvalidModule(format!("section {id} size {size} overflows")))?;
        if size > reader.len() {
            return Err(TraplineError::InvalidModule(format!(
                "section {id} of {size} bytes overruns module ({} bytes left)",
                reader.len()
            )));
        }
        let mut payload = reader.split(size).map_err(|e| map_reader_error("splitting section", e))?;

        let name = if id == CUSTOM_SECTION_ID {
            Some(decode_name(&mut payload)?)
        } else {
            None
        };
        let start = bytes.len() - reader.len() - payload.len();
        sections.push(SectionHeader {
            id,
            name,
            payload: start..start + payload.len(),
        });
    }
    Ok(sections)
}

/// Decode a LEB128-length-prefixed UTF-8 string.
pub(crate) fn decode_name(reader: &mut EndianSlice<'_, LittleEndian>) -> Result<String>
{
    let len = gimli::leb128::read::unsigned(reader).map_err(|e| map_reader_error("reading name length", e))?;
    let len = usize::try_from(len).map_err(|_| TraplineError::InvalidModule(format!("name length {len} overflows")))?;
    if len > reader.len() {
        return Err(TraplineError::InvalidModule(format!("name of {len} bytes overruns section")));
    }
    let raw = reader.split(len).map_err(|e| map_reader_error("reading name", e))?;
    String::from_utf8(raw.slice().to_vec()).map_err(|e| TraplineError::InvalidModule(format!("name is not UTF-8: {e}")))
}
