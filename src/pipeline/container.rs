//! XTC / XTCH container layout and random-access reader.
//!
//! ```text
//! ┌────────────────────┐ 0x00
//! │ header (48 bytes)  │ magic, version, depth, orientation, counts,
//! │                    │ dimensions, section offsets
//! ├────────────────────┤ metadata offset
//! │ title, author      │ u32 length + UTF-8
//! ├────────────────────┤ toc offset
//! │ chapter entries    │ u32 length + UTF-8 title, u32 start page
//! ├────────────────────┤ page index offset
//! │ page index         │ u64 offset + u32 length per page
//! ├────────────────────┤ page data offset
//! │ page planes        │ concatenated in page order
//! └────────────────────┘
//! ```
//!
//! All integers are little-endian.

use crate::config::{BitDepth, Orientation};
use crate::error::InkError;
use crate::output::{BookMetadata, ChapterEntry};
use crate::pipeline::index::PageSpan;
use crate::pipeline::quantize::plane_len;
use serde::Serialize;

pub const MAGIC_1BIT: [u8; 4] = *b"XTC\0";
pub const MAGIC_2BIT: [u8; 4] = *b"XTCH";
pub const FORMAT_VERSION: u16 = 1;
pub const HEADER_LEN: usize = 48;
pub const PAGE_INDEX_ENTRY_LEN: usize = 12;

pub fn magic_for(bit_depth: BitDepth) -> [u8; 4] {
    match bit_depth {
        BitDepth::One => MAGIC_1BIT,
        BitDepth::Two => MAGIC_2BIT,
    }
}

/// Decoded fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ContainerHeader {
    pub version: u16,
    pub bit_depth: u8,
    pub orientation_degrees: u16,
    pub page_count: u32,
    pub width: u16,
    pub height: u16,
    pub chapter_count: u32,
    pub metadata_offset: u32,
    pub toc_offset: u32,
    pub page_index_offset: u32,
    pub page_data_offset: u64,
}

/// Parsed view over a container buffer. Page data is never copied.
#[derive(Debug, Clone)]
pub struct ContainerReader<'a> {
    data: &'a [u8],
    header: ContainerHeader,
    metadata: BookMetadata,
    chapters: Vec<ChapterEntry>,
    index: Vec<PageSpan>,
}

fn malformed(msg: impl Into<String>) -> InkError {
    InkError::MalformedContainer(msg.into())
}

/// Bounds-checked little-endian cursor.
struct ByteCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    fn at(data: &'a [u8], pos: usize) -> Result<Self, InkError> {
        if pos > data.len() {
            return Err(malformed(format!(
                "section offset {pos} is past the end ({} bytes)",
                data.len()
            )));
        }
        Ok(Self { data, pos })
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], InkError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| malformed(format!("truncated at byte {}", self.pos)))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], InkError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, InkError> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, InkError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, InkError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, InkError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn string(&mut self) -> Result<String, InkError> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| malformed("string is not UTF-8"))
    }
}

impl<'a> ContainerReader<'a> {
    /// Validate and index a container buffer.
    pub fn parse(data: &'a [u8]) -> Result<Self, InkError> {
        if data.len() < HEADER_LEN {
            return Err(malformed(format!(
                "{} bytes is shorter than the {HEADER_LEN}-byte header",
                data.len()
            )));
        }

        let mut cur = ByteCursor::at(data, 0)?;
        let magic: [u8; 4] = cur.array()?;
        let expected_depth = match magic {
            MAGIC_1BIT => 1,
            MAGIC_2BIT => 2,
            other => return Err(malformed(format!("unknown magic {other:?}"))),
        };
        let version = cur.u16()?;
        if version != FORMAT_VERSION {
            return Err(malformed(format!("unsupported version {version}")));
        }
        let bit_depth = cur.u8()?;
        if bit_depth != expected_depth {
            return Err(malformed(format!(
                "bit depth {bit_depth} does not match the magic"
            )));
        }
        let turns = cur.u8()?;
        let orientation = Orientation::from_quarter_turns(turns)
            .ok_or_else(|| malformed(format!("orientation {turns} out of range")))?;

        let header = ContainerHeader {
            version,
            bit_depth,
            orientation_degrees: orientation.degrees(),
            page_count: cur.u32()?,
            width: cur.u16()?,
            height: cur.u16()?,
            chapter_count: cur.u32()?,
            metadata_offset: cur.u32()?,
            toc_offset: cur.u32()?,
            page_index_offset: cur.u32()?,
            page_data_offset: cur.u64()?,
        };

        let mut cur = ByteCursor::at(data, header.metadata_offset as usize)?;
        let metadata = BookMetadata {
            title: cur.string()?,
            author: cur.string()?,
        };

        let mut cur = ByteCursor::at(data, header.toc_offset as usize)?;
        let mut chapters = Vec::with_capacity(header.chapter_count.min(4096) as usize);
        for _ in 0..header.chapter_count {
            let title = cur.string()?;
            let start_page = cur.u32()?;
            if start_page >= header.page_count {
                return Err(malformed(format!(
                    "chapter '{title}' starts at page {start_page} of {}",
                    header.page_count
                )));
            }
            chapters.push(ChapterEntry { title, start_page });
        }

        let depth = BitDepth::from_bits(bit_depth).unwrap_or_default();
        let expected_len = plane_len(u32::from(header.width), u32::from(header.height), depth);

        let mut cur = ByteCursor::at(data, header.page_index_offset as usize)?;
        let index_len = (header.page_count as usize)
            .checked_mul(PAGE_INDEX_ENTRY_LEN)
            .ok_or_else(|| malformed("page count overflows"))?;
        cur.take(index_len)?;
        let mut cur = ByteCursor::at(data, header.page_index_offset as usize)?;
        let mut index = Vec::with_capacity(header.page_count as usize);
        for page in 0..header.page_count {
            let span = PageSpan {
                offset: cur.u64()?,
                length: cur.u32()?,
            };
            let end = span.offset.checked_add(u64::from(span.length));
            if span.offset < header.page_data_offset
                || end.is_none_or(|end| end > data.len() as u64)
            {
                return Err(malformed(format!("page {page} lies outside the buffer")));
            }
            if span.length as usize != expected_len {
                return Err(malformed(format!(
                    "page {page} is {} bytes, expected {expected_len}",
                    span.length
                )));
            }
            index.push(span);
        }

        Ok(Self {
            data,
            header,
            metadata,
            chapters,
            index,
        })
    }

    pub fn header(&self) -> &ContainerHeader {
        &self.header
    }

    pub fn metadata(&self) -> &BookMetadata {
        &self.metadata
    }

    pub fn chapters(&self) -> &[ChapterEntry] {
        &self.chapters
    }

    pub fn page_index(&self) -> &[PageSpan] {
        &self.index
    }

    pub fn page_count(&self) -> usize {
        self.index.len()
    }

    /// Plane bytes of page `page` (0-based).
    pub fn page(&self, page: usize) -> Option<&'a [u8]> {
        let span = self.index.get(page)?;
        let start = span.offset as usize;
        self.data.get(start..start + span.length as usize)
    }

    /// Index into [`chapters`](Self::chapters) of the chapter containing `page`.
    pub fn chapter_for_page(&self, page: usize) -> Option<usize> {
        if page >= self.index.len() {
            return None;
        }
        let page = page as u32;
        match self.chapters.partition_point(|c| c.start_page <= page) {
            0 => None,
            n => Some(n - 1),
        }
    }
}
