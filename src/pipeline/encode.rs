//! Two-pass container encoder.
//!
//! A [`ContainerDocument`] accumulates quantized planes as they come off the
//! dither workers, recording each in a [`PageIndexBuilder`]. When every page
//! has been pushed, [`ContainerDocument::finalize`] runs the two passes:
//!
//! 1. **Size**: metadata, TOC and page-index sections have a fixed shape
//!    once the page count, chapter count and string lengths are known, so
//!    every section offset (including the page-data base stored in the
//!    header) is computed before a single byte is written.
//! 2. **Write**: header, metadata, TOC, page index and page data, in that
//!    order, into a buffer allocated at its final size.
//!
//! Either a complete buffer comes back or an error does; nothing partial.

use crate::config::{BitDepth, DeviceProfile, Orientation};
use crate::error::{EncodingError, InkError};
use crate::output::{BookMetadata, ChapterEntry};
use crate::pipeline::container::{magic_for, FORMAT_VERSION, HEADER_LEN, PAGE_INDEX_ENTRY_LEN};
use crate::pipeline::index::{PageIndexBuilder, PageSpan};
use crate::pipeline::quantize::{plane_len, QuantizedPlane};
use tracing::debug;

/// Section offsets computed by the sizing pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerLayout {
    pub metadata_offset: u32,
    pub toc_offset: u32,
    pub page_index_offset: u32,
    pub page_data_offset: u64,
    pub total_len: u64,
}

/// A container being built page by page. Finalized exactly once.
#[derive(Debug)]
pub struct ContainerDocument {
    width: u32,
    height: u32,
    bit_depth: BitDepth,
    orientation: Orientation,
    metadata: BookMetadata,
    chapters: Vec<ChapterEntry>,
    index: PageIndexBuilder,
    page_data: Vec<u8>,
}

impl ContainerDocument {
    pub fn new(
        width: u32,
        height: u32,
        bit_depth: BitDepth,
        orientation: Orientation,
        metadata: BookMetadata,
        chapters: Vec<ChapterEntry>,
    ) -> Self {
        Self {
            width,
            height,
            bit_depth,
            orientation,
            metadata,
            chapters,
            index: PageIndexBuilder::new(),
            page_data: Vec::new(),
        }
    }

    /// Document shaped for the panel of `device`.
    pub fn for_device(
        device: &DeviceProfile,
        metadata: BookMetadata,
        chapters: Vec<ChapterEntry>,
    ) -> Self {
        Self::new(
            device.width(),
            device.height(),
            device.bit_depth(),
            device.orientation(),
            metadata,
            chapters,
        )
    }

    pub fn page_count(&self) -> usize {
        self.index.len()
    }

    /// Expected plane length implied by the declared header fields.
    pub fn plane_len(&self) -> usize {
        plane_len(self.width, self.height, self.bit_depth)
    }

    /// Append the next page. Planes must arrive in page order.
    pub fn push_page(&mut self, plane: QuantizedPlane) -> Result<(), InkError> {
        let expected = self.plane_len();
        if plane.data.len() != expected
            || plane.bit_depth != self.bit_depth
            || plane.width != self.width
            || plane.height != self.height
        {
            return Err(EncodingError::PlaneMismatch {
                page: plane.page_number,
                expected,
                actual: plane.data.len(),
            }
            .into());
        }

        let length = u32::try_from(plane.data.len()).map_err(|_| EncodingError::FieldOverflow {
            what: "page length",
            value: plane.data.len() as u64,
        })?;
        self.index
            .push(plane.chapter_index, plane.page_number, length)?;
        self.page_data.extend_from_slice(&plane.data);
        Ok(())
    }

    /// Size and write the container.
    pub fn finalize(self) -> Result<Vec<u8>, InkError> {
        if self.width == 0 || self.height == 0 {
            return Err(EncodingError::ZeroDimension {
                width: self.width,
                height: self.height,
            }
            .into());
        }
        let (width, height) = match (u16::try_from(self.width), u16::try_from(self.height)) {
            (Ok(w), Ok(h)) => (w, h),
            _ => {
                return Err(EncodingError::DimensionTooLarge {
                    width: self.width,
                    height: self.height,
                }
                .into())
            }
        };
        if self.index.is_empty() {
            return Err(EncodingError::NoPages.into());
        }

        // Pass 1: size.
        let layout = compute_layout(
            &self.metadata,
            &self.chapters,
            self.index.len(),
            self.page_data.len(),
        )?;
        let spans = self.index.finalize(layout.page_data_offset, &self.chapters)?;
        verify_page_data(&spans, self.page_data.len(), self.plane_len())?;

        // Pass 2: write.
        let mut buf = Vec::with_capacity(layout.total_len as usize);
        write_header(
            &mut buf,
            self.bit_depth,
            self.orientation,
            spans.len() as u32,
            width,
            height,
            self.chapters.len() as u32,
            &layout,
        );
        write_string(&mut buf, &self.metadata.title);
        write_string(&mut buf, &self.metadata.author);
        debug_assert_eq!(buf.len(), layout.toc_offset as usize);
        for chapter in &self.chapters {
            write_string(&mut buf, &chapter.title);
            buf.extend_from_slice(&chapter.start_page.to_le_bytes());
        }
        debug_assert_eq!(buf.len(), layout.page_index_offset as usize);
        for span in &spans {
            buf.extend_from_slice(&span.offset.to_le_bytes());
            buf.extend_from_slice(&span.length.to_le_bytes());
        }
        debug_assert_eq!(buf.len() as u64, layout.page_data_offset);
        buf.extend_from_slice(&self.page_data);

        if buf.len() as u64 != layout.total_len {
            return Err(InkError::Internal(format!(
                "container is {} bytes, layout promised {}",
                buf.len(),
                layout.total_len
            )));
        }

        debug!(
            pages = spans.len(),
            chapters = self.chapters.len(),
            bytes = buf.len(),
            "Container encoded"
        );
        Ok(buf)
    }
}

fn string_len(s: &str) -> u64 {
    4 + s.len() as u64
}

fn to_u32(what: &'static str, value: u64) -> Result<u32, EncodingError> {
    u32::try_from(value).map_err(|_| EncodingError::FieldOverflow { what, value })
}

/// Pass 1: offsets of every section.
pub fn compute_layout(
    metadata: &BookMetadata,
    chapters: &[ChapterEntry],
    page_count: usize,
    page_data_len: usize,
) -> Result<ContainerLayout, EncodingError> {
    for s in [&metadata.title, &metadata.author]
        .into_iter()
        .chain(chapters.iter().map(|c| &c.title))
    {
        to_u32("string length", s.len() as u64)?;
    }
    to_u32("page count", page_count as u64)?;
    to_u32("chapter count", chapters.len() as u64)?;

    let metadata_offset = HEADER_LEN as u64;
    let toc_offset = metadata_offset + string_len(&metadata.title) + string_len(&metadata.author);
    let toc_len: u64 = chapters.iter().map(|c| string_len(&c.title) + 4).sum();
    let page_index_offset = toc_offset + toc_len;
    let page_data_offset = page_index_offset + (page_count * PAGE_INDEX_ENTRY_LEN) as u64;

    Ok(ContainerLayout {
        metadata_offset: to_u32("metadata offset", metadata_offset)?,
        toc_offset: to_u32("TOC offset", toc_offset)?,
        page_index_offset: to_u32("page index offset", page_index_offset)?,
        page_data_offset,
        total_len: page_data_offset + page_data_len as u64,
    })
}

fn verify_page_data(spans: &[PageSpan], actual: usize, plane_len: usize) -> Result<(), EncodingError> {
    let indexed: u64 = spans.iter().map(|s| u64::from(s.length)).sum();
    if indexed != actual as u64 {
        return Err(EncodingError::PageBytesMismatch {
            indexed: indexed as usize,
            actual,
        });
    }
    if spans.len() * plane_len != actual {
        return Err(EncodingError::PageCountMismatch {
            indexed: spans.len(),
            planes: actual / plane_len.max(1),
        });
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn write_header(
    buf: &mut Vec<u8>,
    bit_depth: BitDepth,
    orientation: Orientation,
    page_count: u32,
    width: u16,
    height: u16,
    chapter_count: u32,
    layout: &ContainerLayout,
) {
    buf.extend_from_slice(&magic_for(bit_depth));
    buf.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    buf.push(bit_depth.bits());
    buf.push(orientation.quarter_turns());
    buf.extend_from_slice(&page_count.to_le_bytes());
    buf.extend_from_slice(&width.to_le_bytes());
    buf.extend_from_slice(&height.to_le_bytes());
    buf.extend_from_slice(&chapter_count.to_le_bytes());
    buf.extend_from_slice(&layout.metadata_offset.to_le_bytes());
    buf.extend_from_slice(&layout.toc_offset.to_le_bytes());
    buf.extend_from_slice(&layout.page_index_offset.to_le_bytes());
    buf.extend_from_slice(&layout.page_data_offset.to_le_bytes());
    buf.extend_from_slice(&[0u8; 8]);
}

fn write_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}
