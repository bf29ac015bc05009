//! Page index builder.
//!
//! Records, page by page, where each quantized plane will sit in the page
//! data section. Pages are absolute and contiguous from 0, and chapter
//! indices never go backwards; both are enforced on [`PageIndexBuilder::push`]
//! so an out-of-order page is rejected the moment it arrives instead of
//! producing a container whose index disagrees with its data.

use crate::error::IndexInconsistency;
use crate::output::ChapterEntry;

/// Absolute location of one page plane inside the container buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSpan {
    pub offset: u64,
    pub length: u32,
}

#[derive(Debug, Clone, Copy)]
struct IndexedPage {
    chapter_index: usize,
    length: u32,
}

#[derive(Debug, Clone, Default)]
pub struct PageIndexBuilder {
    pages: Vec<IndexedPage>,
    /// First page of every distinct chapter index seen so far.
    chapter_boundaries: Vec<u32>,
}

impl PageIndexBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Total bytes of all recorded pages.
    pub fn total_bytes(&self) -> u64 {
        self.pages.iter().map(|p| u64::from(p.length)).sum()
    }

    /// Record the next page. `page_number` must equal the number of pages
    /// recorded so far and `chapter_index` must not decrease.
    pub fn push(
        &mut self,
        chapter_index: usize,
        page_number: usize,
        length: u32,
    ) -> Result<(), IndexInconsistency> {
        let expected = self.pages.len();
        if page_number != expected {
            return Err(IndexInconsistency::OutOfOrder {
                expected,
                got: page_number,
            });
        }

        match self.pages.last() {
            Some(prev) if chapter_index < prev.chapter_index => {
                return Err(IndexInconsistency::ChapterRegression {
                    page: page_number,
                    previous: prev.chapter_index,
                    got: chapter_index,
                });
            }
            Some(prev) if chapter_index == prev.chapter_index => {}
            _ => self.chapter_boundaries.push(page_number as u32),
        }

        self.pages.push(IndexedPage {
            chapter_index,
            length,
        });
        Ok(())
    }

    /// Lay the recorded pages out back to back from `base_offset` and check
    /// `chapters` against what was recorded.
    pub fn finalize(
        &self,
        base_offset: u64,
        chapters: &[ChapterEntry],
    ) -> Result<Vec<PageSpan>, IndexInconsistency> {
        let page_count = self.pages.len();
        let mut previous: Option<u32> = None;

        for chapter in chapters {
            if let Some(prev) = previous {
                if chapter.start_page <= prev {
                    return Err(IndexInconsistency::ChaptersNotIncreasing {
                        previous: prev,
                        got: chapter.start_page,
                    });
                }
            }
            if chapter.start_page as usize >= page_count {
                return Err(IndexInconsistency::ChapterOutOfRange {
                    title: chapter.title.clone(),
                    start: chapter.start_page,
                    page_count,
                });
            }
            if self
                .chapter_boundaries
                .binary_search(&chapter.start_page)
                .is_err()
            {
                return Err(IndexInconsistency::ChapterNotAtBoundary {
                    title: chapter.title.clone(),
                    start: chapter.start_page,
                });
            }
            previous = Some(chapter.start_page);
        }

        let mut offset = base_offset;
        Ok(self
            .pages
            .iter()
            .map(|p| {
                let span = PageSpan {
                    offset,
                    length: p.length,
                };
                offset += u64::from(p.length);
                span
            })
            .collect())
    }
}
