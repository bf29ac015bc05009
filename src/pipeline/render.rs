//! Rendering: source package → device-sized 8-bit grayscale pages.
//!
//! Turning reflowable content into bitmaps is the job of a [`PageRenderer`],
//! an external collaborator. The crate ships [`ImageArchiveRenderer`] for
//! fixed-layout image packages (CBZ-style zips of page images): each image is
//! decoded, converted to luma, fitted to the device canvas and centred on
//! white.
//!
//! Whatever the renderer, [`render_book`] runs it on the blocking pool,
//! checks every page against [`DeviceProfile::render_size`] and rotates it
//! onto the panel according to the device orientation.
//!
//! ## Why spawn_blocking?
//!
//! Decoding and resampling full-page images is CPU-heavy. Running it on a
//! Tokio worker would stall every other file of the batch.

use crate::config::{DeviceProfile, Orientation};
use crate::error::{InkError, RenderError};
use crate::output::{BookMetadata, ChapterEntry};
use image::imageops::{self, FilterType};
use image::{GrayImage, Luma};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::sync::Arc;
use tracing::{debug, info};

/// One 8-bit grayscale page and its position in the book.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageBitmap {
    pixels: Vec<u8>,
    width: u32,
    height: u32,
    /// Index of the chapter this page belongs to.
    pub chapter_index: usize,
    /// 0-based page number within its chapter.
    pub page_in_chapter: usize,
    /// 0-based page number within the book.
    pub page_number: usize,
}

impl PageBitmap {
    /// Wrap a row-major luma buffer; its length must be `width × height`.
    pub fn new(
        pixels: Vec<u8>,
        width: u32,
        height: u32,
        chapter_index: usize,
        page_in_chapter: usize,
        page_number: usize,
    ) -> Result<Self, RenderError> {
        let expected = width as usize * height as usize;
        if pixels.len() != expected {
            return Err(RenderError::InvalidBitmap {
                page: page_number,
                expected,
                actual: pixels.len(),
            });
        }
        Ok(Self {
            pixels,
            width,
            height,
            chapter_index,
            page_in_chapter,
            page_number,
        })
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    fn into_image(self) -> Option<(GrayImage, usize, usize, usize)> {
        let (c, pc, pn) = (self.chapter_index, self.page_in_chapter, self.page_number);
        GrayImage::from_raw(self.width, self.height, self.pixels).map(|img| (img, c, pc, pn))
    }
}

/// Everything a renderer extracts from one source package.
#[derive(Debug, Clone, Default)]
pub struct RenderedBook {
    pub metadata: BookMetadata,
    pub chapters: Vec<ChapterEntry>,
    pub pages: Vec<PageBitmap>,
}

/// Rasterizes a source package into page bitmaps at `device.render_size()`.
pub trait PageRenderer: Send + Sync {
    fn render(&self, package: &[u8], device: &DeviceProfile) -> Result<RenderedBook, RenderError>;
}

/// Run `renderer` on the blocking pool, then orient every page onto the panel.
pub async fn render_book(
    renderer: Arc<dyn PageRenderer>,
    package: Vec<u8>,
    device: DeviceProfile,
) -> Result<RenderedBook, InkError> {
    tokio::task::spawn_blocking(move || {
        let book = renderer.render(&package, &device)?;
        orient_book(book, &device)
    })
    .await
    .map_err(|e| InkError::Internal(format!("Render task panicked: {e}")))?
}

fn orient_book(mut book: RenderedBook, device: &DeviceProfile) -> Result<RenderedBook, InkError> {
    if book.pages.is_empty() {
        return Err(RenderError::NoPages.into());
    }
    book.pages = book
        .pages
        .into_iter()
        .map(|page| orient_page(page, device))
        .collect::<Result<_, _>>()?;
    Ok(book)
}

/// Check a rendered page against the device canvas and rotate it onto the panel.
pub fn orient_page(page: PageBitmap, device: &DeviceProfile) -> Result<PageBitmap, RenderError> {
    let (rw, rh) = device.render_size();
    if (page.width, page.height) != (rw, rh) {
        return Err(RenderError::DimensionMismatch {
            page: page.page_number,
            expected_width: rw,
            expected_height: rh,
            actual_width: page.width,
            actual_height: page.height,
        });
    }
    if device.orientation() == Orientation::Deg0 {
        return Ok(page);
    }

    let page_number = page.page_number;
    let (img, chapter, in_chapter, number) =
        page.into_image().ok_or(RenderError::InvalidBitmap {
            page: page_number,
            expected: rw as usize * rh as usize,
            actual: 0,
        })?;
    let rotated = match device.orientation() {
        Orientation::Deg90 => imageops::rotate90(&img),
        Orientation::Deg180 => imageops::rotate180(&img),
        Orientation::Deg270 => imageops::rotate270(&img),
        Orientation::Deg0 => img,
    };
    let (w, h) = rotated.dimensions();
    PageBitmap::new(rotated.into_raw(), w, h, chapter, in_chapter, number)
}

// ── Image archive renderer ───────────────────────────────────────────────

const PAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

/// [`PageRenderer`] for zips of page images (CBZ and friends).
///
/// * Pages are ordered by folder, then by file name.
/// * Each folder starts a chapter titled after the folder; images at the
///   archive root form one chapter titled after the book.
/// * `ComicInfo.xml` supplies title (`<Title>`) and author (`<Writer>`).
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageArchiveRenderer;

impl PageRenderer for ImageArchiveRenderer {
    fn render(&self, package: &[u8], device: &DeviceProfile) -> Result<RenderedBook, RenderError> {
        let entries = crate::archive::read_zip_entries(package)
            .map_err(RenderError::MalformedPackage)?;

        let metadata = entries
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("ComicInfo.xml"))
            .map(|(_, data)| parse_comic_info(data))
            .unwrap_or_default();

        let mut images: Vec<(&str, &str, &[u8])> = entries
            .iter()
            .filter(|(name, _)| is_page_image(name))
            .map(|(name, data)| {
                let (dir, file) = name.rsplit_once('/').unwrap_or(("", name.as_str()));
                (dir, file, data.as_slice())
            })
            .collect();
        if images.is_empty() {
            return Err(RenderError::NoPages);
        }
        images.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

        let (cw, ch) = device.render_size();
        let mut chapters = Vec::new();
        let mut pages = Vec::with_capacity(images.len());
        let mut current_dir: Option<&str> = None;
        let mut page_in_chapter = 0;

        for (page_number, (dir, file, data)) in images.into_iter().enumerate() {
            if current_dir != Some(dir) {
                current_dir = Some(dir);
                page_in_chapter = 0;
                chapters.push(ChapterEntry::new(
                    chapter_title(dir, &metadata),
                    page_number as u32,
                ));
            }

            let name = if dir.is_empty() {
                file.to_string()
            } else {
                format!("{dir}/{file}")
            };
            let canvas = fit_to_canvas(data, cw, ch).map_err(|detail| {
                RenderError::UndecodableImage {
                    name: name.clone(),
                    detail,
                }
            })?;
            debug!("Rendered page {} from {}", page_number, name);

            pages.push(PageBitmap::new(
                canvas.into_raw(),
                cw,
                ch,
                chapters.len() - 1,
                page_in_chapter,
                page_number,
            )?);
            page_in_chapter += 1;
        }

        info!(
            "Image archive rendered: {} pages in {} chapters",
            pages.len(),
            chapters.len()
        );
        Ok(RenderedBook {
            metadata,
            chapters,
            pages,
        })
    }
}

fn is_page_image(name: &str) -> bool {
    if name.starts_with("__MACOSX/") {
        return false;
    }
    let file = name.rsplit('/').next().unwrap_or(name);
    if file.starts_with('.') {
        return false;
    }
    file.rsplit_once('.')
        .map(|(_, ext)| PAGE_EXTENSIONS.iter().any(|e| ext.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

fn chapter_title(dir: &str, metadata: &BookMetadata) -> String {
    match dir.rsplit('/').next() {
        Some(last) if !last.is_empty() => last.to_string(),
        _ if !metadata.title.is_empty() => metadata.title.clone(),
        _ => "Pages".to_string(),
    }
}

/// Decode, convert to luma, scale to fit `cw × ch` and centre on white.
fn fit_to_canvas(data: &[u8], cw: u32, ch: u32) -> Result<GrayImage, String> {
    let gray = image::load_from_memory(data)
        .map_err(|e| e.to_string())?
        .to_luma8();
    let (w, h) = gray.dimensions();
    if w == 0 || h == 0 {
        return Err("image has no pixels".into());
    }

    let scale = (cw as f64 / w as f64).min(ch as f64 / h as f64);
    let nw = ((w as f64 * scale).round() as u32).clamp(1, cw);
    let nh = ((h as f64 * scale).round() as u32).clamp(1, ch);
    let fitted = if (nw, nh) == (w, h) {
        gray
    } else {
        imageops::resize(&gray, nw, nh, FilterType::Triangle)
    };

    let mut canvas = GrayImage::from_pixel(cw, ch, Luma([255]));
    let x = i64::from((cw - nw) / 2);
    let y = i64::from((ch - nh) / 2);
    imageops::overlay(&mut canvas, &fitted, x, y);
    Ok(canvas)
}

fn local_name(name: &[u8]) -> &[u8] {
    name.rsplit(|&b| b == b':').next().unwrap_or(name)
}

/// Title and author from a `ComicInfo.xml` document.
fn parse_comic_info(data: &[u8]) -> BookMetadata {
    let text = String::from_utf8_lossy(data);
    // Untrimmed so text around entity references keeps its spaces.
    let mut reader = Reader::from_str(&text);

    let mut metadata = BookMetadata::default();
    let mut current: Option<Vec<u8>> = None;
    let mut buf_text = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = local_name(e.name().as_ref()).to_vec();
                if name == b"Title" || name == b"Writer" {
                    current = Some(name);
                    buf_text.clear();
                }
            }
            Ok(Event::Text(e)) if current.is_some() => {
                buf_text.push_str(&String::from_utf8_lossy(e.as_ref()));
            }
            Ok(Event::GeneralRef(e)) if current.is_some() => {
                let entity: &[u8] = e.as_ref();
                buf_text.push_str(match entity {
                    b"apos" => "'",
                    b"quot" => "\"",
                    b"lt" => "<",
                    b"gt" => ">",
                    b"amp" => "&",
                    _ => "",
                });
            }
            Ok(Event::End(_)) => {
                match current.take().as_deref() {
                    Some(b"Title") => metadata.title = buf_text.trim().to_string(),
                    Some(b"Writer") => metadata.author = buf_text.trim().to_string(),
                    _ => {}
                }
                buf_text.clear();
            }
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
    }

    metadata
}
