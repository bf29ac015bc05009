//! End-to-end tests for inkpress.
//!
//! Fixtures (CBZ archives, EPUBs) are built in memory with `image` and the
//! crate's own `ZipArchiver`, so the suite needs no files on disk and no
//! network.
//!
//! Run with:
//!   cargo test --test e2e -- --nocapture

use image::{DynamicImage, GrayImage, ImageFormat, Luma, Rgb, RgbImage};
use inkpress::optimize::package::DocumentPackage;
use inkpress::pipeline::encode::ContainerDocument;
use inkpress::pipeline::quantize::{plane_len, quantize};
use inkpress::{
    convert_batch, convert_book, convert_book_sync, optimize_batch, write_output, ArchiveEntry,
    Archiver, BatchInput, BatchOptions, BatchProgressCallback, BitDepth, BookMetadata,
    CancelToken, ChapterEntry, ContainerReader, ConversionConfig, DeviceProfile, FailureKind,
    FileState, ImageArchiveRenderer, InkError, OptimizationProfile, Optimizer, Orientation,
    PageBitmap, QuantizeOptions, ZipArchiver,
};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

// ── Test helpers ─────────────────────────────────────────────────────────────

fn png_gray(width: u32, height: u32, value: u8) -> Vec<u8> {
    let img = GrayImage::from_fn(width, height, |x, y| {
        Luma([value.wrapping_add(((x + y) % 7) as u8)])
    });
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    buf
}

fn png_color(width: u32, height: u32) -> Vec<u8> {
    let img = DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, _| {
        Rgb([(x % 256) as u8, 80, 160])
    }));
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    buf
}

/// A CBZ with two chapter folders and a `ComicInfo.xml`.
fn sample_cbz(pages_per_chapter: usize) -> Vec<u8> {
    let mut entries = vec![ArchiveEntry::deflated(
        "ComicInfo.xml",
        b"<ComicInfo><Title>Harbour Lights</Title><Writer>M. Okafor</Writer></ComicInfo>"
            .to_vec(),
    )];
    for chapter in ["01 Arrival", "02 Storm"] {
        for page in 0..pages_per_chapter {
            entries.push(ArchiveEntry::stored(
                format!("{chapter}/{page:03}.png"),
                png_gray(40 + page as u32 * 10, 60, 30 + page as u8 * 40),
            ));
        }
    }
    ZipArchiver.assemble(&entries).unwrap()
}

fn small_config(bits: BitDepth) -> ConversionConfig {
    ConversionConfig::builder()
        .dimensions(64, 96)
        .bit_depth(bits)
        .dither_strength(1.0)
        .build()
        .unwrap()
}

const CONTAINER_XML: &str = r#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>"#;

const OPF: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0" unique-identifier="uid">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:title>The Quiet Shore</dc:title>
    <dc:creator>A. Lindqvist</dc:creator>
  </metadata>
  <manifest>
    <item id="nav" href="nav.xhtml" media-type="application/xhtml+xml" properties="nav"/>
    <item id="ch1" href="text/ch1.xhtml" media-type="application/xhtml+xml"/>
    <item id="css" href="styles/book.css" media-type="text/css"/>
    <item id="f1" href="fonts/Garamond.otf" media-type="application/vnd.ms-opentype"/>
    <item id="f2" href="fonts/Garamond-Italic.woff2" media-type="font/woff2"/>
    <item id="cover" href="images/cover.png" media-type="image/png"/>
    <item id="anim" href="images/anim.gif" media-type="image/gif"/>
  </manifest>
  <spine>
    <itemref idref="nav"/>
    <itemref idref="ch1"/>
  </spine>
</package>"#;

const BOOK_CSS: &str = r#"@font-face { font-family: "Garamond"; src: url(../fonts/Garamond.otf); }
body { font-family: "Garamond", serif; margin: 0 5%; }
.sidebar { float: right; width: 300px; color: #333; }
.grid { display: grid; grid-template-columns: 1fr 1fr; }
p { text-indent: 1.5em; line-height: 1.3; }
@media screen { .wide { column-count: 2; font-weight: bold; } }
"#;

fn sample_epub() -> Vec<u8> {
    let chapter = r#"<?xml version="1.0" encoding="UTF-8"?>
<html xmlns="http://www.w3.org/1999/xhtml">
<head>
<title>One</title>
<link rel="stylesheet" type="text/css" href="../styles/book.css"/>
<style type="text/css">h1 { position: absolute; color: black; }</style>
</head>
<body><h1>One</h1><p>It was quiet.</p><img src="../images/cover.png" alt=""/></body>
</html>"#;
    let nav = r#"<html xmlns="http://www.w3.org/1999/xhtml"><head><title>Contents</title></head><body><nav/></body></html>"#;
    let gif = b"GIF89a\x01\x00\x01\x00\x80\x00\x00\xff\xff\xff\x00\x00\x00!\xf9\x04\x00\x00\x00\x00\x00,\x00\x00\x00\x00\x01\x00\x01\x00\x00\x02\x02D\x01\x00;";

    let entries = vec![
        ArchiveEntry::stored("mimetype", b"application/epub+zip".to_vec()),
        ArchiveEntry::deflated("META-INF/container.xml", CONTAINER_XML.as_bytes().to_vec()),
        ArchiveEntry::deflated("OEBPS/content.opf", OPF.as_bytes().to_vec()),
        ArchiveEntry::deflated("OEBPS/nav.xhtml", nav.as_bytes().to_vec()),
        ArchiveEntry::deflated("OEBPS/text/ch1.xhtml", chapter.as_bytes().to_vec()),
        ArchiveEntry::deflated("OEBPS/styles/book.css", BOOK_CSS.as_bytes().to_vec()),
        ArchiveEntry::deflated("OEBPS/fonts/Garamond.otf", vec![0x4f, 0x54, 0x54, 0x4f]),
        ArchiveEntry::deflated("OEBPS/fonts/Garamond-Italic.woff2", b"wOF2".to_vec()),
        ArchiveEntry::deflated("OEBPS/images/cover.png", png_color(1200, 600)),
        ArchiveEntry::deflated("OEBPS/images/anim.gif", gif.to_vec()),
    ];
    ZipArchiver.assemble(&entries).unwrap()
}

fn text_of(pkg: &DocumentPackage, path: &str) -> String {
    String::from_utf8(pkg.file(path).unwrap().to_vec()).unwrap()
}

#[derive(Default)]
struct StateLog {
    states: Mutex<Vec<(usize, FileState)>>,
}

impl BatchProgressCallback for StateLog {
    fn on_file_state(&self, index: usize, _name: &str, state: FileState) {
        self.states.lock().unwrap().push((index, state));
    }
}

// ── Container: encoding and read-back ────────────────────────────────────────

#[test]
fn test_four_page_book_has_one_toc_entry_and_ordered_offsets() {
    let device = DeviceProfile::new(480, 800, Orientation::Deg0, BitDepth::One).unwrap();
    let options = QuantizeOptions {
        bit_depth: BitDepth::One,
        strength: 1.0,
        dark_mode: false,
    };
    let mut doc = ContainerDocument::for_device(
        &device,
        BookMetadata {
            title: "Four".into(),
            author: "Tester".into(),
        },
        vec![ChapterEntry::new("Only", 0)],
    );
    for page in 0..4 {
        let bitmap = PageBitmap::new(vec![200; 480 * 800], 480, 800, 0, page, page).unwrap();
        doc.push_page(quantize(&bitmap, &options)).unwrap();
    }
    let bytes = doc.finalize().unwrap();

    let reader = ContainerReader::parse(&bytes).unwrap();
    assert_eq!(&bytes[0..4], b"XTC\0");
    assert_eq!(reader.page_count(), 4);
    assert_eq!(reader.chapters(), [ChapterEntry::new("Only", 0)]);
    let offsets: Vec<u64> = reader.page_index().iter().map(|s| s.offset).collect();
    assert!(offsets.windows(2).all(|w| w[0] < w[1]));
    assert!(reader
        .page_index()
        .iter()
        .all(|s| s.length as usize == 60 * 800));
}

#[test]
fn test_white_page_packs_to_white_and_dark_mode_inverts() {
    let white = PageBitmap::new(vec![255; 100], 10, 10, 0, 0, 0).unwrap();
    let mut options = QuantizeOptions {
        bit_depth: BitDepth::One,
        strength: 0.0,
        dark_mode: false,
    };
    let plane = quantize(&white, &options);
    assert_eq!(plane.data.len(), plane_len(10, 10, BitDepth::One));
    // 10 pixels per row: one full byte, then two bits of the padding byte.
    assert!(plane
        .data
        .chunks(2)
        .all(|row| row[0] == 0xFF && row[1] & 0xC0 == 0xC0));

    options.dark_mode = true;
    let dark = quantize(&white, &options);
    assert!(dark.data.iter().all(|&b| b == 0));
}

#[tokio::test]
async fn test_cbz_round_trip() {
    let config = small_config(BitDepth::Two);
    let out = convert_book(
        BatchInput::new("harbour.cbz", sample_cbz(2)),
        Arc::new(ImageArchiveRenderer),
        &config,
    )
    .await
    .unwrap();

    assert_eq!(out.name, "harbour.xtch");
    assert_eq!(out.stats.page_count, 4);
    assert_eq!(out.stats.chapter_count, 2);

    let reader = ContainerReader::parse(&out.bytes).unwrap();
    let header = reader.header();
    assert_eq!((header.width, header.height), (64, 96));
    assert_eq!(header.bit_depth, 2);
    assert_eq!(reader.metadata().title, "Harbour Lights");
    assert_eq!(reader.metadata().author, "M. Okafor");
    assert_eq!(
        reader.chapters(),
        [
            ChapterEntry::new("01 Arrival", 0),
            ChapterEntry::new("02 Storm", 2)
        ]
    );
    assert_eq!(reader.chapter_for_page(1), Some(0));
    assert_eq!(reader.chapter_for_page(3), Some(1));
    assert_eq!(reader.chapter_for_page(4), None);
    for page in 0..4 {
        assert_eq!(
            reader.page(page).unwrap().len(),
            plane_len(64, 96, BitDepth::Two)
        );
    }
}

#[tokio::test]
async fn test_conversion_is_deterministic() {
    let config = small_config(BitDepth::One);
    let renderer = Arc::new(ImageArchiveRenderer);
    let a = convert_book(BatchInput::new("a.cbz", sample_cbz(3)), renderer.clone(), &config)
        .await
        .unwrap();
    let b = convert_book(BatchInput::new("a.cbz", sample_cbz(3)), renderer, &config)
        .await
        .unwrap();
    assert_eq!(a.bytes, b.bytes);
}

#[tokio::test]
async fn test_every_span_is_in_bounds() {
    let out = convert_book(
        BatchInput::new("b.cbz", sample_cbz(3)),
        Arc::new(ImageArchiveRenderer),
        &small_config(BitDepth::One),
    )
    .await
    .unwrap();
    let reader = ContainerReader::parse(&out.bytes).unwrap();
    let total = out.bytes.len() as u64;
    for span in reader.page_index() {
        assert!(span.offset + span.length as u64 <= total);
        assert!(span.offset >= reader.header().page_data_offset);
    }
    for chapter in reader.chapters() {
        assert!((chapter.start_page as usize) < reader.page_count());
    }
}

#[tokio::test]
async fn test_landscape_orientation_rotates_onto_panel() {
    let config = ConversionConfig::builder()
        .dimensions(64, 96)
        .orientation(Orientation::Deg90)
        .bit_depth(BitDepth::One)
        .build()
        .unwrap();
    let out = convert_book(
        BatchInput::new("wide.cbz", sample_cbz(1)),
        Arc::new(ImageArchiveRenderer),
        &config,
    )
    .await
    .unwrap();
    let reader = ContainerReader::parse(&out.bytes).unwrap();
    assert_eq!(reader.header().orientation_degrees, 90);
    assert_eq!((reader.header().width, reader.header().height), (64, 96));
}

#[test]
fn test_out_of_order_pages_are_rejected() {
    let options = QuantizeOptions {
        bit_depth: BitDepth::One,
        strength: 0.0,
        dark_mode: false,
    };
    let mut doc = ContainerDocument::new(
        8,
        8,
        BitDepth::One,
        Orientation::Deg0,
        BookMetadata::default(),
        vec![ChapterEntry::new("A", 0)],
    );
    let page = |n| quantize(&PageBitmap::new(vec![0; 64], 8, 8, 0, n, n).unwrap(), &options);

    doc.push_page(page(0)).unwrap();
    let err = doc.push_page(page(2)).unwrap_err();
    assert!(matches!(err, InkError::Index(_)));
    assert_eq!(err.kind(), FailureKind::IndexInconsistency);
    assert_eq!(
        err.to_string(),
        "Page 2 arrived out of order (expected page 1)"
    );
    doc.push_page(page(1)).unwrap();
    assert_eq!(doc.page_count(), 2);
}

#[test]
fn test_sync_wrapper_converts() {
    let out = convert_book_sync(
        BatchInput::new("sync.cbz", sample_cbz(1)),
        Arc::new(ImageArchiveRenderer),
        &small_config(BitDepth::One),
    )
    .unwrap();
    assert_eq!(out.name, "sync.xtc");
}

#[test]
fn test_corrupt_container_is_malformed() {
    let err = ContainerReader::parse(b"XTCH\x01\x00").unwrap_err();
    assert!(matches!(err, InkError::MalformedContainer(_)));
}

// ── Batch orchestration ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_malformed_file_fails_alone_in_batch() {
    let inputs = vec![
        BatchInput::new("one.cbz", sample_cbz(1)),
        BatchInput::new("two.cbz", b"PK\x03\x04 truncated".to_vec()),
        BatchInput::new("three.cbz", sample_cbz(2)),
    ];
    let log = Arc::new(StateLog::default());
    let options = BatchOptions::builder()
        .concurrency(3)
        .dither_workers(2)
        .progress_callback(log.clone())
        .build()
        .unwrap();

    let report = convert_batch(
        inputs,
        Arc::new(ImageArchiveRenderer),
        &small_config(BitDepth::One),
        &options,
    )
    .await;

    assert_eq!(report.stats.completed, 2);
    assert_eq!(report.stats.failed, 1);
    let states: Vec<FileState> = report.results.iter().map(|r| r.state()).collect();
    assert_eq!(
        states,
        [FileState::Complete, FileState::Failed, FileState::Complete]
    );
    assert_eq!(
        report.results[1].error().map(InkError::kind),
        Some(FailureKind::Render)
    );

    // Every file walked a legal path through the state machine.
    let log = log.states.lock().unwrap();
    for index in 0..3 {
        let path: Vec<FileState> = log
            .iter()
            .filter(|(i, _)| *i == index)
            .map(|(_, s)| *s)
            .collect();
        assert_eq!(path[0], FileState::Queued);
        assert!(path.windows(2).all(|w| w[0].can_transition_to(w[1])));
        assert!(path.last().unwrap().is_terminal());
    }
}

#[tokio::test]
async fn test_report_is_in_input_order() {
    // Larger files first so they tend to finish last.
    let inputs: Vec<BatchInput> = (0..5)
        .map(|i| BatchInput::new(format!("vol{i}.cbz"), sample_cbz(5 - i)))
        .collect();
    let options = BatchOptions::builder().concurrency(5).build().unwrap();
    let report = convert_batch(
        inputs,
        Arc::new(ImageArchiveRenderer),
        &small_config(BitDepth::One),
        &options,
    )
    .await;

    assert!(report.all_succeeded());
    let names: Vec<&str> = report.outputs().map(|o| o.name.as_str()).collect();
    assert_eq!(names, ["vol0.xtc", "vol1.xtc", "vol2.xtc", "vol3.xtc", "vol4.xtc"]);
    let indices: Vec<usize> = report.results.iter().map(|r| r.index).collect();
    assert_eq!(indices, [0, 1, 2, 3, 4]);
}

struct CancelAfterFirst {
    token: CancelToken,
    done: AtomicUsize,
}

impl BatchProgressCallback for CancelAfterFirst {
    fn on_file_complete(&self, _index: usize, _name: &str, _output_len: usize) {
        self.done.fetch_add(1, Ordering::SeqCst);
        self.token.cancel();
    }
}

#[tokio::test]
async fn test_cancel_stops_dispatch_and_keeps_finished_outputs() {
    let token = CancelToken::new();
    let cb = Arc::new(CancelAfterFirst {
        token: token.clone(),
        done: AtomicUsize::new(0),
    });
    let options = BatchOptions::builder()
        .concurrency(1)
        .cancel_token(token)
        .progress_callback(cb.clone())
        .build()
        .unwrap();
    let inputs = (0..3)
        .map(|i| BatchInput::new(format!("c{i}.cbz"), sample_cbz(1)))
        .collect();

    let report = convert_batch(
        inputs,
        Arc::new(ImageArchiveRenderer),
        &small_config(BitDepth::One),
        &options,
    )
    .await;

    assert_eq!(cb.done.load(Ordering::SeqCst), 1);
    assert_eq!(report.stats.completed, 1);
    assert_eq!(report.stats.cancelled, 2);
    assert!(report.results[0].outcome.is_ok());
    assert!(matches!(report.results[2].outcome, Err(InkError::Cancelled)));
}

#[tokio::test]
async fn test_bundle_and_summaries() {
    let inputs = vec![
        BatchInput::new("x.cbz", sample_cbz(1)),
        BatchInput::new("y.cbz", b"not a zip".to_vec()),
    ];
    let report = convert_batch(
        inputs,
        Arc::new(ImageArchiveRenderer),
        &small_config(BitDepth::Two),
        &BatchOptions::default(),
    )
    .await;

    let bundle = report.bundle(&ZipArchiver).unwrap();
    assert_eq!(&bundle[0..4], b"PK\x03\x04");

    let json = serde_json::to_value(report.summaries()).unwrap();
    assert_eq!(json[0]["state"], "complete");
    assert_eq!(json[0]["output"], "x.xtch");
    assert_eq!(json[1]["state"], "failed");
    assert_eq!(json[1]["error_kind"], "render");
}

#[test]
fn test_write_output_is_atomic() {
    let dir = tempfile::tempdir().unwrap();
    let out = convert_book_sync(
        BatchInput::new("disk.cbz", sample_cbz(1)),
        Arc::new(ImageArchiveRenderer),
        &small_config(BitDepth::One),
    )
    .unwrap();

    let path = tokio_test::block_on(write_output(&dir.path().join("nested"), &out)).unwrap();
    assert!(path.ends_with("nested/disk.xtc"));
    assert_eq!(std::fs::read(&path).unwrap(), out.bytes);
    let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("nested"))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty());
}

// ── EPUB optimizer ───────────────────────────────────────────────────────────

#[test]
fn test_optimizer_strips_embedded_fonts() {
    let optimizer = Optimizer::new(OptimizationProfile::default());
    let (bytes, report) = optimizer.optimize_bytes(&sample_epub()).unwrap();
    assert_eq!(report.fonts_removed, 2);

    let pkg = DocumentPackage::parse(&bytes).unwrap();
    assert!(pkg.manifest().iter().all(|i| !i.is_font()));
    assert!(pkg.file_paths().all(|p| !p.contains("fonts/")));
    let css = text_of(&pkg, "OEBPS/styles/book.css");
    assert!(!css.contains("@font-face"));
    assert!(!css.contains("Garamond"));
    assert!(css.contains("font-family: serif"));
    let opf = text_of(&pkg, "OEBPS/content.opf");
    assert!(!opf.contains("Garamond"));
}

#[test]
fn test_optimizer_rewrites_css_images_and_injects() {
    let optimizer = Optimizer::new(OptimizationProfile::default());
    let (bytes, report) = optimizer.optimize_bytes(&sample_epub()).unwrap();

    let pkg = DocumentPackage::parse(&bytes).unwrap();
    pkg.validate().unwrap();

    let css = text_of(&pkg, "OEBPS/styles/book.css");
    for gone in ["float", "300px", "grid", "column-count", "margin"] {
        assert!(!css.contains(gone), "'{gone}' survived:\n{css}");
    }
    assert!(css.contains("color: #333"));
    assert!(css.contains("text-indent: 1.5em"));
    assert!(css.contains("font-weight: bold"));

    let chapter = text_of(&pkg, "OEBPS/text/ch1.xhtml");
    assert!(!chapter.contains("position: absolute"));
    assert!(chapter.contains("color: black"));
    let link = chapter.find("../epaper-sanitizer.css").unwrap();
    assert!(link > chapter.find("../styles/book.css").unwrap());
    assert!(link < chapter.find("</head>").unwrap());
    assert!(pkg.item("epaper-sanitizer-css").is_some());

    let cover = image::load_from_memory(pkg.file("OEBPS/images/cover.png").unwrap()).unwrap();
    assert!(matches!(cover, DynamicImage::ImageLuma8(_)));
    assert_eq!((cover.width(), cover.height()), (480, 240));
    assert_eq!(report.images_converted, 1);
    assert_eq!(report.images_resized, 1);

    // GIF is left alone with a warning.
    assert_eq!(report.warnings.len(), 1);
    assert_eq!(report.warnings[0].href, "images/anim.gif");
    assert_eq!(report.documents_injected, 2);
}

#[test]
fn test_optimizer_is_idempotent() {
    let optimizer = Optimizer::new(OptimizationProfile::default());
    let (once, _) = optimizer.optimize_bytes(&sample_epub()).unwrap();
    let (twice, report) = optimizer.optimize_bytes(&once).unwrap();
    assert!(report.is_noop(), "second pass changed something: {report:?}");
    assert_eq!(once, twice);
}

#[test]
fn test_disabled_stages_leave_package_alone() {
    let profile = OptimizationProfile::builder()
        .css(inkpress::CssStripRules::none())
        .strip_fonts(false)
        .grayscale(false)
        .max_image_dimension(4096)
        .inject_stylesheet(false)
        .build()
        .unwrap();
    let (_, report) = Optimizer::new(profile)
        .optimize_bytes(&sample_epub())
        .unwrap();
    assert!(report.is_noop());
}

#[tokio::test]
async fn test_optimize_batch_isolates_failures() {
    let inputs = vec![
        BatchInput::new("good.epub", sample_epub()),
        BatchInput::new("broken.epub", sample_cbz(1)),
    ];
    let report = optimize_batch(
        inputs,
        &Optimizer::new(OptimizationProfile::default()),
        &BatchOptions::default(),
    )
    .await;

    assert_eq!(report.stats.completed, 1);
    assert_eq!(report.results[0].output().unwrap().name, "good.epub");
    let err = report.results[1].error().unwrap();
    assert_eq!(err.kind(), FailureKind::Optimization);
    assert_eq!(err.to_string(), "Package has no package document (OPF)");
}

#[test]
fn test_profile_from_json() {
    let profile =
        OptimizationProfile::from_json(r#"{ "strip_fonts": false, "max_image_dimension": 800 }"#)
            .unwrap();
    assert!(!profile.strip_fonts);
    assert_eq!(profile.max_image_dimension, 800);
    assert!(profile.grayscale);

    let err = OptimizationProfile::from_json(r#"{ "max_image_dimension": 0 }"#).unwrap_err();
    assert!(matches!(err, InkError::InvalidConfig(_)));
}
