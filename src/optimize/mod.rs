//! EPUB structural optimizer.
//!
//! ## Stages
//!
//! ```text
//! package bytes ──► DocumentPackage::parse
//!                     │  (private copy from here on)
//!                     ▼
//!   fonts ──► stylesheets (+ inline <style>) ──► images ──► inject
//!                     │
//!                     ▼
//!   validate ──► to_entries ──► Archiver::assemble ──► package bytes
//! ```
//!
//! Every stage is a pure function of the package and the profile, and each
//! one leaves already-optimized input untouched, so running the optimizer on
//! its own output changes nothing.

pub mod css;
pub mod images;
pub mod inject;
pub mod package;

use crate::archive::{Archiver, ZipArchiver};
use crate::config::OptimizationProfile;
use crate::error::{InkError, ResourceWarning};
use css::sanitize_stylesheet;
use images::{transform_image, ImageOutcome};
use once_cell::sync::Lazy;
use package::{is_font_path, is_stylesheet_path, DocumentPackage, ManifestItem};
use regex::Regex;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

static RE_STYLE_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)(<style\b[^>]*>)(.*?)(</style\s*>)").unwrap());

/// What one optimizer run changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OptimizationReport {
    pub fonts_removed: usize,
    pub stylesheets_sanitized: usize,
    pub declarations_dropped: usize,
    pub images_converted: usize,
    pub images_resized: usize,
    pub documents_injected: usize,
    pub warnings: Vec<ResourceWarning>,
}

impl OptimizationReport {
    /// True when the run left the package exactly as it found it.
    pub fn is_noop(&self) -> bool {
        self.fonts_removed == 0
            && self.stylesheets_sanitized == 0
            && self.images_converted == 0
            && self.images_resized == 0
            && self.documents_injected == 0
    }

    fn warn(&mut self, warning: ResourceWarning) {
        warn!("{}", warning);
        self.warnings.push(warning);
    }
}

/// Applies an [`OptimizationProfile`] to document packages.
#[derive(Clone)]
pub struct Optimizer {
    profile: OptimizationProfile,
    archiver: Arc<dyn Archiver>,
}

impl std::fmt::Debug for Optimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Optimizer")
            .field("profile", &self.profile)
            .field("archiver", &"<dyn Archiver>")
            .finish()
    }
}

impl Optimizer {
    pub fn new(profile: OptimizationProfile) -> Self {
        Self::with_archiver(profile, Arc::new(ZipArchiver))
    }

    pub fn with_archiver(profile: OptimizationProfile, archiver: Arc<dyn Archiver>) -> Self {
        Self { profile, archiver }
    }

    pub fn profile(&self) -> &OptimizationProfile {
        &self.profile
    }

    /// Optimize a package buffer into a new package buffer.
    pub fn optimize_bytes(&self, bytes: &[u8]) -> Result<(Vec<u8>, OptimizationReport), InkError> {
        let package = DocumentPackage::parse(bytes)?;
        let (optimized, report) = self.optimize(&package)?;
        let entries = optimized.to_entries()?;
        let out = self.archiver.assemble(&entries)?;
        info!(
            "Optimized '{}': {} → {} bytes",
            optimized.metadata().title,
            bytes.len(),
            out.len()
        );
        Ok((out, report))
    }

    /// Run every stage on a copy of `package`. The caller's package is never
    /// touched, even when a stage fails.
    pub fn optimize(
        &self,
        package: &DocumentPackage,
    ) -> Result<(DocumentPackage, OptimizationReport), InkError> {
        let mut pkg = package.clone();
        let mut report = OptimizationReport::default();

        if self.profile.strip_fonts {
            self.strip_fonts(&mut pkg, &mut report);
        }
        self.sanitize_styles(&mut pkg, &mut report);
        self.transform_images(&mut pkg, &mut report);
        if self.profile.inject_stylesheet {
            let summary = inject::inject_stylesheet(&mut pkg);
            report.documents_injected = summary.documents_injected;
            for w in summary.warnings {
                report.warn(w);
            }
        }

        pkg.validate()?;
        debug!(
            "Optimizer: {} fonts, {} stylesheets, {} images converted, {} resized, {} warnings",
            report.fonts_removed,
            report.stylesheets_sanitized,
            report.images_converted,
            report.images_resized,
            report.warnings.len()
        );
        Ok((pkg, report))
    }

    fn strip_fonts(&self, pkg: &mut DocumentPackage, report: &mut OptimizationReport) {
        let fonts: Vec<String> = pkg
            .manifest()
            .iter()
            .filter(|i| i.is_font())
            .map(|i| i.id.clone())
            .collect();
        for id in fonts {
            if let Some(item) = pkg.remove_item(&id) {
                debug!("Removed font {}", item.href);
                report.fonts_removed += 1;
            }
        }

        // Fonts shipped in the archive without a manifest entry.
        let unlisted: Vec<String> = pkg
            .file_paths()
            .filter(|p| is_font_path(p))
            .map(str::to_string)
            .collect();
        for path in unlisted {
            if pkg.remove_unlisted_file(&path).is_some() {
                debug!("Removed unlisted font {}", path);
                report.fonts_removed += 1;
            }
        }
    }

    fn sanitize_styles(&self, pkg: &mut DocumentPackage, report: &mut OptimizationReport) {
        let injected = inject::stylesheet_path(pkg);
        let mut targets: Vec<(String, String, bool)> = pkg
            .manifest()
            .iter()
            .filter(|i| i.is_stylesheet() || i.is_content_document())
            .map(|i| (pkg.full_path(&i.href), i.href.clone(), i.is_stylesheet()))
            .filter(|(path, _, _)| *path != injected)
            .collect();
        let unlisted: Vec<(String, String, bool)> = pkg
            .file_paths()
            .filter(|p| is_stylesheet_path(p) && *p != injected && !pkg.is_listed(p))
            .map(|p| (p.to_string(), p.to_string(), true))
            .collect();
        targets.extend(unlisted);

        for (path, label, is_stylesheet) in targets {
            let Some(data) = pkg.file(&path) else {
                continue;
            };
            let Ok(text) = std::str::from_utf8(data) else {
                report.warn(ResourceWarning::new(&label, "not UTF-8; styles left as-is"));
                continue;
            };

            let rewritten = if is_stylesheet {
                let result = sanitize_stylesheet(text, &self.profile);
                report.declarations_dropped += result.declarations_dropped;
                result.css
            } else {
                self.sanitize_inline_styles(text, report)
            };

            if let Some(css) = rewritten {
                debug!("Sanitized styles in {}", label);
                report.stylesheets_sanitized += 1;
                pkg.set_file(path, css.into_bytes());
            }
        }
    }

    /// Sanitize `<style>` blocks of a content document; `None` when none changed.
    fn sanitize_inline_styles(&self, document: &str, report: &mut OptimizationReport) -> Option<String> {
        let mut changed = false;
        let out = RE_STYLE_BLOCK.replace_all(document, |caps: &regex::Captures<'_>| {
            let body = &caps[2];
            if body.contains("<![CDATA[") {
                return caps[0].to_string();
            }
            let result = sanitize_stylesheet(body, &self.profile);
            report.declarations_dropped += result.declarations_dropped;
            match result.css {
                Some(css) => {
                    changed = true;
                    format!("{}\n{}{}", &caps[1], css, &caps[3])
                }
                None => caps[0].to_string(),
            }
        });
        changed.then(|| out.into_owned())
    }

    fn transform_images(&self, pkg: &mut DocumentPackage, report: &mut OptimizationReport) {
        let items: Vec<ManifestItem> = pkg
            .manifest()
            .iter()
            .filter(|i| i.is_raster_image())
            .cloned()
            .collect();

        for item in items {
            let path = pkg.full_path(&item.href);
            let Some(data) = pkg.file(&path) else {
                continue;
            };
            match transform_image(data, &self.profile) {
                ImageOutcome::Unchanged => {}
                ImageOutcome::Rewritten {
                    data,
                    converted_to_gray,
                    resized_to,
                } => {
                    if converted_to_gray {
                        report.images_converted += 1;
                    }
                    if resized_to.is_some() {
                        report.images_resized += 1;
                    }
                    pkg.set_file(path, data);
                }
                ImageOutcome::Unsupported(reason) => {
                    report.warn(ResourceWarning::new(&item.href, reason));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::package::tests::sample_epub;
    use super::*;
    use crate::archive::read_zip_entries;
    use crate::error::OptimizationError;

    #[test]
    fn full_run_strips_fonts_and_injects() {
        let input = sample_epub(&[]);
        let (out, report) = Optimizer::new(OptimizationProfile::default())
            .optimize_bytes(&input)
            .unwrap();
        assert_eq!(report.fonts_removed, 1);
        assert_eq!(report.documents_injected, 1);

        let entries = read_zip_entries(&out).unwrap();
        assert_eq!(entries[0].0, "mimetype");
        assert!(entries.iter().all(|(name, _)| !name.ends_with(".ttf")));
        assert!(entries.iter().any(|(name, _)| name == "OEBPS/epaper-sanitizer.css"));
    }

    #[test]
    fn inline_styles_are_sanitized() {
        let doc = "<html><head><style type=\"text/css\">p { float: left; color: red }</style></head><body/></html>";
        let mut report = OptimizationReport::default();
        let out = Optimizer::new(OptimizationProfile::default())
            .sanitize_inline_styles(doc, &mut report)
            .unwrap();
        assert!(!out.contains("float"));
        assert!(out.contains("color: red"));
        assert_eq!(report.declarations_dropped, 1);
    }

    #[test]
    fn caller_package_is_untouched() {
        let pkg = DocumentPackage::parse(&sample_epub(&[])).unwrap();
        let before = pkg.to_entries().unwrap();
        let _ = Optimizer::new(OptimizationProfile::default())
            .optimize(&pkg)
            .unwrap();
        assert_eq!(pkg.to_entries().unwrap(), before);
    }

    #[test]
    fn second_run_changes_nothing() {
        let optimizer = Optimizer::new(OptimizationProfile::default());
        let (once, _) = optimizer.optimize_bytes(&sample_epub(&[])).unwrap();
        let (twice, report) = optimizer.optimize_bytes(&once).unwrap();
        assert!(report.is_noop());
        assert_eq!(once, twice);
    }

    #[test]
    fn integrity_failure_is_an_optimization_error() {
        let mut pkg = DocumentPackage::parse(&sample_epub(&[])).unwrap();
        pkg.remove_item("ch1");
        let err = Optimizer::new(OptimizationProfile::default())
            .optimize(&pkg)
            .unwrap_err();
        assert!(matches!(
            err,
            InkError::Optimization(OptimizationError::SpineEntryMissing { .. })
        ));
    }

    #[test]
    fn unlisted_fonts_are_removed() {
        let input = sample_epub(&[
            ("OEBPS/fonts/Hidden.ttf", [0u8, 1, 0, 0].as_slice()),
            ("OEBPS/misc/Extra.WOFF2", b"wOF2".as_slice()),
        ]);
        let (out, report) = Optimizer::new(OptimizationProfile::default())
            .optimize_bytes(&input)
            .unwrap();
        assert_eq!(report.fonts_removed, 3);
        let entries = read_zip_entries(&out).unwrap();
        assert!(entries
            .iter()
            .all(|(name, _)| !package::is_font_path(name)));
    }

    #[test]
    fn unlisted_stylesheets_are_sanitized() {
        let extra = b"@font-face { font-family: X; src: url(../fonts/x.ttf); }\np { float: left; color: red }";
        let input = sample_epub(&[
            ("OEBPS/css/extra.css", extra.as_slice()),
            (
                "OEBPS/css/epaper-sanitizer.css",
                b"div { position: absolute; color: blue }".as_slice(),
            ),
        ]);
        let optimizer = Optimizer::new(OptimizationProfile::default());
        let (once, _) = optimizer.optimize_bytes(&input).unwrap();

        let pkg = DocumentPackage::parse(&once).unwrap();
        let text = |path: &str| String::from_utf8(pkg.file(path).unwrap().to_vec()).unwrap();
        let extra = text("OEBPS/css/extra.css");
        assert!(!extra.contains("@font-face"));
        assert!(!extra.contains("float"));
        assert!(extra.contains("color: red"));
        let lookalike = text("OEBPS/css/epaper-sanitizer.css");
        assert!(!lookalike.contains("absolute"));
        assert_eq!(text("OEBPS/epaper-sanitizer.css"), inject::EPAPER_CSS);

        let (twice, report) = optimizer.optimize_bytes(&once).unwrap();
        assert!(report.is_noop());
        assert_eq!(once, twice);
    }
}
