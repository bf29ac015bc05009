//! E-paper stylesheet injection.
//!
//! A fixed stylesheet is stored next to the OPF and linked from every XHTML
//! content document just before `</head>`, so it cascades after the book's
//! own styles. Both steps look for their own marker first (a manifest item
//! resolving to the stylesheet path, the exact `href` inside the document),
//! so a second run is a no-op.

use super::package::{relative_href, DocumentPackage, ManifestItem};
use crate::error::ResourceWarning;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

pub const STYLESHEET_ID: &str = "epaper-sanitizer-css";
pub const STYLESHEET_FILE: &str = "epaper-sanitizer.css";

/// Layout rules for small monochrome screens.
pub const EPAPER_CSS: &str = "\
html, body {
    margin: 0;
    padding: 0;
}
body {
    font-family: serif;
    font-size: 0.95em;
    line-height: 1.4;
    text-align: left;
}
p {
    margin: 0 0 0.6em 0;
    widows: 2;
    orphans: 2;
}
h1, h2, h3, h4, h5, h6 {
    margin: 0.8em 0 0.4em 0;
    font-weight: bold;
}
img {
    max-width: 100%;
    height: auto;
    display: block;
    margin: 0.4em auto;
}
div, p, img, figure {
    float: none !important;
    position: static !important;
    column-count: auto !important;
}
ul, ol {
    margin: 0 0 0.6em 1.2em;
    padding: 0;
}
";

static RE_HEAD_CLOSE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)</head\s*>").unwrap());

/// Outcome of one injection pass.
#[derive(Debug, Default)]
pub struct InjectionSummary {
    pub documents_injected: usize,
    pub stylesheet_added: bool,
    pub warnings: Vec<ResourceWarning>,
}

/// Archive path of the injected stylesheet.
pub fn stylesheet_path(package: &DocumentPackage) -> String {
    package.full_path(STYLESHEET_FILE)
}

/// Whether a manifest item is the injected stylesheet, by resolved path.
pub fn is_injected(package: &DocumentPackage, item: &ManifestItem) -> bool {
    package.full_path(&item.href) == stylesheet_path(package)
}

/// [`STYLESHEET_ID`], suffixed when a foreign item already holds it.
fn free_stylesheet_id(package: &DocumentPackage) -> String {
    let mut id = STYLESHEET_ID.to_string();
    let mut n = 2;
    while package.item(&id).is_some() {
        id = format!("{STYLESHEET_ID}-{n}");
        n += 1;
    }
    id
}

/// Add the stylesheet to the package and link it from every content document.
pub fn inject_stylesheet(package: &mut DocumentPackage) -> InjectionSummary {
    let mut summary = InjectionSummary::default();
    let css_path = stylesheet_path(package);

    let present = package.manifest().iter().any(|i| is_injected(package, i));
    if !present {
        let id = free_stylesheet_id(package);
        package.add_item(
            ManifestItem::new(id, STYLESHEET_FILE, "text/css"),
            EPAPER_CSS.as_bytes().to_vec(),
        );
        summary.stylesheet_added = true;
    }

    let documents: Vec<ManifestItem> = package
        .manifest()
        .iter()
        .filter(|i| i.is_content_document())
        .cloned()
        .collect();

    for item in documents {
        let path = package.full_path(&item.href);
        let Some(data) = package.file(&path) else {
            continue;
        };
        let text = match std::str::from_utf8(data) {
            Ok(text) => text,
            Err(_) => {
                summary
                    .warnings
                    .push(ResourceWarning::new(&item.href, "not UTF-8; stylesheet not linked"));
                continue;
            }
        };
        let href = relative_href(&path, &css_path);
        if text.contains(&link_attribute(&href)) {
            continue;
        }
        match link_stylesheet(text, &href) {
            Some(updated) => {
                package.set_file(path, updated.into_bytes());
                summary.documents_injected += 1;
            }
            None => summary
                .warnings
                .push(ResourceWarning::new(&item.href, "no </head>; stylesheet not linked")),
        }
    }

    debug!(
        "Injected stylesheet into {} documents",
        summary.documents_injected
    );
    summary
}

fn link_attribute(href: &str) -> String {
    format!("href=\"{}\"", quick_xml::escape::escape(href))
}

/// Insert a `<link>` to `href` before the first `</head>`.
pub fn link_stylesheet(document: &str, href: &str) -> Option<String> {
    let head = RE_HEAD_CLOSE.find(document)?;
    let link = format!(
        "<link rel=\"stylesheet\" type=\"text/css\" {}/>\n",
        link_attribute(href)
    );
    let mut out = String::with_capacity(document.len() + link.len());
    out.push_str(&document[..head.start()]);
    out.push_str(&link);
    out.push_str(&document[head.start()..]);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimize::package::tests::sample_epub;

    #[test]
    fn link_goes_after_existing_styles() {
        let doc = "<html><head><link href=\"a.css\"/></HEAD ><body/></html>";
        let out = link_stylesheet(doc, "../x.css").unwrap();
        assert_eq!(
            out,
            "<html><head><link href=\"a.css\"/><link rel=\"stylesheet\" type=\"text/css\" href=\"../x.css\"/>\n</HEAD ><body/></html>"
        );
        assert!(link_stylesheet("<p>no head</p>", "x.css").is_none());
    }

    #[test]
    fn injection_is_idempotent() {
        let mut pkg = DocumentPackage::parse(&sample_epub(&[])).unwrap();
        let first = inject_stylesheet(&mut pkg);
        assert!(first.stylesheet_added);
        assert_eq!(first.documents_injected, 1);
        assert_eq!(
            pkg.file("OEBPS/epaper-sanitizer.css").unwrap(),
            EPAPER_CSS.as_bytes()
        );
        let doc = std::str::from_utf8(pkg.file("OEBPS/text/ch1.xhtml").unwrap()).unwrap();
        assert!(doc.contains("href=\"../epaper-sanitizer.css\""));

        let second = inject_stylesheet(&mut pkg);
        assert!(!second.stylesheet_added);
        assert_eq!(second.documents_injected, 0);
        assert_eq!(
            pkg.manifest().iter().filter(|i| is_injected(&pkg, i)).count(),
            1
        );
    }

    #[test]
    fn same_named_sheet_elsewhere_is_not_ours() {
        let mut pkg = DocumentPackage::parse(&sample_epub(&[])).unwrap();
        pkg.add_item(
            ManifestItem::new(STYLESHEET_ID, "css/epaper-sanitizer.css", "text/css"),
            b"p { color: gray }".to_vec(),
        );
        pkg.set_file(
            "OEBPS/text/ch1.xhtml",
            b"<html><head><link rel=\"stylesheet\" href=\"../css/epaper-sanitizer.css\"/></head><body/></html>".to_vec(),
        );

        let summary = inject_stylesheet(&mut pkg);
        assert!(summary.stylesheet_added);
        assert_eq!(summary.documents_injected, 1);
        let ours: Vec<&ManifestItem> = pkg
            .manifest()
            .iter()
            .filter(|i| is_injected(&pkg, i))
            .collect();
        assert_eq!(ours.len(), 1);
        assert_eq!(ours[0].id, "epaper-sanitizer-css-2");
        let doc = std::str::from_utf8(pkg.file("OEBPS/text/ch1.xhtml").unwrap()).unwrap();
        assert!(doc.contains("href=\"../epaper-sanitizer.css\""));
        pkg.validate().unwrap();
    }
}
