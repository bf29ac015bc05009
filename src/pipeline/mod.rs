//! Pipeline stages for package-to-container conversion.
//!
//! Each submodule implements exactly one step, so each is testable on its
//! own and the renderer can be swapped without touching the rest.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ render ──▶ quantize ──▶ index ──▶ encode ──▶ container bytes
//! (zip)    (bitmaps)  (1/2-bit)   (spans)   (2-pass)
//! ```
//!
//! 1. [`input`]     resolve paths and check the zip magic
//! 2. [`render`]    rasterize pages through a [`render::PageRenderer`]; runs in
//!    `spawn_blocking` and rotates pages onto the panel
//! 3. [`quantize`]  error-diffuse or threshold to 1/2-bit planes on the
//!    bounded [`quantize::DitherPool`]
//! 4. [`index`]     record page spans and check chapter boundaries
//! 5. [`encode`]    size every section, then write the container in one pass
//! 6. [`container`] byte layout constants and the random-access reader

pub mod container;
pub mod encode;
pub mod index;
pub mod input;
pub mod quantize;
pub mod render;
