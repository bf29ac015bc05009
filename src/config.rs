//! Configuration types for e-ink conversion and package optimization.
//!
//! Every run works from an immutable snapshot: a [`ConversionConfig`] (device
//! geometry + quantizer knobs) for the container path, an
//! [`OptimizationProfile`] for the EPUB path, and [`BatchOptions`] for the
//! orchestrator. Each is built via a builder whose `build()` validates the
//! combination and returns [`InkError::InvalidConfig`] on nonsense.
//!
//! The profile types derive `serde` so a profile can be stored as JSON and
//! passed to the CLI with `--profile`.

use crate::batch::CancelToken;
use crate::error::InkError;
use crate::pipeline::quantize::QuantizeOptions;
use crate::progress::ProgressCallback;
use serde::{Deserialize, Serialize};
use std::fmt;

// ── Device ───────────────────────────────────────────────────────────────

/// Panel rotation applied to rendered pages, in clockwise quarter turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Orientation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Orientation {
    /// Parse a rotation in degrees. Only 0, 90, 180 and 270 are valid.
    pub fn from_degrees(degrees: u16) -> Option<Self> {
        match degrees {
            0 => Some(Orientation::Deg0),
            90 => Some(Orientation::Deg90),
            180 => Some(Orientation::Deg180),
            270 => Some(Orientation::Deg270),
            _ => None,
        }
    }

    pub fn from_quarter_turns(turns: u8) -> Option<Self> {
        match turns {
            0 => Some(Orientation::Deg0),
            1 => Some(Orientation::Deg90),
            2 => Some(Orientation::Deg180),
            3 => Some(Orientation::Deg270),
            _ => None,
        }
    }

    pub fn degrees(self) -> u16 {
        u16::from(self.quarter_turns()) * 90
    }

    pub fn quarter_turns(self) -> u8 {
        match self {
            Orientation::Deg0 => 0,
            Orientation::Deg90 => 1,
            Orientation::Deg180 => 2,
            Orientation::Deg270 => 3,
        }
    }

    /// True when the rotation swaps width and height.
    pub fn is_quarter(self) -> bool {
        matches!(self, Orientation::Deg90 | Orientation::Deg270)
    }
}

/// Bits per pixel of a quantized plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BitDepth {
    /// Two levels (black, white). Container magic `XTC\0`.
    One,
    /// Four levels (0/85/170/255). Container magic `XTCH`.
    #[default]
    Two,
}

impl BitDepth {
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            1 => Some(BitDepth::One),
            2 => Some(BitDepth::Two),
            _ => None,
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            BitDepth::One => 1,
            BitDepth::Two => 2,
        }
    }

    /// Number of gray levels representable at this depth.
    pub fn levels(self) -> usize {
        1 << self.bits()
    }

    /// File extension used for containers of this depth.
    pub fn extension(self) -> &'static str {
        match self {
            BitDepth::One => "xtc",
            BitDepth::Two => "xtch",
        }
    }
}

/// Physical panel description.
///
/// Fields are private so every instance has passed [`DeviceProfile::new`]:
/// both dimensions are non-zero and fit the 16-bit container header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "DeviceFields")]
pub struct DeviceProfile {
    width: u32,
    height: u32,
    orientation: Orientation,
    bit_depth: BitDepth,
}

/// Unchecked wire form of [`DeviceProfile`]; deserialization goes through `new`.
#[derive(Deserialize)]
struct DeviceFields {
    width: u32,
    height: u32,
    #[serde(default)]
    orientation: Orientation,
    #[serde(default)]
    bit_depth: BitDepth,
}

impl TryFrom<DeviceFields> for DeviceProfile {
    type Error = InkError;

    fn try_from(f: DeviceFields) -> Result<Self, Self::Error> {
        Self::new(f.width, f.height, f.orientation, f.bit_depth)
    }
}

impl DeviceProfile {
    pub fn new(
        width: u32,
        height: u32,
        orientation: Orientation,
        bit_depth: BitDepth,
    ) -> Result<Self, InkError> {
        if width == 0 || height == 0 {
            return Err(InkError::InvalidConfig(format!(
                "Device dimensions must be non-zero, got {width}×{height}"
            )));
        }
        if width > u32::from(u16::MAX) || height > u32::from(u16::MAX) {
            return Err(InkError::InvalidConfig(format!(
                "Device dimensions must be ≤ {}, got {width}×{height}",
                u16::MAX
            )));
        }
        Ok(Self {
            width,
            height,
            orientation,
            bit_depth,
        })
    }

    /// Xteink X4: 480×800 portrait panel, 2-bit grayscale.
    pub fn xteink_x4() -> Self {
        Self {
            width: 480,
            height: 800,
            orientation: Orientation::Deg0,
            bit_depth: BitDepth::Two,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn orientation(&self) -> Orientation {
        self.orientation
    }

    pub fn bit_depth(&self) -> BitDepth {
        self.bit_depth
    }

    pub fn with_orientation(mut self, orientation: Orientation) -> Self {
        self.orientation = orientation;
        self
    }

    pub fn with_bit_depth(mut self, bit_depth: BitDepth) -> Self {
        self.bit_depth = bit_depth;
        self
    }

    /// Canvas the renderer draws on, before rotation onto the panel.
    pub fn render_size(&self) -> (u32, u32) {
        if self.orientation.is_quarter() {
            (self.height, self.width)
        } else {
            (self.width, self.height)
        }
    }
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self::xteink_x4()
    }
}

// ── Conversion ───────────────────────────────────────────────────────────

/// Configuration for converting one source package into a page container.
///
/// # Example
/// ```rust
/// use inkpress::{BitDepth, ConversionConfig};
///
/// let config = ConversionConfig::builder()
///     .bit_depth(BitDepth::One)
///     .dither_strength(0.5)
///     .dark_mode(true)
///     .build()
///     .unwrap();
/// assert_eq!(config.output_extension(), "xtc");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionConfig {
    /// Target panel. Default: [`DeviceProfile::xteink_x4`].
    pub device: DeviceProfile,

    /// Error-diffusion strength in `[0, 1]`. `0` is flat thresholding. Default: 1.0.
    pub dither_strength: f32,

    /// Invert level codes after quantization. Default: false.
    pub dark_mode: bool,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            device: DeviceProfile::default(),
            dither_strength: 1.0,
            dark_mode: false,
        }
    }
}

impl ConversionConfig {
    pub fn builder() -> ConversionConfigBuilder {
        ConversionConfigBuilder {
            config: Self::default(),
            dimensions: None,
        }
    }

    /// Quantizer settings derived from this snapshot.
    pub fn quantize_options(&self) -> QuantizeOptions {
        QuantizeOptions {
            bit_depth: self.device.bit_depth(),
            strength: self.dither_strength,
            dark_mode: self.dark_mode,
        }
    }

    pub fn output_extension(&self) -> &'static str {
        self.device.bit_depth().extension()
    }
}

/// Builder for [`ConversionConfig`].
#[derive(Debug)]
pub struct ConversionConfigBuilder {
    config: ConversionConfig,
    dimensions: Option<(u32, u32)>,
}

impl ConversionConfigBuilder {
    pub fn device(mut self, device: DeviceProfile) -> Self {
        self.config.device = device;
        self.dimensions = None;
        self
    }

    /// Override panel dimensions; validated in [`build`](Self::build).
    pub fn dimensions(mut self, width: u32, height: u32) -> Self {
        self.dimensions = Some((width, height));
        self
    }

    pub fn orientation(mut self, orientation: Orientation) -> Self {
        self.config.device = self.config.device.with_orientation(orientation);
        self
    }

    pub fn bit_depth(mut self, bit_depth: BitDepth) -> Self {
        self.config.device = self.config.device.with_bit_depth(bit_depth);
        self
    }

    pub fn dither_strength(mut self, strength: f32) -> Self {
        self.config.dither_strength = if strength.is_nan() {
            0.0
        } else {
            strength.clamp(0.0, 1.0)
        };
        self
    }

    pub fn dark_mode(mut self, v: bool) -> Self {
        self.config.dark_mode = v;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ConversionConfig, InkError> {
        let mut config = self.config;
        if let Some((width, height)) = self.dimensions {
            let d = config.device;
            config.device = DeviceProfile::new(width, height, d.orientation(), d.bit_depth())?;
        }
        Ok(config)
    }
}

// ── Optimization ─────────────────────────────────────────────────────────

/// Which CSS property categories the sanitizer removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CssStripRules {
    pub floats: bool,
    pub flexbox: bool,
    pub grid: bool,
    pub positioning: bool,
    pub columns: bool,
    pub fixed_dimensions: bool,
    pub margins: bool,
    pub text_indent: bool,
}

impl Default for CssStripRules {
    fn default() -> Self {
        Self {
            floats: true,
            flexbox: true,
            grid: true,
            positioning: true,
            columns: true,
            fixed_dimensions: true,
            margins: true,
            text_indent: true,
        }
    }
}

impl CssStripRules {
    /// Every category disabled; stylesheets pass through untouched.
    pub fn none() -> Self {
        Self {
            floats: false,
            flexbox: false,
            grid: false,
            positioning: false,
            columns: false,
            fixed_dimensions: false,
            margins: false,
            text_indent: false,
        }
    }
}

/// Knobs for the EPUB structural optimizer.
///
/// # Example
/// ```rust
/// use inkpress::OptimizationProfile;
///
/// let profile = OptimizationProfile::builder()
///     .max_image_dimension(600)
///     .strip_fonts(false)
///     .build()
///     .unwrap();
/// assert!(profile.grayscale);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizationProfile {
    /// CSS categories to drop. Default: all enabled.
    pub css: CssStripRules,

    /// Remove embedded fonts, `@font-face` rules and specific font families. Default: true.
    pub strip_fonts: bool,

    /// Convert raster images to single-channel luma. Default: true.
    pub grayscale: bool,

    /// Longest allowed image side in pixels. Default: 480 (panel width).
    pub max_image_dimension: u32,

    /// JPEG re-encode quality, 1–100. Default: 75.
    pub jpeg_quality: u8,

    /// Contrast multiplier applied to color images before gray conversion. 1.0 disables. Default: 1.2.
    pub contrast_boost: f32,

    /// Add the e-paper stylesheet to every content document. Default: true.
    pub inject_stylesheet: bool,
}

impl Default for OptimizationProfile {
    fn default() -> Self {
        Self {
            css: CssStripRules::default(),
            strip_fonts: true,
            grayscale: true,
            max_image_dimension: 480,
            jpeg_quality: 75,
            contrast_boost: 1.2,
            inject_stylesheet: true,
        }
    }
}

impl OptimizationProfile {
    pub fn builder() -> OptimizationProfileBuilder {
        OptimizationProfileBuilder {
            profile: Self::default(),
        }
    }

    /// Load a profile from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, InkError> {
        let profile: Self = serde_json::from_str(json)
            .map_err(|e| InkError::InvalidConfig(format!("Profile JSON: {e}")))?;
        profile.validate()?;
        Ok(profile)
    }

    fn validate(&self) -> Result<(), InkError> {
        if self.max_image_dimension == 0 {
            return Err(InkError::InvalidConfig(
                "Maximum image dimension must be ≥ 1".into(),
            ));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(InkError::InvalidConfig(format!(
                "JPEG quality must be 1–100, got {}",
                self.jpeg_quality
            )));
        }
        if !self.contrast_boost.is_finite() || self.contrast_boost <= 0.0 {
            return Err(InkError::InvalidConfig(format!(
                "Contrast boost must be a positive number, got {}",
                self.contrast_boost
            )));
        }
        Ok(())
    }
}

/// Builder for [`OptimizationProfile`].
#[derive(Debug)]
pub struct OptimizationProfileBuilder {
    profile: OptimizationProfile,
}

impl OptimizationProfileBuilder {
    pub fn css(mut self, rules: CssStripRules) -> Self {
        self.profile.css = rules;
        self
    }

    pub fn strip_fonts(mut self, v: bool) -> Self {
        self.profile.strip_fonts = v;
        self
    }

    pub fn grayscale(mut self, v: bool) -> Self {
        self.profile.grayscale = v;
        self
    }

    pub fn max_image_dimension(mut self, px: u32) -> Self {
        self.profile.max_image_dimension = px;
        self
    }

    pub fn jpeg_quality(mut self, q: u8) -> Self {
        self.profile.jpeg_quality = q.clamp(1, 100);
        self
    }

    pub fn contrast_boost(mut self, factor: f32) -> Self {
        self.profile.contrast_boost = factor;
        self
    }

    pub fn inject_stylesheet(mut self, v: bool) -> Self {
        self.profile.inject_stylesheet = v;
        self
    }

    /// Build the profile, validating constraints.
    pub fn build(self) -> Result<OptimizationProfile, InkError> {
        self.profile.validate()?;
        Ok(self.profile)
    }
}

// ── Batch ────────────────────────────────────────────────────────────────

/// Orchestrator settings shared by both batch paths.
#[derive(Clone)]
pub struct BatchOptions {
    /// Files processed at once. Default: 4.
    pub concurrency: usize,

    /// Blocking dither workers shared by all in-flight files. Default: available cores.
    pub dither_workers: usize,

    /// Per-file state events. Default: none.
    pub progress_callback: Option<ProgressCallback>,

    /// Stops dispatch of new files and aborts in-flight ones between pages.
    pub cancel: CancelToken,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            dither_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            progress_callback: None,
            cancel: CancelToken::new(),
        }
    }
}

impl fmt::Debug for BatchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchOptions")
            .field("concurrency", &self.concurrency)
            .field("dither_workers", &self.dither_workers)
            .field(
                "progress_callback",
                &self
                    .progress_callback
                    .as_ref()
                    .map(|_| "<dyn BatchProgressCallback>"),
            )
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl BatchOptions {
    pub fn builder() -> BatchOptionsBuilder {
        BatchOptionsBuilder {
            options: Self::default(),
        }
    }
}

/// Builder for [`BatchOptions`].
#[derive(Debug)]
pub struct BatchOptionsBuilder {
    options: BatchOptions,
}

impl BatchOptionsBuilder {
    pub fn concurrency(mut self, n: usize) -> Self {
        self.options.concurrency = n.max(1);
        self
    }

    pub fn dither_workers(mut self, n: usize) -> Self {
        self.options.dither_workers = n.max(1);
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.options.progress_callback = Some(cb);
        self
    }

    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.options.cancel = token;
        self
    }

    pub fn build(self) -> Result<BatchOptions, InkError> {
        if self.options.concurrency == 0 || self.options.dither_workers == 0 {
            return Err(InkError::InvalidConfig(
                "Concurrency and dither workers must be ≥ 1".into(),
            ));
        }
        Ok(self.options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn x4_preset() {
        let d = DeviceProfile::xteink_x4();
        assert_eq!((d.width(), d.height()), (480, 800));
        assert_eq!(d.bit_depth(), BitDepth::Two);
        assert_eq!(d.render_size(), (480, 800));
    }

    #[test]
    fn render_size_swaps_for_quarter_turns() {
        let d = DeviceProfile::xteink_x4().with_orientation(Orientation::Deg90);
        assert_eq!(d.render_size(), (800, 480));
        let d = d.with_orientation(Orientation::Deg180);
        assert_eq!(d.render_size(), (480, 800));
    }

    #[test]
    fn device_rejects_zero_and_oversized() {
        assert!(DeviceProfile::new(0, 800, Orientation::Deg0, BitDepth::One).is_err());
        assert!(DeviceProfile::new(480, 70_000, Orientation::Deg0, BitDepth::One).is_err());
        assert!(DeviceProfile::new(1, 1, Orientation::Deg270, BitDepth::Two).is_ok());
    }

    #[test]
    fn deserialized_device_is_validated() {
        let d: DeviceProfile =
            serde_json::from_str(r#"{ "width": 600, "height": 800, "bit_depth": "One" }"#).unwrap();
        assert_eq!((d.width(), d.height()), (600, 800));
        assert_eq!(d.orientation(), Orientation::Deg0);

        let err = serde_json::from_str::<DeviceProfile>(r#"{ "width": 0, "height": 800 }"#)
            .unwrap_err();
        assert!(err.to_string().contains("non-zero"));
        assert!(serde_json::from_str::<ConversionConfig>(
            r#"{ "device": { "width": 480, "height": 70000 } }"#
        )
        .is_err());
    }

    #[test]
    fn orientation_parsing() {
        assert_eq!(Orientation::from_degrees(270), Some(Orientation::Deg270));
        assert_eq!(Orientation::from_degrees(45), None);
        assert_eq!(Orientation::Deg180.quarter_turns(), 2);
        assert_eq!(Orientation::from_quarter_turns(1), Some(Orientation::Deg90));
        assert_eq!(Orientation::Deg90.degrees(), 90);
    }

    #[test]
    fn dither_strength_is_clamped() {
        let c = ConversionConfig::builder()
            .dither_strength(3.5)
            .build()
            .unwrap();
        assert_eq!(c.dither_strength, 1.0);
        let c = ConversionConfig::builder()
            .dither_strength(-1.0)
            .build()
            .unwrap();
        assert_eq!(c.dither_strength, 0.0);
    }

    #[test]
    fn builder_validates_dimensions() {
        let err = ConversionConfig::builder()
            .dimensions(0, 10)
            .build()
            .unwrap_err();
        assert!(matches!(err, InkError::InvalidConfig(_)));

        let c = ConversionConfig::builder()
            .dimensions(600, 800)
            .bit_depth(BitDepth::One)
            .build()
            .unwrap();
        assert_eq!(c.device.width(), 600);
        assert_eq!(c.output_extension(), "xtc");
    }

    #[test]
    fn profile_defaults_and_json() {
        let p = OptimizationProfile::default();
        assert_eq!(p.jpeg_quality, 75);
        assert_eq!(p.max_image_dimension, 480);

        let p = OptimizationProfile::from_json(r#"{"strip_fonts": false, "css": {"margins": false}}"#)
            .unwrap();
        assert!(!p.strip_fonts);
        assert!(!p.css.margins);
        assert!(p.css.floats);
        assert!(p.grayscale);
    }

    #[test]
    fn profile_rejects_zero_dimension() {
        let err = OptimizationProfile::builder()
            .max_image_dimension(0)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("dimension"));
    }

    #[test]
    fn batch_options_debug_hides_callback() {
        let opts = BatchOptions::builder().concurrency(0).build().unwrap();
        assert_eq!(opts.concurrency, 1);
        let dbg = format!("{opts:?}");
        assert!(dbg.contains("concurrency"));
    }
}
