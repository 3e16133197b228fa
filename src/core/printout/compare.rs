//! Printout comparison

use super::render::diff_image;
use super::{Printout, PrintoutError, BLACK};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Comparison strictness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompareMode {
    /// Every pixel bit-for-bit
    #[default]
    Exact,
    /// Bounded per-pixel deviation on a bounded share of pixels
    Tolerant,
}

impl fmt::Display for CompareMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact => write!(f, "exact"),
            Self::Tolerant => write!(f, "tolerant"),
        }
    }
}

impl FromStr for CompareMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "exact" => Ok(Self::Exact),
            "tolerant" => Ok(Self::Tolerant),
            _ => Err(format!("Unknown comparison mode: {s}")),
        }
    }
}

/// Thresholds for [`CompareMode::Tolerant`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tolerance {
    /// Grey-level difference at or below which two pixels are equal
    pub pixel_threshold: u8,
    /// Largest fraction of differing pixels (0.0-1.0) that still matches
    pub max_diff_fraction: f64,
}

impl Default for Tolerance {
    fn default() -> Self {
        Self {
            pixel_threshold: 48,
            max_diff_fraction: 0.005,
        }
    }
}

impl Tolerance {
    /// Set the per-pixel threshold
    #[must_use]
    pub const fn with_pixel_threshold(mut self, threshold: u8) -> Self {
        self.pixel_threshold = threshold;
        self
    }

    /// Set the global threshold
    #[must_use]
    pub const fn with_max_diff_fraction(mut self, fraction: f64) -> Self {
        self.max_diff_fraction = fraction;
        self
    }
}

/// Result of comparing a printout with a sample
#[derive(Debug, Clone)]
pub struct ComparisonResult {
    /// Whether the printout matches
    pub matched: bool,
    /// Strictness used
    pub mode: CompareMode,
    /// Sample-to-printout diff, only for a failed comparison
    pub diff_image: Option<RgbImage>,
    /// Pixels counted as different
    pub differing_pixels: u64,
    /// Pixels compared
    pub total_pixels: u64,
    /// Share of equal pixels (0.0-1.0)
    pub similarity: f64,
    /// Dimensions differ
    pub dimension_mismatch: bool,
}

impl ComparisonResult {
    /// Differing pixels as a percentage
    #[allow(clippy::cast_precision_loss)]
    pub fn diff_percentage(&self) -> f64 {
        if self.total_pixels == 0 {
            0.0
        } else {
            self.differing_pixels as f64 / self.total_pixels as f64 * 100.0
        }
    }
}

/// Compares printouts against samples
#[derive(Debug, Clone, Copy, Default)]
pub struct Comparator {
    tolerance: Tolerance,
}

impl Comparator {
    /// Create a comparator with the given tolerant-mode thresholds
    pub const fn new(tolerance: Tolerance) -> Self {
        Self { tolerance }
    }

    /// Tolerant-mode thresholds
    pub const fn tolerance(&self) -> &Tolerance {
        &self.tolerance
    }

    /// Compare a printout with a sample. Never fails: a dimension mismatch
    /// is a non-match in both modes.
    #[allow(clippy::cast_precision_loss)]
    pub fn compare(&self, printout: &Printout, sample: &Printout, mode: CompareMode) -> ComparisonResult {
        if printout.width() != sample.width() || printout.length() != sample.length() {
            let total = u64::from(printout.width().max(sample.width()))
                * u64::from(printout.length().max(sample.length()));
            return ComparisonResult {
                matched: false,
                mode,
                diff_image: diff_image(sample, printout).ok(),
                differing_pixels: total,
                total_pixels: total,
                similarity: 0.0,
                dimension_mismatch: true,
            };
        }

        let threshold = match mode {
            CompareMode::Exact => 0,
            CompareMode::Tolerant => self.tolerance.pixel_threshold,
        };
        let differing = printout
            .image()
            .pixels()
            .zip(sample.image().pixels())
            .filter(|(a, b)| a.0[0].abs_diff(b.0[0]) > threshold)
            .count() as u64;
        let total = u64::from(printout.width()) * u64::from(printout.length());

        let fraction = if total == 0 {
            0.0
        } else {
            differing as f64 / total as f64
        };
        let matched = match mode {
            CompareMode::Exact => differing == 0,
            CompareMode::Tolerant => fraction <= self.tolerance.max_diff_fraction,
        };

        ComparisonResult {
            matched,
            mode,
            diff_image: if matched {
                None
            } else {
                diff_image(sample, printout).ok()
            },
            differing_pixels: differing,
            total_pixels: total,
            similarity: 1.0 - fraction,
            dimension_mismatch: false,
        }
    }
}

/// Share of matching dots between two printouts (0.0-1.0)
///
/// Both are saturated and cropped of blank lines first. Where the printouts
/// do not overlap the dots count as different, so the denominator is the
/// width times the longer length.
#[allow(clippy::cast_precision_loss)]
pub fn similarity(a: &Printout, b: &Printout) -> Result<f64, PrintoutError> {
    if a.width() != b.width() {
        return Err(PrintoutError::WidthMismatch {
            left: a.width(),
            right: b.width(),
        });
    }

    let a = a.saturated().cropped();
    let b = b.saturated().cropped();
    let overlap = a.length().min(b.length());
    let longest = a.length().max(b.length());
    if longest == 0 || a.width() == 0 {
        return Ok(1.0);
    }

    let mut matching = 0u64;
    for y in 0..overlap {
        for x in 0..a.width() {
            let da = a.image().get_pixel(x, y).0[0] == BLACK;
            let db = b.image().get_pixel(x, y).0[0] == BLACK;
            if da == db {
                matching += 1;
            }
        }
    }

    Ok(matching as f64 / (u64::from(a.width()) * u64::from(longest)) as f64)
}

#[cfg(test)]
mod tests {
    use super::super::testing::dots;
    use super::*;
    use image::Luma;

    fn shaded(printout: &Printout, points: &[(u32, u32)], level: u8) -> Printout {
        let mut image = printout.image().clone();
        for &(x, y) in points {
            image.put_pixel(x, y, Luma([level]));
        }
        Printout::new("shaded", image)
    }

    #[test]
    fn test_identical_matches_in_both_modes() {
        let printout = dots(64, 32, &[(1, 1), (10, 20), (63, 31)]);
        let comparator = Comparator::default();
        for mode in [CompareMode::Exact, CompareMode::Tolerant] {
            let result = comparator.compare(&printout, &printout, mode);
            assert!(result.matched);
            assert_eq!(result.differing_pixels, 0);
            assert!(result.diff_image.is_none());
            assert!((result.similarity - 1.0).abs() < f64::EPSILON);
        }
    }

    #[test]
    fn test_exact_detects_single_pixel() {
        let sample = dots(64, 32, &[(5, 5)]);
        let printout = shaded(&sample, &[(5, 5)], 20);
        let result = Comparator::default().compare(&printout, &sample, CompareMode::Exact);
        assert!(!result.matched);
        assert_eq!(result.differing_pixels, 1);
        assert!(result.diff_image.is_some());
    }

    #[test]
    fn test_tolerant_ignores_small_deviation() {
        let points: Vec<(u32, u32)> = (0..64).map(|x| (x, 3)).collect();
        let sample = dots(64, 32, &points);
        let printout = shaded(&sample, &points, 48);

        let comparator = Comparator::default();
        assert!(!comparator.compare(&printout, &sample, CompareMode::Exact).matched);
        assert!(comparator.compare(&printout, &sample, CompareMode::Tolerant).matched);
    }

    #[test]
    fn test_tolerant_global_threshold() {
        // 64 * 32 = 2048 pixels, 0.5 % allows 10
        let sample = dots(64, 32, &[]);
        let ten: Vec<(u32, u32)> = (0..10).map(|x| (x, 0)).collect();
        let eleven: Vec<(u32, u32)> = (0..11).map(|x| (x, 0)).collect();

        let comparator = Comparator::default();
        assert!(comparator.compare(&dots(64, 32, &ten), &sample, CompareMode::Tolerant).matched);
        assert!(!comparator.compare(&dots(64, 32, &eleven), &sample, CompareMode::Tolerant).matched);

        let strict = Comparator::new(Tolerance::default().with_max_diff_fraction(0.0));
        assert!(!strict.compare(&dots(64, 32, &ten), &sample, CompareMode::Tolerant).matched);
    }

    #[test]
    fn test_dimension_mismatch_is_non_match() {
        let comparator = Comparator::default();
        let a = dots(64, 32, &[]);
        let b = dots(64, 33, &[]);
        let c = dots(48, 32, &[]);

        for mode in [CompareMode::Exact, CompareMode::Tolerant] {
            let result = comparator.compare(&a, &b, mode);
            assert!(!result.matched);
            assert!(result.dimension_mismatch);
            assert!(result.diff_image.is_some());

            let result = comparator.compare(&a, &c, mode);
            assert!(!result.matched);
            assert!(result.diff_image.is_none());
        }
    }

    #[test]
    fn test_similarity() {
        let a = dots(10, 5, &[(0, 0), (1, 0)]);
        assert!((similarity(&a, &a).unwrap() - 1.0).abs() < f64::EPSILON);

        // Offset on the paper does not matter
        let b = dots(10, 8, &[(0, 6), (1, 6)]);
        assert!((similarity(&a, &b).unwrap() - 1.0).abs() < f64::EPSILON);

        // Two of ten dots differ on the single overlapping line
        let c = dots(10, 5, &[(0, 2), (2, 2)]);
        let s = similarity(&a, &c).unwrap();
        assert!((s - 0.8).abs() < 1e-9, "{s}");

        // Extra printed line only in one printout
        let d = dots(10, 5, &[(0, 0), (1, 0), (4, 1)]);
        let s = similarity(&a, &d).unwrap();
        assert!((s - 0.5).abs() < 1e-9, "{s}");

        assert!(matches!(
            similarity(&a, &dots(12, 5, &[])),
            Err(PrintoutError::WidthMismatch { .. })
        ));
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("Tolerant".parse::<CompareMode>().unwrap(), CompareMode::Tolerant);
        assert!("fuzzy".parse::<CompareMode>().is_err());
        assert_eq!(CompareMode::Exact.to_string(), "exact");
    }
}
