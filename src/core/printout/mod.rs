//! Printouts, reference samples and their comparison
//!
//! A printout is an 8-bit greyscale strip of thermal paper: one image row per
//! dot line, 255 for untouched paper and darker values for burned dots.

mod compare;
mod render;
mod store;

pub use compare::{similarity, CompareMode, Comparator, ComparisonResult, Tolerance};
pub use render::{comparison_image, diff_image};
pub use store::{ArtifactDir, SampleName, SampleStore};

use image::{GrayImage, Luma};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Untouched paper
pub const WHITE: u8 = 255;
/// Fully burned dot
pub const BLACK: u8 = 0;

/// Printout errors
#[derive(Error, Debug)]
pub enum PrintoutError {
    /// Sample file does not exist
    #[error("Sample not found: {}", .0.display())]
    SampleNotFound(PathBuf),

    /// Printouts from different mechanisms
    #[error("Printouts are of differing width: {left} and {right} dots")]
    WidthMismatch {
        /// Width of the first printout
        left: u32,
        /// Width of the second printout
        right: u32,
    },

    /// File name does not follow `<font>_<variant>_<text>`
    #[error("Invalid sample name: {0}")]
    InvalidSampleName(String),

    /// Decoding or encoding failed
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Captured printout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Printout {
    name: String,
    image: GrayImage,
}

impl Printout {
    /// Wrap a bitmap
    pub fn new(name: impl Into<String>, image: GrayImage) -> Self {
        Self {
            name: name.into(),
            image,
        }
    }

    /// Unprinted paper
    pub fn blank(name: impl Into<String>, width: u32, length: u32) -> Self {
        Self::new(name, GrayImage::from_pixel(width, length, Luma([WHITE])))
    }

    /// Load a greyscale PNG; colour images are converted
    pub fn open(path: &Path) -> Result<Self, PrintoutError> {
        if !path.is_file() {
            return Err(PrintoutError::SampleNotFound(path.to_path_buf()));
        }
        let image = image::open(path)?.into_luma8();
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self { name, image })
    }

    /// Write as a greyscale PNG, creating parent directories
    pub fn save(&self, path: &Path) -> Result<(), PrintoutError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.image.save_with_format(path, image::ImageFormat::Png)?;
        Ok(())
    }

    /// Name of the printout
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bitmap
    pub fn image(&self) -> &GrayImage {
        &self.image
    }

    /// Dots per line
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    /// Number of dot lines
    pub fn length(&self) -> u32 {
        self.image.height()
    }

    /// Whether any dot was burned
    pub fn is_blank(&self) -> bool {
        self.image.pixels().all(|p| p.0[0] == WHITE)
    }

    /// Every burned dot made fully black
    #[must_use]
    pub fn saturated(&self) -> Self {
        let mut image = self.image.clone();
        for pixel in image.pixels_mut() {
            if pixel.0[0] != WHITE {
                pixel.0[0] = BLACK;
            }
        }
        Self::new(self.name.clone(), image)
    }

    /// Blank lines above the first and below the last burned line removed.
    /// A blank printout is returned unchanged.
    #[must_use]
    pub fn cropped(&self) -> Self {
        let burned = |y: u32| (0..self.width()).any(|x| self.image.get_pixel(x, y).0[0] != WHITE);
        let Some(first) = (0..self.length()).find(|&y| burned(y)) else {
            return self.clone();
        };
        let last = (0..self.length()).rev().find(|&y| burned(y)).unwrap_or(first);

        let image = image::imageops::crop_imm(&self.image, 0, first, self.width(), last - first + 1).to_image();
        Self::new(self.name.clone(), image)
    }
}

/// Reference printout loaded from disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    path: PathBuf,
    printout: Printout,
}

impl Sample {
    /// Load a sample file
    pub fn load(path: &Path) -> Result<Self, PrintoutError> {
        Ok(Self {
            path: path.to_path_buf(),
            printout: Printout::open(path)?,
        })
    }

    /// File the sample was loaded from
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parsed file name, when it follows the naming scheme
    pub fn sample_name(&self) -> Option<SampleName> {
        self.printout.name().parse().ok()
    }
}

impl Deref for Sample {
    type Target = Printout;

    fn deref(&self) -> &Printout {
        &self.printout
    }
}

/// Write a printout as a PNG readable by [`Sample::load`]
pub fn save_printout(printout: &Printout, path: &Path) -> Result<(), PrintoutError> {
    printout.save(path)
}

/// Write a side-by-side image: sample, printout and their difference
pub fn save_comparison(printout: &Printout, sample: &Printout, path: &Path) -> Result<(), PrintoutError> {
    let image = comparison_image(sample, printout, "SAMPLE", "PRINTOUT")?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    image.save_with_format(path, image::ImageFormat::Png)?;
    Ok(())
}
