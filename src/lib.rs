//! ORB (Oriented FAST and Rotated BRIEF) feature extraction.
//!
//! Given a grayscale image, the extractor produces keypoints (position,
//! scale, orientation, response) together with 256-bit binary descriptors
//! that downstream consumers can match by Hamming distance. Detection runs
//! a tiled FAST segment test over a scale pyramid, spreads the surviving
//! corners with a quad-tree so features cover the image instead of
//! crowding into the most textured region, orients each keypoint by its
//! intensity centroid, and samples a rotated BRIEF pattern for the
//! descriptor.

mod descriptors;
mod distribute;
mod fast;
pub mod image;
mod orientation;
mod pyramid;

pub use crate::image::{GrayByteImage, Interpolation};

use ::image::DynamicImage;
use bitarray::BitArray;
use cv_core::nalgebra::Point2;
use cv_core::ImagePoint;
use log::*;
use pyramid::{PyramidLevel, PATCH_SIZE};
use std::path::Path;
use thiserror::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[cfg(feature = "rayon")]
use rayon::prelude::*;

/// A 256-bit binary descriptor. Descriptors are compared by Hamming
/// distance; the bit layout is fixed, so distances between descriptors
/// from separate calls are meaningful.
pub type Descriptor = BitArray<32>;

/// A point of interest in an image.
/// This pretty much follows from OpenCV conventions.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct KeyPoint {
    /// The position in source-image coordinates. +x faces right and +y
    /// faces toward the bottom of the image, both starting at the top
    /// left corner.
    pub point: (f32, f32),

    /// The magnitude of response from the detector.
    pub response: f32,

    /// The diameter of the measurement patch in source pixels.
    pub size: f32,

    /// The pyramid level the keypoint was detected on.
    pub octave: usize,

    /// The orientation angle in degrees in `[0, 360)`, or `-1.0` when
    /// orientation was disabled in the configuration.
    pub angle: f32,
}

impl ImagePoint for KeyPoint {
    fn image_point(&self) -> Point2<f64> {
        Point2::new(self.point.0 as f64, self.point.1 as f64)
    }
}

/// Errors from extractor construction or extraction calls.
#[derive(Debug, Error)]
pub enum Error {
    #[error("feature target must be positive")]
    InvalidFeatureCount,
    #[error("scale factor must be finite and greater than 1.0, got {0}")]
    InvalidScaleFactor(f32),
    #[error("pyramid needs at least one level")]
    InvalidLevelCount,
    #[error("minimum FAST threshold {minimum} exceeds the initial threshold {initial}")]
    ThresholdOrder { initial: u8, minimum: u8 },
    #[error("input image is empty")]
    EmptyImage,
    #[error("mask is {mask_width}x{mask_height} but the image is {width}x{height}")]
    MaskDimensionMismatch {
        width: usize,
        height: usize,
        mask_width: usize,
        mask_height: usize,
    },
    #[error(transparent)]
    Image(#[from] ::image::ImageError),
}

/// Contains the configuration parameters of the extractor, fixed at
/// construction.
///
/// The detection thresholds are the FAST contrast thresholds: tiles are
/// probed at `initial_threshold` first and fall back to
/// `minimum_threshold` only when a tile yields nothing, so low-texture
/// regions still produce candidates.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct OrbConfig {
    /// Total feature budget across all pyramid levels.
    pub max_features: usize,

    /// Scale ratio between consecutive pyramid levels. Must exceed 1.
    pub scale_factor: f32,

    /// Number of pyramid levels.
    pub levels: usize,

    /// FAST threshold applied to every detection tile first.
    pub initial_threshold: u8,

    /// Relaxed FAST threshold for tiles the initial pass left empty. Must
    /// not exceed `initial_threshold`.
    pub minimum_threshold: u8,

    /// Resampling policy used when building the pyramid.
    pub interpolation: Interpolation,

    /// Whether to compute keypoint orientations. When disabled, keypoint
    /// angles are reported as `-1.0` and descriptors sample the unrotated
    /// pattern.
    pub orientation: bool,
}

impl Default for OrbConfig {
    fn default() -> Self {
        Self {
            max_features: 1000,
            scale_factor: 1.2,
            levels: 8,
            initial_threshold: 20,
            minimum_threshold: 7,
            interpolation: Interpolation::Linear,
            orientation: true,
        }
    }
}

/// The ORB feature extractor.
///
/// Holds the validated configuration and the tables derived from it: the
/// per-level scales, the per-level feature quotas, and the circular patch
/// bounds used by orientation. The extractor is immutable after
/// construction, so one instance can serve any number of sequential or
/// concurrent extraction calls.
#[derive(Debug, Clone)]
pub struct Orb {
    config: OrbConfig,
    level_scales: Vec<f32>,
    level_features: Vec<usize>,
    circle_limits: Vec<i32>,
}

impl Default for Orb {
    fn default() -> Self {
        Self::new(OrbConfig::default()).expect("default configuration is valid")
    }
}

impl Orb {
    /// Validate a configuration and build an extractor from it.
    ///
    /// Invalid combinations are rejected here rather than clamped: a scale
    /// factor at or below 1, a zero level count, a zero feature budget, or
    /// a fallback threshold above the initial threshold all fail with the
    /// matching [`Error`].
    pub fn new(config: OrbConfig) -> Result<Self, Error> {
        if config.max_features == 0 {
            return Err(Error::InvalidFeatureCount);
        }
        if !config.scale_factor.is_finite() || config.scale_factor <= 1.0 {
            return Err(Error::InvalidScaleFactor(config.scale_factor));
        }
        if config.levels == 0 {
            return Err(Error::InvalidLevelCount);
        }
        if config.minimum_threshold > config.initial_threshold {
            return Err(Error::ThresholdOrder {
                initial: config.initial_threshold,
                minimum: config.minimum_threshold,
            });
        }
        let level_scales = (0..config.levels)
            .map(|level| config.scale_factor.powi(level as i32))
            .collect();
        let level_features = distribute::features_per_level(
            config.max_features,
            config.scale_factor,
            config.levels,
        );
        debug!("Feature budget per level: {:?}", level_features);
        Ok(Self {
            config,
            level_scales,
            level_features,
            circle_limits: orientation::circle_limits(),
        })
    }

    /// Convenience constructor for the very common case that only the
    /// feature budget differs from the defaults.
    pub fn with_max_features(max_features: usize) -> Result<Self, Error> {
        Self::new(OrbConfig {
            max_features,
            ..OrbConfig::default()
        })
    }

    pub fn config(&self) -> &OrbConfig {
        &self.config
    }

    /// Detect keypoints and compute their descriptors.
    ///
    /// # Arguments
    /// * `image` - The grayscale input image, never mutated.
    /// * `mask` - Optional exclusion mask with the same dimensions as
    ///   `image`; keypoints whose rounded position lands on a zero mask
    ///   pixel are dropped.
    /// * `lapping_area` - Optional `(lx, ly)` border near the image origin;
    ///   keypoints with `x <= lx` or `y <= ly` are dropped. Used to avoid
    ///   duplicate detections in the strip where two camera views overlap.
    ///
    /// # Return value
    /// The keypoints in level-major order and their descriptors, index for
    /// index. When nothing survives, both vectors are empty. Repeated calls
    /// on identical input produce identical output.
    pub fn detect_and_compute(
        &self,
        image: &GrayByteImage,
        mask: Option<&GrayByteImage>,
        lapping_area: Option<(f32, f32)>,
    ) -> Result<(Vec<KeyPoint>, Vec<Descriptor>), Error> {
        if image.width() == 0 || image.height() == 0 {
            return Err(Error::EmptyImage);
        }
        if let Some(mask) = mask {
            if mask.width() != image.width() || mask.height() != image.height() {
                return Err(Error::MaskDimensionMismatch {
                    width: image.width(),
                    height: image.height(),
                    mask_width: mask.width(),
                    mask_height: mask.height(),
                });
            }
        }
        let pyramid = self.build_pyramid(image);
        trace!("Detecting keypoints per level.");
        let work: Vec<(&PyramidLevel, usize)> = pyramid
            .iter()
            .zip(self.level_features.iter().copied())
            .collect();
        let process = |(level, quota): (&PyramidLevel, usize)| {
            self.process_level(level, quota, mask, lapping_area)
        };
        // Levels are independent; the merge below is in level order, so
        // the output does not depend on execution order.
        #[cfg(not(feature = "rayon"))]
        let per_level: Vec<_> = work.into_iter().map(process).collect();
        #[cfg(feature = "rayon")]
        let per_level: Vec<_> = work.into_par_iter().map(process).collect();
        let mut keypoints = Vec::new();
        let mut descriptors = Vec::new();
        for (level_keypoints, level_descriptors) in per_level {
            keypoints.extend(level_keypoints);
            descriptors.extend(level_descriptors);
        }
        info!("Extracted {} features", keypoints.len());
        Ok((keypoints, descriptors))
    }

    /// Run detection, distribution, orientation, filtering, and descriptor
    /// sampling for one pyramid level.
    fn process_level(
        &self,
        level: &PyramidLevel,
        quota: usize,
        mask: Option<&GrayByteImage>,
        lapping_area: Option<(f32, f32)>,
    ) -> (Vec<KeyPoint>, Vec<Descriptor>) {
        let corners = fast::detect(
            level,
            self.config.initial_threshold,
            self.config.minimum_threshold,
        );
        let corners =
            distribute::distribute_quadtree(corners, level.width(), level.height(), quota);
        let mut keypoints = Vec::with_capacity(corners.len());
        let mut descriptors = Vec::with_capacity(corners.len());
        for corner in corners {
            let angle = if self.config.orientation {
                orientation::intensity_centroid_angle(
                    level,
                    corner.x,
                    corner.y,
                    &self.circle_limits,
                )
            } else {
                -1.0
            };
            // Back to source-image coordinates.
            let x = corner.x as f32 * level.scale;
            let y = corner.y as f32 * level.scale;
            if let Some((lapping_x, lapping_y)) = lapping_area {
                if x <= lapping_x || y <= lapping_y {
                    continue;
                }
            }
            if let Some(mask) = mask {
                let mask_x = (x.round() as usize).min(mask.width() - 1);
                let mask_y = (y.round() as usize).min(mask.height() - 1);
                if mask.get(mask_x, mask_y) == 0 {
                    continue;
                }
            }
            descriptors.push(descriptors::brief_descriptor(
                level, corner.x, corner.y, angle,
            ));
            keypoints.push(KeyPoint {
                point: (x, y),
                response: corner.response,
                size: PATCH_SIZE as f32 * level.scale,
                octave: level.octave,
                angle,
            });
        }
        trace!("Level {}: kept {} keypoints", level.octave, keypoints.len());
        (keypoints, descriptors)
    }

    /// Extract features from an image in any of the image crate's formats.
    ///
    /// This performs all operations end-to-end with no mask and no lapping
    /// area. The individual stages are available through
    /// [`detect_and_compute`](Self::detect_and_compute) when those inputs
    /// matter.
    ///
    /// # Example
    /// ```no_run
    /// let orb = orb::Orb::default();
    /// let (keypoints, descriptors) = orb
    ///     .extract(&image::open("res/0000000000.png").unwrap())
    ///     .unwrap();
    /// assert_eq!(keypoints.len(), descriptors.len());
    /// ```
    pub fn extract(
        &self,
        image: &DynamicImage,
    ) -> Result<(Vec<KeyPoint>, Vec<Descriptor>), Error> {
        self.detect_and_compute(&GrayByteImage::from_dynamic(image), None, None)
    }

    /// Extract features from an image on disk, as [`extract`](Self::extract).
    pub fn extract_path(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<(Vec<KeyPoint>, Vec<Descriptor>), Error> {
        self.extract(&::image::open(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_configuration_is_valid() {
        let orb = Orb::default();
        assert_eq!(orb.config().max_features, 1000);
        assert_eq!(orb.config().levels, 8);
        assert_eq!(orb.level_scales.len(), 8);
        assert_eq!(orb.level_features.iter().sum::<usize>(), 1000);
        assert!((orb.level_scales[1] - 1.2).abs() < 1e-6);
    }

    #[test]
    fn rejects_zero_feature_budget() {
        let result = Orb::new(OrbConfig {
            max_features: 0,
            ..OrbConfig::default()
        });
        assert!(matches!(result, Err(Error::InvalidFeatureCount)));
    }

    #[test]
    fn rejects_non_expanding_scale_factor() {
        for scale_factor in [1.0, 0.5, f32::NAN, f32::INFINITY] {
            let result = Orb::new(OrbConfig {
                scale_factor,
                ..OrbConfig::default()
            });
            assert!(matches!(result, Err(Error::InvalidScaleFactor(_))));
        }
    }

    #[test]
    fn rejects_zero_levels() {
        let result = Orb::new(OrbConfig {
            levels: 0,
            ..OrbConfig::default()
        });
        assert!(matches!(result, Err(Error::InvalidLevelCount)));
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let result = Orb::new(OrbConfig {
            initial_threshold: 7,
            minimum_threshold: 20,
            ..OrbConfig::default()
        });
        assert!(matches!(
            result,
            Err(Error::ThresholdOrder {
                initial: 7,
                minimum: 20
            })
        ));
    }

    #[test]
    fn rejects_empty_image() {
        let orb = Orb::default();
        let empty = GrayByteImage::new(0, 0);
        assert!(matches!(
            orb.detect_and_compute(&empty, None, None),
            Err(Error::EmptyImage)
        ));
    }

    #[test]
    fn rejects_mismatched_mask() {
        let orb = Orb::default();
        let image = GrayByteImage::new(64, 64);
        let mask = GrayByteImage::new(32, 64);
        assert!(matches!(
            orb.detect_and_compute(&image, Some(&mask), None),
            Err(Error::MaskDimensionMismatch { .. })
        ));
    }

    #[test]
    fn keypoints_expose_image_points() {
        let keypoint = KeyPoint {
            point: (4.5, 9.0),
            response: 1.0,
            size: 31.0,
            octave: 0,
            angle: 0.0,
        };
        let point = keypoint.image_point();
        assert_eq!(point.x, 4.5);
        assert_eq!(point.y, 9.0);
    }
}
