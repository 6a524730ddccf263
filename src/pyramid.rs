use crate::image::{gaussian_blur, GrayByteImage};
use crate::Orb;
use log::*;

#[cfg(feature = "rayon")]
use rayon::prelude::*;

/// Margin in pixels kept around every pyramid level. The orientation patch
/// reads up to 15 pixels from a keypoint and a rotated descriptor sample
/// reaches at most `round(13 * sqrt(2)) = 18` pixels, so 19 replicated
/// pixels guarantee every sample lands on valid data.
pub const LEVEL_BORDER: usize = 19;

/// Diameter of the descriptor measurement patch at level zero. A keypoint's
/// reported size is this diameter scaled by its level.
pub const PATCH_SIZE: usize = 31;

/// Sigma of the smoothing pass applied before descriptor sampling.
const DESCRIPTOR_SIGMA: f32 = 2.0;
const DESCRIPTOR_KERNEL_SIZE: usize = 7;

/// One level of the scale pyramid.
#[derive(Debug)]
pub struct PyramidLevel {
    /// Pyramid level index, zero for the source resolution.
    pub octave: usize,
    /// Accumulated scale relative to the source image (`scale_factor ^ octave`).
    pub scale: f32,
    /// The resampled level extended with [`LEVEL_BORDER`] replicated pixels
    /// on every side.
    pub bordered: GrayByteImage,
    /// Smoothed copy of `bordered`, sampled by the descriptor comparisons.
    pub blurred: GrayByteImage,
}

impl PyramidLevel {
    /// Width of the level interior, excluding the border.
    pub fn width(&self) -> usize {
        self.bordered.width() - 2 * LEVEL_BORDER
    }

    /// Height of the level interior, excluding the border.
    pub fn height(&self) -> usize {
        self.bordered.height() - 2 * LEVEL_BORDER
    }

    /// Sample the level at interior coordinates. Coordinates may reach up to
    /// [`LEVEL_BORDER`] pixels outside the interior.
    #[inline]
    pub fn get(&self, x: i32, y: i32) -> u8 {
        self.bordered.get(
            (x + LEVEL_BORDER as i32) as usize,
            (y + LEVEL_BORDER as i32) as usize,
        )
    }

    /// Sample the smoothed level at interior coordinates, with the same
    /// range contract as [`get`](Self::get).
    #[inline]
    pub fn get_blurred(&self, x: i32, y: i32) -> u8 {
        self.blurred.get(
            (x + LEVEL_BORDER as i32) as usize,
            (y + LEVEL_BORDER as i32) as usize,
        )
    }
}

impl Orb {
    /// Build the scale pyramid for an input image.
    ///
    /// Each level is resampled from the previous one under the configured
    /// interpolation policy, so that level `i` is `1 / scale_factor^i` the
    /// source size, then extended with a replicated border and smoothed for
    /// descriptor sampling.
    pub(crate) fn build_pyramid(&self, image: &GrayByteImage) -> Vec<PyramidLevel> {
        let mut resampled = Vec::with_capacity(self.level_scales.len());
        let mut current = image.clone();
        for (octave, &scale) in self.level_scales.iter().enumerate() {
            if octave > 0 {
                let width = ((image.width() as f32 / scale).round() as usize).max(1);
                let height = ((image.height() as f32 / scale).round() as usize).max(1);
                current = current.resize(width, height, self.config.interpolation);
            }
            trace!(
                "Level {}: {}x{} at scale {}",
                octave,
                current.width(),
                current.height(),
                scale
            );
            resampled.push((octave, scale, current.with_replicated_border(LEVEL_BORDER)));
        }

        let finish = |(octave, scale, bordered): (usize, f32, GrayByteImage)| {
            let blurred = gaussian_blur(&bordered, DESCRIPTOR_SIGMA, DESCRIPTOR_KERNEL_SIZE);
            PyramidLevel {
                octave,
                scale,
                bordered,
                blurred,
            }
        };
        #[cfg(not(feature = "rayon"))]
        let levels: Vec<PyramidLevel> = resampled.into_iter().map(finish).collect();
        #[cfg(feature = "rayon")]
        let levels: Vec<PyramidLevel> = resampled.into_par_iter().map(finish).collect();
        debug!("Built a {} level pyramid", levels.len());
        levels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OrbConfig;

    #[test]
    fn pyramid_shrinks_geometrically() {
        let orb = Orb::new(OrbConfig {
            levels: 4,
            ..OrbConfig::default()
        })
        .unwrap();
        let image = GrayByteImage::new(120, 90);
        let pyramid = orb.build_pyramid(&image);
        assert_eq!(pyramid.len(), 4);
        assert_eq!(pyramid[0].width(), 120);
        assert_eq!(pyramid[0].height(), 90);
        for (octave, level) in pyramid.iter().enumerate() {
            assert_eq!(level.octave, octave);
            let expected = 1.2f32.powi(octave as i32);
            assert!((level.scale - expected).abs() < 1e-5);
            assert_eq!(
                level.width(),
                ((120.0 / expected).round() as usize).max(1)
            );
            assert_eq!(level.bordered.width(), level.width() + 2 * LEVEL_BORDER);
        }
    }

    #[test]
    fn border_samples_replicate_edges() {
        let mut image = GrayByteImage::new(40, 30);
        image.put(0, 0, 250);
        let orb = Orb::new(OrbConfig {
            levels: 1,
            ..OrbConfig::default()
        })
        .unwrap();
        let pyramid = orb.build_pyramid(&image);
        let level = &pyramid[0];
        assert_eq!(level.get(0, 0), 250);
        // Reads into the replicated margin return the nearest edge pixel.
        assert_eq!(level.get(-5, 0), 250);
        assert_eq!(level.get(0, -19), 250);
        assert_eq!(level.get(39, 29), image.get(39, 29));
    }

    #[test]
    fn uniform_levels_stay_uniform_after_blur() {
        let image = GrayByteImage::from_raw(50, 50, vec![99; 2500]).unwrap();
        let orb = Orb::new(OrbConfig {
            levels: 3,
            ..OrbConfig::default()
        })
        .unwrap();
        for level in orb.build_pyramid(&image) {
            assert!(level.blurred.0.as_raw().iter().all(|&p| p == 99));
        }
    }
}
