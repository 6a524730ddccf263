use derive_more::{Deref, DerefMut};
use image::{imageops, DynamicImage, ImageBuffer, Luma};
use log::*;
use ndarray::{s, ArrayView2, ArrayViewMut2};
use nshare::{MutNdarray2, RefNdarray2};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

type GrayImageBuffer = ImageBuffer<Luma<u8>, Vec<u8>>;

/// Resampling policy applied when scaling pyramid levels.
///
/// These mirror the standard image-resize policies. `Area` averages the
/// source box that maps onto each destination pixel and is implemented in
/// this crate; the remaining policies delegate to the image crate's
/// resampling filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Interpolation {
    Nearest,
    Linear,
    Area,
    Cubic,
    Lanczos,
}

/// The image type we use in this library.
///
/// ORB operates on raw 8-bit intensities: the FAST segment test and the
/// BRIEF comparisons are both defined directly on `u8` samples, so unlike
/// detectors that need a floating-point scale space there is no reason to
/// leave the image crate's native `Luma<u8>` storage. This is a thin
/// wrapper so that we can attach the resampling and filtering operations
/// the pyramid needs, and so the rest of the crate works in `usize`
/// coordinates.
///
/// We continue to use the image crate for loading and saving images, and
/// ndarray views (through nshare) for the slicing the border assembly and
/// area resampling want.
#[derive(Debug, Clone, Deref, DerefMut)]
pub struct GrayByteImage(pub GrayImageBuffer);

impl GrayByteImage {
    /// Create an 8-bit grayscale image from the image crate's DynamicImage
    /// type, converting color and depth as needed.
    pub fn from_dynamic(input_image: &DynamicImage) -> Self {
        let gray = input_image.to_luma8();
        info!("Loaded a {} x {} image", gray.width(), gray.height());
        Self(gray)
    }

    pub fn new(width: usize, height: usize) -> Self {
        Self(ImageBuffer::from_pixel(
            width as u32,
            height as u32,
            Luma([0u8]),
        ))
    }

    pub fn from_raw(width: usize, height: usize, data: Vec<u8>) -> Option<Self> {
        ImageBuffer::from_raw(width as u32, height as u32, data).map(Self)
    }

    pub fn ref_array2(&self) -> ArrayView2<u8> {
        self.0.ref_ndarray2()
    }

    pub fn mut_array2(&mut self) -> ArrayViewMut2<u8> {
        self.0.mut_ndarray2()
    }

    pub fn width(&self) -> usize {
        self.0.width() as usize
    }

    pub fn height(&self) -> usize {
        self.0.height() as usize
    }

    pub fn get(&self, x: usize, y: usize) -> u8 {
        self.get_pixel(x as u32, y as u32)[0]
    }

    pub fn put(&mut self, x: usize, y: usize, pixel_value: u8) {
        self.put_pixel(x as u32, y as u32, Luma([pixel_value]));
    }

    /// Resample to `width` x `height` under the given policy.
    pub fn resize(&self, width: usize, height: usize, interpolation: Interpolation) -> Self {
        let filter = match interpolation {
            Interpolation::Nearest => imageops::FilterType::Nearest,
            Interpolation::Linear => imageops::FilterType::Triangle,
            Interpolation::Cubic => imageops::FilterType::CatmullRom,
            Interpolation::Lanczos => imageops::FilterType::Lanczos3,
            Interpolation::Area => return self.area_resample(width, height),
        };
        Self(imageops::resize(
            &self.0,
            width as u32,
            height as u32,
            filter,
        ))
    }

    /// Box-average resampling: each output pixel is the mean of the source
    /// rectangle it maps onto, with fractional coverage weights at the
    /// rectangle edges.
    fn area_resample(&self, width: usize, height: usize) -> Self {
        assert!(width > 0 && height > 0, "resample target must be nonzero");
        let src = self.ref_array2();
        let (src_h, src_w) = (self.height(), self.width());
        let sx = src_w as f32 / width as f32;
        let sy = src_h as f32 / height as f32;
        let mut data = vec![0u8; width * height];
        for (y, row) in data.chunks_exact_mut(width).enumerate() {
            let y0 = y as f32 * sy;
            let y1 = (y0 + sy).min(src_h as f32);
            for (x, out) in row.iter_mut().enumerate() {
                let x0 = x as f32 * sx;
                let x1 = (x0 + sx).min(src_w as f32);
                let mut sum = 0f32;
                for r in (y0 as usize)..(y1.ceil() as usize).min(src_h) {
                    let wy = (y1.min((r + 1) as f32) - y0.max(r as f32)).max(0.0);
                    for c in (x0 as usize)..(x1.ceil() as usize).min(src_w) {
                        let wx = (x1.min((c + 1) as f32) - x0.max(c as f32)).max(0.0);
                        sum += f32::from(src[[r, c]]) * wx * wy;
                    }
                }
                let area = (y1 - y0) * (x1 - x0);
                *out = (sum / area).round().clamp(0.0, 255.0) as u8;
            }
        }
        Self::from_raw(width, height, data)
            .expect("resampled buffer has exactly width * height pixels")
    }

    /// Extend the image by `border` pixels on every side, replicating the
    /// edge rows and columns into the new margin.
    pub fn with_replicated_border(&self, border: usize) -> Self {
        let (w, h) = (self.width(), self.height());
        let b = border as isize;
        let mut out = Self::new(w + 2 * border, h + 2 * border);
        out.mut_array2()
            .slice_mut(s![b..b + h as isize, b..b + w as isize])
            .assign(&self.ref_array2());
        let (out_w, out_h) = (out.width(), out.height());
        let mut view = out.mut_array2();
        // Replicate left/right columns across each interior row, then
        // replicate whole rows into the top and bottom margins.
        for y in 0..h {
            let left = view[[y + border, border]];
            let right = view[[y + border, border + w - 1]];
            view.slice_mut(s![(y + border) as isize, ..b]).fill(left);
            view.slice_mut(s![(y + border) as isize, (border + w) as isize..])
                .fill(right);
        }
        for y in 0..border {
            for x in 0..out_w {
                view[[y, x]] = view[[border, x]];
                view[[out_h - 1 - y, x]] = view[[border + h - 1, x]];
            }
        }
        debug!("Extended {}x{} image with a {} pixel border", w, h, border);
        out
    }
}

/// Convolve each row with `kernel`, replicating edge pixels and rounding
/// the result back to `u8`.
pub fn horizontal_filter(image: &GrayImageBuffer, kernel: &[f32]) -> GrayImageBuffer {
    debug_assert!(kernel.len() % 2 == 1);
    let half = (kernel.len() / 2) as isize;
    let width = image.width() as usize;
    let height = image.height() as usize;
    let mut output = vec![0u8; width * height];
    let row_in_it = image.as_raw().chunks_exact(width);
    let row_out_it = output.chunks_exact_mut(width);
    for (row_in, row_out) in row_in_it.zip(row_out_it) {
        for (x, out) in row_out.iter_mut().enumerate() {
            let mut acc = 0f32;
            for (k, &weight) in kernel.iter().enumerate() {
                let sx = (x as isize + k as isize - half).clamp(0, width as isize - 1);
                acc += f32::from(row_in[sx as usize]) * weight;
            }
            *out = acc.round().clamp(0.0, 255.0) as u8;
        }
    }
    GrayImageBuffer::from_raw(width as u32, height as u32, output)
        .expect("filtered buffer has exactly width * height pixels")
}

/// Convolve each column with `kernel`, replicating edge pixels and
/// rounding the result back to `u8`.
pub fn vertical_filter(image: &GrayImageBuffer, kernel: &[f32]) -> GrayImageBuffer {
    debug_assert!(kernel.len() % 2 == 1);
    let half = (kernel.len() / 2) as isize;
    let width = image.width() as usize;
    let height = image.height() as usize;
    let mut output = vec![0u8; width * height];
    let input = image.as_raw();
    for y in 0..height {
        for x in 0..width {
            let mut acc = 0f32;
            for (k, &weight) in kernel.iter().enumerate() {
                let sy = (y as isize + k as isize - half).clamp(0, height as isize - 1);
                acc += f32::from(input[sy as usize * width + x]) * weight;
            }
            output[y * width + x] = acc.round().clamp(0.0, 255.0) as u8;
        }
    }
    GrayImageBuffer::from_raw(width as u32, height as u32, output)
        .expect("filtered buffer has exactly width * height pixels")
}

pub fn separable_filter(
    image: &GrayImageBuffer,
    h_kernel: &[f32],
    v_kernel: &[f32],
) -> GrayImageBuffer {
    let h = horizontal_filter(image, h_kernel);
    vertical_filter(&h, v_kernel)
}

/// The Gaussian function.
///
/// # Arguments
/// * `x` - the offset.
/// * `r` - sigma.
/// # Return value
/// The kernel value at x.
fn gaussian(x: f32, r: f32) -> f32 {
    ((2.0 * std::f32::consts::PI).sqrt() * r).recip() * (-x.powi(2) / (2.0 * r.powi(2))).exp()
}

/// Generate a normalized Gaussian kernel.
///
/// # Arguments
/// * `r` - sigma.
/// * `kernel_size` - The size of the kernel.
/// # Return value
/// The kernel (a vector).
pub fn gaussian_kernel(r: f32, kernel_size: usize) -> Vec<f32> {
    assert!(kernel_size % 2 == 1, "kernel_size must be odd");
    let mut kernel = vec![0f32; kernel_size];
    let half_width = (kernel_size / 2) as i32;
    let mut sum = 0f32;
    for i in -half_width..=half_width {
        let val = gaussian(i as f32, r);
        kernel[(i + half_width) as usize] = val;
        sum += val;
    }
    for val in kernel.iter_mut() {
        *val /= sum;
    }
    kernel
}

/// Perform Gaussian smoothing on an 8-bit image.
///
/// # Arguments
/// * `r` - sigma.
/// * `kernel_size` - The size of the kernel.
/// # Return value
/// The resulting image after the filter was applied.
pub fn gaussian_blur(image: &GrayByteImage, r: f32, kernel_size: usize) -> GrayByteImage {
    assert!(r > 0.0, "sigma must be > 0.0");
    let kernel = gaussian_kernel(r, kernel_size);
    GrayByteImage(separable_filter(&image.0, &kernel, &kernel))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkerboard(width: usize, height: usize, cell: usize) -> GrayByteImage {
        let mut image = GrayByteImage::new(width, height);
        for y in 0..height {
            for x in 0..width {
                if (x / cell + y / cell) % 2 == 0 {
                    image.put(x, y, 200);
                } else {
                    image.put(x, y, 40);
                }
            }
        }
        image
    }

    #[test]
    fn gaussian_kernel_normalized_and_symmetric() {
        let kernel = gaussian_kernel(2.0, 7);
        let sum: f32 = kernel.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        for i in 0..kernel.len() / 2 {
            assert!((kernel[i] - kernel[kernel.len() - 1 - i]).abs() < 1e-6);
        }
        // Center tap dominates.
        assert!(kernel[3] > kernel[2] && kernel[2] > kernel[1] && kernel[1] > kernel[0]);
    }

    #[test]
    fn filters_match_imageproc() {
        let image = checkerboard(64, 48, 5);
        let kernel = gaussian_kernel(2.0, 7);
        let ours = horizontal_filter(&image.0, &kernel);
        let reference = imageproc::filter::horizontal_filter(&image.0, &kernel);
        imageproc::assert_pixels_eq_within!(ours, reference, 1);
        let ours = vertical_filter(&image.0, &kernel);
        let reference = imageproc::filter::vertical_filter(&image.0, &kernel);
        imageproc::assert_pixels_eq_within!(ours, reference, 1);
    }

    #[test]
    fn blur_preserves_uniform_image() {
        let image = GrayByteImage::from_raw(20, 20, vec![131; 400]).unwrap();
        let blurred = gaussian_blur(&image, 2.0, 7);
        assert!(blurred.0.as_raw().iter().all(|&p| p == 131));
    }

    #[test]
    fn area_resample_preserves_uniform_image() {
        let image = GrayByteImage::from_raw(30, 24, vec![77; 30 * 24]).unwrap();
        let small = image.resize(25, 20, Interpolation::Area);
        assert_eq!(small.width(), 25);
        assert_eq!(small.height(), 20);
        assert!(small.0.as_raw().iter().all(|&p| p == 77));
    }

    #[test]
    fn area_resample_halves_checkerboard_to_midtone() {
        // A 1-pixel checkerboard averaged 2:1 lands between the two tones.
        let image = checkerboard(16, 16, 1);
        let small = image.resize(8, 8, Interpolation::Area);
        assert!(small.0.as_raw().iter().all(|&p| p == 120));
    }

    #[test]
    fn replicated_border_extends_edges() {
        let mut image = GrayByteImage::new(4, 3);
        for y in 0..3 {
            for x in 0..4 {
                image.put(x, y, (10 * (y * 4 + x)) as u8);
            }
        }
        let bordered = image.with_replicated_border(2);
        assert_eq!(bordered.width(), 8);
        assert_eq!(bordered.height(), 7);
        // Interior is untouched.
        assert_eq!(bordered.get(2, 2), image.get(0, 0));
        assert_eq!(bordered.get(5, 4), image.get(3, 2));
        // Corners replicate the nearest source pixel.
        assert_eq!(bordered.get(0, 0), image.get(0, 0));
        assert_eq!(bordered.get(7, 6), image.get(3, 2));
        // Edge centers replicate the nearest edge.
        assert_eq!(bordered.get(0, 3), image.get(0, 1));
        assert_eq!(bordered.get(4, 0), image.get(2, 0));
    }
}
