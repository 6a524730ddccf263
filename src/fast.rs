use crate::pyramid::PyramidLevel;
use log::*;

/// A corner candidate in level-interior coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Corner {
    pub x: usize,
    pub y: usize,
    pub response: f32,
}

/// The Bresenham circle of radius 3 used by the segment test, clockwise
/// from twelve o'clock.
const RING: [(i32, i32); 16] = [
    (0, -3),
    (1, -3),
    (2, -2),
    (3, -1),
    (3, 0),
    (3, 1),
    (2, 2),
    (1, 3),
    (0, 3),
    (-1, 3),
    (-2, 2),
    (-3, 1),
    (-3, 0),
    (-3, -1),
    (-2, -2),
    (-1, -3),
];

/// Contiguous ring samples required to accept a corner (FAST-9).
const ARC_LENGTH: usize = 9;

/// Edge length of the detection tiles.
const CELL_SIZE: usize = 30;

/// Detect FAST corners across a pyramid level.
///
/// The level is covered with [`CELL_SIZE`] tiles. Each tile is first probed
/// at `initial_threshold`; only when that yields nothing is the tile probed
/// again at the relaxed `minimum_threshold`, so weakly textured regions
/// still contribute candidates without loosening detection everywhere.
/// Corners are kept only where their response is a 3x3 local maximum.
pub(crate) fn detect(
    level: &PyramidLevel,
    initial_threshold: u8,
    minimum_threshold: u8,
) -> Vec<Corner> {
    let (width, height) = (level.width(), level.height());
    let mut corners = Vec::new();
    for cell_y in (0..height).step_by(CELL_SIZE) {
        for cell_x in (0..width).step_by(CELL_SIZE) {
            let x1 = (cell_x + CELL_SIZE).min(width);
            let y1 = (cell_y + CELL_SIZE).min(height);
            let found = detect_cell(level, cell_x, cell_y, x1, y1, initial_threshold, &mut corners);
            if !found {
                detect_cell(
                    level,
                    cell_x,
                    cell_y,
                    x1,
                    y1,
                    minimum_threshold,
                    &mut corners,
                );
            }
        }
    }
    trace!(
        "Level {}: {} corners after cell detection",
        level.octave,
        corners.len()
    );
    corners
}

/// Run the segment test over one tile, pushing the corners that survive
/// local non-maximum suppression. Returns whether the tile produced any
/// raw detection at this threshold, before suppression.
fn detect_cell(
    level: &PyramidLevel,
    x0: usize,
    y0: usize,
    x1: usize,
    y1: usize,
    threshold: u8,
    out: &mut Vec<Corner>,
) -> bool {
    // Score a one pixel apron around the tile as well, so suppression at
    // tile seams sees its neighbors.
    let gx0 = x0.saturating_sub(1);
    let gy0 = y0.saturating_sub(1);
    let gx1 = (x1 + 1).min(level.width());
    let gy1 = (y1 + 1).min(level.height());
    let (gw, gh) = (gx1 - gx0, gy1 - gy0);
    let mut scores = vec![0f32; gw * gh];
    let mut any = false;
    for y in gy0..gy1 {
        for x in gx0..gx1 {
            if let Some(response) = corner_response(level, x, y, threshold) {
                scores[(y - gy0) * gw + (x - gx0)] = response;
                if x >= x0 && x < x1 && y >= y0 && y < y1 {
                    any = true;
                }
            }
        }
    }
    if !any {
        return false;
    }
    for y in y0..y1 {
        for x in x0..x1 {
            let score = scores[(y - gy0) * gw + (x - gx0)];
            if score <= 0.0 {
                continue;
            }
            if is_local_maximum(&scores, gw, gh, x - gx0, y - gy0, score) {
                out.push(Corner {
                    x,
                    y,
                    response: score,
                });
            }
        }
    }
    true
}

/// 3x3 local maximum test over the score grid. Ties are broken in raster
/// order so that exactly one pixel of a flat plateau survives.
fn is_local_maximum(scores: &[f32], gw: usize, gh: usize, x: usize, y: usize, score: f32) -> bool {
    for dy in -1i32..=1 {
        for dx in -1i32..=1 {
            if dx == 0 && dy == 0 {
                continue;
            }
            let nx = x as i32 + dx;
            let ny = y as i32 + dy;
            if nx < 0 || ny < 0 || nx >= gw as i32 || ny >= gh as i32 {
                continue;
            }
            let neighbor = scores[ny as usize * gw + nx as usize];
            let earlier = dy < 0 || (dy == 0 && dx < 0);
            if neighbor > score || (neighbor == score && earlier) {
                return false;
            }
        }
    }
    true
}

/// The FAST-9 segment test. Returns the corner response, the summed
/// absolute contrast of the qualifying ring samples, or `None` when no
/// contiguous arc of [`ARC_LENGTH`] samples clears the threshold.
fn corner_response(level: &PyramidLevel, x: usize, y: usize, threshold: u8) -> Option<f32> {
    let center = level.get(x as i32, y as i32);
    let bright = center.saturating_add(threshold);
    let dark = center.saturating_sub(threshold);
    let mut states = [0i8; 16];
    let mut contrast = [0i32; 16];
    for (i, &(dx, dy)) in RING.iter().enumerate() {
        let sample = level.get(x as i32 + dx, y as i32 + dy);
        contrast[i] = (i32::from(sample) - i32::from(center)).abs();
        states[i] = if sample > bright {
            1
        } else if sample < dark {
            -1
        } else {
            0
        };
    }
    for sign in [1i8, -1] {
        if has_arc(&states, sign) {
            let response: i32 = states
                .iter()
                .zip(&contrast)
                .filter(|&(&state, _)| state == sign)
                .map(|(_, &c)| c)
                .sum();
            return Some(response as f32);
        }
    }
    None
}

/// Whether the ring contains a contiguous (circularly wrapping) arc of at
/// least [`ARC_LENGTH`] samples in `sign` state.
fn has_arc(states: &[i8; 16], sign: i8) -> bool {
    let mut run = 0;
    for i in 0..(16 + ARC_LENGTH - 1) {
        if states[i % 16] == sign {
            run += 1;
            if run >= ARC_LENGTH {
                return true;
            }
        } else {
            run = 0;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::GrayByteImage;
    use crate::pyramid::LEVEL_BORDER;

    fn level_from(image: GrayByteImage) -> PyramidLevel {
        let bordered = image.with_replicated_border(LEVEL_BORDER);
        PyramidLevel {
            octave: 0,
            scale: 1.0,
            blurred: bordered.clone(),
            bordered,
        }
    }

    fn bright_square(width: usize, height: usize, x0: usize, y0: usize, side: usize) -> GrayByteImage {
        let mut image = GrayByteImage::from_raw(width, height, vec![50; width * height]).unwrap();
        for y in y0..y0 + side {
            for x in x0..x0 + side {
                image.put(x, y, 200);
            }
        }
        image
    }

    #[test]
    fn ring_is_a_radius_three_circle() {
        let mut seen = std::collections::HashSet::new();
        for &(dx, dy) in RING.iter() {
            let d2 = dx * dx + dy * dy;
            assert!((8..=10).contains(&d2), "({}, {}) is off the circle", dx, dy);
            assert!(seen.insert((dx, dy)));
            // The ring is symmetric under negation.
            assert!(RING.contains(&(-dx, -dy)));
        }
        assert_eq!(seen.len(), 16);
    }

    #[test]
    fn uniform_level_has_no_corners() {
        let level = level_from(GrayByteImage::from_raw(64, 64, vec![128; 64 * 64]).unwrap());
        assert!(detect(&level, 20, 7).is_empty());
    }

    #[test]
    fn detects_square_corners() {
        let level = level_from(bright_square(64, 64, 28, 28, 8));
        let corners = detect(&level, 20, 7);
        assert!(!corners.is_empty());
        // Every detection sits near the square's boundary.
        for corner in &corners {
            let near_x = corner.x >= 25 && corner.x <= 38;
            let near_y = corner.y >= 25 && corner.y <= 38;
            assert!(near_x && near_y, "stray corner at ({}, {})", corner.x, corner.y);
        }
    }

    #[test]
    fn relaxed_threshold_rescues_weak_cells() {
        let mut image = GrayByteImage::from_raw(40, 40, vec![100; 1600]).unwrap();
        for y in 18..24 {
            for x in 18..24 {
                image.put(x, y, 112);
            }
        }
        let level = level_from(image);
        // Contrast 12 clears neither 20 nor a relaxed 15.
        assert!(detect(&level, 20, 15).is_empty());
        // The fallback threshold picks the weak corner up.
        assert!(!detect(&level, 20, 7).is_empty());
    }

    #[test]
    fn suppression_keeps_isolated_maxima() {
        let level = level_from(bright_square(64, 64, 20, 20, 12));
        let corners = detect(&level, 20, 7);
        for (i, a) in corners.iter().enumerate() {
            for b in corners.iter().skip(i + 1) {
                let adjacent = (a.x as i32 - b.x as i32).abs() <= 1
                    && (a.y as i32 - b.y as i32).abs() <= 1;
                assert!(!adjacent, "adjacent corners survived suppression");
            }
        }
    }
}
