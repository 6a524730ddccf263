use crate::pyramid::PyramidLevel;

/// Radius of the circular patch the intensity centroid integrates over, in
/// level pixels.
pub(crate) const HALF_PATCH_SIZE: i32 = 15;

/// Per-row half-widths of the circular patch, indexed by the row's distance
/// from the patch center. Row `v` spans columns `-limits[v]..=limits[v]`.
///
/// The upper arc is taken from the circle equation and the lower arc is
/// mirrored from it, so the patch is exactly symmetric and the centroid of
/// a uniform patch is exactly zero.
pub(crate) fn circle_limits() -> Vec<i32> {
    let radius = HALF_PATCH_SIZE;
    let mut limits = vec![0i32; radius as usize + 1];
    let vmax = (radius as f32 * std::f32::consts::FRAC_1_SQRT_2).floor() as i32 + 1;
    let vmin = (radius as f32 * std::f32::consts::FRAC_1_SQRT_2).ceil() as i32;
    let r2 = (radius * radius) as f32;
    for v in 0..=vmax {
        limits[v as usize] = (r2 - (v * v) as f32).sqrt().round() as i32;
    }
    let mut v0 = 0usize;
    for v in (vmin..=radius).rev() {
        while limits[v0] == limits[v0 + 1] {
            v0 += 1;
        }
        limits[v as usize] = v0 as i32;
        v0 += 1;
    }
    limits
}

/// The intensity-centroid orientation of a patch: the angle of the vector
/// from the patch center to the centroid of its intensities, in degrees in
/// `[0, 360)`.
///
/// The first image moments are accumulated over the circular patch, row
/// pairs `+v`/`-v` together so the vertical moment follows directly from
/// their difference.
pub(crate) fn intensity_centroid_angle(
    level: &PyramidLevel,
    x: usize,
    y: usize,
    limits: &[i32],
) -> f32 {
    let (cx, cy) = (x as i32, y as i32);
    let mut m_10 = 0i64;
    let mut m_01 = 0i64;
    for u in -HALF_PATCH_SIZE..=HALF_PATCH_SIZE {
        m_10 += i64::from(u) * i64::from(level.get(cx + u, cy));
    }
    for v in 1..=HALF_PATCH_SIZE {
        let mut row_sum = 0i64;
        let d = limits[v as usize];
        for u in -d..=d {
            let below = i64::from(level.get(cx + u, cy + v));
            let above = i64::from(level.get(cx + u, cy - v));
            row_sum += below - above;
            m_10 += i64::from(u) * (below + above);
        }
        m_01 += i64::from(v) * row_sum;
    }
    let mut angle = (m_01 as f32).atan2(m_10 as f32).to_degrees();
    if angle < 0.0 {
        angle += 360.0;
    }
    // A tiny negative input can round up to exactly 360 degrees.
    if angle >= 360.0 {
        angle = 0.0;
    }
    angle
}
