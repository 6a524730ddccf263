use crate::fast::Corner;
use float_ord::FloatOrd;
use log::*;
use std::cmp::Reverse;

/// Smallest per-level share of the feature budget. Coarse levels cover
/// little area but represent the largest real-world scales, so they are
/// never starved entirely; the final level absorbs whatever budget the
/// floors leave over.
const MIN_LEVEL_FEATURES: usize = 5;

/// Split the total feature budget across pyramid levels proportionally to
/// level area (a geometric series in `1 / scale_factor^2`). Every level but
/// the last receives at least [`MIN_LEVEL_FEATURES`]; the last level takes
/// the remainder.
pub(crate) fn features_per_level(
    max_features: usize,
    scale_factor: f32,
    levels: usize,
) -> Vec<usize> {
    if levels == 1 {
        return vec![max_features];
    }
    let ratio = f64::from(1.0 / (scale_factor * scale_factor));
    let first =
        max_features as f64 * (1.0 - ratio) / (1.0 - ratio.powi(levels as i32));
    let mut out = Vec::with_capacity(levels);
    let mut assigned = 0usize;
    let mut share = first;
    for _ in 0..levels - 1 {
        let count = (share.round() as usize).max(MIN_LEVEL_FEATURES);
        out.push(count);
        assigned += count;
        share *= ratio;
    }
    out.push(max_features.saturating_sub(assigned));
    out
}

/// One quad-tree region and the corner candidates inside it.
#[derive(Debug)]
struct Node {
    x0: f32,
    y0: f32,
    x1: f32,
    y1: f32,
    corners: Vec<Corner>,
}

impl Node {
    /// A node narrower than a pixel in both directions cannot separate its
    /// candidates any further.
    fn divisible(&self) -> bool {
        self.x1 - self.x0 > 1.0 || self.y1 - self.y0 > 1.0
    }

    /// Divide into the nonempty quadrants.
    fn split(self) -> impl Iterator<Item = Node> {
        let cx = 0.5 * (self.x0 + self.x1);
        let cy = 0.5 * (self.y0 + self.y1);
        let mut quadrants = [
            Node {
                x0: self.x0,
                y0: self.y0,
                x1: cx,
                y1: cy,
                corners: Vec::new(),
            },
            Node {
                x0: cx,
                y0: self.y0,
                x1: self.x1,
                y1: cy,
                corners: Vec::new(),
            },
            Node {
                x0: self.x0,
                y0: cy,
                x1: cx,
                y1: self.y1,
                corners: Vec::new(),
            },
            Node {
                x0: cx,
                y0: cy,
                x1: self.x1,
                y1: self.y1,
                corners: Vec::new(),
            },
        ];
        for corner in self.corners {
            let right = corner.x as f32 >= cx;
            let bottom = corner.y as f32 >= cy;
            quadrants[usize::from(right) + 2 * usize::from(bottom)]
                .corners
                .push(corner);
        }
        quadrants.into_iter().filter(|q| !q.corners.is_empty())
    }
}

/// Reduce `corners` to roughly `target` candidates with an even spatial
/// spread.
///
/// The detection region is subdivided breadth-first with an explicit node
/// list (no call recursion, so pathological corner distributions cannot
/// overflow the stack): any node holding more than one candidate splits
/// into its nonempty quadrants until there are about `target` nodes, then
/// the strongest candidate of each node is kept. Keeping one corner per
/// region is what guarantees coverage; simply taking the `target` highest
/// responses would crowd into the most textured part of the level.
pub(crate) fn distribute_quadtree(
    corners: Vec<Corner>,
    width: usize,
    height: usize,
    target: usize,
) -> Vec<Corner> {
    if target == 0 {
        return Vec::new();
    }
    if corners.len() <= target {
        return corners;
    }
    let raw = corners.len();

    // Seed with square-ish root nodes so aspect ratio does not skew the
    // subdivision.
    let roots = ((width as f32 / height as f32).round() as usize).max(1);
    let root_width = width as f32 / roots as f32;
    let mut nodes: Vec<Node> = (0..roots)
        .map(|i| Node {
            x0: i as f32 * root_width,
            y0: 0.0,
            x1: (i + 1) as f32 * root_width,
            y1: height as f32,
            corners: Vec::new(),
        })
        .collect();
    for corner in corners {
        let index = ((corner.x as f32 / root_width) as usize).min(roots - 1);
        nodes[index].corners.push(corner);
    }
    nodes.retain(|node| !node.corners.is_empty());

    loop {
        if nodes.len() >= target {
            break;
        }
        let divisible = nodes
            .iter()
            .filter(|node| node.corners.len() > 1 && node.divisible())
            .count();
        if divisible == 0 {
            break;
        }
        let before = nodes.len();
        if before + 3 * divisible > target {
            // One more full pass would overshoot: expand the densest nodes
            // first and stop as soon as the target is met. The sort is
            // stable, so equal-count nodes keep their order and the result
            // stays deterministic.
            nodes.sort_by_key(|node| Reverse(node.corners.len()));
        }
        let mut iter = nodes.into_iter();
        let mut next: Vec<Node> = Vec::with_capacity(before + 3 * divisible);
        while let Some(node) = iter.next() {
            let enough = next.len() + iter.len() + 1 >= target;
            if enough || node.corners.len() <= 1 || !node.divisible() {
                next.push(node);
            } else {
                next.extend(node.split());
            }
        }
        nodes = next;
        if nodes.len() == before {
            // Every remaining split collapsed into a single quadrant.
            break;
        }
    }

    let retained: Vec<Corner> = nodes
        .iter()
        .map(|node| {
            *node
                .corners
                .iter()
                .max_by_key(|corner| FloatOrd(corner.response))
                .expect("empty nodes are never kept")
        })
        .collect();
    debug!(
        "Quad-tree retained {} of {} corners (target {})",
        retained.len(),
        raw,
        target
    );
    retained
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corner(x: usize, y: usize, response: f32) -> Corner {
        Corner { x, y, response }
    }

    #[test]
    fn level_budget_is_area_proportional() {
        let budget = features_per_level(1000, 1.2, 8);
        assert_eq!(budget.len(), 8);
        assert_eq!(budget.iter().sum::<usize>(), 1000);
        // Shares shrink with level area.
        for pair in budget.windows(2) {
            assert!(pair[0] >= pair[1]);
        }
        // Finest level gets the largest share, coarsest still gets some.
        assert!(budget[0] > budget[7]);
        assert!(budget[7] > 0);
    }

    #[test]
    fn level_budget_floors_coarse_levels() {
        let budget = features_per_level(40, 2.0, 6);
        for &count in &budget[..5] {
            assert!(count >= 5);
        }
        assert_eq!(budget.len(), 6);
    }

    #[test]
    fn single_level_takes_everything() {
        assert_eq!(features_per_level(750, 1.2, 1), vec![750]);
    }

    #[test]
    fn under_target_is_passed_through() {
        let corners = vec![corner(5, 5, 1.0), corner(50, 50, 2.0)];
        let kept = distribute_quadtree(corners.clone(), 100, 100, 10);
        assert_eq!(kept, corners);
    }

    #[test]
    fn dense_cluster_does_not_crowd_out_sparse_regions() {
        // A dense, strong cluster in one corner plus one weak corner in
        // each remaining quadrant.
        let mut corners = Vec::new();
        for y in 0..8 {
            for x in 0..8 {
                corners.push(corner(10 + x, 10 + y, 100.0));
            }
        }
        corners.push(corner(80, 15, 1.0));
        corners.push(corner(15, 80, 1.0));
        corners.push(corner(85, 85, 1.0));
        let kept = distribute_quadtree(corners, 100, 100, 8);
        assert!(kept.len() >= 4);
        assert!(kept.iter().any(|c| c.x > 50 && c.y < 50));
        assert!(kept.iter().any(|c| c.x < 50 && c.y > 50));
        assert!(kept.iter().any(|c| c.x > 50 && c.y > 50));
        assert!(kept.iter().any(|c| c.x < 50 && c.y < 50));
    }

    #[test]
    fn keeps_the_strongest_candidate_per_region(){
        let corners = vec![
            corner(10, 10, 1.0),
            corner(11, 10, 9.0),
            corner(90, 90, 2.0),
        ];
        let kept = distribute_quadtree(corners, 100, 100, 2);
        assert!(kept.contains(&corner(11, 10, 9.0)));
        assert!(kept.contains(&corner(90, 90, 2.0)));
        assert!(!kept.contains(&corner(10, 10, 1.0)));
    }

    #[test]
    fn distribution_is_deterministic() {
        let corners: Vec<Corner> = (0..200)
            .map(|i| corner((i * 37) % 100, (i * 53) % 100, (i % 17) as f32))
            .collect();
        let a = distribute_quadtree(corners.clone(), 100, 100, 25);
        let b = distribute_quadtree(corners, 100, 100, 25);
        assert_eq!(a, b);
    }
}
