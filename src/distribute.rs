// distribute.rs — spatial keypoint budget via quad-tree subdivision.
//
// FAST on a textured image returns far more corners than a tracker can use,
// and they bunch up on high-contrast structure. The distributor keeps at
// most `budget` corners per level while spreading them over the image:
//
//   1. Seed round(w / h) vertical strips so initial nodes are near-square.
//   2. Split every node holding more than one corner into four quadrants,
//      dropping empty children. Repeat until the node count reaches the
//      budget or no node can be split further. A round that only shrinks
//      a tight cluster into a single child does not end the loop.
//   3. When a full round would overshoot, split the most populated nodes
//      first, one at a time, stopping as soon as the budget is met.
//   4. Each surviving node contributes its strongest corner; ties go to the
//      earliest corner in input order.
//   5. If step 3 still overshot by a few nodes, the weakest survivors are
//      dropped (stable on ties).
//
// Nodes live in an arena (`Vec<Node>`) and are referred to by index; the
// frontier is a list of indices and targeted splitting pops from an
// explicit stack. There are no parent links and no recursion.

use crate::fast::Corner;

/// Axis-aligned region in level pixels, half-open.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl Bounds {
    pub fn new(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Bounds { x0, y0, x1, y1 }
    }

    fn width(&self) -> f32 {
        self.x1 - self.x0
    }

    fn height(&self) -> f32 {
        self.y1 - self.y0
    }
}

#[derive(Debug)]
struct Node {
    bounds: Bounds,
    /// Indices into the input corner slice, in input order.
    members: Vec<usize>,
}

impl Node {
    fn can_split(&self) -> bool {
        self.members.len() > 1 && (self.bounds.width() > 0.5 || self.bounds.height() > 0.5)
    }
}

struct QuadTree<'a> {
    corners: &'a [Corner],
    arena: Vec<Node>,
}

impl<'a> QuadTree<'a> {
    fn new(corners: &'a [Corner]) -> Self {
        QuadTree { corners, arena: Vec::new() }
    }

    fn push(&mut self, bounds: Bounds, members: Vec<usize>) -> usize {
        self.arena.push(Node { bounds, members });
        self.arena.len() - 1
    }

    /// Seed strips; returns the non-empty ones.
    fn seed(&mut self, area: Bounds) -> Vec<usize> {
        let strips = ((area.width() / area.height()).round() as usize).max(1);
        let dx = area.width() / strips as f32;
        let mut members = vec![Vec::new(); strips];
        for (i, c) in self.corners.iter().enumerate() {
            let s = (((c.x as f32 - area.x0) / dx).floor() as isize).clamp(0, strips as isize - 1);
            members[s as usize].push(i);
        }
        members
            .into_iter()
            .enumerate()
            .filter(|(_, m)| !m.is_empty())
            .map(|(s, m)| {
                let b = Bounds::new(
                    area.x0 + dx * s as f32,
                    area.y0,
                    area.x0 + dx * (s + 1) as f32,
                    area.y1,
                );
                self.push(b, m)
            })
            .collect()
    }

    /// Split a node into its non-empty quadrants (top-left, top-right,
    /// bottom-left, bottom-right).
    fn split(&mut self, id: usize) -> Vec<usize> {
        let b = self.arena[id].bounds;
        let cx = b.x0 + b.width() / 2.0;
        let cy = b.y0 + b.height() / 2.0;
        let quads = [
            Bounds::new(b.x0, b.y0, cx, cy),
            Bounds::new(cx, b.y0, b.x1, cy),
            Bounds::new(b.x0, cy, cx, b.y1),
            Bounds::new(cx, cy, b.x1, b.y1),
        ];
        let mut members: [Vec<usize>; 4] = Default::default();
        for &i in &self.arena[id].members {
            let c = &self.corners[i];
            let q = ((c.x as f32 >= cx) as usize) | (((c.y as f32 >= cy) as usize) << 1);
            members[q].push(i);
        }
        let mut children = Vec::with_capacity(4);
        for (q, m) in quads.into_iter().zip(members) {
            if !m.is_empty() {
                children.push(self.push(q, m));
            }
        }
        children
    }

    /// Strongest member; earliest index on ties.
    fn best(&self, id: usize) -> usize {
        let mut best = self.arena[id].members[0];
        for &i in &self.arena[id].members[1..] {
            if self.corners[i].response > self.corners[best].response {
                best = i;
            }
        }
        best
    }

    /// Split the most populated nodes first until `budget` nodes exist.
    fn targeted_rounds(&mut self, mut frontier: Vec<usize>, budget: usize) -> Vec<usize> {
        loop {
            let (mut stack, mut next): (Vec<usize>, Vec<usize>) =
                frontier.iter().copied().partition(|&id| self.arena[id].can_split());
            // Pop order: most members first, then lowest arena index.
            stack.sort_by(|&a, &b| {
                self.arena[a].members.len().cmp(&self.arena[b].members.len()).then(b.cmp(&a))
            });
            while let Some(id) = stack.pop() {
                next.extend(self.split(id));
                if next.len() + stack.len() >= budget {
                    next.append(&mut stack);
                    break;
                }
            }
            frontier = next;
            if frontier.len() >= budget || !frontier.iter().any(|&id| self.arena[id].can_split()) {
                return frontier;
            }
        }
    }

    fn run(&mut self, area: Bounds, budget: usize) -> Vec<usize> {
        let mut frontier = self.seed(area);
        loop {
            let before = frontier.len();
            let mut next = Vec::with_capacity(before * 4);
            let mut expandable = 0;
            for &id in &frontier {
                if !self.arena[id].can_split() {
                    next.push(id);
                    continue;
                }
                for child in self.split(id) {
                    expandable += self.arena[child].can_split() as usize;
                    next.push(child);
                }
            }
            frontier = next;
            if frontier.len() >= budget || expandable == 0 {
                return frontier;
            }
            if frontier.len() + 3 * expandable > budget {
                return self.targeted_rounds(frontier, budget);
            }
        }
    }
}

/// Keep at most `budget` corners, spread over `area`.
///
/// The result is in row-major order.
pub fn distribute(corners: &[Corner], area: Bounds, budget: usize) -> Vec<Corner> {
    if corners.is_empty() || budget == 0 || area.width() <= 0.0 || area.height() <= 0.0 {
        return Vec::new();
    }
    let mut kept: Vec<usize> = if corners.len() <= budget {
        (0..corners.len()).collect()
    } else {
        let mut tree = QuadTree::new(corners);
        let leaves = tree.run(area, budget);
        let mut picks: Vec<usize> = leaves.iter().map(|&id| tree.best(id)).collect();
        if picks.len() > budget {
            picks.sort_by(|&a, &b| corners[b].response.cmp(&corners[a].response).then(a.cmp(&b)));
            picks.truncate(budget);
        }
        picks
    };
    kept.sort_by_key(|&i| (corners[i].y, corners[i].x, i));
    kept.into_iter().map(|i| corners[i]).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lcg(seed: &mut u32) -> u32 {
        *seed = seed.wrapping_mul(1664525).wrapping_add(1013904223);
        *seed >> 8
    }

    fn uniform(n: usize, w: i32, h: i32, seed: u32) -> Vec<Corner> {
        let mut s = seed;
        let mut out: Vec<Corner> = (0..n)
            .map(|_| {
                let x = (lcg(&mut s) % w as u32) as i32;
                let y = (lcg(&mut s) % h as u32) as i32;
                Corner::new(x, y, (lcg(&mut s) % 100) as i32 + 7)
            })
            .collect();
        out.sort_by_key(|c| (c.y, c.x));
        out.dedup_by_key(|c| (c.y, c.x));
        out
    }

    fn area(w: i32, h: i32) -> Bounds {
        Bounds::new(0.0, 0.0, w as f32, h as f32)
    }

    #[test]
    fn test_empty_and_zero_budget() {
        assert!(distribute(&[], area(100, 100), 10).is_empty());
        let c = uniform(50, 100, 100, 1);
        assert!(distribute(&c, area(100, 100), 0).is_empty());
    }

    #[test]
    fn test_under_budget_keeps_everything() {
        let c = uniform(40, 200, 100, 2);
        let out = distribute(&c, area(200, 100), 100);
        assert_eq!(out, c);
    }

    #[test]
    fn test_budget_never_exceeded() {
        let c = uniform(3000, 640, 480, 3);
        for budget in [1, 2, 3, 5, 17, 100, 333, 1000, 2999] {
            let out = distribute(&c, area(640, 480), budget);
            assert!(out.len() <= budget, "budget {budget}: got {}", out.len());
            assert!(out.len() >= budget.min(c.len()) * 9 / 10, "budget {budget}: only {}", out.len());
            assert!(out.iter().all(|k| c.contains(k)));
        }
    }

    #[test]
    fn test_spread_over_quadrants() {
        let c = uniform(4000, 640, 480, 4);
        let out = distribute(&c, area(640, 480), 200);
        let mut quad = [0usize; 4];
        for k in &out {
            quad[(k.x >= 320) as usize | (((k.y >= 240) as usize) << 1)] += 1;
        }
        for (q, &n) in quad.iter().enumerate() {
            assert!(n * 100 >= out.len() * 15 && n * 100 <= out.len() * 35,
                "quadrant {q} holds {n} of {}", out.len());
        }
    }

    #[test]
    fn test_cluster_does_not_starve_other_regions() {
        // 2000 corners packed in the top-left, a handful elsewhere.
        let mut c = uniform(2000, 60, 60, 5);
        c.push(Corner::new(500, 400, 150));
        c.push(Corner::new(600, 50, 150));
        c.push(Corner::new(100, 450, 150));
        let out = distribute(&c, area(640, 480), 50);
        for far in [(500, 400), (600, 50), (100, 450)] {
            assert!(out.iter().any(|k| (k.x, k.y) == far), "isolated corner {far:?} dropped");
        }
    }

    #[test]
    fn test_tight_cluster_still_fills_budget() {
        // Every early split leaves all four corners in one child.
        let c = vec![
            Corner::new(40, 40, 10),
            Corner::new(41, 40, 40),
            Corner::new(40, 41, 30),
            Corner::new(41, 41, 20),
        ];
        let out = distribute(&c, area(128, 128), 3);
        assert_eq!(out, vec![Corner::new(41, 40, 40), Corner::new(40, 41, 30), Corner::new(41, 41, 20)]);
    }

    #[test]
    fn test_strongest_wins_in_a_node() {
        let c = vec![
            Corner::new(10, 10, 5),
            Corner::new(11, 10, 50),
            Corner::new(12, 11, 9),
            Corner::new(90, 90, 30),
        ];
        let out = distribute(&c, area(100, 100), 2);
        assert_eq!(out, vec![Corner::new(11, 10, 50), Corner::new(90, 90, 30)]);
    }

    #[test]
    fn test_ties_prefer_insertion_order() {
        let c = vec![Corner::new(1, 1, 20), Corner::new(2, 1, 20), Corner::new(3, 1, 20)];
        let out = distribute(&c, area(4, 4), 1);
        assert_eq!(out, vec![Corner::new(1, 1, 20)]);
    }

    #[test]
    fn test_deterministic() {
        let c = uniform(2500, 320, 240, 6);
        let a = distribute(&c, area(320, 240), 150);
        let b = distribute(&c, area(320, 240), 150);
        assert_eq!(a, b);
        assert!(a.windows(2).all(|w| (w[0].y, w[0].x) < (w[1].y, w[1].x)));
    }
}
