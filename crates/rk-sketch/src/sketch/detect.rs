//! Automatic area detection
//!
//! Edges are grouped by shared end points into connections. From every
//! connection with at least two edges one path is started along each edge and
//! extended until it either returns to its start (an enclosed loop) or cannot
//! continue. At a branch the path follows the edge with the smallest
//! counter-clockwise angle from the arrival direction, which traces exactly
//! one face of the planar graph. Enclosed loops with the same edges are
//! merged, then fillets on their corners are attached.

use std::collections::{BTreeSet, HashMap, HashSet};
use uuid::Uuid;

use super::edge::EdgeKind;
use super::view::SketchView;
use super::{SketchError, SketchResult};
use crate::geometry::angle_between;

/// A traversal path, and the result of detection when enclosed
#[derive(Debug, Clone, PartialEq)]
pub struct Branch {
    /// Edges in traversal order; attached fillets follow the loop
    pub edges: Vec<Uuid>,
    /// Key point the path started from
    pub start: Uuid,
    /// Whether the path returned to its start
    pub enclosed: bool,
}

/// Edges meeting at one key point
#[derive(Debug)]
struct Connection {
    point: Uuid,
    edges: Vec<Uuid>,
}

/// Connections in order of first appearance
struct Connections<'a> {
    view: SketchView<'a>,
    list: Vec<Connection>,
    index: HashMap<Uuid, usize>,
}

impl<'a> Connections<'a> {
    fn build(view: SketchView<'a>, edges: &[Uuid]) -> Self {
        let mut connections = Self {
            view,
            list: Vec::new(),
            index: HashMap::new(),
        };
        for id in edges {
            let Some(edge) = view.sketch().edge(*id) else { continue };
            if !edge.kind().is_connector() {
                continue;
            }
            let ends = edge.end_key_points();
            if ends.len() != 2 || ends[0] == ends[1] {
                continue;
            }
            for point in ends {
                connections.attach(point, *id);
            }
        }
        connections
    }

    fn attach(&mut self, point: Uuid, edge: Uuid) {
        let slot = *self.index.entry(point).or_insert_with(|| {
            self.list.push(Connection {
                point,
                edges: Vec::new(),
            });
            self.list.len() - 1
        });
        let edges = &mut self.list[slot].edges;
        if !edges.contains(&edge) {
            edges.push(edge);
        }
    }

    fn get(&self, point: Uuid) -> Option<&Connection> {
        self.index.get(&point).map(|i| &self.list[*i])
    }

    /// Key point at the other end of `edge` seen from `point`
    fn far(&self, edge: Uuid, point: Uuid) -> Option<Uuid> {
        self.view.sketch().edge(edge)?.other_end(point)
    }

    /// Extend a single-edge path until it closes or stops
    fn follow(&self, mut branch: Branch) -> SketchResult<Branch> {
        let Some(&first) = branch.edges.first() else {
            return Ok(branch);
        };
        let inconsistent = |edge: Uuid, point: Uuid| SketchError::TopologyInconsistency { edge, point };

        let mut visited = vec![branch.start];
        let mut prev = branch.start;
        let mut current = self
            .far(first, prev)
            .ok_or_else(|| inconsistent(first, prev))?;

        loop {
            if current == branch.start {
                branch.enclosed = true;
                return Ok(branch);
            }
            if visited.contains(&current) {
                return Ok(branch);
            }
            visited.push(current);

            let last = *branch.edges.last().unwrap_or(&first);
            let connection = self.get(current).ok_or_else(|| inconsistent(last, current))?;
            if connection.edges.len() == 1 {
                return Ok(branch);
            }

            let candidates: Vec<Uuid> = connection
                .edges
                .iter()
                .copied()
                .filter(|e| *e != last)
                .collect();
            let next = match candidates.as_slice() {
                [] => return Err(inconsistent(last, current)),
                [only] => *only,
                _ => self.tightest_turn(prev, current, &candidates, last)?,
            };

            if branch.edges.contains(&next) {
                return Ok(branch);
            }
            branch.edges.push(next);
            prev = current;
            current = self.far(next, current).ok_or_else(|| inconsistent(next, current))?;
        }
    }

    /// Candidate with the smallest counter-clockwise angle from the arrival
    /// direction; ties keep the earlier candidate
    fn tightest_turn(&self, prev: Uuid, current: Uuid, candidates: &[Uuid], last: Uuid) -> SketchResult<Uuid> {
        let inconsistent = || SketchError::TopologyInconsistency { edge: last, point: current };
        let center = self.view.position(current).ok_or_else(inconsistent)?;
        let back = self.view.position(prev).ok_or_else(inconsistent)?;

        let mut best: Option<(Uuid, f64)> = None;
        for candidate in candidates {
            let Some(far) = self.far(*candidate, current).and_then(|kp| self.view.position(kp)) else {
                continue;
            };
            let angle = angle_between(center, back, far);
            if best.is_none_or(|(_, a)| angle < a) {
                best = Some((*candidate, angle));
            }
        }
        best.map(|(id, _)| id).ok_or_else(inconsistent)
    }
}

/// Find every enclosed loop among `edges`.
///
/// Fillets and circles never take part in the traversal. Fails when a
/// traversal reaches a connection it cannot leave.
pub fn find_all_areas(view: SketchView<'_>, edges: &[Uuid]) -> SketchResult<Vec<Branch>> {
    let connections = Connections::build(view, edges);

    let mut found: Vec<Branch> = Vec::new();
    let mut seen: HashSet<Vec<Uuid>> = HashSet::new();
    for connection in connections.list.iter().filter(|c| c.edges.len() >= 2) {
        for edge in &connection.edges {
            let seed = Branch {
                edges: vec![*edge],
                start: connection.point,
                enclosed: false,
            };
            let branch = connections.follow(seed)?;
            if !branch.enclosed {
                continue;
            }
            let mut key = branch.edges.clone();
            key.sort();
            if seen.insert(key) {
                found.push(branch);
            }
        }
    }

    for branch in &mut found {
        attach_fillets(view, branch);
    }
    tracing::debug!("Detected {} areas among {} edges", found.len(), edges.len());
    Ok(found)
}

/// Append fillets sitting on the corners of an enclosed loop, in sketch edge order
fn attach_fillets(view: SketchView<'_>, branch: &mut Branch) {
    let sketch = view.sketch();
    let corners: BTreeSet<Uuid> = branch
        .edges
        .iter()
        .filter_map(|e| sketch.edge(*e))
        .flat_map(|e| e.end_key_points())
        .collect();

    for id in sketch.edge_ids() {
        if let Some(edge) = sketch.edge(*id)
            && edge.kind() == EdgeKind::Fillet
            && edge.center().is_some_and(|kp| corners.contains(&kp))
            && !branch.edges.contains(id)
        {
            branch.edges.push(*id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sketch::Sketch;
    use glam::DVec3;

    fn points(sketch: &mut Sketch, coords: &[(f64, f64)]) -> Vec<Uuid> {
        coords
            .iter()
            .map(|(x, y)| sketch.create_key_point(DVec3::new(*x, *y, 0.0)))
            .collect()
    }

    fn closed_polygon(sketch: &mut Sketch, kps: &[Uuid]) -> Vec<Uuid> {
        (0..kps.len())
            .map(|i| sketch.create_line_edge(kps[i], kps[(i + 1) % kps.len()]).unwrap())
            .collect()
    }

    fn edge_sets(branches: &[Branch]) -> BTreeSet<Vec<Uuid>> {
        branches
            .iter()
            .map(|b| {
                let mut edges = b.edges.clone();
                edges.sort();
                edges
            })
            .collect()
    }

    #[test]
    fn test_unit_square() {
        let mut sketch = Sketch::new("Square", Uuid::new_v4());
        let kps = points(&mut sketch, &[(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)]);
        closed_polygon(&mut sketch, &kps);

        let areas = sketch.detect_areas().unwrap();
        assert_eq!(areas.len(), 1);
        assert_eq!(areas[0].edges.len(), 4);
        assert!(areas[0].enclosed);
    }

    #[test]
    fn test_bowtie_gives_two_triangles() {
        let mut sketch = Sketch::new("Bowtie", Uuid::new_v4());
        let kps = points(
            &mut sketch,
            &[(0.0, 0.0), (-1.0, 1.0), (-1.0, -1.0), (1.0, 1.0), (1.0, -1.0)],
        );
        let left = closed_polygon(&mut sketch, &[kps[0], kps[1], kps[2]]);
        let right = closed_polygon(&mut sketch, &[kps[0], kps[3], kps[4]]);

        let areas = sketch.detect_areas().unwrap();
        assert_eq!(areas.len(), 2);
        let sets = edge_sets(&areas);
        let mut left_sorted = left.clone();
        left_sorted.sort();
        let mut right_sorted = right.clone();
        right_sorted.sort();
        assert!(sets.contains(&left_sorted));
        assert!(sets.contains(&right_sorted));
    }

    #[test]
    fn test_shared_edge_gives_faces() {
        let mut sketch = Sketch::new("Domino", Uuid::new_v4());
        let kps = points(
            &mut sketch,
            &[(0.0, 0.0), (1.0, 0.0), (2.0, 0.0), (2.0, 1.0), (1.0, 1.0), (0.0, 1.0)],
        );
        closed_polygon(&mut sketch, &kps);
        sketch.create_line_edge(kps[1], kps[4]).unwrap();

        let areas = sketch.detect_areas().unwrap();
        let mut sizes: Vec<usize> = areas.iter().map(|a| a.edges.len()).collect();
        sizes.sort();
        assert_eq!(sizes, vec![4, 4, 6]);
    }

    #[test]
    fn test_fillet_is_attached_after_loop() {
        let mut sketch = Sketch::new("Rounded", Uuid::new_v4());
        let kps = points(&mut sketch, &[(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)]);
        let lines = closed_polygon(&mut sketch, &kps);
        let fillet = sketch.create_fillet_edge_with_radius(kps[2], 0.1).unwrap();

        let areas = sketch.detect_areas().unwrap();
        assert_eq!(areas.len(), 1);
        assert_eq!(areas[0].edges.len(), 5);
        assert_eq!(areas[0].edges[4], fillet);
        for line in lines {
            assert!(areas[0].edges[..4].contains(&line));
        }
    }

    #[test]
    fn test_detection_ignores_edge_order() {
        let mut sketch = Sketch::new("Bowtie", Uuid::new_v4());
        let kps = points(
            &mut sketch,
            &[(0.0, 0.0), (-1.0, 1.0), (-1.0, -1.0), (1.0, 1.0), (1.0, -1.0)],
        );
        closed_polygon(&mut sketch, &[kps[0], kps[1], kps[2]]);
        closed_polygon(&mut sketch, &[kps[0], kps[3], kps[4]]);

        let forward = sketch.detect_areas().unwrap();
        let mut reversed_order = sketch.edge_ids().to_vec();
        reversed_order.reverse();
        let reversed = sketch.find_areas(&reversed_order).unwrap();
        let again = sketch.detect_areas().unwrap();

        assert_eq!(edge_sets(&forward), edge_sets(&reversed));
        assert_eq!(edge_sets(&forward), edge_sets(&again));
    }

    #[test]
    fn test_dead_end_tail_is_ignored() {
        let mut sketch = Sketch::new("Tail", Uuid::new_v4());
        let kps = points(&mut sketch, &[(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)]);
        let square = closed_polygon(&mut sketch, &kps);
        let tip = sketch.create_key_point(DVec3::new(2.0, 2.0, 0.0));
        sketch.create_line_edge(kps[2], tip).unwrap();

        let areas = sketch.detect_areas().unwrap();
        assert_eq!(areas.len(), 1);
        let mut expected = square.clone();
        expected.sort();
        assert!(edge_sets(&areas).contains(&expected));
    }

    #[test]
    fn test_open_chain_has_no_area() {
        let mut sketch = Sketch::new("Chain", Uuid::new_v4());
        let kps = points(&mut sketch, &[(0.0, 0.0), (1.0, 0.0), (1.0, 1.0)]);
        sketch.create_line_edge(kps[0], kps[1]).unwrap();
        sketch.create_line_edge(kps[1], kps[2]).unwrap();

        assert!(sketch.detect_areas().unwrap().is_empty());
    }

    #[test]
    fn test_arc_and_line_close() {
        let mut sketch = Sketch::new("D", Uuid::new_v4());
        let center = sketch.create_key_point(DVec3::ZERO);
        let arc = sketch
            .create_arc_edge(center, -std::f64::consts::FRAC_PI_2, std::f64::consts::FRAC_PI_2, 1.0)
            .unwrap();
        let [start, end] = sketch.edge(arc).unwrap().arc_ends().unwrap();
        sketch.create_line_edge(end, start).unwrap();

        let areas = sketch.detect_areas().unwrap();
        assert_eq!(areas.len(), 1);
        assert_eq!(areas[0].edges.len(), 2);
    }
}
