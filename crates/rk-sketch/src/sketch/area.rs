//! Areas: closed edge loops and composites of other areas

use glam::DVec3;
use serde::{Deserialize, Serialize};
use std::f64::consts::{PI, TAU};
use uuid::Uuid;

use super::edge::{Edge, EdgeKind, EdgeView};
use super::view::SketchView;
use crate::constants::{META_END_ANGLE, META_RADIUS, META_START_ANGLE, RAY_HIT_TOLERANCE};
use crate::geometry::{angle_between, arc_span, polar};

/// What an area is made of
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AreaKind {
    /// A closed cycle of edges, followed by any attached fillets
    EdgeLoop { edges: Vec<Uuid> },
    /// A base area minus subtracted areas, plus added areas
    Composite {
        base: Uuid,
        subtracted: Vec<Uuid>,
        added: Vec<Uuid>,
    },
}

/// A bounded planar region of a sketch
#[derive(Debug, Clone, PartialEq)]
pub struct Area {
    /// Unique identifier
    pub id: Uuid,
    name: String,
    kind: AreaKind,
}

impl Area {
    pub(crate) fn edge_loop(name: impl Into<String>, edges: Vec<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            kind: AreaKind::EdgeLoop { edges },
        }
    }

    pub(crate) fn composite(name: impl Into<String>, base: Uuid, subtracted: Vec<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            kind: AreaKind::Composite {
                base,
                subtracted,
                added: Vec::new(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &AreaKind {
        &self.kind
    }

    /// Member edges of an edge loop; empty for a composite
    pub fn edge_ids(&self) -> &[Uuid] {
        match &self.kind {
            AreaKind::EdgeLoop { edges } => edges,
            AreaKind::Composite { .. } => &[],
        }
    }

    /// Check if an edge is a direct member
    pub fn contains_edge(&self, edge: Uuid) -> bool {
        self.edge_ids().contains(&edge)
    }

    /// Areas a composite is built from
    pub fn constituents(&self) -> Vec<Uuid> {
        match &self.kind {
            AreaKind::EdgeLoop { .. } => Vec::new(),
            AreaKind::Composite {
                base,
                subtracted,
                added,
            } => std::iter::once(*base)
                .chain(subtracted.iter().copied())
                .chain(added.iter().copied())
                .collect(),
        }
    }

    // ============== Crate-internal mutation ==============

    pub(crate) fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub(crate) fn insert_edge_at(&mut self, index: usize, edge: Uuid) {
        if let AreaKind::EdgeLoop { edges } = &mut self.kind {
            edges.insert(index.min(edges.len()), edge);
        }
    }

    pub(crate) fn push_edge(&mut self, edge: Uuid) {
        if let AreaKind::EdgeLoop { edges } = &mut self.kind {
            edges.push(edge);
        }
    }

    pub(crate) fn remove_edge(&mut self, edge: Uuid) {
        if let AreaKind::EdgeLoop { edges } = &mut self.kind {
            edges.retain(|e| *e != edge);
        }
    }

    pub(crate) fn add_subtracted(&mut self, area: Uuid) {
        if let AreaKind::Composite { subtracted, .. } = &mut self.kind
            && !subtracted.contains(&area)
        {
            subtracted.push(area);
        }
    }

    pub(crate) fn add_added(&mut self, area: Uuid) {
        if let AreaKind::Composite { added, .. } = &mut self.kind
            && !added.contains(&area)
        {
            added.push(area);
        }
    }
}

/// An area seen through a [`SketchView`]
#[derive(Debug, Clone, Copy)]
pub struct AreaView<'a> {
    view: SketchView<'a>,
    area: &'a Area,
}

impl<'a> AreaView<'a> {
    pub(crate) fn new(view: SketchView<'a>, area: &'a Area) -> Self {
        Self { view, area }
    }

    /// Underlying area
    pub fn area(&self) -> &'a Area {
        self.area
    }

    /// Member edges. A composite lists its base edges followed by the edges
    /// of the subtracted areas.
    pub fn edges(&self) -> Vec<EdgeView<'a>> {
        match &self.area.kind {
            AreaKind::EdgeLoop { edges } => edges.iter().filter_map(|e| self.view.edge(*e)).collect(),
            AreaKind::Composite { base, subtracted, .. } => std::iter::once(base)
                .chain(subtracted.iter())
                .filter_map(|a| self.view.area(*a))
                .flat_map(|a| a.edges())
                .collect(),
        }
    }

    /// Edges that form the cycle, without fillets
    fn core_edges(&self) -> Vec<&'a Edge> {
        self.area
            .edge_ids()
            .iter()
            .filter_map(|e| self.view.sketch().edge(*e))
            .filter(|e| e.kind() != EdgeKind::Fillet)
            .collect()
    }

    /// Orient the first edge so that its second end leads into the next edge
    fn loop_start(core: &[&Edge]) -> Option<(Uuid, Uuid)> {
        let first = core.first()?.end_key_points();
        let (this, next) = (*first.first()?, *first.get(1)?);
        match core.get(1) {
            Some(second) if second.end_key_points().contains(&this) => Some((next, this)),
            _ => Some((this, next)),
        }
    }

    /// Corner key points in loop order, closing back on the first point
    pub fn key_points(&self) -> Vec<Uuid> {
        let core = self.core_edges();
        if core.len() == 1 {
            return core[0].end_key_points();
        }
        let Some((this, mut next)) = Self::loop_start(&core) else {
            return Vec::new();
        };
        let mut out = vec![this, next];
        for edge in core.iter().skip(1) {
            let ends = edge.end_key_points();
            if ends.len() < 2 {
                continue;
            }
            next = if next == ends[0] { ends[1] } else { ends[0] };
            out.push(next);
        }
        out
    }

    fn arc_mid_point(&self, edge: &Edge) -> Option<DVec3> {
        let center = self.view.position(edge.center()?)?;
        let sa = self.view.meta(edge, META_START_ANGLE)?;
        let ea = self.view.meta(edge, META_END_ANGLE)?;
        let r = self.view.meta(edge, META_RADIUS)?;
        Some(polar(center, r, sa + arc_span(sa, ea) / 2.0))
    }

    /// Points between the ends of an edge that shape the outline
    fn interior_points(&self, edge: &Edge, forward: bool) -> Vec<DVec3> {
        match edge.kind() {
            EdgeKind::Arc => self.arc_mid_point(edge).into_iter().collect(),
            EdgeKind::Nurbs => {
                let kps = edge.key_points();
                if kps.len() < 3 {
                    return Vec::new();
                }
                let mut points: Vec<DVec3> = kps[1..kps.len() - 1]
                    .iter()
                    .filter_map(|kp| self.view.position(*kp))
                    .collect();
                if !forward {
                    points.reverse();
                }
                points
            }
            _ => Vec::new(),
        }
    }

    /// Outline used for point containment: corners plus arc mid-points and
    /// interior nurbs control points
    pub fn inside_key_points(&self) -> Vec<DVec3> {
        let core = self.core_edges();
        if let Some(first) = core.first()
            && first.kind() == EdgeKind::Circle
        {
            return first
                .center()
                .and_then(|c| self.view.position(c))
                .into_iter()
                .collect();
        }
        let Some((this, mut next)) = Self::loop_start(&core) else {
            return Vec::new();
        };

        let mut out: Vec<DVec3> = self.view.position(this).into_iter().collect();
        let forward = core[0].end_key_points().first() == Some(&this);
        out.extend(self.interior_points(core[0], forward));
        out.extend(self.view.position(next));
        for edge in core.iter().skip(1) {
            let ends = edge.end_key_points();
            if ends.len() < 2 {
                continue;
            }
            let forward = next == ends[0];
            out.extend(self.interior_points(edge, forward));
            next = if forward { ends[1] } else { ends[0] };
            out.extend(self.view.position(next));
        }
        out
    }

    /// Check if a point lies inside the area
    pub fn inside(&self, point: DVec3) -> bool {
        match &self.area.kind {
            AreaKind::EdgeLoop { .. } => self.inside_loop(point),
            AreaKind::Composite {
                base,
                subtracted,
                added,
            } => {
                let inside = |id: &Uuid| self.view.area(*id).is_some_and(|a| a.inside(point));
                (inside(base) || added.iter().any(inside)) && !subtracted.iter().any(inside)
            }
        }
    }

    fn inside_loop(&self, point: DVec3) -> bool {
        let core = self.core_edges();
        let Some(first) = core.first() else {
            return false;
        };
        if first.kind() == EdgeKind::Circle {
            let Some(center) = first.center().and_then(|c| self.view.position(c)) else {
                return false;
            };
            return self.view.meta(first, META_RADIUS).unwrap_or(0.0) > center.distance(point);
        }

        let outline = self.inside_key_points();
        let sum: f64 = outline
            .windows(2)
            .map(|w| {
                let angle = angle_between(point, w[0], w[1]);
                if angle > PI { -(TAU - angle) } else { angle }
            })
            .sum();
        sum.abs() > PI
    }

    /// Line and arc members crossed by the line through `origin` with
    /// direction `angle`, with the crossing points
    pub fn intersecting_edges(&self, origin: DVec3, angle: f64) -> Vec<(Uuid, DVec3)> {
        let direction = DVec3::new(angle.cos(), angle.sin(), 0.0);
        let mut hits = Vec::new();
        for edge in self.edges() {
            let candidates = match edge.edge().kind() {
                EdgeKind::Line => {
                    let ends = edge.end_points();
                    match (ends.first(), ends.get(1)) {
                        (Some(a), Some(b)) => line_intersection(*a, *b, origin, origin + direction)
                            .into_iter()
                            .collect(),
                        _ => Vec::new(),
                    }
                }
                EdgeKind::Arc => {
                    let center = edge.edge().center().and_then(|c| self.view.position(c));
                    let radius = self.view.meta(edge.edge(), META_RADIUS);
                    match (center, radius) {
                        (Some(c), Some(r)) => circle_intersections(c, r, origin, direction),
                        _ => Vec::new(),
                    }
                }
                _ => Vec::new(),
            };
            for hit in candidates {
                if edge.distance(hit) < RAY_HIT_TOLERANCE {
                    hits.push((edge.edge().id, hit));
                }
            }
        }
        hits
    }
}

/// Intersection of the infinite lines `p1 p2` and `p3 p4`
fn line_intersection(p1: DVec3, p2: DVec3, p3: DVec3, p4: DVec3) -> Option<DVec3> {
    let denom = (p1.x - p2.x) * (p3.y - p4.y) - (p1.y - p2.y) * (p3.x - p4.x);
    if denom == 0.0 {
        return None;
    }
    let a = p1.x * p2.y - p1.y * p2.x;
    let b = p3.x * p4.y - p3.y * p4.x;
    Some(DVec3::new(
        (a * (p3.x - p4.x) - (p1.x - p2.x) * b) / denom,
        (a * (p3.y - p4.y) - (p1.y - p2.y) * b) / denom,
        0.0,
    ))
}

/// Intersections of the line `origin + t·direction` with a circle
fn circle_intersections(center: DVec3, radius: f64, origin: DVec3, direction: DVec3) -> Vec<DVec3> {
    let offset = origin - center;
    let b = offset.x * direction.x + offset.y * direction.y;
    let c = offset.x * offset.x + offset.y * offset.y - radius * radius;
    let disc = b * b - c;
    if disc < 0.0 {
        return Vec::new();
    }
    let root = disc.sqrt();
    let mut out = vec![origin + direction * (-b - root)];
    if root > 0.0 {
        out.push(origin + direction * (-b + root));
    }
    out
}

/// Serialized form of an area
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AreaData {
    pub id: Uuid,
    pub name: String,
    pub kind: AreaKind,
}

impl From<&Area> for AreaData {
    fn from(area: &Area) -> Self {
        Self {
            id: area.id,
            name: area.name.clone(),
            kind: area.kind.clone(),
        }
    }
}

impl From<AreaData> for Area {
    fn from(data: AreaData) -> Self {
        Self {
            id: data.id,
            name: data.name,
            kind: data.kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sketch::Sketch;
    use approx::assert_relative_eq;

    /// Unit square with corners a, b, c, d and edges ab, bc, cd, da
    fn square() -> (Sketch, Uuid, Vec<Uuid>) {
        let mut sketch = Sketch::new("Square", Uuid::new_v4());
        let kps: Vec<Uuid> = [(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)]
            .iter()
            .map(|(x, y)| sketch.create_key_point(DVec3::new(*x, *y, 0.0)))
            .collect();
        let edges: Vec<Uuid> = (0..4)
            .map(|i| sketch.create_line_edge(kps[i], kps[(i + 1) % 4]).unwrap())
            .collect();
        let area = sketch.create_area(edges.clone()).unwrap();
        (sketch, area, kps)
    }

    #[test]
    fn test_key_point_loop_closes() {
        let (sketch, area, kps) = square();
        let loop_kps = sketch.view().area(area).unwrap().key_points();
        assert_eq!(loop_kps.len(), 5);
        assert_eq!(loop_kps.first(), loop_kps.last());
        for kp in &kps {
            assert!(loop_kps.contains(kp));
        }
    }

    #[test]
    fn test_inside_square() {
        let (sketch, area, _) = square();
        let view = sketch.view();
        let area = view.area(area).unwrap();
        assert!(area.inside(DVec3::new(0.5, 0.5, 0.0)));
        assert!(area.inside(DVec3::new(0.9, 0.1, 0.0)));
        assert!(!area.inside(DVec3::new(1.5, 0.5, 0.0)));
        assert!(!area.inside(DVec3::new(-0.1, -0.1, 0.0)));
    }

    #[test]
    fn test_inside_with_arc_side() {
        let mut sketch = Sketch::new("D", Uuid::new_v4());
        let center = sketch.create_key_point(DVec3::ZERO);
        let arc = sketch.create_arc_edge(center, -PI / 2.0, PI / 2.0, 1.0).unwrap();
        let [start, end] = sketch.edge(arc).unwrap().arc_ends().unwrap();
        let line = sketch.create_line_edge(end, start).unwrap();
        let area = sketch.create_area(vec![arc, line]).unwrap();
        let view = sketch.view();
        let area = view.area(area).unwrap();

        assert_eq!(area.inside_key_points().len(), 4);
        assert!(area.inside(DVec3::new(0.5, 0.0, 0.0)));
        assert!(!area.inside(DVec3::new(-0.5, 0.0, 0.0)));
    }

    #[test]
    fn test_circle_area() {
        let mut sketch = Sketch::new("C", Uuid::new_v4());
        let center = sketch.create_key_point(DVec3::ZERO);
        let circle = sketch.create_circle_edge_with_radius(center, 2.0).unwrap();
        let area = sketch.create_area(vec![circle]).unwrap();
        let view = sketch.view();
        let area = view.area(area).unwrap();
        assert!(area.inside(DVec3::new(1.5, 0.0, 0.0)));
        assert!(!area.inside(DVec3::new(2.5, 0.0, 0.0)));
    }

    #[test]
    fn test_composite_inside() {
        let (mut sketch, outer, _) = square();
        let center = sketch.create_key_point(DVec3::new(0.5, 0.5, 0.0));
        let hole_edge = sketch.create_circle_edge_with_radius(center, 0.2).unwrap();
        let hole = sketch.create_area(vec![hole_edge]).unwrap();
        let composite = sketch.create_composite_area(outer, &[hole]).unwrap();
        let view = sketch.view();
        let area = view.area(composite).unwrap();

        assert!(area.inside(DVec3::new(0.1, 0.1, 0.0)));
        assert!(!area.inside(DVec3::new(0.5, 0.5, 0.0)));
        assert!(!area.inside(DVec3::new(2.0, 0.5, 0.0)));
        assert_eq!(area.edges().len(), 5);
    }

    #[test]
    fn test_intersecting_edges() {
        let (sketch, area, _) = square();
        let view = sketch.view();
        let hits = view
            .area(area)
            .unwrap()
            .intersecting_edges(DVec3::new(0.5, 0.5, 0.0), 0.0);

        assert_eq!(hits.len(), 2);
        let mut xs: Vec<f64> = hits.iter().map(|(_, p)| p.x).collect();
        xs.sort_by(f64::total_cmp);
        assert_relative_eq!(xs[0], 0.0, epsilon = 1e-9);
        assert_relative_eq!(xs[1], 1.0, epsilon = 1e-9);
    }
}
