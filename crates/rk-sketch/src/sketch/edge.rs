//! Sketch edges and their geometric queries

use glam::DVec3;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::f64::consts::{PI, TAU};
use uuid::Uuid;

use super::view::SketchView;
use crate::constants::{
    DEFAULT_NURBS_DEGREE, META_DEGREE, META_END_ANGLE, META_RADIUS, META_START_ANGLE,
    NURBS_SAMPLES_PER_CONTROL,
};
use crate::geometry::{
    angle2d, angle_between, angle_between_positive_minimized, angle_between_untouched, arc_span,
    fold_to_pi, polar, sample_clamped_bspline, segment_distance,
};

/// Type of an edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdgeKind {
    /// Straight segment between two key points
    Line,
    /// Circular arc around a center key point, from "sa" to "ea" with radius "r"
    Arc,
    /// Full circle around a center key point
    Circle,
    /// Rounding of the corner at one key point
    Fillet,
    /// Open chain of straight segments
    PolyLine,
    /// Clamped B-spline over control key points
    Nurbs,
}

impl EdgeKind {
    /// Get a display name for this kind
    pub fn name(self) -> &'static str {
        match self {
            EdgeKind::Line => "Line",
            EdgeKind::Arc => "Arc",
            EdgeKind::Circle => "Circle",
            EdgeKind::Fillet => "Fillet",
            EdgeKind::PolyLine => "PolyLine",
            EdgeKind::Nurbs => "Nurbs",
        }
    }

    /// Check if edges of this kind connect two end points
    pub fn is_connector(self) -> bool {
        !matches!(self, EdgeKind::Circle | EdgeKind::Fillet)
    }
}

/// A typed connector between key points
#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    /// Unique identifier
    pub id: Uuid,
    name: String,
    kind: EdgeKind,
    /// Line: both ends. Arc, Circle, Fillet: the center or corner. PolyLine, Nurbs: all points
    key_points: Vec<Uuid>,
    meta: BTreeMap<String, f64>,
    meta_params: BTreeMap<String, Uuid>,
    /// Synthetic start and end points of an arc
    arc_ends: Option<[Uuid; 2]>,
    style: Option<String>,
}

impl Edge {
    pub(crate) fn new(kind: EdgeKind, name: impl Into<String>, key_points: Vec<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            kind,
            key_points,
            meta: BTreeMap::new(),
            meta_params: BTreeMap::new(),
            arc_ends: None,
            style: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> EdgeKind {
        self.kind
    }

    /// Defining key points
    pub fn key_points(&self) -> &[Uuid] {
        &self.key_points
    }

    /// Cached base value of a meta-data entry
    pub fn meta(&self, name: &str) -> Option<f64> {
        self.meta.get(name).copied()
    }

    /// All meta-data entries
    pub fn meta_data(&self) -> impl Iterator<Item = (&str, f64)> {
        self.meta.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Parameter bound to a meta-data entry
    pub fn meta_parameter(&self, name: &str) -> Option<Uuid> {
        self.meta_params.get(name).copied()
    }

    /// All meta-data bindings
    pub fn meta_parameters(&self) -> impl Iterator<Item = (&str, Uuid)> {
        self.meta_params.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn style(&self) -> Option<&str> {
        self.style.as_deref()
    }

    /// Center key point of an arc, circle or fillet
    pub fn center(&self) -> Option<Uuid> {
        match self.kind {
            EdgeKind::Arc | EdgeKind::Circle | EdgeKind::Fillet => self.key_points.first().copied(),
            _ => None,
        }
    }

    /// Synthetic end points of an arc
    pub fn arc_ends(&self) -> Option<[Uuid; 2]> {
        self.arc_ends
    }

    /// Key points where the edge starts and ends
    pub fn end_key_points(&self) -> Vec<Uuid> {
        match self.kind {
            EdgeKind::Line | EdgeKind::Circle | EdgeKind::Fillet => self.key_points.clone(),
            EdgeKind::PolyLine | EdgeKind::Nurbs => match (self.key_points.first(), self.key_points.last()) {
                (Some(first), Some(last)) => vec![*first, *last],
                _ => Vec::new(),
            },
            EdgeKind::Arc => self.arc_ends.map(Vec::from).unwrap_or_default(),
        }
    }

    /// The end point opposite `kp`; edges with a single point have none
    pub fn other_end(&self, kp: Uuid) -> Option<Uuid> {
        let ends = self.end_key_points();
        if ends.len() < 2 {
            return None;
        }
        Some(if ends[0] == kp { ends[1] } else { ends[0] })
    }

    /// Check if the edge uses a key point as defining or synthetic point
    pub fn uses_key_point(&self, kp: Uuid) -> bool {
        self.key_points.contains(&kp) || self.arc_ends.is_some_and(|ends| ends.contains(&kp))
    }

    // ============== Crate-internal mutation ==============

    pub(crate) fn set_meta(&mut self, name: &str, value: f64) -> Option<f64> {
        self.meta.insert(name.to_string(), value)
    }

    pub(crate) fn bind_meta(&mut self, name: &str, param: Option<Uuid>) {
        match param {
            Some(p) => {
                self.meta_params.insert(name.to_string(), p);
            }
            None => {
                self.meta_params.remove(name);
            }
        }
    }

    /// Drop bindings to a parameter, returning the meta-data names that were bound
    pub(crate) fn unbind_parameter(&mut self, param: Uuid) -> Vec<String> {
        let names: Vec<String> = self
            .meta_params
            .iter()
            .filter(|(_, p)| **p == param)
            .map(|(n, _)| n.clone())
            .collect();
        for name in &names {
            self.meta_params.remove(name);
        }
        names
    }

    pub(crate) fn set_arc_ends(&mut self, ends: Option<[Uuid; 2]>) {
        self.arc_ends = ends;
    }

    pub(crate) fn replace_key_point(&mut self, old: Uuid, new: Uuid) {
        for kp in self.key_points.iter_mut() {
            if *kp == old {
                *kp = new;
            }
        }
    }

    pub(crate) fn push_key_point(&mut self, kp: Uuid) {
        self.key_points.push(kp);
    }

    pub(crate) fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub(crate) fn set_style(&mut self, style: Option<String>) {
        self.style = style;
    }
}

/// Effective arc of a fillet, derived from its two neighbouring edges
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilletArc {
    pub center: DVec3,
    pub radius: f64,
    pub start_angle: f64,
    /// Counter-clockwise sweep, never negative
    pub span: f64,
}

/// Presentation geometry of an edge
#[derive(Debug, Clone, PartialEq)]
pub enum DrawData {
    Line { start: DVec3, end: DVec3 },
    Arc {
        center: DVec3,
        radius: f64,
        start_angle: f64,
        span: f64,
    },
    Circle { center: DVec3, radius: f64 },
    Lines(Vec<DVec3>),
}

impl DrawData {
    /// Polyline approximation length of sampled geometry
    fn polyline_length(points: &[DVec3]) -> f64 {
        points.windows(2).map(|w| w[0].distance(w[1])).sum()
    }
}

/// Distance from a filleted corner to where the fillet meets the adjacent edge.
///
/// `far1` and `far2` are the far ends of the two edges meeting at `corner`.
pub fn fillet_offset_distance(corner: DVec3, radius: f64, far1: DVec3, far2: DVec3) -> f64 {
    let between = angle_between_positive_minimized(corner, far1, far2);
    -(between / 2.0 + PI / 2.0).tan() * radius
}

/// An edge seen through a [`SketchView`]
#[derive(Debug, Clone, Copy)]
pub struct EdgeView<'a> {
    view: SketchView<'a>,
    edge: &'a Edge,
}

impl<'a> EdgeView<'a> {
    pub(crate) fn new(view: SketchView<'a>, edge: &'a Edge) -> Self {
        Self { view, edge }
    }

    /// Underlying edge
    pub fn edge(&self) -> &'a Edge {
        self.edge
    }

    fn position(&self, kp: Uuid) -> Option<DVec3> {
        self.view.position(kp)
    }

    fn meta(&self, name: &str) -> f64 {
        self.view.meta(self.edge, name).unwrap_or(0.0)
    }

    fn center_position(&self) -> Option<DVec3> {
        self.edge.center().and_then(|c| self.position(c))
    }

    fn control_points(&self) -> Vec<DVec3> {
        self.edge
            .key_points
            .iter()
            .filter_map(|kp| self.position(*kp))
            .collect()
    }

    /// Positions of the end points
    pub fn end_points(&self) -> Vec<DVec3> {
        if self.edge.kind == EdgeKind::Arc {
            let Some(center) = self.center_position() else {
                return Vec::new();
            };
            let r = self.meta(META_RADIUS);
            return vec![
                polar(center, r, self.meta(META_START_ANGLE)),
                polar(center, r, self.meta(META_END_ANGLE)),
            ];
        }
        self.edge
            .end_key_points()
            .into_iter()
            .filter_map(|kp| self.position(kp))
            .collect()
    }

    /// Direction in which the edge leaves `kp`
    pub fn angle_at(&self, kp: Uuid) -> Option<f64> {
        let ends = self.edge.end_key_points();
        match self.edge.kind {
            EdgeKind::Line => {
                let a = self.position(*ends.first()?)?;
                let b = self.position(*ends.get(1)?)?;
                if ends[1] == kp {
                    Some(angle2d(b, a))
                } else {
                    Some(angle2d(a, b))
                }
            }
            EdgeKind::Arc => {
                if ends.first() == Some(&kp) {
                    Some(self.meta(META_START_ANGLE) - PI / 2.0)
                } else if ends.get(1) == Some(&kp) {
                    Some(self.meta(META_END_ANGLE) - PI / 2.0)
                } else {
                    Some(angle2d(self.center_position()?, self.position(kp)?) + PI / 2.0)
                }
            }
            _ => None,
        }
    }

    /// Distance from `point` to the edge, `INFINITY` when geometry is missing
    pub fn distance(&self, point: DVec3) -> f64 {
        self.try_distance(point).unwrap_or(f64::INFINITY)
    }

    fn try_distance(&self, point: DVec3) -> Option<f64> {
        match self.edge.kind {
            EdgeKind::Line => {
                let ends = self.end_points();
                let (a, b) = (*ends.first()?, *ends.get(1)?);
                Some(segment_distance(a, b, point))
            }
            EdgeKind::PolyLine | EdgeKind::Nurbs => {
                let points = self.control_points();
                if points.len() == 1 {
                    return Some(points[0].distance(point));
                }
                points
                    .windows(2)
                    .map(|w| segment_distance(w[0], w[1], point))
                    .min_by(f64::total_cmp)
            }
            EdgeKind::Arc => {
                let center = self.center_position()?;
                let sa = self.meta(META_START_ANGLE);
                let span = arc_span(sa, self.meta(META_END_ANGLE));
                if arc_span(sa, angle2d(center, point)) > span {
                    self.end_points()
                        .iter()
                        .map(|e| e.distance(point))
                        .min_by(f64::total_cmp)
                } else {
                    Some((center.distance(point) - self.meta(META_RADIUS)).abs())
                }
            }
            EdgeKind::Circle => {
                let center = self.center_position()?;
                Some((center.distance(point) - self.meta(META_RADIUS)).abs())
            }
            EdgeKind::Fillet => {
                let corner = self.center_position()?;
                match self.fillet_arc() {
                    Some(arc) if arc_span(arc.start_angle, angle2d(arc.center, point)) <= arc.span => {
                        Some((arc.center.distance(point) - arc.radius).abs())
                    }
                    _ => Some(corner.distance(point)),
                }
            }
        }
    }

    /// Length of the edge
    pub fn length(&self) -> f64 {
        match self.edge.kind {
            EdgeKind::Line => {
                let ends = self.end_points();
                match (ends.first(), ends.get(1)) {
                    (Some(a), Some(b)) => a.distance(*b),
                    _ => 0.0,
                }
            }
            EdgeKind::Arc => {
                let mut diff = self.meta(META_END_ANGLE) - self.meta(META_START_ANGLE);
                if diff > TAU {
                    diff -= TAU;
                }
                if diff < -TAU {
                    diff += TAU;
                }
                (diff * self.meta(META_RADIUS)).abs()
            }
            EdgeKind::Circle => TAU * self.meta(META_RADIUS),
            EdgeKind::Fillet => self.fillet_arc().map_or(0.0, |arc| arc.radius * arc.span),
            EdgeKind::PolyLine | EdgeKind::Nurbs => match self.draw_data() {
                Some(DrawData::Lines(points)) => DrawData::polyline_length(&points),
                _ => 0.0,
            },
        }
    }

    /// Check if `point` lies on this line, strictly between its ends.
    ///
    /// Only lines can be coincident; every other kind returns false.
    pub fn coincident(&self, point: DVec3, threshold: f64) -> bool {
        if self.edge.kind != EdgeKind::Line {
            return false;
        }
        let ends = self.end_points();
        let (Some(a), Some(b)) = (ends.first().copied(), ends.get(1).copied()) else {
            return false;
        };
        let alpha1 = fold_to_pi(angle_between(a, b, point));
        let alpha2 = fold_to_pi(angle_between(b, a, point));
        alpha1 < PI / 2.0 && alpha2 < PI / 2.0 && a.distance(point) * alpha1.sin() < threshold
    }

    /// Non-fillet edges meeting this fillet's corner, in connection order
    fn fillet_neighbours(&self) -> Vec<EdgeView<'a>> {
        let Some(corner) = self.edge.center() else {
            return Vec::new();
        };
        let Some(kp) = self.view.sketch().key_point(corner) else {
            return Vec::new();
        };
        kp.edges()
            .iter()
            .filter(|e| **e != self.edge.id)
            .filter_map(|e| self.view.edge(*e))
            .filter(|e| e.edge.kind != EdgeKind::Fillet)
            .collect()
    }

    /// Effective arc of a fillet. `None` for other kinds, or when the corner
    /// does not have two neighbouring edges.
    pub fn fillet_arc(&self) -> Option<FilletArc> {
        if self.edge.kind != EdgeKind::Fillet {
            return None;
        }
        let corner = self.edge.center()?;
        let corner_pos = self.position(corner)?;
        let neighbours = self.fillet_neighbours();
        let (e1, e2) = (neighbours.first()?, neighbours.get(1)?);
        let far1 = self.position(e1.edge.other_end(corner)?)?;
        let far2 = self.position(e2.edge.other_end(corner)?)?;
        let a1 = e1.angle_at(corner)?;
        let a2 = e2.angle_at(corner)?;

        let radius = self.meta(META_RADIUS);
        let untouched = angle_between_untouched(corner_pos, far1, far2);
        let dist = radius / (untouched / 2.0).sin();
        let mut between = untouched;
        while between < -TAU {
            between += TAU;
        }
        while between > TAU {
            between -= TAU;
        }
        let larger = between.abs() > PI;

        let mut direction = a1 + between / 2.0;
        if larger {
            direction += PI;
        }
        if dist < 0.0 {
            direction += PI;
        }
        let center = polar(corner_pos, dist, direction);

        let (start, end) = match (between < 0.0, larger) {
            (true, true) => (a2 + PI / 2.0, a1 - PI / 2.0),
            (true, false) => (a2 + 3.0 * PI / 2.0, a1 + PI / 2.0),
            (false, true) => (a1 + PI / 2.0, a2 - PI / 2.0),
            (false, false) => (a2 + PI / 2.0, a1 + 3.0 * PI / 2.0),
        };
        let span = end - start;
        let (start_angle, span) = if span < 0.0 { (end, -span) } else { (start, span) };
        Some(FilletArc {
            center,
            radius,
            start_angle,
            span,
        })
    }

    /// Where a line end meets a fillet at `kp`, if that end is filleted
    fn trimmed_end(&self, kp: Uuid, position: DVec3) -> DVec3 {
        let Some(point) = self.view.sketch().key_point(kp) else {
            return position;
        };
        let mut fillet = None;
        let mut other = None;
        for id in point.edges() {
            let Some(edge) = self.view.edge(*id) else { continue };
            if edge.edge.kind == EdgeKind::Fillet {
                fillet = Some(edge);
            } else if edge.edge.id != self.edge.id {
                other = Some(edge);
            }
        }
        let (Some(fillet), Some(other)) = (fillet, other) else {
            return position;
        };
        let far_self = self.edge.other_end(kp).and_then(|k| self.position(k));
        let far_other = other.edge.other_end(kp).and_then(|k| other.position(k));
        let (Some(far_self), Some(far_other), Some(angle)) = (far_self, far_other, self.angle_at(kp)) else {
            return position;
        };
        let dist = fillet_offset_distance(position, fillet.meta(META_RADIUS), far_self, far_other);
        position + DVec3::new(dist * angle.cos(), dist * angle.sin(), 0.0)
    }

    /// Presentation geometry. Line ends are trimmed back to adjacent fillets.
    pub fn draw_data(&self) -> Option<DrawData> {
        match self.edge.kind {
            EdgeKind::Line => {
                let ends = self.edge.end_key_points();
                let (a, b) = (*ends.first()?, *ends.get(1)?);
                Some(DrawData::Line {
                    start: self.trimmed_end(a, self.position(a)?),
                    end: self.trimmed_end(b, self.position(b)?),
                })
            }
            EdgeKind::Arc => {
                let sa = self.meta(META_START_ANGLE);
                Some(DrawData::Arc {
                    center: self.center_position()?,
                    radius: self.meta(META_RADIUS),
                    start_angle: sa,
                    span: arc_span(sa, self.meta(META_END_ANGLE)),
                })
            }
            EdgeKind::Circle => Some(DrawData::Circle {
                center: self.center_position()?,
                radius: self.meta(META_RADIUS),
            }),
            EdgeKind::Fillet => self.fillet_arc().map(|arc| DrawData::Arc {
                center: arc.center,
                radius: arc.radius,
                start_angle: arc.start_angle,
                span: arc.span,
            }),
            EdgeKind::PolyLine => Some(DrawData::Lines(self.control_points())),
            EdgeKind::Nurbs => {
                let controls = self.control_points();
                let degree = self
                    .view
                    .meta(self.edge, META_DEGREE)
                    .map_or(DEFAULT_NURBS_DEGREE, |n| n.max(1.0) as usize);
                let samples = controls.len() * NURBS_SAMPLES_PER_CONTROL;
                Some(DrawData::Lines(sample_clamped_bspline(&controls, degree, samples)))
            }
        }
    }
}

/// Serialized form of an edge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeData {
    pub id: Uuid,
    pub name: String,
    pub kind: EdgeKind,
    pub key_points: Vec<Uuid>,
    #[serde(default)]
    pub meta: BTreeMap<String, f64>,
    #[serde(default)]
    pub meta_params: BTreeMap<String, Uuid>,
    #[serde(default)]
    pub arc_ends: Option<[Uuid; 2]>,
    #[serde(default)]
    pub style: Option<String>,
}

impl From<&Edge> for EdgeData {
    fn from(edge: &Edge) -> Self {
        Self {
            id: edge.id,
            name: edge.name.clone(),
            kind: edge.kind,
            key_points: edge.key_points.clone(),
            meta: edge.meta.clone(),
            meta_params: edge.meta_params.clone(),
            arc_ends: edge.arc_ends,
            style: edge.style.clone(),
        }
    }
}

impl From<EdgeData> for Edge {
    /// Meta-data bindings are restored separately once parameters are known to exist
    fn from(data: EdgeData) -> Self {
        let mut meta = data.meta;
        if data.kind == EdgeKind::Nurbs {
            meta.entry(META_DEGREE.to_string())
                .or_insert(DEFAULT_NURBS_DEGREE as f64);
        }
        Self {
            id: data.id,
            name: data.name,
            kind: data.kind,
            key_points: data.key_points,
            meta,
            meta_params: BTreeMap::new(),
            arc_ends: data.arc_ends,
            style: data.style,
        }
    }
}
