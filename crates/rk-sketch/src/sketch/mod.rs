//! Planar sketches
//!
//! A [`Sketch`] owns its key points, edges, areas, texts and inserted sketch
//! instances in arenas keyed by ID.
//! Entities refer to each other only by ID. A reverse index maps every
//! parameter to the coordinates and meta-data bound to it, so parameter
//! changes can be routed without live references. Mutations queue
//! [`ChangeEvent`]s that the owning document drains.

pub mod annotation;
pub mod area;
pub mod detect;
pub mod edge;
pub mod instance;
pub mod keypoint;
pub mod view;

pub use annotation::{HorizontalAlignment, Text, TextData, TextKind, VerticalAlignment};

pub use area::{Area, AreaData, AreaKind, AreaView};
pub use detect::{Branch, find_all_areas};
pub use edge::{DrawData, Edge, EdgeData, EdgeKind, EdgeView, FilletArc, fillet_offset_distance};
pub use instance::{InstanceView, SketchInstance, SketchInstanceData};
pub use keypoint::{KeyPoint, KeyPointData};
pub use view::SketchView;

use glam::{DVec2, DVec3};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

use crate::constants::{
    AREA_NAME_PREFIX, DEFAULT_COINCIDENCE_THRESHOLD, DEFAULT_NURBS_DEGREE, EDGE_NAME_PREFIX,
    META_DEGREE, META_END_ANGLE, META_RADIUS, META_START_ANGLE,
};
use crate::document::{DanglingReference, LoadReport};
use crate::event::{ChangeDetail, ChangeEvent, ChangeKind, EntityRef, EventQueue};
use crate::geometry::{Axis, polar};
use crate::parameter::{ParameterChange, ParameterError, ParameterStore};

/// Errors from sketch operations
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SketchError {
    #[error("Key point not found: {0}")]
    KeyPointNotFound(Uuid),
    #[error("Edge not found: {0}")]
    EdgeNotFound(Uuid),
    #[error("Area not found: {0}")]
    AreaNotFound(Uuid),
    #[error("Text not found: {0}")]
    TextNotFound(Uuid),
    #[error("Text {0} is not an attribute")]
    NotAnAttribute(Uuid),
    #[error("Sketch instance not found: {0}")]
    InstanceNotFound(Uuid),
    #[error("Invalid sketch instance: {0}")]
    InvalidInstance(String),
    #[error("Invalid edge: {0}")]
    InvalidEdge(String),
    #[error("Invalid area: {0}")]
    InvalidArea(String),
    #[error("Key point {0} cannot be edited directly")]
    NotEditable(Uuid),
    #[error("Cannot auto-detect areas: inconsistent topology at edge {edge}, key point {point}")]
    TopologyInconsistency { edge: Uuid, point: Uuid },
    #[error("Parameter error: {0}")]
    Parameter(#[from] ParameterError),
}

/// Result type for sketch operations
pub type SketchResult<T> = Result<T, SketchError>;

/// Per-sketch tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SketchSettings {
    /// Distance under which a new key point reuses an existing one
    pub coincidence_threshold: f64,
    /// Prefix of auto-assigned edge names
    pub edge_name_prefix: String,
    /// Base name of new areas
    pub area_name_prefix: String,
}

impl Default for SketchSettings {
    fn default() -> Self {
        Self {
            coincidence_threshold: DEFAULT_COINCIDENCE_THRESHOLD,
            edge_name_prefix: EDGE_NAME_PREFIX.to_string(),
            area_name_prefix: AREA_NAME_PREFIX.to_string(),
        }
    }
}

impl SketchSettings {
    pub fn with_coincidence_threshold(mut self, threshold: f64) -> Self {
        self.coincidence_threshold = threshold;
        self
    }

    pub fn with_edge_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.edge_name_prefix = prefix.into();
        self
    }

    pub fn with_area_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.area_name_prefix = prefix.into();
        self
    }
}

/// A sketch value driven by a parameter
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Binding {
    KeyPointAxis { key_point: Uuid, axis: Axis },
    EdgeMeta { edge: Uuid, name: String },
}

/// Key points, edges and areas in one plane
#[derive(Debug, Clone)]
pub struct Sketch {
    /// Unique identifier
    pub id: Uuid,
    name: String,
    /// Parameter scope of this sketch
    scope: Uuid,
    settings: SketchSettings,
    key_points: HashMap<Uuid, KeyPoint>,
    key_point_order: Vec<Uuid>,
    edges: HashMap<Uuid, Edge>,
    edge_order: Vec<Uuid>,
    areas: HashMap<Uuid, Area>,
    area_order: Vec<Uuid>,
    texts: HashMap<Uuid, Text>,
    text_order: Vec<Uuid>,
    instances: HashMap<Uuid, SketchInstance>,
    instance_order: Vec<Uuid>,
    /// Parameter ID -> values bound to it
    bindings: HashMap<Uuid, Vec<Binding>>,
    /// Next index for auto-named edges
    edge_counter: usize,
    events: EventQueue,
}

impl Sketch {
    /// Create an empty sketch whose parameters live in `scope`
    pub fn new(name: impl Into<String>, scope: Uuid) -> Self {
        Self::with_settings(name, scope, SketchSettings::default())
    }

    pub fn with_settings(name: impl Into<String>, scope: Uuid, settings: SketchSettings) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            scope,
            settings,
            key_points: HashMap::new(),
            key_point_order: Vec::new(),
            edges: HashMap::new(),
            edge_order: Vec::new(),
            areas: HashMap::new(),
            area_order: Vec::new(),
            texts: HashMap::new(),
            text_order: Vec::new(),
            instances: HashMap::new(),
            instance_order: Vec::new(),
            bindings: HashMap::new(),
            edge_counter: 1,
            events: EventQueue::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parameter scope of this sketch
    pub fn scope(&self) -> Uuid {
        self.scope
    }

    pub fn settings(&self) -> &SketchSettings {
        &self.settings
    }

    pub fn rename(&mut self, name: impl Into<String>) {
        let name = name.into();
        let old = std::mem::replace(&mut self.name, name.clone());
        self.events.push(
            ChangeEvent::about(EntityRef::Sketch(self.id), ChangeKind::ValueChanged)
                .with_detail(ChangeDetail::Renamed { old, new: name }),
        );
    }

    /// Base geometry view
    pub fn view(&self) -> SketchView<'_> {
        SketchView::new(self)
    }

    /// View that can also read parameter instance values
    pub fn view_with<'a>(&'a self, params: &'a ParameterStore) -> SketchView<'a> {
        SketchView::with_parameters(self, params)
    }

    /// Pending change events
    pub fn events(&self) -> &EventQueue {
        &self.events
    }

    /// Take all pending change events
    pub fn drain_events(&mut self) -> Vec<ChangeEvent> {
        self.events.drain()
    }

    // ============== Lookup ==============

    pub fn key_point(&self, id: Uuid) -> Option<&KeyPoint> {
        self.key_points.get(&id)
    }

    /// Key points in creation order
    pub fn key_points(&self) -> impl Iterator<Item = &KeyPoint> {
        self.key_point_order.iter().filter_map(|id| self.key_points.get(id))
    }

    pub fn key_point_ids(&self) -> &[Uuid] {
        &self.key_point_order
    }

    pub fn edge(&self, id: Uuid) -> Option<&Edge> {
        self.edges.get(&id)
    }

    /// Edges in creation order
    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edge_order.iter().filter_map(|id| self.edges.get(id))
    }

    pub fn edge_ids(&self) -> &[Uuid] {
        &self.edge_order
    }

    /// Find an edge by name
    pub fn edge_by_name(&self, name: &str) -> Option<&Edge> {
        self.edges().find(|e| e.name() == name)
    }

    pub fn area(&self, id: Uuid) -> Option<&Area> {
        self.areas.get(&id)
    }

    /// Areas in creation order
    pub fn areas(&self) -> impl Iterator<Item = &Area> {
        self.area_order.iter().filter_map(|id| self.areas.get(id))
    }

    pub fn area_ids(&self) -> &[Uuid] {
        &self.area_order
    }

    pub fn text(&self, id: Uuid) -> Option<&Text> {
        self.texts.get(&id)
    }

    /// Texts and attributes in creation order
    pub fn texts(&self) -> impl Iterator<Item = &Text> {
        self.text_order.iter().filter_map(|id| self.texts.get(id))
    }

    pub fn text_ids(&self) -> &[Uuid] {
        &self.text_order
    }

    pub fn sketch_instance(&self, id: Uuid) -> Option<&SketchInstance> {
        self.instances.get(&id)
    }

    /// Inserted sketch instances in creation order
    pub fn sketch_instances(&self) -> impl Iterator<Item = &SketchInstance> {
        self.instance_order.iter().filter_map(|id| self.instances.get(id))
    }

    pub fn sketch_instance_ids(&self) -> &[Uuid] {
        &self.instance_order
    }

    /// Values bound to a parameter
    pub fn bindings(&self, param: Uuid) -> &[Binding] {
        self.bindings.get(&param).map_or(&[], |b| b.as_slice())
    }

    /// Parameters this sketch depends on
    pub fn bound_parameters(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.bindings.keys().copied()
    }

    fn require_key_point(&self, id: Uuid) -> SketchResult<&KeyPoint> {
        self.key_points.get(&id).ok_or(SketchError::KeyPointNotFound(id))
    }

    fn require_edge(&self, id: Uuid) -> SketchResult<&Edge> {
        self.edges.get(&id).ok_or(SketchError::EdgeNotFound(id))
    }

    fn require_area(&self, id: Uuid) -> SketchResult<&Area> {
        self.areas.get(&id).ok_or(SketchError::AreaNotFound(id))
    }

    fn require_instance(&self, id: Uuid) -> SketchResult<&SketchInstance> {
        self.instances.get(&id).ok_or(SketchError::InstanceNotFound(id))
    }

    fn require_edge_loop(&self, id: Uuid) -> SketchResult<&Area> {
        let area = self.require_area(id)?;
        match area.kind() {
            AreaKind::EdgeLoop { .. } => Ok(area),
            AreaKind::Composite { .. } => Err(SketchError::InvalidArea(format!(
                "'{}' is a composite area",
                area.name()
            ))),
        }
    }

    fn require_composite(&self, id: Uuid) -> SketchResult<&Area> {
        let area = self.require_area(id)?;
        match area.kind() {
            AreaKind::Composite { .. } => Ok(area),
            AreaKind::EdgeLoop { .. } => Err(SketchError::InvalidArea(format!(
                "'{}' is not a composite area",
                area.name()
            ))),
        }
    }

    // ============== Events ==============

    fn emit_added(&mut self, child: EntityRef) {
        let container = EntityRef::Sketch(self.id);
        self.events.added(container, child);
    }

    fn emit_removed(&mut self, child: EntityRef) {
        let container = EntityRef::Sketch(self.id);
        self.events.removed(container, child);
    }

    fn emit_changed(&mut self, entity: EntityRef) {
        self.events
            .push(ChangeEvent::about(entity, ChangeKind::ObjectChanged));
    }

    fn emit_coordinate(&mut self, kp: Uuid, axis: Axis, old: f64, new: f64, instance: Option<Uuid>) {
        self.events.push(
            ChangeEvent::about(EntityRef::KeyPoint(kp), ChangeKind::ValueChanged)
                .with_detail(ChangeDetail::Coordinate {
                    axis,
                    old,
                    new,
                    instance,
                }),
        );
    }

    // ============== Binding Index ==============

    fn index_binding(&mut self, param: Uuid, binding: Binding) {
        let list = self.bindings.entry(param).or_default();
        if !list.contains(&binding) {
            list.push(binding);
        }
    }

    fn unindex_binding(&mut self, param: Uuid, binding: &Binding) {
        if let Some(list) = self.bindings.get_mut(&param) {
            list.retain(|b| b != binding);
            if list.is_empty() {
                self.bindings.remove(&param);
            }
        }
    }

    // ============== Key Points ==============

    /// First key point within `threshold` of `position` on every axis.
    ///
    /// Uses the sketch's coincidence threshold when `threshold` is `None`.
    pub fn key_point_at(&self, position: DVec3, threshold: Option<f64>) -> Option<Uuid> {
        let threshold = threshold.unwrap_or(self.settings.coincidence_threshold);
        self.key_points()
            .find(|kp| {
                let d = (kp.position() - position).abs();
                d.x < threshold && d.y < threshold && d.z < threshold
            })
            .map(|kp| kp.id)
    }

    /// Create a key point, or return the existing one at that position
    pub fn create_key_point(&mut self, position: DVec3) -> Uuid {
        if let Some(existing) = self.key_point_at(position, None) {
            return existing;
        }
        self.add_key_point(KeyPoint::new(position))
    }

    fn add_key_point(&mut self, kp: KeyPoint) -> Uuid {
        let id = kp.id;
        self.key_point_order.push(id);
        self.key_points.insert(id, kp);
        self.emit_added(EntityRef::KeyPoint(id));
        tracing::debug!("Created key point {} in sketch '{}'", id, self.name);
        id
    }

    /// Create a key point and split every line it lands on
    pub fn insert_key_point(&mut self, position: DVec3) -> SketchResult<Uuid> {
        if let Some(existing) = self.key_point_at(position, None) {
            return Ok(existing);
        }
        let id = self.add_key_point(KeyPoint::new(position));
        let threshold = self.settings.coincidence_threshold;
        let targets: Vec<Uuid> = {
            let view = self.view();
            self.edge_order
                .iter()
                .copied()
                .filter(|e| view.edge(*e).is_some_and(|e| e.coincident(position, threshold)))
                .collect()
        };
        for edge in targets {
            self.split_edge(edge, id)?;
        }
        Ok(id)
    }

    /// Write one base coordinate without touching bindings.
    /// Returns whether the value changed.
    fn write_axis(&mut self, kp: Uuid, axis: Axis, value: f64) -> bool {
        let Some(point) = self.key_points.get_mut(&kp) else {
            return false;
        };
        let old = point.set_axis(axis, value);
        if old == value {
            return false;
        }
        self.emit_coordinate(kp, axis, old, value, None);
        true
    }

    /// Set a base coordinate.
    ///
    /// A bound axis writes through to its parameter; the returned changes
    /// include every dependent parameter that moved.
    pub fn set_key_point_axis(
        &mut self,
        params: &mut ParameterStore,
        kp: Uuid,
        axis: Axis,
        value: f64,
    ) -> SketchResult<Vec<ParameterChange>> {
        let point = self.require_key_point(kp)?;
        if let Some(param) = point.parameter(axis) {
            let changes = params.set_value(param, value)?;
            self.apply_parameter_changes(params, &changes);
            return Ok(changes);
        }
        if !point.editable() {
            return Err(SketchError::NotEditable(kp));
        }
        if self.write_axis(kp, axis, value) {
            self.refresh_arcs_at(kp);
        }
        Ok(Vec::new())
    }

    /// Drive a coordinate by a parameter. The coordinate takes the
    /// parameter's value immediately.
    pub fn bind_key_point_axis(
        &mut self,
        params: &ParameterStore,
        kp: Uuid,
        axis: Axis,
        param: Uuid,
    ) -> SketchResult<()> {
        let value = params.value(param).ok_or(ParameterError::NotFound(param))?;
        let previous = self.require_key_point(kp)?.parameter(axis);
        let binding = Binding::KeyPointAxis { key_point: kp, axis };
        if let Some(old_param) = previous {
            self.unindex_binding(old_param, &binding);
        }
        let Some(point) = self.key_points.get_mut(&kp) else {
            return Err(SketchError::KeyPointNotFound(kp));
        };
        point.bind(axis, Some(param));
        let old = point.set_axis(axis, value);
        self.index_binding(param, binding);
        self.emit_coordinate(kp, axis, old, value, None);
        self.refresh_arcs_at(kp);
        tracing::debug!("Bound {} axis of key point {} to parameter {}", axis.name(), kp, param);
        Ok(())
    }

    /// Release a coordinate from its parameter, keeping the current value
    pub fn unbind_key_point_axis(&mut self, kp: Uuid, axis: Axis) -> SketchResult<Option<Uuid>> {
        let previous = self.require_key_point(kp)?.parameter(axis);
        if let Some(param) = previous {
            self.unindex_binding(param, &Binding::KeyPointAxis { key_point: kp, axis });
            if let Some(point) = self.key_points.get_mut(&kp) {
                point.bind(axis, None);
            }
            self.emit_changed(EntityRef::KeyPoint(kp));
        }
        Ok(previous)
    }

    /// Set a coordinate for one instance.
    ///
    /// A bound axis writes the parameter's instance value; otherwise the
    /// key point stores a vertex override.
    pub fn set_key_point_instance(
        &mut self,
        params: &mut ParameterStore,
        kp: Uuid,
        instance: Uuid,
        axis: Axis,
        value: f64,
    ) -> SketchResult<Vec<ParameterChange>> {
        if let Some(param) = self.require_key_point(kp)?.parameter(axis) {
            let changes = params.set_instance_value(param, instance, value)?;
            self.apply_parameter_changes(params, &changes);
            return Ok(changes);
        }
        let Some(point) = self.key_points.get_mut(&kp) else {
            return Err(SketchError::KeyPointNotFound(kp));
        };
        let old = point.set_instance_axis(instance, axis, value);
        if old != value {
            self.emit_coordinate(kp, axis, old, value, Some(instance));
        }
        Ok(Vec::new())
    }

    /// Remove a key point with every edge, text and sketch instance that
    /// uses it
    pub fn remove_key_point(&mut self, kp: Uuid) -> SketchResult<()> {
        let edges = self.require_key_point(kp)?.edges().to_vec();
        for edge in edges {
            if self.edges.contains_key(&edge) {
                self.remove_edge(edge)?;
            }
        }
        let texts: Vec<Uuid> = self.texts().filter(|t| t.key_point() == kp).map(|t| t.id).collect();
        for text in texts {
            self.remove_text(text)?;
        }
        let instances: Vec<Uuid> = self
            .sketch_instances()
            .filter(|i| i.offset() == kp)
            .map(|i| i.id)
            .collect();
        for instance in instances {
            self.remove_sketch_instance(instance)?;
        }
        // Synthetic arc ends may already be gone with their arc
        self.drop_key_point(kp);
        Ok(())
    }

    fn drop_key_point(&mut self, kp: Uuid) -> Option<KeyPoint> {
        let point = self.key_points.remove(&kp)?;
        self.key_point_order.retain(|id| *id != kp);
        for (axis, param) in point.parameters() {
            self.unindex_binding(param, &Binding::KeyPointAxis { key_point: kp, axis });
        }
        self.emit_removed(EntityRef::KeyPoint(kp));
        tracing::debug!("Removed key point {} from sketch '{}'", kp, self.name);
        Some(point)
    }

    /// Remove key points nothing uses. Returns how many were removed.
    pub fn remove_unreferenced_key_points(&mut self) -> usize {
        let unused: Vec<Uuid> = self
            .key_points()
            .filter(|kp| kp.edges().is_empty() && !self.is_anchor(kp.id))
            .map(|kp| kp.id)
            .collect();
        for kp in &unused {
            self.drop_key_point(*kp);
        }
        unused.len()
    }

    /// Check whether a text or a sketch instance sits on a key point
    fn is_anchor(&self, kp: Uuid) -> bool {
        self.texts.values().any(|t| t.key_point() == kp) || self.instances.values().any(|i| i.offset() == kp)
    }

    /// 2D bounding box of all key points
    pub fn limits(&self) -> Option<(DVec2, DVec2)> {
        let mut points = self.key_points().map(|kp| kp.position().truncate());
        let first = points.next()?;
        Some(points.fold((first, first), |(lo, hi), p| (lo.min(p), hi.max(p))))
    }

    // ============== Edges ==============

    fn next_edge_name(&mut self) -> String {
        let name = format!("{}{}", self.settings.edge_name_prefix, self.edge_counter);
        self.edge_counter += 1;
        name
    }

    /// Insert an edge and link it to its key points
    fn link_edge(&mut self, edge: Edge) -> Uuid {
        let id = edge.id;
        let points = edge
            .key_points()
            .iter()
            .copied()
            .chain(edge.arc_ends().into_iter().flatten());
        for kp in points {
            if let Some(point) = self.key_points.get_mut(&kp) {
                point.add_edge(id);
            }
        }
        self.edge_order.push(id);
        self.edges.insert(id, edge);
        id
    }

    fn register_edge(&mut self, edge: Edge) -> Uuid {
        tracing::debug!("Created {} edge '{}' in sketch '{}'", edge.kind().name(), edge.name(), self.name);
        let id = self.link_edge(edge);
        self.emit_added(EntityRef::Edge(id));
        id
    }

    pub fn create_line_edge(&mut self, start: Uuid, end: Uuid) -> SketchResult<Uuid> {
        self.require_key_point(start)?;
        self.require_key_point(end)?;
        if start == end {
            return Err(SketchError::InvalidEdge(
                "a line needs two distinct key points".to_string(),
            ));
        }
        let name = self.next_edge_name();
        Ok(self.register_edge(Edge::new(EdgeKind::Line, name, vec![start, end])))
    }

    /// Create an arc around `center`. Its end points are materialized as
    /// key points that are not editable, reusing coincident ones.
    pub fn create_arc_edge(
        &mut self,
        center: Uuid,
        start_angle: f64,
        end_angle: f64,
        radius: f64,
    ) -> SketchResult<Uuid> {
        let c = self.require_key_point(center)?.position();
        let start = self.arc_end_point(center, polar(c, radius, start_angle));
        let end = self.arc_end_point(center, polar(c, radius, end_angle));

        let name = self.next_edge_name();
        let mut edge = Edge::new(EdgeKind::Arc, name, vec![center]);
        edge.set_meta(META_RADIUS, radius);
        edge.set_meta(META_START_ANGLE, start_angle);
        edge.set_meta(META_END_ANGLE, end_angle);
        edge.set_arc_ends(Some([start, end]));
        Ok(self.register_edge(edge))
    }

    fn arc_end_point(&mut self, center: Uuid, position: DVec3) -> Uuid {
        match self.key_point_at(position, None) {
            Some(existing) if existing != center => existing,
            _ => {
                let mut kp = KeyPoint::new(position);
                kp.set_editable(false);
                self.add_key_point(kp)
            }
        }
    }

    /// Create a circle whose radius follows a parameter
    pub fn create_circle_edge(
        &mut self,
        params: &ParameterStore,
        center: Uuid,
        radius_param: Uuid,
    ) -> SketchResult<Uuid> {
        let radius = params
            .value(radius_param)
            .ok_or(ParameterError::NotFound(radius_param))?;
        let id = self.create_circle_edge_with_radius(center, radius)?;
        self.bind_edge_meta(params, id, META_RADIUS, radius_param)?;
        Ok(id)
    }

    pub fn create_circle_edge_with_radius(&mut self, center: Uuid, radius: f64) -> SketchResult<Uuid> {
        self.require_key_point(center)?;
        let name = self.next_edge_name();
        let mut edge = Edge::new(EdgeKind::Circle, name, vec![center]);
        edge.set_meta(META_RADIUS, radius);
        Ok(self.register_edge(edge))
    }

    /// Round the corner at `kp` with a radius that follows a parameter
    pub fn create_fillet_edge(
        &mut self,
        params: &ParameterStore,
        kp: Uuid,
        radius_param: Uuid,
    ) -> SketchResult<Uuid> {
        let radius = params
            .value(radius_param)
            .ok_or(ParameterError::NotFound(radius_param))?;
        let id = self.create_fillet_edge_with_radius(kp, radius)?;
        self.bind_edge_meta(params, id, META_RADIUS, radius_param)?;
        Ok(id)
    }

    /// Round the corner at `kp`. The fillet joins every edge-loop area that
    /// has a corner there.
    pub fn create_fillet_edge_with_radius(&mut self, kp: Uuid, radius: f64) -> SketchResult<Uuid> {
        let corner = self.require_key_point(kp)?;
        let has_fillet = corner
            .edges()
            .iter()
            .any(|e| self.edges.get(e).is_some_and(|e| e.kind() == EdgeKind::Fillet));
        if has_fillet {
            return Err(SketchError::InvalidEdge(format!(
                "key point {} already has a fillet",
                kp
            )));
        }

        let name = self.next_edge_name();
        let mut edge = Edge::new(EdgeKind::Fillet, name, vec![kp]);
        edge.set_meta(META_RADIUS, radius);
        let id = self.register_edge(edge);

        let cornered: Vec<Uuid> = {
            let view = self.view();
            self.area_order
                .iter()
                .copied()
                .filter(|a| {
                    view.area(*a).is_some_and(|area| {
                        matches!(area.area().kind(), AreaKind::EdgeLoop { .. })
                            && area.key_points().contains(&kp)
                    })
                })
                .collect()
        };
        for area in cornered {
            self.add_area_edge(area, id)?;
        }
        Ok(id)
    }

    pub fn create_polyline_edge(&mut self, points: &[Uuid]) -> SketchResult<Uuid> {
        self.create_chain_edge(EdgeKind::PolyLine, points)
    }

    /// Create a clamped B-spline edge over control points
    pub fn create_nurbs_edge(&mut self, controls: &[Uuid]) -> SketchResult<Uuid> {
        self.create_chain_edge(EdgeKind::Nurbs, controls)
    }

    fn create_chain_edge(&mut self, kind: EdgeKind, points: &[Uuid]) -> SketchResult<Uuid> {
        if points.len() < 2 {
            return Err(SketchError::InvalidEdge(format!(
                "a {} needs at least two key points",
                kind.name()
            )));
        }
        for kp in points {
            self.require_key_point(*kp)?;
        }
        let name = self.next_edge_name();
        let mut edge = Edge::new(kind, name, points.to_vec());
        if kind == EdgeKind::Nurbs {
            edge.set_meta(META_DEGREE, DEFAULT_NURBS_DEGREE as f64);
        }
        Ok(self.register_edge(edge))
    }

    /// Append a point to a polyline or nurbs edge
    pub fn add_edge_key_point(&mut self, edge: Uuid, kp: Uuid) -> SketchResult<()> {
        let kind = self.require_edge(edge)?.kind();
        self.require_key_point(kp)?;
        if !matches!(kind, EdgeKind::PolyLine | EdgeKind::Nurbs) {
            return Err(SketchError::InvalidEdge(format!(
                "cannot add key points to a {}",
                kind.name()
            )));
        }
        if let Some(e) = self.edges.get_mut(&edge) {
            e.push_key_point(kp);
        }
        if let Some(point) = self.key_points.get_mut(&kp) {
            point.add_edge(edge);
        }
        self.emit_changed(EntityRef::Edge(edge));
        Ok(())
    }

    /// Write cached meta-data, moving arc end points when the arc changed.
    /// Returns whether the value changed.
    fn write_meta(&mut self, edge: Uuid, name: &str, value: f64) -> bool {
        let Some(e) = self.edges.get_mut(&edge) else {
            return false;
        };
        let old = e.set_meta(name, value);
        if old == Some(value) {
            return false;
        }
        let is_arc = e.kind() == EdgeKind::Arc;
        self.events.push(
            ChangeEvent::about(EntityRef::Edge(edge), ChangeKind::ValueChanged).with_detail(
                ChangeDetail::MetaData {
                    name: name.to_string(),
                    old: old.unwrap_or_default(),
                    new: value,
                },
            ),
        );
        if is_arc && [META_RADIUS, META_START_ANGLE, META_END_ANGLE].contains(&name) {
            self.refresh_arc_ends(edge);
        }
        true
    }

    /// Set a meta-data value, writing through to a bound parameter
    pub fn set_edge_meta(
        &mut self,
        params: &mut ParameterStore,
        edge: Uuid,
        name: &str,
        value: f64,
    ) -> SketchResult<Vec<ParameterChange>> {
        if let Some(param) = self.require_edge(edge)?.meta_parameter(name) {
            let changes = params.set_value(param, value)?;
            self.apply_parameter_changes(params, &changes);
            return Ok(changes);
        }
        self.write_meta(edge, name, value);
        Ok(Vec::new())
    }

    /// Drive a meta-data entry by a parameter
    pub fn bind_edge_meta(
        &mut self,
        params: &ParameterStore,
        edge: Uuid,
        name: &str,
        param: Uuid,
    ) -> SketchResult<()> {
        let value = params.value(param).ok_or(ParameterError::NotFound(param))?;
        let previous = self.require_edge(edge)?.meta_parameter(name);
        let binding = Binding::EdgeMeta {
            edge,
            name: name.to_string(),
        };
        if let Some(old_param) = previous {
            self.unindex_binding(old_param, &binding);
        }
        if let Some(e) = self.edges.get_mut(&edge) {
            e.bind_meta(name, Some(param));
        }
        self.index_binding(param, binding);
        self.write_meta(edge, name, value);
        tracing::debug!("Bound meta-data '{}' of edge {} to parameter {}", name, edge, param);
        Ok(())
    }

    /// Release a meta-data entry from its parameter, keeping the current value
    pub fn unbind_edge_meta(&mut self, edge: Uuid, name: &str) -> SketchResult<Option<Uuid>> {
        let previous = self.require_edge(edge)?.meta_parameter(name);
        if let Some(param) = previous {
            self.unindex_binding(
                param,
                &Binding::EdgeMeta {
                    edge,
                    name: name.to_string(),
                },
            );
            if let Some(e) = self.edges.get_mut(&edge) {
                e.bind_meta(name, None);
            }
            self.emit_changed(EntityRef::Edge(edge));
        }
        Ok(previous)
    }

    pub fn rename_edge(&mut self, edge: Uuid, name: impl Into<String>) -> SketchResult<()> {
        let name = name.into();
        let old = self.require_edge(edge)?.name().to_string();
        if let Some(e) = self.edges.get_mut(&edge) {
            e.set_name(name.clone());
        }
        self.events.push(
            ChangeEvent::about(EntityRef::Edge(edge), ChangeKind::ValueChanged)
                .with_detail(ChangeDetail::Renamed { old, new: name }),
        );
        Ok(())
    }

    pub fn set_edge_style(&mut self, edge: Uuid, style: Option<String>) -> SketchResult<()> {
        self.require_edge(edge)?;
        if let Some(e) = self.edges.get_mut(&edge) {
            e.set_style(style);
        }
        self.emit_changed(EntityRef::Edge(edge));
        Ok(())
    }

    /// Move the synthetic end points of an arc onto its current geometry
    fn refresh_arc_ends(&mut self, edge: Uuid) {
        let Some(arc) = self.edges.get(&edge) else {
            return;
        };
        let (Some(center), Some([start, end])) = (arc.center(), arc.arc_ends()) else {
            return;
        };
        let Some(c) = self.key_points.get(&center).map(|p| p.position()) else {
            return;
        };
        let r = arc.meta(META_RADIUS).unwrap_or_default();
        let targets = [
            (start, polar(c, r, arc.meta(META_START_ANGLE).unwrap_or_default())),
            (end, polar(c, r, arc.meta(META_END_ANGLE).unwrap_or_default())),
        ];
        for (kp, position) in targets {
            // Reused end points keep the axes their parameters drive
            let free: Vec<Axis> = match self.key_points.get(&kp) {
                Some(point) => Axis::ALL.into_iter().filter(|a| point.parameter(*a).is_none()).collect(),
                None => continue,
            };
            for axis in free {
                self.write_axis(kp, axis, axis.get(position));
            }
        }
    }

    /// Refresh arcs centered on a key point that moved
    fn refresh_arcs_at(&mut self, kp: Uuid) {
        let arcs: Vec<Uuid> = self
            .key_points
            .get(&kp)
            .map(|point| {
                point
                    .edges()
                    .iter()
                    .copied()
                    .filter(|e| {
                        self.edges
                            .get(e)
                            .is_some_and(|e| e.kind() == EdgeKind::Arc && e.center() == Some(kp))
                    })
                    .collect()
            })
            .unwrap_or_default();
        for arc in arcs {
            self.refresh_arc_ends(arc);
        }
    }

    /// Split a line at `kp`: the line now ends at `kp` and a new line runs
    /// from `kp` to the old end. Areas get the new line on the side of the
    /// old line that faces the old end, so their loops stay closed.
    pub fn split_edge(&mut self, edge: Uuid, kp: Uuid) -> SketchResult<Uuid> {
        let line = self.require_edge(edge)?;
        if line.kind() != EdgeKind::Line {
            return Err(SketchError::InvalidEdge(format!(
                "only lines can be split, '{}' is a {}",
                line.name(),
                line.kind().name()
            )));
        }
        let [start, end] = match line.key_points() {
            [a, b] => [*a, *b],
            _ => return Err(SketchError::InvalidEdge(format!("line '{}' is malformed", line.name()))),
        };
        self.require_key_point(kp)?;
        if kp == start || kp == end {
            return Err(SketchError::InvalidEdge(
                "cannot split a line at its own end point".to_string(),
            ));
        }

        if let Some(line) = self.edges.get_mut(&edge) {
            line.replace_key_point(end, kp);
        }
        if let Some(point) = self.key_points.get_mut(&end) {
            point.remove_edge(edge);
        }
        if let Some(point) = self.key_points.get_mut(&kp) {
            point.add_edge(edge);
        }
        self.emit_changed(EntityRef::Edge(edge));
        let added = self.create_line_edge(kp, end)?;

        let holders: Vec<(Uuid, usize)> = self
            .areas()
            .filter_map(|a| Some((a.id, a.edge_ids().iter().position(|e| *e == edge)?)))
            .collect();
        for (area, index) in holders {
            let entered_at_end = self.previous_loop_edge(area, index).is_some_and(|prev| {
                self.edges
                    .get(&prev)
                    .is_some_and(|e| e.end_key_points().contains(&end))
            });
            let at = if entered_at_end { index } else { index + 1 };
            if let Some(a) = self.areas.get_mut(&area) {
                a.insert_edge_at(at, added);
            }
            self.emit_changed(EntityRef::Area(area));
        }
        Ok(added)
    }

    /// Closest member before `index` in loop order, skipping fillets
    fn previous_loop_edge(&self, area: Uuid, index: usize) -> Option<Uuid> {
        let members = self.areas.get(&area)?.edge_ids();
        let len = members.len();
        (1..len)
            .map(|step| members[(index + len - step) % len])
            .find(|e| self.edges.get(e).is_some_and(|e| e.kind() != EdgeKind::Fillet))
    }

    /// Remove an edge.
    ///
    /// Areas lose a removed fillet but are removed themselves when a cycle
    /// member goes. Synthetic arc end points nothing else uses go as well.
    pub fn remove_edge(&mut self, edge: Uuid) -> SketchResult<()> {
        let removed = self.edges.remove(&edge).ok_or(SketchError::EdgeNotFound(edge))?;
        self.edge_order.retain(|e| *e != edge);
        let points = removed
            .key_points()
            .iter()
            .copied()
            .chain(removed.arc_ends().into_iter().flatten());
        for kp in points {
            if let Some(point) = self.key_points.get_mut(&kp) {
                point.remove_edge(edge);
            }
        }
        for (name, param) in removed.meta_parameters() {
            self.unindex_binding(
                param,
                &Binding::EdgeMeta {
                    edge,
                    name: name.to_string(),
                },
            );
        }
        self.emit_removed(EntityRef::Edge(edge));

        let holders: Vec<Uuid> = self
            .areas()
            .filter(|a| a.contains_edge(edge))
            .map(|a| a.id)
            .collect();
        for area in holders {
            if removed.kind() == EdgeKind::Fillet {
                if let Some(a) = self.areas.get_mut(&area) {
                    a.remove_edge(edge);
                }
                self.emit_changed(EntityRef::Area(area));
            } else if self.areas.contains_key(&area) {
                self.remove_area(area)?;
            }
        }

        if let Some(ends) = removed.arc_ends() {
            for kp in ends {
                let orphaned = self
                    .key_points
                    .get(&kp)
                    .is_some_and(|p| p.edges().is_empty() && !p.editable());
                if orphaned && !self.is_anchor(kp) {
                    self.drop_key_point(kp);
                }
            }
        }
        tracing::debug!("Removed edge '{}' from sketch '{}'", removed.name(), self.name);
        Ok(())
    }

    // ============== Areas ==============

    /// First free name among `prefix`, `prefix1`, `prefix2`, ...
    fn unique_area_name(&self) -> String {
        let prefix = &self.settings.area_name_prefix;
        let taken = |name: &str| self.areas.values().any(|a| a.name() == name);
        if !taken(prefix.as_str()) {
            return prefix.clone();
        }
        let mut index = 1;
        loop {
            let name = format!("{}{}", prefix, index);
            if !taken(name.as_str()) {
                return name;
            }
            index += 1;
        }
    }

    fn register_area(&mut self, area: Area) -> Uuid {
        let id = area.id;
        tracing::debug!("Created area '{}' in sketch '{}'", area.name(), self.name);
        self.area_order.push(id);
        self.areas.insert(id, area);
        self.emit_added(EntityRef::Area(id));
        id
    }

    /// Run area detection over all edges
    pub fn detect_areas(&self) -> SketchResult<Vec<Branch>> {
        find_all_areas(self.view(), &self.edge_order)
    }

    /// Run area detection over a subset of edges, in the given order
    pub fn find_areas(&self, edges: &[Uuid]) -> SketchResult<Vec<Branch>> {
        find_all_areas(self.view(), edges)
    }

    /// Create an edge-loop area
    pub fn create_area(&mut self, edges: Vec<Uuid>) -> SketchResult<Uuid> {
        if edges.is_empty() {
            return Err(SketchError::InvalidArea(
                "an area needs at least one edge".to_string(),
            ));
        }
        for edge in &edges {
            self.require_edge(*edge)?;
        }
        let area = Area::edge_loop(self.unique_area_name(), edges);
        Ok(self.register_area(area))
    }

    /// Turn one detected path into an area
    pub fn create_area_from_path(&mut self, path: &Branch) -> SketchResult<Uuid> {
        if !path.enclosed {
            return Err(SketchError::InvalidArea("path is not enclosed".to_string()));
        }
        self.create_area(path.edges.clone())
    }

    /// Replace all areas with freshly detected ones, plus one per circle.
    ///
    /// Existing areas are kept when detection fails.
    pub fn create_all_areas(&mut self) -> SketchResult<Vec<Uuid>> {
        let paths = self.detect_areas()?;
        self.clear_areas();

        let mut created = Vec::with_capacity(paths.len());
        for path in &paths {
            created.push(self.create_area_from_path(path)?);
        }
        let circles: Vec<Uuid> = self
            .edges()
            .filter(|e| e.kind() == EdgeKind::Circle)
            .map(|e| e.id)
            .collect();
        for circle in circles {
            created.push(self.create_area(vec![circle])?);
        }
        tracing::debug!("Sketch '{}' now has {} areas", self.name, created.len());
        Ok(created)
    }

    /// Create `base` minus `subtracted`
    pub fn create_composite_area(&mut self, base: Uuid, subtracted: &[Uuid]) -> SketchResult<Uuid> {
        self.require_area(base)?;
        for area in subtracted {
            self.require_area(*area)?;
            if *area == base {
                return Err(SketchError::InvalidArea(
                    "an area cannot be subtracted from itself".to_string(),
                ));
            }
        }
        let area = Area::composite(self.unique_area_name(), base, subtracted.to_vec());
        Ok(self.register_area(area))
    }

    pub fn add_subtracted_area(&mut self, composite: Uuid, area: Uuid) -> SketchResult<()> {
        self.require_composite(composite)?;
        self.require_area(area)?;
        if area == composite {
            return Err(SketchError::InvalidArea(
                "an area cannot contain itself".to_string(),
            ));
        }
        if let Some(c) = self.areas.get_mut(&composite) {
            c.add_subtracted(area);
        }
        self.emit_changed(EntityRef::Area(composite));
        Ok(())
    }

    pub fn add_added_area(&mut self, composite: Uuid, area: Uuid) -> SketchResult<()> {
        self.require_composite(composite)?;
        self.require_area(area)?;
        if area == composite {
            return Err(SketchError::InvalidArea(
                "an area cannot contain itself".to_string(),
            ));
        }
        if let Some(c) = self.areas.get_mut(&composite) {
            c.add_added(area);
        }
        self.emit_changed(EntityRef::Area(composite));
        Ok(())
    }

    /// Insert an edge before the loop position of its first end point,
    /// or append it when that point is not on the loop
    pub fn insert_area_edge(&mut self, area: Uuid, edge: Uuid) -> SketchResult<()> {
        if self.require_edge_loop(area)?.contains_edge(edge) {
            return Ok(());
        }
        let first_end = self.require_edge(edge)?.end_key_points().first().copied();
        let index = first_end.and_then(|kp| {
            self.view()
                .area(area)
                .and_then(|a| a.key_points().iter().position(|k| *k == kp))
        });
        if let Some(a) = self.areas.get_mut(&area) {
            match index {
                Some(i) => a.insert_edge_at(i, edge),
                None => a.push_edge(edge),
            }
        }
        self.emit_changed(EntityRef::Area(area));
        Ok(())
    }

    /// Append an edge to an edge-loop area
    pub fn add_area_edge(&mut self, area: Uuid, edge: Uuid) -> SketchResult<()> {
        if self.require_edge_loop(area)?.contains_edge(edge) {
            return Ok(());
        }
        self.require_edge(edge)?;
        if let Some(a) = self.areas.get_mut(&area) {
            a.push_edge(edge);
        }
        self.emit_changed(EntityRef::Area(area));
        Ok(())
    }

    /// Remove an area and every composite built on it
    pub fn remove_area(&mut self, area: Uuid) -> SketchResult<()> {
        self.require_area(area)?;

        // Collect dependent composites
        let mut to_remove = vec![area];
        let mut i = 0;
        while i < to_remove.len() {
            let current = to_remove[i];
            for a in self.areas() {
                if !to_remove.contains(&a.id) && a.constituents().contains(&current) {
                    to_remove.push(a.id);
                }
            }
            i += 1;
        }

        for id in to_remove {
            if let Some(removed) = self.areas.remove(&id) {
                self.area_order.retain(|a| *a != id);
                self.emit_removed(EntityRef::Area(id));
                tracing::debug!("Removed area '{}' from sketch '{}'", removed.name(), self.name);
            }
        }
        Ok(())
    }

    /// Remove all areas
    pub fn clear_areas(&mut self) {
        if self.area_order.is_empty() {
            return;
        }
        for id in std::mem::take(&mut self.area_order) {
            self.areas.remove(&id);
            self.emit_removed(EntityRef::Area(id));
        }
        self.events
            .push(ChangeEvent::about(EntityRef::Sketch(self.id), ChangeKind::Cleared));
    }

    pub fn rename_area(&mut self, area: Uuid, name: impl Into<String>) -> SketchResult<()> {
        let name = name.into();
        let old = self.require_area(area)?.name().to_string();
        if let Some(a) = self.areas.get_mut(&area) {
            a.set_name(name.clone());
        }
        self.events.push(
            ChangeEvent::about(EntityRef::Area(area), ChangeKind::ValueChanged)
                .with_detail(ChangeDetail::Renamed { old, new: name }),
        );
        Ok(())
    }

    // ============== Texts ==============

    fn register_text(&mut self, text: Text) -> Uuid {
        let id = text.id;
        tracing::debug!("Created text '{}' in sketch '{}'", text.name(), self.name);
        self.text_order.push(id);
        self.texts.insert(id, text);
        self.emit_added(EntityRef::Text(id));
        id
    }

    /// Create a plain text at a key point
    pub fn create_text(&mut self, kp: Uuid, value: impl Into<String>, height: f64) -> SketchResult<Uuid> {
        self.require_key_point(kp)?;
        Ok(self.register_text(Text::new(kp, value, height, TextKind::Plain)))
    }

    /// Create a named attribute at a key point, holding a default value
    pub fn create_attribute(
        &mut self,
        kp: Uuid,
        name: impl Into<String>,
        default_value: impl Into<String>,
        height: f64,
    ) -> SketchResult<Uuid> {
        self.require_key_point(kp)?;
        let kind = TextKind::Attribute { name: name.into() };
        Ok(self.register_text(Text::new(kp, default_value, height, kind)))
    }

    pub fn set_text_value(&mut self, text: Uuid, value: impl Into<String>) -> SketchResult<()> {
        let value = value.into();
        let Some(t) = self.texts.get_mut(&text) else {
            return Err(SketchError::TextNotFound(text));
        };
        let old = t.set_value(value.clone());
        if old != value {
            self.events.push(
                ChangeEvent::about(EntityRef::Text(text), ChangeKind::ValueChanged)
                    .with_detail(ChangeDetail::Renamed { old, new: value }),
            );
        }
        Ok(())
    }

    pub fn rename_attribute(&mut self, text: Uuid, name: impl Into<String>) -> SketchResult<()> {
        let name = name.into();
        let Some(t) = self.texts.get_mut(&text) else {
            return Err(SketchError::TextNotFound(text));
        };
        let Some(old) = t.rename_attribute(name.clone()) else {
            return Err(SketchError::NotAnAttribute(text));
        };
        self.events.push(
            ChangeEvent::about(EntityRef::Text(text), ChangeKind::ValueChanged)
                .with_detail(ChangeDetail::Renamed { old, new: name }),
        );
        Ok(())
    }

    pub fn set_text_height(&mut self, text: Uuid, height: f64) -> SketchResult<()> {
        let Some(t) = self.texts.get_mut(&text) else {
            return Err(SketchError::TextNotFound(text));
        };
        if t.set_height(height) != height {
            self.emit_changed(EntityRef::Text(text));
        }
        Ok(())
    }

    /// Rotation in radians
    pub fn set_text_angle(&mut self, text: Uuid, angle: f64) -> SketchResult<()> {
        let Some(t) = self.texts.get_mut(&text) else {
            return Err(SketchError::TextNotFound(text));
        };
        if t.set_angle(angle) != angle {
            self.emit_changed(EntityRef::Text(text));
        }
        Ok(())
    }

    pub fn set_text_alignment(
        &mut self,
        text: Uuid,
        vertical: VerticalAlignment,
        horizontal: HorizontalAlignment,
    ) -> SketchResult<()> {
        let Some(t) = self.texts.get_mut(&text) else {
            return Err(SketchError::TextNotFound(text));
        };
        t.set_alignment(vertical, horizontal);
        self.emit_changed(EntityRef::Text(text));
        Ok(())
    }

    pub fn remove_text(&mut self, text: Uuid) -> SketchResult<()> {
        let removed = self.texts.remove(&text).ok_or(SketchError::TextNotFound(text))?;
        self.text_order.retain(|t| *t != text);
        self.emit_removed(EntityRef::Text(text));
        tracing::debug!("Removed text '{}' from sketch '{}'", removed.name(), self.name);
        Ok(())
    }

    // ============== Sketch Instances ==============

    /// Insert another sketch at `offset`. The document checks that the
    /// inserted sketch exists and does not contain this one.
    pub(crate) fn create_sketch_instance(
        &mut self,
        sketch: Uuid,
        name: impl Into<String>,
        offset: Uuid,
    ) -> SketchResult<Uuid> {
        self.require_key_point(offset)?;
        if sketch == self.id {
            return Err(SketchError::InvalidInstance(
                "a sketch cannot be inserted into itself".to_string(),
            ));
        }
        let instance = SketchInstance::new(name, sketch, offset);
        let id = instance.id;
        tracing::debug!("Inserted sketch {} into sketch '{}' as {}", sketch, self.name, id);
        self.instance_order.push(id);
        self.instances.insert(id, instance);
        self.emit_added(EntityRef::SketchInstance(id));
        Ok(id)
    }

    /// Sketches this sketch inserts directly
    pub fn inserted_sketches(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.sketch_instances().map(|i| i.sketch())
    }

    pub fn rename_sketch_instance(&mut self, instance: Uuid, name: impl Into<String>) -> SketchResult<()> {
        let name = name.into();
        let Some(i) = self.instances.get_mut(&instance) else {
            return Err(SketchError::InstanceNotFound(instance));
        };
        let old = i.set_name(name.clone());
        self.events.push(
            ChangeEvent::about(EntityRef::SketchInstance(instance), ChangeKind::ValueChanged)
                .with_detail(ChangeDetail::Renamed { old, new: name }),
        );
        Ok(())
    }

    /// Move an instance onto another key point
    pub fn set_instance_offset(&mut self, instance: Uuid, offset: Uuid) -> SketchResult<()> {
        self.require_instance(instance)?;
        self.require_key_point(offset)?;
        if let Some(i) = self.instances.get_mut(&instance) {
            i.set_offset(offset);
        }
        self.emit_changed(EntityRef::SketchInstance(instance));
        Ok(())
    }

    /// Scale must be finite and positive
    pub fn set_instance_scale(&mut self, instance: Uuid, scale: f64) -> SketchResult<()> {
        if !scale.is_finite() || scale <= 0.0 {
            return Err(SketchError::InvalidInstance(format!("scale {} is not positive", scale)));
        }
        let Some(i) = self.instances.get_mut(&instance) else {
            return Err(SketchError::InstanceNotFound(instance));
        };
        if i.set_scale(scale) != scale {
            self.emit_changed(EntityRef::SketchInstance(instance));
        }
        Ok(())
    }

    pub(crate) fn record_instance_type(
        &mut self,
        instance: Uuid,
        standard: &str,
        type_name: Option<&str>,
    ) -> SketchResult<()> {
        let Some(i) = self.instances.get_mut(&instance) else {
            return Err(SketchError::InstanceNotFound(instance));
        };
        i.set_current_type(Some(standard.to_string()), type_name.map(str::to_string));
        self.emit_changed(EntityRef::SketchInstance(instance));
        Ok(())
    }

    pub fn remove_sketch_instance(&mut self, instance: Uuid) -> SketchResult<SketchInstance> {
        let removed = self
            .instances
            .remove(&instance)
            .ok_or(SketchError::InstanceNotFound(instance))?;
        self.instance_order.retain(|i| *i != instance);
        self.emit_removed(EntityRef::SketchInstance(instance));
        tracing::debug!("Removed sketch instance '{}' from sketch '{}'", removed.name(), self.name);
        Ok(removed)
    }

    /// Remove every instance of a sketch, returning the removed instance IDs
    pub(crate) fn remove_instances_of(&mut self, sketch: Uuid) -> Vec<Uuid> {
        let doomed: Vec<Uuid> = self
            .sketch_instances()
            .filter(|i| i.sketch() == sketch)
            .map(|i| i.id)
            .collect();
        for id in &doomed {
            if let Some(removed) = self.instances.remove(id) {
                self.instance_order.retain(|i| i != id);
                self.emit_removed(EntityRef::SketchInstance(*id));
                tracing::debug!("Removed sketch instance '{}' from sketch '{}'", removed.name(), self.name);
            }
        }
        doomed
    }

    // ============== Parameter Hooks ==============

    /// Refresh values bound to changed parameters.
    ///
    /// Base changes update the cached coordinates and meta-data and are
    /// idempotent. Instance changes are only announced, since instance
    /// geometry is read through the parameter store.
    pub fn apply_parameter_changes(&mut self, params: &ParameterStore, changes: &[ParameterChange]) {
        for change in changes {
            let Some(bindings) = self.bindings.get(&change.parameter).cloned() else {
                continue;
            };
            match change.instance {
                None => {
                    let Some(value) = params.value(change.parameter) else {
                        continue;
                    };
                    for binding in bindings {
                        match binding {
                            Binding::KeyPointAxis { key_point, axis } => {
                                if self.write_axis(key_point, axis, value) {
                                    self.refresh_arcs_at(key_point);
                                }
                            }
                            Binding::EdgeMeta { edge, name } => {
                                self.write_meta(edge, &name, value);
                            }
                        }
                    }
                }
                Some(instance) => {
                    for binding in bindings {
                        match binding {
                            Binding::KeyPointAxis { key_point, axis } => {
                                self.emit_coordinate(key_point, axis, change.old, change.new, Some(instance));
                            }
                            Binding::EdgeMeta { edge, .. } => self.events.push(
                                ChangeEvent::about(EntityRef::Edge(edge), ChangeKind::ValueChanged)
                                    .with_detail(ChangeDetail::Value {
                                        old: change.old,
                                        new: change.new,
                                        instance: Some(instance),
                                        old_formula: None,
                                        new_formula: None,
                                    }),
                            ),
                        }
                    }
                }
            }
        }
    }

    /// Drop every binding to a deleted parameter; bound values keep their
    /// last value as literals
    pub fn on_parameter_deleted(&mut self, param: Uuid) {
        let Some(bindings) = self.bindings.remove(&param) else {
            return;
        };
        for binding in bindings {
            match binding {
                Binding::KeyPointAxis { key_point, .. } => {
                    if let Some(point) = self.key_points.get_mut(&key_point) {
                        point.unbind_parameter(param);
                    }
                }
                Binding::EdgeMeta { edge, .. } => {
                    if let Some(e) = self.edges.get_mut(&edge) {
                        e.unbind_parameter(param);
                    }
                }
            }
        }
        tracing::debug!("Sketch '{}' released deleted parameter {}", self.name, param);
    }

    // ============== Persistence ==============

    pub fn to_data(&self) -> SketchData {
        SketchData {
            id: self.id,
            name: self.name.clone(),
            scope: self.scope,
            settings: self.settings.clone(),
            key_points: self.key_points().map(KeyPointData::from).collect(),
            edges: self.edges().map(EdgeData::from).collect(),
            areas: self.areas().map(AreaData::from).collect(),
            texts: self.texts().map(TextData::from).collect(),
            instances: self.sketch_instances().map(SketchInstanceData::from).collect(),
            edge_counter: self.edge_counter,
        }
    }

    /// Rebuild a sketch in two passes: entities first, then parameter
    /// bindings. References that do not resolve are skipped and reported.
    pub fn from_data(data: SketchData, params: &ParameterStore, report: &mut LoadReport) -> Self {
        let mut sketch = Self::with_settings(data.name, data.scope, data.settings);
        sketch.id = data.id;

        let mut skip = |owner: EntityRef, target: Uuid, role: &str| {
            tracing::warn!("Skipping {} reference from {} {} to missing {}", role, owner.type_name(), owner.id(), target);
            report.skipped.push(DanglingReference {
                owner,
                target,
                role: role.to_string(),
            });
        };

        // Pass one: entities
        let mut axis_bindings = Vec::new();
        for kp_data in data.key_points {
            for axis in Axis::ALL {
                if let Some(param) = kp_data.params[axis.index()] {
                    axis_bindings.push((kp_data.id, axis, param));
                }
            }
            let point = KeyPoint::from(kp_data);
            sketch.key_point_order.push(point.id);
            sketch.key_points.insert(point.id, point);
        }

        let mut meta_bindings = Vec::new();
        for edge_data in data.edges {
            let missing = edge_data
                .key_points
                .iter()
                .chain(edge_data.arc_ends.iter().flatten())
                .find(|kp| !sketch.key_points.contains_key(*kp))
                .copied();
            if let Some(missing) = missing {
                skip(EntityRef::Edge(edge_data.id), missing, "key point");
                continue;
            }
            for (name, param) in &edge_data.meta_params {
                meta_bindings.push((edge_data.id, name.clone(), *param));
            }
            sketch.link_edge(Edge::from(edge_data));
        }

        for area_data in data.areas {
            let area = Area::from(area_data);
            let missing = match area.kind() {
                AreaKind::EdgeLoop { edges } => edges
                    .iter()
                    .find(|e| !sketch.edges.contains_key(*e))
                    .map(|e| (*e, "edge")),
                AreaKind::Composite { .. } => area
                    .constituents()
                    .into_iter()
                    .find(|a| !sketch.areas.contains_key(a))
                    .map(|a| (a, "area")),
            };
            if let Some((target, role)) = missing {
                skip(EntityRef::Area(area.id), target, role);
                continue;
            }
            sketch.area_order.push(area.id);
            sketch.areas.insert(area.id, area);
        }

        for text_data in data.texts {
            if !sketch.key_points.contains_key(&text_data.key_point) {
                skip(EntityRef::Text(text_data.id), text_data.key_point, "key point");
                continue;
            }
            let text = Text::from(text_data);
            sketch.text_order.push(text.id);
            sketch.texts.insert(text.id, text);
        }

        for instance_data in data.instances {
            if !sketch.key_points.contains_key(&instance_data.offset) {
                skip(EntityRef::SketchInstance(instance_data.id), instance_data.offset, "offset");
                continue;
            }
            let instance = SketchInstance::from(instance_data);
            sketch.instance_order.push(instance.id);
            sketch.instances.insert(instance.id, instance);
        }

        // Pass two: parameter bindings
        for (kp, axis, param) in axis_bindings {
            if params.get(param).is_none() {
                skip(EntityRef::KeyPoint(kp), param, &format!("{} axis", axis.name()));
                continue;
            }
            if let Some(point) = sketch.key_points.get_mut(&kp) {
                point.bind(axis, Some(param));
            }
            sketch.index_binding(param, Binding::KeyPointAxis { key_point: kp, axis });
        }
        for (edge, name, param) in meta_bindings {
            if params.get(param).is_none() {
                skip(EntityRef::Edge(edge), param, &format!("meta-data '{}'", name));
                continue;
            }
            if let Some(e) = sketch.edges.get_mut(&edge) {
                e.bind_meta(&name, Some(param));
            }
            sketch.index_binding(param, Binding::EdgeMeta { edge, name });
        }

        // Cached values follow the parameters as they are now
        let current: Vec<ParameterChange> = sketch
            .bindings
            .keys()
            .filter_map(|p| {
                params.value(*p).map(|v| ParameterChange {
                    parameter: *p,
                    instance: None,
                    old: v,
                    new: v,
                })
            })
            .collect();
        sketch.apply_parameter_changes(params, &current);
        sketch.events.drain();

        sketch.edge_counter = data.edge_counter.max(sketch.edges.len() + 1);
        sketch
    }
}

/// Serialized form of a sketch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SketchData {
    pub id: Uuid,
    pub name: String,
    pub scope: Uuid,
    #[serde(default)]
    pub settings: SketchSettings,
    #[serde(default)]
    pub key_points: Vec<KeyPointData>,
    #[serde(default)]
    pub edges: Vec<EdgeData>,
    #[serde(default)]
    pub areas: Vec<AreaData>,
    #[serde(default)]
    pub texts: Vec<TextData>,
    #[serde(default)]
    pub instances: Vec<SketchInstanceData>,
    #[serde(default)]
    pub edge_counter: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::PI;

    fn square(sketch: &mut Sketch) -> (Vec<Uuid>, Vec<Uuid>) {
        let kps: Vec<Uuid> = [(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)]
            .iter()
            .map(|(x, y)| sketch.create_key_point(DVec3::new(*x, *y, 0.0)))
            .collect();
        let edges = (0..4)
            .map(|i| sketch.create_line_edge(kps[i], kps[(i + 1) % 4]).unwrap())
            .collect();
        (kps, edges)
    }

    fn deleted(events: &[ChangeEvent], entity: EntityRef) -> bool {
        events
            .iter()
            .any(|e| e.kind == ChangeKind::Deleted && e.object == entity)
    }

    #[test]
    fn test_create_key_point_reuses_coincident() {
        let mut sketch = Sketch::new("S", Uuid::new_v4());
        let a = sketch.create_key_point(DVec3::new(1.0, 1.0, 0.0));
        let b = sketch.create_key_point(DVec3::new(1.05, 0.97, 0.0));
        let c = sketch.create_key_point(DVec3::new(1.2, 1.0, 0.0));

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(sketch.key_point_ids().len(), 2);
    }

    #[test]
    fn test_edge_names_count_up() {
        let mut sketch = Sketch::new("S", Uuid::new_v4());
        let (_, edges) = square(&mut sketch);
        assert_eq!(sketch.edge(edges[0]).unwrap().name(), "Edge1");
        assert_eq!(sketch.edge(edges[3]).unwrap().name(), "Edge4");
        assert_eq!(sketch.edge_by_name("Edge2").unwrap().id, edges[1]);
    }

    #[test]
    fn test_insert_key_point_splits_line() {
        let mut sketch = Sketch::new("S", Uuid::new_v4());
        let (kps, edges) = square(&mut sketch);
        let area = sketch.create_area(edges.clone()).unwrap();

        let mid = sketch.insert_key_point(DVec3::new(0.5, 0.0, 0.0)).unwrap();
        assert_eq!(sketch.edge_ids().len(), 5);
        assert_eq!(sketch.edge(edges[0]).unwrap().key_points(), &[kps[0], mid]);

        let members = sketch.area(area).unwrap().edge_ids();
        assert_eq!(members.len(), 5);
        let added = sketch.edge_ids()[4];
        assert_eq!(members[1], added);
        assert_eq!(sketch.view().area(area).unwrap().key_points().len(), 6);
    }

    #[test]
    fn test_split_edge_keeps_reversed_loop_closed() {
        let mut sketch = Sketch::new("S", Uuid::new_v4());
        let (kps, edges) = square(&mut sketch);
        let (ab, bc, cd, da) = (edges[0], edges[1], edges[2], edges[3]);
        let area = sketch.create_area(vec![da, cd, bc, ab]).unwrap();

        let m = sketch.create_key_point(DVec3::new(0.5, 0.0, 0.0));
        let mb = sketch.split_edge(ab, m).unwrap();

        assert_eq!(sketch.area(area).unwrap().edge_ids(), &[da, cd, bc, mb, ab]);
        let view = sketch.view();
        let area_view = view.area(area).unwrap();
        let corners = area_view.key_points();
        assert_eq!(corners.len(), 6);
        assert_eq!(corners.first(), corners.last());
        assert!(corners.contains(&m));
        assert!(corners.contains(&kps[1]));
        assert!(area_view.inside(DVec3::new(0.5, 0.5, 0.0)));
        assert!(!area_view.inside(DVec3::new(1.5, 0.5, 0.0)));
    }

    #[test]
    fn test_split_first_edge_of_reversed_loop() {
        let mut sketch = Sketch::new("S", Uuid::new_v4());
        let (_, edges) = square(&mut sketch);
        let (ab, bc, cd, da) = (edges[0], edges[1], edges[2], edges[3]);
        let area = sketch.create_area(vec![ab, da, cd, bc]).unwrap();

        let m = sketch.create_key_point(DVec3::new(0.5, 0.0, 0.0));
        let mb = sketch.split_edge(ab, m).unwrap();

        assert_eq!(sketch.area(area).unwrap().edge_ids(), &[mb, ab, da, cd, bc]);
        let view = sketch.view();
        let corners = view.area(area).unwrap().key_points();
        assert_eq!(corners.first(), corners.last());
        assert!(view.area(area).unwrap().inside(DVec3::new(0.25, 0.75, 0.0)));
    }

    #[test]
    fn test_remove_key_point_cascades() {
        let mut sketch = Sketch::new("S", Uuid::new_v4());
        let (kps, edges) = square(&mut sketch);
        let area = sketch.create_area(edges.clone()).unwrap();
        sketch.drain_events();

        sketch.remove_key_point(kps[0]).unwrap();
        let events = sketch.drain_events();

        assert!(sketch.edge(edges[0]).is_none());
        assert!(sketch.edge(edges[3]).is_none());
        assert!(sketch.edge(edges[1]).is_some());
        assert!(sketch.area(area).is_none());
        assert!(deleted(&events, EntityRef::Edge(edges[0])));
        assert!(deleted(&events, EntityRef::Edge(edges[3])));
        assert!(deleted(&events, EntityRef::Area(area)));
        assert!(deleted(&events, EntityRef::KeyPoint(kps[0])));
    }

    #[test]
    fn test_removing_fillet_keeps_area() {
        let mut sketch = Sketch::new("S", Uuid::new_v4());
        let (kps, edges) = square(&mut sketch);
        let area = sketch.create_area(edges).unwrap();
        let fillet = sketch.create_fillet_edge_with_radius(kps[1], 0.1).unwrap();
        assert!(sketch.area(area).unwrap().contains_edge(fillet));

        sketch.remove_edge(fillet).unwrap();
        assert_eq!(sketch.area(area).unwrap().edge_ids().len(), 4);
    }

    #[test]
    fn test_second_fillet_on_corner_is_rejected() {
        let mut sketch = Sketch::new("S", Uuid::new_v4());
        let (kps, _) = square(&mut sketch);
        sketch.create_fillet_edge_with_radius(kps[1], 0.1).unwrap();
        assert!(matches!(
            sketch.create_fillet_edge_with_radius(kps[1], 0.2),
            Err(SketchError::InvalidEdge(_))
        ));
    }

    #[test]
    fn test_arc_ends_follow_radius_parameter() {
        let mut params = ParameterStore::new();
        let radius = params.create(params.root(), Some("r"), 1.0).unwrap();
        let mut sketch = Sketch::new("S", params.root());
        let center = sketch.create_key_point(DVec3::ZERO);
        let arc = sketch.create_arc_edge(center, 0.0, PI / 2.0, 1.0).unwrap();
        sketch.bind_edge_meta(&params, arc, META_RADIUS, radius).unwrap();
        let [start, end] = sketch.edge(arc).unwrap().arc_ends().unwrap();

        let changes = params.set_value(radius, 3.0).unwrap();
        sketch.apply_parameter_changes(&params, &changes);

        assert_relative_eq!(sketch.key_point(start).unwrap().x(), 3.0, epsilon = 1e-12);
        assert_relative_eq!(sketch.key_point(end).unwrap().y(), 3.0, epsilon = 1e-12);

        // Applying the same changes again is a no-op
        sketch.drain_events();
        sketch.apply_parameter_changes(&params, &changes);
        assert!(sketch.events().is_empty());
    }

    #[test]
    fn test_arc_end_is_not_editable() {
        let mut params = ParameterStore::new();
        let mut sketch = Sketch::new("S", params.root());
        let center = sketch.create_key_point(DVec3::ZERO);
        let arc = sketch.create_arc_edge(center, 0.0, PI, 1.0).unwrap();
        let [start, _] = sketch.edge(arc).unwrap().arc_ends().unwrap();

        assert_eq!(
            sketch.set_key_point_axis(&mut params, start, Axis::X, 5.0),
            Err(SketchError::NotEditable(start))
        );

        // Moving the center moves the arc ends
        sketch.set_key_point_axis(&mut params, center, Axis::X, 2.0).unwrap();
        assert_relative_eq!(sketch.key_point(start).unwrap().x(), 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_reused_arc_end_keeps_bound_axis() {
        let mut params = ParameterStore::new();
        let x = params.create(params.root(), Some("x"), 1.0).unwrap();
        let mut sketch = Sketch::new("S", params.root());
        let center = sketch.create_key_point(DVec3::ZERO);
        let corner = sketch.create_key_point(DVec3::new(1.0, 0.0, 0.0));
        sketch.bind_key_point_axis(&params, corner, Axis::X, x).unwrap();
        let arc = sketch.create_arc_edge(center, 0.0, PI / 2.0, 1.0).unwrap();
        assert_eq!(sketch.edge(arc).unwrap().arc_ends().unwrap()[0], corner);

        sketch.set_edge_meta(&mut params, arc, META_RADIUS, 2.0).unwrap();
        sketch.set_edge_meta(&mut params, arc, META_START_ANGLE, PI / 4.0).unwrap();

        let point = sketch.key_point(corner).unwrap();
        assert_eq!(point.parameter(Axis::X), Some(x));
        assert_eq!(point.x(), 1.0);
        assert_relative_eq!(point.y(), 2.0_f64.sqrt(), epsilon = 1e-12);
        assert_eq!(params.value(x), Some(1.0));
    }

    #[test]
    fn test_bound_axis_writes_through() {
        let mut params = ParameterStore::new();
        let width = params.create(params.root(), Some("width"), 2.0).unwrap();
        let half = params.create(params.root(), Some("half"), 0.0).unwrap();
        params.set_formula(half, "width / 2").unwrap();

        let mut sketch = Sketch::new("S", params.root());
        let a = sketch.create_key_point(DVec3::ZERO);
        let b = sketch.create_key_point(DVec3::new(5.0, 0.0, 0.0));
        sketch.bind_key_point_axis(&params, a, Axis::X, width).unwrap();
        sketch.bind_key_point_axis(&params, b, Axis::X, half).unwrap();
        assert_eq!(sketch.key_point(b).unwrap().x(), 1.0);

        let changes = sketch.set_key_point_axis(&mut params, a, Axis::X, 8.0).unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(params.value(width), Some(8.0));
        assert_eq!(sketch.key_point(a).unwrap().x(), 8.0);
        assert_eq!(sketch.key_point(b).unwrap().x(), 4.0);
    }

    #[test]
    fn test_unbound_instance_override() {
        let mut params = ParameterStore::new();
        let mut sketch = Sketch::new("S", params.root());
        let kp = sketch.create_key_point(DVec3::ZERO);
        let instance = Uuid::new_v4();

        sketch
            .set_key_point_instance(&mut params, kp, instance, Axis::Y, 2.0)
            .unwrap();
        let view = sketch.view().for_instance(Some(instance));
        assert_eq!(view.position(kp), Some(DVec3::new(0.0, 2.0, 0.0)));
        assert_eq!(sketch.key_point(kp).unwrap().y(), 0.0);
    }

    #[test]
    fn test_parameter_deletion_releases_bindings() {
        let mut params = ParameterStore::new();
        let x = params.create(params.root(), Some("x"), 4.0).unwrap();
        let mut sketch = Sketch::new("S", params.root());
        let kp = sketch.create_key_point(DVec3::ZERO);
        sketch.bind_key_point_axis(&params, kp, Axis::X, x).unwrap();

        params.delete(x).unwrap();
        sketch.on_parameter_deleted(x);

        let point = sketch.key_point(kp).unwrap();
        assert_eq!(point.parameter(Axis::X), None);
        assert_eq!(point.x(), 4.0);
        assert!(sketch.bindings(x).is_empty());
    }

    #[test]
    fn test_area_names_are_unique() {
        let mut sketch = Sketch::new("S", Uuid::new_v4());
        let (_, edges) = square(&mut sketch);
        let a = sketch.create_area(edges.clone()).unwrap();
        let b = sketch.create_area(edges.clone()).unwrap();
        let c = sketch.create_area(edges).unwrap();

        assert_eq!(sketch.area(a).unwrap().name(), "New Area");
        assert_eq!(sketch.area(b).unwrap().name(), "New Area1");
        assert_eq!(sketch.area(c).unwrap().name(), "New Area2");
    }

    #[test]
    fn test_create_all_areas_replaces_and_adds_circles() {
        let mut sketch = Sketch::new("S", Uuid::new_v4());
        let (_, edges) = square(&mut sketch);
        let manual = sketch.create_area(vec![edges[0]]).unwrap();
        let center = sketch.create_key_point(DVec3::new(5.0, 5.0, 0.0));
        sketch.create_circle_edge_with_radius(center, 1.0).unwrap();

        let created = sketch.create_all_areas().unwrap();
        assert_eq!(created.len(), 2);
        assert!(sketch.area(manual).is_none());
        assert_eq!(sketch.area_ids(), created.as_slice());
    }

    #[test]
    fn test_remove_area_cascades_to_composites() {
        let mut sketch = Sketch::new("S", Uuid::new_v4());
        let (_, edges) = square(&mut sketch);
        let outer = sketch.create_area(edges).unwrap();
        let center = sketch.create_key_point(DVec3::new(0.5, 0.5, 0.0));
        let circle = sketch.create_circle_edge_with_radius(center, 0.2).unwrap();
        let hole = sketch.create_area(vec![circle]).unwrap();
        let composite = sketch.create_composite_area(outer, &[hole]).unwrap();

        sketch.remove_edge(circle).unwrap();
        assert!(sketch.area(hole).is_none());
        assert!(sketch.area(composite).is_none());
        assert!(sketch.area(outer).is_some());
    }

    #[test]
    fn test_insert_area_edge_position() {
        let mut sketch = Sketch::new("S", Uuid::new_v4());
        let (kps, edges) = square(&mut sketch);
        let area = sketch.create_area(vec![edges[0], edges[1], edges[2]]).unwrap();
        // d -> a closes the loop; d sits at loop position 3
        sketch.insert_area_edge(area, edges[3]).unwrap();
        assert_eq!(sketch.area(area).unwrap().edge_ids()[3], edges[3]);
        assert_eq!(sketch.view().area(area).unwrap().key_points().first(), Some(&kps[0]));
    }

    #[test]
    fn test_limits() {
        let mut sketch = Sketch::new("S", Uuid::new_v4());
        assert!(sketch.limits().is_none());
        sketch.create_key_point(DVec3::new(-1.0, 2.0, 0.0));
        sketch.create_key_point(DVec3::new(3.0, -4.0, 0.0));
        let (lo, hi) = sketch.limits().unwrap();
        assert_eq!(lo, DVec2::new(-1.0, -4.0));
        assert_eq!(hi, DVec2::new(3.0, 2.0));
    }

    #[test]
    fn test_texts_and_attributes() {
        let mut sketch = Sketch::new("S", Uuid::new_v4());
        let kp = sketch.create_key_point(DVec3::ZERO);
        let label = sketch.create_text(kp, "Plate", 0.2).unwrap();
        let thread = sketch.create_attribute(kp, "Thread", "M8", 0.1).unwrap();
        sketch.drain_events();

        sketch.set_text_value(thread, "M10").unwrap();
        sketch.set_text_value(thread, "M10").unwrap();
        let events = sketch.drain_events();
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].detail,
            ChangeDetail::Renamed {
                old: "M8".to_string(),
                new: "M10".to_string()
            }
        );

        assert_eq!(sketch.text(thread).unwrap().name(), "Thread");
        assert_eq!(
            sketch.rename_attribute(label, "Title"),
            Err(SketchError::NotAnAttribute(label))
        );
        assert!(matches!(
            sketch.create_text(Uuid::new_v4(), "x", 0.1),
            Err(SketchError::KeyPointNotFound(_))
        ));
    }

    #[test]
    fn test_anchored_key_points_are_referenced() {
        let mut sketch = Sketch::new("S", Uuid::new_v4());
        let text_anchor = sketch.create_key_point(DVec3::ZERO);
        let offset = sketch.create_key_point(DVec3::new(5.0, 0.0, 0.0));
        sketch.create_key_point(DVec3::new(9.0, 0.0, 0.0));
        sketch.create_text(text_anchor, "Note", 0.1).unwrap();
        sketch.create_sketch_instance(Uuid::new_v4(), "Bolt", offset).unwrap();

        assert_eq!(sketch.remove_unreferenced_key_points(), 1);
        assert_eq!(sketch.key_point_ids(), &[text_anchor, offset]);
    }

    #[test]
    fn test_remove_key_point_cascades_to_annotations() {
        let mut sketch = Sketch::new("S", Uuid::new_v4());
        let kp = sketch.create_key_point(DVec3::ZERO);
        let text = sketch.create_text(kp, "Note", 0.1).unwrap();
        let instance = sketch.create_sketch_instance(Uuid::new_v4(), "Bolt", kp).unwrap();
        sketch.drain_events();

        sketch.remove_key_point(kp).unwrap();
        let events = sketch.drain_events();

        assert!(sketch.text(text).is_none());
        assert!(sketch.sketch_instance(instance).is_none());
        assert!(deleted(&events, EntityRef::Text(text)));
        assert!(deleted(&events, EntityRef::SketchInstance(instance)));
    }

    #[test]
    fn test_sketch_instance_settings() {
        let mut sketch = Sketch::new("S", Uuid::new_v4());
        let a = sketch.create_key_point(DVec3::ZERO);
        let b = sketch.create_key_point(DVec3::new(1.0, 0.0, 0.0));
        let inserted = Uuid::new_v4();
        let instance = sketch.create_sketch_instance(inserted, "Bolt", a).unwrap();

        sketch.set_instance_scale(instance, 2.5).unwrap();
        sketch.set_instance_offset(instance, b).unwrap();
        let placed = sketch.sketch_instance(instance).unwrap();
        assert_eq!(placed.scale(), 2.5);
        assert_eq!(placed.offset(), b);
        assert_eq!(sketch.inserted_sketches().collect::<Vec<_>>(), vec![inserted]);

        assert!(matches!(
            sketch.set_instance_scale(instance, 0.0),
            Err(SketchError::InvalidInstance(_))
        ));
        assert!(matches!(
            sketch.create_sketch_instance(sketch.id, "Self", a),
            Err(SketchError::InvalidInstance(_))
        ));
        assert_eq!(sketch.remove_instances_of(inserted), vec![instance]);
        assert_eq!(sketch.sketch_instance_ids().len(), 0);
    }

    #[test]
    fn test_data_round_trip_with_annotations() {
        let params = ParameterStore::new();
        let mut sketch = Sketch::new("S", params.root());
        let kp = sketch.create_key_point(DVec3::ZERO);
        let spare = sketch.create_key_point(DVec3::new(3.0, 0.0, 0.0));
        let text = sketch.create_attribute(kp, "Thread", "M8", 0.1).unwrap();
        sketch
            .set_text_alignment(text, VerticalAlignment::Top, HorizontalAlignment::Left)
            .unwrap();
        let kept = sketch.create_sketch_instance(Uuid::new_v4(), "Kept", kp).unwrap();
        let lost = sketch.create_sketch_instance(Uuid::new_v4(), "Lost", spare).unwrap();

        let mut data = sketch.to_data();
        data.key_points.retain(|k| k.id != spare);
        let encoded = ron::ser::to_string_pretty(&data, ron::ser::PrettyConfig::default()).unwrap();
        let decoded: SketchData = ron::from_str(&encoded).unwrap();

        let mut report = LoadReport::default();
        let loaded = Sketch::from_data(decoded, &params, &mut report);

        assert_eq!(loaded.text(text), sketch.text(text));
        assert_eq!(loaded.sketch_instance(kept), sketch.sketch_instance(kept));
        assert!(loaded.sketch_instance(lost).is_none());
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].owner, EntityRef::SketchInstance(lost));
        assert_eq!(report.skipped[0].role, "offset");
    }

    #[test]
    fn test_data_round_trip_with_dangling_binding() {
        let mut params = ParameterStore::new();
        let x = params.create(params.root(), Some("x"), 2.0).unwrap();
        let gone = params.create(params.root(), Some("gone"), 1.0).unwrap();
        let mut sketch = Sketch::new("S", params.root());
        let (kps, edges) = square(&mut sketch);
        sketch.create_area(edges).unwrap();
        sketch.bind_key_point_axis(&params, kps[1], Axis::X, x).unwrap();
        sketch.bind_key_point_axis(&params, kps[2], Axis::X, gone).unwrap();

        let data = sketch.to_data();
        params.delete(gone).unwrap();
        params.set_value(x, 3.0).unwrap();

        let mut report = LoadReport::default();
        let loaded = Sketch::from_data(data, &params, &mut report);

        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].target, gone);
        assert_eq!(loaded.id, sketch.id);
        assert_eq!(loaded.area_ids().len(), 1);
        assert_eq!(loaded.key_point(kps[1]).unwrap().parameter(Axis::X), Some(x));
        assert_eq!(loaded.key_point(kps[1]).unwrap().x(), 3.0);
        assert_eq!(loaded.key_point(kps[2]).unwrap().parameter(Axis::X), None);
        assert_eq!(loaded.key_point(kps[0]).unwrap().edges().len(), 2);
        assert!(loaded.events().is_empty());

        // Names keep counting from where they were
        let mut loaded = loaded;
        let e = loaded.create_line_edge(kps[0], kps[2]).unwrap();
        assert_eq!(loaded.edge(e).unwrap().name(), "Edge5");
    }
}
