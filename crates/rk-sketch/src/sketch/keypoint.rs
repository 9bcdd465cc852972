//! Sketch key points

use glam::DVec3;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::geometry::Axis;
use crate::parameter::ParameterStore;

/// A point in sketch space whose coordinates may be bound to parameters.
///
/// The cached `position` always holds the current base value; for a bound
/// axis it is refreshed from the parameter whenever the parameter changes.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyPoint {
    /// Unique identifier
    pub id: Uuid,
    position: DVec3,
    /// Parameter bound to each axis, indexed by [`Axis::index`]
    params: [Option<Uuid>; 3],
    /// Full vertex overrides per instance, for axes without a parameter
    instances: HashMap<Uuid, DVec3>,
    /// Incident edges in connection order
    edges: Vec<Uuid>,
    editable: bool,
}

impl KeyPoint {
    pub fn new(position: DVec3) -> Self {
        Self {
            id: Uuid::new_v4(),
            position,
            params: [None; 3],
            instances: HashMap::new(),
            edges: Vec::new(),
            editable: true,
        }
    }

    /// Base position
    pub fn position(&self) -> DVec3 {
        self.position
    }

    pub fn x(&self) -> f64 {
        self.position.x
    }

    pub fn y(&self) -> f64 {
        self.position.y
    }

    pub fn z(&self) -> f64 {
        self.position.z
    }

    /// Position seen by an instance.
    ///
    /// Bound axes read the parameter's instance value, other axes read the
    /// instance override, falling back to the base position.
    pub fn instance_position(&self, instance: Option<Uuid>, params: Option<&ParameterStore>) -> DVec3 {
        let Some(instance) = instance else {
            return self.position;
        };
        let mut out = self.instances.get(&instance).copied().unwrap_or(self.position);
        for axis in Axis::ALL {
            if let Some(param) = self.params[axis.index()]
                && let Some(value) = params.and_then(|p| p.instance_value(param, Some(instance)))
            {
                axis.set(&mut out, value);
            }
        }
        out
    }

    /// Parameter bound to an axis
    pub fn parameter(&self, axis: Axis) -> Option<Uuid> {
        self.params[axis.index()]
    }

    /// All axis bindings
    pub fn parameters(&self) -> impl Iterator<Item = (Axis, Uuid)> + '_ {
        Axis::ALL
            .into_iter()
            .filter_map(|axis| self.params[axis.index()].map(|p| (axis, p)))
    }

    /// Incident edge IDs
    pub fn edges(&self) -> &[Uuid] {
        &self.edges
    }

    /// Check if the point can be edited directly
    pub fn editable(&self) -> bool {
        self.editable
    }

    /// Instance overrides
    pub fn instance_overrides(&self) -> impl Iterator<Item = (&Uuid, &DVec3)> {
        self.instances.iter()
    }

    // ============== Crate-internal mutation ==============

    /// Write one base coordinate, returning the previous value
    pub(crate) fn set_axis(&mut self, axis: Axis, value: f64) -> f64 {
        let old = axis.get(self.position);
        axis.set(&mut self.position, value);
        old
    }

    pub(crate) fn set_position(&mut self, position: DVec3) {
        self.position = position;
    }

    pub(crate) fn bind(&mut self, axis: Axis, param: Option<Uuid>) {
        self.params[axis.index()] = param;
    }

    pub(crate) fn set_editable(&mut self, editable: bool) {
        self.editable = editable;
    }

    /// Store an instance coordinate for an unbound axis.
    ///
    /// The override is dropped when it equals the base position on every axis.
    /// Returns the previous instance value of the axis.
    pub(crate) fn set_instance_axis(&mut self, instance: Uuid, axis: Axis, value: f64) -> f64 {
        let mut vertex = self.instances.get(&instance).copied().unwrap_or(self.position);
        let old = axis.get(vertex);
        axis.set(&mut vertex, value);
        if vertex == self.position {
            self.instances.remove(&instance);
        } else {
            self.instances.insert(instance, vertex);
        }
        old
    }

    pub(crate) fn add_edge(&mut self, edge: Uuid) {
        if !self.edges.contains(&edge) {
            self.edges.push(edge);
        }
    }

    pub(crate) fn remove_edge(&mut self, edge: Uuid) {
        self.edges.retain(|e| *e != edge);
    }

    /// Drop every binding to a parameter, keeping the last value as literal
    pub(crate) fn unbind_parameter(&mut self, param: Uuid) -> bool {
        let mut found = false;
        for slot in self.params.iter_mut() {
            if *slot == Some(param) {
                *slot = None;
                found = true;
            }
        }
        found
    }
}

/// Serialized form of a key point
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyPointData {
    pub id: Uuid,
    pub position: DVec3,
    #[serde(default)]
    pub params: [Option<Uuid>; 3],
    #[serde(default)]
    pub instances: Vec<(Uuid, DVec3)>,
    #[serde(default = "default_editable")]
    pub editable: bool,
}

fn default_editable() -> bool {
    true
}

impl From<&KeyPoint> for KeyPointData {
    fn from(kp: &KeyPoint) -> Self {
        let mut instances: Vec<(Uuid, DVec3)> =
            kp.instances.iter().map(|(i, v)| (*i, *v)).collect();
        instances.sort_by_key(|(i, _)| *i);
        Self {
            id: kp.id,
            position: kp.position,
            params: kp.params,
            instances,
            editable: kp.editable,
        }
    }
}

impl From<KeyPointData> for KeyPoint {
    /// Bindings are restored separately once parameters are known to exist
    fn from(data: KeyPointData) -> Self {
        Self {
            id: data.id,
            position: data.position,
            params: [None; 3],
            instances: data.instances.into_iter().collect(),
            edges: Vec::new(),
            editable: data.editable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_override_is_pruned() {
        let mut kp = KeyPoint::new(DVec3::new(1.0, 2.0, 0.0));
        let instance = Uuid::new_v4();

        assert_eq!(kp.set_instance_axis(instance, Axis::X, 5.0), 1.0);
        assert_eq!(kp.instance_position(Some(instance), None), DVec3::new(5.0, 2.0, 0.0));
        assert_eq!(kp.instance_position(None, None), DVec3::new(1.0, 2.0, 0.0));

        kp.set_instance_axis(instance, Axis::X, 1.0);
        assert_eq!(kp.instance_overrides().count(), 0);
    }

    #[test]
    fn test_bound_axis_reads_parameter_instance() {
        let mut params = ParameterStore::new();
        let width = params.create(params.root(), Some("w"), 3.0).unwrap();
        let instance = Uuid::new_v4();
        params.set_instance_value(width, instance, 8.0).unwrap();

        let mut kp = KeyPoint::new(DVec3::new(3.0, 0.0, 0.0));
        kp.bind(Axis::X, Some(width));

        assert_eq!(kp.instance_position(Some(instance), Some(&params)).x, 8.0);
        assert!(kp.unbind_parameter(width));
        assert_eq!(kp.parameter(Axis::X), None);
    }

    #[test]
    fn test_data_drops_runtime_links() {
        let mut kp = KeyPoint::new(DVec3::ONE);
        kp.add_edge(Uuid::new_v4());
        kp.set_editable(false);

        let restored = KeyPoint::from(KeyPointData::from(&kp));
        assert_eq!(restored.id, kp.id);
        assert!(restored.edges().is_empty());
        assert!(!restored.editable());
    }
}
