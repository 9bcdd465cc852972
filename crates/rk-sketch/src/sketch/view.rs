//! Read-only geometric access to a sketch

use glam::DVec3;
use uuid::Uuid;

use super::Sketch;
use super::area::AreaView;
use super::edge::{Edge, EdgeView};
use crate::parameter::ParameterStore;

/// A sketch seen either with its base geometry or through one instance.
///
/// Base queries read the cached positions and meta-data of the sketch.
/// Instance queries additionally read parameter instance values, so they
/// need the parameter store.
#[derive(Debug, Clone, Copy)]
pub struct SketchView<'a> {
    sketch: &'a Sketch,
    params: Option<&'a ParameterStore>,
    instance: Option<Uuid>,
}

impl<'a> SketchView<'a> {
    /// View of the base geometry
    pub fn new(sketch: &'a Sketch) -> Self {
        Self {
            sketch,
            params: None,
            instance: None,
        }
    }

    /// View with access to parameter values
    pub fn with_parameters(sketch: &'a Sketch, params: &'a ParameterStore) -> Self {
        Self {
            sketch,
            params: Some(params),
            instance: None,
        }
    }

    /// The same view seen through an instance
    pub fn for_instance(self, instance: Option<Uuid>) -> Self {
        Self { instance, ..self }
    }

    pub fn sketch(&self) -> &'a Sketch {
        self.sketch
    }

    pub fn instance(&self) -> Option<Uuid> {
        self.instance
    }

    /// Position of a key point
    pub fn position(&self, kp: Uuid) -> Option<DVec3> {
        self.sketch
            .key_point(kp)
            .map(|p| p.instance_position(self.instance, self.params))
    }

    /// Meta-data value of an edge, read from the bound parameter for an instance
    pub fn meta(&self, edge: &Edge, name: &str) -> Option<f64> {
        if let Some(instance) = self.instance
            && let Some(param) = edge.meta_parameter(name)
            && let Some(value) = self.params.and_then(|p| p.instance_value(param, Some(instance)))
        {
            return Some(value);
        }
        edge.meta(name)
    }

    /// Get an edge for geometric queries
    pub fn edge(&self, id: Uuid) -> Option<EdgeView<'a>> {
        self.sketch.edge(id).map(|e| EdgeView::new(*self, e))
    }

    /// Get an area for geometric queries
    pub fn area(&self, id: Uuid) -> Option<AreaView<'a>> {
        self.sketch.area(id).map(|a| AreaView::new(*self, a))
    }

    /// All edges in creation order
    pub fn edges(&self) -> impl Iterator<Item = EdgeView<'a>> + '_ {
        self.sketch.edge_ids().iter().filter_map(move |id| self.edge(*id))
    }

    /// Nearest edge to `point` within `threshold`
    pub fn edge_at(&self, point: DVec3, threshold: f64) -> Option<Uuid> {
        self.edges()
            .map(|e| (e.edge().id, e.distance(point)))
            .filter(|(_, d)| *d < threshold)
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(id, _)| id)
    }

    /// First area containing `point`
    pub fn area_at(&self, point: DVec3) -> Option<Uuid> {
        self.sketch
            .area_ids()
            .iter()
            .find(|id| self.area(**id).is_some_and(|a| a.inside(point)))
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Axis;

    #[test]
    fn test_instance_view_reads_parameters() {
        let mut params = ParameterStore::new();
        let mut sketch = Sketch::new("S", params.root());
        let x = params.create(params.root(), Some("x"), 1.0).unwrap();
        let kp = sketch.create_key_point(DVec3::new(1.0, 0.0, 0.0));
        sketch.bind_key_point_axis(&params, kp, Axis::X, x).unwrap();

        let instance = Uuid::new_v4();
        params.set_instance_value(x, instance, 4.0).unwrap();

        let base = SketchView::with_parameters(&sketch, &params);
        assert_eq!(base.position(kp).unwrap().x, 1.0);
        assert_eq!(base.for_instance(Some(instance)).position(kp).unwrap().x, 4.0);
        // Without parameters the instance falls back to cached values
        assert_eq!(sketch.view().for_instance(Some(instance)).position(kp).unwrap().x, 1.0);
    }

    #[test]
    fn test_edge_at_picks_nearest() {
        let mut sketch = Sketch::new("S", Uuid::new_v4());
        let a = sketch.create_key_point(DVec3::ZERO);
        let b = sketch.create_key_point(DVec3::new(1.0, 0.0, 0.0));
        let c = sketch.create_key_point(DVec3::new(0.0, 1.0, 0.0));
        let ab = sketch.create_line_edge(a, b).unwrap();
        let ac = sketch.create_line_edge(a, c).unwrap();
        let view = sketch.view();

        assert_eq!(view.edge_at(DVec3::new(0.5, 0.02, 0.0), 0.1), Some(ab));
        assert_eq!(view.edge_at(DVec3::new(0.03, 0.5, 0.0), 0.1), Some(ac));
        assert_eq!(view.edge_at(DVec3::new(0.5, 0.5, 0.0), 0.1), None);
    }
}
