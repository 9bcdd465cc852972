//! Sketches inserted into other sketches
//!
//! A [`SketchInstance`] places another sketch at a key point of the host,
//! scaled uniformly. Its ID doubles as the parameter instance ID, so the
//! inserted sketch's parameters can take per-instance values.

use glam::DVec3;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::view::SketchView;

/// Placement of an inserted sketch
#[derive(Debug, Clone, PartialEq)]
pub struct SketchInstance {
    /// Unique identifier, also used as the parameter instance
    pub id: Uuid,
    name: String,
    sketch: Uuid,
    offset: Uuid,
    scale: f64,
    current_standard: Option<String>,
    current_type: Option<String>,
}

impl SketchInstance {
    pub(crate) fn new(name: impl Into<String>, sketch: Uuid, offset: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            sketch,
            offset,
            scale: 1.0,
            current_standard: None,
            current_type: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Inserted sketch
    pub fn sketch(&self) -> Uuid {
        self.sketch
    }

    /// Host key point the inserted origin sits on
    pub fn offset(&self) -> Uuid {
        self.offset
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Standard of the last preset type applied to this instance
    pub fn current_standard(&self) -> Option<&str> {
        self.current_standard.as_deref()
    }

    /// Last preset type applied to this instance
    pub fn current_type(&self) -> Option<&str> {
        self.current_type.as_deref()
    }

    pub(crate) fn set_name(&mut self, name: String) -> String {
        std::mem::replace(&mut self.name, name)
    }

    pub(crate) fn set_offset(&mut self, offset: Uuid) {
        self.offset = offset;
    }

    pub(crate) fn set_scale(&mut self, scale: f64) -> f64 {
        std::mem::replace(&mut self.scale, scale)
    }

    pub(crate) fn set_current_type(&mut self, standard: Option<String>, type_name: Option<String>) {
        self.current_standard = standard;
        self.current_type = type_name;
    }
}

/// Serialized form of a sketch instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SketchInstanceData {
    pub id: Uuid,
    pub name: String,
    pub sketch: Uuid,
    pub offset: Uuid,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub current_standard: Option<String>,
    #[serde(default)]
    pub current_type: Option<String>,
}

fn default_scale() -> f64 {
    1.0
}

impl From<&SketchInstance> for SketchInstanceData {
    fn from(instance: &SketchInstance) -> Self {
        Self {
            id: instance.id,
            name: instance.name.clone(),
            sketch: instance.sketch,
            offset: instance.offset,
            scale: instance.scale,
            current_standard: instance.current_standard.clone(),
            current_type: instance.current_type.clone(),
        }
    }
}

impl From<SketchInstanceData> for SketchInstance {
    fn from(data: SketchInstanceData) -> Self {
        Self {
            id: data.id,
            name: data.name,
            sketch: data.sketch,
            offset: data.offset,
            scale: data.scale,
            current_standard: data.current_standard,
            current_type: data.current_type,
        }
    }
}

/// An inserted sketch seen from its host.
///
/// Geometry is read through the instance, so parameter instance values and
/// vertex overrides apply, then mapped into host coordinates.
#[derive(Debug, Clone, Copy)]
pub struct InstanceView<'a> {
    view: SketchView<'a>,
    origin: DVec3,
    scale: f64,
}

impl<'a> InstanceView<'a> {
    /// `origin` is the host position of the offset key point
    pub fn new(view: SketchView<'a>, origin: DVec3, scale: f64) -> Self {
        Self { view, origin, scale }
    }

    /// The inserted sketch in its own coordinates
    pub fn view(&self) -> SketchView<'a> {
        self.view
    }

    pub fn origin(&self) -> DVec3 {
        self.origin
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn to_host(&self, local: DVec3) -> DVec3 {
        self.origin + local * self.scale
    }

    pub fn to_local(&self, host: DVec3) -> DVec3 {
        (host - self.origin) / self.scale
    }

    /// Host position of an inserted key point
    pub fn position(&self, kp: Uuid) -> Option<DVec3> {
        self.view.position(kp).map(|p| self.to_host(p))
    }

    /// First inserted area containing a host point
    pub fn area_at(&self, host: DVec3) -> Option<Uuid> {
        self.view.area_at(self.to_local(host))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sketch::Sketch;

    #[test]
    fn test_view_maps_into_host() {
        let mut sketch = Sketch::new("Inserted", Uuid::new_v4());
        let kps: Vec<Uuid> = [(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)]
            .iter()
            .map(|(x, y)| sketch.create_key_point(DVec3::new(*x, *y, 0.0)))
            .collect();
        for i in 0..4 {
            sketch.create_line_edge(kps[i], kps[(i + 1) % 4]).unwrap();
        }
        let area = sketch.create_all_areas().unwrap()[0];

        let view = InstanceView::new(sketch.view(), DVec3::new(10.0, 5.0, 0.0), 2.0);
        assert_eq!(view.position(kps[2]), Some(DVec3::new(12.0, 7.0, 0.0)));
        assert_eq!(view.to_local(DVec3::new(11.0, 6.0, 0.0)), DVec3::new(0.5, 0.5, 0.0));
        assert_eq!(view.area_at(DVec3::new(11.0, 6.0, 0.0)), Some(area));
        assert_eq!(view.area_at(DVec3::new(0.5, 0.5, 0.0)), None);
    }

    #[test]
    fn test_data_defaults_scale() {
        let json = format!(
            r#"{{"id":"{}","name":"Bolt","sketch":"{}","offset":"{}"}}"#,
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4()
        );
        let instance = SketchInstance::from(serde_json::from_str::<SketchInstanceData>(&json).unwrap());
        assert_eq!(instance.scale(), 1.0);
        assert_eq!(instance.current_type(), None);
    }
}
