//! Document container and persistence
//!
//! A [`Document`] owns the parameter store and every sketch. All mutations
//! that can affect more than one arena go through it: parameter changes are
//! routed to the binding index of each sketch, and the events queued by the
//! arenas are published on the document's [`EventBus`] before the call
//! returns.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::event::{ChangeEvent, ChangeKind, EntityRef, EventBus, EventBusConfig, EventFilter, EventQueue, SubscriptionId};
use crate::geometry::Axis;
use crate::parameter::{ParameterChange, ParameterError, ParameterStore, ScopeData};
use crate::sketch::{InstanceView, Sketch, SketchData, SketchError, SketchResult, SketchSettings};

/// Current document format version
pub const DOCUMENT_VERSION: u32 = 1;

/// Document-level errors
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Serialization error: {0}")]
    Serialize(String),
    #[error("Deserialization error: {0}")]
    Deserialize(String),
    #[error("Sketch not found: {0}")]
    SketchNotFound(Uuid),
    #[error("Inserting sketch {inserted} into {host} would make it contain itself")]
    InstanceCycle { host: Uuid, inserted: Uuid },
    #[error(transparent)]
    Sketch(#[from] SketchError),
    #[error(transparent)]
    Parameter(#[from] ParameterError),
}

pub type DocumentResult<T> = Result<T, DocumentError>;

/// A reference that could not be resolved while loading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DanglingReference {
    /// Entity holding the reference
    pub owner: EntityRef,
    /// Missing target
    pub target: Uuid,
    /// What the reference was used for
    pub role: String,
}

/// Outcome of a load
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    /// References dropped because their target does not exist
    pub skipped: Vec<DanglingReference>,
}

impl LoadReport {
    /// Check whether the load resolved every reference
    pub fn is_clean(&self) -> bool {
        self.skipped.is_empty()
    }
}

/// Document handle shared between threads. Writers take the write lock for
/// the whole mutation, so listeners never observe a half-applied change.
pub type SharedDocument = Arc<RwLock<Document>>;

/// Parameters and sketches of one design
#[derive(Debug)]
pub struct Document {
    pub name: String,
    params: ParameterStore,
    sketches: HashMap<Uuid, Sketch>,
    sketch_order: Vec<Uuid>,
    bus: EventBus,
    events: EventQueue,
    load_report: LoadReport,
}

impl Default for Document {
    fn default() -> Self {
        Self::new("Untitled")
    }
}

impl Document {
    /// Create an empty document
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_bus_config(name, EventBusConfig::default())
    }

    /// Create an empty document with a configured event bus
    pub fn with_bus_config(name: impl Into<String>, config: EventBusConfig) -> Self {
        Self {
            name: name.into(),
            params: ParameterStore::new(),
            sketches: HashMap::new(),
            sketch_order: Vec::new(),
            bus: EventBus::with_config(config),
            events: EventQueue::new(),
            load_report: LoadReport::default(),
        }
    }

    /// Wrap the document for multi-threaded hosts
    pub fn into_shared(self) -> SharedDocument {
        Arc::new(RwLock::new(self))
    }

    pub fn params(&self) -> &ParameterStore {
        &self.params
    }

    /// Global scope ID
    pub fn root_scope(&self) -> Uuid {
        self.params.root()
    }

    /// Report of the load that produced this document
    pub fn load_report(&self) -> &LoadReport {
        &self.load_report
    }

    // ============== Events ==============

    /// Subscribe to published events
    pub fn subscribe<F>(&mut self, filter: EventFilter, handler: F) -> SubscriptionId
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.bus.subscribe(filter, handler)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id)
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Publish every queued event, parameters first, then sketches in
    /// creation order, then the document's own events
    pub fn flush(&mut self) -> usize {
        let mut events = self.params.drain_events();
        for id in &self.sketch_order {
            if let Some(sketch) = self.sketches.get_mut(id) {
                events.extend(sketch.drain_events());
            }
        }
        events.extend(self.events.drain());
        let count = events.len();
        self.bus.publish_all(events);
        count
    }

    /// Route parameter changes to every sketch except `skip`
    fn dispatch(&mut self, changes: &[ParameterChange], skip: Option<Uuid>) {
        if changes.is_empty() {
            return;
        }
        for id in &self.sketch_order {
            if Some(*id) == skip {
                continue;
            }
            if let Some(sketch) = self.sketches.get_mut(id) {
                sketch.apply_parameter_changes(&self.params, changes);
            }
        }
    }

    /// Refresh every bound value from the current parameter values
    fn resync(&mut self) {
        for id in &self.sketch_order {
            let Some(sketch) = self.sketches.get_mut(id) else { continue };
            let current: Vec<ParameterChange> = sketch
                .bound_parameters()
                .filter_map(|p| {
                    self.params.value(p).map(|v| ParameterChange {
                        parameter: p,
                        instance: None,
                        old: v,
                        new: v,
                    })
                })
                .collect();
            sketch.apply_parameter_changes(&self.params, &current);
        }
    }

    // ============== Sketches ==============

    /// Create a sketch with its own child scope of the global scope
    pub fn create_sketch(&mut self, name: impl Into<String>) -> DocumentResult<Uuid> {
        self.create_sketch_with_settings(name, SketchSettings::default())
    }

    pub fn create_sketch_with_settings(
        &mut self,
        name: impl Into<String>,
        settings: SketchSettings,
    ) -> DocumentResult<Uuid> {
        let name = name.into();
        let scope = self.params.create_scope(name.clone(), self.params.root())?;
        let sketch = Sketch::with_settings(name, scope, settings);
        let id = sketch.id;
        tracing::debug!("Created sketch '{}' ({})", sketch.name(), id);
        self.sketch_order.push(id);
        self.sketches.insert(id, sketch);
        self.events
            .push(ChangeEvent::about(EntityRef::Sketch(id), ChangeKind::ObjectAdded));
        self.flush();
        Ok(id)
    }

    /// Remove a sketch together with its scope and every instance of it.
    ///
    /// Other sketches bound to parameters of that scope keep their values
    /// as literals.
    pub fn remove_sketch(&mut self, id: Uuid) -> DocumentResult<Sketch> {
        let sketch = self.sketches.remove(&id).ok_or(DocumentError::SketchNotFound(id))?;
        self.sketch_order.retain(|s| *s != id);

        let owned: Vec<Uuid> = self
            .params
            .scope(sketch.scope())
            .map(|s| s.parameter_ids().to_vec())
            .unwrap_or_default();
        if sketch.scope() != self.params.root() {
            self.params.remove_scope(sketch.scope())?;
        }
        for param in owned {
            for other in self.sketches.values_mut() {
                other.on_parameter_deleted(param);
            }
        }
        for other in self.sketches.values_mut() {
            other.remove_instances_of(id);
        }

        tracing::debug!("Removed sketch '{}' ({})", sketch.name(), id);
        self.events.push(ChangeEvent::deleted(EntityRef::Sketch(id)));
        self.flush();
        Ok(sketch)
    }

    pub fn sketch(&self, id: Uuid) -> Option<&Sketch> {
        self.sketches.get(&id)
    }

    /// Sketches in creation order
    pub fn sketches(&self) -> impl Iterator<Item = &Sketch> {
        self.sketch_order.iter().filter_map(|id| self.sketches.get(id))
    }

    pub fn sketch_ids(&self) -> &[Uuid] {
        &self.sketch_order
    }

    /// Find a sketch by name
    pub fn sketch_by_name(&self, name: &str) -> Option<&Sketch> {
        self.sketches().find(|s| s.name() == name)
    }

    /// Run a mutation on one sketch and publish what it queued.
    ///
    /// The closure gets read access to the parameters, which is enough to
    /// bind and to create parametric edges. Writes that go through to
    /// parameters use the dedicated document methods instead.
    pub fn edit_sketch<T>(
        &mut self,
        id: Uuid,
        edit: impl FnOnce(&mut Sketch, &ParameterStore) -> SketchResult<T>,
    ) -> DocumentResult<T> {
        let sketch = self.sketches.get_mut(&id).ok_or(DocumentError::SketchNotFound(id))?;
        let result = edit(sketch, &self.params);
        self.flush();
        Ok(result?)
    }

    /// Set a key point coordinate, writing through to a bound parameter
    pub fn set_key_point_axis(&mut self, sketch: Uuid, kp: Uuid, axis: Axis, value: f64) -> DocumentResult<()> {
        let target = self
            .sketches
            .get_mut(&sketch)
            .ok_or(DocumentError::SketchNotFound(sketch))?;
        let result = target.set_key_point_axis(&mut self.params, kp, axis, value);
        self.finish_write_through(sketch, result)
    }

    /// Set a key point coordinate for one instance
    pub fn set_key_point_instance(
        &mut self,
        sketch: Uuid,
        kp: Uuid,
        instance: Uuid,
        axis: Axis,
        value: f64,
    ) -> DocumentResult<()> {
        let target = self
            .sketches
            .get_mut(&sketch)
            .ok_or(DocumentError::SketchNotFound(sketch))?;
        let result = target.set_key_point_instance(&mut self.params, kp, instance, axis, value);
        self.finish_write_through(sketch, result)
    }

    /// Set an edge meta-data value, writing through to a bound parameter
    pub fn set_edge_meta(&mut self, sketch: Uuid, edge: Uuid, name: &str, value: f64) -> DocumentResult<()> {
        let target = self
            .sketches
            .get_mut(&sketch)
            .ok_or(DocumentError::SketchNotFound(sketch))?;
        let result = target.set_edge_meta(&mut self.params, edge, name, value);
        self.finish_write_through(sketch, result)
    }

    /// The writing sketch has already applied its changes
    fn finish_write_through(
        &mut self,
        sketch: Uuid,
        result: SketchResult<Vec<ParameterChange>>,
    ) -> DocumentResult<()> {
        match result {
            Ok(changes) => {
                self.dispatch(&changes, Some(sketch));
                self.flush();
                Ok(())
            }
            Err(e) => {
                self.flush();
                Err(e.into())
            }
        }
    }

    // ============== Sketch Instances ==============

    /// Check whether `from` inserts `target`, directly or through nested
    /// instances
    fn inserts(&self, from: Uuid, target: Uuid) -> bool {
        let mut pending = vec![from];
        let mut seen = Vec::new();
        while let Some(current) = pending.pop() {
            if current == target {
                return true;
            }
            if seen.contains(&current) {
                continue;
            }
            seen.push(current);
            if let Some(sketch) = self.sketches.get(&current) {
                pending.extend(sketch.inserted_sketches());
            }
        }
        false
    }

    /// Insert `inserted` into `host` at the host key point `offset`.
    ///
    /// The instance starts with the inserted sketch's current standard and
    /// type. A sketch cannot end up containing itself.
    pub fn create_sketch_instance(&mut self, host: Uuid, inserted: Uuid, offset: Uuid) -> DocumentResult<Uuid> {
        if !self.sketches.contains_key(&host) {
            return Err(DocumentError::SketchNotFound(host));
        }
        let source = self
            .sketches
            .get(&inserted)
            .ok_or(DocumentError::SketchNotFound(inserted))?;
        if self.inserts(inserted, host) {
            return Err(DocumentError::InstanceCycle { host, inserted });
        }
        let name = source.name().to_string();
        let current = self
            .params
            .scope(source.scope())
            .map(|s| (s.current_standard().to_string(), s.current_type().map(str::to_string)));

        let target = self.sketches.get_mut(&host).ok_or(DocumentError::SketchNotFound(host))?;
        let result = target.create_sketch_instance(inserted, name, offset).and_then(|id| {
            if let Some((standard, type_name)) = &current {
                target.record_instance_type(id, standard, type_name.as_deref())?;
            }
            Ok(id)
        });
        self.flush();
        Ok(result?)
    }

    /// The inserted sketch of an instance, placed in host coordinates
    pub fn instance_view(&self, host: Uuid, instance: Uuid) -> Option<InstanceView<'_>> {
        let host_sketch = self.sketches.get(&host)?;
        let placed = host_sketch.sketch_instance(instance)?;
        let origin = host_sketch.key_point(placed.offset())?.position();
        let inserted = self.sketches.get(&placed.sketch())?;
        let view = inserted.view_with(&self.params).for_instance(Some(instance));
        Some(InstanceView::new(view, origin, placed.scale()))
    }

    /// Apply a preset type of the inserted sketch to one instance only
    pub fn set_sketch_instance_type(
        &mut self,
        host: Uuid,
        instance: Uuid,
        standard: &str,
        type_name: &str,
    ) -> DocumentResult<()> {
        let host_sketch = self.sketches.get(&host).ok_or(DocumentError::SketchNotFound(host))?;
        let inserted = host_sketch
            .sketch_instance(instance)
            .ok_or(SketchError::InstanceNotFound(instance))?
            .sketch();
        let scope = self
            .sketches
            .get(&inserted)
            .ok_or(DocumentError::SketchNotFound(inserted))?
            .scope();

        let changes = self.params.apply_type_to_instance(scope, standard, type_name, instance)?;
        if let Some(target) = self.sketches.get_mut(&host) {
            target.record_instance_type(instance, standard, Some(type_name))?;
        }
        self.commit(&changes);
        Ok(())
    }

    /// Remove an instance and every parameter override it holds
    pub fn remove_sketch_instance(&mut self, host: Uuid, instance: Uuid) -> DocumentResult<()> {
        let target = self.sketches.get_mut(&host).ok_or(DocumentError::SketchNotFound(host))?;
        if let Err(e) = target.remove_sketch_instance(instance) {
            self.flush();
            return Err(e.into());
        }

        let overridden: Vec<Uuid> = self
            .params
            .scopes()
            .flat_map(|s| s.parameters())
            .filter(|p| p.instance(instance).is_some())
            .map(|p| p.id)
            .collect();
        let mut changes = Vec::new();
        for param in overridden {
            changes.extend(self.params.clear_instance(param, instance)?);
        }
        self.commit(&changes);
        Ok(())
    }

    // ============== Parameters ==============

    /// Create a parameter, in the global scope when `scope` is `None`
    pub fn create_parameter(&mut self, scope: Option<Uuid>, name: Option<&str>, value: f64) -> DocumentResult<Uuid> {
        let scope = scope.unwrap_or(self.params.root());
        let id = self.params.create(scope, name, value)?;
        self.flush();
        Ok(id)
    }

    /// Resolve a name as seen from the global scope
    pub fn find_parameter(&self, name: &str) -> Option<Uuid> {
        self.params.resolve_name(self.params.root(), name)
    }

    pub fn set_parameter_value(&mut self, id: Uuid, value: f64) -> DocumentResult<()> {
        let changes = self.params.set_value(id, value)?;
        self.commit(&changes);
        Ok(())
    }

    pub fn set_parameter_formula(&mut self, id: Uuid, text: &str) -> DocumentResult<()> {
        let changes = self.params.set_formula(id, text)?;
        self.commit(&changes);
        Ok(())
    }

    pub fn set_instance_value(&mut self, id: Uuid, instance: Uuid, value: f64) -> DocumentResult<()> {
        let changes = self.params.set_instance_value(id, instance, value)?;
        self.commit(&changes);
        Ok(())
    }

    pub fn set_instance_formula(&mut self, id: Uuid, instance: Uuid, text: &str) -> DocumentResult<()> {
        let changes = self.params.set_instance_formula(id, instance, text)?;
        self.commit(&changes);
        Ok(())
    }

    pub fn clear_instance(&mut self, id: Uuid, instance: Uuid) -> DocumentResult<()> {
        let changes = self.params.clear_instance(id, instance)?;
        self.commit(&changes);
        Ok(())
    }

    /// Switch the current type of a scope, applying its stored formulas
    pub fn set_type(&mut self, scope: Uuid, type_name: &str) -> DocumentResult<()> {
        let changes = self.params.set_type(scope, type_name)?;
        self.commit(&changes);
        Ok(())
    }

    /// Delete a parameter. Bound sketch values keep their last value.
    pub fn delete_parameter(&mut self, id: Uuid) -> DocumentResult<()> {
        self.params.delete(id)?;
        for sketch in self.sketches.values_mut() {
            sketch.on_parameter_deleted(id);
        }
        self.flush();
        Ok(())
    }

    /// Run any other parameter operation, then refresh every sketch from
    /// the resulting base values. Bindings to parameters the operation
    /// deleted are released.
    pub fn with_parameters<T>(
        &mut self,
        edit: impl FnOnce(&mut ParameterStore) -> Result<T, ParameterError>,
    ) -> DocumentResult<T> {
        let mut bound: Vec<Uuid> = self.sketches.values().flat_map(|s| s.bound_parameters()).collect();
        bound.sort();
        bound.dedup();

        let result = edit(&mut self.params);

        for param in bound.into_iter().filter(|p| self.params.get(*p).is_none()) {
            for sketch in self.sketches.values_mut() {
                sketch.on_parameter_deleted(param);
            }
        }
        self.resync();
        self.flush();
        Ok(result?)
    }

    fn commit(&mut self, changes: &[ParameterChange]) {
        self.dispatch(changes, None);
        self.flush();
    }

    // ============== Persistence ==============

    pub fn to_data(&self) -> DocumentData {
        DocumentData {
            version: DOCUMENT_VERSION,
            name: self.name.clone(),
            scopes: self.params.to_data(),
            sketches: self.sketches().map(Sketch::to_data).collect(),
        }
    }

    /// Rebuild a document. Unresolved references are skipped and listed in
    /// the returned report.
    pub fn from_data(data: DocumentData) -> (Self, LoadReport) {
        let mut report = LoadReport::default();
        let params = ParameterStore::from_data(data.scopes, &mut report);
        let mut doc = Self::new(data.name);
        doc.params = params;

        let known: Vec<Uuid> = data.sketches.iter().map(|s| s.id).collect();
        for mut sketch_data in data.sketches {
            let host = sketch_data.id;
            sketch_data.instances.retain(|i| {
                if known.contains(&i.sketch) && i.sketch != host {
                    return true;
                }
                tracing::warn!("Sketch instance '{}' cannot insert sketch {}", i.name, i.sketch);
                report.skipped.push(DanglingReference {
                    owner: EntityRef::SketchInstance(i.id),
                    target: i.sketch,
                    role: "sketch".to_string(),
                });
                false
            });
            if doc.params.scope(sketch_data.scope).is_none() {
                tracing::warn!("Sketch '{}' has a missing scope, using the global scope", sketch_data.name);
                report.skipped.push(DanglingReference {
                    owner: EntityRef::Sketch(sketch_data.id),
                    target: sketch_data.scope,
                    role: "scope".to_string(),
                });
                sketch_data.scope = doc.params.root();
            }
            let sketch = Sketch::from_data(sketch_data, &doc.params, &mut report);
            doc.sketch_order.push(sketch.id);
            doc.sketches.insert(sketch.id, sketch);
        }

        doc.params.drain_events();
        if !report.is_clean() {
            tracing::warn!("Loaded '{}' with {} unresolved references", doc.name, report.skipped.len());
        }
        doc.load_report = report.clone();
        (doc, report)
    }

    /// Save as pretty RON
    pub fn save(&self, path: impl AsRef<Path>) -> DocumentResult<()> {
        let content = self.to_ron()?;
        std::fs::write(path, content).map_err(|e| DocumentError::Io(e.to_string()))?;
        Ok(())
    }

    pub fn to_ron(&self) -> DocumentResult<String> {
        ron::ser::to_string_pretty(&self.to_data(), ron::ser::PrettyConfig::default())
            .map_err(|e| DocumentError::Serialize(e.to_string()))
    }

    /// Load a RON document; see [`Document::load_report`] for what was skipped
    pub fn load(path: impl AsRef<Path>) -> DocumentResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| DocumentError::Io(e.to_string()))?;
        Self::from_ron(&content)
    }

    pub fn from_ron(content: &str) -> DocumentResult<Self> {
        let data: DocumentData = ron::from_str(content).map_err(|e| DocumentError::Deserialize(e.to_string()))?;
        Ok(Self::from_data(data).0)
    }

    pub fn to_json(&self) -> DocumentResult<String> {
        serde_json::to_string_pretty(&self.to_data()).map_err(|e| DocumentError::Serialize(e.to_string()))
    }

    pub fn from_json(content: &str) -> DocumentResult<Self> {
        let data: DocumentData =
            serde_json::from_str(content).map_err(|e| DocumentError::Deserialize(e.to_string()))?;
        Ok(Self::from_data(data).0)
    }
}

/// Serialized form of a document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentData {
    pub version: u32,
    pub name: String,
    pub scopes: Vec<ScopeData>,
    pub sketches: Vec<SketchData>,
}
