//! Parameter scopes and the owning store

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use uuid::Uuid;

use super::formula::{Formula, FormulaError};
use super::{
    InstanceOverride, InstanceSource, Parameter, ParameterChange, ParameterError, ParameterResult,
};
use crate::constants::{DEFAULT_STANDARD, DEFAULT_TYPE, GLOBAL_SCOPE_NAME};
use crate::document::{DanglingReference, LoadReport};
use crate::event::{ChangeDetail, ChangeEvent, ChangeKind, EntityRef, EventQueue};

/// Stored value of one parameter in a preset type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preset {
    /// Internal formula text, `None` for a literal
    pub formula: Option<String>,
    pub value: f64,
}

/// A named, ordered collection of parameters with an optional parent
#[derive(Debug, Clone)]
pub struct ParameterScope {
    /// Unique identifier
    pub id: Uuid,
    name: String,
    parent: Option<Uuid>,
    /// Insertion order, drives display order
    order: Vec<Uuid>,
    params: HashMap<Uuid, Parameter>,
    /// standard -> type -> parameter -> preset
    standards: BTreeMap<String, BTreeMap<String, BTreeMap<Uuid, Preset>>>,
    current_standard: String,
    current_type: Option<String>,
}

impl ParameterScope {
    fn new(id: Uuid, name: impl Into<String>, parent: Option<Uuid>) -> Self {
        let mut standards = BTreeMap::new();
        let mut types = BTreeMap::new();
        types.insert(DEFAULT_TYPE.to_string(), BTreeMap::new());
        standards.insert(DEFAULT_STANDARD.to_string(), types);
        Self {
            id,
            name: name.into(),
            parent,
            order: Vec::new(),
            params: HashMap::new(),
            standards,
            current_standard: DEFAULT_STANDARD.to_string(),
            current_type: Some(DEFAULT_TYPE.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<Uuid> {
        self.parent
    }

    /// Local parameter IDs in insertion order
    pub fn parameter_ids(&self) -> &[Uuid] {
        &self.order
    }

    /// Iterate over local parameters in insertion order
    pub fn parameters(&self) -> impl Iterator<Item = &Parameter> {
        self.order.iter().filter_map(|id| self.params.get(id))
    }

    /// Number of local parameters
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Last local parameter with this name
    fn find_local(&self, name: &str) -> Option<Uuid> {
        self.order
            .iter()
            .rev()
            .find(|id| self.params.get(id).is_some_and(|p| p.name() == name))
            .copied()
    }

    /// Names of all standards
    pub fn standards(&self) -> impl Iterator<Item = &str> {
        self.standards.keys().map(String::as_str)
    }

    /// Names of the types in a standard
    pub fn types(&self, standard: &str) -> Vec<&str> {
        self.standards
            .get(standard)
            .map(|types| types.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn current_standard(&self) -> &str {
        &self.current_standard
    }

    pub fn current_type(&self) -> Option<&str> {
        self.current_type.as_deref()
    }

    /// Stored presets of a type
    pub fn presets(&self, standard: &str, type_name: &str) -> Option<&BTreeMap<Uuid, Preset>> {
        self.standards.get(standard)?.get(type_name)
    }
}

/// Serialized form of a parameter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterData {
    pub id: Uuid,
    pub name: String,
    pub value: f64,
    /// Internal formula text
    #[serde(default)]
    pub formula: Option<String>,
    #[serde(default)]
    pub instances: Vec<InstanceData>,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub locked: bool,
}

/// Serialized form of an instance override
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceData {
    pub instance: Uuid,
    pub value: f64,
    #[serde(default)]
    pub formula: Option<String>,
    #[serde(default)]
    pub derived: bool,
}

/// Serialized form of a scope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeData {
    pub id: Uuid,
    pub name: String,
    pub parent: Option<Uuid>,
    pub parameters: Vec<ParameterData>,
    #[serde(default)]
    pub standards: BTreeMap<String, BTreeMap<String, BTreeMap<Uuid, Preset>>>,
    #[serde(default = "default_standard")]
    pub current_standard: String,
    #[serde(default)]
    pub current_type: Option<String>,
}

fn default_standard() -> String {
    DEFAULT_STANDARD.to_string()
}

/// What is being assigned to a parameter
enum Assignment {
    Literal(f64),
    Formula(Formula),
}

/// Owns every scope and parameter, and the dependency index between them
#[derive(Debug, Clone)]
pub struct ParameterStore {
    root: Uuid,
    scopes: HashMap<Uuid, ParameterScope>,
    /// parameter -> owning scope
    owner: HashMap<Uuid, Uuid>,
    /// upstream parameter -> parameters whose formulas reference it
    dependents: HashMap<Uuid, Vec<Uuid>>,
    events: EventQueue,
}

impl Default for ParameterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ParameterStore {
    /// Create a store with an empty root scope
    pub fn new() -> Self {
        let root = Uuid::new_v4();
        let mut scopes = HashMap::new();
        scopes.insert(root, ParameterScope::new(root, GLOBAL_SCOPE_NAME, None));
        Self {
            root,
            scopes,
            owner: HashMap::new(),
            dependents: HashMap::new(),
            events: EventQueue::new(),
        }
    }

    /// Root scope ID
    pub fn root(&self) -> Uuid {
        self.root
    }

    /// Pending change events
    pub fn events(&self) -> &EventQueue {
        &self.events
    }

    /// Take pending change events
    pub fn drain_events(&mut self) -> Vec<ChangeEvent> {
        self.events.drain()
    }

    // ============== Scopes ==============

    /// Create a child scope
    pub fn create_scope(&mut self, name: impl Into<String>, parent: Uuid) -> ParameterResult<Uuid> {
        if !self.scopes.contains_key(&parent) {
            return Err(ParameterError::ScopeNotFound(parent));
        }
        let id = Uuid::new_v4();
        self.scopes.insert(id, ParameterScope::new(id, name, Some(parent)));
        Ok(id)
    }

    /// Remove a scope, its child scopes and all their parameters
    pub fn remove_scope(&mut self, id: Uuid) -> ParameterResult<()> {
        if id == self.root {
            return Err(ParameterError::ScopeNotFound(id));
        }
        let children: Vec<Uuid> = self
            .scopes
            .values()
            .filter(|s| s.parent == Some(id))
            .map(|s| s.id)
            .collect();
        for child in children {
            self.remove_scope(child)?;
        }
        let params = self
            .scopes
            .get(&id)
            .ok_or(ParameterError::ScopeNotFound(id))?
            .order
            .clone();
        for param in params.into_iter().rev() {
            self.delete(param)?;
        }
        self.scopes.remove(&id);
        Ok(())
    }

    /// Get a scope
    pub fn scope(&self, id: Uuid) -> Option<&ParameterScope> {
        self.scopes.get(&id)
    }

    /// Iterate over all scopes
    pub fn scopes(&self) -> impl Iterator<Item = &ParameterScope> {
        self.scopes.values()
    }

    /// Rename a scope
    pub fn rename_scope(&mut self, id: Uuid, name: impl Into<String>) -> ParameterResult<()> {
        let scope = self
            .scopes
            .get_mut(&id)
            .ok_or(ParameterError::ScopeNotFound(id))?;
        let old = std::mem::replace(&mut scope.name, name.into());
        let new = scope.name.clone();
        self.events.push(
            ChangeEvent::about(EntityRef::Scope(id), ChangeKind::ValueChanged)
                .with_detail(ChangeDetail::Renamed { old, new }),
        );
        Ok(())
    }

    /// Scope and its ancestors, nearest first
    fn chain(&self, scope: Uuid) -> Vec<&ParameterScope> {
        let mut out = Vec::new();
        let mut current = self.scopes.get(&scope);
        while let Some(s) = current {
            out.push(s);
            current = s.parent.and_then(|p| self.scopes.get(&p));
        }
        out
    }

    // ============== Parameter Lifecycle ==============

    /// Create a parameter in a scope.
    ///
    /// Without a name the parameter is called `scope name + index`, or
    /// `Global + index` in the root scope.
    pub fn create(&mut self, scope: Uuid, name: Option<&str>, value: f64) -> ParameterResult<Uuid> {
        let root = self.root;
        let s = self
            .scopes
            .get_mut(&scope)
            .ok_or(ParameterError::ScopeNotFound(scope))?;
        let name = match name {
            Some(n) => n.to_string(),
            None if scope == root => format!("{}{}", GLOBAL_SCOPE_NAME, s.order.len()),
            None => format!("{}{}", s.name, s.order.len()),
        };
        let param = Parameter::new(scope, name, value);
        let id = param.id;
        s.order.push(id);
        s.params.insert(id, param);
        self.owner.insert(id, scope);
        self.record_preset(id);
        self.events
            .added(EntityRef::Scope(scope), EntityRef::Parameter(id));
        tracing::debug!("Created parameter {} in scope {}", id, scope);
        Ok(id)
    }

    /// Delete a parameter.
    ///
    /// The parameter is detached from everything it references. Parameters
    /// that reference it keep their last value; their formulas keep the
    /// deleted name as an unresolved name.
    pub fn delete(&mut self, id: Uuid) -> ParameterResult<Parameter> {
        let scope_id = *self.owner.get(&id).ok_or(ParameterError::NotFound(id))?;
        let (upstream, name) = {
            let param = self.get(id).ok_or(ParameterError::NotFound(id))?;
            (param.references(), param.name().to_string())
        };
        for up in upstream {
            self.unlink(up, id);
        }

        let downstream = self.dependents.remove(&id).unwrap_or_default();
        for d in downstream {
            if let Some(p) = self.get_mut(d) {
                p.formula = p.formula.as_ref().map(|f| f.detach_reference(id, &name));
                for o in p.instances.values_mut() {
                    if let InstanceSource::Formula(f) = &o.source {
                        o.source = InstanceSource::Formula(f.detach_reference(id, &name));
                    }
                }
                tracing::debug!("Parameter {} lost its reference to deleted '{}'", d, name);
            }
        }

        let scope = self
            .scopes
            .get_mut(&scope_id)
            .ok_or(ParameterError::ScopeNotFound(scope_id))?;
        scope.order.retain(|p| *p != id);
        let param = scope.params.remove(&id).ok_or(ParameterError::NotFound(id))?;
        for types in scope.standards.values_mut() {
            for presets in types.values_mut() {
                presets.remove(&id);
            }
        }
        self.owner.remove(&id);
        self.events
            .removed(EntityRef::Scope(scope_id), EntityRef::Parameter(id));
        tracing::debug!("Deleted parameter '{}'", name);
        Ok(param)
    }

    // ============== Lookup ==============

    /// Get a parameter by ID
    pub fn get(&self, id: Uuid) -> Option<&Parameter> {
        let scope = self.owner.get(&id)?;
        self.scopes.get(scope)?.params.get(&id)
    }

    fn get_mut(&mut self, id: Uuid) -> Option<&mut Parameter> {
        let scope = self.owner.get(&id)?;
        self.scopes.get_mut(scope)?.params.get_mut(&id)
    }

    fn require(&self, id: Uuid) -> ParameterResult<&Parameter> {
        self.get(id).ok_or(ParameterError::NotFound(id))
    }

    /// Base value of a parameter
    pub fn value(&self, id: Uuid) -> Option<f64> {
        self.get(id).map(Parameter::value)
    }

    /// Value of a parameter as seen by an instance
    pub fn instance_value(&self, id: Uuid, instance: Option<Uuid>) -> Option<f64> {
        self.get(id).map(|p| p.instance_value(instance))
    }

    /// Resolve a name from a scope: last local match first, then the parent chain
    pub fn resolve_name(&self, scope: Uuid, name: &str) -> Option<Uuid> {
        self.chain(scope).into_iter().find_map(|s| s.find_local(name))
    }

    /// Resolve an ID from a scope: local first, then the parent chain
    pub fn resolve_id(&self, scope: Uuid, id: Uuid) -> Option<&Parameter> {
        self.chain(scope)
            .into_iter()
            .find_map(|s| s.params.get(&id))
    }

    /// Local parameters followed by the parent's visible list
    pub fn all_visible(&self, scope: Uuid) -> Vec<Uuid> {
        self.chain(scope)
            .into_iter()
            .flat_map(|s| s.order.iter().copied())
            .collect()
    }

    /// Every distinct visible name with the ID it resolves to from `scope`
    pub fn visible_names(&self, scope: Uuid) -> Vec<(String, Uuid)> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for id in self.all_visible(scope) {
            let Some(param) = self.get(id) else { continue };
            if seen.insert(param.name().to_string())
                && let Some(resolved) = self.resolve_name(scope, param.name())
            {
                out.push((param.name().to_string(), resolved));
            }
        }
        out
    }

    /// Number of local parameters
    pub fn length(&self, scope: Uuid) -> usize {
        self.scopes.get(&scope).map_or(0, ParameterScope::len)
    }

    /// Number of visible parameters including ancestors
    pub fn length_all(&self, scope: Uuid) -> usize {
        self.chain(scope).iter().map(|s| s.len()).sum()
    }

    /// Position of a parameter in a scope's visible list
    pub fn index_of(&self, scope: Uuid, id: Uuid) -> Option<usize> {
        self.all_visible(scope).iter().position(|p| *p == id)
    }

    /// Parameter at a position of a scope's visible list
    pub fn parameter_at(&self, scope: Uuid, index: usize) -> Option<&Parameter> {
        self.all_visible(scope).get(index).and_then(|id| self.get(*id))
    }

    // ============== Dependencies ==============

    /// Direct upstream parameters
    pub fn dependencies(&self, id: Uuid) -> Vec<Uuid> {
        self.get(id).map(Parameter::references).unwrap_or_default()
    }

    /// Direct downstream parameters
    pub fn dependents(&self, id: Uuid) -> Vec<Uuid> {
        self.dependents.get(&id).cloned().unwrap_or_default()
    }

    /// All transitive upstream parameters
    pub fn depend_params(&self, id: Uuid) -> Vec<Uuid> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let mut stack = self.dependencies(id);
        while let Some(next) = stack.pop() {
            if next == id || !seen.insert(next) {
                continue;
            }
            out.push(next);
            stack.extend(self.dependencies(next));
        }
        out
    }

    /// Transitive dependents of `origin` in evaluation order
    fn downstream_order(&self, origin: Uuid) -> Vec<Uuid> {
        fn visit(
            store: &ParameterStore,
            id: Uuid,
            seen: &mut HashSet<Uuid>,
            post: &mut Vec<Uuid>,
        ) {
            if !seen.insert(id) {
                return;
            }
            for d in store.dependents.get(&id).into_iter().flatten() {
                visit(store, *d, seen, post);
            }
            post.push(id);
        }

        let mut seen = HashSet::new();
        let mut post = Vec::new();
        visit(self, origin, &mut seen, &mut post);
        post.pop(); // origin itself
        post.reverse();
        post
    }

    fn link(&mut self, upstream: Uuid, downstream: Uuid) {
        let list = self.dependents.entry(upstream).or_default();
        if !list.contains(&downstream) {
            list.push(downstream);
        }
    }

    fn unlink(&mut self, upstream: Uuid, downstream: Uuid) {
        if let Some(list) = self.dependents.get_mut(&upstream) {
            list.retain(|d| *d != downstream);
            if list.is_empty() {
                self.dependents.remove(&upstream);
            }
        }
    }

    /// Re-register `id` with exactly the parameters its formulas reference
    fn relink(&mut self, id: Uuid, before: &[Uuid]) {
        let after = self.dependencies(id);
        for up in before.iter().filter(|u| !after.contains(u)) {
            self.unlink(*up, id);
        }
        for up in after {
            self.link(up, id);
        }
    }

    // ============== Formulas ==============

    /// Parse formula text as seen from a parameter's scope and validate its references
    fn compile(&self, id: Uuid, text: &str) -> ParameterResult<Formula> {
        let param = self.require(id)?;
        let names = self.visible_names(param.scope());
        let formula = Formula::parse(text, &names)?;
        self.check_references(id, &formula)?;
        Ok(formula)
    }

    fn check_references(&self, id: Uuid, formula: &Formula) -> ParameterResult<()> {
        let param = self.require(id)?;
        for r in formula.references() {
            if r == id {
                return Err(FormulaError::SelfReference(param.name().to_string()).into());
            }
            if self.depend_params(r).contains(&id) {
                let through = self.get(r).map_or_else(|| r.to_string(), |p| p.name().to_string());
                return Err(FormulaError::Cycle(through).into());
            }
        }
        Ok(())
    }

    fn evaluate_with(&self, formula: &Formula, instance: Option<Uuid>) -> ParameterResult<f64> {
        Ok(formula.evaluate(&|r| self.instance_value(r, instance))?)
    }

    /// Display formula text with current names; a literal renders as its value
    pub fn formula_text(&self, id: Uuid) -> Option<String> {
        self.instance_formula_text(id, None)
    }

    /// Display formula text used by an instance
    pub fn instance_formula_text(&self, id: Uuid, instance: Option<Uuid>) -> Option<String> {
        let param = self.get(id)?;
        Some(match param.instance_formula(instance) {
            Some(f) => f.display(&|r| self.display_name(r)),
            None => format!("{}", param.instance_value(instance)),
        })
    }

    /// Internal formula text with `{uuid}` references
    pub fn internal_formula(&self, id: Uuid) -> Option<String> {
        let param = self.get(id)?;
        Some(match param.formula() {
            Some(f) => f.internal_text(),
            None => format!("{}", param.value()),
        })
    }

    /// Display formula with every numeric literal multiplied by `factor`
    pub fn formula_factored(&self, id: Uuid, factor: f64) -> Option<String> {
        let param = self.get(id)?;
        Some(match param.formula() {
            Some(f) => f.factored(factor).display(&|r| self.display_name(r)),
            None => format!("{}", param.value() * factor),
        })
    }

    fn display_name(&self, id: Uuid) -> String {
        self.get(id)
            .map_or_else(|| format!("{{{}}}", id), |p| p.name().to_string())
    }

    // ============== Mutation ==============

    /// Set a literal base value, clearing any formula
    pub fn set_value(&mut self, id: Uuid, value: f64) -> ParameterResult<Vec<ParameterChange>> {
        self.assign(id, None, Assignment::Literal(value), true)
    }

    /// Set a base formula.
    ///
    /// Names are resolved against the parameter's visible names and stored
    /// as ID references. Fails without changing anything on self-reference,
    /// cycles, unknown names and syntax errors.
    pub fn set_formula(&mut self, id: Uuid, text: &str) -> ParameterResult<Vec<ParameterChange>> {
        let formula = self.compile(id, text)?;
        self.assign(id, None, Assignment::Formula(formula), true)
    }

    /// Set a literal value for one instance
    pub fn set_instance_value(
        &mut self,
        id: Uuid,
        instance: Uuid,
        value: f64,
    ) -> ParameterResult<Vec<ParameterChange>> {
        self.assign(id, Some(instance), Assignment::Literal(value), true)
    }

    /// Set a formula for one instance
    pub fn set_instance_formula(
        &mut self,
        id: Uuid,
        instance: Uuid,
        text: &str,
    ) -> ParameterResult<Vec<ParameterChange>> {
        let formula = self.compile(id, text)?;
        self.assign(id, Some(instance), Assignment::Formula(formula), true)
    }

    /// Remove an instance override so the instance sees the base value again
    pub fn clear_instance(&mut self, id: Uuid, instance: Uuid) -> ParameterResult<Vec<ParameterChange>> {
        let param = self.require(id)?;
        let old = param.instance_value(Some(instance));
        let base = param.value();
        let before = param.references();
        if let Some(p) = self.get_mut(id) {
            p.instances.remove(&instance);
        }
        self.relink(id, &before);
        let mut changes = vec![ParameterChange {
            parameter: id,
            instance: Some(instance),
            old,
            new: base,
        }];
        self.push_value_event(id, Some(instance), old, base, None, None);
        self.propagate(id, Some(instance), &mut changes);
        Ok(changes)
    }

    fn assign(
        &mut self,
        id: Uuid,
        instance: Option<Uuid>,
        assignment: Assignment,
        record_preset: bool,
    ) -> ParameterResult<Vec<ParameterChange>> {
        let param = self.require(id)?;
        if param.locked() {
            return Err(ParameterError::Locked(param.name().to_string()));
        }
        let old = param.instance_value(instance);
        let old_formula = self.instance_formula_text(id, instance);
        let before = param.references();

        let new = match &assignment {
            Assignment::Literal(v) => *v,
            Assignment::Formula(f) => self.evaluate_with(f, instance)?,
        };
        if !new.is_finite() {
            tracing::warn!("Parameter '{}' evaluated to non-finite value {}", param.name(), new);
        }

        let Some(p) = self.get_mut(id) else {
            return Err(ParameterError::NotFound(id));
        };
        match (instance, assignment) {
            (None, Assignment::Literal(v)) => {
                p.value = v;
                p.formula = None;
            }
            (None, Assignment::Formula(f)) => {
                p.value = new;
                p.formula = Some(f);
            }
            (Some(i), Assignment::Literal(v)) => {
                if v == p.value {
                    p.instances.remove(&i);
                } else {
                    p.instances.insert(
                        i,
                        InstanceOverride {
                            value: v,
                            source: InstanceSource::Literal,
                        },
                    );
                }
            }
            (Some(i), Assignment::Formula(f)) => {
                let source = if p.formula.as_ref() == Some(&f) {
                    InstanceSource::Derived
                } else {
                    InstanceSource::Formula(f)
                };
                if source == InstanceSource::Derived && new == p.value {
                    p.instances.remove(&i);
                } else {
                    p.instances.insert(i, InstanceOverride { value: new, source });
                }
            }
        }
        self.relink(id, &before);

        if instance.is_none() {
            self.refresh_instances(id);
            if record_preset {
                self.record_preset(id);
            }
        }

        let new_formula = self.instance_formula_text(id, instance);
        self.push_value_event(id, instance, old, new, old_formula, new_formula);
        let mut changes = vec![ParameterChange {
            parameter: id,
            instance,
            old,
            new,
        }];
        self.propagate(id, instance, &mut changes);
        Ok(changes)
    }

    fn push_value_event(
        &mut self,
        id: Uuid,
        instance: Option<Uuid>,
        old: f64,
        new: f64,
        old_formula: Option<String>,
        new_formula: Option<String>,
    ) {
        self.events.push(
            ChangeEvent::about(EntityRef::Parameter(id), ChangeKind::ValueChanged).with_detail(
                ChangeDetail::Value {
                    old,
                    new,
                    instance,
                    old_formula,
                    new_formula,
                },
            ),
        );
    }

    /// Re-evaluate instance overrides of a parameter after its base value changed
    fn refresh_instances(&mut self, id: Uuid) -> Vec<(Uuid, f64, f64)> {
        let Some(param) = self.get(id) else {
            return Vec::new();
        };
        let base = param.value();
        let mut updates = Vec::new();
        for (instance, o) in param.instances() {
            let formula = match &o.source {
                InstanceSource::Literal => continue,
                InstanceSource::Formula(f) => Some(f),
                InstanceSource::Derived => param.formula(),
            };
            let new = match formula.map(|f| self.evaluate_with(f, Some(*instance))) {
                Some(Ok(v)) => v,
                Some(Err(e)) => {
                    tracing::warn!("Instance re-evaluation of '{}' failed: {}", param.name(), e);
                    continue;
                }
                None => base,
            };
            updates.push((*instance, o.value, new));
        }

        let mut changed = Vec::new();
        if let Some(p) = self.get_mut(id) {
            for (instance, old, new) in updates {
                let derived = matches!(
                    p.instances.get(&instance).map(|o| &o.source),
                    Some(InstanceSource::Derived)
                );
                if derived && new == base {
                    p.instances.remove(&instance);
                } else if let Some(o) = p.instances.get_mut(&instance) {
                    o.value = new;
                }
                if value_changed(old, new) {
                    changed.push((instance, old, new));
                }
            }
        }
        changed
    }

    /// Re-evaluate everything downstream of `origin`, in dependency order
    fn propagate(&mut self, origin: Uuid, instance: Option<Uuid>, changes: &mut Vec<ParameterChange>) {
        for id in self.downstream_order(origin) {
            match instance {
                None => self.recompute_base(id, changes),
                Some(i) => self.recompute_instance(id, i, changes),
            }
        }
    }

    fn recompute_base(&mut self, id: Uuid, changes: &mut Vec<ParameterChange>) {
        let Some(param) = self.get(id) else { return };
        if let Some(formula) = param.formula() {
            let old = param.value();
            match self.evaluate_with(formula, None) {
                Ok(new) => {
                    if !new.is_finite() {
                        tracing::warn!("Parameter '{}' evaluated to non-finite value {}", param.name(), new);
                    }
                    if let Some(p) = self.get_mut(id) {
                        p.value = new;
                    }
                    if value_changed(old, new) {
                        changes.push(ParameterChange {
                            parameter: id,
                            instance: None,
                            old,
                            new,
                        });
                        self.push_value_event(id, None, old, new, None, None);
                    }
                }
                Err(e) => tracing::warn!("Re-evaluation of '{}' failed: {}", param.name(), e),
            }
        }
        for (instance, old, new) in self.refresh_instances(id) {
            changes.push(ParameterChange {
                parameter: id,
                instance: Some(instance),
                old,
                new,
            });
            self.push_value_event(id, Some(instance), old, new, None, None);
        }
    }

    fn recompute_instance(&mut self, id: Uuid, instance: Uuid, changes: &mut Vec<ParameterChange>) {
        let Some(param) = self.get(id) else { return };
        let own = param.instance(instance).map(|o| o.source.clone());
        let formula = match &own {
            Some(InstanceSource::Literal) => return,
            Some(InstanceSource::Formula(f)) => f,
            Some(InstanceSource::Derived) | None => match param.formula() {
                Some(f) => f,
                None => return,
            },
        };
        let old = param.instance_value(Some(instance));
        let base = param.value();
        let new = match self.evaluate_with(formula, Some(instance)) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("Instance re-evaluation of '{}' failed: {}", param.name(), e);
                return;
            }
        };

        let Some(p) = self.get_mut(id) else { return };
        match own {
            Some(InstanceSource::Formula(_)) => {
                if let Some(o) = p.instances.get_mut(&instance) {
                    o.value = new;
                }
            }
            _ if new == base => {
                p.instances.remove(&instance);
            }
            _ => {
                p.instances.insert(
                    instance,
                    InstanceOverride {
                        value: new,
                        source: InstanceSource::Derived,
                    },
                );
            }
        }
        if value_changed(old, new) {
            changes.push(ParameterChange {
                parameter: id,
                instance: Some(instance),
                old,
                new,
            });
            self.push_value_event(id, Some(instance), old, new, None, None);
        }
    }

    // ============== Flags ==============

    /// Rename a parameter; formulas referencing it display the new name
    pub fn rename(&mut self, id: Uuid, name: impl Into<String>) -> ParameterResult<()> {
        let p = self.get_mut(id).ok_or(ParameterError::NotFound(id))?;
        let old = std::mem::replace(&mut p.name, name.into());
        let new = p.name.clone();
        self.events.push(
            ChangeEvent::about(EntityRef::Parameter(id), ChangeKind::ValueChanged)
                .with_detail(ChangeDetail::Renamed { old, new }),
        );
        Ok(())
    }

    /// Show or hide a parameter
    pub fn set_hidden(&mut self, id: Uuid, hidden: bool) -> ParameterResult<()> {
        let p = self.get_mut(id).ok_or(ParameterError::NotFound(id))?;
        let old = std::mem::replace(&mut p.hidden, hidden);
        if old != hidden {
            self.events.push(
                ChangeEvent::about(EntityRef::Parameter(id), ChangeKind::HiddenChanged)
                    .with_detail(ChangeDetail::Hidden { old, new: hidden }),
            );
        }
        Ok(())
    }

    /// Lock or unlock a parameter against value changes
    pub fn set_locked(&mut self, id: Uuid, locked: bool) -> ParameterResult<()> {
        let p = self.get_mut(id).ok_or(ParameterError::NotFound(id))?;
        let old = std::mem::replace(&mut p.locked, locked);
        if old != locked {
            self.events.push(
                ChangeEvent::about(EntityRef::Parameter(id), ChangeKind::ObjectChanged)
                    .with_detail(ChangeDetail::Locked { old, new: locked }),
            );
        }
        Ok(())
    }

    // ============== Presets ==============

    /// Create a preset type, creating the standard if needed.
    ///
    /// The new type starts as a copy of the current type.
    pub fn make_type(&mut self, scope: Uuid, standard: &str, type_name: &str) -> ParameterResult<()> {
        let s = self
            .scopes
            .get_mut(&scope)
            .ok_or(ParameterError::ScopeNotFound(scope))?;
        let seed = s
            .current_type
            .as_deref()
            .and_then(|t| s.presets(&s.current_standard, t))
            .cloned()
            .unwrap_or_default();
        s.standards
            .entry(standard.to_string())
            .or_default()
            .insert(type_name.to_string(), seed);
        Ok(())
    }

    /// Switch the current standard; no type is current afterwards
    pub fn set_standard(&mut self, scope: Uuid, standard: &str) -> ParameterResult<()> {
        let s = self
            .scopes
            .get_mut(&scope)
            .ok_or(ParameterError::ScopeNotFound(scope))?;
        if !s.standards.contains_key(standard) {
            return Err(ParameterError::UnknownStandard(standard.to_string()));
        }
        s.current_standard = standard.to_string();
        s.current_type = None;
        Ok(())
    }

    /// Make a type of the current standard current and apply its presets
    pub fn set_type(&mut self, scope: Uuid, type_name: &str) -> ParameterResult<Vec<ParameterChange>> {
        let s = self
            .scopes
            .get(&scope)
            .ok_or(ParameterError::ScopeNotFound(scope))?;
        let presets = s
            .presets(&s.current_standard, type_name)
            .ok_or_else(|| ParameterError::UnknownType(type_name.to_string()))?
            .clone();
        if let Some(s) = self.scopes.get_mut(&scope) {
            s.current_type = Some(type_name.to_string());
        }

        let mut changes = Vec::new();
        for (id, preset) in presets {
            if self.owner.get(&id) != Some(&scope) {
                continue;
            }
            match self.preset_assignment(&preset) {
                Ok(assignment) => changes.extend(self.assign(id, None, assignment, false)?),
                Err(e) => tracing::warn!("Skipping preset for {}: {}", id, e),
            }
        }
        self.events
            .push(ChangeEvent::about(EntityRef::Scope(scope), ChangeKind::ObjectChanged));
        Ok(changes)
    }

    /// Apply a type's presets as instance formulas for one instance
    pub fn apply_type_to_instance(
        &mut self,
        scope: Uuid,
        standard: &str,
        type_name: &str,
        instance: Uuid,
    ) -> ParameterResult<Vec<ParameterChange>> {
        let s = self
            .scopes
            .get(&scope)
            .ok_or(ParameterError::ScopeNotFound(scope))?;
        if !s.standards.contains_key(standard) {
            return Err(ParameterError::UnknownStandard(standard.to_string()));
        }
        let presets = s
            .presets(standard, type_name)
            .ok_or_else(|| ParameterError::UnknownType(type_name.to_string()))?
            .clone();

        let mut changes = Vec::new();
        for (id, preset) in presets {
            if self.get(id).is_none() {
                continue;
            }
            match self.preset_assignment(&preset) {
                Ok(assignment) => changes.extend(self.assign(id, Some(instance), assignment, false)?),
                Err(e) => tracing::warn!("Skipping preset for {}: {}", id, e),
            }
        }
        self.events
            .push(ChangeEvent::about(EntityRef::Scope(scope), ChangeKind::ObjectChanged));
        Ok(changes)
    }

    fn preset_assignment(&self, preset: &Preset) -> ParameterResult<Assignment> {
        match &preset.formula {
            None => Ok(Assignment::Literal(preset.value)),
            Some(text) => {
                let formula = Formula::parse_internal(text)?;
                if let Some(missing) = formula.references().into_iter().find(|r| self.get(*r).is_none()) {
                    return Err(FormulaError::UnresolvedReference(missing).into());
                }
                Ok(Assignment::Formula(formula))
            }
        }
    }

    /// Store the current base state of a parameter in its scope's current type
    fn record_preset(&mut self, id: Uuid) {
        let Some(param) = self.get(id) else { return };
        let preset = Preset {
            formula: param.formula().map(Formula::internal_text),
            value: param.value(),
        };
        let scope = param.scope();
        if let Some(s) = self.scopes.get_mut(&scope)
            && let Some(current) = s.current_type.clone()
            && let Some(types) = s.standards.get_mut(&s.current_standard)
            && let Some(presets) = types.get_mut(&current)
        {
            presets.insert(id, preset);
        }
    }

    // ============== Persistence ==============

    /// Serialize all scopes, parents before children
    pub fn to_data(&self) -> Vec<ScopeData> {
        let mut out = Vec::new();
        let mut queue = vec![self.root];
        while let Some(id) = queue.pop() {
            let Some(scope) = self.scopes.get(&id) else { continue };
            out.push(ScopeData {
                id: scope.id,
                name: scope.name.clone(),
                parent: scope.parent,
                parameters: scope.parameters().map(parameter_data).collect(),
                standards: scope.standards.clone(),
                current_standard: scope.current_standard.clone(),
                current_type: scope.current_type.clone(),
            });
            let mut children: Vec<&ParameterScope> =
                self.scopes.values().filter(|s| s.parent == Some(id)).collect();
            children.sort_by(|a, b| b.name.cmp(&a.name));
            queue.extend(children.into_iter().map(|s| s.id));
        }
        out
    }

    /// Rebuild a store from serialized scopes.
    ///
    /// Pass one creates scopes and literal values; pass two binds formulas.
    /// A formula that references a missing parameter is dropped and the
    /// stored value is kept.
    pub fn from_data(scopes: Vec<ScopeData>, report: &mut LoadReport) -> Self {
        let mut store = Self::new();
        let Some(root_data) = scopes.iter().find(|s| s.parent.is_none()) else {
            return store;
        };

        store.scopes.clear();
        store.root = root_data.id;
        let mut formulas = Vec::new();

        for data in &scopes {
            let parent = data.parent.filter(|p| scopes.iter().any(|s| s.id == *p));
            if data.parent.is_some() && parent.is_none() {
                tracing::warn!("Scope '{}' has a missing parent, attaching to root", data.name);
            }
            let parent = if data.id == store.root { None } else { parent.or(Some(store.root)) };
            let mut scope = ParameterScope::new(data.id, data.name.clone(), parent);
            scope.standards = data.standards.clone();
            scope.current_standard = data.current_standard.clone();
            scope.current_type = data.current_type.clone();

            for p in &data.parameters {
                let mut param = Parameter::with_id(p.id, data.id, p.name.clone(), p.value);
                param.hidden = p.hidden;
                param.locked = p.locked;
                for i in &p.instances {
                    let source = if i.derived {
                        InstanceSource::Derived
                    } else {
                        InstanceSource::Literal
                    };
                    param.instances.insert(
                        i.instance,
                        InstanceOverride {
                            value: i.value,
                            source,
                        },
                    );
                    if let Some(text) = &i.formula {
                        formulas.push((p.id, Some(i.instance), text.clone()));
                    }
                }
                if let Some(text) = &p.formula {
                    formulas.push((p.id, None, text.clone()));
                }
                scope.order.push(p.id);
                scope.params.insert(p.id, param);
                store.owner.insert(p.id, data.id);
            }
            store.scopes.insert(data.id, scope);
        }

        for (id, instance, text) in formulas {
            let formula = match Formula::parse_internal(&text) {
                Ok(f) => f,
                Err(e) => {
                    tracing::warn!("Dropping unreadable formula of {}: {}", id, e);
                    continue;
                }
            };
            if let Some(missing) = formula.references().into_iter().find(|r| store.get(*r).is_none()) {
                tracing::warn!("Parameter {} references missing parameter {}, keeping its value", id, missing);
                report.skipped.push(DanglingReference {
                    owner: EntityRef::Parameter(id),
                    target: missing,
                    role: "formula".to_string(),
                });
                continue;
            }
            if let Err(e) = store.check_references(id, &formula) {
                tracing::warn!("Dropping formula of {}: {}", id, e);
                continue;
            }
            let before = store.dependencies(id);
            if let Some(p) = store.get_mut(id) {
                match instance {
                    None => p.formula = Some(formula),
                    Some(i) => {
                        let value = p.instance_value(Some(i));
                        p.instances.insert(
                            i,
                            InstanceOverride {
                                value,
                                source: InstanceSource::Formula(formula),
                            },
                        );
                    }
                }
            }
            store.relink(id, &before);
        }
        store
    }
}

fn parameter_data(p: &Parameter) -> ParameterData {
    let mut instances: Vec<InstanceData> = p
        .instances()
        .map(|(instance, o)| InstanceData {
            instance: *instance,
            value: o.value,
            formula: match &o.source {
                InstanceSource::Formula(f) => Some(f.internal_text()),
                _ => None,
            },
            derived: o.source == InstanceSource::Derived,
        })
        .collect();
    instances.sort_by_key(|i| i.instance);
    ParameterData {
        id: p.id,
        name: p.name().to_string(),
        value: p.value(),
        formula: p.formula().map(Formula::internal_text),
        instances,
        hidden: p.hidden(),
        locked: p.locked(),
    }
}

fn value_changed(old: f64, new: f64) -> bool {
    !(old == new || (old.is_nan() && new.is_nan()))
}
