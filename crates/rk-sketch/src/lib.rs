//! Parametric Sketch Kernel
//!
//! This crate provides:
//! - Formula-driven parameters in hierarchical scopes, with eager
//!   re-evaluation of dependents
//! - Planar sketches built from key points and edges (lines, arcs, circles,
//!   fillets, polylines and NURBS curves)
//! - Automatic detection of the closed areas an edge network encloses
//! - Text annotations and sketches inserted into other sketches
//! - A document container that routes changes and persists to RON or JSON

pub mod constants;
pub mod document;
pub mod event;
pub mod geometry;
pub mod parameter;
pub mod sketch;

// Re-exports for convenience
pub use document::{
    DanglingReference, Document, DocumentData, DocumentError, DocumentResult, LoadReport, SharedDocument,
};
pub use event::{
    ChangeDetail, ChangeEvent, ChangeKind, EntityRef, EventBus, EventBusConfig, EventFilter, EventQueue,
    SubscriptionId,
};
pub use geometry::Axis;
pub use parameter::{
    Formula, FormulaError, Parameter, ParameterChange, ParameterError, ParameterResult, ParameterScope,
    ParameterStore,
};
pub use sketch::{
    Area, AreaKind, AreaView, Branch, Edge, EdgeKind, EdgeView, HorizontalAlignment, InstanceView, KeyPoint,
    Sketch, SketchError, SketchInstance, SketchResult, SketchSettings, SketchView, Text, TextKind,
    VerticalAlignment,
};
