//! Global constants for rk-sketch

/// Default distance under which two key points are treated as the same point
pub const DEFAULT_COINCIDENCE_THRESHOLD: f64 = 0.1;

/// Distance tolerance for accepting a ray hit on an area edge
pub const RAY_HIT_TOLERANCE: f64 = 0.001;

/// Prefix for auto-named edges ("Edge1", "Edge2", ...)
pub const EDGE_NAME_PREFIX: &str = "Edge";

/// Base name for new areas
pub const AREA_NAME_PREFIX: &str = "New Area";

/// Name of the root parameter scope, also the auto-name prefix for its parameters
pub const GLOBAL_SCOPE_NAME: &str = "Global";

/// Default standard name for parameter presets
pub const DEFAULT_STANDARD: &str = "Normal";

/// Default type name for parameter presets
pub const DEFAULT_TYPE: &str = "Default";

/// Default degree of a nurbs edge when the "n" meta-data is absent
pub const DEFAULT_NURBS_DEGREE: usize = 2;

/// Samples per control point when tessellating a nurbs edge
pub const NURBS_SAMPLES_PER_CONTROL: usize = 20;

/// Edge meta-data key of a radius
pub const META_RADIUS: &str = "r";

/// Edge meta-data key of an arc start angle
pub const META_START_ANGLE: &str = "sa";

/// Edge meta-data key of an arc end angle
pub const META_END_ANGLE: &str = "ea";

/// Edge meta-data key of a nurbs degree
pub const META_DEGREE: &str = "n";

/// Height of a new text annotation
pub const DEFAULT_TEXT_HEIGHT: f64 = 0.01;

/// Default name of a sketch attribute
pub const DEFAULT_ATTRIBUTE_NAME: &str = "Attribute name";
