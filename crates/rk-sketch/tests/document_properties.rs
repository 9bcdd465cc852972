//! End-to-end behaviour of the kernel through `Document`

use std::collections::BTreeSet;
use std::sync::Arc;

use approx::assert_relative_eq;
use glam::DVec3;
use parking_lot::Mutex;
use rk_sketch::parameter::FormulaError;
use rk_sketch::{
    Axis, ChangeEvent, ChangeKind, Document, DocumentError, EntityRef, EventFilter, ParameterError, Sketch,
    SketchResult,
};
use uuid::Uuid;

fn recorder(doc: &mut Document, filter: EventFilter) -> Arc<Mutex<Vec<ChangeEvent>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    doc.subscribe(filter, move |e| sink.lock().push(e.clone()));
    log
}

fn polygon(sketch: &mut Sketch, coords: &[(f64, f64)]) -> SketchResult<(Vec<Uuid>, Vec<Uuid>)> {
    let kps: Vec<Uuid> = coords
        .iter()
        .map(|(x, y)| sketch.create_key_point(DVec3::new(*x, *y, 0.0)))
        .collect();
    let mut edges = Vec::new();
    for i in 0..kps.len() {
        edges.push(sketch.create_line_edge(kps[i], kps[(i + 1) % kps.len()])?);
    }
    Ok((kps, edges))
}

const UNIT_SQUARE: [(f64, f64); 4] = [(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)];

fn sorted_areas(doc: &Document, sketch: Uuid) -> BTreeSet<Vec<Uuid>> {
    let sketch = doc.sketch(sketch).unwrap();
    sketch
        .areas()
        .map(|a| {
            let mut edges = a.edge_ids().to_vec();
            edges.sort();
            edges
        })
        .collect()
}

#[test]
fn test_formula_tracks_upstream_changes() {
    let mut doc = Document::new("Formulas");
    let width = doc.create_parameter(None, Some("width"), 3.0).unwrap();
    let height = doc.create_parameter(None, Some("height"), 2.0).unwrap();
    let area = doc.create_parameter(None, Some("area"), 0.0).unwrap();

    doc.set_parameter_formula(area, "width * height + sqrt(16)").unwrap();
    assert_relative_eq!(doc.params().value(area).unwrap(), 10.0);

    doc.set_parameter_value(width, 5.0).unwrap();
    assert_relative_eq!(doc.params().value(area).unwrap(), 14.0);

    doc.set_parameter_formula(height, "width / 2").unwrap();
    assert_relative_eq!(doc.params().value(area).unwrap(), 16.5);
}

#[test]
fn test_self_reference_leaves_parameter_intact() {
    let mut doc = Document::new("Formulas");
    let base = doc.create_parameter(None, Some("base"), 2.0).unwrap();
    let x = doc.create_parameter(None, Some("x"), 0.0).unwrap();
    doc.set_parameter_formula(x, "base + 1").unwrap();
    let log = recorder(&mut doc, EventFilter::All);

    let result = doc.set_parameter_formula(x, "x * 2");
    assert!(matches!(
        result,
        Err(DocumentError::Parameter(ParameterError::Formula(FormulaError::SelfReference(_))))
    ));
    assert_eq!(doc.params().value(x), Some(3.0));
    assert_eq!(doc.params().formula_text(x).as_deref(), Some("base+1"));
    assert!(log.lock().is_empty());

    doc.set_parameter_value(base, 4.0).unwrap();
    assert_eq!(doc.params().value(x), Some(5.0));
}

#[test]
fn test_child_scope_shadows_global_name() {
    let mut doc = Document::new("Scopes");
    let global = doc.create_parameter(None, Some("X"), 1.0).unwrap();
    let sketch = doc.create_sketch("Part").unwrap();
    let scope = doc.sketch(sketch).unwrap().scope();
    let local = doc.create_parameter(Some(scope), Some("X"), 7.0).unwrap();
    let user = doc.create_parameter(Some(scope), Some("twice"), 0.0).unwrap();

    assert_eq!(doc.params().resolve_name(scope, "X"), Some(local));
    assert_eq!(doc.find_parameter("X"), Some(global));

    doc.set_parameter_formula(user, "X * 2").unwrap();
    assert_eq!(doc.params().value(user), Some(14.0));
}

#[test]
fn test_unit_square_encloses_one_area() {
    let mut doc = Document::new("Areas");
    let sketch = doc.create_sketch("Square").unwrap();
    let (_, edges) = doc.edit_sketch(sketch, |s, _| polygon(s, &UNIT_SQUARE)).unwrap();

    let detected = doc.edit_sketch(sketch, |s, _| s.detect_areas()).unwrap();
    assert_eq!(detected.len(), 1);
    assert!(detected[0].enclosed);
    assert_eq!(detected[0].edges.len(), 4);

    let created = doc.edit_sketch(sketch, |s, _| s.create_all_areas()).unwrap();
    assert_eq!(created.len(), 1);
    let s = doc.sketch(sketch).unwrap();
    let area = s.view().area(created[0]).unwrap();
    assert!(area.inside(DVec3::new(0.5, 0.5, 0.0)));
    assert!(!area.inside(DVec3::new(1.5, 0.5, 0.0)));
    for edge in edges {
        assert!(area.area().contains_edge(edge));
    }
}

#[test]
fn test_figure_eight_splits_at_shared_vertex() {
    let mut doc = Document::new("Areas");
    let sketch = doc.create_sketch("Bowtie").unwrap();
    doc.edit_sketch(sketch, |s, _| {
        let center = s.create_key_point(DVec3::ZERO);
        let upper_left = s.create_key_point(DVec3::new(-1.0, 1.0, 0.0));
        let lower_left = s.create_key_point(DVec3::new(-1.0, -1.0, 0.0));
        let upper_right = s.create_key_point(DVec3::new(1.0, 1.0, 0.0));
        let lower_right = s.create_key_point(DVec3::new(1.0, -1.0, 0.0));
        for (a, b) in [
            (center, upper_left),
            (upper_left, lower_left),
            (lower_left, center),
            (center, upper_right),
            (upper_right, lower_right),
            (lower_right, center),
        ] {
            s.create_line_edge(a, b)?;
        }
        s.create_all_areas()
    })
    .unwrap();

    let areas = sorted_areas(&doc, sketch);
    assert_eq!(areas.len(), 2);
    assert!(areas.iter().all(|edges| edges.len() == 3));
}

#[test]
fn test_fillet_does_not_change_core_loop() {
    let mut doc = Document::new("Areas");
    let radius = doc.create_parameter(None, Some("radius"), 0.2).unwrap();
    let sketch = doc.create_sketch("Rounded").unwrap();
    let (kps, _) = doc.edit_sketch(sketch, |s, _| polygon(s, &UNIT_SQUARE)).unwrap();
    let before = doc.edit_sketch(sketch, |s, _| s.detect_areas()).unwrap();

    let fillet = doc
        .edit_sketch(sketch, |s, params| s.create_fillet_edge(params, kps[2], radius))
        .unwrap();
    let after = doc.edit_sketch(sketch, |s, _| s.detect_areas()).unwrap();

    assert_eq!(before.len(), 1);
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].edges.len(), 5);
    assert_eq!(after[0].edges[4], fillet);
    let core: BTreeSet<Uuid> = after[0].edges[..4].iter().copied().collect();
    let original: BTreeSet<Uuid> = before[0].edges.iter().copied().collect();
    assert_eq!(core, original);

    doc.set_parameter_value(radius, 0.3).unwrap();
    let s = doc.sketch(sketch).unwrap();
    assert_eq!(s.edge(fillet).unwrap().meta("r"), Some(0.3));
}

#[test]
fn test_detection_is_repeatable() {
    let mut doc = Document::new("Areas");
    let sketch = doc.create_sketch("Domino").unwrap();
    doc.edit_sketch(sketch, |s, _| {
        let (kps, _) = polygon(s, &[(0.0, 0.0), (1.0, 0.0), (2.0, 0.0), (2.0, 1.0), (1.0, 1.0), (0.0, 1.0)])?;
        s.create_line_edge(kps[1], kps[4])?;
        s.create_all_areas()
    })
    .unwrap();
    let first = sorted_areas(&doc, sketch);

    doc.edit_sketch(sketch, |s, _| s.create_all_areas()).unwrap();
    let second = sorted_areas(&doc, sketch);

    let reversed = doc
        .edit_sketch(sketch, |s, _| {
            let mut order = s.edge_ids().to_vec();
            order.reverse();
            s.find_areas(&order)
        })
        .unwrap();
    let third: BTreeSet<Vec<Uuid>> = reversed
        .into_iter()
        .map(|b| {
            let mut edges = b.edges;
            edges.sort();
            edges
        })
        .collect();

    assert_eq!(first.len(), 3);
    assert_eq!(first, second);
    assert_eq!(first, third);
}

#[test]
fn test_key_point_removal_cascades() {
    let mut doc = Document::new("Cascade");
    let sketch = doc.create_sketch("Square").unwrap();
    let (kps, edges) = doc.edit_sketch(sketch, |s, _| polygon(s, &UNIT_SQUARE)).unwrap();
    let areas = doc.edit_sketch(sketch, |s, _| s.create_all_areas()).unwrap();
    let log = recorder(&mut doc, EventFilter::Kinds(vec![ChangeKind::Deleted]));

    doc.edit_sketch(sketch, |s, _| s.remove_key_point(kps[0])).unwrap();

    let deleted: Vec<EntityRef> = log.lock().iter().map(|e| e.object).collect();
    assert!(deleted.contains(&EntityRef::KeyPoint(kps[0])));
    assert!(deleted.contains(&EntityRef::Edge(edges[0])));
    assert!(deleted.contains(&EntityRef::Edge(edges[3])));
    assert!(deleted.contains(&EntityRef::Area(areas[0])));
    assert!(!deleted.contains(&EntityRef::Edge(edges[1])));

    let s = doc.sketch(sketch).unwrap();
    assert_eq!(s.edge_ids(), &[edges[1], edges[2]]);
    assert_eq!(s.areas().count(), 0);
}

#[test]
fn test_parametric_document_survives_reload() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bracket.ron");

    let mut doc = Document::new("Bracket");
    let side = doc.create_parameter(None, Some("side"), 1.0).unwrap();
    let sketch = doc.create_sketch("Plate").unwrap();
    let corner = doc
        .edit_sketch(sketch, |s, params| {
            let (kps, _) = polygon(s, &UNIT_SQUARE)?;
            s.bind_key_point_axis(params, kps[1], Axis::X, side)?;
            s.bind_key_point_axis(params, kps[2], Axis::X, side)?;
            s.bind_key_point_axis(params, kps[2], Axis::Y, side)?;
            s.bind_key_point_axis(params, kps[3], Axis::Y, side)?;
            s.create_all_areas()?;
            Ok(kps[2])
        })
        .unwrap();
    doc.save(&path).unwrap();

    let mut loaded = Document::load(&path).unwrap();
    assert!(loaded.load_report().is_clean());
    loaded.set_parameter_value(side, 3.0).unwrap();

    let s = loaded.sketch(sketch).unwrap();
    assert_eq!(s.key_point(corner).unwrap().position(), DVec3::new(3.0, 3.0, 0.0));
    let area = s.area_ids()[0];
    assert!(s.view().area(area).unwrap().inside(DVec3::new(2.5, 2.5, 0.0)));
}
