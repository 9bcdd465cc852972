//! Clamped uniform B-spline sampling for nurbs edges

use glam::DVec3;

/// Find the knot span containing `t`
fn find_span(knots: &[f64], last: usize, degree: usize, t: f64) -> usize {
    if t >= knots[last + 1] {
        return last;
    }
    if t <= knots[degree] {
        return degree;
    }
    let mut low = degree;
    let mut high = last + 1;
    let mut mid = (low + high) / 2;
    while t < knots[mid] || t >= knots[mid + 1] {
        if t < knots[mid] {
            high = mid;
        } else {
            low = mid;
        }
        mid = (low + high) / 2;
    }
    mid
}

/// Non-zero basis functions `N[span-degree..=span]` at `t`
fn basis_functions(knots: &[f64], span: usize, degree: usize, t: f64) -> Vec<f64> {
    let mut n = vec![0.0; degree + 1];
    let mut left = vec![0.0; degree + 1];
    let mut right = vec![0.0; degree + 1];
    n[0] = 1.0;

    for j in 1..=degree {
        left[j] = t - knots[span + 1 - j];
        right[j] = knots[span + j] - t;
        let mut saved = 0.0;
        for r in 0..j {
            let denom = right[r + 1] + left[j - r];
            if denom.abs() < 1e-30 {
                continue;
            }
            let temp = n[r] / denom;
            n[r] = saved + right[r + 1] * temp;
            saved = left[j - r] * temp;
        }
        n[j] = saved;
    }

    n
}

fn clamped_knots(count: usize, degree: usize) -> Vec<f64> {
    let m = count + degree + 1;
    let mut knots = vec![0.0; m];
    let internal = m - 2 * (degree + 1);
    for i in 0..=degree {
        knots[m - 1 - i] = 1.0;
    }
    for i in 1..=internal {
        knots[degree + i] = i as f64 / (internal + 1) as f64;
    }
    knots
}

/// Sample a clamped uniform B-spline through `controls`.
///
/// Two or fewer control points are returned unchanged as a polyline. The
/// degree is reduced when there are too few control points for it.
pub fn sample_clamped_bspline(controls: &[DVec3], degree: usize, samples: usize) -> Vec<DVec3> {
    if controls.len() <= 2 || samples < 2 {
        return controls.to_vec();
    }
    let degree = degree.clamp(1, controls.len() - 1);
    let knots = clamped_knots(controls.len(), degree);
    let last = controls.len() - 1;

    (0..samples)
        .map(|i| {
            let t = i as f64 / (samples - 1) as f64;
            let span = find_span(&knots, last, degree, t);
            basis_functions(&knots, span, degree, t)
                .iter()
                .enumerate()
                .fold(DVec3::ZERO, |acc, (k, b)| acc + controls[span - degree + k] * *b)
        })
        .collect()
}
