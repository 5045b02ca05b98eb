//! Behavioral tests for the two-stage clustering public surface

use diarium::diarization::clustering::{ahc_cluster, vbx_refine, VbxOptions};
use ndarray::Array2;
use rstest::rstest;
use tokio_util::sync::CancellationToken;

fn axis(dim: usize, index: usize, scale: f64) -> Vec<f64> {
    let mut v = vec![0.0; dim];
    v[index] = scale;
    v
}

fn options() -> VbxOptions {
    VbxOptions {
        fa: 0.07,
        fb: 0.8,
        max_iterations: 20,
        convergence_tolerance: 1e-4,
    }
}

#[test]
fn ahc_orthogonal_axes_stay_singletons() {
    let rho: Vec<Vec<f64>> = (0..4).map(|i| axis(4, i, 1.0)).collect();
    assert_eq!(ahc_cluster(&rho, 0.9).unwrap(), vec![0, 1, 2, 3]);
}

#[test]
fn ahc_duplicates_against_opposite() {
    let v = axis(3, 0, 1.0);
    let neg: Vec<f64> = v.iter().map(|x| -x).collect();
    let rho = vec![v.clone(), v.clone(), v, neg];
    assert_eq!(ahc_cluster(&rho, 0.5).unwrap(), vec![0, 0, 0, 1]);
}

#[rstest]
#[case(0)]
#[case(1)]
fn ahc_degenerate_sizes(#[case] n: usize) {
    let rho: Vec<Vec<f64>> = (0..n).map(|_| axis(4, 0, 1.0)).collect();
    let labels = ahc_cluster(&rho, 0.6).unwrap();
    assert_eq!(labels.len(), n);
    if n == 1 {
        assert_eq!(labels, vec![0]);
    }
}

#[test]
fn ahc_normalization_ignores_magnitude() {
    // Same direction at very different scales still clusters together.
    let rho = vec![axis(4, 0, 0.001), axis(4, 0, 100.0), axis(4, 1, 1.0)];
    let labels = ahc_cluster(&rho, 0.6).unwrap();
    assert_eq!(labels[0], labels[1]);
    assert_ne!(labels[0], labels[2]);
}

#[test]
fn ahc_labels_are_contiguous() {
    let rho: Vec<Vec<f64>> = (0..6).map(|i| axis(8, i % 3, 2.0)).collect();
    let labels = ahc_cluster(&rho, 0.8).unwrap();
    let k = labels.iter().max().unwrap() + 1;
    for cluster in 0..k {
        assert!(labels.contains(&cluster), "label {} missing in {:?}", cluster, labels);
    }
    assert!(k <= rho.len());
}

#[test]
fn vbx_single_cluster_warm_start_recovers() {
    let dim = 8;
    let n = 50;
    let mut rho = Array2::zeros((n, dim));
    for t in 0..n {
        rho[[t, 0]] = 2.0 + 0.001 * t as f64;
    }
    let result = vbx_refine(
        &rho,
        &vec![0usize; n],
        &[1.0; 8],
        &options(),
        &CancellationToken::new(),
    )
    .unwrap();

    assert_eq!(result.pi, vec![1.0]);
    for row in result.gamma.rows() {
        assert!((row[0] - 1.0).abs() < 1e-9);
    }
    assert!(result.labels.iter().all(|&l| l == 0));
}

#[test]
fn vbx_preserves_well_separated_warm_start() {
    let dim = 6;
    let mut rho = Array2::zeros((20, dim));
    for t in 0..10 {
        rho[[t, 0]] = 3.0;
        rho[[10 + t, 1]] = 3.0;
    }
    let labels: Vec<usize> = (0..20).map(|t| t / 10).collect();
    let result = vbx_refine(&rho, &labels, &[1.0; 6], &options(), &CancellationToken::new())
        .unwrap();

    assert_eq!(result.labels, labels);
    let pi_total: f64 = result.pi.iter().sum();
    assert!((pi_total - 1.0).abs() < 1e-6);
    for row in result.gamma.rows() {
        assert!((row.sum() - 1.0).abs() < 1e-6);
    }
}

#[test]
fn vbx_elbo_trace_is_monotone_and_converges() {
    let dim = 4;
    let mut rho = Array2::zeros((30, dim));
    for t in 0..15 {
        rho[[t, 0]] = 2.5 + 0.01 * t as f64;
        rho[[15 + t, 2]] = 2.5 + 0.01 * t as f64;
    }
    let labels: Vec<usize> = (0..30).map(|t| t / 15).collect();
    let result = vbx_refine(&rho, &labels, &[2.0; 4], &options(), &CancellationToken::new())
        .unwrap();

    assert!(!result.elbo_trace.is_empty());
    assert!(result.elbo_trace.len() <= 20);
    for pair in result.elbo_trace.windows(2) {
        assert!(pair[1] >= pair[0] - 1e-6);
    }
}
