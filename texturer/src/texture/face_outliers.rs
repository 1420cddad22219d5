use std::str::FromStr;

use log::info;
use rayon::prelude::*;

use base::defs::{Error, ErrorKind::*, Result};

use crate::texture::*;

/// Median deviation allowed per color channel when no threshold is given.
pub const MEDIAN_DEFAULT_THRESHOLD: f64 = 0.15 * 255.0;
/// Gaussian likelihood below which a view is rejected when no threshold is
/// given.
pub const GAUSS_DEFAULT_THRESHOLD: f64 = 6e-2;

const GAUSS_MIN_COVARIANCE: f64 = 1e-3;
const GAUSS_MAX_ITERATIONS: usize = 10;
const GAUSS_MIN_INLIERS: usize = 4;
const GAUSS_DAMPING_FACTOR: f64 = 0.2;
const MEDIAN_MIN_INLIERS: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutlierMethod {
    Median,
    Gauss,
    // Keeps every view but scales its quality by the Gaussian likelihood.
    GaussDamping,
}

impl FromStr for OutlierMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "median" => Ok(OutlierMethod::Median),
            "gauss" => Ok(OutlierMethod::Gauss),
            "gauss-damping" => Ok(OutlierMethod::GaussDamping),
            _ => {
                let desc = format!("unknown outlier method '{}'", s);
                Err(Error::new(BadParameter, desc))
            }
        }
    }
}

/// Drops the views whose face color disagrees with the majority. Returns
/// false when detection was skipped and the data left untouched.
pub fn detect_face_outliers(
    datas: &mut FaceDataArr,
    method: OutlierMethod,
    threshold: f64,
) -> bool {
    match method {
        OutlierMethod::Median => median_outliers(datas, threshold),
        OutlierMethod::Gauss => gauss_outliers(datas, threshold, false),
        OutlierMethod::GaussDamping => gauss_outliers(datas, threshold, true),
    }
}

fn median_outliers(datas: &mut FaceDataArr, threshold: f64) -> bool {
    let threshold = if threshold > 0.0 {
        threshold
    } else {
        MEDIAN_DEFAULT_THRESHOLD
    };
    if datas.len() <= 3 {
        return false;
    }

    let mut median = Vector3::zeros();
    for c in 0..3 {
        let mut channel: Vec<f64> = datas.iter().map(|d| d.color[c]).collect();
        channel.sort_by(|a, b| a.total_cmp(b));
        median[c] = channel[channel.len() / 2];
    }

    let inliers: Vec<bool> = datas
        .iter()
        .map(|d| (d.color - median).iter().all(|v| v.abs() <= threshold))
        .collect();
    let num_inliers = inliers.iter().filter(|&&b| b).count();
    if num_inliers == datas.len() {
        return true;
    }
    if num_inliers < MEDIAN_MIN_INLIERS {
        return false;
    }
    retain_inliers(datas, &inliers);
    true
}

fn retain_inliers(datas: &mut FaceDataArr, inliers: &[bool]) {
    let mut flags = inliers.iter();
    datas.retain(|_| *flags.next().unwrap_or(&false));
}

fn gauss_value(color: &Vector3, mean: &Vector3, cov_inv: &Matrix3) -> f64 {
    let x = color - mean;
    (-0.5 * x.dot(&(cov_inv * x))).exp()
}

fn gauss_outliers(datas: &mut FaceDataArr, threshold: f64, damping: bool) -> bool {
    let threshold = if threshold > 0.0 {
        threshold
    } else {
        GAUSS_DEFAULT_THRESHOLD
    };
    if datas.len() <= GAUSS_MIN_INLIERS {
        return false;
    }

    let mut inliers = vec![true; datas.len()];
    let mut mean = Vector3::zeros();
    let mut cov_inv = Matrix3::zeros();
    for _ in 0..GAUSS_MAX_ITERATIONS {
        let colors: Vec<Vector3> = datas
            .iter()
            .zip(&inliers)
            .filter(|(_, inlier)| **inlier)
            .map(|(d, _)| d.color)
            .collect();
        mean = colors.iter().sum::<Vector3>() / colors.len() as f64;
        let covariance = colors
            .iter()
            .map(|c| (c - mean) * (c - mean).transpose())
            .sum::<Matrix3>()
            / (colors.len() - 1) as f64;

        if covariance.amax() < GAUSS_MIN_COVARIANCE {
            // All inliers agree.
            retain_inliers(datas, &inliers);
            return true;
        }
        cov_inv = match covariance.try_inverse() {
            Some(inv) if inv.iter().all(|v| v.is_finite()) => inv,
            _ => return false,
        };

        let mut changed = false;
        for (d, inlier) in datas.iter().zip(inliers.iter_mut()) {
            let accepted = gauss_value(&d.color, &mean, &cov_inv) > threshold;
            changed |= accepted != *inlier;
            *inlier = accepted;
        }
        let num_inliers = inliers.iter().filter(|&&b| b).count();
        if num_inliers == datas.len() {
            return true;
        }
        if num_inliers < GAUSS_MIN_INLIERS {
            return false;
        }
        if !changed {
            break;
        }
    }

    if damping {
        let cov_inv = cov_inv * GAUSS_DAMPING_FACTOR;
        for d in datas.iter_mut() {
            d.quality *= gauss_value(&d.color, &mean, &cov_inv);
        }
    } else {
        retain_inliers(datas, &inliers);
    }
    true
}

/// Runs outlier detection over all faces in parallel.
pub fn filter_outliers(
    faces_datas: &mut [FaceDataArr],
    method: OutlierMethod,
    threshold: f64,
) {
    info!("  filtering outlier views ({:?})...", method);
    let views_before: usize = faces_datas.iter().map(|d| d.len()).sum();
    let skipped = faces_datas
        .par_iter_mut()
        .filter(|d| d.len() > 1)
        .map(|d| !detect_face_outliers(d, method, threshold))
        .filter(|&skipped| skipped)
        .count();
    let views_after: usize = faces_datas.iter().map(|d| d.len()).sum();
    info!(
        "  removed {} outlier views, detection skipped for {} faces",
        views_before - views_after,
        skipped
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datas(colors: &[[f64; 3]]) -> FaceDataArr {
        colors
            .iter()
            .enumerate()
            .map(|(view, c)| FaceData {
                view,
                quality: 1.0,
                color: Vector3::new(c[0], c[1], c[2]),
            })
            .collect()
    }

    fn corner_cluster_with_outlier() -> FaceDataArr {
        let mut colors = vec![];
        for _ in 0..2 {
            for i in 0..8 {
                let s = |bit: usize| if i & bit == 0 { -10.0 } else { 10.0 };
                colors.push([100.0 + s(1), 100.0 + s(2), 100.0 + s(4)]);
            }
        }
        colors.push([250.0, 100.0, 100.0]);
        datas(&colors)
    }

    #[test]
    fn test_median_keeps_majority() {
        let mut colors = vec![[200.0; 3]; 8];
        colors.insert(3, [10.0; 3]);
        colors.push([10.0; 3]);
        let mut d = datas(&colors);
        assert!(detect_face_outliers(&mut d, OutlierMethod::Median, 0.0));
        assert_eq!(d.len(), 8);
        assert!(d.iter().all(|d| d.color == Vector3::new(200.0, 200.0, 200.0)));
        assert!(!d.iter().any(|d| d.view == 3 || d.view == 9));
    }

    #[test]
    fn test_median_skips_small_or_split_sets() {
        let mut d = datas(&[[0.0; 3], [100.0; 3], [200.0; 3]]);
        assert!(!detect_face_outliers(&mut d, OutlierMethod::Median, 0.0));
        assert_eq!(d.len(), 3);

        let mut d = datas(&[[0.0; 3], [100.0; 3], [200.0; 3], [250.0; 3]]);
        assert!(!detect_face_outliers(&mut d, OutlierMethod::Median, 0.0));
        assert_eq!(d.len(), 4);
    }

    #[test]
    fn test_gauss_rejects_far_color() {
        let mut d = corner_cluster_with_outlier();
        assert!(detect_face_outliers(&mut d, OutlierMethod::Gauss, 0.0));
        assert_eq!(d.len(), 16);
        assert!(d.iter().all(|d| d.view < 16));
    }

    #[test]
    fn test_gauss_damping_keeps_views() {
        let mut d = corner_cluster_with_outlier();
        assert!(detect_face_outliers(&mut d, OutlierMethod::GaussDamping, 0.0));
        assert_eq!(d.len(), 17);
        assert!(d[16].quality < d[0].quality);
    }

    #[test]
    fn test_gauss_degenerate_cases() {
        // Identical colors: nothing to reject.
        let mut d = datas(&[[50.0; 3]; 6]);
        assert!(detect_face_outliers(&mut d, OutlierMethod::Gauss, 0.0));
        assert_eq!(d.len(), 6);

        // Perfectly correlated channels: covariance is not invertible.
        let mut colors = vec![[200.0; 3]; 8];
        colors.extend([[10.0; 3], [10.0; 3]]);
        let mut d = datas(&colors);
        assert!(!detect_face_outliers(&mut d, OutlierMethod::Gauss, 0.0));
        assert_eq!(d.len(), 10);

        let mut d = datas(&[[0.0; 3], [100.0; 3], [200.0; 3], [250.0; 3]]);
        assert!(!detect_face_outliers(&mut d, OutlierMethod::Gauss, 0.0));
    }

    #[test]
    fn test_outlier_method_parsing() {
        assert_eq!("median".parse::<OutlierMethod>().unwrap(), OutlierMethod::Median);
        assert!("mean".parse::<OutlierMethod>().is_err());
    }
}
