//! Cross-view albedo consistency estimation.
//!
//! Photometric stereo recovers each view's albedo map only up to a per-view
//! scale. This module estimates a per-view multiplicative correction by
//! sampling foreground pixels, locating their surface points on a reference
//! mesh, reprojecting the points into the two ring neighbors, and pooling
//! the per-channel albedo ratios. The per-view medians are chained around
//! the rig (view 0 anchors the chain at 1) and the chain is normalized so
//! the corrections are centered around one.
//!
//! Missing intersections, occluded neighbors, out-of-bounds reprojections,
//! and zero interpolated albedos are all routine per-sample rejections, not
//! errors.

extern crate cgmath;
extern crate embree_rs;
extern crate indicatif;
extern crate rand;
extern crate rayon;

use cgmath::prelude::*;
use cgmath::{Point3, Vector3};
use indicatif::{ParallelProgressIterator, ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;

use std::convert::TryInto;

use crate::camera::ViewCamera;
use crate::images::Raster;
use crate::mesh::first_hit;
use crate::Error;

pub(crate) fn progress_bar(length: u64, message: &str, verbose: bool) -> ProgressBar {
    if !verbose {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(length);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg} [{bar:40}] {percent}% ({eta})")
            .progress_chars("#-"),
    );
    pb.set_message(message);
    pb
}

/// Tuning knobs for the estimator.
#[derive(Debug, Clone)]
pub struct ScaleConfig {
    /// Per-view sample budget.
    pub sample_budget: usize,
    /// Derive the budget from the masks instead: three quarters of the mean
    /// foreground size, capped by the smallest foreground size.
    pub budget_from_masks: bool,
    /// Base seed for the per-view pixel samplers.
    pub seed: u64,
    /// Offset along the occlusion ray to step off the surface.
    pub occlusion_eps: f64,
    /// Fail with [`Error::InsufficientSamples`] when a view's ratio pool is
    /// empty instead of falling back to a unit ratio.
    pub strict: bool,
    pub verbose: bool,
}

impl Default for ScaleConfig {
    fn default() -> Self {
        ScaleConfig {
            sample_budget: 2000,
            budget_from_masks: false,
            seed: 0,
            occlusion_eps: 1e-3,
            strict: false,
            verbose: false,
        }
    }
}

fn resolve_budget(config: &ScaleConfig, mask_pixels: &[Vec<(usize, usize)>]) -> usize {
    if !config.budget_from_masks {
        return config.sample_budget;
    }
    let smallest = mask_pixels.iter().map(|m| m.len()).min().unwrap_or(0);
    let mean = mask_pixels.iter().map(|m| m.len()).sum::<usize>() / mask_pixels.len().max(1);
    (mean * 3 / 4).min(smallest)
}

/// Uniform subset of the mask pixels, without replacement. A mask smaller
/// than the budget is returned whole.
fn sample_mask_pixels(
    pixels: &[(usize, usize)],
    budget: usize,
    rng: &mut StdRng,
) -> Vec<(usize, usize)> {
    if pixels.len() <= budget {
        return pixels.to_vec();
    }
    rand::seq::index::sample(rng, pixels.len(), budget)
        .iter()
        .map(|i| pixels[i])
        .collect()
}

/// Surface points of a view's sampled pixels, with their albedo values.
struct SurfaceSamples {
    points: Vec<Point3<f64>>,
    albedo: Vec<Vector3<f64>>,
}

fn collect_surface_samples(
    scene: &embree_rs::CommittedScene,
    camera: &ViewCamera,
    albedo: &Raster,
    mask_pixels: &[(usize, usize)],
    budget: usize,
    rng: &mut StdRng,
) -> SurfaceSamples {
    let picked = sample_mask_pixels(mask_pixels, budget, rng);

    let mut intersection_ctx = embree_rs::IntersectContext::coherent();
    let mut points = Vec::with_capacity(picked.len());
    let mut values = Vec::with_capacity(picked.len());
    for (x, y) in picked {
        let (origin, dir) = camera.pixel_ray(x as f64, y as f64);
        // a pixel whose ray misses the mesh is dropped, masks do not align
        // exactly with the mesh silhouette
        if let Some(point) = first_hit(scene, &mut intersection_ctx, origin, dir) {
            points.push(point);
            values.push(Vector3::new(
                albedo.get(x, y, 0) as f64,
                albedo.get(x, y, 1) as f64,
                albedo.get(x, y, 2) as f64,
            ));
        }
    }
    SurfaceSamples {
        points,
        albedo: values,
    }
}

/// Reprojection bounds test; the upper margin of one pixel keeps the
/// bilinear footprint inside the image.
pub fn reprojection_in_bounds(u: f64, v: f64, width: usize, height: usize) -> bool {
    u >= 0.0 && u < (width - 1) as f64 && v >= 0.0 && v < (height - 1) as f64
}

/// Albedo ratios of one view's surface samples against one neighbor:
/// occlusion-test every sample toward the neighbor's center, reproject the
/// survivors, bilinearly read the neighbor's albedo, and keep
/// `sample / neighbor` per channel.
fn neighbor_ratios(
    scene: &embree_rs::CommittedScene,
    samples: &SurfaceSamples,
    neighbor: &ViewCamera,
    neighbor_albedo: &Raster,
    eps: f64,
) -> Vec<Vector3<f64>> {
    if samples.points.is_empty() {
        return Vec::new();
    }

    let mut intersection_ctx = embree_rs::IntersectContext::coherent();
    let center = neighbor.center_point();

    // Rays from each surface point toward the neighbor camera, stepped off
    // the surface by eps and stopped just short of the camera.
    let mut rays = Vec::with_capacity(samples.points.len());
    for point in &samples.points {
        let to_camera = center - point;
        let dist = to_camera.magnitude();
        let dir = to_camera / dist;
        let origin = point + dir * eps;
        let mut ray = embree_rs::Ray::new(
            origin.cast::<f32>().unwrap().to_vec(),
            dir.cast::<f32>().unwrap(),
        );
        ray.tfar = (dist - eps) as f32;
        rays.push(ray);
    }
    scene.occluded_stream_aos(&mut intersection_ctx, &mut rays);

    let (w, h) = (neighbor_albedo.width(), neighbor_albedo.height());
    rays.iter()
        .zip(samples.points.iter().zip(samples.albedo.iter()))
        .filter(|(ray, _)| !ray.tfar.is_infinite())
        .filter_map(|(_, (point, albedo))| {
            let (u, v) = neighbor.project(*point);
            if !reprojection_in_bounds(u, v, w, h) {
                return None;
            }
            let interp = Vector3::new(
                neighbor_albedo.bilinear(u, v, 0) as f64,
                neighbor_albedo.bilinear(u, v, 1) as f64,
                neighbor_albedo.bilinear(u, v, 2) as f64,
            );
            // an exactly zero channel is background
            if interp.x == 0.0 || interp.y == 0.0 || interp.z == 0.0 {
                return None;
            }
            Some(Vector3::new(
                albedo.x / interp.x,
                albedo.y / interp.y,
                albedo.z / interp.z,
            ))
        })
        .collect()
}

/// Per-channel median of a ratio pool; `None` when the pool is empty.
pub fn median3(pool: &[Vector3<f64>]) -> Option<Vector3<f64>> {
    if pool.is_empty() {
        return None;
    }
    let mut out = Vector3::new(0.0, 0.0, 0.0);
    for c in 0..3 {
        let mut values: Vec<f64> = pool.iter().map(|v| v[c]).collect();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let n = values.len();
        out[c] = if n % 2 == 1 {
            values[n / 2]
        } else {
            (values[n / 2 - 1] + values[n / 2]) / 2.0
        };
    }
    Some(out)
}

/// Chain the per-view neighbor medians around the rig and center the result:
/// `prop[0] = 1`, `prop[k+1] = prop[k] * medians[k]`, then divide by the
/// per-channel mean over all views.
pub fn propagate(medians: &[Vector3<f64>]) -> Vec<Vector3<f64>> {
    let n = medians.len();
    let mut prop = vec![Vector3::new(1.0, 1.0, 1.0); n];
    for k in 0..n.saturating_sub(1) {
        prop[k + 1] = prop[k].mul_element_wise(medians[k]);
    }

    let mut mean = Vector3::new(0.0, 0.0, 0.0);
    for p in &prop {
        mean += *p / n as f64;
    }
    prop.into_iter().map(|p| p.div_element_wise(mean)).collect()
}

/// Estimate the per-view albedo scale corrections for a ring of views.
///
/// `albedos` are three-channel rasters, `masks` single-channel foreground
/// masks. Sampling, back-projection, and neighbor reprojection run in
/// parallel across views; the final chain propagation is sequential in view
/// order.
pub fn estimate_scale_ratios(
    scene: &embree_rs::CommittedScene,
    cameras: &[ViewCamera],
    albedos: &[Raster],
    masks: &[Raster],
    config: &ScaleConfig,
) -> Result<Vec<Vector3<f64>>, Error> {
    assert_eq!(cameras.len(), albedos.len());
    assert_eq!(cameras.len(), masks.len());
    let n = cameras.len();
    if n == 0 {
        return Err(Error::MissingInput("no views to estimate".to_string()));
    }

    let mask_pixels: Vec<Vec<(usize, usize)>> =
        masks.iter().map(|m| m.nonzero_pixels()).collect();
    let budget = resolve_budget(config, &mask_pixels);
    if config.verbose {
        println!("Number of samples per view: {}", budget);
    }

    // Stages A-E are independent per view.
    let pools: Vec<(Vec<Vector3<f64>>, Vec<Vector3<f64>>)> = (0..n)
        .into_par_iter()
        .progress_with(progress_bar(
            n.try_into().unwrap(),
            "Computing ratios",
            config.verbose,
        ))
        .map(|i| {
            if mask_pixels[i].len() < budget {
                println!(
                    "Warning: view {} has only {} mask pixels, requested {} samples.",
                    i,
                    mask_pixels[i].len(),
                    budget
                );
            }
            let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(i as u64));
            let samples = collect_surface_samples(
                scene,
                &cameras[i],
                &albedos[i],
                &mask_pixels[i],
                budget,
                &mut rng,
            );
            let right = (i + 1) % n;
            let left = (i + n - 1) % n;
            let right_ratios = neighbor_ratios(
                scene,
                &samples,
                &cameras[right],
                &albedos[right],
                config.occlusion_eps,
            );
            let left_ratios = neighbor_ratios(
                scene,
                &samples,
                &cameras[left],
                &albedos[left],
                config.occlusion_eps,
            );
            (right_ratios, left_ratios)
        })
        .collect();

    // Pool per view: its own right-neighbor ratios plus the reciprocals of
    // the next view's left-neighbor ratios; both estimate
    // albedo_i / albedo_{i+1}.
    let mut medians = Vec::with_capacity(n);
    for i in 0..n {
        let mut pool = pools[i].0.clone();
        pool.extend(
            pools[(i + 1) % n]
                .1
                .iter()
                .map(|r| Vector3::new(1.0 / r.x, 1.0 / r.y, 1.0 / r.z)),
        );
        match median3(&pool) {
            Some(m) => medians.push(m),
            None => {
                if config.strict {
                    return Err(Error::InsufficientSamples(i));
                }
                println!(
                    "Warning: view {} produced no usable cross-view samples, assuming ratio 1.",
                    i
                );
                medians.push(Vector3::new(1.0, 1.0, 1.0));
            }
        }
    }

    Ok(propagate(&medians))
}

#[test]
fn test_median3() {
    let pool = vec![
        Vector3::new(1.0, 10.0, 2.0),
        Vector3::new(3.0, 30.0, 2.0),
        Vector3::new(2.0, 20.0, 100.0),
    ];
    let m = median3(&pool).unwrap();
    assert_eq!(m, Vector3::new(2.0, 20.0, 2.0));

    // even pools average the two middle values
    let pool = vec![
        Vector3::new(1.0, 1.0, 1.0),
        Vector3::new(2.0, 2.0, 2.0),
        Vector3::new(3.0, 3.0, 3.0),
        Vector3::new(100.0, 100.0, 100.0),
    ];
    assert_eq!(median3(&pool).unwrap(), Vector3::new(2.5, 2.5, 2.5));

    assert!(median3(&[]).is_none());
}

#[test]
fn test_propagate_normalized() {
    let medians = vec![
        Vector3::new(1.0, 1.0, 1.0),
        Vector3::new(0.5, 1.0, 2.0),
        Vector3::new(2.0, 1.0, 0.5),
        Vector3::new(1.0, 1.0, 1.0),
    ];
    let prop = propagate(&medians);
    assert_eq!(prop.len(), 4);

    // deterministic
    assert_eq!(prop, propagate(&medians));

    // per-channel mean is one after normalization
    let mut mean = Vector3::new(0.0, 0.0, 0.0);
    for p in &prop {
        mean += *p / 4.0;
    }
    for c in 0..3 {
        assert!((mean[c] - 1.0).abs() < 1e-12);
    }

    // relative scales follow the chained medians
    assert!((prop[2].x / prop[1].x - 0.5).abs() < 1e-12);
    assert!((prop[3].x / prop[2].x - 2.0).abs() < 1e-12);
}

#[test]
fn test_reprojection_bounds() {
    let (w, h) = (640, 480);
    assert!(reprojection_in_bounds(5.0, 5.0, w, h));
    assert!(!reprojection_in_bounds(-1.0, 5.0, w, h));
    assert!(!reprojection_in_bounds(5.0, 480.0, w, h));
    assert!(!reprojection_in_bounds(5.0, 479.5, w, h));
    assert!(!reprojection_in_bounds(639.5, 5.0, w, h));
}

#[test]
fn test_sample_budget_respects_mask_size() {
    let pixels: Vec<(usize, usize)> = (0..500).map(|i| (i % 25, i / 25)).collect();
    let mut rng = StdRng::seed_from_u64(0);
    // a mask smaller than the budget yields every mask pixel
    assert_eq!(sample_mask_pixels(&pixels, 2000, &mut rng).len(), 500);

    let picked = sample_mask_pixels(&pixels, 100, &mut rng);
    assert_eq!(picked.len(), 100);
    // without replacement
    let mut unique = picked.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), 100);

    // same seed, same subset
    let mut a = StdRng::seed_from_u64(7);
    let mut b = StdRng::seed_from_u64(7);
    assert_eq!(
        sample_mask_pixels(&pixels, 100, &mut a),
        sample_mask_pixels(&pixels, 100, &mut b)
    );
}

#[test]
fn test_budget_from_masks() {
    let masks: Vec<Vec<(usize, usize)>> = vec![
        (0..100).map(|i| (i, 0)).collect(),
        (0..200).map(|i| (i, 1)).collect(),
        (0..300).map(|i| (i, 2)).collect(),
    ];
    let config = ScaleConfig {
        budget_from_masks: true,
        ..ScaleConfig::default()
    };
    // 75% of the mean (150) capped by the smallest mask (100)
    assert_eq!(resolve_budget(&config, &masks), 100);

    let fixed = ScaleConfig::default();
    assert_eq!(resolve_budget(&fixed, &masks), 2000);
}
