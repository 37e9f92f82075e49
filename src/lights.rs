//! Light direction generation and Lambertian shading.
//!
//! Photometric stereo trainers consume shaded renders `albedo * max(n.l, 0)`
//! of the recovered normal/albedo maps under a small fixed light rig: three
//! tilts 120 degrees apart at a common slant, expressed in the camera frame.

extern crate cgmath;
extern crate nalgebra as na;

use cgmath::prelude::*;
use cgmath::Vector3;

use crate::images::Raster;

/// Slant of the fixed light rig, degrees from the optical axis.
pub const DEFAULT_SLANT_DEG: f64 = 30.0;

/// The three camera-frame light directions at tilts 0, 120, and 240 degrees.
pub fn light_directions(slant_deg: f64) -> [Vector3<f64>; 3] {
    let slant = slant_deg.to_radians();
    let mut out = [Vector3::new(0.0, 0.0, 0.0); 3];
    for (i, tilt_deg) in [0.0f64, 120.0, 240.0].iter().enumerate() {
        let tilt = tilt_deg.to_radians();
        out[i] = -Vector3::new(
            slant.sin() * tilt.cos(),
            slant.sin() * tilt.sin(),
            slant.cos(),
        );
    }
    out
}

/// Rotate a camera-frame light direction into the world frame.
pub fn light_to_world(r_c2w: &na::Matrix3<f64>, light: Vector3<f64>) -> Vector3<f64> {
    let v = r_c2w * na::Vector3::new(light.x, light.y, light.z);
    Vector3::new(v[0], v[1], v[2])
}

/// Shade a view: `albedo * max(n.l, 0)` per pixel and channel. The caller
/// attaches the mask as alpha on save; pixels outside it shade to whatever
/// the (meaningless) decoded normal produces there, as with any render of
/// unmasked photometric outputs.
pub fn shade(normal: &Raster, albedo: &Raster, light: Vector3<f64>) -> Raster {
    assert_eq!(normal.width(), albedo.width());
    assert_eq!(normal.height(), albedo.height());
    let (w, h) = (normal.width(), normal.height());

    let mut out = Raster::new(w, h, 3);
    for y in 0..h {
        for x in 0..w {
            let n = Vector3::new(
                normal.get(x, y, 0) as f64,
                normal.get(x, y, 1) as f64,
                normal.get(x, y, 2) as f64,
            );
            let d = n.dot(light).max(0.0);
            for c in 0..3 {
                out.set(x, y, c, (albedo.get(x, y, c) as f64 * d) as f32);
            }
        }
    }
    out
}

#[test]
fn test_light_directions_unit_slant() {
    let lights = light_directions(30.0);
    for l in lights.iter() {
        assert!((l.magnitude() - 1.0).abs() < 1e-12);
        // all at the configured angle from the optical axis
        let cos = l.dot(Vector3::new(0.0, 0.0, -1.0));
        assert!((cos - 30.0f64.to_radians().cos()).abs() < 1e-12);
    }
    // tilts 120 degrees apart: pairwise dots are equal
    let d01 = lights[0].dot(lights[1]);
    let d12 = lights[1].dot(lights[2]);
    assert!((d01 - d12).abs() < 1e-12);
}

#[test]
fn test_shade_facing_normal() {
    let mut normal = Raster::new(1, 1, 3);
    normal.set(0, 0, 0, 0.0);
    normal.set(0, 0, 1, 0.0);
    normal.set(0, 0, 2, -1.0);
    let mut albedo = Raster::new(1, 1, 3);
    for c in 0..3 {
        albedo.set(0, 0, c, 0.8);
    }

    let light = light_directions(30.0)[0];
    let shaded = shade(&normal, &albedo, light);
    let expected = 0.8 * 30.0f64.to_radians().cos() as f32;
    assert!((shaded.get(0, 0, 0) - expected as f32).abs() < 1e-6);

    // a light behind the surface shades to black
    let back = shade(&normal, &albedo, Vector3::new(0.0, 0.0, 1.0));
    assert_eq!(back.get(0, 0, 0), 0.0);
}
