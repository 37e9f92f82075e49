//! Projective camera decomposition and coordinate convention handling.
//!
//! Cameras arrive as 3x4 world-to-image projection matrices `P = K[R|t]`
//! (OpenCV convention, y down, camera looks down +z). This module splits
//! them back into an intrinsic matrix and a camera-to-world pose, and
//! converts poses between the OpenCV and OpenGL (y up, camera looks down
//! -z) conventions.

extern crate cgmath;
extern crate nalgebra as na;

use na::{Matrix3, Matrix3x4, Matrix4, Vector3, U1, U3};

use crate::Error;

/// RQ decomposition of a 3x3 matrix into an upper-triangular factor and an
/// orthogonal factor, built on QR of the permuted transpose.
/// See https://math.stackexchange.com/a/1640762
fn rq(a: Matrix3<f64>) -> (Matrix3<f64>, Matrix3<f64>) {
    let p = Matrix3::new(0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 0.0);
    let a_tilde = p * a;

    let qr = na::linalg::QR::new(a_tilde.transpose());
    let q_tilde = qr.q();
    let r_tilde = qr.r();

    let q = p * q_tilde.transpose();
    let r = p * r_tilde.transpose() * p;
    (r, q)
}

/// Decompose a 3x4 projection matrix into a 4x4 intrinsic matrix and a 4x4
/// camera-to-world pose.
///
/// The intrinsic matrix is normalized so `K[2,2] = 1` with positive focal
/// lengths; the pose holds the transposed rotation and the camera center
/// `-M^-1 p4`. Fails with [`Error::DegenerateCamera`] when the leading 3x3
/// block of `P` is singular.
pub fn decompose_projection(p: &Matrix3x4<f64>) -> Result<(Matrix4<f64>, Matrix4<f64>), Error> {
    let m: Matrix3<f64> = p.fixed_slice::<U3, U3>(0, 0).into_owned();

    let scale = m.norm();
    if m.determinant().abs() <= 1e-10 * scale * scale * scale {
        return Err(Error::DegenerateCamera(format!(
            "leading 3x3 block of projection is singular: {:?}",
            p
        )));
    }

    let (mut k, mut r) = rq(m);

    // Fix signs so the diagonal of K is non-negative. The projection is only
    // defined up to scale, so a left-handed rotation is rescued by negating
    // both factors; K[2,2] then carries the sign and the final
    // normalization restores fx, fy > 0.
    for i in 0..3 {
        if k[(i, i)] < 0.0 {
            for j in 0..3 {
                k[(j, i)] = -k[(j, i)];
                r[(i, j)] = -r[(i, j)];
            }
        }
    }
    if r.determinant() < 0.0 {
        k = -k;
        r = -r;
    }
    k /= k[(2, 2)];

    let m_inv = m
        .try_inverse()
        .ok_or_else(|| Error::DegenerateCamera("projection is not invertible".to_string()))?;
    let p4: Vector3<f64> = p.column(3).into_owned();
    let center = -(m_inv * p4);

    let mut intrinsics = Matrix4::identity();
    intrinsics.fixed_slice_mut::<U3, U3>(0, 0).copy_from(&k);

    let mut pose = Matrix4::identity();
    pose.fixed_slice_mut::<U3, U3>(0, 0).copy_from(&r.transpose());
    pose.fixed_slice_mut::<U3, U1>(0, 3).copy_from(&center);

    Ok((intrinsics, pose))
}

/// Convert a camera-to-world pose from OpenCV to OpenGL convention by
/// flipping the y and z axes. Applying it twice is the identity.
pub fn cv_to_gl(m: &Matrix4<f64>) -> Matrix4<f64> {
    let flip = Matrix4::new(
        1.0, 0.0, 0.0, 0.0, //
        0.0, -1.0, 0.0, 0.0, //
        0.0, 0.0, -1.0, 0.0, //
        0.0, 0.0, 0.0, 1.0,
    );
    flip * m
}

/// Convert a camera-to-world pose from OpenGL to OpenCV convention.
pub fn gl_to_cv(m: &Matrix4<f64>) -> Matrix4<f64> {
    cv_to_gl(m)
}

/// A decomposed pinhole camera: intrinsics, camera-to-world rotation, and
/// camera center, ready for per-pixel ray construction and reprojection.
#[derive(Debug, Clone)]
pub struct ViewCamera {
    pub k: Matrix3<f64>,
    pub k_inv: Matrix3<f64>,
    pub r_c2w: Matrix3<f64>,
    pub center: Vector3<f64>,
}

impl ViewCamera {
    /// Build a camera from the 4x4 intrinsic and pose matrices returned by
    /// [`decompose_projection`].
    pub fn new(intrinsics: &Matrix4<f64>, pose: &Matrix4<f64>) -> Self {
        let k: Matrix3<f64> = intrinsics.fixed_slice::<U3, U3>(0, 0).into_owned();
        // K is upper triangular with non-zero diagonal, always invertible
        let k_inv = k.try_inverse().unwrap();
        ViewCamera {
            k,
            k_inv,
            r_c2w: pose.fixed_slice::<U3, U3>(0, 0).into_owned(),
            center: pose.fixed_slice::<U3, U1>(0, 3).into_owned(),
        }
    }

    /// World-space ray through the given pixel, as origin and unit direction.
    pub fn pixel_ray(&self, x: f64, y: f64) -> (cgmath::Point3<f64>, cgmath::Vector3<f64>) {
        let on_ray = self.r_c2w * (self.k_inv * Vector3::new(x, y, 1.0)) + self.center;
        let dir = (on_ray - self.center).normalize();
        (
            cgmath::Point3::new(self.center[0], self.center[1], self.center[2]),
            cgmath::Vector3::new(dir[0], dir[1], dir[2]),
        )
    }

    /// Project a world point to pixel coordinates.
    pub fn project(&self, p: cgmath::Point3<f64>) -> (f64, f64) {
        let pw = Vector3::new(p.x, p.y, p.z);
        let pc = self.r_c2w.transpose() * (pw - self.center);
        let q = self.k * pc;
        (q[0] / q[2], q[1] / q[2])
    }

    /// Camera center as a cgmath point, for ray targets.
    pub fn center_point(&self) -> cgmath::Point3<f64> {
        cgmath::Point3::new(self.center[0], self.center[1], self.center[2])
    }
}

#[cfg(test)]
fn synthetic_projection(
    k: &Matrix3<f64>,
    r: &Matrix3<f64>,
    center: &Vector3<f64>,
) -> Matrix3x4<f64> {
    let t = -(r * center);
    let mut p = Matrix3x4::zeros();
    p.fixed_slice_mut::<U3, U3>(0, 0).copy_from(&(k * r));
    p.fixed_slice_mut::<U3, U1>(0, 3).copy_from(&(k * t));
    p
}

#[test]
fn test_decompose_round_trip() {
    let k = Matrix3::new(800.0, 0.0, 320.0, 0.0, 820.0, 240.0, 0.0, 0.0, 1.0);
    let axis = na::Unit::new_normalize(Vector3::new(0.3, -1.0, 0.2));
    let r = *na::Rotation3::from_axis_angle(&axis, 0.7).matrix();
    let center = Vector3::new(1.5, -0.3, 4.0);

    // the decomposition must be invariant to the projective scale, sign
    // included
    for scale in &[1.0, 2.5, -1.0] {
        let p = synthetic_projection(&k, &r, &center) * *scale;
        let (intrinsics, pose) = decompose_projection(&p).unwrap();

        let k_out: Matrix3<f64> = intrinsics.fixed_slice::<U3, U3>(0, 0).into_owned();
        let r_out: Matrix3<f64> = pose.fixed_slice::<U3, U3>(0, 0).into_owned();
        let c_out: Vector3<f64> = pose.fixed_slice::<U3, U1>(0, 3).into_owned();

        assert!((k_out - k).norm() < 1e-4 * k.norm(), "K mismatch: {}", k_out);
        assert!((r_out - r.transpose()).norm() < 1e-6, "R mismatch: {}", r_out);
        assert!((c_out - center).norm() < 1e-6, "center mismatch: {}", c_out);
    }
}

#[test]
fn test_decompose_positive_focals() {
    let k = Matrix3::new(640.0, 0.0, 100.0, 0.0, 640.0, 120.0, 0.0, 0.0, 1.0);
    let r = *na::Rotation3::from_axis_angle(&na::Unit::new_normalize(Vector3::x()), -1.2).matrix();
    let p = synthetic_projection(&k, &r, &Vector3::new(0.0, 2.0, -1.0));
    let (intrinsics, _) = decompose_projection(&p).unwrap();
    assert!(intrinsics[(0, 0)] > 0.0);
    assert!(intrinsics[(1, 1)] > 0.0);
    assert!((intrinsics[(2, 2)] - 1.0).abs() < 1e-12);
}

#[test]
fn test_decompose_degenerate() {
    // rank-2 leading block
    let p = Matrix3x4::new(
        1.0, 0.0, 0.0, 3.0, //
        2.0, 0.0, 0.0, 1.0, //
        0.0, 0.0, 1.0, 0.5,
    );
    match decompose_projection(&p) {
        Err(Error::DegenerateCamera(_)) => (),
        other => panic!("expected DegenerateCamera, got {:?}", other),
    }
}

#[test]
fn test_convention_involution() {
    let m = Matrix4::new(
        0.1, 0.2, 0.3, 0.4, //
        0.5, 0.6, 0.7, 0.8, //
        0.9, 1.0, 1.1, 1.2, //
        1.3, 1.4, 1.5, 1.6,
    );
    assert_eq!(cv_to_gl(&cv_to_gl(&m)), m);
    assert_eq!(gl_to_cv(&cv_to_gl(&m)), m);
}

#[test]
fn test_pixel_ray_project_inverse() {
    let k = Matrix3::new(500.0, 0.0, 250.0, 0.0, 500.0, 200.0, 0.0, 0.0, 1.0);
    let axis = na::Unit::new_normalize(Vector3::new(0.0, 1.0, 0.1));
    let r = *na::Rotation3::from_axis_angle(&axis, 0.4).matrix();
    let center = Vector3::new(-2.0, 0.5, 1.0);
    let p = synthetic_projection(&k, &r, &center);
    let (intrinsics, pose) = decompose_projection(&p).unwrap();
    let camera = ViewCamera::new(&intrinsics, &pose);

    let (origin, dir) = camera.pixel_ray(100.5, 200.25);
    let point = cgmath::Point3::new(
        origin.x + 2.0 * dir.x,
        origin.y + 2.0 * dir.y,
        origin.z + 2.0 * dir.z,
    );
    let (u, v) = camera.project(point);
    assert!((u - 100.5).abs() < 1e-8);
    assert!((v - 200.25).abs() < 1e-8);
}
