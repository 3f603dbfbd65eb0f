//! Pure 6-DoF motion math: axis conditioning, rotation orthonormalization,
//! pivot matrices, and affine composition. No I/O, no `await` — everything
//! here is directly unit-testable.

use nalgebra::{Matrix3, Matrix4, Rotation3, Vector3};

use crate::config::SpinAxis;

const AXIS_MAX: f64 = 350.0;

/// Deadzone + gamma response curve, applied independently per axis.
///
/// Odd and monotonic non-decreasing in `|v|` by construction; zero on
/// `[-deadzone+1, deadzone-1]`. At `gamma == 1.0` this is the identity
/// outside the deadzone, up to float rounding from the normalize/curve
/// round trip.
pub fn condition_axis(v: i32, deadzone: i32, gamma: f64) -> f64 {
    let v = f64::from(v);
    if v.abs() < f64::from(deadzone) {
        return 0.0;
    }
    let normalized = (v.abs() / AXIS_MAX).min(1.0);
    let curved = normalized.powf(gamma);
    v.signum() * curved * AXIS_MAX
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConditionedAxes {
    pub tx: f64,
    pub ty: f64,
    pub tz: f64,
    pub rx: f64,
    pub ry: f64,
    pub rz: f64,
}

impl ConditionedAxes {
    pub fn is_zero(&self) -> bool {
        [self.tx, self.ty, self.tz, self.rx, self.ry, self.rz]
            .iter()
            .all(|v| *v == 0.0)
    }
}

#[allow(clippy::too_many_arguments)]
pub fn condition_all(
    tx: i32,
    ty: i32,
    tz: i32,
    rx: i32,
    ry: i32,
    rz: i32,
    deadzone: i32,
    gamma: f64,
) -> ConditionedAxes {
    ConditionedAxes {
        tx: condition_axis(tx, deadzone, gamma),
        ty: condition_axis(ty, deadzone, gamma),
        tz: condition_axis(tz, deadzone, gamma),
        rx: condition_axis(rx, deadzone, gamma),
        ry: condition_axis(ry, deadzone, gamma),
        rz: condition_axis(rz, deadzone, gamma),
    }
}

/// A 4x4 row-major affine, interpreted as `point_cam = point_world * M`
/// (row-vector convention, matching the wire format).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Affine(pub Matrix4<f64>);

impl Affine {
    pub fn from_row_major(flat: &[f64; 16]) -> Self {
        Self(Matrix4::from_row_slice(flat))
    }

    pub fn to_row_major(&self) -> [f64; 16] {
        let mut out = [0.0; 16];
        for row in 0..4 {
            for col in 0..4 {
                out[row * 4 + col] = self.0[(row, col)];
            }
        }
        out
    }

    pub fn identity() -> Self {
        Self(Matrix4::identity())
    }

    fn rotation_upper_left(&self) -> Matrix3<f64> {
        self.0.fixed_view::<3, 3>(0, 0).into_owned()
    }

    fn translation_row(&self) -> Vector3<f64> {
        Vector3::new(self.0[(3, 0)], self.0[(3, 1)], self.0[(3, 2)])
    }
}

/// Orthonormalizes the camera rotation embedded (transposed) in the affine's
/// upper-left 3x3 via SVD, forcing `det == +1` by flipping the last row of
/// `V^T` when the raw determinant is negative. Satisfies
/// `R * R^T == I` and `det(R) == +1` for any non-degenerate input.
pub fn camera_rotation(affine: &Affine) -> Matrix3<f64> {
    // The stored block is R_cam^T; transpose back before orthonormalizing.
    let r_cam_raw = affine.rotation_upper_left().transpose();
    let svd = nalgebra::linalg::SVD::new(r_cam_raw, true, true);
    // `compute_u` and `compute_v` are both true above, so both are populated;
    // fall back to the raw (already near-orthonormal) block if that ever changes.
    let u = svd.u.unwrap_or(r_cam_raw);
    let mut v_t = svd.v_t.unwrap_or_else(Matrix3::identity);

    let det = (u * v_t).determinant();
    if det < 0.0 {
        let mut flipped = v_t.row(2).into_owned();
        flipped *= -1.0;
        v_t.set_row(2, &flipped);
    }
    u * v_t
}

/// `pivot_pos` translates by `+pivot`, `pivot_neg` by `-pivot`; the two
/// compose to the identity for any extents.
pub fn pivot_matrices(extents: &[f64; 6]) -> (Matrix4<f64>, Matrix4<f64>) {
    let min = Vector3::new(extents[0], extents[1], extents[2]);
    let max = Vector3::new(extents[3], extents[4], extents[5]);
    let pivot = (min + max) * 0.5;

    let mut pivot_pos = Matrix4::identity();
    pivot_pos[(3, 0)] = pivot.x;
    pivot_pos[(3, 1)] = pivot.y;
    pivot_pos[(3, 2)] = pivot.z;

    let mut pivot_neg = Matrix4::identity();
    pivot_neg[(3, 0)] = -pivot.x;
    pivot_neg[(3, 1)] = -pivot.y;
    pivot_neg[(3, 2)] = -pivot.z;

    (pivot_pos, pivot_neg)
}

fn homogeneous_point(p: Vector3<f64>, affine: &Affine) -> Vector3<f64> {
    let row = nalgebra::Vector4::new(p.x, p.y, p.z, 1.0);
    let transformed = row.transpose() * affine.0;
    Vector3::new(transformed[0], transformed[1], transformed[2])
}

fn rotation_about(axis: SpinAxis, radians: f64) -> Matrix3<f64> {
    let unit = match axis {
        SpinAxis::X => Vector3::x_axis(),
        SpinAxis::Y => Vector3::y_axis(),
        SpinAxis::Z => Vector3::z_axis(),
    };
    Rotation3::from_axis_angle(&unit, radians).into_inner()
}

/// Builds the camera-frame incremental rotation `R_x * R_y * R_z` from
/// conditioned, scaled axis angles (degrees).
fn incremental_rotation(axes: &ConditionedAxes, rot_scale: f64) -> Matrix3<f64> {
    let rx = (axes.rx * rot_scale).to_radians();
    let ry = (axes.ry * rot_scale).to_radians();
    let rz = (-axes.rz * rot_scale).to_radians();
    let r_x = rotation_about(SpinAxis::X, rx);
    let r_y = rotation_about(SpinAxis::Y, ry);
    let r_z = rotation_about(SpinAxis::Z, rz);
    r_x * r_y * r_z
}

fn lift_rotation_to_4x4(r: Matrix3<f64>) -> Matrix4<f64> {
    let mut m = Matrix4::identity();
    for row in 0..3 {
        for col in 0..3 {
            m[(row, col)] = r[(row, col)];
        }
    }
    m
}

pub struct MotionInput {
    pub axes: ConditionedAxes,
    pub trans_scale: f64,
    pub rot_scale: f64,
    pub pending_spin: f64,
    pub spin_axis: SpinAxis,
}

/// Runs steps 5-11 of the motion pipeline: orthonormalize the camera
/// rotation, derive the pivot, compose translation and incremental rotation
/// in camera frame, lift to world frame, and produce the new affine.
///
/// For an all-zero `ConditionedAxes` and no pending spin, returns `affine`
/// bitwise-unchanged (no drift write).
pub fn apply_motion(affine: &Affine, extents: &[f64; 6], input: &MotionInput) -> Affine {
    if input.axes.is_zero() && input.pending_spin == 0.0 {
        return *affine;
    }

    let r_cam = camera_rotation(affine);
    let (pivot_pos, pivot_neg) = pivot_matrices(extents);

    let min = Vector3::new(extents[0], extents[1], extents[2]);
    let max = Vector3::new(extents[3], extents[4], extents[5]);
    let pivot_world = (min + max) * 0.5;
    let pivot_cam = homogeneous_point(pivot_world, affine);
    let dist = pivot_cam.norm().max(1.0);

    let translation = Vector3::new(-input.axes.tx, -input.axes.ty, -input.axes.tz)
        * input.trans_scale
        * dist;

    let mut r_delta_cam = incremental_rotation(&input.axes, input.rot_scale);
    if input.pending_spin != 0.0 {
        let r_spin = rotation_about(input.spin_axis, input.pending_spin);
        r_delta_cam = r_spin * r_delta_cam;
    }

    let r_world = r_cam * r_delta_cam * r_cam.transpose();

    let mut translation_matrix = Matrix4::identity();
    translation_matrix[(3, 0)] = translation.x;
    translation_matrix[(3, 1)] = translation.y;
    translation_matrix[(3, 2)] = translation.z;

    let r_rot = lift_rotation_to_4x4(r_world);
    let new_affine = translation_matrix * affine.0 * (pivot_neg * r_rot * pivot_pos);
    Affine(new_affine)
}

/// Unused by `apply_motion` directly (kept for callers that need just the
/// translation row, e.g. diagnostics) but documents the affine's layout.
pub fn translation_of(affine: &Affine) -> Vector3<f64> {
    affine.translation_row()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_axis_is_odd() {
        for v in [1, 5, 50, 200, 350, 400] {
            let pos = condition_axis(v, 2, 1.3);
            let neg = condition_axis(-v, 2, 1.3);
            assert!((pos + neg).abs() < 1e-9, "v={v} pos={pos} neg={neg}");
        }
    }

    #[test]
    fn condition_axis_zero_inside_deadzone() {
        for v in -9..=9 {
            assert_eq!(condition_axis(v, 10, 1.0), 0.0);
        }
    }

    #[test]
    fn condition_axis_identity_at_gamma_one() {
        for v in [10, 50, 100, 349] {
            let conditioned = condition_axis(v, 2, 1.0);
            assert!((conditioned - f64::from(v)).abs() < 1e-9);
        }
    }

    #[test]
    fn condition_axis_monotonic() {
        let mut prev = 0.0;
        for v in 0..=350 {
            let c = condition_axis(v, 2, 1.0);
            assert!(c >= prev - 1e-9);
            prev = c;
        }
    }

    #[test]
    fn pivot_matrices_are_inverses() {
        let extents = [-1.0, -2.0, -3.0, 4.0, 5.0, 6.0];
        let (pos, neg) = pivot_matrices(&extents);
        let product = pos * neg;
        assert!((product - Matrix4::identity()).norm() < 1e-9);
    }

    #[test]
    fn camera_rotation_is_orthonormal_with_det_one() {
        let mut affine = Matrix4::identity();
        let r = Rotation3::from_euler_angles(0.3, -0.7, 1.1).into_inner();
        // Stored transposed, per the affine convention.
        for row in 0..3 {
            for col in 0..3 {
                affine[(row, col)] = r.transpose()[(row, col)];
            }
        }
        let r_cam = camera_rotation(&Affine(affine));
        let should_be_identity = r_cam * r_cam.transpose();
        assert!((should_be_identity - Matrix3::identity()).norm() < 1e-6);
        assert!((r_cam.determinant() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn zero_motion_produces_bitwise_unchanged_affine() {
        let affine = Affine::from_row_major(&[
            1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 10.0, 20.0, 30.0, 1.0,
        ]);
        let extents = [0.0; 6];
        let input = MotionInput {
            axes: condition_all(0, 0, 0, 0, 0, 0, 2, 1.0),
            trans_scale: 0.00015 * 0.5 / 350.0,
            rot_scale: 0.00015 * 10.0 / 350.0,
            pending_spin: 0.0,
            spin_axis: SpinAxis::Z,
        };
        let result = apply_motion(&affine, &extents, &input);
        assert_eq!(result, affine);
    }

    #[test]
    fn spin_90_about_z_rotates_camera_frame() {
        let affine = Affine::identity();
        let extents = [0.0; 6];
        let input = MotionInput {
            axes: condition_all(0, 0, 0, 0, 0, 0, 2, 1.0),
            trans_scale: 0.0,
            rot_scale: 0.0,
            pending_spin: -std::f64::consts::FRAC_PI_2,
            spin_axis: SpinAxis::Z,
        };
        let result = apply_motion(&affine, &extents, &input);
        let expected_r = rotation_about(SpinAxis::Z, -std::f64::consts::FRAC_PI_2);
        let mut expected = Matrix4::identity();
        for row in 0..3 {
            for col in 0..3 {
                expected[(row, col)] = expected_r[(row, col)];
            }
        }
        assert!((result.0 - expected).norm() < 1e-9);
    }
}
