//! Quaternion helpers for the (w, x, y, z) layout used by the filter state.

use nalgebra::{Matrix3, Matrix4, Quaternion, RowVector4, SMatrix, UnitQuaternion, Vector3, Vector4};

/// Default norm below which a quaternion is treated as degenerate.
pub const MIN_QUAT_NORM: f64 = 1e-10;

pub fn identity() -> Vector4<f64> {
    Vector4::new(1.0, 0.0, 0.0, 0.0)
}

/// Normalize to unit length. Input with norm below `min_norm` (or non-finite)
/// falls back to identity.
pub fn normalize(q: &Vector4<f64>, min_norm: f64) -> Vector4<f64> {
    let norm = q.norm();
    if norm < min_norm || !norm.is_finite() {
        return identity();
    }
    q / norm
}

/// Body-to-world rotation matrix.
///
/// Normalizes defensively; a quaternion with norm below `min_norm` yields the
/// identity rather than dividing by a near-zero value.
pub fn rotation_matrix(q: &Vector4<f64>, min_norm: f64) -> Matrix3<f64> {
    let norm = q.norm();
    if norm < min_norm || !norm.is_finite() {
        return Matrix3::identity();
    }
    let (w, x, y, z) = (q[0] / norm, q[1] / norm, q[2] / norm, q[3] / norm);

    Matrix3::new(
        1.0 - 2.0 * (y * y + z * z),
        2.0 * (x * y - w * z),
        2.0 * (x * z + w * y),
        2.0 * (x * y + w * z),
        1.0 - 2.0 * (x * x + z * z),
        2.0 * (y * z - w * x),
        2.0 * (x * z - w * y),
        2.0 * (y * z + w * x),
        1.0 - 2.0 * (x * x + y * y),
    )
}

/// Ω(ω) such that dq/dt = ½·Ω(ω)·q for a body-frame rate ω.
pub fn omega_matrix(w: &Vector3<f64>) -> Matrix4<f64> {
    Matrix4::from_rows(&[
        RowVector4::new(0.0, -w.x, -w.y, -w.z),
        RowVector4::new(w.x, 0.0, w.z, -w.y),
        RowVector4::new(w.y, -w.z, 0.0, w.x),
        RowVector4::new(w.z, w.y, -w.x, 0.0),
    ])
}

/// Predicted body-frame gravity h(q) = Rᵗ·(0, 0, g).
pub fn gravity_in_body(q: &Vector4<f64>, gravity: f64, min_norm: f64) -> Vector3<f64> {
    rotation_matrix(q, min_norm).transpose() * Vector3::new(0.0, 0.0, gravity)
}

/// ∂h/∂q for h(q) = g·[2(xz − wy), 2(yz + wx), 1 − 2x² − 2y²].
pub fn gravity_jacobian(q: &Vector4<f64>, gravity: f64) -> SMatrix<f64, 3, 4> {
    let (w, x, y, z) = (q[0], q[1], q[2], q[3]);
    let g2 = 2.0 * gravity;

    SMatrix::<f64, 3, 4>::from_rows(&[
        RowVector4::new(-g2 * y, g2 * z, -g2 * w, g2 * x),
        RowVector4::new(g2 * x, g2 * w, g2 * z, g2 * y),
        RowVector4::new(0.0, -2.0 * g2 * x, -2.0 * g2 * y, 0.0),
    ])
}

/// Roll, pitch, yaw [rad] for status reporting.
pub fn euler_angles(q: &Vector4<f64>) -> (f64, f64, f64) {
    let unit = UnitQuaternion::from_quaternion(Quaternion::new(q[0], q[1], q[2], q[3]));
    unit.euler_angles()
}
