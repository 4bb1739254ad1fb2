//! Axis conventions between the capture system and the drone.
//!
//! The capture system reports `(X, Y, Z)` with Y up. The flight controller
//! works in `(Z, X, Y)`: horizontal axis 1 is capture Z, horizontal axis 2 is
//! capture X and the vertical axis is capture Y.

use nalgebra::{Quaternion, UnitQuaternion, Vector3};

/// Permute a capture-frame position into the drone frame.
pub fn capture_to_drone(capture: [f64; 3]) -> Vector3<f64> {
    let [x, y, z] = capture;
    Vector3::new(z, x, y)
}

/// Convert an `(x, y, z, w)` quaternion to `(roll, pitch, yaw)` in radians.
///
/// A degenerate (zero-norm) quaternion yields all zeros.
pub fn quaternion_to_euler(orientation: [f64; 4]) -> [f64; 3] {
    let [x, y, z, w] = orientation;
    match UnitQuaternion::try_new(Quaternion::new(w, x, y, z), 1e-12) {
        Some(q) => {
            let (roll, pitch, yaw) = q.euler_angles();
            [roll, pitch, yaw]
        }
        None => [0.0; 3],
    }
}
