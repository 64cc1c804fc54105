use winit::event::*;

use crate::command::Command;

use cgmath::{InnerSpace, Matrix4, Point3, Vector3};

use crate::renderer::OPENGL_TO_WGPU_MATRIX;

#[derive(Debug, Clone)]
pub struct Camera {
    pub eye: Point3<f32>,
    pub target: Point3<f32>,
    pub up: Vector3<f32>,
    pub aspect: f32,
    /// Camera constant: the focal distance in viewport half-heights. The
    /// vertical field of view is `2 * atan(1 / constant)`.
    pub constant: f32,
    pub znear: f32,
    pub zfar: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            // Slightly above and behind the normalized unit cube, looking
            // at its center. +z is out of the screen.
            eye: (0.5, 0.7, 2.2).into(),
            target: (0.5, 0.5, 0.5).into(),
            up: cgmath::Vector3::unit_y(),
            constant: 1.0,
            aspect: 1.0,
            znear: 0.001,
            zfar: 100.0,
        }
    }
}

impl Camera {
    pub fn build_view_projection_matrix(&self) -> Matrix4<f32> {
        let view = Matrix4::look_at_rh(self.eye, self.target, self.up);
        let fovy = cgmath::Rad(2.0 * (1.0 / self.constant).atan());
        let proj = cgmath::perspective(fovy, self.aspect, self.znear, self.zfar);
        OPENGL_TO_WGPU_MATRIX * proj * view
    }
}

/// Elevation stops just short of the poles so the up vector never
/// degenerates.
const MAX_ELEVATION: f32 = 1.55;

/// The eye never comes closer to the target than this, in units of the
/// normalized model cube.
const MIN_RADIUS: f32 = 0.002;

/// Orbit controller around the model center. Dolly is multiplicative in the
/// orbit radius, so approaching the cloud slows down as the cut refines and
/// a key press changes the projected box sizes by a bounded factor at any
/// depth.
pub struct CameraController {
    speed: f32,
    dolly: f32,
    orbit: f32,
    elevate: f32,
}

impl CameraController {
    pub fn new(speed: f32) -> Self {
        Self {
            speed,
            dolly: 0.0,
            orbit: 0.0,
            elevate: 0.0,
        }
    }

    /// Maps key state onto the three orbit axes; the latest key event on an
    /// axis wins.
    pub fn handle_camera_commands(&mut self, command: &Command) -> bool {
        let Command::KeyEvent { key, state } = command else {
            return false;
        };
        let rate = if *state == ElementState::Pressed {
            1.0
        } else {
            0.0
        };
        match key {
            VirtualKeyCode::W | VirtualKeyCode::Up => self.dolly = rate,
            VirtualKeyCode::S | VirtualKeyCode::Down => self.dolly = -rate,
            VirtualKeyCode::A | VirtualKeyCode::Left => self.orbit = rate,
            VirtualKeyCode::D | VirtualKeyCode::Right => self.orbit = -rate,
            VirtualKeyCode::Q | VirtualKeyCode::PageUp => self.elevate = rate,
            VirtualKeyCode::E | VirtualKeyCode::PageDown => self.elevate = -rate,
            _ => return false,
        }
        true
    }

    /// Advances the orbit by one frame: the eye is kept on a sphere around
    /// the target, parameterized by radius, azimuth and elevation.
    pub fn update_camera(&self, camera: &mut Camera) {
        if self.dolly == 0.0 && self.orbit == 0.0 && self.elevate == 0.0 {
            return;
        }

        let offset = camera.eye - camera.target;
        let radius = offset.magnitude();

        let mut azimuth = offset.z.atan2(offset.x);
        let mut elevation = (offset.y / radius).asin();

        // One notch of dolly scales the distance, never crossing the target.
        let radius = (radius * (1.0 - self.dolly * self.speed)).max(MIN_RADIUS);

        azimuth += self.orbit * self.speed;
        elevation =
            (elevation + self.elevate * self.speed).clamp(-MAX_ELEVATION, MAX_ELEVATION);

        let (sin_el, cos_el) = elevation.sin_cos();
        let (sin_az, cos_az) = azimuth.sin_cos();
        camera.eye = camera.target
            + Vector3::new(radius * cos_el * cos_az, radius * sin_el, radius * cos_el * sin_az);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgmath::SquareMatrix;

    fn press(key: VirtualKeyCode) -> Command {
        Command::KeyEvent {
            key,
            state: ElementState::Pressed,
        }
    }

    #[test]
    fn view_projection_is_invertible() {
        let camera = Camera::default();
        let matrix = camera.build_view_projection_matrix();
        assert!(matrix.invert().is_some());
    }

    #[test]
    fn dolly_scales_distance_and_stops_at_target() {
        let mut camera = Camera::default();
        let start = (camera.eye - camera.target).magnitude();
        let mut controller = CameraController::new(0.1);
        controller.handle_camera_commands(&press(VirtualKeyCode::W));

        controller.update_camera(&mut camera);
        let after_one = (camera.eye - camera.target).magnitude();
        assert!((after_one - start * 0.9).abs() < 1e-5);

        // However long the key is held, the eye never reaches the target.
        for _ in 0..1000 {
            controller.update_camera(&mut camera);
        }
        assert!((camera.eye - camera.target).magnitude() >= MIN_RADIUS * 0.99);
    }

    #[test]
    fn orbit_preserves_distance() {
        let mut camera = Camera::default();
        let start = (camera.eye - camera.target).magnitude();
        let mut controller = CameraController::new(0.2);
        controller.handle_camera_commands(&press(VirtualKeyCode::A));
        for _ in 0..7 {
            controller.update_camera(&mut camera);
        }
        let after = (camera.eye - camera.target).magnitude();
        assert!((after - start).abs() < 1e-4);
        assert_ne!(camera.eye, Camera::default().eye);
    }

    #[test]
    fn elevation_clamps_short_of_the_pole() {
        let mut camera = Camera::default();
        let mut controller = CameraController::new(0.3);
        controller.handle_camera_commands(&press(VirtualKeyCode::Q));
        for _ in 0..100 {
            controller.update_camera(&mut camera);
        }
        let offset = camera.eye - camera.target;
        let elevation = (offset.y / offset.magnitude()).asin();
        assert!(elevation <= MAX_ELEVATION + 1e-4);
        // The up vector stays usable: the view matrix remains invertible.
        assert!(camera.build_view_projection_matrix().invert().is_some());
    }

    #[test]
    fn releasing_a_key_stops_the_axis() {
        let mut camera = Camera::default();
        let mut controller = CameraController::new(0.1);
        controller.handle_camera_commands(&press(VirtualKeyCode::W));
        controller.update_camera(&mut camera);
        let moved = camera.eye;

        controller.handle_camera_commands(&Command::KeyEvent {
            key: VirtualKeyCode::W,
            state: ElementState::Released,
        });
        controller.update_camera(&mut camera);
        assert_eq!(camera.eye, moved);
    }
}
