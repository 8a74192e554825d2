//! Pointer driver seam
//!
//! The driver supplies the shared reference point every tick and performs
//! synthesized pointer actions for `click`/`down`/`up`/`drag`. A desktop
//! integration would implement [`PointerDriver`] against the OS; the
//! headless [`VirtualPointer`] keeps the state in memory.

use parking_lot::Mutex;

use super::entity::Point;

/// Pointer button.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Button {
    /// Primary button
    Left,
    /// Secondary button
    Right,
    /// Wheel button
    Middle,
}

impl Button {
    /// Button for a protocol index: 0 left, 1 right, 2 middle. Out of range
    /// indices are clamped.
    pub fn from_index(index: u8) -> Button {
        match index {
            0 => Button::Left,
            1 => Button::Right,
            _ => Button::Middle,
        }
    }

    fn slot(self) -> usize {
        match self {
            Button::Left => 0,
            Button::Right => 1,
            Button::Middle => 2,
        }
    }
}

/// Source of the reference point and sink for synthesized pointer input.
pub trait PointerDriver: Send + Sync {
    /// Current reference point.
    fn position(&self) -> Point;

    /// Move the pointer to `to`.
    fn move_to(&self, to: Point);

    /// Press `button` at the current position.
    fn press(&self, button: Button);

    /// Release `button` at the current position.
    fn release(&self, button: Button);
}

#[derive(Debug, Default)]
struct PointerState {
    position: Point,
    pressed: [bool; 3],
    actions: u64,
}

/// In-memory pointer.
#[derive(Debug, Default)]
pub struct VirtualPointer {
    state: Mutex<PointerState>,
}

impl VirtualPointer {
    /// Pointer resting at `start`.
    pub fn new(start: Point) -> Self {
        Self {
            state: Mutex::new(PointerState {
                position: start,
                ..PointerState::default()
            }),
        }
    }

    /// Whether `button` is currently held.
    pub fn is_pressed(&self, button: Button) -> bool {
        self.state.lock().pressed[button.slot()]
    }

    /// Number of actions performed so far.
    pub fn action_count(&self) -> u64 {
        self.state.lock().actions
    }
}

impl PointerDriver for VirtualPointer {
    fn position(&self) -> Point {
        self.state.lock().position
    }

    fn move_to(&self, to: Point) {
        let mut state = self.state.lock();
        state.position = to;
        state.actions += 1;
        tracing::trace!(x = to.x, y = to.y, "pointer move");
    }

    fn press(&self, button: Button) {
        let mut state = self.state.lock();
        state.pressed[button.slot()] = true;
        state.actions += 1;
        tracing::debug!(?button, x = state.position.x, y = state.position.y, "pointer press");
    }

    fn release(&self, button: Button) {
        let mut state = self.state.lock();
        state.pressed[button.slot()] = false;
        state.actions += 1;
        tracing::debug!(?button, x = state.position.x, y = state.position.y, "pointer release");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_position_and_buttons() {
        let pointer = VirtualPointer::new(Point::new(1.0, 2.0));
        assert_eq!(pointer.position(), Point::new(1.0, 2.0));

        pointer.move_to(Point::new(5.0, 6.0));
        pointer.press(Button::Right);
        assert!(pointer.is_pressed(Button::Right));
        assert!(!pointer.is_pressed(Button::Left));
        pointer.release(Button::Right);
        assert!(!pointer.is_pressed(Button::Right));

        assert_eq!(pointer.position(), Point::new(5.0, 6.0));
        assert_eq!(pointer.action_count(), 3);
    }

    #[test]
    fn button_indices() {
        assert_eq!(Button::from_index(0), Button::Left);
        assert_eq!(Button::from_index(1), Button::Right);
        assert_eq!(Button::from_index(2), Button::Middle);
        assert_eq!(Button::from_index(9), Button::Middle);
    }
}
