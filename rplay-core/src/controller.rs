//! Controller input sample.
//!
//! A [`ControllerState`] is one instantaneous snapshot of a virtual
//! gamepad. It is a plain `Copy` value: callers build one per input
//! decision and submit it by value, so nothing mutable is ever shared
//! with the uplink task.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

// ── Buttons ──────────────────────────────────────────────────────

bitflags! {
    /// Digital buttons, using the host's bit layout.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct ControllerButton: u32 {
        const CROSS = 1 << 0;
        const MOON = 1 << 1;
        const BOX = 1 << 2;
        const PYRAMID = 1 << 3;
        const DPAD_LEFT = 1 << 4;
        const DPAD_RIGHT = 1 << 5;
        const DPAD_UP = 1 << 6;
        const DPAD_DOWN = 1 << 7;
        const L1 = 1 << 8;
        const R1 = 1 << 9;
        const L3 = 1 << 10;
        const R3 = 1 << 11;
        const OPTIONS = 1 << 12;
        const SHARE = 1 << 13;
        const TOUCHPAD = 1 << 14;
        const PS = 1 << 15;
        const L2 = 1 << 16;
        const R2 = 1 << 17;
    }
}

impl ControllerButton {
    /// Alias of [`MOON`](Self::MOON).
    pub const CIRCLE: Self = Self::MOON;
    /// Alias of [`BOX`](Self::BOX).
    pub const SQUARE: Self = Self::BOX;
    /// Alias of [`PYRAMID`](Self::PYRAMID).
    pub const TRIANGLE: Self = Self::PYRAMID;
    /// Alias of [`OPTIONS`](Self::OPTIONS).
    pub const START: Self = Self::OPTIONS;
}

// ── Touch ────────────────────────────────────────────────────────

/// Number of simultaneous touchpad contacts.
pub const TOUCH_POINTS: usize = 2;

/// One touchpad contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ControllerTouch {
    /// Contact id, `None` while the slot is free.
    pub id: Option<u8>,
    pub x: u16,
    pub y: u16,
}

// ── ControllerState ──────────────────────────────────────────────

/// One input sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControllerState {
    pub buttons: ControllerButton,
    pub l2_state: u8,
    pub r2_state: u8,
    pub left_x: i16,
    pub left_y: i16,
    pub right_x: i16,
    pub right_y: i16,
    pub touches: [ControllerTouch; TOUCH_POINTS],
    pub gyro_x: f32,
    pub gyro_y: f32,
    pub gyro_z: f32,
    pub accel_x: f32,
    pub accel_y: f32,
    pub accel_z: f32,
    pub orient_x: f32,
    pub orient_y: f32,
    pub orient_z: f32,
    pub orient_w: f32,
    touch_id_next: u8,
}

impl Default for ControllerState {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! button_accessors {
    ($($get:ident, $set:ident => $flag:ident;)*) => {
        $(
            #[doc = concat!("Whether `", stringify!($flag), "` is pressed.")]
            pub fn $get(&self) -> bool {
                self.is_pressed(ControllerButton::$flag)
            }

            #[doc = concat!("Press or release `", stringify!($flag), "`.")]
            pub fn $set(&mut self, pressed: bool) {
                self.set_button(ControllerButton::$flag, pressed);
            }
        )*
    };
}

impl ControllerState {
    /// An idle state: nothing pressed, sticks centred, triggers released.
    pub const fn new() -> Self {
        Self {
            buttons: ControllerButton::empty(),
            l2_state: 0,
            r2_state: 0,
            left_x: 0,
            left_y: 0,
            right_x: 0,
            right_y: 0,
            touches: [ControllerTouch { id: None, x: 0, y: 0 }; TOUCH_POINTS],
            gyro_x: 0.0,
            gyro_y: 0.0,
            gyro_z: 0.0,
            accel_x: 0.0,
            accel_y: 1.0,
            accel_z: 0.0,
            orient_x: 0.0,
            orient_y: 0.0,
            orient_z: 0.0,
            orient_w: 1.0,
            touch_id_next: 0,
        }
    }

    /// Reset in place to the idle state.
    pub fn set_idle(&mut self) {
        *self = Self::new();
    }

    /// `true` when no input is applied.
    pub fn is_idle(&self) -> bool {
        self.buttons.is_empty()
            && self.l2_state == 0
            && self.r2_state == 0
            && self.left_x == 0
            && self.left_y == 0
            && self.right_x == 0
            && self.right_y == 0
            && self.touches.iter().all(|t| t.id.is_none())
    }

    // ── Buttons ──────────────────────────────────────────────────

    pub fn is_pressed(&self, button: ControllerButton) -> bool {
        self.buttons.contains(button)
    }

    pub fn set_button(&mut self, button: ControllerButton, pressed: bool) {
        self.buttons.set(button, pressed);
    }

    button_accessors! {
        cross, set_cross => CROSS;
        circle, set_circle => MOON;
        square, set_square => BOX;
        triangle, set_triangle => PYRAMID;
        l1, set_l1 => L1;
        r1, set_r1 => R1;
        l2, set_l2 => L2;
        r2, set_r2 => R2;
        l3, set_l3 => L3;
        r3, set_r3 => R3;
        dpad_up, set_dpad_up => DPAD_UP;
        dpad_down, set_dpad_down => DPAD_DOWN;
        dpad_left, set_dpad_left => DPAD_LEFT;
        dpad_right, set_dpad_right => DPAD_RIGHT;
        options, set_options => OPTIONS;
        share, set_share => SHARE;
        ps, set_ps => PS;
        touchpad, set_touchpad => TOUCHPAD;
    }

    // ── Builders ─────────────────────────────────────────────────

    /// Copy of `self` with `button` pressed.
    pub fn with_button(mut self, button: ControllerButton) -> Self {
        self.buttons |= button;
        self
    }

    pub fn with_left_stick(mut self, x: i16, y: i16) -> Self {
        self.left_x = x;
        self.left_y = y;
        self
    }

    pub fn with_right_stick(mut self, x: i16, y: i16) -> Self {
        self.right_x = x;
        self.right_y = y;
        self
    }

    pub fn with_triggers(mut self, l2: u8, r2: u8) -> Self {
        self.l2_state = l2;
        self.r2_state = r2;
        self
    }

    // ── Touchpad ─────────────────────────────────────────────────

    /// Begin a touch at `(x, y)`.
    ///
    /// Returns the new contact id, or `None` when both slots are taken.
    pub fn start_touch(&mut self, x: u16, y: u16) -> Option<u8> {
        let slot = self.touches.iter_mut().find(|t| t.id.is_none())?;
        let id = self.touch_id_next;
        self.touch_id_next = (self.touch_id_next + 1) & 0x7f;
        *slot = ControllerTouch { id: Some(id), x, y };
        Some(id)
    }

    /// End the touch with the given id. Unknown ids are ignored.
    pub fn stop_touch(&mut self, id: u8) {
        for touch in self.touches.iter_mut().filter(|t| t.id == Some(id)) {
            touch.id = None;
        }
    }

    /// Move an active touch.
    pub fn set_touch_pos(&mut self, id: u8, x: u16, y: u16) {
        for touch in self.touches.iter_mut().filter(|t| t.id == Some(id)) {
            touch.x = x;
            touch.y = y;
        }
    }
}
