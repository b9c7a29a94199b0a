//! Input sequencing
//!
//! Control samples are numbered and sent only when something the server
//! cares about changed. Sent inputs stay buffered until a snapshot reports
//! them as processed.

use std::collections::VecDeque;

use crate::sim::{angle_delta, Controls};
use crate::ws::protocol::InputState;

/// Aim change (radians) that warrants a new input
pub const AIM_CHANGE_THRESHOLD: f32 = 0.05;
/// Most unacknowledged inputs kept
pub const MAX_PENDING_INPUTS: usize = 100;

pub struct InputSequencer {
    next_sequence: u32,
    last_sent: Option<Controls>,
    pending: VecDeque<InputState>,
    capacity: usize,
}

impl InputSequencer {
    pub fn new() -> Self {
        Self::with_capacity(MAX_PENDING_INPUTS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            next_sequence: 1,
            last_sent: None,
            pending: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    /// Number a control sample if it differs from the last one sent
    ///
    /// Returns the input to put on the wire, or `None` when nothing
    /// meaningful changed. A non-finite aim is replaced by the last sent aim.
    pub fn submit(&mut self, controls: &Controls, timestamp: u64) -> Option<InputState> {
        let mut controls = *controls;
        if !controls.aim_angle.is_finite() {
            controls.aim_angle = self.last_sent.map_or(0.0, |c| c.aim_angle);
        }
        if !self.differs(&controls) {
            return None;
        }

        let input = InputState::from_controls(self.next_sequence, &controls, timestamp);
        self.next_sequence = self.next_sequence.wrapping_add(1).max(1);
        self.last_sent = Some(controls);
        self.pending.push_back(input);
        while self.pending.len() > self.capacity {
            self.pending.pop_front();
        }
        Some(input)
    }

    fn differs(&self, controls: &Controls) -> bool {
        let Some(last) = self.last_sent else {
            return true;
        };
        last.up != controls.up
            || last.down != controls.down
            || last.left != controls.left
            || last.right != controls.right
            || last.is_sprinting != controls.is_sprinting
            || angle_delta(last.aim_angle, controls.aim_angle).abs() > AIM_CHANGE_THRESHOLD
    }

    /// Send the next sample even if it matches the last one sent
    pub fn resend_next(&mut self) {
        self.last_sent = None;
    }

    /// Drop every buffered input the server has processed
    pub fn clear_history_up_to(&mut self, sequence: u32) {
        while self
            .pending
            .front()
            .is_some_and(|input| input.sequence <= sequence)
        {
            self.pending.pop_front();
        }
    }

    /// Inputs sent but not yet acknowledged, oldest first
    pub fn pending(&self) -> impl Iterator<Item = &InputState> {
        self.pending.iter()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Controls of the most recently sent input
    pub fn last_sent(&self) -> Option<Controls> {
        self.last_sent
    }

    /// Sequence number of the most recently sent input, 0 before the first
    pub fn latest_sequence(&self) -> u32 {
        self.pending.back().map_or(self.next_sequence - 1, |i| i.sequence)
    }
}

impl Default for InputSequencer {
    fn default() -> Self {
        Self::new()
    }
}
