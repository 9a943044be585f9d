//! Input sampling.
//!
//! Polls the device once per tick and writes the result onto the local
//! player as an [`InputState`]. The client-authoritative sync policy then
//! sends it to the server with the sequence number stamped here.

use sim_shared::{
    components::InputState,
    schedule::{System, TickContext},
    services::{InputProvider, InputSample},
};
use tracing::trace;

use crate::replicate::LocalPlayer;

pub struct InputSampler {
    provider: Box<dyn InputProvider>,
    sequence: u32,
}

impl InputSampler {
    pub fn new(provider: Box<dyn InputProvider>) -> Self {
        Self {
            provider,
            sequence: 0,
        }
    }
}

/// Turns a raw sample into the replicated component.
///
/// `look` points from the player towards the click, if there was one.
pub fn to_input_state(sample: InputSample, from: sim_shared::math::Vec2, sequence: u32) -> InputState {
    InputState {
        movement: sample.movement.clamp_unit(),
        look: sample
            .click
            .map(|at| at.sub(from).normalize_or_zero())
            .unwrap_or_default(),
        flags: sample.flags,
        sequence,
    }
}

impl System for InputSampler {
    fn run(&mut self, ctx: &mut TickContext<'_>) -> anyhow::Result<()> {
        // Poll even without a character so scripted input stays tick-aligned.
        let sample = self.provider.poll();
        let Some(local) = ctx.resources.get::<LocalPlayer>().and_then(|p| p.0) else {
            return Ok(());
        };
        let from = ctx
            .world
            .get::<sim_shared::components::Position>(local)
            .map(|p| p.0)
            .unwrap_or_default();
        self.sequence = self.sequence.wrapping_add(1);
        let state = to_input_state(sample, from, self.sequence);
        trace!(seq = self.sequence, movement = ?state.movement, "Input sampled");
        ctx.world.insert(local, state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sim_shared::{components::InputFlags, math::Vec2};

    #[test]
    fn look_points_at_click() {
        let sample = InputSample {
            movement: Vec2::new(3.0, 4.0),
            click: Some(Vec2::new(1.0, 5.0)),
            flags: InputFlags::default(),
        };
        let state = to_input_state(sample, Vec2::new(1.0, 1.0), 7);
        assert_eq!(state.look, Vec2::new(0.0, 1.0));
        assert!((state.movement.len_sq() - 1.0).abs() < 1e-5);
        assert_eq!(state.sequence, 7);
    }

    #[test]
    fn no_click_means_no_look() {
        let state = to_input_state(InputSample::default(), Vec2::ZERO, 1);
        assert_eq!(state.look, Vec2::ZERO);
    }
}
