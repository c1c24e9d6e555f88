//! Relative-to-absolute move decomposition.
//!
//! The firmware only accepts absolute targets in [0, 360) plus a whole-turn count, so
//! a relative delta is split into direction, loops and the absolute landing angle.

use crate::command::{Direction, MotionCommand, MAX_LOOPS};
use serde::{Deserialize, Serialize};

/// Result of decomposing a relative move.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MovePlan {
    /// Forward for non-negative deltas.
    pub direction: Direction,
    /// Whole revolutions in the requested delta.
    pub loops: u32,
    /// Absolute landing angle in [0, 360).
    pub target: f64,
}

/// Split `delta` degrees from `current` into direction, whole turns and absolute target.
///
/// `current` may be anywhere in the device's signed (-360, 360] range; it is folded
/// into [0, 360) first so that a single ±360 correction always lands the target in
/// [0, 360).
pub fn decompose(current: f64, delta: f64) -> MovePlan {
    let direction = if delta >= 0.0 {
        Direction::Forward
    } else {
        Direction::Reverse
    };
    let magnitude = delta.abs();
    let loops = (magnitude / 360.0).floor() as u32;
    let remainder = magnitude % 360.0;

    let start = current.rem_euclid(360.0);
    let mut target = match direction {
        Direction::Forward => start + remainder,
        Direction::Reverse => start - remainder,
    };
    if target >= 360.0 {
        target -= 360.0;
    } else if target < 0.0 {
        target += 360.0;
    }

    MovePlan {
        direction,
        loops,
        // -0.0 would format with a sign
        target: target + 0.0,
    }
}

impl MovePlan {
    /// True when the loop count does not fit the two-digit wire field.
    pub fn exceeds_loop_limit(&self) -> bool {
        self.loops > MAX_LOOPS
    }

    /// Loop count that will actually be sent.
    pub fn command_loops(&self) -> u32 {
        self.loops.min(MAX_LOOPS)
    }

    /// Build the command for this plan.
    ///
    /// Single-revolution moves use a position run; anything longer uses a multi-turn
    /// run. Loop counts above the protocol ceiling are capped and a warning is logged;
    /// check [`exceeds_loop_limit`](Self::exceeds_loop_limit) before calling to
    /// surface this to the operator.
    pub fn to_command(&self, accel: u32, speed: f64) -> MotionCommand {
        if self.loops == 0 {
            return MotionCommand::PositionRun {
                direction: self.direction,
                accel,
                speed,
                target: self.target,
            };
        }
        if self.exceeds_loop_limit() {
            tracing::warn!(
                requested = self.loops,
                sent = MAX_LOOPS,
                "Loop count exceeds protocol limit, capping multi-turn move"
            );
        }
        MotionCommand::MultiTurnRun {
            direction: self.direction,
            accel,
            speed,
            target: self.target,
            loops: self.command_loops(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn assert_plan(plan: MovePlan, direction: Direction, loops: u32, target: f64) {
        assert_eq!(plan.direction, direction);
        assert_eq!(plan.loops, loops);
        assert!(
            (plan.target - target).abs() < 1e-9,
            "target {} != {}",
            plan.target,
            target
        );
    }

    #[test]
    fn test_zero_move() {
        assert_plan(decompose(0.0, 0.0), Direction::Forward, 0, 0.0);
    }

    #[test]
    fn test_forward_multi_turn() {
        assert_plan(decompose(10.0, 370.0), Direction::Forward, 1, 20.0);
    }

    #[test]
    fn test_reverse_multi_turn() {
        assert_plan(decompose(350.0, -370.0), Direction::Reverse, 1, 340.0);
    }

    #[test]
    fn test_wraps_across_zero() {
        assert_plan(decompose(350.0, 20.0), Direction::Forward, 0, 10.0);
        assert_plan(decompose(10.0, -30.0), Direction::Reverse, 0, 340.0);
    }

    #[test]
    fn test_signed_current_angle() {
        // -350 and 10 are the same physical position
        assert_plan(decompose(-350.0, -20.0), Direction::Reverse, 0, 350.0);
        assert_plan(decompose(-0.5, 1.0), Direction::Forward, 0, 0.5);
    }

    #[test]
    fn test_exact_revolutions() {
        assert_plan(decompose(90.0, 720.0), Direction::Forward, 2, 90.0);
        assert_plan(decompose(90.0, -360.0), Direction::Reverse, 1, 90.0);
    }

    #[test]
    fn test_negative_zero_start_yields_positive_target() {
        let plan = decompose(-0.0, -360.0);
        assert_plan(plan, Direction::Reverse, 1, 0.0);
        assert!(plan.target.is_sign_positive());

        let payload = plan
            .to_command(100, 10.0)
            .encode(crate::command::ParameterPolicy::Reject)
            .unwrap();
        assert_eq!(payload, "5100100010.0000000.000001");
    }

    #[test]
    fn test_command_selection() {
        let cmd = decompose(0.0, 45.0).to_command(100, 10.0);
        assert!(matches!(cmd, MotionCommand::PositionRun { target, .. } if target == 45.0));

        let cmd = decompose(0.0, 765.0).to_command(100, 10.0);
        assert!(matches!(cmd, MotionCommand::MultiTurnRun { loops: 2, .. }));
    }

    #[traced_test]
    #[test]
    fn test_loop_truncation_is_reported() {
        let plan = decompose(0.0, 360.0 * 150.0 + 5.0);
        assert_eq!(plan.loops, 150);
        assert!(plan.exceeds_loop_limit());
        assert_eq!(plan.command_loops(), 99);

        let cmd = plan.to_command(10, 10.0);
        assert!(matches!(cmd, MotionCommand::MultiTurnRun { loops: 99, .. }));
        assert!(logs_contain("Loop count exceeds protocol limit"));
    }
}
