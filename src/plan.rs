use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Rate;

/// Declared shape of load over a bounded window of time.
///
/// Patterns are the user-facing building blocks that [`Plan::compile`]
/// concatenates into a timed rate function.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "pattern", rename_all = "kebab-case")]
pub enum LoadPattern {
    /// Rate varies linearly from `from` to `to` over `duration`.
    Ramp {
        from: Rate,
        to: Rate,
        #[serde(with = "humantime_serde")]
        duration: Duration,
    },
    /// A staircase of flat rates, one per step.
    Steps { steps: Vec<Step> },
    /// A flat burst of `rate` held for `duration`.
    Spike {
        rate: Rate,
        #[serde(with = "humantime_serde")]
        duration: Duration,
    },
}

/// One level of a [`LoadPattern::Steps`] staircase.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Step {
    pub rate: Rate,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
}

/// Timed rate function compiled from an ordered list of load patterns.
///
/// The plan maps elapsed run time to the request rate that should be in
/// force at that moment. It is immutable once compiled; the plan driver
/// samples it on a fixed tick and feeds the result into the arrival
/// controller.
#[derive(Clone, Debug)]
pub struct Plan {
    segments: Vec<Segment>,
    max_rate: Rate,
    total_duration: Duration,
}

/// A contiguous piecewise-linear span of the plan timeline.
#[derive(Clone, Debug)]
struct Segment {
    start: Duration,
    duration: Duration,
    from: Rate,
    to: Rate,
}

impl Segment {
    /// Segments own the half-open window `[start, start + duration)`.
    fn contains(&self, elapsed: Duration) -> bool {
        elapsed >= self.start && elapsed < self.start + self.duration
    }

    fn rate_at(&self, elapsed: Duration) -> Rate {
        if self.from == self.to {
            return self.from;
        }

        let progress = (elapsed.saturating_sub(self.start)).as_secs_f64()
            / self.duration.as_secs_f64();
        let progress = progress.clamp(0.0, 1.0);

        Rate(self.from.0 + (self.to.0 - self.from.0) * progress)
    }
}

impl Plan {
    /// Compiles `patterns` into a plan.
    ///
    /// Patterns (and staircase steps) with zero duration contribute
    /// nothing. Returns `None` when no pattern contributed a segment.
    pub fn compile(patterns: &[LoadPattern]) -> Option<Plan> {
        let mut plan = Plan {
            segments: Vec::new(),
            max_rate: Rate::ZERO,
            total_duration: Duration::ZERO,
        };

        for pattern in patterns {
            match pattern {
                LoadPattern::Ramp { from, to, duration } => plan.push(*from, *to, *duration),
                LoadPattern::Steps { steps } => {
                    for step in steps {
                        plan.push(step.rate, step.rate, step.duration);
                    }
                }
                LoadPattern::Spike { rate, duration } => plan.push(*rate, *rate, *duration),
            }
        }

        if plan.segments.is_empty() {
            None
        } else {
            Some(plan)
        }
    }

    fn push(&mut self, from: Rate, to: Rate, duration: Duration) {
        if duration.is_zero() {
            return;
        }

        self.segments.push(Segment {
            start: self.total_duration,
            duration,
            from,
            to,
        });
        self.total_duration += duration;
        self.max_rate = Rate(self.max_rate.0.max(from.0).max(to.0));
    }

    /// Rate in force `elapsed` into the plan, or `None` once the plan
    /// timeline has been exhausted.
    pub fn rate_at(&self, elapsed: Duration) -> Option<Rate> {
        self.segments
            .iter()
            .find(|s| s.contains(elapsed))
            .map(|s| s.rate_at(elapsed))
    }

    /// Largest rate named anywhere in the plan.
    pub fn max_rate(&self) -> Rate {
        self.max_rate
    }

    /// Token-bucket burst implied by the plan's peak rate.
    pub fn max_burst(&self) -> u32 {
        (self.max_rate.0.ceil() as u32).max(1)
    }

    /// Sum of all segment durations.
    pub fn total_duration(&self) -> Duration {
        self.total_duration
    }
}
