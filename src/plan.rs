use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// How a load ramp is described in the experiment configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Ramp {
    Linear {
        initial: u64,
        increment: u64,
        max: u64,
        steps: usize,
    },
    AroundTarget {
        target: u64,
        min: u64,
        max: u64,
        increment: u64,
        #[serde(default = "default_exponent")]
        exponent: f64,
    },
    ApproachingThreshold {
        threshold: u64,
        exp_points: u32,
        lin_points: u32,
    },
    Explicit {
        loads: Vec<u64>,
    },
}

fn default_exponent() -> f64 {
    0.5
}

impl Ramp {
    pub fn to_plan(&self) -> IterationPlan {
        match self {
            Ramp::Linear {
                initial,
                increment,
                max,
                steps,
            } => IterationPlan::linear(*initial, *increment, *max, *steps),
            Ramp::AroundTarget {
                target,
                min,
                max,
                increment,
                exponent,
            } => IterationPlan::around_target(*target, *min, *max, *increment, *exponent),
            Ramp::ApproachingThreshold {
                threshold,
                exp_points,
                lin_points,
            } => IterationPlan::approaching_threshold(*threshold, *exp_points, *lin_points),
            Ramp::Explicit { loads } => IterationPlan::explicit(loads.clone()),
        }
    }
}

/// The ordered total loads of an experiment, one per iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IterationPlan {
    loads: Vec<u64>,
}

impl IterationPlan {
    /// `initial`, `initial + increment`, ... for at most `steps` entries, none above `max`.
    pub fn linear(initial: u64, increment: u64, max: u64, steps: usize) -> Self {
        let loads = (0..steps as u64)
            .map(|i| initial.saturating_add(i.saturating_mul(increment)))
            .take_while(|load| *load <= max)
            .collect::<Vec<_>>();

        // a zero increment would otherwise repeat the same load `steps` times
        let loads = if increment == 0 {
            loads.into_iter().take(1).collect()
        } else {
            loads
        };
        Self { loads }
    }

    /// Dense around `target` and sparser towards `min` and `max`: `target ± increment *
    /// round(2^(i * exponent))`, plus the three anchors, clamped to `[min, max]`.
    pub fn around_target(target: u64, min: u64, max: u64, increment: u64, exponent: f64) -> Self {
        let mut loads = BTreeSet::from([min, target, max]);

        let offsets: BTreeSet<u64> = (0..100)
            .map(|i| increment.saturating_mul(2f64.powf(i as f64 * exponent).round() as u64))
            .collect();
        for offset in offsets {
            if let Some(below) = target.checked_sub(offset) {
                loads.insert(below);
            }
            loads.insert(target.saturating_add(offset));
        }

        Self {
            loads: loads
                .into_iter()
                .filter(|load| (min..=max).contains(load))
                .collect(),
        }
    }

    /// `exp_points` loads halving towards `threshold / 2`, then `lin_points` evenly spaced loads
    /// from there towards `threshold`.
    pub fn approaching_threshold(threshold: u64, exp_points: u32, lin_points: u32) -> Self {
        let mut loads: Vec<u64> = (1..=exp_points)
            .rev()
            .map(|i| threshold.checked_shr(i).unwrap_or(0))
            .collect();

        let lin_step = threshold / (2 * lin_points as u64 + 1);
        let start = threshold / 2;
        loads.extend((1..=lin_points as u64).map(|i| start + i * lin_step));

        Self { loads }
    }

    pub fn explicit(loads: Vec<u64>) -> Self {
        Self { loads }
    }

    pub fn len(&self) -> usize {
        self.loads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loads.is_empty()
    }

    pub fn loads(&self) -> &[u64] {
        &self.loads
    }

    /// `(index, load)` pairs with 1-based indices, in plan order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, u64)> + '_ {
        self.loads.iter().enumerate().map(|(i, load)| (i + 1, *load))
    }
}

/// Splits `load` over `n` machines; the remainder goes one each to the first machines.
pub fn distribute_load(load: u64, n: usize) -> Vec<u64> {
    if n == 0 {
        return vec![];
    }
    let per_machine = load / n as u64;
    let remainder = (load % n as u64) as usize;
    (0..n)
        .map(|i| per_machine + u64::from(i < remainder))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_stops_at_max_or_step_count() {
        assert_eq!(IterationPlan::linear(100, 50, 1000, 4).loads(), &[100, 150, 200, 250]);
        assert_eq!(IterationPlan::linear(100, 50, 200, 10).loads(), &[100, 150, 200]);
        assert_eq!(IterationPlan::linear(100, 0, 200, 10).loads(), &[100]);
        assert!(IterationPlan::linear(300, 50, 200, 10).is_empty());
    }

    #[test]
    fn around_target_is_dense_near_the_target() {
        let plan = IterationPlan::around_target(500, 50, 20000, 50, 0.5);
        let loads = plan.loads();

        assert_eq!(loads.first(), Some(&50));
        assert_eq!(loads.last(), Some(&20000));
        assert!(loads.contains(&500));
        assert!(loads.contains(&450) && loads.contains(&550));
        assert!(loads.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn approaching_threshold_halves_then_walks_linearly() {
        let plan = IterationPlan::approaching_threshold(1000, 3, 2);
        assert_eq!(plan.loads(), &[125, 250, 500, 700, 900]);
    }

    #[test]
    fn iter_is_one_based() {
        let plan = IterationPlan::explicit(vec![10, 20]);
        assert_eq!(plan.iter().collect::<Vec<_>>(), vec![(1, 10), (2, 20)]);
    }

    #[test]
    fn ramp_parses_from_toml() -> anyhow::Result<()> {
        let ramp: Ramp = toml::from_str(
            r#"
            kind = "linear"
            initial = 100
            increment = 100
            max = 300
            steps = 5
            "#,
        )?;
        assert_eq!(ramp.to_plan().loads(), &[100, 200, 300]);
        Ok(())
    }

    #[test]
    fn distribute_load_gives_remainder_to_first_machines() {
        assert_eq!(distribute_load(10, 3), vec![4, 3, 3]);
        assert_eq!(distribute_load(2, 4), vec![1, 1, 0, 0]);
        assert_eq!(distribute_load(9, 3), vec![3, 3, 3]);
        assert!(distribute_load(5, 0).is_empty());
    }
}
