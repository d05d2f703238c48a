//! Victim ranking for graceful scale-down.

/// CPU threshold used when sampler selection falls back from GPU usage.
pub const CPU_FALLBACK_IDLE_THRESHOLD: f32 = 20.0;

/// Index of the lowest sample strictly below `threshold`.
///
/// `None` samples (unreadable workers) never qualify. Ties go to the
/// earlier, i.e. older, worker.
pub fn pick_least_busy<T>(samples: &[Option<T>], threshold: T) -> Option<usize>
where
    T: PartialOrd + Copy,
{
    let mut best: Option<(usize, T)> = None;
    for (i, sample) in samples.iter().enumerate() {
        let Some(value) = *sample else {
            continue;
        };
        if value >= threshold {
            continue;
        }
        match best {
            Some((_, current)) if current <= value => {}
            _ => best = Some((i, value)),
        }
    }
    best.map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_lowest_below_threshold() {
        assert_eq!(pick_least_busy(&[Some(70.0), Some(10.0), Some(45.0)], 20.0), Some(1));
    }

    #[test]
    fn none_qualifies() {
        assert_eq!(pick_least_busy(&[Some(70.0), Some(60.0), Some(45.0)], 20.0), None);
    }

    #[test]
    fn lowest_of_several_candidates() {
        assert_eq!(pick_least_busy(&[Some(15.0), Some(3.0), Some(8.0)], 20.0), Some(1));
    }

    #[test]
    fn unreadable_samples_skipped() {
        assert_eq!(pick_least_busy(&[None, Some(5u32), None], 10), Some(1));
        assert_eq!(pick_least_busy::<u32>(&[None, None], 10), None);
    }

    #[test]
    fn ties_prefer_older_worker() {
        assert_eq!(pick_least_busy(&[Some(0u32), Some(0)], 10), Some(0));
    }
}
