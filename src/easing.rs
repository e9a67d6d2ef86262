//! Easing curves for tempo ramps and smoothed values.
//!
//! An easing function maps a normalised progress value `t` in `[0, 1]` to an
//! eased output in `[0, 1]`. All curves here satisfy `f(0) = 0` and
//! `f(1) = 1` and are monotonically non-decreasing, which is what the tempo
//! ramp relies on to land exactly on its target.

/// A named easing curve as a plain function pointer.
pub type EasingFn = fn(f64) -> f64;

/// Constant rate of change.
pub fn linear(t: f64) -> f64 {
    t
}

/// Quadratic ease-in: slow start, accelerates toward the end.
pub fn ease_in(t: f64) -> f64 {
    t * t
}

/// Quadratic ease-out: fast start, decelerates toward the end.
pub fn ease_out(t: f64) -> f64 {
    1.0 - (1.0 - t) * (1.0 - t)
}

/// Hermite smoothstep S-curve: smooth start and end, faster in the middle.
pub fn ease_in_out(t: f64) -> f64 {
    t * t * (3.0 - 2.0 * t)
}

/// Cubic ease-in: very slow start with rapid acceleration.
///
/// Approximates a perceptually even response for parameters the ear hears
/// logarithmically, like filter cutoff.
pub fn exponential(t: f64) -> f64 {
    t * t * t
}

/// Cubic ease-out: rapid initial change that tapers to a gradual end.
pub fn logarithmic(t: f64) -> f64 {
    let u = 1.0 - t;
    1.0 - u * u * u
}

/// Perlin smootherstep: a smoother S-curve than [`ease_in_out`].
///
/// Zero first and second derivatives at both endpoints, so long transitions
/// have no audible acceleration jerk at the boundaries.
pub fn s_curve(t: f64) -> f64 {
    t * t * t * (t * (t * 6.0 - 15.0) + 10.0)
}

/// Look up an easing curve by name.
///
/// Returns `None` for unknown names. Known names: `"linear"`, `"ease_in"`,
/// `"ease_out"`, `"ease_in_out"`, `"exponential"`, `"logarithmic"`,
/// `"s_curve"`.
pub fn by_name(name: &str) -> Option<EasingFn> {
    match name {
        "linear" => Some(linear),
        "ease_in" => Some(ease_in),
        "ease_out" => Some(ease_out),
        "ease_in_out" => Some(ease_in_out),
        "exponential" => Some(exponential),
        "logarithmic" => Some(logarithmic),
        "s_curve" => Some(s_curve),
        _ => None,
    }
}

/// Smoothly interpolates between discrete data updates.
///
/// When external data arrives in snapshots — API polls, sensor readings —
/// jumping instantly to each new value sounds jarring. `EasedValue`
/// remembers the previous value and interpolates toward the new one over a
/// normalised progress window. It is an explicit state object: create one
/// per smoothed field and thread it through whatever reads it, typically a
/// pattern's rebuild closure.
#[derive(Debug, Clone)]
pub struct EasedValue {
    previous: f64,
    current: f64,
}

impl EasedValue {
    /// Create with an initial value used as both endpoints until the first
    /// [`update`](Self::update).
    pub fn new(initial: f64) -> Self {
        Self {
            previous: initial,
            current: initial,
        }
    }

    /// Accept a new target value. The old target becomes the baseline the
    /// next interpolation starts from.
    pub fn update(&mut self, value: f64) {
        self.previous = self.current;
        self.current = value;
    }

    /// Interpolated value at `progress` (in `[0, 1]`) through the current
    /// transition, shaped by `easing`.
    pub fn get(&self, progress: f64, easing: EasingFn) -> f64 {
        let eased = easing(progress.clamp(0.0, 1.0));
        self.previous + (self.current - self.previous) * eased
    }

    /// The most recently set target value.
    pub fn current(&self) -> f64 {
        self.current
    }

    /// The value that was current before the last update.
    pub fn previous(&self) -> f64 {
        self.previous
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_curves_hit_endpoints() {
        for name in [
            "linear",
            "ease_in",
            "ease_out",
            "ease_in_out",
            "exponential",
            "logarithmic",
            "s_curve",
        ] {
            let f = by_name(name).unwrap();
            assert_eq!(f(0.0), 0.0, "{name} at 0");
            assert!((f(1.0) - 1.0).abs() < 1e-12, "{name} at 1");
        }
    }

    #[test]
    fn curves_are_monotonic() {
        for name in ["linear", "ease_in_out", "s_curve", "exponential"] {
            let f = by_name(name).unwrap();
            let mut prev = f(0.0);
            for i in 1..=100 {
                let v = f(i as f64 / 100.0);
                assert!(v >= prev, "{name} decreased at step {i}");
                prev = v;
            }
        }
    }

    #[test]
    fn unknown_name_is_none() {
        assert!(by_name("bounce").is_none());
    }

    #[test]
    fn eased_value_interpolates() {
        let mut v = EasedValue::new(0.0);
        assert_eq!(v.get(0.5, linear), 0.0);

        v.update(10.0);
        assert_eq!(v.get(0.0, linear), 0.0);
        assert_eq!(v.get(0.5, linear), 5.0);
        assert_eq!(v.get(1.0, linear), 10.0);

        v.update(20.0);
        assert_eq!(v.previous(), 10.0);
        assert_eq!(v.current(), 20.0);
        assert_eq!(v.get(0.5, linear), 15.0);
    }
}
