#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Discrete PID controller.
//!
//! Used to size the date window of successive observation searches so that
//! each search returns roughly `setpoint` observations. The controller is
//! sample-based: every call to [`Pid::compute`] is one step, there is no
//! notion of elapsed time.
//!
//! The derivative is taken on the measurement rather than on the error, so a
//! change of setpoint does not produce an output kick. The integral term is
//! clamped to the output limits to avoid windup.

/// Errors raised by the regulator.
#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum RegulatorError {
    /// A limit is not finite or the upper limit is below the lower one.
    #[error("invalid output limits: min {min}, max {max}")]
    InvalidLimits {
        /// Lower limit.
        min: f64,
        /// Upper limit.
        max: f64,
    },
}

/// PID controller state.
#[derive(Debug, Clone, PartialEq)]
pub struct Pid {
    kp: f64,
    ki: f64,
    kd: f64,
    setpoint: f64,
    min: f64,
    max: f64,
    integral: f64,
    last_input: Option<f64>,
}

impl Pid {
    /// Creates a controller with gains `kp`, `ki`, `kd`, a target value and
    /// `(min, max)` output limits.
    ///
    /// # Errors
    ///
    /// Returns [`RegulatorError::InvalidLimits`] if a limit is not finite or
    /// `max < min`.
    pub fn new(
        kp: f64,
        ki: f64,
        kd: f64,
        setpoint: f64,
        limits: (f64, f64),
    ) -> Result<Self, RegulatorError> {
        let (min, max) = validate(limits.0, limits.1)?;
        Ok(Self {
            kp,
            ki,
            kd,
            setpoint,
            min,
            max,
            integral: 0.0,
            last_input: None,
        })
    }

    /// Target value.
    #[must_use]
    pub const fn setpoint(&self) -> f64 {
        self.setpoint
    }

    /// Changes the target value. Accumulated state is kept.
    pub const fn set_setpoint(&mut self, setpoint: f64) {
        self.setpoint = setpoint;
    }

    /// Current `(min, max)` output limits.
    #[must_use]
    pub const fn output_limits(&self) -> (f64, f64) {
        (self.min, self.max)
    }

    /// Replaces the output limits and re-clamps the integral term.
    ///
    /// # Errors
    ///
    /// Returns [`RegulatorError::InvalidLimits`] if a limit is not finite or
    /// `max < min`. The previous
    /// limits are kept in that case.
    pub fn set_output_limits(&mut self, min: f64, max: f64) -> Result<(), RegulatorError> {
        let (min, max) = validate(min, max)?;
        self.min = min;
        self.max = max;
        self.integral = self.integral.clamp(min, max);
        Ok(())
    }

    /// Clears the integral term and the remembered input.
    pub const fn reset(&mut self) {
        self.integral = 0.0;
        self.last_input = None;
    }

    /// Feeds one measurement and returns the new, clamped output.
    pub fn compute(&mut self, measured: f64) -> f64 {
        let error = self.setpoint - measured;

        self.integral = self.ki.mul_add(error, self.integral).clamp(self.min, self.max);

        let derivative = self.last_input.map_or(0.0, |last| measured - last);
        self.last_input = Some(measured);

        let output = self
            .kp
            .mul_add(error, self.integral - self.kd * derivative)
            .clamp(self.min, self.max);

        log::trace!(
            "pid: measured={measured} error={error} integral={} derivative={derivative} output={output}",
            self.integral
        );

        output
    }
}

fn validate(min: f64, max: f64) -> Result<(f64, f64), RegulatorError> {
    if !min.is_finite() || !max.is_finite() || max < min {
        return Err(RegulatorError::InvalidLimits { min, max });
    }
    Ok((min, max))
}
