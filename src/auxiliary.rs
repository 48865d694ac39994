//! Pluggable auxiliary signal source for the telemetry record.
//!
//! The high-frequency record carries more channels than the strain decoder
//! provides: principal strain values, a principal angle and a triaxial
//! acceleration. Until the corresponding hardware integrations exist, those
//! channels are filled by an [`AuxiliarySource`]. The shipped
//! [`SimulatedTriax`] generates synthetic data and is explicitly
//! non-authoritative; swap in a real implementation when the sensors land.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use std::time::{SystemTime, UNIX_EPOCH};

/// One auxiliary sample: every record channel not produced by the strain
/// decoder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AuxSample {
    /// First principal strain.
    pub principal_1: f32,
    /// Second principal strain.
    pub principal_2: f32,
    /// Principal strain angle in degrees.
    pub principal_angle_deg: f32,
    /// Acceleration along x in m/s^2.
    pub accel_x: f32,
    /// Acceleration along y in m/s^2.
    pub accel_y: f32,
    /// Acceleration along z in m/s^2.
    pub accel_z: f32,
}

/// Source of the auxiliary channels mixed into each high-frequency record.
pub trait AuxiliarySource: Send {
    /// Produces the auxiliary channels for one sample.
    fn sample(&mut self) -> AuxSample;
}

/// Simulated auxiliary channels.
///
/// Principal strains are zero, the principal angle is uniform noise, and the
/// acceleration is a 5 Hz sine/cosine pair plus Gaussian noise with gravity
/// on z. None of this is measured data.
pub struct SimulatedTriax {
    rng: StdRng,
    noise: Normal<f32>,
}

impl SimulatedTriax {
    /// Signal frequency of the simulated acceleration, in Hz.
    const ACCEL_FREQ_HZ: f64 = 5.0;

    /// Creates a generator seeded from the OS.
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
            noise: Normal::new(0.0, 1.0).expect("standard normal parameters are valid"),
        }
    }
}

impl Default for SimulatedTriax {
    fn default() -> Self {
        Self::new()
    }
}

impl AuxiliarySource for SimulatedTriax {
    fn sample(&mut self) -> AuxSample {
        let t = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        let phase = 2.0 * std::f64::consts::PI * Self::ACCEL_FREQ_HZ * t;

        AuxSample {
            principal_1: 0.0,
            principal_2: 0.0,
            principal_angle_deg: self.rng.gen_range(-180.0..180.0),
            accel_x: 0.2 * phase.sin() as f32 + 0.02 * self.noise.sample(&mut self.rng),
            accel_y: 0.2 * phase.cos() as f32 + 0.02 * self.noise.sample(&mut self.rng),
            accel_z: 9.81 + 0.05 * self.noise.sample(&mut self.rng),
        }
    }
}
