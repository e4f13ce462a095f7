//! # linklab-propagation
//!
//! Radio propagation models for the linklab link simulator.
//!
//! This crate provides:
//! - The [`PropagationLoss`] trait mapping a transmission to a receive power
//! - Free-space loss ([`FriisLoss`])
//! - A fixed receive-power model for pipeline validation ([`FixedRssLoss`])
//! - A three-segment log-distance model ([`ThreeLogDistanceLoss`])
//! - A two-ray ground-reflection model ([`TwoRayGroundLoss`])
//! - Nakagami-m fast fading ([`NakagamiLoss`])
//! - A constant-speed propagation delay model ([`ConstantSpeedDelay`])
//!
//! All models are functions of transmit power and endpoint geometry only;
//! stochastic models draw from the simulation context RNG so a run is fully
//! determined by its seed.

use linklab_common::{Position, SimTime};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Gamma};
use thiserror::Error;

/// Speed of light in vacuum, m/s.
pub const SPEED_OF_LIGHT_M_PER_S: f64 = 299_792_458.0;

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised when constructing a propagation model.
#[derive(Debug, Error)]
pub enum PropagationError {
    /// A model parameter is outside its valid range.
    #[error("invalid propagation parameter: {0}")]
    InvalidParameter(String),
}

// ============================================================================
// Unit Helpers
// ============================================================================

/// Convert a power in dBm to milliwatts.
pub fn dbm_to_mw(dbm: f64) -> f64 {
    10f64.powf(dbm / 10.0)
}

/// Convert a power in milliwatts to dBm.
pub fn mw_to_dbm(mw: f64) -> f64 {
    10.0 * mw.log10()
}

// ============================================================================
// Propagation Loss Trait
// ============================================================================

/// A propagation loss model.
///
/// Maps the power radiated by a transmitter (antenna gain already applied by
/// the caller) to the signal power arriving at a receiver's antenna.
pub trait PropagationLoss: Send {
    /// Signal power at the receiver in dBm.
    ///
    /// Deterministic models ignore `rng`; fading models sample from it, so
    /// two runs with the same seed observe the same fades.
    fn rx_power_dbm(
        &self,
        tx_power_dbm: f64,
        tx: &Position,
        rx: &Position,
        rng: &mut ChaCha8Rng,
    ) -> f64;

    /// Model display name.
    fn name(&self) -> &'static str;
}

// ============================================================================
// Friis Free-Space Loss
// ============================================================================

/// Free-space path loss: `L = 20 log10(4 pi d f / c)`.
#[derive(Debug, Clone)]
pub struct FriisLoss {
    frequency_hz: f64,
    system_loss_db: f64,
    /// Loss floor applied at very small separations, where the far-field
    /// formula is not valid.
    min_loss_db: f64,
}

impl FriisLoss {
    /// Create a free-space loss model for a carrier frequency.
    pub fn new(frequency_hz: f64) -> Result<Self, PropagationError> {
        if frequency_hz <= 0.0 {
            return Err(PropagationError::InvalidParameter(format!(
                "carrier frequency must be positive, got {frequency_hz} Hz"
            )));
        }
        Ok(FriisLoss {
            frequency_hz,
            system_loss_db: 0.0,
            min_loss_db: 0.0,
        })
    }

    fn wavelength_m(&self) -> f64 {
        SPEED_OF_LIGHT_M_PER_S / self.frequency_hz
    }

    /// Path loss in dB at a separation of `distance_m`.
    pub fn path_loss_db(&self, distance_m: f64) -> f64 {
        let numerator = 4.0 * std::f64::consts::PI * distance_m;
        let loss = 20.0 * (numerator / self.wavelength_m()).log10() + self.system_loss_db;
        loss.max(self.min_loss_db)
    }
}

impl PropagationLoss for FriisLoss {
    fn rx_power_dbm(
        &self,
        tx_power_dbm: f64,
        tx: &Position,
        rx: &Position,
        _rng: &mut ChaCha8Rng,
    ) -> f64 {
        tx_power_dbm - self.path_loss_db(tx.distance_to(rx))
    }

    fn name(&self) -> &'static str {
        "FriisPropagationLossModel"
    }
}

// ============================================================================
// Fixed-RSS Loss
// ============================================================================

/// Degenerate model returning one constant receive power regardless of
/// transmit power or geometry. Used to validate the measurement pipeline.
#[derive(Debug, Clone)]
pub struct FixedRssLoss {
    rss_dbm: f64,
}

impl FixedRssLoss {
    /// Create a fixed receive-power model.
    pub fn new(rss_dbm: f64) -> Self {
        FixedRssLoss { rss_dbm }
    }
}

impl PropagationLoss for FixedRssLoss {
    fn rx_power_dbm(
        &self,
        _tx_power_dbm: f64,
        _tx: &Position,
        _rx: &Position,
        _rng: &mut ChaCha8Rng,
    ) -> f64 {
        self.rss_dbm
    }

    fn name(&self) -> &'static str {
        "FixedRssLossModel"
    }
}

// ============================================================================
// Three-Segment Log-Distance Loss
// ============================================================================

/// Log-distance loss with three distance segments of differing exponents.
///
/// Below `d0` there is no loss; each segment beyond adds
/// `10 * n_i * log10(d / d_i)` on top of the loss accumulated at its start.
#[derive(Debug, Clone)]
pub struct ThreeLogDistanceLoss {
    d0_m: f64,
    d1_m: f64,
    d2_m: f64,
    exponent0: f64,
    exponent1: f64,
    exponent2: f64,
    reference_loss_db: f64,
}

impl Default for ThreeLogDistanceLoss {
    fn default() -> Self {
        ThreeLogDistanceLoss {
            d0_m: 1.0,
            d1_m: 200.0,
            d2_m: 500.0,
            exponent0: 1.9,
            exponent1: 3.8,
            exponent2: 3.8,
            reference_loss_db: 46.6777,
        }
    }
}

impl ThreeLogDistanceLoss {
    /// Path loss in dB at a separation of `distance_m`.
    pub fn path_loss_db(&self, distance_m: f64) -> f64 {
        let d = distance_m;
        if d < self.d0_m {
            return 0.0;
        }
        let mut loss = self.reference_loss_db;
        if d < self.d1_m {
            return loss + 10.0 * self.exponent0 * (d / self.d0_m).log10();
        }
        loss += 10.0 * self.exponent0 * (self.d1_m / self.d0_m).log10();
        if d < self.d2_m {
            return loss + 10.0 * self.exponent1 * (d / self.d1_m).log10();
        }
        loss += 10.0 * self.exponent1 * (self.d2_m / self.d1_m).log10();
        loss + 10.0 * self.exponent2 * (d / self.d2_m).log10()
    }
}

impl PropagationLoss for ThreeLogDistanceLoss {
    fn rx_power_dbm(
        &self,
        tx_power_dbm: f64,
        tx: &Position,
        rx: &Position,
        _rng: &mut ChaCha8Rng,
    ) -> f64 {
        tx_power_dbm - self.path_loss_db(tx.distance_to(rx))
    }

    fn name(&self) -> &'static str {
        "ThreeLogDistancePropagationLossModel"
    }
}

// ============================================================================
// Two-Ray Ground-Reflection Loss
// ============================================================================

/// Two-ray ground-reflection model.
///
/// Effective antenna heights are each endpoint's z coordinate plus a
/// configured height above it. Below the crossover distance
/// `4 pi h_t h_r / lambda` the ground reflection is not yet resolved and
/// free-space loss applies; beyond it the received power follows the
/// `h_t^2 h_r^2 / d^4` law.
#[derive(Debug, Clone)]
pub struct TwoRayGroundLoss {
    frequency_hz: f64,
    height_above_z_m: f64,
    friis: FriisLoss,
}

impl TwoRayGroundLoss {
    /// Create a two-ray ground-reflection model.
    ///
    /// `height_above_z_m` is the antenna mast height added to each node's z
    /// coordinate; it must be non-negative.
    pub fn new(frequency_hz: f64, height_above_z_m: f64) -> Result<Self, PropagationError> {
        if height_above_z_m < 0.0 {
            return Err(PropagationError::InvalidParameter(format!(
                "antenna height above z must be non-negative, got {height_above_z_m} m"
            )));
        }
        Ok(TwoRayGroundLoss {
            frequency_hz,
            height_above_z_m,
            friis: FriisLoss::new(frequency_hz)?,
        })
    }

    /// Crossover distance in meters for the given effective antenna heights.
    pub fn crossover_distance_m(&self, ht_m: f64, hr_m: f64) -> f64 {
        let wavelength = SPEED_OF_LIGHT_M_PER_S / self.frequency_hz;
        4.0 * std::f64::consts::PI * ht_m * hr_m / wavelength
    }
}

impl PropagationLoss for TwoRayGroundLoss {
    fn rx_power_dbm(
        &self,
        tx_power_dbm: f64,
        tx: &Position,
        rx: &Position,
        rng: &mut ChaCha8Rng,
    ) -> f64 {
        let distance = tx.distance_to(rx);
        let ht = tx.z + self.height_above_z_m;
        let hr = rx.z + self.height_above_z_m;

        if distance <= self.crossover_distance_m(ht, hr) {
            return self.friis.rx_power_dbm(tx_power_dbm, tx, rx, rng);
        }

        // Plane-earth loss: Pr = Pt * ht^2 * hr^2 / d^4.
        let gain_db = 10.0 * ((ht * ht * hr * hr) / distance.powi(4)).log10();
        tx_power_dbm + gain_db
    }

    fn name(&self) -> &'static str {
        "TwoRayGroundPropagationLossModel"
    }
}

// ============================================================================
// Nakagami-m Fading
// ============================================================================

/// Nakagami-m fast fading.
///
/// The received power is gamma-distributed with mean equal to the incoming
/// power; the shape parameter m is selected by distance, with nearer links
/// fading less severely.
#[derive(Debug, Clone)]
pub struct NakagamiLoss {
    d1_m: f64,
    d2_m: f64,
    m0: f64,
    m1: f64,
    m2: f64,
}

impl Default for NakagamiLoss {
    fn default() -> Self {
        NakagamiLoss {
            d1_m: 80.0,
            d2_m: 200.0,
            m0: 1.5,
            m1: 0.75,
            m2: 0.75,
        }
    }
}

impl NakagamiLoss {
    /// Create a Nakagami model with explicit distance breakpoints and shapes.
    pub fn new(
        d1_m: f64,
        d2_m: f64,
        m0: f64,
        m1: f64,
        m2: f64,
    ) -> Result<Self, PropagationError> {
        if m0 <= 0.0 || m1 <= 0.0 || m2 <= 0.0 {
            return Err(PropagationError::InvalidParameter(format!(
                "Nakagami shape parameters must be positive, got m0={m0} m1={m1} m2={m2}"
            )));
        }
        Ok(NakagamiLoss { d1_m, d2_m, m0, m1, m2 })
    }

    fn shape_for_distance(&self, distance_m: f64) -> f64 {
        if distance_m < self.d1_m {
            self.m0
        } else if distance_m < self.d2_m {
            self.m1
        } else {
            self.m2
        }
    }
}

impl PropagationLoss for NakagamiLoss {
    fn rx_power_dbm(
        &self,
        tx_power_dbm: f64,
        tx: &Position,
        rx: &Position,
        rng: &mut ChaCha8Rng,
    ) -> f64 {
        let m = self.shape_for_distance(tx.distance_to(rx));
        let mean_mw = dbm_to_mw(tx_power_dbm);
        // Shape/scale parameterization keeps the mean at the incoming power.
        // Shapes are validated at construction and the mean is always
        // positive, so the distribution is well formed; an unfaded frame is
        // the fallback regardless.
        match Gamma::new(m, mean_mw / m) {
            Ok(gamma) => mw_to_dbm(gamma.sample(rng)),
            Err(_) => tx_power_dbm,
        }
    }

    fn name(&self) -> &'static str {
        "NakagamiPropagationLossModel"
    }
}

// ============================================================================
// Propagation Delay
// ============================================================================

/// Constant-speed propagation delay.
#[derive(Debug, Clone)]
pub struct ConstantSpeedDelay {
    speed_m_per_s: f64,
}

impl Default for ConstantSpeedDelay {
    fn default() -> Self {
        ConstantSpeedDelay {
            speed_m_per_s: SPEED_OF_LIGHT_M_PER_S,
        }
    }
}

impl ConstantSpeedDelay {
    /// Propagation delay between two positions.
    pub fn delay(&self, a: &Position, b: &Position) -> SimTime {
        SimTime::from_secs(a.distance_to(b) / self.speed_m_per_s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    const FREQ_HZ: f64 = 5.19e9;

    fn rng() -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(42)
    }

    fn at(x: f64) -> Position {
        Position::new(x, 0.0, 0.0)
    }

    #[test]
    fn friis_matches_closed_form() {
        let friis = FriisLoss::new(FREQ_HZ).unwrap();
        let wavelength = SPEED_OF_LIGHT_M_PER_S / FREQ_HZ;
        let expected = 20.0 * (4.0 * std::f64::consts::PI * 100.0 / wavelength).log10();
        assert!((friis.path_loss_db(100.0) - expected).abs() < 1e-9);

        // Doubling the distance adds 6.02 dB of loss.
        let delta = friis.path_loss_db(200.0) - friis.path_loss_db(100.0);
        assert!((delta - 20.0 * 2f64.log10()).abs() < 1e-9);
    }

    #[test]
    fn friis_rejects_non_positive_frequency() {
        assert!(FriisLoss::new(0.0).is_err());
        assert!(FriisLoss::new(-1.0).is_err());
    }

    #[test]
    fn fixed_rss_ignores_geometry_and_power() {
        let fixed = FixedRssLoss::new(-80.0);
        let mut r = rng();
        assert_eq!(fixed.rx_power_dbm(10.0, &at(0.0), &at(5.0), &mut r), -80.0);
        assert_eq!(fixed.rx_power_dbm(30.0, &at(0.0), &at(5000.0), &mut r), -80.0);
    }

    #[test]
    fn three_log_distance_is_continuous_at_breakpoints() {
        let model = ThreeLogDistanceLoss::default();
        for d in [200.0, 500.0] {
            let below = model.path_loss_db(d - 1e-6);
            let above = model.path_loss_db(d + 1e-6);
            assert!(
                (below - above).abs() < 1e-3,
                "discontinuity at {d} m: {below} vs {above}"
            );
        }
    }

    #[test]
    fn three_log_distance_is_monotonic() {
        let model = ThreeLogDistanceLoss::default();
        let mut previous = model.path_loss_db(1.0);
        for d in [5.0, 50.0, 199.0, 201.0, 499.0, 501.0, 1000.0] {
            let loss = model.path_loss_db(d);
            assert!(loss >= previous, "loss decreased between samples at {d} m");
            previous = loss;
        }
    }

    #[test]
    fn two_ray_uses_friis_below_crossover() {
        let model = TwoRayGroundLoss::new(FREQ_HZ, 1.0).unwrap();
        let friis = FriisLoss::new(FREQ_HZ).unwrap();
        let mut r = rng();
        // Heights 2 m / 2 m put the crossover well beyond 100 m at 5 GHz.
        let tx = Position::new(0.0, 0.0, 1.0);
        let rx = Position::new(100.0, 0.0, 1.0);
        assert!(model.crossover_distance_m(2.0, 2.0) > 100.0);
        let expected = friis.rx_power_dbm(12.0, &tx, &rx, &mut r);
        assert!((model.rx_power_dbm(12.0, &tx, &rx, &mut r) - expected).abs() < 1e-9);
    }

    #[test]
    fn two_ray_follows_fourth_power_law_beyond_crossover() {
        let model = TwoRayGroundLoss::new(FREQ_HZ, 1.0).unwrap();
        let mut r = rng();
        let crossover = model.crossover_distance_m(2.0, 2.0);
        let d = crossover * 2.0;
        let tx = Position::new(0.0, 0.0, 1.0);
        let near = model.rx_power_dbm(12.0, &tx, &Position::new(d, 0.0, 1.0), &mut r);
        let far = model.rx_power_dbm(12.0, &tx, &Position::new(2.0 * d, 0.0, 1.0), &mut r);
        // Doubling distance in the ground-reflection regime costs 12.04 dB.
        assert!(((near - far) - 40.0 * 2f64.log10()).abs() < 1e-9);
    }

    #[test]
    fn two_ray_rejects_negative_height() {
        assert!(TwoRayGroundLoss::new(FREQ_HZ, -0.5).is_err());
    }

    #[test]
    fn nakagami_is_deterministic_per_seed() {
        let model = NakagamiLoss::default();
        let mut a = rng();
        let mut b = rng();
        for d in [10.0, 100.0, 300.0] {
            let x = model.rx_power_dbm(10.0, &at(0.0), &at(d), &mut a);
            let y = model.rx_power_dbm(10.0, &at(0.0), &at(d), &mut b);
            assert_eq!(x, y);
        }
    }

    #[test]
    fn nakagami_preserves_mean_power() {
        let model = NakagamiLoss::default();
        let mut r = rng();
        let samples: Vec<f64> = (0..20_000)
            .map(|_| dbm_to_mw(model.rx_power_dbm(0.0, &at(0.0), &at(10.0), &mut r)))
            .collect();
        let mean_mw: f64 = samples.iter().sum::<f64>() / samples.len() as f64;
        // Incoming power is 0 dBm = 1 mW; the fading is mean-preserving.
        assert!((mean_mw - 1.0).abs() < 0.05, "mean was {mean_mw} mW");
    }

    #[test]
    fn nakagami_rejects_non_positive_shape() {
        assert!(NakagamiLoss::new(80.0, 200.0, 0.0, 0.75, 0.75).is_err());
    }

    #[test]
    fn constant_speed_delay_scales_with_distance() {
        let delay = ConstantSpeedDelay::default();
        let d = delay.delay(&at(0.0), &at(299_792_458.0 / 1000.0));
        assert_eq!(d.as_micros(), 1000);
    }
}
