//! Beacon signal strength calculations.
//!
//! Contains helpers for:
//! - Log-distance path loss with optional log-normal shadowing
//! - RSSI sampling from transmit power and distance
//! - Deterministic coverage radius for a given reception floor
//!
//! Units:
//! - Power: dBm
//! - Distance: meters

use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::Deserialize;

/// Parameters defining the radio channel propagation model.
///
/// This struct encapsulates the constants used in the log-distance path loss model
/// with log-normal shadowing. These parameters determine how signal strength
/// decays over distance and how much random variation (shadowing) is applied.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PathLossParameters {
    /// Path loss exponent (n).
    ///
    /// Determines how quickly the signal power decays with distance.
    /// - n = 2.0: Free space (vacuum)
    /// - n = 2.7 to 3.5: Urban areas
    /// - n = 3.0 to 5.0: Indoor obstructed environments
    pub path_loss_exponent: f64,

    /// Standard deviation for log-normal shadowing (σ) in dB.
    ///
    /// A value of 0.0 disables shadowing.
    pub shadowing_sigma: f64,

    /// Path loss at the reference distance d₀ (1 meter) in dB.
    pub path_loss_at_reference_distance: f64,

    /// The thermal noise floor of the receiver in dBm.
    ///
    /// Beacons received below this level are not heard at all.
    pub noise_floor: f64,
}

/// Calculate the path loss (in dB) at a given distance using a log-distance
/// path loss model with log-normal shadowing.
///
/// # Formula
///
/// ```text
/// PL(d) = PL(d₀) + 10 × n × log₁₀(d/d₀) + X_σ
/// where d₀ = 1 meter (reference distance)
/// ```
///
/// # Parameters
///
/// - `distance`: The distance between transmitter and receiver in meters
/// - `params`: Path loss model parameters
/// - `rng`: Source of the shadowing samples; seeded by the caller so runs repeat
///
/// # Returns
///
/// Path loss in decibels (dB). For distances below 1 meter the reference loss
/// is returned without shadowing.
pub fn calculate_path_loss<R: Rng + ?Sized>(distance: f64, params: &PathLossParameters, rng: &mut R) -> f64 {
    if distance < 1.0 {
        return params.path_loss_at_reference_distance;
    }
    let path_loss = params.path_loss_at_reference_distance + 10.0 * params.path_loss_exponent * distance.log10();
    // Sample log-normal shadowing as a Normal(0, sigma) in dB
    let shadowing = match Normal::new(0.0_f64, params.shadowing_sigma) {
        Ok(normal) if params.shadowing_sigma > 0.0 => normal.sample(rng),
        _ => 0.0,
    };
    path_loss + shadowing
}

/// Calculate the instantaneous RSSI (in dBm) at a given distance.
///
/// Formula: RSSI(dBm) = P_tx(dBm) - PL(dB)
pub fn calculate_rssi<R: Rng + ?Sized>(distance: f64, tx_power_dbm: f64, params: &PathLossParameters, rng: &mut R) -> f64 {
    tx_power_dbm - calculate_path_loss(distance, params, rng)
}

// Solve P_tx - (PL0 + 10 n log10 d) = floor for d, ignoring shadowing.
/// Distance at which the mean received power drops to `floor_dbm`.
pub fn calculate_coverage_radius(tx_power_dbm: f64, floor_dbm: f64, params: &PathLossParameters) -> f64 {
    let numerator = tx_power_dbm - floor_dbm - params.path_loss_at_reference_distance;
    if numerator <= 0.0 {
        return 0.0;
    }
    10.0_f64.powf(numerator / (10.0 * params.path_loss_exponent))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn default_pathloss() -> PathLossParameters {
        PathLossParameters {
            path_loss_exponent: 2.0,
            shadowing_sigma: 0.0,
            path_loss_at_reference_distance: 40.0,
            noise_floor: -120.0,
        }
    }

    #[test]
    fn path_loss_without_shadowing_is_deterministic() {
        let params = default_pathloss();
        let mut rng = StdRng::seed_from_u64(1);
        // 40 dB + 20 * log10(100) = 80 dB
        assert!((calculate_path_loss(100.0, &params, &mut rng) - 80.0).abs() < 1e-9);
        assert_eq!(calculate_path_loss(0.5, &params, &mut rng), 40.0);
        assert!((calculate_rssi(100.0, 43.0, &params, &mut rng) - -37.0).abs() < 1e-9);
    }

    #[test]
    fn shadowing_is_reproducible_with_the_same_seed() {
        let params = PathLossParameters {
            shadowing_sigma: 4.0,
            ..default_pathloss()
        };
        let mut a = StdRng::seed_from_u64(42);
        let mut b = StdRng::seed_from_u64(42);
        let first: Vec<f64> = (0..5).map(|_| calculate_path_loss(500.0, &params, &mut a)).collect();
        let second: Vec<f64> = (0..5).map(|_| calculate_path_loss(500.0, &params, &mut b)).collect();
        assert_eq!(first, second);
        assert!(first.iter().any(|pl| (pl - (40.0 + 20.0 * 500.0_f64.log10())).abs() > 1e-6));
    }

    #[test]
    fn coverage_radius_matches_the_floor() {
        let params = default_pathloss();
        let radius = calculate_coverage_radius(20.0, -80.0, &params);
        // 20 - (-80) - 40 = 60 dB => 10^(60/20) = 1000 m
        assert!((radius - 1000.0).abs() < 1e-6);
        let mut rng = StdRng::seed_from_u64(0);
        assert!((calculate_rssi(radius, 20.0, &params, &mut rng) - -80.0).abs() < 1e-6);
        assert_eq!(calculate_coverage_radius(-100.0, -80.0, &params), 0.0);
    }
}
