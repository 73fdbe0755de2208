use async_trait::async_trait;
use chrono::{DateTime, Utc};
use skywatch_common::{CartesianPosition, OrbitalElementRecord};

use crate::error::PropagationError;

/// Turns cached elements into an Earth-fixed position at `epoch`
///
/// Failures are per object: the pipeline skips the object and carries on.
#[async_trait]
pub trait Propagator: Send + Sync {
    async fn propagate(
        &self,
        record: &OrbitalElementRecord,
        epoch: DateTime<Utc>,
    ) -> Result<CartesianPosition, PropagationError>;
}

/// SGP4/SDP4 propagation with a TEME to Earth-fixed rotation
#[derive(Debug, Clone, Default)]
pub struct Sgp4Propagator {
    /// Reject element sets whose epoch is further than this from the
    /// requested instant
    max_element_age: Option<chrono::Duration>,
}

impl Sgp4Propagator {
    pub fn new(max_element_age: Option<chrono::Duration>) -> Self {
        Self { max_element_age }
    }

    /// Propagate synchronously; the trait method is a thin wrapper
    pub fn propagate_now(
        &self,
        record: &OrbitalElementRecord,
        epoch: DateTime<Utc>,
    ) -> Result<CartesianPosition, PropagationError> {
        let invalid = |reason: String| PropagationError::InvalidElements {
            catalog_id: record.catalog_id.clone(),
            reason,
        };
        let stale = |reason: String| PropagationError::StaleElements {
            catalog_id: record.catalog_id.clone(),
            reason,
        };

        let (line1, line2) = record
            .element_lines()
            .ok_or_else(|| invalid("element set has fewer than two data lines".to_string()))?;

        let elements = sgp4::Elements::from_tle(
            Some(record.name.clone()),
            line1.as_bytes(),
            line2.as_bytes(),
        )
        .map_err(|e| invalid(e.to_string()))?;

        let age = epoch.naive_utc() - elements.datetime;
        if let Some(max_age) = self.max_element_age {
            if age.abs() > max_age {
                return Err(stale(format!(
                    "elements are {} days from the requested epoch",
                    age.num_days().abs()
                )));
            }
        }

        let constants = sgp4::Constants::from_elements(&elements).map_err(|e| invalid(e.to_string()))?;

        let minutes = elements
            .datetime_to_minutes_since_epoch(&epoch.naive_utc())
            .map_err(|e| invalid(format!("{:?}", e)))?;

        // Propagation diverges for decayed orbits or far from the element epoch
        let prediction = constants.propagate(minutes).map_err(|e| stale(e.to_string()))?;

        let [x, y, z] = prediction.position;
        Ok(teme_to_earth_fixed(
            CartesianPosition::new(x, y, z),
            &epoch,
        ))
    }
}

#[async_trait]
impl Propagator for Sgp4Propagator {
    async fn propagate(
        &self,
        record: &OrbitalElementRecord,
        epoch: DateTime<Utc>,
    ) -> Result<CartesianPosition, PropagationError> {
        self.propagate_now(record, epoch)
    }
}

/// Rotate a TEME position about the z axis by Greenwich sidereal time
pub fn teme_to_earth_fixed(teme: CartesianPosition, epoch: &DateTime<Utc>) -> CartesianPosition {
    let theta = sgp4::iau_epoch_to_sidereal_time(sgp4::julian_years_since_j2000(&epoch.naive_utc()));
    let (sin_t, cos_t) = theta.sin_cos();
    CartesianPosition::new(
        cos_t * teme.x + sin_t * teme.y,
        -sin_t * teme.x + cos_t * teme.y,
        teme.z,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::sat::testing::CALSPHERE_1;
    use approx::assert_abs_diff_eq;
    use chrono::TimeZone;

    fn calsphere() -> OrbitalElementRecord {
        OrbitalElementRecord::new("00900", "CALSPHERE 1", CALSPHERE_1)
    }

    /// Epoch of the CALSPHERE 1 element set (2020 day 178.87487168)
    fn calsphere_epoch() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 6, 26, 20, 59, 49).unwrap()
    }

    #[test]
    fn test_radius_within_orbit_band() {
        let position = Sgp4Propagator::default()
            .propagate_now(&calsphere(), calsphere_epoch())
            .unwrap();
        // 13.73 rev/day with e = 0.0026: perigee ~7347 km, apogee ~7386 km
        let radius = position.magnitude();
        assert!(radius > 7300.0 && radius < 7450.0, "radius {}", radius);
    }

    #[test]
    fn test_rotation_preserves_radius_and_z() {
        let teme = CartesianPosition::new(-4400.594, 1932.870, 4760.712);
        let fixed = teme_to_earth_fixed(teme, &calsphere_epoch());
        assert_abs_diff_eq!(fixed.magnitude(), teme.magnitude(), epsilon = 1e-9);
        assert_eq!(fixed.z, teme.z);
    }

    #[test]
    fn test_garbage_elements_are_invalid() {
        let record = OrbitalElementRecord::new("00001", "JUNK", "JUNK\n1 not a tle\n2 not a tle");
        let err = Sgp4Propagator::default()
            .propagate_now(&record, calsphere_epoch())
            .unwrap_err();
        assert!(matches!(err, PropagationError::InvalidElements { .. }));

        let record = OrbitalElementRecord::new("00002", "EMPTY", "");
        assert!(Sgp4Propagator::default()
            .propagate_now(&record, calsphere_epoch())
            .is_err());
    }

    #[test]
    fn test_max_age_rejects_old_elements() {
        let propagator = Sgp4Propagator::new(Some(chrono::Duration::days(14)));
        let later = calsphere_epoch() + chrono::Duration::days(30);

        let err = propagator.propagate_now(&calsphere(), later).unwrap_err();
        assert!(matches!(err, PropagationError::StaleElements { ref catalog_id, .. } if catalog_id == "00900"));
        assert!(propagator
            .propagate_now(&calsphere(), calsphere_epoch() + chrono::Duration::days(1))
            .is_ok());
    }
}
