///! Cartesian to geodetic conversion over a reference ellipsoid
///!
///! Latitude uses the closed-form Heikkinen solution, so there is no
///! iteration and no convergence threshold to tune.
use skywatch_common::{CartesianPosition, GeodeticPoint};

/// Vectors shorter than this are treated as the degenerate centre limit
const MIN_MAGNITUDE: f64 = 1e-100;

/// Vectors longer than this are treated as the far-field limit
const MAX_MAGNITUDE: f64 = 1e100;

/// Reference ellipsoid, axes in kilometres
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ellipsoid {
    pub semi_major: f64,
    pub semi_minor: f64,
}

impl Ellipsoid {
    /// The ellipsoid positions are displayed against
    pub const REFERENCE: Ellipsoid = Ellipsoid {
        semi_major: 6378.0,
        semi_minor: 6357.0,
    };

    /// First eccentricity squared, 1 - (b/a)^2
    pub fn eccentricity_squared(&self) -> f64 {
        let ratio = self.semi_minor / self.semi_major;
        1.0 - ratio * ratio
    }

    pub fn to_geodetic(&self, position: CartesianPosition) -> GeodeticPoint {
        let CartesianPosition { x, y, z } = position;

        let longitude_deg = if x == 0.0 && y == 0.0 {
            0.0
        } else {
            y.atan2(x).to_degrees()
        };

        GeodeticPoint {
            latitude_deg: self.latitude_deg(x, y, z),
            longitude_deg,
        }
    }

    fn latitude_deg(&self, x: f64, y: f64, z: f64) -> f64 {
        let e2 = self.eccentricity_squared();
        let r = x.hypot(y);

        if r == 0.0 {
            return if z > 0.0 {
                90.0
            } else if z < 0.0 {
                -90.0
            } else {
                0.0
            };
        }

        let magnitude = r.hypot(z);
        if magnitude > MAX_MAGNITUDE {
            let (r, z) = (r / magnitude, z / magnitude);
            return z.atan2(r).to_degrees();
        }
        if magnitude < MIN_MAGNITUDE {
            let (r, z) = (r / magnitude, z / magnitude);
            return z.atan2((1.0 - e2) * r).to_degrees();
        }

        let latitude = self.closed_form_latitude(r, z);
        if latitude.is_finite() {
            return latitude.to_degrees();
        }

        // Far from the surface the closed form overflows or leaves its
        // domain; use the matching limit instead
        let (a, b) = (self.semi_major, self.semi_minor);
        let outside = (r / a).powi(2) + (z / b).powi(2) > 1.0;
        if outside {
            z.atan2(r).to_degrees()
        } else {
            z.atan2((1.0 - e2) * r).to_degrees()
        }
    }

    /// Heikkinen's exact solution, in radians. `r` must be non-zero.
    fn closed_form_latitude(&self, r: f64, z: f64) -> f64 {
        let a = self.semi_major;
        let b = self.semi_minor;
        let a2 = a * a;
        let b2 = b * b;
        let e2 = self.eccentricity_squared();
        let e4 = e2 * e2;
        let r2 = r * r;
        let z2 = z * z;

        let f = 54.0 * b2 * z2;
        let g = r2 + (1.0 - e2) * z2 - e2 * (a2 - b2);
        let c = e4 * f * r2 / (g * g * g);
        let s = (1.0 + c + (c * c + 2.0 * c).sqrt()).cbrt();
        let k = s + 1.0 / s + 1.0;
        let p = f / (3.0 * k * k * g * g);
        let q = (1.0 + 2.0 * e4 * p).sqrt();
        let r0 = -(p * e2 * r) / (1.0 + q)
            + (0.5 * a2 * (1.0 + 1.0 / q)
                - p * (1.0 - e2) * z2 / (q * (1.0 + q))
                - 0.5 * p * r2)
                .sqrt();
        let t = r - e2 * r0;
        let v = (t * t + (1.0 - e2) * z2).sqrt();
        let z0 = b2 * z / (a * v);

        ((z + (a2 - b2) / b2 * z0) / r).atan()
    }

    /// Inverse conversion: geodetic latitude/longitude (degrees) and height
    /// above the ellipsoid (km) to a Cartesian position
    pub fn to_cartesian(
        &self,
        latitude_deg: f64,
        longitude_deg: f64,
        height_km: f64,
    ) -> CartesianPosition {
        let e2 = self.eccentricity_squared();
        let (sin_lat, cos_lat) = latitude_deg.to_radians().sin_cos();
        let (sin_lon, cos_lon) = longitude_deg.to_radians().sin_cos();

        let n = self.semi_major / (1.0 - e2 * sin_lat * sin_lat).sqrt();
        CartesianPosition::new(
            (n + height_km) * cos_lat * cos_lon,
            (n + height_km) * cos_lat * sin_lon,
            (n * (1.0 - e2) + height_km) * sin_lat,
        )
    }
}

/// Convert over [`Ellipsoid::REFERENCE`]
pub fn to_geodetic(position: CartesianPosition) -> GeodeticPoint {
    Ellipsoid::REFERENCE.to_geodetic(position)
}

/// Inverse of [`to_geodetic`] over [`Ellipsoid::REFERENCE`]
pub fn to_cartesian(latitude_deg: f64, longitude_deg: f64, height_km: f64) -> CartesianPosition {
    Ellipsoid::REFERENCE.to_cartesian(latitude_deg, longitude_deg, height_km)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_longitude_is_exact_atan2() {
        let samples = [
            (-4400.594, 1932.870, 4760.712),
            (1.0, 0.0, 0.0),
            (-1.0, -1e-12, 3.0),
            (7000.0, -7000.0, -100.0),
            (0.0, 42.0, 0.0),
            (-6378.0, 0.0, 0.0),
        ];
        for (x, y, z) in samples {
            let point = to_geodetic(CartesianPosition::new(x, y, z));
            assert_eq!(point.longitude_deg, y.atan2(x).to_degrees());
        }
    }

    #[test]
    fn test_reference_vectors() {
        let point = to_geodetic(CartesianPosition::new(-4400.594, 1932.870, 4760.712));
        assert_abs_diff_eq!(point.latitude_deg, 44.9044057307814, epsilon = 1e-9);
        assert_abs_diff_eq!(point.longitude_deg, 156.28750959891778, epsilon = 1e-9);

        let point = to_geodetic(CartesianPosition::new(1000.0, 2000.0, 6500.0));
        assert_abs_diff_eq!(point.latitude_deg, 71.1235574604574, epsilon = 1e-9);
        assert_abs_diff_eq!(point.longitude_deg, 63.43494882292201, epsilon = 1e-9);
    }

    #[test]
    fn test_round_trip_within_micro_degree() {
        let heights = [0.0, 0.5, 400.0, 1200.0, 20200.0, 35786.0];
        let mut latitude = -89.5;
        while latitude <= 89.5 {
            for longitude in [-179.9, -90.0, -12.5, 0.0, 45.0, 133.3, 179.9] {
                for height in heights {
                    let position = to_cartesian(latitude, longitude, height);
                    let point = to_geodetic(position);
                    assert_abs_diff_eq!(point.latitude_deg, latitude, epsilon = 1e-6);
                    assert_abs_diff_eq!(point.longitude_deg, longitude, epsilon = 1e-6);
                }
            }
            latitude += 2.5;
        }
    }

    #[test]
    fn test_equator_and_poles() {
        let point = to_geodetic(CartesianPosition::new(6378.0, 0.0, 0.0));
        assert_abs_diff_eq!(point.latitude_deg, 0.0, epsilon = 1e-12);
        assert_eq!(point.longitude_deg, 0.0);

        let north = to_geodetic(CartesianPosition::new(0.0, 0.0, 6357.0));
        assert_eq!(north.latitude_deg, 90.0);
        assert_eq!(north.longitude_deg, 0.0);

        let south = to_geodetic(CartesianPosition::new(0.0, 0.0, -7000.0));
        assert_eq!(south.latitude_deg, -90.0);

        let origin = to_geodetic(CartesianPosition::default());
        assert_eq!(origin, GeodeticPoint::default());
    }

    #[test]
    fn test_southern_hemisphere_is_mirrored() {
        let north = to_geodetic(CartesianPosition::new(3000.0, 4000.0, 4200.0));
        let south = to_geodetic(CartesianPosition::new(3000.0, 4000.0, -4200.0));
        assert_abs_diff_eq!(north.latitude_deg, -south.latitude_deg, epsilon = 1e-12);
    }

    #[test]
    fn test_extreme_magnitudes_stay_finite() {
        let direction = CartesianPosition::new(0.3, 0.4, 0.8);
        let geocentric = 0.8_f64.atan2(0.5).to_degrees();

        for scale in [1e60, 1e99, 1e150, 1e300] {
            let point = to_geodetic(direction.scaled(scale));
            assert_abs_diff_eq!(point.latitude_deg, geocentric, epsilon = 1e-9);
            assert_eq!(point.longitude_deg, 0.4_f64.atan2(0.3).to_degrees());
        }

        for scale in [1e-3, 1e-120, 1e-300] {
            let point = to_geodetic(direction.scaled(scale));
            assert!(point.latitude_deg.is_finite());
            assert!(point.latitude_deg > 0.0 && point.latitude_deg < 90.0);
        }
    }
}
