//! Cluster obfuscation for Remote ID display responses.
//!
//! Enforces the ASTM F3411 privacy floors (NET0480/NET0490) by enlarging the
//! bounding box of the view corners and flight positions until its geodesic
//! width, height, and area meet the configured minimums.
//!
//! Coordinates are `(x = lng, y = lat)` throughout, matching the spatial
//! index convention.

use crate::rid::types::{ClusterDetail, LatLngPoint};
use geo::{Distance, Geodesic, GeodesicArea, Point, Rect, coord};

/// ASTM F3411-v22a `NetMinObfuscationDistanceM`.
pub const NET_MIN_OBFUSCATION_DISTANCE_M: f64 = 300.0;
/// ASTM F3411-v22a `NetMinClusterSizePercent`.
pub const NET_MIN_CLUSTER_SIZE_PERCENT: f64 = 15.0;

// Spherical fallbacks for degenerate (zero-extent) edges.
const METERS_PER_DEGREE_LAT: f64 = 110_574.0;
const METERS_PER_DEGREE_LNG_EQUATOR: f64 = 111_320.0;

/// An axis-aligned obfuscation rectangle plus the point set it covers.
#[derive(Debug, Clone)]
pub struct Cluster {
    pub x_min: f64,
    pub x_max: f64,
    pub y_min: f64,
    pub y_max: f64,
    pub points: Vec<Point<f64>>,
}

impl Cluster {
    /// Geodesic arc length of the bottom edge, in meters.
    #[must_use]
    pub fn width_m(&self) -> f64 {
        Geodesic.distance(
            Point::new(self.x_min, self.y_min),
            Point::new(self.x_max, self.y_min),
        )
    }

    /// Geodesic arc length of the left edge, in meters.
    #[must_use]
    pub fn height_m(&self) -> f64 {
        Geodesic.distance(
            Point::new(self.x_min, self.y_min),
            Point::new(self.x_min, self.y_max),
        )
    }

    /// The rectangle's own geodesic area. The reported `ClusterDetail`
    /// carries the view area instead; this accessor exists for callers that
    /// need the cluster's.
    #[must_use]
    pub fn geodesic_area_sqm(&self) -> f64 {
        Rect::new(
            coord! { x: self.x_min, y: self.y_min },
            coord! { x: self.x_max, y: self.y_max },
        )
        .to_polygon()
        .geodesic_area_unsigned()
    }

    fn meters_per_degree_x(&self) -> f64 {
        let extent = self.x_max - self.x_min;
        if extent > f64::EPSILON {
            self.width_m() / extent
        } else {
            let mid_lat = ((self.y_min + self.y_max) / 2.0).to_radians();
            (METERS_PER_DEGREE_LNG_EQUATOR * mid_lat.cos()).max(1.0)
        }
    }

    fn meters_per_degree_y(&self) -> f64 {
        let extent = self.y_max - self.y_min;
        if extent > f64::EPSILON {
            self.height_m() / extent
        } else {
            METERS_PER_DEGREE_LAT
        }
    }
}

/// Geodesic area of a view rectangle, in square meters.
#[must_use]
pub fn view_area_sqm(view: &Rect<f64>) -> f64 {
    view.to_polygon().geodesic_area_unsigned()
}

/// Enlarge a cluster until it satisfies the obfuscation floors. The three
/// steps compose: each one measures the rectangle produced by the previous
/// step.
#[must_use]
pub fn extend_cluster(view_area_sqm: f64, mut cluster: Cluster) -> Cluster {
    // Width floor (NET0490).
    let width = cluster.width_m();
    if width < 2.0 * NET_MIN_OBFUSCATION_DISTANCE_M {
        let delta_deg =
            (NET_MIN_OBFUSCATION_DISTANCE_M - width / 2.0) / cluster.meters_per_degree_x();
        cluster.x_min -= delta_deg;
        cluster.x_max += delta_deg;
    }

    // Height floor (NET0490).
    let height = cluster.height_m();
    if height < 2.0 * NET_MIN_OBFUSCATION_DISTANCE_M {
        let delta_deg =
            (NET_MIN_OBFUSCATION_DISTANCE_M - height / 2.0) / cluster.meters_per_degree_y();
        cluster.y_min -= delta_deg;
        cluster.y_max += delta_deg;
    }

    // Area floor (NET0480).
    let width = cluster.width_m();
    let height = cluster.height_m();
    let area = width * height;
    let min_area = view_area_sqm * NET_MIN_CLUSTER_SIZE_PERCENT / 100.0;
    if area > 0.0 && area < min_area {
        let scale = (min_area / area).sqrt() / 2.0;
        let dx = scale * (cluster.x_max - cluster.x_min);
        let dy = scale * (cluster.y_max - cluster.y_min);
        cluster.x_min -= dx;
        cluster.x_max += dx;
        cluster.y_min -= dy;
        cluster.y_max += dy;
    }

    cluster
}

/// Compute the obfuscated cluster for a view and the flights within it.
///
/// The bounding box covers the view corners plus every flight's most recent
/// position, then is enlarged per the privacy floors. The returned
/// `area_sqm` is the view's area by contract.
#[must_use]
pub fn generate_cluster_details(
    flight_positions: &[LatLngPoint],
    view: Rect<f64>,
) -> Vec<ClusterDetail> {
    let mut all_positions: Vec<Point<f64>> = vec![
        Point::new(view.min().x, view.min().y),
        Point::new(view.max().x, view.max().y),
    ];
    all_positions.extend(
        flight_positions
            .iter()
            .map(|p| Point::new(p.lng, p.lat)),
    );

    let mut x_min = f64::INFINITY;
    let mut y_min = f64::INFINITY;
    let mut x_max = f64::NEG_INFINITY;
    let mut y_max = f64::NEG_INFINITY;
    for position in &all_positions {
        x_min = x_min.min(position.x());
        y_min = y_min.min(position.y());
        x_max = x_max.max(position.x());
        y_max = y_max.max(position.y());
    }

    let view_area = view_area_sqm(&view);
    let extended = extend_cluster(
        view_area,
        Cluster {
            x_min,
            x_max,
            y_min,
            y_max,
            points: all_positions,
        },
    );

    vec![ClusterDetail {
        corners: vec![
            LatLngPoint {
                lat: extended.y_min,
                lng: extended.x_min,
            },
            LatLngPoint {
                lat: extended.y_max,
                lng: extended.x_max,
            },
        ],
        area_sqm: view_area,
        number_of_flights: flight_positions.len(),
    }]
}
