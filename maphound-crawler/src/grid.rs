// Spatial grid planning: the initial probe lattice over a bounding box and
// the 2x2 subdivision of cells that come back too dense to enumerate in one
// pass.

use serde::{Deserialize, Serialize};

/// Geographic bounding box given by its north-east and south-west corners.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub ne_lat: f64,
    pub ne_lng: f64,
    pub sw_lat: f64,
    pub sw_lng: f64,
}

impl BoundingBox {
    pub fn new(ne_lat: f64, ne_lng: f64, sw_lat: f64, sw_lng: f64) -> Self {
        Self {
            ne_lat,
            ne_lng,
            sw_lat,
            sw_lng,
        }
    }

    pub fn contains(&self, lat: f64, lng: f64) -> bool {
        lat >= self.sw_lat && lat <= self.ne_lat && lng >= self.sw_lng && lng <= self.ne_lng
    }
}

impl Default for BoundingBox {
    // Istanbul metro area, the region the default platform table was tuned on.
    fn default() -> Self {
        Self::new(41.20, 29.15, 40.80, 28.60)
    }
}

/// One spatial search request: a coordinate at a zoom level.
///
/// Probes are immutable once created. Identity is the rounded coordinate
/// pair plus zoom (`key()`), which is what the checkpoint stores. `depth`
/// counts recursive subdivisions from the original lattice; `parent_key`
/// names the cell this probe refines, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Probe {
    pub latitude: f64,
    pub longitude: f64,
    pub zoom: u8,
    pub depth: u32,
    pub parent_key: Option<String>,
}

impl Probe {
    pub fn new(latitude: f64, longitude: f64, zoom: u8) -> Self {
        Self {
            latitude: round6(latitude),
            longitude: round6(longitude),
            zoom,
            depth: 0,
            parent_key: None,
        }
    }

    pub fn key(&self) -> String {
        format!("{:.6},{:.6},z{}", self.latitude, self.longitude, self.zoom)
    }
}

fn round6(v: f64) -> f64 {
    (v * 1_000_000.0).round() / 1_000_000.0
}

/// Plans the probe lattice and decides when and how to refine a cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridPlanner {
    /// Raw result-card count at which a cell is considered too dense and
    /// gets split into four children.
    pub card_threshold: usize,
    /// Fractional overlap between sibling children so venues on cell edges
    /// are not lost between them.
    pub overlap: f64,
    /// The service's maximum useful zoom; subdivision stops here.
    pub max_zoom: u8,
}

impl Default for GridPlanner {
    fn default() -> Self {
        Self {
            card_threshold: 100,
            overlap: 0.15,
            max_zoom: 21,
        }
    }
}

impl GridPlanner {
    /// Approximate coverage of one search viewport at `zoom`, in degrees.
    /// Calibrated at zoom 15; halves with every zoom step.
    pub fn coverage_span(zoom: u8) -> (f64, f64) {
        let factor = 2f64.powi(15 - zoom as i32);
        (0.027 * factor, 0.035 * factor)
    }

    /// Produce the n x n probe lattice over `bbox` at `zoom`.
    ///
    /// Points are evenly spaced across the box (a single centerless point at
    /// the south-west corner when n == 1) and returned in shuffled order so
    /// the target service never sees a sequential sweep pattern.
    pub fn generate_grid(&self, bbox: &BoundingBox, n: usize, zoom: u8) -> Vec<Probe> {
        let lat_range = bbox.ne_lat - bbox.sw_lat;
        let lng_range = bbox.ne_lng - bbox.sw_lng;
        let lat_step = if n > 1 { lat_range / (n - 1) as f64 } else { 0.0 };
        let lng_step = if n > 1 { lng_range / (n - 1) as f64 } else { 0.0 };

        let mut probes = Vec::with_capacity(n * n);
        for i in 0..n {
            for j in 0..n {
                let lat = bbox.sw_lat + i as f64 * lat_step;
                let lng = bbox.sw_lng + j as f64 * lng_step;
                probes.push(Probe::new(lat, lng, zoom));
            }
        }

        fastrand::shuffle(&mut probes);

        tracing::info!(
            points = probes.len(),
            lat_min = bbox.sw_lat,
            lat_max = bbox.ne_lat,
            lng_min = bbox.sw_lng,
            lng_max = bbox.ne_lng,
            "grid computed"
        );

        probes
    }

    /// Whether a probe that returned `raw_cards` result cards should be
    /// split. Density is measured on the raw card count, before dedup.
    /// Subdivision is disabled during the verification pass to bound its
    /// cost, and past the service's maximum useful zoom.
    pub fn should_subdivide(&self, raw_cards: usize, zoom: u8, verification_pass: bool) -> bool {
        raw_cards >= self.card_threshold && zoom < self.max_zoom && !verification_pass
    }

    /// Split a probe into four children at `zoom + 1`, offset from the
    /// parent center so their combined coverage (with overlap) spans the
    /// parent's estimated viewport.
    pub fn subdivide(&self, probe: &Probe) -> Vec<Probe> {
        let child_zoom = probe.zoom + 1;
        let (span_lat, span_lng) = Self::coverage_span(probe.zoom);
        let step_lat = span_lat / 2.0 * (1.0 - self.overlap);
        let step_lng = span_lng / 2.0 * (1.0 - self.overlap);

        let parent_key = probe.key();
        [
            (probe.latitude - step_lat, probe.longitude - step_lng),
            (probe.latitude - step_lat, probe.longitude + step_lng),
            (probe.latitude + step_lat, probe.longitude - step_lng),
            (probe.latitude + step_lat, probe.longitude + step_lng),
        ]
        .into_iter()
        .map(|(lat, lng)| Probe {
            latitude: round6(lat),
            longitude: round6(lng),
            zoom: child_zoom,
            depth: probe.depth + 1,
            parent_key: Some(parent_key.clone()),
        })
        .collect()
    }
}
