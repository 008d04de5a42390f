use serde::{Deserialize, Serialize};

/// A single venue as extracted from one result card.
///
/// `external_id` is the platform's own identifier for the venue (a place id,
/// a cid, or a URL-derived fallback) and is the key used for deduplication
/// across probes and across runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueRecord {
    pub name: String,
    pub external_id: String,
    pub source_url: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub rating: Option<f32>,
    pub review_count: u32,
    pub categories: Vec<String>,
    pub price_level: Option<u8>,
    pub address: Option<String>,
    pub image_url: Option<String>,
}

impl VenueRecord {
    pub fn new(name: String, external_id: String, source_url: String) -> Self {
        Self {
            name,
            external_id,
            source_url,
            latitude: None,
            longitude: None,
            rating: None,
            review_count: 0,
            categories: Vec::new(),
            price_level: None,
            address: None,
            image_url: None,
        }
    }

    pub fn has_coordinates(&self) -> bool {
        self.latitude.is_some() && self.longitude.is_some()
    }
}
