// The extraction collaborator contract, plus a default implementation that
// reads result cards out of a rendered search page.
//
// The orchestrator only depends on the trait; the card count it returns is
// the raw, pre-dedup number, which is what the subdivision trigger needs.

use maphound_core::VenueRecord;
use regex::Regex;
use scraper::{Html, Selector};

use crate::grid::Probe;

pub trait ListingExtractor: Send + Sync {
    /// Convert a rendered page into venue records. Returns the records and
    /// the raw result-card count (before dedup and before any ceiling).
    fn extract(&self, page: &str, probe: &Probe) -> (Vec<VenueRecord>, usize);
}

/// Card extractor for map search result pages: one `/maps/place/` anchor per
/// card, with name, rating, review count, category, price and address read
/// from the card subtree and ids/coordinates parsed out of the href.
pub struct HtmlCardExtractor {
    /// Ceiling on cards converted per probe (the scroll-depth equivalent of
    /// a browser-driven session). The raw count reported for density is not
    /// capped.
    max_cards: usize,
    place_id: Regex,
    cid: Regex,
    ftid: Regex,
    slug: Regex,
    coords_at: Regex,
    coord_lat: Regex,
    coord_lng: Regex,
    rating: Regex,
    reviews: Regex,
    price: Regex,
}

impl HtmlCardExtractor {
    pub fn new(max_cards: usize) -> Self {
        Self {
            max_cards,
            place_id: Regex::new(r"!1s(0x[0-9a-fA-F]+:0x[0-9a-fA-F]+)").unwrap(),
            cid: Regex::new(r"[?&]cid=(\d+)").unwrap(),
            ftid: Regex::new(r"ftid=(0x[0-9a-fA-F]+:0x[0-9a-fA-F]+)").unwrap(),
            slug: Regex::new(r"/maps/place/([^/?]+)").unwrap(),
            coords_at: Regex::new(r"@(-?\d+\.?\d*),(-?\d+\.?\d*)").unwrap(),
            coord_lat: Regex::new(r"!3d(-?\d+\.?\d*)").unwrap(),
            coord_lng: Regex::new(r"!4d(-?\d+\.?\d*)").unwrap(),
            rating: Regex::new(r"(\d[.,]\d)").unwrap(),
            reviews: Regex::new(r"\((\d[\d.,]*)\)").unwrap(),
            price: Regex::new(r"([₺$€]{1,4})").unwrap(),
        }
    }

    /// External id for a card: place id, then cid, then ftid, then a
    /// sanitized URL slug as last resort.
    fn external_id(&self, href: &str) -> Option<String> {
        if let Some(caps) = self.place_id.captures(href) {
            return Some(caps[1].to_string());
        }
        if let Some(caps) = self.cid.captures(href) {
            return Some(format!("cid_{}", &caps[1]));
        }
        if let Some(caps) = self.ftid.captures(href) {
            return Some(caps[1].to_string());
        }
        if let Some(caps) = self.slug.captures(href) {
            let cleaned: String = caps[1]
                .chars()
                .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
                .collect();
            let cleaned: String = cleaned.trim_matches('_').chars().take(80).collect();
            if cleaned.chars().count() > 3 {
                return Some(format!("url_{cleaned}"));
            }
        }
        None
    }

    fn coordinates(&self, href: &str) -> (Option<f64>, Option<f64>) {
        if let Some(caps) = self.coords_at.captures(href) {
            let lat = caps[1].parse::<f64>().ok();
            let lng = caps[2].parse::<f64>().ok();
            if lat.is_some() && lng.is_some() {
                return (lat, lng);
            }
        }
        let lat = self
            .coord_lat
            .captures(href)
            .and_then(|c| c[1].parse::<f64>().ok());
        let lng = self
            .coord_lng
            .captures(href)
            .and_then(|c| c[1].parse::<f64>().ok());
        match (lat, lng) {
            (Some(lat), Some(lng)) => (Some(lat), Some(lng)),
            _ => (None, None),
        }
    }

    fn rating_from(&self, card_text: &str) -> Option<f32> {
        let caps = self.rating.captures(card_text)?;
        let value: f32 = caps[1].replace(',', ".").parse().ok()?;
        (0.0..=5.0).contains(&value).then_some(value)
    }

    fn reviews_from(&self, card_text: &str) -> u32 {
        self.reviews
            .captures(card_text)
            .map(|c| parse_count(&c[1]))
            .unwrap_or(0)
    }

    fn price_from(&self, card_text: &str) -> Option<u8> {
        self.price
            .captures(card_text)
            .map(|c| c[1].chars().count() as u8)
    }
}

impl Default for HtmlCardExtractor {
    fn default() -> Self {
        Self::new(500)
    }
}

impl ListingExtractor for HtmlCardExtractor {
    fn extract(&self, page: &str, _probe: &Probe) -> (Vec<VenueRecord>, usize) {
        let document = Html::parse_document(page);

        let card_selector = Selector::parse(r#"a[href*="/maps/place/"]"#).unwrap();
        let name_selector =
            Selector::parse(".fontHeadlineSmall, .qBF1Pd, span.fontHeadlineSmall").unwrap();
        let category_selector = Selector::parse("span.DkEaL").unwrap();
        let address_selector = Selector::parse("div.W4Efsd").unwrap();
        let image_selector = Selector::parse("img[src]").unwrap();

        let cards: Vec<_> = document.select(&card_selector).collect();
        let raw_cards = cards.len();

        let mut records = Vec::new();
        for card in cards {
            if records.len() >= self.max_cards {
                tracing::debug!(raw_cards, ceiling = self.max_cards, "card ceiling hit");
                break;
            }

            let Some(href) = card.value().attr("href") else {
                continue;
            };
            let Some(external_id) = self.external_id(href) else {
                continue;
            };

            let name = card
                .select(&name_selector)
                .next()
                .map(|el| el.text().collect::<String>().trim().to_string())
                .filter(|t| !t.is_empty())
                .or_else(|| {
                    card.value()
                        .attr("aria-label")
                        .map(|l| l.trim().to_string())
                        .filter(|l| !l.is_empty())
                });
            let Some(name) = name else {
                continue;
            };

            let card_text = card.text().collect::<Vec<_>>().join("\n");
            let (latitude, longitude) = self.coordinates(href);

            let categories = card
                .select(&category_selector)
                .next()
                .map(|el| el.text().collect::<String>())
                .map(|raw| {
                    raw.split(['·', '•', '|'])
                        .map(str::trim)
                        .filter(|part| !part.is_empty() && !self.price.is_match(part))
                        .map(String::from)
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();

            let address = card
                .select(&address_selector)
                .filter_map(|el| {
                    let text = el.text().collect::<String>();
                    text.rsplit('·').next().map(|s| s.trim().to_string())
                })
                .find(|segment| segment.len() > 5 && !self.price.is_match(segment));

            let image_url = card
                .select(&image_selector)
                .next()
                .and_then(|el| el.value().attr("src"))
                .filter(|src| !src.starts_with("data:"))
                .map(String::from);

            let mut record = VenueRecord::new(name, external_id, href.to_string());
            record.latitude = latitude;
            record.longitude = longitude;
            record.rating = self.rating_from(&card_text);
            record.review_count = self.reviews_from(&card_text);
            record.categories = categories;
            record.price_level = self.price_from(&card_text);
            record.address = address;
            record.image_url = image_url;
            records.push(record);
        }

        (records, raw_cards)
    }
}

/// Parse a human-formatted count: "1.234" and "1,234" are thousands
/// groupings, "1,2K"/"1.2B" are thousand abbreviations.
fn parse_count(text: &str) -> u32 {
    let cleaned: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '.' | ',' | 'K' | 'k' | 'B' | 'b'))
        .collect();
    if cleaned.is_empty() {
        return 0;
    }

    let (digits, multiplier) = match cleaned.chars().last() {
        Some('K') | Some('k') | Some('B') | Some('b') => {
            (&cleaned[..cleaned.len() - 1], 1000.0)
        }
        _ => (cleaned.as_str(), 1.0),
    };

    let normalized = normalize_separators(digits);
    normalized
        .parse::<f64>()
        .map(|v| (v * multiplier) as u32)
        .unwrap_or(0)
}

fn normalize_separators(digits: &str) -> String {
    let has_dot = digits.contains('.');
    let has_comma = digits.contains(',');
    match (has_dot, has_comma) {
        (true, true) => {
            // both present: the later one is the decimal separator
            if digits.rfind('.') > digits.rfind(',') {
                digits.replace(',', "")
            } else {
                digits.replace('.', "").replace(',', ".")
            }
        }
        (true, false) => {
            // "1.234" is a thousands grouping, "4.5" is a decimal
            let tail = digits.rsplit('.').next().unwrap_or("");
            if tail.len() == 3 {
                digits.replace('.', "")
            } else {
                digits.to_string()
            }
        }
        (false, true) => {
            let tail = digits.rsplit(',').next().unwrap_or("");
            if tail.len() == 3 {
                digits.replace(',', "")
            } else {
                digits.replace(',', ".")
            }
        }
        (false, false) => digits.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card(id: usize, name: &str, details: &str) -> String {
        format!(
            r#"<div class="card">
                 <a href="https://maps.example.com/maps/place/{name}/@41.0{id},29.0{id},16z/data=!1s0x14c{id:x}:0xbeef{id:x}" aria-label="{name}">
                   <div class="qBF1Pd">{name}</div>
                   {details}
                 </a>
               </div>"#
        )
    }

    fn wrap(cards: &str) -> String {
        format!("<html><body><div role=\"feed\">{cards}</div></body></html>")
    }

    #[test]
    fn extracts_cards_with_ids_names_and_coordinates() {
        let html = wrap(&format!(
            "{}{}",
            card(1, "Lokanta Meyhane", "<span class='MW4etd'>4,6</span><span class='UY7F9'>(1.234)</span>"),
            card(2, "Balikci Sahil", ""),
        ));
        let extractor = HtmlCardExtractor::default();
        let probe = Probe::new(41.0, 29.0, 15);
        let (records, raw) = extractor.extract(&html, &probe);

        assert_eq!(raw, 2);
        assert_eq!(records.len(), 2);

        let first = &records[0];
        assert_eq!(first.name, "Lokanta Meyhane");
        assert_eq!(first.external_id, "0x14c1:0xbeef1");
        assert_eq!(first.rating, Some(4.6));
        assert_eq!(first.review_count, 1234);
        assert!(first.has_coordinates());
    }

    #[test]
    fn cards_without_a_place_link_are_not_counted() {
        let html = wrap(r#"<a href="/maps/search/other">not a card</a>"#);
        let extractor = HtmlCardExtractor::default();
        let (records, raw) = extractor.extract(&html, &Probe::new(41.0, 29.0, 15));
        assert_eq!(raw, 0);
        assert!(records.is_empty());
    }

    #[test]
    fn id_fallbacks_go_cid_then_slug() {
        let extractor = HtmlCardExtractor::default();
        assert_eq!(
            extractor.external_id("/maps/place/Foo?cid=12345"),
            Some("cid_12345".to_string())
        );
        assert_eq!(
            extractor.external_id("/maps/place/Kebapci%20Mahmut/"),
            Some("url_Kebapci_20Mahmut".to_string())
        );
        assert_eq!(extractor.external_id("/maps/place/ab/"), None);
    }

    #[test]
    fn coordinates_fall_back_to_the_3d4d_form() {
        let extractor = HtmlCardExtractor::default();
        let (lat, lng) = extractor.coordinates("/maps/place/X/data=!3d41.0082!4d28.9784");
        assert_eq!(lat, Some(41.0082));
        assert_eq!(lng, Some(28.9784));
    }

    #[test]
    fn raw_count_is_not_capped_by_the_card_ceiling() {
        let many: String = (0..30).map(|i| card(i, &format!("Venue{i}"), "")).collect();
        let extractor = HtmlCardExtractor::new(10);
        let (records, raw) = extractor.extract(&wrap(&many), &Probe::new(41.0, 29.0, 15));
        assert_eq!(raw, 30);
        assert_eq!(records.len(), 10);
    }

    #[test]
    fn count_parsing_handles_groupings_and_abbreviations() {
        assert_eq!(parse_count("1.234"), 1234);
        assert_eq!(parse_count("1,234"), 1234);
        assert_eq!(parse_count("1234"), 1234);
        assert_eq!(parse_count("1,2K"), 1200);
        assert_eq!(parse_count("4.5"), 4);
        assert_eq!(parse_count(""), 0);
        assert_eq!(parse_count("no digits"), 0);
    }
}
