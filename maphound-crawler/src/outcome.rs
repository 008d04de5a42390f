// Response classification: every fetch resolves to exactly one Outcome
// variant, and the orchestrator's retry policy is a single match over it.

use maphound_core::VenueRecord;

use crate::extract::ListingExtractor;
use crate::fetch::FetchedPage;
use crate::grid::Probe;

/// HTTP statuses that signal targeting rather than transient trouble.
const BAN_STATUS_CODES: [u16; 3] = [403, 407, 429];

/// Block-page signatures scanned for in the body of otherwise-OK responses.
const BLOCK_PAGE_SIGNATURES: [&str; 10] = [
    "captcha",
    "recaptcha",
    "hcaptcha",
    "challenge",
    "access denied",
    "too many requests",
    "unusual traffic",
    "automated queries",
    "google.com/sorry",
    "blocked",
];

/// Only the head of the body is scanned; block pages are short.
const SIGNATURE_SCAN_LIMIT: usize = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostileKind {
    /// A ban-signature status code (429, 403, 407).
    Status(u16),
    /// A CAPTCHA or block page delivered with a success status.
    Captcha,
}

#[derive(Debug)]
pub enum Outcome {
    /// Cards were present; `raw_cards` is the pre-dedup card count that
    /// drives the subdivision decision.
    Success {
        records: Vec<VenueRecord>,
        raw_cards: usize,
    },
    /// The page rendered but held zero result cards. Not trusted on first
    /// sight: indistinguishable from a soft block.
    Empty,
    Hostile(HostileKind),
    /// Connection errors, timeouts, and server-side 5xx trouble.
    Transport(String),
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success { .. } => "success",
            Outcome::Empty => "empty",
            Outcome::Hostile(HostileKind::Captcha) => "captcha",
            Outcome::Hostile(HostileKind::Status(_)) => "hostile-status",
            Outcome::Transport(_) => "transport",
        }
    }
}

/// Classify a fetched page, running the extraction collaborator only when
/// the response is worth rendering.
pub fn classify(page: &FetchedPage, extractor: &dyn ListingExtractor, probe: &Probe) -> Outcome {
    if BAN_STATUS_CODES.contains(&page.status) {
        return Outcome::Hostile(HostileKind::Status(page.status));
    }
    if page.status >= 500 {
        return Outcome::Transport(format!("server error {}", page.status));
    }
    if page.status >= 400 {
        return Outcome::Transport(format!("unexpected status {}", page.status));
    }

    if body_has_block_signature(&page.body) {
        return Outcome::Hostile(HostileKind::Captcha);
    }

    let (records, raw_cards) = extractor.extract(&page.body, probe);
    if raw_cards == 0 {
        Outcome::Empty
    } else {
        Outcome::Success { records, raw_cards }
    }
}

fn body_has_block_signature(body: &str) -> bool {
    let head: String = body
        .chars()
        .take(SIGNATURE_SCAN_LIMIT)
        .collect::<String>()
        .to_lowercase();
    BLOCK_PAGE_SIGNATURES
        .iter()
        .any(|signature| head.contains(signature))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedExtractor {
        cards: usize,
    }

    impl ListingExtractor for FixedExtractor {
        fn extract(&self, _page: &str, probe: &Probe) -> (Vec<VenueRecord>, usize) {
            let records = (0..self.cards)
                .map(|i| {
                    VenueRecord::new(
                        format!("venue {i}"),
                        format!("{}#{i}", probe.key()),
                        String::new(),
                    )
                })
                .collect();
            (records, self.cards)
        }
    }

    fn page(status: u16, body: &str) -> FetchedPage {
        FetchedPage {
            status,
            body: body.to_string(),
            retry_after: None,
        }
    }

    #[test]
    fn ban_statuses_are_hostile() {
        let extractor = FixedExtractor { cards: 10 };
        let probe = Probe::new(41.0, 29.0, 15);
        for status in [429u16, 403, 407] {
            match classify(&page(status, ""), &extractor, &probe) {
                Outcome::Hostile(HostileKind::Status(s)) => assert_eq!(s, status),
                other => panic!("{status} classified as {}", other.label()),
            }
        }
    }

    #[test]
    fn server_errors_are_transport() {
        let extractor = FixedExtractor { cards: 10 };
        let probe = Probe::new(41.0, 29.0, 15);
        assert!(matches!(
            classify(&page(503, ""), &extractor, &probe),
            Outcome::Transport(_)
        ));
    }

    #[test]
    fn captcha_body_beats_a_success_status() {
        let extractor = FixedExtractor { cards: 10 };
        let probe = Probe::new(41.0, 29.0, 15);
        let body = "<html><body>Please solve this reCAPTCHA to continue</body></html>";
        assert!(matches!(
            classify(&page(200, body), &extractor, &probe),
            Outcome::Hostile(HostileKind::Captcha)
        ));
    }

    #[test]
    fn signature_deep_in_the_body_is_ignored() {
        let extractor = FixedExtractor { cards: 1 };
        let probe = Probe::new(41.0, 29.0, 15);
        let body = format!("{}captcha", "x".repeat(SIGNATURE_SCAN_LIMIT));
        assert!(matches!(
            classify(&page(200, &body), &extractor, &probe),
            Outcome::Success { .. }
        ));
    }

    #[test]
    fn zero_cards_is_empty_and_cards_are_success() {
        let probe = Probe::new(41.0, 29.0, 15);
        assert!(matches!(
            classify(&page(200, "<html></html>"), &FixedExtractor { cards: 0 }, &probe),
            Outcome::Empty
        ));
        match classify(&page(200, "<html></html>"), &FixedExtractor { cards: 150 }, &probe) {
            Outcome::Success { records, raw_cards } => {
                assert_eq!(records.len(), 150);
                assert_eq!(raw_cards, 150);
            }
            other => panic!("classified as {}", other.label()),
        }
    }
}
