pub mod report;
pub mod venue;

pub use report::{CrawlSummary, ReportFormat};
pub use venue::VenueRecord;

const BANNER: &str = r#"
                       _                           _
  _ __ ___   __ _ _ __| |__   ___  _   _ _ __   __| |
 | '_ ` _ \ / _` | '_ \ '_ \ / _ \| | | | '_ \ / _` |
 | | | | | | (_| | |_) | | | | (_) | |_| | | | | (_| |
 |_| |_| |_|\__,_| .__/|_| |_|\___/ \__,_|_| |_|\__,_|
                 |_|
"#;

pub fn print_banner() {
    println!("{}", BANNER);
    println!(
        "  maphound v{} - grid-based venue harvester\n",
        env!("CARGO_PKG_VERSION")
    );
}
