// Run summary and report rendering

use chrono::{DateTime, Utc};
use colored::Colorize;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReportFormat {
    Text,
    Json,
}

impl ReportFormat {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "text" => Some(ReportFormat::Text),
            "json" => Some(ReportFormat::Json),
            _ => None,
        }
    }
}

/// Everything the operator sees at the end of a run.
///
/// No single probe failure is surfaced as a hard error; failures show up
/// here as aggregate counts. `aborted` is set only when the whole platform
/// crawl was stopped (daily quota, unrecoverable hourly wait).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrawlSummary {
    pub platform: String,
    pub probes_planned: usize,
    pub probes_skipped: usize,
    pub probes_completed: usize,
    pub probes_abandoned: usize,
    pub empty_cells: usize,
    pub unique_venues: usize,
    pub duplicates_elided: usize,
    pub captcha_hits: usize,
    pub ban_hits: usize,
    pub transport_failures: usize,
    pub subdivisions_spawned: usize,
    pub max_subdivision_depth: u32,
    pub verification_pass_run: bool,
    pub aborted: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_secs: f64,
}

impl CrawlSummary {
    pub fn new(platform: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            ..Default::default()
        }
    }

    pub fn completed_cleanly(&self) -> bool {
        self.aborted.is_none()
    }
}

pub fn render_report(summary: &CrawlSummary, format: &ReportFormat) -> String {
    match format {
        ReportFormat::Json => {
            serde_json::to_string_pretty(summary).unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"))
        }
        ReportFormat::Text => render_text_report(summary),
    }
}

fn render_text_report(summary: &CrawlSummary) -> String {
    let mut report = String::new();
    report.push_str(&format!("{}\n\n", "━".repeat(52)));
    report.push_str(&format!(
        "# Crawl summary: {}\n",
        summary.platform.bright_white().bold()
    ));
    report.push_str(&format!(
        "  Probes planned:      {}\n",
        summary.probes_planned
    ));
    if summary.probes_skipped > 0 {
        report.push_str(&format!(
            "  Probes skipped:      {} (checkpoint)\n",
            summary.probes_skipped
        ));
    }
    report.push_str(&format!(
        "  Probes completed:    {}\n",
        summary.probes_completed.to_string().green()
    ));
    report.push_str(&format!(
        "  Probes abandoned:    {}\n",
        colorize_nonzero(summary.probes_abandoned)
    ));
    report.push_str(&format!(
        "  Empty cells:         {}\n",
        summary.empty_cells
    ));
    report.push_str(&format!(
        "  Subdivisions:        {} (max depth {})\n",
        summary.subdivisions_spawned, summary.max_subdivision_depth
    ));
    report.push('\n');
    report.push_str(&format!(
        "  Unique venues:       {}\n",
        summary.unique_venues.to_string().green().bold()
    ));
    report.push_str(&format!(
        "  Duplicates elided:   {}\n",
        summary.duplicates_elided
    ));
    report.push('\n');
    report.push_str(&format!(
        "  CAPTCHA encounters:  {}\n",
        colorize_nonzero(summary.captcha_hits)
    ));
    report.push_str(&format!(
        "  Ban responses:       {}\n",
        colorize_nonzero(summary.ban_hits)
    ));
    report.push_str(&format!(
        "  Transport failures:  {}\n",
        colorize_nonzero(summary.transport_failures)
    ));
    report.push('\n');
    report.push_str(&format!(
        "  Verification pass:   {}\n",
        if summary.verification_pass_run {
            "run".green().to_string()
        } else {
            "not run".yellow().to_string()
        }
    ));
    report.push_str(&format!(
        "  Duration:            {:.0}s\n",
        summary.duration_secs
    ));
    match &summary.aborted {
        Some(reason) => {
            report.push_str(&format!(
                "  Outcome:             {} ({})\n",
                "ABORTED".red().bold(),
                reason
            ));
        }
        None => {
            report.push_str(&format!(
                "  Outcome:             {}\n",
                "completed cleanly".green()
            ));
        }
    }
    report.push_str(&format!("\n{}\n", "━".repeat(52)));
    report
}

fn colorize_nonzero(n: usize) -> String {
    if n > 0 {
        n.to_string().yellow().to_string()
    } else {
        n.to_string()
    }
}
