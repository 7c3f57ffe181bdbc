//! Markdown summary written at the end of a session

use crate::proxy::models::Proxy;
use chrono::{DateTime, Utc};
use std::fmt::Write;

/// Countries listed in the summary
const TOP_COUNTRIES: usize = 5;

/// Count values in first-seen order
fn tally<'a>(keys: impl Iterator<Item = String> + 'a) -> Vec<(String, usize)> {
    let mut counts: Vec<(String, usize)> = Vec::new();
    for key in keys {
        match counts.iter_mut().find(|(seen, _)| *seen == key) {
            Some((_, count)) => *count += 1,
            None => counts.push((key, 1)),
        }
    }
    counts
}

/// Protocol distribution, upper-cased, in first-seen order
pub fn protocol_counts(proxies: &[Proxy]) -> Vec<(String, usize)> {
    tally(proxies.iter().map(|p| {
        p.protocol
            .map(|protocol| protocol.to_string().to_uppercase())
            .unwrap_or_else(|| "UNKNOWN".to_string())
    }))
}

/// The most common countries, ties kept in first-seen order
pub fn top_countries(proxies: &[Proxy], limit: usize) -> Vec<(String, usize)> {
    let mut counts = tally(
        proxies
            .iter()
            .map(|p| p.country.clone().unwrap_or_else(|| "Unknown".to_string())),
    );
    // sort_by is stable
    counts.sort_by(|a, b| b.1.cmp(&a.1));
    counts.truncate(limit);
    counts
}

/// Render the session summary document
pub fn render_summary(session_id: &str, proxies: &[Proxy], generated_at: DateTime<Utc>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Session Summary: {}", session_id);
    let _ = writeln!(out);
    let _ = writeln!(out, "## Overview");
    let _ = writeln!(out, "- **Total Verified Proxies**: {}", proxies.len());
    let _ = writeln!(
        out,
        "- **Timestamp**: {}",
        generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    let _ = writeln!(out);
    let _ = writeln!(out, "## Protocol Distribution");
    for (protocol, count) in protocol_counts(proxies) {
        let _ = writeln!(out, "- **{}**: {}", protocol, count);
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "## Top Countries");
    for (country, count) in top_countries(proxies, TOP_COUNTRIES) {
        let _ = writeln!(out, "- **{}**: {}", country, count);
    }
    out
}
