/// Pure formatting of run results: units and box-drawn tables.

use std::time::Duration;

use crate::loadtest::Report;
use crate::stats::{average_latency, bitrate_bps, loss_rate};
use crate::suite::SuiteRow;

// ── Units ────────────────────────────────────────────────────

pub fn format_bitrate(bps: f64) -> String {
    if bps >= 1_000_000.0 {
        format!("{:.2} Mbps", bps / 1_000_000.0)
    } else if bps >= 1_000.0 {
        format!("{:.1} kbps", bps / 1_000.0)
    } else {
        format!("{bps:.0} bps")
    }
}

/// `dropped / (packets + dropped)` as a percentage, "0%" when nothing was seen.
pub fn format_loss(dropped: u64, packets: u64) -> String {
    if packets + dropped == 0 {
        "0%".to_string()
    } else {
        format_percent(loss_rate(dropped, packets))
    }
}

pub fn format_percent(rate: f64) -> String {
    format!("{:.2}%", rate * 100.0)
}

/// Blank when there were no samples.
pub fn format_latency(latency: Option<Duration>) -> String {
    latency.map_or_else(String::new, |d| format!("{:.2} ms", d.as_secs_f64() * 1000.0))
}

// ── Table ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Align {
    Left,
    Right,
}

#[derive(Debug, Clone)]
pub struct Table {
    title: String,
    columns: Vec<(String, Align)>,
    rows: Vec<Vec<String>>,
    footer: Option<Vec<String>>,
}

impl Table {
    pub fn new(title: impl Into<String>, columns: &[(&str, Align)]) -> Self {
        Self {
            title: title.into(),
            columns: columns.iter().map(|(name, align)| (name.to_string(), *align)).collect(),
            rows: Vec::new(),
            footer: None,
        }
    }

    /// Missing cells render empty, extra cells are ignored.
    pub fn row(&mut self, cells: Vec<String>) {
        self.rows.push(cells);
    }

    pub fn footer(&mut self, cells: Vec<String>) {
        self.footer = Some(cells);
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn widths(&self) -> Vec<usize> {
        let mut widths: Vec<usize> = self.columns.iter().map(|(name, _)| width(name)).collect();
        for row in self.rows.iter().chain(self.footer.iter()) {
            for (w, cell) in widths.iter_mut().zip(row) {
                *w = (*w).max(width(cell));
            }
        }
        // Widen the last column so the title fits.
        let inner: usize = widths.iter().map(|w| w + 2).sum::<usize>() + widths.len().saturating_sub(1);
        let needed = width(&self.title) + 2;
        if needed > inner {
            if let Some(last) = widths.last_mut() {
                *last += needed - inner;
            }
        }
        widths
    }

    pub fn render(&self) -> String {
        let widths = self.widths();
        let inner: usize = widths.iter().map(|w| w + 2).sum::<usize>() + widths.len().saturating_sub(1);
        let rule = |left: &str, fill: &str, cross: &str, right: &str| {
            let segments: Vec<String> = widths.iter().map(|w| fill.repeat(w + 2)).collect();
            format!("{left}{}{right}\n", segments.join(cross))
        };
        let line = |cells: &[String], header: bool| {
            let parts: Vec<String> = widths
                .iter()
                .enumerate()
                .map(|(i, w)| {
                    let cell = cells.get(i).map(String::as_str).unwrap_or("");
                    let align = if header { Align::Left } else { self.columns[i].1 };
                    format!(" {} ", pad(cell, *w, align))
                })
                .collect();
            format!("║{}║\n", parts.join("│"))
        };

        let mut out = String::new();
        out.push_str(&format!("╔{}╗\n", "═".repeat(inner)));
        out.push_str(&format!("║ {} ║\n", pad(&self.title, inner - 2, Align::Left)));
        out.push_str(&rule("╠", "═", "╤", "╣"));
        let header: Vec<String> = self.columns.iter().map(|(name, _)| name.clone()).collect();
        out.push_str(&line(&header, true));
        out.push_str(&rule("╟", "─", "┼", "╢"));
        for row in &self.rows {
            out.push_str(&line(row, false));
        }
        if let Some(footer) = &self.footer {
            out.push_str(&rule("╟", "─", "┼", "╢"));
            out.push_str(&line(footer, false));
        }
        out.push_str(&rule("╚", "═", "╧", "╝"));
        out
    }
}

fn width(s: &str) -> usize {
    s.chars().count()
}

fn pad(s: &str, w: usize, align: Align) -> String {
    let fill = " ".repeat(w.saturating_sub(width(s)));
    match align {
        Align::Left => format!("{s}{fill}"),
        Align::Right => format!("{fill}{s}"),
    }
}

// ── Reports ──────────────────────────────────────────────────

/// Tester, Track, Kind, Pkts, Bitrate, Pkt. Loss for every subscribed track.
pub fn track_table(report: &Report) -> Table {
    let mut table = Table::new(
        "Tracks",
        &[
            ("Tester", Align::Left),
            ("Track", Align::Left),
            ("Kind", Align::Left),
            ("Pkts", Align::Right),
            ("Bitrate", Align::Right),
            ("Pkt. Loss", Align::Right),
        ],
    );
    for tester in &report.testers {
        for (track_id, track) in &tester.tracks {
            let track_name = report.track_names.get(track_id).unwrap_or(track_id);
            table.row(vec![
                tester.name.clone(),
                track_name.clone(),
                track.kind.to_string(),
                track.packets.to_string(),
                format_bitrate(bitrate_bps(track.bytes, track.elapsed)),
                format_loss(track.dropped, track.packets),
            ]);
        }
    }
    table
}

pub fn tester_table(report: &Report) -> Table {
    let mut table = Table::new(
        "Testers",
        &[
            ("Tester", Align::Left),
            ("Tracks", Align::Right),
            ("Pkts", Align::Right),
            ("Bitrate", Align::Right),
            ("Pkt. Loss", Align::Right),
            ("Latency", Align::Right),
            ("Error", Align::Left),
        ],
    );
    for s in &report.summaries {
        let summary = &s.summary;
        table.row(vec![
            s.name.clone(),
            format!("{}/{}", summary.tracks, summary.expected),
            summary.packets.to_string(),
            format_bitrate(summary.bitrate_bps()),
            format_loss(summary.dropped, summary.packets),
            format_latency(summary.avg_latency()),
            summary.error.clone().unwrap_or_default(),
        ]);
    }
    table
}

pub fn totals_table(report: &Report) -> Table {
    let totals = &report.totals;
    let mut table = Table::new(
        format!("Totals ({:.1}s)", report.elapsed.as_secs_f64()),
        &[
            ("Testers", Align::Right),
            ("Tracks", Align::Right),
            ("Pkts", Align::Right),
            ("Bitrate", Align::Right),
            ("Bitrate/Sub", Align::Right),
            ("Pkt. Loss", Align::Right),
            ("Latency", Align::Right),
            ("Errors", Align::Right),
        ],
    );
    table.row(vec![
        totals.testers.to_string(),
        format!("{}/{}", totals.tracks, totals.expected),
        totals.packets.to_string(),
        format_bitrate(totals.bitrate_bps),
        format_bitrate(totals.bitrate_per_subscriber_bps()),
        format_loss(totals.dropped, totals.packets),
        format_latency(average_latency(totals.latency_total_ns, totals.latency_count)),
        totals.errors.to_string(),
    ]);
    table
}

/// Per-track, per-tester and totals tables.
pub fn report(report: &Report) -> String {
    let mut out = String::new();
    let tracks = track_table(report);
    if !tracks.is_empty() {
        out.push_str(&tracks.render());
        out.push('\n');
    }
    out.push_str(&tester_table(report).render());
    out.push('\n');
    out.push_str(&totals_table(report).render());
    out
}

pub fn suite_table(rows: &[SuiteRow]) -> Table {
    let mut table = Table::new(
        "Suite",
        &[
            ("Pubs", Align::Right),
            ("Subs", Align::Right),
            ("Tracks", Align::Right),
            ("Audio", Align::Left),
            ("Video", Align::Left),
            ("Pkt. Loss", Align::Right),
            ("Errors", Align::Left),
        ],
    );
    let yes_no = |b: bool| (if b { "yes" } else { "no" }).to_string();
    for row in rows {
        let errors = match &row.failure {
            Some(failure) => failure.clone(),
            None => row.errors.to_string(),
        };
        table.row(vec![
            row.publishers.to_string(),
            row.subscribers.to_string(),
            row.tracks.to_string(),
            yes_no(row.audio),
            yes_no(row.video),
            if row.failure.is_some() {
                String::new()
            } else {
                format_percent(row.loss_rate)
            },
            errors,
        ]);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitrate_units() {
        assert_eq!(format_bitrate(0.0), "0 bps");
        assert_eq!(format_bitrate(999.0), "999 bps");
        assert_eq!(format_bitrate(32_000.0), "32.0 kbps");
        assert_eq!(format_bitrate(1_700_000.0), "1.70 Mbps");
    }

    #[test]
    fn loss_formatting() {
        assert_eq!(format_loss(0, 0), "0%");
        assert_eq!(format_loss(0, 100), "0.00%");
        assert_eq!(format_loss(1, 99), "1.00%");
        assert_eq!(format_loss(1, 2), "33.33%");
    }

    #[test]
    fn latency_formatting() {
        assert_eq!(format_latency(None), "");
        assert_eq!(format_latency(Some(Duration::from_micros(1500))), "1.50 ms");
    }

    #[test]
    fn table_layout() {
        let mut table = Table::new("T", &[("Name", Align::Left), ("N", Align::Right)]);
        table.row(vec!["alpha".into(), "1".into()]);
        table.row(vec!["b".into(), "200".into()]);
        table.footer(vec!["all".into()]);
        let rendered = table.render();
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines[0], "╔═════════════╗");
        assert_eq!(lines[1], "║ T           ║");
        assert_eq!(lines[2], "╠═══════╤═════╣");
        assert_eq!(lines[3], "║ Name  │ N   ║");
        assert_eq!(lines[5], "║ alpha │   1 ║");
        assert_eq!(lines[6], "║ b     │ 200 ║");
        assert_eq!(lines[8], "║ all   │     ║");
        assert_eq!(lines[9], "╚═══════╧═════╝");
        // every line has the same display width
        assert!(lines.iter().all(|l| l.chars().count() == 15));
    }

    #[test]
    fn long_title_widens_last_column() {
        let table = Table::new("A rather long title", &[("x", Align::Left)]);
        let rendered = table.render();
        let widths: Vec<usize> = rendered.lines().map(|l| l.chars().count()).collect();
        assert!(widths.iter().all(|&w| w == widths[0]));
        assert_eq!(widths[0], "A rather long title".len() + 4);
    }
}
