//! Plain-text metrics report

use std::fmt::Write;
use std::time::Duration;

use super::{MetricsSnapshot, TopicStatsSnapshot};

const BANNER: &str = "==================================================";
const TOPIC_COLUMN: usize = 30;

pub(super) fn render(
    snapshot: &MetricsSnapshot,
    top_topics: &[TopicStatsSnapshot],
    top_n: usize,
) -> String {
    let mut out = String::with_capacity(1024);

    // Writing into a String cannot fail
    let _ = write_report(&mut out, snapshot, top_topics, top_n);
    out
}

fn write_report(
    out: &mut String,
    s: &MetricsSnapshot,
    top_topics: &[TopicStatsSnapshot],
    top_n: usize,
) -> std::fmt::Result {
    writeln!(out, "{BANNER}")?;
    writeln!(out, "MQTT BROKER METRICS REPORT")?;
    writeln!(out, "{BANNER}")?;
    writeln!(out, "Uptime: {} seconds", s.uptime.as_secs())?;
    writeln!(out)?;

    writeln!(out, "CONNECTION STATISTICS:")?;
    writeln!(out, "  Current Connections: {}", s.connections_current)?;
    writeln!(out, "  Total Attempts: {}", s.connect_attempts)?;
    writeln!(out, "  Successful: {}", s.connect_successes)?;
    writeln!(out, "  Failed: {}", s.connect_failures)?;
    writeln!(out)?;

    writeln!(out, "MESSAGE STATISTICS:")?;
    writeln!(
        out,
        "  Messages Received: {} ({:.2} msg/s)",
        s.messages_received,
        s.messages_received_per_sec()
    )?;
    writeln!(
        out,
        "  Messages Sent: {} ({:.2} msg/s)",
        s.messages_sent,
        s.messages_sent_per_sec()
    )?;
    writeln!(out, "  Bytes Received: {}", format_bytes(s.bytes_received))?;
    writeln!(out, "  Bytes Sent: {}", format_bytes(s.bytes_sent))?;
    writeln!(out, "  Unsupported Msgs: {}", s.unsupported_messages)?;
    writeln!(out)?;

    writeln!(out, "SUBSCRIPTION STATISTICS:")?;
    writeln!(out, "  Active Subscriptions: {}", s.subscriptions_current)?;
    writeln!(out, "  Active Topics: {}", s.active_topics)?;
    writeln!(out)?;

    writeln!(out, "WILL STATISTICS:")?;
    writeln!(out, "  Published: {}", s.wills_published)?;
    writeln!(out, "  Discarded: {}", s.wills_discarded)?;

    if !top_topics.is_empty() {
        writeln!(out)?;
        writeln!(out, "TOP {top_n} TOPICS BY ACTIVITY:")?;
        for topic in top_topics {
            writeln!(
                out,
                "  {:<width$} | Publishes: {} | Last: {}",
                truncate(&topic.topic, TOPIC_COLUMN),
                topic.publish_count,
                format_since(topic.since_last_publish),
                width = TOPIC_COLUMN,
            )?;
        }
    }

    writeln!(out, "{BANNER}")?;
    Ok(())
}

/// Scale a byte count to B, KB, MB or GB (1024 based)
pub(super) fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;

    let value = bytes as f64;
    if bytes < 1024 {
        format!("{bytes} B")
    } else if value < MB {
        format!("{:.2} KB", value / KB)
    } else if value < GB {
        format!("{:.2} MB", value / MB)
    } else {
        format!("{:.2} GB", value / GB)
    }
}

/// Shorten to `max` characters, ending in "..." when cut
pub(super) fn truncate(topic: &str, max: usize) -> String {
    if topic.chars().count() <= max {
        return topic.to_string();
    }
    let kept: String = topic.chars().take(max.saturating_sub(3)).collect();
    format!("{kept}...")
}

pub(super) fn format_since(since: Option<Duration>) -> String {
    let Some(since) = since else {
        return "Never".to_string();
    };

    let secs = since.as_secs();
    if secs < 60 {
        format!("{secs}s ago")
    } else if secs < 3600 {
        format!("{}m ago", secs / 60)
    } else {
        format!("{}h ago", secs / 3600)
    }
}
