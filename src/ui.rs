use colored::Colorize;
use provision::{NodeOutcome, NodeStatus};
use secretkit::{MappingOutcome, MappingResult};

/// Print an info message
pub fn info(msg: &str) {
    println!("{} {}", "ℹ".blue(), msg);
}

/// Print a success message
pub fn success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

/// Print a warning message
pub fn warn(msg: &str) {
    println!("{} {}", "⚠".yellow(), msg);
}

/// Print an error message
pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

/// Print a dim/muted message
pub fn dim(msg: &str) {
    println!("  {}", msg.dimmed());
}

/// Print a header/title
pub fn header(title: &str) {
    println!();
    println!("{}", title.bold());
    println!("{}", "─".repeat(title.chars().count()).dimmed());
}

/// Print a section header
pub fn section(title: &str) {
    println!();
    println!("{}", title.cyan().bold());
}

/// Print a key-value pair
pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", key.dimmed(), value);
}

// ============================================================================
// Outcome lines
// ============================================================================

/// One line for a node outcome
pub fn node_line(outcome: &NodeOutcome) -> String {
    let version = outcome
        .version
        .map(|v| format!(" v{v}"))
        .unwrap_or_default();
    match outcome.status {
        NodeStatus::Succeeded if outcome.changed => {
            format!("{} {}{}", "✓".green(), outcome.name, version.dimmed())
        }
        NodeStatus::Succeeded => format!(
            "{} {}{} {}",
            "✓".green(),
            outcome.name,
            version.dimmed(),
            "(unchanged)".dimmed()
        ),
        NodeStatus::Failed => format!(
            "{} {} {}",
            "✗".red(),
            outcome.name,
            outcome.error.as_deref().unwrap_or("failed").red()
        ),
        NodeStatus::Skipped => format!(
            "{} {} {}",
            "○".yellow(),
            outcome.name,
            outcome
                .skip_reason
                .as_ref()
                .map(|r| format!("skipped: {r}"))
                .unwrap_or_else(|| "skipped".into())
                .dimmed()
        ),
        NodeStatus::Pending | NodeStatus::Running => {
            format!("{} {} {}", "·".dimmed(), outcome.name, "planned".dimmed())
        }
    }
}

/// One line for a mapping outcome; names only
pub fn mapping_line(outcome: &MappingOutcome) -> String {
    let label = format!("{} → {}", outcome.source, outcome.target);
    match &outcome.result {
        MappingResult::Succeeded => format!("{} {label}", "✓".green()),
        MappingResult::Failed(_) => {
            let icon = if outcome.required {
                "✗".red()
            } else {
                "⚠".yellow()
            };
            format!(
                "{icon} {label} {}",
                outcome.error.as_deref().unwrap_or("failed").dimmed()
            )
        }
        MappingResult::Skipped(kind) => format!(
            "{} {label} {}",
            "○".yellow(),
            format!("skipped: {}", skip_label(kind)).dimmed()
        ),
    }
}

fn skip_label(kind: &secretkit::SkipKind) -> String {
    match kind {
        secretkit::SkipKind::NotConfigured => "not configured".into(),
        secretkit::SkipKind::UpstreamFailure { node } => format!("upstream '{node}' did not succeed"),
        secretkit::SkipKind::DryRun => "dry run".into(),
        secretkit::SkipKind::Cancelled => "cancelled".into(),
        secretkit::SkipKind::Aborted { node } => format!("run aborted by '{node}'"),
    }
}

/// Format a duration like `1m 05s` or `850ms`
pub fn format_duration(duration: chrono::Duration) -> String {
    let millis = duration.num_milliseconds().max(0);
    if millis < 1000 {
        return format!("{millis}ms");
    }
    let secs = millis / 1000;
    if secs < 60 {
        format!("{}.{}s", secs, (millis % 1000) / 100)
    } else {
        format!("{}m {:02}s", secs / 60, secs % 60)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use provision::SkipReason;
    use secretkit::{FailureKind, SecretMapping, SkipKind};

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::milliseconds(850)), "850ms");
        assert_eq!(format_duration(Duration::milliseconds(4_250)), "4.2s");
        assert_eq!(format_duration(Duration::seconds(65)), "1m 05s");
        assert_eq!(format_duration(Duration::milliseconds(-5)), "0ms");
    }

    #[test]
    fn test_node_lines() {
        colored::control::set_override(false);
        let changed = NodeOutcome::succeeded("vpc", 2, true, Utc::now());
        assert_eq!(node_line(&changed), "✓ vpc v2");

        let unchanged = NodeOutcome::succeeded("vpc", 2, false, Utc::now());
        assert!(node_line(&unchanged).ends_with("(unchanged)"));

        let skipped = NodeOutcome::skipped(
            "service",
            SkipReason::UpstreamFailure {
                node: "database".into(),
            },
        );
        assert!(node_line(&skipped).contains("database"));
    }

    #[test]
    fn test_mapping_lines() {
        colored::control::set_override(false);
        let mapping = SecretMapping::new("db_url", "github", "DATABASE_URL");
        let failed = MappingOutcome::failed(&mapping, FailureKind::MissingSecret, "not found");
        let line = mapping_line(&failed);
        assert!(line.contains("db_url → github:DATABASE_URL"));
        assert!(line.contains("not found"));

        let skipped = MappingOutcome::skipped(&mapping, SkipKind::DryRun);
        assert!(mapping_line(&skipped).contains("dry run"));
    }
}
