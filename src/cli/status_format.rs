//! Formatting helpers for the status command display.

use super::status::{HealthState, SystemStatus};
use crate::health::{HealthRecord, RecordKind};

/// Print status in human-readable format.
pub fn print_status_human(status: &SystemStatus) {
    print_header(status);
    print_vram(status);
    print_models(status);
    print_agents(status);
    print_breakers(status);
}

fn print_header(status: &SystemStatus) {
    let health_icon = match status.health {
        HealthState::Healthy => "V",
        HealthState::Degraded => "!",
        HealthState::Unhealthy => "X",
    };

    println!("====================================================");
    println!("  GG-ORCHESTRATOR Status                 v{}", status.version);
    println!("====================================================");
    println!(
        "  Health: {} {:10}  Uptime: {}",
        health_icon,
        status.health,
        format_uptime(status.snapshot.uptime_secs)
    );
    println!("  Host: {}  At: {}", status.snapshot.host, status.snapshot.generated_at);
    println!("====================================================");
}

fn print_vram(status: &SystemStatus) {
    let budget = &status.snapshot.budget;
    println!("\nVRAM");
    println!(
        "  Used: {} / {} ({:.1}%)   Pending: {}   Reserved: {}",
        format_bytes(budget.used_bytes),
        format_bytes(budget.capacity()),
        percent(budget.used_bytes, budget.capacity()),
        format_bytes(budget.pending_bytes),
        format_bytes(budget.reserved_bytes)
    );
}

fn print_models(status: &SystemStatus) {
    let models: Vec<&HealthRecord> = records(status, RecordKind::Model).collect();
    let resident = models.iter().filter(|r| r.state == "resident").count();
    println!("\nModels ({} resident of {})", resident, models.len());
    println!("  Name                        | State      | VRAM     | Breaker");
    println!("  ----------------------------+------------+----------+----------");
    for model in models {
        println!(
            "  {:27} | {:10} | {:>8} | {}",
            truncate(&model.id, 27),
            model.state,
            format_bytes(model.vram_bytes),
            model.breaker_state.map(|s| s.as_str()).unwrap_or("-")
        );
    }
}

fn print_agents(status: &SystemStatus) {
    let agents: Vec<&HealthRecord> = records(status, RecordKind::Agent).collect();
    if agents.is_empty() {
        return;
    }
    println!("\nAgents ({})", agents.len());
    println!("  Name                        | State      | Last heartbeat");
    println!("  ----------------------------+------------+-------------------------");
    for agent in agents {
        println!(
            "  {:27} | {:10} | {}",
            truncate(&agent.id, 27),
            agent.state,
            agent.last_used_at.as_deref().unwrap_or("-")
        );
    }
}

fn print_breakers(status: &SystemStatus) {
    if status.snapshot.breakers.is_empty() {
        return;
    }
    println!("\nBackends ({} open)", status.snapshot.open_breakers());
    for b in &status.snapshot.breakers {
        println!(
            "  {:20} {:10} failures: {}  recovery: {}ms",
            truncate(&b.backend, 20),
            b.state.as_str(),
            b.failure_count,
            b.recovery_timeout_ms
        );
    }
}

fn records(status: &SystemStatus, kind: RecordKind) -> impl Iterator<Item = &HealthRecord> {
    status.snapshot.records.iter().filter(move |r| r.kind == kind)
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

/// Format uptime in human-readable form.
pub fn format_uptime(secs: u64) -> String {
    let days = secs / 86400;
    let hours = (secs % 86400) / 3600;
    let minutes = (secs % 3600) / 60;

    if days > 0 {
        format!("{}d {}h {}m", days, hours, minutes)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else {
        format!("{}m", minutes)
    }
}

/// Format bytes in human-readable form.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Truncate a string to at most `max_len` characters.
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
