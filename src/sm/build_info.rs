use chrono::{DateTime, Utc};

pub fn build_host() -> &'static str {
    option_env!("SERVICEMASTER_BUILD_HOST").unwrap_or("unknown")
}

fn build_time_raw() -> &'static str {
    option_env!("SERVICEMASTER_BUILD_TIME").unwrap_or("unknown")
}

/// One line for the boot event log.
pub fn banner() -> String {
    format!(
        "servicemaster {} (built on {} at {})",
        env!("CARGO_PKG_VERSION"),
        build_host(),
        format_build_time(build_time_raw())
    )
}

/// build.rs stamps either `epoch:<secs>` or RFC3339; render both as
/// "YYYY-MM-DD HH:MM:SS" UTC and pass anything else through untouched.
fn format_build_time(raw: &str) -> String {
    let raw = raw.trim();
    let parsed = match raw.strip_prefix("epoch:") {
        Some(epoch) => epoch
            .trim()
            .parse::<i64>()
            .ok()
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0)),
        None => DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
    };
    match parsed {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => raw.to_string(),
    }
}
