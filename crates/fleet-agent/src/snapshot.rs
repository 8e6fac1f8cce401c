use std::path::Path;

use protocol::HostSnapshot;

/// Collects host identity from procfs and /etc. Missing files leave the
/// field empty.
pub async fn collect_host_snapshot() -> HostSnapshot {
    let hostname = read_trimmed("/etc/hostname")
        .await
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_default();
    let os = read_trimmed("/etc/os-release")
        .await
        .and_then(|text| parse_pretty_name(&text));
    let kernel = read_trimmed("/proc/sys/kernel/osrelease").await;
    let uptime_secs = read_trimmed("/proc/uptime")
        .await
        .and_then(|text| parse_uptime(&text));
    HostSnapshot {
        hostname,
        os,
        kernel,
        uptime_secs,
    }
}

async fn read_trimmed(path: impl AsRef<Path>) -> Option<String> {
    let text = tokio::fs::read_to_string(path).await.ok()?;
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn parse_pretty_name(os_release: &str) -> Option<String> {
    os_release.lines().find_map(|line| {
        let value = line.strip_prefix("PRETTY_NAME=")?;
        Some(value.trim_matches('"').to_string())
    })
}

fn parse_uptime(text: &str) -> Option<u64> {
    let seconds: f64 = text.split_whitespace().next()?.parse().ok()?;
    (seconds >= 0.0).then_some(seconds as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_os_release() {
        let text = "NAME=\"Ubuntu\"\nPRETTY_NAME=\"Ubuntu 22.04.4 LTS\"\nID=ubuntu\n";
        assert_eq!(parse_pretty_name(text).as_deref(), Some("Ubuntu 22.04.4 LTS"));
        assert_eq!(parse_pretty_name("ID=alpine\n"), None);
    }

    #[test]
    fn parses_uptime() {
        assert_eq!(parse_uptime("35234.51 140191.23\n"), Some(35234));
        assert_eq!(parse_uptime("garbage"), None);
    }
}
