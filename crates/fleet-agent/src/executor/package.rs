use std::time::Duration;

use anyhow::Context;
use protocol::PackageStatus;
use system_utils::process::run_command_with_timeout;
use tokio::process::Command;

const LIST_TIMEOUT: Duration = Duration::from_secs(60);

/// Queries the package manager for upgradable packages.
pub async fn collect_package_status() -> anyhow::Result<PackageStatus> {
    let mut cmd = Command::new("apt");
    cmd.arg("list").arg("--upgradable").env("LANG", "C");
    let output = run_command_with_timeout(&mut cmd, LIST_TIMEOUT, "apt list")
        .await
        .context("list upgradable packages")?;
    if !output.status.success() {
        anyhow::bail!(
            "apt list exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(parse_upgradable(&String::from_utf8_lossy(&output.stdout)))
}

/// Parses `apt list --upgradable` output.
pub fn parse_upgradable(text: &str) -> PackageStatus {
    let mut status = PackageStatus::default();
    for line in text.lines().map(str::trim) {
        if line.is_empty() || line.starts_with("Listing") || line.starts_with("WARNING") {
            continue;
        }
        let Some((name, _)) = line.split_once('/') else {
            continue;
        };
        status.pending_packages += 1;
        if line.contains("-security") {
            status.security_updates += 1;
        }
        status.packages.push(name.to_string());
    }
    status
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_pending_and_security_updates() {
        let text = "\
WARNING: apt does not have a stable CLI interface. Use with caution in scripts.

Listing... Done
openssl/jammy-updates,jammy-security 3.0.2-0ubuntu1.15 amd64 [upgradable from: 3.0.2-0ubuntu1.14]
curl/jammy-updates 7.81.0-1ubuntu1.16 amd64 [upgradable from: 7.81.0-1ubuntu1.15]
";
        let status = parse_upgradable(text);
        assert_eq!(status.pending_packages, 2);
        assert_eq!(status.security_updates, 1);
        assert_eq!(status.packages, vec!["openssl", "curl"]);
    }

    #[test]
    fn nothing_to_upgrade() {
        assert_eq!(parse_upgradable("Listing... Done\n"), PackageStatus::default());
    }
}
