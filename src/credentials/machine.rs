//! Hardware identifier lookup for key derivation.
//!
//! Prefers identifiers tied to the physical or virtual machine over anything
//! tied to the user account.

use tracing::debug;

/// Linux sources, most hardware-bound first. `product_uuid` is usually
/// root-only, so the systemd machine id is the common hit.
#[cfg_attr(any(target_os = "macos", target_os = "windows"), allow(dead_code))]
const LINUX_SOURCES: [&str; 3] = [
    "/sys/class/dmi/id/product_uuid",
    "/etc/machine-id",
    "/var/lib/dbus/machine-id",
];

/// Returns the machine identifier, or `None` when no source could be read.
pub fn read_machine_identifier() -> Option<String> {
    let identifier = platform_identifier();
    if identifier.is_none() {
        debug!("No machine identifier source was readable");
    }
    identifier
}

#[cfg(target_os = "macos")]
fn platform_identifier() -> Option<String> {
    let output = std::process::Command::new("ioreg")
        .args(["-rd1", "-c", "IOPlatformExpertDevice"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    parse_ioreg_platform_uuid(&String::from_utf8_lossy(&output.stdout))
}

#[cfg(target_os = "windows")]
fn platform_identifier() -> Option<String> {
    let output = std::process::Command::new("reg")
        .args([
            "query",
            r"HKLM\SOFTWARE\Microsoft\Cryptography",
            "/v",
            "MachineGuid",
        ])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    parse_reg_machine_guid(&String::from_utf8_lossy(&output.stdout))
}

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
fn platform_identifier() -> Option<String> {
    LINUX_SOURCES
        .iter()
        .find_map(|path| std::fs::read_to_string(path).ok().and_then(|raw| normalize(&raw)))
}

/// Extracts `IOPlatformUUID` from `ioreg -rd1 -c IOPlatformExpertDevice` output.
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn parse_ioreg_platform_uuid(output: &str) -> Option<String> {
    output
        .lines()
        .find(|line| line.contains("\"IOPlatformUUID\""))
        .and_then(|line| line.split_once('='))
        .and_then(|(_, value)| normalize(value.trim().trim_matches('"')))
}

/// Extracts `MachineGuid` from `reg query` output.
#[cfg_attr(not(target_os = "windows"), allow(dead_code))]
fn parse_reg_machine_guid(output: &str) -> Option<String> {
    output
        .lines()
        .find(|line| line.trim_start().starts_with("MachineGuid"))
        .and_then(|line| line.split_whitespace().last())
        .and_then(normalize)
}

fn normalize(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
