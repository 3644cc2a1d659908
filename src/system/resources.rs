//! System resource monitoring
//!
//! Best-effort RAM figures, logged after a model load.

use serde::Serialize;

/// System resource usage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResourceUsage {
    pub ram_used_mb: u64,
    pub ram_total_mb: u64,
    /// Resident set of this process
    pub process_rss_mb: u64,
}

#[cfg(any(target_os = "windows", target_os = "macos"))]
use std::process::Command;

/// Get system memory usage (best effort)
pub fn get_resource_usage() -> ResourceUsage {
    #[cfg(target_os = "linux")]
    {
        return get_resource_usage_linux();
    }

    #[cfg(target_os = "windows")]
    {
        return get_resource_usage_windows();
    }

    #[cfg(target_os = "macos")]
    {
        return get_resource_usage_macos();
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
    {
        ResourceUsage::default()
    }
}

/// First number after `label` in `key: value kB` style text, in kB.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn field_kb(text: &str, label: &str) -> Option<u64> {
    text.lines()
        .find_map(|line| line.strip_prefix(label))
        .and_then(|rest| rest.trim_start_matches(':').split_whitespace().next())
        .and_then(|value| value.parse().ok())
}

/// Total and used RAM from `/proc/meminfo` text.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_meminfo(text: &str) -> Option<(u64, u64)> {
    let total = field_kb(text, "MemTotal")?;
    let available = field_kb(text, "MemAvailable").or_else(|| field_kb(text, "MemFree"))?;
    Some((total / 1024, total.saturating_sub(available) / 1024))
}

/// Resident set from `/proc/self/status` text.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_status_rss(text: &str) -> Option<u64> {
    field_kb(text, "VmRSS").map(|kb| kb / 1024)
}

// =============================================================================
// Linux resource monitoring
// =============================================================================

#[cfg(target_os = "linux")]
fn get_resource_usage_linux() -> ResourceUsage {
    let mut usage = ResourceUsage::default();
    if let Some((total, used)) = std::fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|text| parse_meminfo(&text))
    {
        usage.ram_total_mb = total;
        usage.ram_used_mb = used;
    }
    if let Some(rss) = std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|text| parse_status_rss(&text))
    {
        usage.process_rss_mb = rss;
    }
    usage
}

// =============================================================================
// macOS resource monitoring
// =============================================================================

#[cfg(target_os = "macos")]
fn get_resource_usage_macos() -> ResourceUsage {
    ResourceUsage {
        ram_used_mb: get_macos_used_ram_mb().unwrap_or(0),
        ram_total_mb: get_macos_total_ram_mb().unwrap_or(0),
        process_rss_mb: get_ps_rss_mb().unwrap_or(0),
    }
}

/// Get total RAM via sysctl hw.memsize (returns bytes, we convert to MB)
#[cfg(target_os = "macos")]
fn get_macos_total_ram_mb() -> Option<u64> {
    let output = Command::new("sysctl")
        .args(["-n", "hw.memsize"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let bytes = String::from_utf8_lossy(&output.stdout).trim().parse::<u64>().ok()?;
    Some(bytes / 1024 / 1024)
}

#[cfg(target_os = "macos")]
fn get_macos_used_ram_mb() -> Option<u64> {
    let output = Command::new("vm_stat").output().ok()?;
    if !output.status.success() {
        return None;
    }
    parse_vm_stat(&String::from_utf8_lossy(&output.stdout))
}

/// Resident set of this process via `ps`, which reports kB.
#[cfg(target_os = "macos")]
fn get_ps_rss_mb() -> Option<u64> {
    let output = Command::new("ps")
        .args(["-o", "rss=", "-p", &std::process::id().to_string()])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let kb = String::from_utf8_lossy(&output.stdout).trim().parse::<u64>().ok()?;
    Some(kb / 1024)
}

/// Used RAM (active + wired pages × page size) from `vm_stat` output.
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn parse_vm_stat(text: &str) -> Option<u64> {
    // First line: "Mach Virtual Memory Statistics: (page size of 16384 bytes)"
    let page_size = text
        .lines()
        .find_map(|line| line.split("page size of ").nth(1))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(16384);

    let pages = |label: &str| {
        text.lines()
            .find_map(|line| line.strip_prefix(label))
            .map(|rest| rest.trim().trim_end_matches('.'))
            .and_then(|value| value.parse::<u64>().ok())
    };
    let active = pages("Pages active:")?;
    let wired = pages("Pages wired down:").unwrap_or(0);
    Some((active + wired) * page_size / 1024 / 1024)
}

// =============================================================================
// Windows resource monitoring
// =============================================================================

#[cfg(target_os = "windows")]
fn get_resource_usage_windows() -> ResourceUsage {
    let output = Command::new("wmic")
        .args(["OS", "get", "FreePhysicalMemory,TotalVisibleMemorySize", "/Value"])
        .output();
    let Ok(output) = output else {
        return ResourceUsage::default();
    };
    if !output.status.success() {
        return ResourceUsage::default();
    }
    parse_wmic(&String::from_utf8_lossy(&output.stdout)).unwrap_or_default()
}

#[cfg_attr(not(target_os = "windows"), allow(dead_code))]
fn parse_wmic(text: &str) -> Option<ResourceUsage> {
    let value = |label: &str| {
        text.lines()
            .find_map(|line| line.trim().strip_prefix(label))
            .and_then(|v| v.trim().parse::<u64>().ok())
    };
    let free_kb = value("FreePhysicalMemory=")?;
    let total_kb = value("TotalVisibleMemorySize=")?;
    if total_kb == 0 {
        return None;
    }
    Some(ResourceUsage {
        ram_used_mb: total_kb.saturating_sub(free_kb) / 1024,
        ram_total_mb: total_kb / 1024,
        process_rss_mb: 0,
    })
}
