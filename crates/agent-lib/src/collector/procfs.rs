//! procfs/sysfs metrics collection
//!
//! Reads device metrics from the Linux pseudo filesystems:
//! - /proc/stat, /proc/meminfo, /proc/net/dev, /proc/diskstats
//! - /proc/<pid>/{comm,stat} for the process count and target application
//! - /sys/class/power_supply for battery capacity and power draw
//! - /sys/class/backlight for screen brightness
//! - /sys/class/drm for GPU utilization where the driver exposes it
//!
//! Missing files degrade the affected fields to defaults instead of
//! failing the whole sample. Network and disk counters are reported as
//! deltas from the first sample taken by this source.

use super::{now_ms, MetricsSource};
use crate::models::MetricsSnapshot;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tokio::fs;

/// Brightness reported when no backlight device exists
const DEFAULT_BRIGHTNESS: u32 = 75;

/// Disk sectors are always 512 bytes in /proc/diskstats
const SECTOR_BYTES: u64 = 512;

/// Page size assumed for rss accounting
const PAGE_BYTES: u64 = 4096;

/// Aggregate CPU jiffies from the first line of /proc/stat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTimes {
    pub busy: u64,
    pub total: u64,
}

/// Fields of /proc/<pid>/stat used by the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PidStat {
    pub utime: u64,
    pub stime: u64,
    pub nice: i32,
    pub rss_pages: u64,
}

/// A running process matched by name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub name: String,
    pub nice: i32,
}

#[derive(Debug, Default)]
struct SamplerState {
    last_cpu: Option<CpuTimes>,
    net_baseline: Option<(u64, u64)>,
    disk_baseline: Option<(u64, u64)>,
    last_app_ticks: Option<u64>,
}

/// Metrics source backed by /proc and /sys
pub struct ProcfsMetricsSource {
    proc_root: PathBuf,
    sys_root: PathBuf,
    target_app: Option<String>,
    state: Mutex<SamplerState>,
}

impl ProcfsMetricsSource {
    pub fn new(target_app: Option<String>) -> Self {
        Self::with_roots("/proc", "/sys", target_app)
    }

    /// Create a source with custom roots (for testing)
    pub fn with_roots(
        proc_root: impl Into<PathBuf>,
        sys_root: impl Into<PathBuf>,
        target_app: Option<String>,
    ) -> Self {
        Self {
            proc_root: proc_root.into(),
            sys_root: sys_root.into(),
            target_app,
            state: Mutex::new(SamplerState::default()),
        }
    }

    async fn read_battery(&self) -> (f64, f64) {
        let supply_dir = self.sys_root.join("class/power_supply");
        let Some(battery) = find_device(&supply_dir, |dir| async move {
            read_trimmed(&dir.join("type")).await.as_deref() == Some("Battery")
        })
        .await
        else {
            // Desktop without a battery: treat as full and on mains power
            return (100.0, 0.0);
        };

        let capacity = read_number::<f64>(&battery.join("capacity"))
            .await
            .unwrap_or(100.0)
            .clamp(0.0, 100.0);

        let status = read_trimmed(&battery.join("status")).await.unwrap_or_default();
        let draw = if matches!(status.as_str(), "Charging" | "Full" | "Not charging") {
            0.0
        } else if let Some(micro_watts) = read_number::<f64>(&battery.join("power_now")).await {
            micro_watts / 1_000_000.0
        } else {
            let current = read_number::<f64>(&battery.join("current_now")).await;
            let voltage = read_number::<f64>(&battery.join("voltage_now")).await;
            match (current, voltage) {
                (Some(c), Some(v)) => c * v / 1e12,
                _ => 10.0,
            }
        };

        (capacity, draw)
    }

    async fn read_brightness(&self) -> u32 {
        let backlight_dir = self.sys_root.join("class/backlight");
        let Some(device) = find_device(&backlight_dir, |dir| async move {
            fs::metadata(dir.join("max_brightness")).await.is_ok()
        })
        .await
        else {
            return DEFAULT_BRIGHTNESS;
        };

        let current = read_number::<f64>(&device.join("brightness")).await;
        let maximum = read_number::<f64>(&device.join("max_brightness")).await;
        match (current, maximum) {
            (Some(c), Some(m)) if m > 0.0 => ((c / m) * 100.0).round().clamp(0.0, 100.0) as u32,
            _ => DEFAULT_BRIGHTNESS,
        }
    }

    async fn read_gpu(&self) -> (f64, f64) {
        let device = self.sys_root.join("class/drm/card0/device");
        let busy = read_number::<f64>(&device.join("gpu_busy_percent"))
            .await
            .unwrap_or(0.0);
        let used = read_number::<f64>(&device.join("mem_info_vram_used")).await;
        let total = read_number::<f64>(&device.join("mem_info_vram_total")).await;
        let memory = match (used, total) {
            (Some(u), Some(t)) if t > 0.0 => u / t * 100.0,
            _ => 0.0,
        };
        (busy, memory)
    }

    async fn read_disk_totals(&self) -> (u64, u64) {
        let Some(content) = read_trimmed(&self.proc_root.join("diskstats")).await else {
            return (0, 0);
        };

        let mut read = 0u64;
        let mut written = 0u64;
        for (name, sectors_read, sectors_written) in parse_diskstats(&content) {
            // Only whole block devices; partitions would double count
            if fs::metadata(self.sys_root.join("block").join(&name)).await.is_ok() {
                read = read.saturating_add(sectors_read * SECTOR_BYTES);
                written = written.saturating_add(sectors_written * SECTOR_BYTES);
            }
        }
        (read, written)
    }

    /// Returns (process count, target app ticks, target app rss bytes)
    async fn scan_processes(&self) -> (u32, u64, u64) {
        let mut count = 0u32;
        let mut app_ticks = 0u64;
        let mut app_rss = 0u64;

        let Ok(mut entries) = fs::read_dir(&self.proc_root).await else {
            return (0, 0, 0);
        };
        let needle = self.target_app.as_ref().map(|n| n.to_lowercase());

        while let Ok(Some(entry)) = entries.next_entry().await {
            let file_name = entry.file_name();
            let Some(pid) = file_name.to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            count += 1;

            let Some(needle) = needle.as_deref() else {
                continue;
            };
            let pid_dir = self.proc_root.join(pid.to_string());
            let Some(name) = read_trimmed(&pid_dir.join("comm")).await else {
                continue;
            };
            if !name.to_lowercase().contains(needle) {
                continue;
            }
            if let Some(stat) = read_trimmed(&pid_dir.join("stat"))
                .await
                .and_then(|s| parse_pid_stat(&s))
            {
                app_ticks = app_ticks.saturating_add(stat.utime + stat.stime);
                app_rss = app_rss.saturating_add(stat.rss_pages * PAGE_BYTES);
            }
        }

        (count, app_ticks, app_rss)
    }
}

#[async_trait]
impl MetricsSource for ProcfsMetricsSource {
    async fn collect(&self) -> Result<MetricsSnapshot> {
        let stat = fs::read_to_string(self.proc_root.join("stat"))
            .await
            .with_context(|| format!("Failed to read {}/stat", self.proc_root.display()))?;
        let cpu = parse_cpu_times(&stat).context("Malformed cpu line in /proc/stat")?;

        let meminfo = read_trimmed(&self.proc_root.join("meminfo"))
            .await
            .unwrap_or_default();
        let (memory_percent, mem_total_bytes) = parse_meminfo(&meminfo).unwrap_or((0.0, 0));

        let (net_sent, net_recv) = read_trimmed(&self.proc_root.join("net/dev"))
            .await
            .map(|s| parse_net_dev(&s))
            .unwrap_or((0, 0));
        let (disk_read, disk_write) = self.read_disk_totals().await;

        let (battery_percent, battery_power_draw) = self.read_battery().await;
        let (gpu_percent, gpu_memory_percent) = self.read_gpu().await;
        let screen_brightness = self.read_brightness().await;
        let cpu_freq_mhz = read_number::<f64>(
            &self
                .sys_root
                .join("devices/system/cpu/cpu0/cpufreq/scaling_cur_freq"),
        )
        .await
        .map(|khz| khz / 1000.0)
        .unwrap_or(0.0);
        let (process_count, app_ticks, app_rss) = self.scan_processes().await;

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let (busy_delta, total_delta) = match state.last_cpu {
            Some(prev) if cpu.total > prev.total => (
                cpu.busy.saturating_sub(prev.busy),
                cpu.total - prev.total,
            ),
            _ => (cpu.busy, cpu.total),
        };
        let cpu_percent = ratio_percent(busy_delta, total_delta);

        let target_app_cpu = match state.last_app_ticks {
            Some(prev) if state.last_cpu.is_some() => {
                ratio_percent(app_ticks.saturating_sub(prev), total_delta)
            }
            _ => 0.0,
        };
        let target_app_memory = if mem_total_bytes > 0 {
            app_rss as f64 / mem_total_bytes as f64 * 100.0
        } else {
            0.0
        };

        let net_base = *state.net_baseline.get_or_insert((net_sent, net_recv));
        let disk_base = *state.disk_baseline.get_or_insert((disk_read, disk_write));
        state.last_cpu = Some(cpu);
        state.last_app_ticks = Some(app_ticks);

        Ok(MetricsSnapshot {
            timestamp_ms: now_ms(),
            battery_percent,
            battery_power_draw,
            cpu_percent,
            cpu_freq_mhz,
            memory_percent,
            gpu_percent,
            gpu_memory_percent,
            network_bytes_sent: net_sent.saturating_sub(net_base.0),
            network_bytes_recv: net_recv.saturating_sub(net_base.1),
            disk_read_bytes: disk_read.saturating_sub(disk_base.0),
            disk_write_bytes: disk_write.saturating_sub(disk_base.1),
            screen_brightness,
            process_count,
            target_app_cpu,
            target_app_memory,
        })
    }
}

fn ratio_percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        (part as f64 / whole as f64 * 100.0).clamp(0.0, 100.0)
    }
}

/// Parse the aggregate `cpu` line of /proc/stat
pub fn parse_cpu_times(content: &str) -> Option<CpuTimes> {
    let line = content.lines().find(|l| l.starts_with("cpu "))?;
    let values: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|v| v.parse().ok())
        .collect();
    if values.len() < 4 {
        return None;
    }

    // user nice system idle iowait irq softirq steal
    let total: u64 = values.iter().take(8).sum();
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        busy: total.saturating_sub(idle),
        total,
    })
}

/// Parse /proc/meminfo into (used percent, total bytes)
pub fn parse_meminfo(content: &str) -> Option<(f64, u64)> {
    let mut total_kb = None;
    let mut available_kb = None;

    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() >= 2 {
            match parts[0] {
                "MemTotal:" => total_kb = parts[1].parse::<u64>().ok(),
                "MemAvailable:" => available_kb = parts[1].parse::<u64>().ok(),
                _ => {}
            }
        }
    }

    let total = total_kb.filter(|t| *t > 0)?;
    let available = available_kb.unwrap_or(total).min(total);
    let used_percent = (total - available) as f64 / total as f64 * 100.0;
    Some((used_percent, total * 1024))
}

/// Sum transmitted and received bytes over all non-loopback interfaces.
/// Returns (sent, received).
pub fn parse_net_dev(content: &str) -> (u64, u64) {
    let mut sent = 0u64;
    let mut recv = 0u64;

    for line in content.lines() {
        let Some((iface, counters)) = line.split_once(':') else {
            continue;
        };
        if iface.trim() == "lo" {
            continue;
        }
        let fields: Vec<u64> = counters
            .split_whitespace()
            .filter_map(|v| v.parse().ok())
            .collect();
        if fields.len() >= 9 {
            recv = recv.saturating_add(fields[0]);
            sent = sent.saturating_add(fields[8]);
        }
    }

    (sent, recv)
}

/// Parse /proc/diskstats into (device, sectors read, sectors written)
fn parse_diskstats(content: &str) -> Vec<(String, u64, u64)> {
    content
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 10 {
                return None;
            }
            let read = parts[5].parse().ok()?;
            let written = parts[9].parse().ok()?;
            Some((parts[2].to_string(), read, written))
        })
        .collect()
}

/// Parse /proc/<pid>/stat. The command name may contain spaces or
/// parentheses, so fields are counted from the last `)`.
pub fn parse_pid_stat(content: &str) -> Option<PidStat> {
    let rest = &content[content.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // fields[0] is the state (field 3 of the full line)
    Some(PidStat {
        utime: fields.get(11)?.parse().ok()?,
        stime: fields.get(12)?.parse().ok()?,
        nice: fields.get(16)?.parse().ok()?,
        rss_pages: fields.get(21)?.parse().ok()?,
    })
}

/// Find running processes whose name contains `name` (case-insensitive)
pub fn find_processes(proc_root: &Path, name: &str) -> Vec<ProcessEntry> {
    let needle = name.to_lowercase();
    let Ok(entries) = std::fs::read_dir(proc_root) else {
        return Vec::new();
    };

    let mut found: Vec<ProcessEntry> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let pid = entry.file_name().to_str()?.parse::<u32>().ok()?;
            let comm = std::fs::read_to_string(entry.path().join("comm")).ok()?;
            let comm = comm.trim().to_string();
            if !comm.to_lowercase().contains(&needle) {
                return None;
            }
            let stat = std::fs::read_to_string(entry.path().join("stat")).ok()?;
            let stat = parse_pid_stat(&stat)?;
            Some(ProcessEntry {
                pid,
                name: comm,
                nice: stat.nice,
            })
        })
        .collect();

    found.sort_by_key(|p| p.pid);
    found
}

async fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .await
        .ok()
        .map(|s| s.trim().to_string())
}

async fn read_number<T: std::str::FromStr>(path: &Path) -> Option<T> {
    read_trimmed(path).await.and_then(|s| s.parse().ok())
}

/// First entry of `dir` (in name order) accepted by `accept`
async fn find_device<F, Fut>(dir: &Path, accept: F) -> Option<PathBuf>
where
    F: Fn(PathBuf) -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let mut entries = fs::read_dir(dir).await.ok()?;
    let mut candidates = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        candidates.push(entry.path());
    }
    candidates.sort();

    for candidate in candidates {
        if accept(candidate.clone()).await {
            return Some(candidate);
        }
    }
    None
}
