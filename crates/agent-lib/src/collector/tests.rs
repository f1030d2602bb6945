//! Integration tests for metrics collection
//!
//! These tests use mock /proc and /sys trees to test parsing and delta
//! accounting without depending on the host.

#[cfg(test)]
mod mock_procfs_tests {
    use crate::collector::{find_processes, MetricsSource, ProcfsMetricsSource};
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;
    use tokio::fs;

    const NET_DEV_HEADER: &str = "Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
";

    fn pid_stat(pid: u32, comm: &str, utime: u64, stime: u64, nice: i32, rss: u64) -> String {
        format!(
            "{pid} ({comm}) S 1 {pid} {pid} 0 -1 4194560 100 0 0 0 {utime} {stime} 0 0 20 {nice} 4 0 1000 123456789 {rss} 18446744073709551615\n"
        )
    }

    async fn write_net_dev(proc_root: &Path, eth_rx: u64, eth_tx: u64) {
        let content = format!(
            "{NET_DEV_HEADER}    lo: 9999 10 0 0 0 0 0 0 9999 10 0 0 0 0 0 0\n  eth0: {eth_rx} 100 0 0 0 0 0 0 {eth_tx} 80 0 0 0 0 0 0\n"
        );
        fs::write(proc_root.join("net/dev"), content).await.unwrap();
    }

    async fn write_process(proc_root: &Path, pid: u32, comm: &str, utime: u64, nice: i32) {
        let dir = proc_root.join(pid.to_string());
        fs::create_dir_all(&dir).await.unwrap();
        fs::write(dir.join("comm"), format!("{comm}\n")).await.unwrap();
        fs::write(dir.join("stat"), pid_stat(pid, comm, utime, 0, nice, 2560))
            .await
            .unwrap();
    }

    /// Helper to create a mock /proc and /sys pair
    async fn create_mock_host(temp_dir: &TempDir) -> (PathBuf, PathBuf) {
        let proc_root = temp_dir.path().join("proc");
        let sys_root = temp_dir.path().join("sys");
        fs::create_dir_all(proc_root.join("net")).await.unwrap();

        fs::write(
            proc_root.join("stat"),
            "cpu  600 0 400 8000 1000 0 0 0 0 0\ncpu0 600 0 400 8000 1000 0 0 0 0 0\n",
        )
        .await
        .unwrap();
        fs::write(
            proc_root.join("meminfo"),
            "MemTotal:       1000000 kB\nMemFree:         100000 kB\nMemAvailable:    400000 kB\n",
        )
        .await
        .unwrap();
        write_net_dev(&proc_root, 1_000, 2_000).await;
        fs::write(
            proc_root.join("diskstats"),
            "   8       0 sda 100 0 200 0 50 0 400 0 0 0 0\n   8       1 sda1 90 0 180 0 40 0 300 0 0 0 0\n",
        )
        .await
        .unwrap();
        write_process(&proc_root, 1, "systemd", 10, 0).await;
        write_process(&proc_root, 4242, "firefox", 100, 0).await;

        let battery = sys_root.join("class/power_supply/BAT0");
        fs::create_dir_all(&battery).await.unwrap();
        fs::write(battery.join("type"), "Battery\n").await.unwrap();
        fs::write(battery.join("capacity"), "42\n").await.unwrap();
        fs::write(battery.join("status"), "Discharging\n").await.unwrap();
        fs::write(battery.join("power_now"), "12500000\n").await.unwrap();

        let adapter = sys_root.join("class/power_supply/AC");
        fs::create_dir_all(&adapter).await.unwrap();
        fs::write(adapter.join("type"), "Mains\n").await.unwrap();

        let backlight = sys_root.join("class/backlight/intel_backlight");
        fs::create_dir_all(&backlight).await.unwrap();
        fs::write(backlight.join("brightness"), "600\n").await.unwrap();
        fs::write(backlight.join("max_brightness"), "1000\n").await.unwrap();

        let cpufreq = sys_root.join("devices/system/cpu/cpu0/cpufreq");
        fs::create_dir_all(&cpufreq).await.unwrap();
        fs::write(cpufreq.join("scaling_cur_freq"), "2400000\n").await.unwrap();

        fs::create_dir_all(sys_root.join("block/sda")).await.unwrap();

        (proc_root, sys_root)
    }

    #[tokio::test]
    async fn test_first_sample_reads_device_state() {
        let temp_dir = TempDir::new().unwrap();
        let (proc_root, sys_root) = create_mock_host(&temp_dir).await;
        let source = ProcfsMetricsSource::with_roots(&proc_root, &sys_root, None);

        let snapshot = source.collect().await.unwrap();

        assert_eq!(snapshot.battery_percent, 42.0);
        assert!((snapshot.battery_power_draw - 12.5).abs() < 1e-9);
        assert_eq!(snapshot.screen_brightness, 60);
        assert_eq!(snapshot.cpu_freq_mhz, 2400.0);
        // busy 1000 of 10000 jiffies since boot
        assert!((snapshot.cpu_percent - 10.0).abs() < 1e-9);
        assert!((snapshot.memory_percent - 60.0).abs() < 1e-9);
        assert_eq!(snapshot.process_count, 2);
        // Counters start at the baseline
        assert_eq!(snapshot.network_bytes_total(), 0);
        assert_eq!(snapshot.disk_read_bytes, 0);
        assert!(snapshot.timestamp_ms > 0);
    }

    #[tokio::test]
    async fn test_second_sample_reports_deltas() {
        let temp_dir = TempDir::new().unwrap();
        let (proc_root, sys_root) = create_mock_host(&temp_dir).await;
        let source =
            ProcfsMetricsSource::with_roots(&proc_root, &sys_root, Some("firefox".to_string()));
        source.collect().await.unwrap();

        // 1000 more jiffies, 500 busy; firefox used 250 of them
        fs::write(
            proc_root.join("stat"),
            "cpu  900 0 600 8400 1100 0 0 0 0 0\n",
        )
        .await
        .unwrap();
        write_process(&proc_root, 4242, "firefox", 350, 0).await;
        write_net_dev(&proc_root, 1_000 + 600_000, 2_000 + 600_000).await;
        fs::write(
            proc_root.join("diskstats"),
            "   8       0 sda 110 0 210 0 60 0 410 0 0 0 0\n   8       1 sda1 95 0 190 0 45 0 310 0 0 0 0\n",
        )
        .await
        .unwrap();

        let snapshot = source.collect().await.unwrap();

        assert!((snapshot.cpu_percent - 50.0).abs() < 1e-9);
        assert!((snapshot.target_app_cpu - 25.0).abs() < 1e-9);
        assert_eq!(snapshot.network_bytes_recv, 600_000);
        assert_eq!(snapshot.network_bytes_sent, 600_000);
        // Partition sda1 is not counted
        assert_eq!(snapshot.disk_read_bytes, 10 * 512);
        assert_eq!(snapshot.disk_write_bytes, 10 * 512);
        // 2560 pages of 4 KiB against 1 000 000 kB total
        assert!((snapshot.target_app_memory - 1.024).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_missing_battery_and_backlight_use_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let (proc_root, sys_root) = create_mock_host(&temp_dir).await;
        fs::remove_dir_all(sys_root.join("class")).await.unwrap();
        let source = ProcfsMetricsSource::with_roots(&proc_root, &sys_root, None);

        let snapshot = source.collect().await.unwrap();

        assert_eq!(snapshot.battery_percent, 100.0);
        assert_eq!(snapshot.battery_power_draw, 0.0);
        assert!(snapshot.likely_plugged_in());
        assert_eq!(snapshot.screen_brightness, 75);
    }

    #[tokio::test]
    async fn test_charging_battery_reports_no_draw() {
        let temp_dir = TempDir::new().unwrap();
        let (proc_root, sys_root) = create_mock_host(&temp_dir).await;
        fs::write(sys_root.join("class/power_supply/BAT0/status"), "Charging\n")
            .await
            .unwrap();
        let source = ProcfsMetricsSource::with_roots(&proc_root, &sys_root, None);

        let snapshot = source.collect().await.unwrap();

        assert_eq!(snapshot.battery_power_draw, 0.0);
    }

    #[tokio::test]
    async fn test_missing_proc_stat_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let source = ProcfsMetricsSource::with_roots(
            temp_dir.path().join("nope"),
            temp_dir.path().join("sys"),
            None,
        );

        assert!(source.collect().await.is_err());
    }

    #[tokio::test]
    async fn test_find_processes_matches_by_name() {
        let temp_dir = TempDir::new().unwrap();
        let (proc_root, _) = create_mock_host(&temp_dir).await;
        write_process(&proc_root, 5000, "Firefox-bin", 1, 5).await;

        let found = find_processes(&proc_root, "firefox");

        assert_eq!(found.len(), 2);
        assert_eq!(found[0].pid, 4242);
        assert_eq!(found[1].name, "Firefox-bin");
        assert_eq!(found[1].nice, 5);
        assert!(find_processes(&proc_root, "chrome").is_empty());
    }
}

#[cfg(test)]
mod parser_tests {
    use crate::collector::{parse_cpu_times, parse_meminfo, parse_net_dev, parse_pid_stat};

    #[test]
    fn test_parse_cpu_times_counts_iowait_as_idle() {
        let times = parse_cpu_times("cpu  10 5 5 70 10 0 0 0 0 0\n").unwrap();
        assert_eq!(times.total, 100);
        assert_eq!(times.busy, 20);
        assert!(parse_cpu_times("intr 1 2 3\n").is_none());
    }

    #[test]
    fn test_parse_meminfo_without_available() {
        let (used, total) = parse_meminfo("MemTotal: 2048 kB\n").unwrap();
        assert_eq!(used, 0.0);
        assert_eq!(total, 2048 * 1024);
        assert!(parse_meminfo("MemFree: 10 kB\n").is_none());
    }

    #[test]
    fn test_parse_net_dev_skips_loopback() {
        let content = "    lo: 500 1 0 0 0 0 0 0 500 1 0 0 0 0 0 0\n wlan0: 10 1 0 0 0 0 0 0 20 1 0 0 0 0 0 0\n";
        assert_eq!(parse_net_dev(content), (20, 10));
    }

    #[test]
    fn test_parse_pid_stat_with_parenthesized_name() {
        let line = "77 (my (odd) app) R 1 77 77 0 -1 0 0 0 0 0 40 2 0 0 20 -5 1 0 10 4096 300 0\n";
        let stat = parse_pid_stat(line).unwrap();
        assert_eq!(stat.utime, 40);
        assert_eq!(stat.stime, 2);
        assert_eq!(stat.nice, -5);
        assert_eq!(stat.rss_pages, 300);
    }
}
