//! Docker-compatible container backend.
//!
//! Each launch is a fresh `docker run` with a read-only root, no
//! capabilities, `no-new-privileges`, a non-root user, CPU/memory/PID caps
//! and swap disabled. The tool volume is the only writable bind mount.
//! Parameters reach the tool through the `TOOL_PARAMS` environment variable
//! and a JSON document on stdin; nothing is interpolated into a shell.
//! While the container runs, `docker stats` is sampled for peak memory and
//! an estimate of CPU time.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use serde::Deserialize;
use tracing::{debug, warn};

use super::runtime::{truncate_output, LaunchOutcome, LaunchSpec, RuntimeError, SandboxRuntime};
use crate::config::RuntimeConfig;
use crate::permissions::NetworkMode;

/// Exit status of `docker run` when the container could not be started.
/// A tool that exits 125 itself produces the same status.
const DOCKER_RUN_FAILURE: i32 = 125;
/// `State.StartedAt` of a container that never started.
const NEVER_STARTED: &str = "0001-01-01T00:00:00Z";

/// Runs each execution in a throwaway container.
pub struct DockerRuntime {
    config: RuntimeConfig,
}

impl DockerRuntime {
    pub fn new(config: RuntimeConfig) -> Self {
        Self { config }
    }

    /// Whether the CLI can reach a daemon.
    pub async fn is_available(&self) -> bool {
        Command::new(&self.config.docker_bin)
            .args(["version", "--format", "{{.Server.Version}}"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// `docker run` arguments for a launch. Environment values are not part
    /// of argv; only the variable names are, and the values are inherited
    /// from the CLI process environment.
    pub fn build_args(&self, spec: &LaunchSpec) -> Vec<String> {
        let network = match spec.network {
            NetworkMode::None => "none".to_string(),
            NetworkMode::IsolatedBridge => self.config.bridge_network.clone(),
        };
        let cpus = f64::from(spec.cpu_percent) / 100.0;

        let mut args = vec![
            "run".to_string(),
            "-i".to_string(),
            "--name".to_string(),
            spec.instance_id.clone(),
            format!("--network={network}"),
            "--read-only".to_string(),
            "--cap-drop=ALL".to_string(),
            "--security-opt=no-new-privileges".to_string(),
            format!("--user={}", self.config.user),
            format!("--memory={}m", spec.memory_mb),
            format!("--memory-swap={}m", spec.memory_mb),
            format!("--cpus={cpus:.2}"),
            format!("--pids-limit={}", spec.pids_limit),
            "--tmpfs".to_string(),
            format!(
                "/tmp:rw,noexec,nosuid,size={}m",
                self.config.tmpfs_size_mb
            ),
        ];
        if let Some((host, mount)) = &spec.volume {
            args.push("-v".to_string());
            args.push(format!("{}:{mount}:rw", host.display()));
        }
        for (key, _) in &spec.env {
            args.push("-e".to_string());
            args.push(key.clone());
        }
        match spec.entrypoint.split_first() {
            Some((program, rest)) => {
                args.push("--entrypoint".to_string());
                args.push(program.clone());
                args.push(spec.image.clone());
                args.extend(rest.iter().cloned());
            }
            None => args.push(spec.image.clone()),
        }
        args
    }

    async fn kill(&self, name: &str) {
        let result = Command::new(&self.config.docker_bin)
            .args(["kill", name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(e) = result {
            warn!(container = %name, error = %e, "docker kill failed");
        }
    }

    /// One `docker inspect --format` field, or `None` when inspect fails.
    async fn inspect(&self, name: &str, format: &str) -> Option<String> {
        let out = Command::new(&self.config.docker_bin)
            .args(["inspect", "--format", format, name])
            .stdin(Stdio::null())
            .output()
            .await
            .ok()?;
        out.status
            .success()
            .then(|| String::from_utf8_lossy(&out.stdout).trim().to_string())
    }

    async fn oom_killed(&self, name: &str) -> bool {
        self.inspect(name, "{{.State.OOMKilled}}").await.as_deref() == Some("true")
    }

    /// Whether the container got as far as running the tool.
    async fn started(&self, name: &str) -> bool {
        match self.inspect(name, "{{.State.StartedAt}}").await {
            Some(at) => !at.is_empty() && at != NEVER_STARTED,
            None => false,
        }
    }
}

/// One `docker stats --format '{{json .}}'` line.
#[derive(Debug, Deserialize)]
struct StatsLine {
    #[serde(rename = "CPUPerc")]
    cpu_perc: String,
    #[serde(rename = "MemUsage")]
    mem_usage: String,
}

/// CPU and memory of a container at one point in time.
#[derive(Debug, Clone, Copy, PartialEq)]
struct StatsSample {
    cpu_percent: f64,
    memory_mb: u64,
}

/// Parse a `docker stats` JSON line. `MemUsage` looks like
/// `"12.5MiB / 64MiB"` and `CPUPerc` like `"37.21%"`.
fn parse_stats_line(line: &str) -> Option<StatsSample> {
    let raw: StatsLine = serde_json::from_str(line.trim()).ok()?;
    let cpu_percent = raw.cpu_perc.trim().trim_end_matches('%').parse::<f64>().ok()?;
    let used = raw.mem_usage.split('/').next()?;
    let bytes = parse_size(used)?;
    Some(StatsSample {
        cpu_percent,
        memory_mb: (bytes / (1024.0 * 1024.0)).ceil() as u64,
    })
}

/// `"12.5MiB"`, `"800kB"`, `"1.2GiB"`, `"0B"` to bytes.
fn parse_size(text: &str) -> Option<f64> {
    let text = text.trim();
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let number: f64 = number.parse().ok()?;
    let factor = match unit.trim() {
        "" | "B" => 1.0,
        "kB" | "KB" => 1e3,
        "KiB" => 1024.0,
        "MB" => 1e6,
        "MiB" => 1024.0 * 1024.0,
        "GB" => 1e9,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some(number * factor)
}

/// Running totals over the samples taken during one launch.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
struct UsageTotals {
    samples: u32,
    cpu_ms: f64,
    memory_peak_mb: u64,
}

impl UsageTotals {
    /// Fold in a sample covering `window` of wall-clock time.
    fn observe(&mut self, sample: StatsSample, window: Duration) {
        self.samples += 1;
        self.cpu_ms += sample.cpu_percent / 100.0 * window.as_secs_f64() * 1000.0;
        self.memory_peak_mb = self.memory_peak_mb.max(sample.memory_mb);
    }

    fn cpu_usage_ms(&self) -> Option<u64> {
        (self.samples > 0).then(|| self.cpu_ms.round() as u64)
    }

    fn memory_peak_mb(&self) -> Option<u64> {
        (self.samples > 0).then_some(self.memory_peak_mb)
    }
}

async fn stats_once(docker_bin: &str, name: &str) -> Option<StatsSample> {
    let out = Command::new(docker_bin)
        .args(["stats", "--no-stream", "--format", "{{json .}}", name])
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .ok()?;
    if !out.status.success() {
        return None;
    }
    String::from_utf8_lossy(&out.stdout)
        .lines()
        .find_map(parse_stats_line)
}

/// Sample `name` every `interval` until `stop` fires.
async fn sample_usage(
    docker_bin: String,
    name: String,
    interval: Duration,
    stop: CancellationToken,
) -> UsageTotals {
    let mut totals = UsageTotals::default();
    let mut tick = tokio::time::interval(interval);
    let mut last = Instant::now();
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tick.tick() => {}
        }
        let sample = tokio::select! {
            _ = stop.cancelled() => break,
            sample = stats_once(&docker_bin, &name) => sample,
        };
        let now = Instant::now();
        if let Some(sample) = sample {
            totals.observe(sample, now - last);
        }
        last = now;
    }
    totals
}

/// Read a pipe to EOF, keeping at most `max` bytes (plus one to detect
/// overflow). The rest is drained so the child never blocks on a full pipe.
async fn read_capped<R: AsyncRead + Unpin>(reader: Option<R>, max: usize) -> (String, bool) {
    let Some(mut reader) = reader else {
        return (String::new(), false);
    };
    let mut kept = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = (max + 1).saturating_sub(kept.len());
                kept.extend_from_slice(&buf[..n.min(room)]);
            }
        }
    }
    truncate_output(String::from_utf8_lossy(&kept).into_owned(), max)
}

#[async_trait]
impl SandboxRuntime for DockerRuntime {
    fn backend_name(&self) -> &'static str {
        "docker"
    }

    async fn launch(
        &self,
        spec: &LaunchSpec,
        cancel: &CancellationToken,
    ) -> Result<LaunchOutcome, RuntimeError> {
        let args = self.build_args(spec);
        debug!(container = %spec.instance_id, image = %spec.image, "launching container");

        let mut child = Command::new(&self.config.docker_bin)
            .args(&args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                RuntimeError::Unavailable(format!("{}: {e}", self.config.docker_bin))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            let payload = spec.stdin.clone();
            tokio::spawn(async move {
                // A tool that never reads stdin closes the pipe early.
                let _ = stdin.write_all(&payload).await;
                let _ = stdin.shutdown().await;
            });
        }
        let stdout = tokio::spawn(read_capped(child.stdout.take(), spec.max_output_bytes));
        let stderr = tokio::spawn(read_capped(child.stderr.take(), spec.max_output_bytes));

        let stop_sampling = CancellationToken::new();
        let sampler = tokio::spawn(sample_usage(
            self.config.docker_bin.clone(),
            spec.instance_id.clone(),
            self.config.stats_interval(),
            stop_sampling.clone(),
        ));
        let _stop_on_return = stop_sampling.clone().drop_guard();

        let status = tokio::select! {
            status = child.wait() => {
                status.map_err(|e| RuntimeError::Unavailable(format!("wait failed: {e}")))?
            }
            _ = tokio::time::sleep(spec.timeout) => {
                self.kill(&spec.instance_id).await;
                let _ = child.kill().await;
                return Err(RuntimeError::Timeout {
                    limit_ms: spec.timeout.as_millis() as u64,
                });
            }
            _ = cancel.cancelled() => {
                self.kill(&spec.instance_id).await;
                let _ = child.kill().await;
                return Err(RuntimeError::Cancelled);
            }
        };

        stop_sampling.cancel();
        let usage = sampler.await.unwrap_or_default();
        let (stdout, out_cut) = stdout.await.unwrap_or_default();
        let (stderr, _) = stderr.await.unwrap_or_default();
        let exit_code = status.code().unwrap_or(-1);

        if exit_code == DOCKER_RUN_FAILURE && !self.started(&spec.instance_id).await {
            return Err(RuntimeError::Unavailable(format!(
                "docker could not start the container: {}",
                stderr.trim()
            )));
        }

        let oom_killed = self.oom_killed(&spec.instance_id).await;
        Ok(LaunchOutcome {
            exit_code,
            stdout,
            stderr,
            oom_killed,
            cpu_usage_ms: usage.cpu_usage_ms(),
            memory_peak_mb: usage.memory_peak_mb(),
            truncated: out_cut,
        })
    }

    async fn teardown(&self, instance_id: &str) -> Result<(), RuntimeError> {
        let _ = Command::new(&self.config.docker_bin)
            .args(["rm", "-f", instance_id])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    fn spec() -> LaunchSpec {
        LaunchSpec {
            instance_id: "toolvault-exec-1".into(),
            image: "ghcr.io/acme/weather:1".into(),
            entrypoint: vec!["python".into(), "/app/main.py".into()],
            env: vec![("TOOL_PARAMS".into(), r#"{"city":"Oslo; rm -rf /"}"#.into())],
            stdin: b"{}".to_vec(),
            network: NetworkMode::None,
            cpu_percent: 50,
            memory_mb: 128,
            pids_limit: 64,
            volume: Some((PathBuf::from("/srv/vols/toolvault-abc"), "/data".into())),
            timeout: Duration::from_secs(5),
            max_output_bytes: 1024,
        }
    }

    #[test]
    fn test_build_args_applies_isolation_flags() {
        let args = DockerRuntime::new(RuntimeConfig::default()).build_args(&spec());
        for flag in [
            "--network=none",
            "--read-only",
            "--cap-drop=ALL",
            "--security-opt=no-new-privileges",
            "--user=65534:65534",
            "--memory=128m",
            "--memory-swap=128m",
            "--cpus=0.50",
            "--pids-limit=64",
        ] {
            assert!(args.iter().any(|a| a == flag), "missing {flag} in {args:?}");
        }
        assert!(args.iter().any(|a| a == "/srv/vols/toolvault-abc:/data:rw"));
        assert!(args.iter().any(|a| a.starts_with("/tmp:rw,noexec,nosuid")));
    }

    #[test]
    fn test_params_never_appear_in_argv() {
        let args = DockerRuntime::new(RuntimeConfig::default()).build_args(&spec());
        assert!(args.iter().any(|a| a == "TOOL_PARAMS"));
        assert!(!args.iter().any(|a| a.contains("Oslo")));
    }

    #[test]
    fn test_entrypoint_and_image_order() {
        let args = DockerRuntime::new(RuntimeConfig::default()).build_args(&spec());
        let n = args.len();
        assert_eq!(&args[n - 4..], ["--entrypoint", "python", "ghcr.io/acme/weather:1", "/app/main.py"]);

        let mut bare = spec();
        bare.entrypoint.clear();
        let args = DockerRuntime::new(RuntimeConfig::default()).build_args(&bare);
        assert_eq!(args.last().map(String::as_str), Some("ghcr.io/acme/weather:1"));
        assert!(!args.iter().any(|a| a == "--entrypoint"));
    }

    #[test]
    fn test_isolated_bridge_uses_configured_network() {
        let mut s = spec();
        s.network = NetworkMode::IsolatedBridge;
        let args = DockerRuntime::new(RuntimeConfig::default()).build_args(&s);
        assert!(args.iter().any(|a| a == "--network=toolvault-isolated"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let runtime = DockerRuntime::new(RuntimeConfig {
            docker_bin: "/nonexistent/toolvault-docker".into(),
            ..RuntimeConfig::default()
        });
        let err = runtime
            .launch(&spec(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Unavailable(_)));
        assert!(!runtime.is_available().await);
    }

    #[test]
    fn test_parse_stats_line() {
        let sample = parse_stats_line(
            r#"{"BlockIO":"0B / 0B","CPUPerc":"37.50%","MemPerc":"19.53%","MemUsage":"12.5MiB / 64MiB","Name":"toolvault-exec-1"}"#,
        )
        .unwrap();
        assert_eq!(sample.cpu_percent, 37.5);
        assert_eq!(sample.memory_mb, 13);

        let idle = parse_stats_line(r#"{"CPUPerc":"0.00%","MemUsage":"0B / 0B"}"#).unwrap();
        assert_eq!(idle.memory_mb, 0);

        assert!(parse_stats_line("not json").is_none());
        assert!(parse_stats_line(r#"{"CPUPerc":"--","MemUsage":"-- / --"}"#).is_none());
    }

    #[test]
    fn test_parse_size_units() {
        assert_eq!(parse_size("0B"), Some(0.0));
        assert_eq!(parse_size("2KiB"), Some(2048.0));
        assert_eq!(parse_size("1.5GiB"), Some(1.5 * 1024.0 * 1024.0 * 1024.0));
        assert_eq!(parse_size("800kB"), Some(800_000.0));
        assert_eq!(parse_size("3parsecs"), None);
    }

    #[test]
    fn test_usage_totals_keep_peak_and_integrate_cpu() {
        let mut totals = UsageTotals::default();
        assert_eq!(totals.cpu_usage_ms(), None);
        assert_eq!(totals.memory_peak_mb(), None);

        let window = Duration::from_secs(1);
        totals.observe(StatsSample { cpu_percent: 50.0, memory_mb: 40 }, window);
        totals.observe(StatsSample { cpu_percent: 100.0, memory_mb: 25 }, window);
        assert_eq!(totals.memory_peak_mb(), Some(40));
        assert_eq!(totals.cpu_usage_ms(), Some(1500));
    }

    #[tokio::test]
    async fn test_read_capped_truncates() {
        let data: &[u8] = b"0123456789";
        let (text, cut) = read_capped(Some(data), 4).await;
        assert!(cut);
        assert!(text.starts_with("0123"));
        let (text, cut) = read_capped(Some(data), 64).await;
        assert!(!cut);
        assert_eq!(text, "0123456789");
    }
}
