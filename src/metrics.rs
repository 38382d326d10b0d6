use std::time::Duration;
use std::time::Instant;
use std::time::SystemTime;

use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tracing::debug;
use tracing::warn;

use crate::config::MetricsConfig;
use crate::connection::Throughput;

/// Summary of a latency run, all values in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencyStats {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub median: f64,
    pub jitter: f64,
}

impl LatencyStats {
    /// Jitter is the sample standard deviation; a single sample has none.
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }

        let mut sorted = samples.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let n = sorted.len();
        let avg = sorted.iter().sum::<f64>() / n as f64;
        let median = if n % 2 == 0 {
            (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
        } else {
            sorted[n / 2]
        };
        let jitter = if n > 1 {
            let var = sorted.iter().map(|x| (x - avg).powi(2)).sum::<f64>() / (n - 1) as f64;
            var.sqrt()
        } else {
            0.0
        };

        Some(Self {
            min: sorted[0],
            max: sorted[n - 1],
            avg,
            median,
            jitter,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSample {
    pub timestamp: SystemTime,
    pub latency: Option<LatencyStats>,
    pub throughput: Option<Throughput>,
}

#[derive(Debug, Clone)]
pub struct NetworkMetrics {
    target_host: Option<String>,
    pub ping_count: usize,
    pub latency_port: u16,
    pub probe_timeout: Duration,
    pub probe_interval: Duration,
    pub throughput_duration: Duration,
    pub download_url: String,
    pub upload_url: String,
    pub upload_chunk_bytes: usize,
}

impl Default for NetworkMetrics {
    fn default() -> Self {
        Self::from_config(&MetricsConfig::default())
    }
}

fn mbps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    (bytes as f64 * 8.0) / (secs * 1_000_000.0)
}

impl NetworkMetrics {
    pub fn from_config(config: &MetricsConfig) -> Self {
        Self {
            target_host: None,
            ping_count: config.ping_count,
            latency_port: config.latency_port,
            probe_timeout: Duration::from_millis(config.probe_timeout_ms),
            probe_interval: Duration::from_millis(config.probe_interval_ms),
            throughput_duration: Duration::from_secs(config.throughput_duration_secs),
            download_url: config.download_url.clone(),
            upload_url: config.upload_url.clone(),
            upload_chunk_bytes: config.upload_chunk_bytes,
        }
    }

    pub fn target_host(&self) -> Option<&str> {
        self.target_host.as_deref()
    }

    pub fn set_target_host(&mut self, host: impl Into<String>) {
        self.target_host = Some(host.into());
    }

    /// Times `count` TCP connects to the target. Failed probes are skipped.
    pub async fn measure_latency(&self, count: Option<usize>) -> Option<LatencyStats> {
        let host = self.target_host.as_deref()?;
        let count = count.unwrap_or(self.ping_count);
        let mut samples = Vec::with_capacity(count);

        for i in 0..count {
            let start = Instant::now();
            let probe = TcpStream::connect((host, self.latency_port));
            match tokio::time::timeout(self.probe_timeout, probe).await {
                Ok(Ok(stream)) => {
                    samples.push(start.elapsed().as_secs_f64() * 1000.0);
                    drop(stream);
                }
                Ok(Err(e)) => debug!("latency probe {} to {} failed: {}", i + 1, host, e),
                Err(_) => debug!("latency probe {} to {} timed out", i + 1, host),
            }

            if i + 1 < count {
                tokio::time::sleep(self.probe_interval).await;
            }
        }

        LatencyStats::from_samples(&samples)
    }

    /// Download then upload for `duration` each. Any transport failure yields None.
    pub async fn measure_throughput(&self, duration: Option<Duration>) -> Option<Throughput> {
        let duration = duration.unwrap_or(self.throughput_duration);
        match self.run_throughput(duration).await {
            Ok(result) => Some(result),
            Err(e) => {
                warn!("Throughput test failed: {}", e);
                None
            }
        }
    }

    async fn run_throughput(&self, duration: Duration) -> anyhow::Result<Throughput> {
        let client = reqwest::Client::builder()
            .timeout(duration + Duration::from_secs(5))
            .build()?;

        let start = Instant::now();
        let mut response = client
            .get(&self.download_url)
            .send()
            .await?
            .error_for_status()?;
        let mut downloaded = 0u64;
        while start.elapsed() < duration {
            match response.chunk().await? {
                Some(chunk) => downloaded += chunk.len() as u64,
                None => break,
            }
        }
        let download_mbps = mbps(downloaded, start.elapsed());

        let chunk = vec![b'0'; self.upload_chunk_bytes];
        let start = Instant::now();
        let mut uploaded = 0u64;
        while start.elapsed() < duration {
            let response = client
                .post(&self.upload_url)
                .timeout(Duration::from_secs(5))
                .body(chunk.clone())
                .send()
                .await?;
            if response.status() == reqwest::StatusCode::OK {
                uploaded += chunk.len() as u64;
            }
        }
        let upload_mbps = mbps(uploaded, start.elapsed());

        Ok(Throughput {
            download_mbps,
            upload_mbps,
        })
    }

    /// Samples latency every `interval` and throughput every fifth tick until shutdown.
    pub async fn monitor(
        &self,
        interval: Duration,
        sink: mpsc::Sender<MetricsSample>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        let mut tick: u64 = 0;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let latency = self.measure_latency(Some(3)).await;
                    let throughput = if tick % 5 == 0 {
                        self.measure_throughput(Some(Duration::from_secs(2))).await
                    } else {
                        None
                    };
                    tick += 1;

                    if latency.is_none() && throughput.is_none() {
                        continue;
                    }

                    let sample = MetricsSample {
                        timestamp: SystemTime::now(),
                        latency,
                        throughput,
                    };
                    if sink.send(sample).await.is_err() {
                        break;
                    }
                }
                _ = shutdown.changed() => {
                    break;
                }
            }
        }
    }
}
