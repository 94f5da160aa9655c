//! Prometheus process metrics.

pub const METRIC_OPEN_FDS: &str = "process_open_fds";
pub const METRIC_MAX_FDS: &str = "process_max_fds";
pub const METRIC_VIRTUAL_MEMORY_BYTES: &str = "process_virtual_memory_bytes";
pub const METRIC_RESIDENT_MEMORY_BYTES: &str = "process_resident_memory_bytes";
pub const METRIC_THREADS: &str = "process_threads";

const SAMPLE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

/// Register the Prometheus recommended process metrics.
///
/// This function should be called only once, early in the lifetime of the process.
pub fn register_proc_metrics() {
    metrics::register_gauge!(METRIC_OPEN_FDS, metrics::Unit::Count, "Number of open file descriptors.");
    metrics::register_gauge!(METRIC_MAX_FDS, metrics::Unit::Count, "Maximum number of open file descriptors.");
    metrics::register_gauge!(METRIC_VIRTUAL_MEMORY_BYTES, metrics::Unit::Bytes, "Virtual memory size in bytes.");
    metrics::register_gauge!(METRIC_RESIDENT_MEMORY_BYTES, metrics::Unit::Bytes, "Resident memory size in bytes.");
    metrics::register_gauge!(METRIC_THREADS, metrics::Unit::Count, "Number of OS threads in the process.");
}

/// Spawn a process metrics sampler which will shutdown when the given `shutdown` future resolves.
///
/// Sampling is only functional with the `proc-metrics` feature enabled; without it the
/// returned task resolves immediately.
pub fn spawn_proc_metrics_sampler(shutdown: impl std::future::Future<Output = ()> + Send + 'static) -> tokio::task::JoinHandle<()> {
    if !cfg!(feature = "proc-metrics") {
        return tokio::spawn(async move {});
    }
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SAMPLE_INTERVAL);
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = collect_proc_metrics() {
                        tracing::error!(error = ?err, "error collecting process metrics sample");
                    }
                }
                _ = &mut shutdown => break,
            }
        }
    })
}

/// Collect a sample of process metrics.
#[cfg(feature = "proc-metrics")]
pub fn collect_proc_metrics() -> anyhow::Result<()> {
    use anyhow::Context;
    let proc = procfs::process::Process::myself().context("error gathering process metrics")?;

    if let Ok(open_fds) = proc.fd_count() {
        metrics::gauge!(METRIC_OPEN_FDS, open_fds as f64);
    }
    if let Ok(limits) = proc.limits() {
        if let procfs::process::LimitValue::Value(max) = limits.max_open_files.soft_limit {
            metrics::gauge!(METRIC_MAX_FDS, max as f64);
        }
    }
    metrics::gauge!(METRIC_VIRTUAL_MEMORY_BYTES, proc.stat.vsize as f64);
    if let Ok(rss) = proc.stat.rss_bytes() {
        metrics::gauge!(METRIC_RESIDENT_MEMORY_BYTES, rss as f64);
    }
    metrics::gauge!(METRIC_THREADS, proc.stat.num_threads as f64);
    Ok(())
}

/// Collect a sample of process metrics.
#[cfg(not(feature = "proc-metrics"))]
pub fn collect_proc_metrics() -> anyhow::Result<()> {
    anyhow::bail!("process metrics sampling requires the proc-metrics feature")
}
