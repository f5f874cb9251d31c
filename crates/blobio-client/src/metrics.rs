//! Prometheus text export
//!
//! # Blob Metrics
//! - `blobio_blob_size_bytes` - Blob size
//! - `blobio_blob_inflight_requests` - Accepted requests not yet completed
//! - `blobio_blob_read_ops_total` / `blobio_blob_write_ops_total`
//! - `blobio_blob_read_bytes_total` / `blobio_blob_write_bytes_total`
//! - `blobio_blob_split_ops_total` - Requests that crossed an extent boundary
//! - `blobio_blob_failed_ops_total`
//! - `blobio_blob_checksum_errors_total`
//! - `blobio_blob_read_latency_seconds` / `blobio_blob_write_latency_seconds` - Histograms
//!
//! # Dispatch Metrics
//! - `blobio_dispatch_pushed_total`, `blobio_dispatch_issued_total`,
//!   `blobio_dispatch_expired_total`, `blobio_dispatch_full_retries_total`
//! - `blobio_dispatch_queue_wait_seconds`, `blobio_dispatch_issue_seconds`,
//!   `blobio_dispatch_callback_seconds` - Histograms

use crate::blob::BlobStream;
use crate::stats::{DispatchStats, IoStats, LatencyHistogram};
use std::fmt::Write;

/// Prometheus text format exporter
#[derive(Debug)]
pub struct PrometheusExporter {
    /// Metrics prefix (e.g., "blobio")
    prefix: String,
}

type BlobCounter = fn(&IoStats) -> u64;

const BLOB_COUNTERS: [(&str, &str, BlobCounter); 7] = [
    ("blob_read_ops_total", "Completed read requests", IoStats::read_ops),
    ("blob_write_ops_total", "Completed write requests", IoStats::write_ops),
    ("blob_read_bytes_total", "Bytes read", IoStats::read_bytes),
    ("blob_write_bytes_total", "Bytes written", IoStats::write_bytes),
    (
        "blob_split_ops_total",
        "Requests split at an extent boundary",
        IoStats::split_ops,
    ),
    (
        "blob_failed_ops_total",
        "Requests completed with an error",
        IoStats::failed_ops,
    ),
    (
        "blob_checksum_errors_total",
        "Reads whose payload failed checksum verification",
        IoStats::checksum_errors,
    ),
];

impl PrometheusExporter {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Export blob and dispatch metrics in Prometheus text format
    pub fn export(&self, blobs: &[&BlobStream], dispatch: Option<&DispatchStats>) -> String {
        let mut output = String::with_capacity(8 * 1024);
        self.export_blob_metrics(&mut output, blobs);
        if let Some(stats) = dispatch {
            self.export_dispatch_metrics(&mut output, stats);
        }
        output
    }

    fn export_blob_metrics(&self, output: &mut String, blobs: &[&BlobStream]) {
        if blobs.is_empty() {
            return;
        }
        let labels: Vec<(String, String)> = blobs
            .iter()
            .map(|b| (b.blob_id().as_u64().to_string(), b.name().to_string()))
            .collect();
        let label_pairs = |i: usize| {
            [
                ("blob_id", labels[i].0.as_str()),
                ("name", labels[i].1.as_str()),
            ]
        };

        self.write_help(output, "blob_size_bytes", "Blob size in bytes");
        self.write_type(output, "blob_size_bytes", "gauge");
        for (i, blob) in blobs.iter().enumerate() {
            self.write_metric_with_labels(
                output,
                "blob_size_bytes",
                blob.size() as f64,
                &label_pairs(i),
            );
        }

        self.write_help(
            output,
            "blob_inflight_requests",
            "Accepted requests whose callback has not run",
        );
        self.write_type(output, "blob_inflight_requests", "gauge");
        for (i, blob) in blobs.iter().enumerate() {
            self.write_metric_with_labels(
                output,
                "blob_inflight_requests",
                blob.inflight_io_number() as f64,
                &label_pairs(i),
            );
        }

        for (name, help, counter) in BLOB_COUNTERS {
            self.write_help(output, name, help);
            self.write_type(output, name, "counter");
            for (i, blob) in blobs.iter().enumerate() {
                let value = counter(blob.stats()) as f64;
                self.write_metric_with_labels(output, name, value, &label_pairs(i));
            }
        }

        self.write_help(output, "blob_read_latency_seconds", "Read request latency");
        self.write_type(output, "blob_read_latency_seconds", "histogram");
        for (i, blob) in blobs.iter().enumerate() {
            export_histogram_prometheus(
                output,
                &self.prefix,
                "blob_read_latency_seconds",
                &label_pairs(i),
                blob.stats().read_latency(),
            );
        }

        self.write_help(output, "blob_write_latency_seconds", "Write request latency");
        self.write_type(output, "blob_write_latency_seconds", "histogram");
        for (i, blob) in blobs.iter().enumerate() {
            export_histogram_prometheus(
                output,
                &self.prefix,
                "blob_write_latency_seconds",
                &label_pairs(i),
                blob.stats().write_latency(),
            );
        }
    }

    fn export_dispatch_metrics(&self, output: &mut String, stats: &DispatchStats) {
        let counters = [
            ("dispatch_pushed_total", "Requests queued on a worker ring", stats.pushed()),
            (
                "dispatch_issued_total",
                "Requests handed to a transport by a worker",
                stats.issued(),
            ),
            (
                "dispatch_expired_total",
                "Queued requests completed as closed at shutdown",
                stats.expired(),
            ),
            (
                "dispatch_full_retries_total",
                "Push attempts that found the ring full",
                stats.full_retries(),
            ),
        ];
        for (name, help, value) in counters {
            self.write_help(output, name, help);
            self.write_type(output, name, "counter");
            self.write_metric(output, name, value as f64);
        }

        let histograms = [
            ("dispatch_queue_wait_seconds", "Time spent queued on a ring", stats.queue_wait()),
            ("dispatch_issue_seconds", "Time a worker spent issuing", stats.issue_cost()),
            (
                "dispatch_callback_seconds",
                "Time spent in completion handlers",
                stats.callback_cost(),
            ),
        ];
        for (name, help, histogram) in histograms {
            self.write_help(output, name, help);
            self.write_type(output, name, "histogram");
            export_histogram_prometheus(output, &self.prefix, name, &[], histogram);
        }
    }

    fn write_help(&self, output: &mut String, name: &str, help: &str) {
        let _ = writeln!(output, "# HELP {}_{} {}", self.prefix, name, help);
    }

    fn write_type(&self, output: &mut String, name: &str, metric_type: &str) {
        let _ = writeln!(output, "# TYPE {}_{} {}", self.prefix, name, metric_type);
    }

    fn write_metric(&self, output: &mut String, name: &str, value: f64) {
        let _ = writeln!(output, "{}_{} {}", self.prefix, name, value);
    }

    fn write_metric_with_labels(
        &self,
        output: &mut String,
        name: &str,
        value: f64,
        labels: &[(&str, &str)],
    ) {
        let _ = writeln!(
            output,
            "{}_{}{{{}}} {}",
            self.prefix,
            name,
            format_labels(labels),
            value
        );
    }
}

impl Default for PrometheusExporter {
    fn default() -> Self {
        Self::new("blobio")
    }
}

fn format_labels(labels: &[(&str, &str)]) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}=\"{}\"", v.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect::<Vec<_>>()
        .join(",")
}

/// Export latency histogram in Prometheus histogram format
pub fn export_histogram_prometheus(
    output: &mut String,
    prefix: &str,
    name: &str,
    labels: &[(&str, &str)],
    histogram: &LatencyHistogram,
) {
    let base_labels = format_labels(labels);
    let sep = if base_labels.is_empty() { "" } else { "," };

    // Cumulative counts; the open-ended last bucket is covered by +Inf
    let mut cumulative = 0u64;
    for (boundary_us, count) in histogram.bucket_counts() {
        cumulative += count;
        if boundary_us == u64::MAX {
            continue;
        }
        let boundary_secs = boundary_us as f64 / 1_000_000.0;
        let _ = writeln!(
            output,
            "{prefix}_{name}_bucket{{{base_labels}{sep}le=\"{boundary_secs}\"}} {cumulative}"
        );
    }
    let _ = writeln!(
        output,
        "{prefix}_{name}_bucket{{{base_labels}{sep}le=\"+Inf\"}} {}",
        histogram.count()
    );

    let sum_secs = histogram.sum() as f64 / 1_000_000.0;
    if base_labels.is_empty() {
        let _ = writeln!(output, "{prefix}_{name}_sum {sum_secs}");
        let _ = writeln!(output, "{prefix}_{name}_count {}", histogram.count());
    } else {
        let _ = writeln!(output, "{prefix}_{name}_sum{{{base_labels}}} {sum_secs}");
        let _ = writeln!(
            output,
            "{prefix}_{name}_count{{{base_labels}}} {}",
            histogram.count()
        );
    }
}
