//! Functional verification of the accelerator path.
//!
//! Runs every operation against the host emulator behind a recording
//! wrapper, compares results with the scalar reference kernels and audits
//! descriptor/buffer lifecycle counts.

pub mod checks;
mod reference;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::accel::recording::{LifecycleCounts, RecordingRuntime};
use crate::accel::sim::SimRuntime;
use crate::accel::{PimRuntime, RuntimeSession};
use crate::config::PimBridgeConfig;
use crate::ops::AcceleratorClient;

/// Run the full verification suite.
pub async fn run(cfg: &PimBridgeConfig) -> Result<VerifyReport> {
    info!("Verify: running functional checks on the host emulator...");

    let sim = SimRuntime::new()
        .with_latency(Duration::from_micros(cfg.runtime.emulator_latency_us));
    let session = RuntimeSession::new(
        RecordingRuntime::new(sim),
        cfg.runtime.kind,
        cfg.runtime.precision,
    )
    .context("failed to initialize the emulated PIM runtime")?;
    let client = AcceleratorClient::new(Arc::new(session));

    let seed = cfg.verify.seed;
    let tolerance = cfg.verify.tolerance;

    let mut results = vec![
        // 1. Elementwise regression (32 x (1 + 2) = 32 x 3)
        checks::eltwise_regression(&client),
        // 2. GEMM over every supported rank combination
        checks::gemm_shapes(&client, seed, tolerance),
        // 3. Dense layer with and without bias
        checks::dense_layers(&client, seed, tolerance),
        // 4. Unsupported ranks never reach the runtime
        checks::unsupported_ranks(&client),
        // 5. Injected failures release everything
        checks::lifecycle(&client),
        // 6. Queued GEMM keeps handles until waited on
        checks::non_blocking(&client, seed, tolerance),
    ];

    // 7. Concurrent invocations
    results.push(checks::concurrency(&client, cfg.verify.threads, seed).await);

    // 8. Runtime shutdown with nothing left live
    results.push(shutdown(&client));

    // Taken after shutdown so the deinitialize call is counted.
    let lifecycle = client.runtime().counts();

    let failed = results
        .iter()
        .filter(|r| r.status == CheckStatus::Fail)
        .count();
    if failed > 0 {
        warn!(failed, "Verify: {} check(s) failed", failed);
    }
    info!("Verify complete. {} check(s) run.", results.len());

    Ok(VerifyReport {
        results,
        lifecycle,
        generated_at: Utc::now(),
    })
}

fn shutdown<R: PimRuntime>(client: &AcceleratorClient<R>) -> CheckResult {
    const NAME: &str = "Session shutdown";

    let outcome = if Arc::strong_count(client.session()) > 1 {
        Err(anyhow::anyhow!("session still shared by another client"))
    } else {
        client
            .session()
            .shutdown()
            .map(|()| "runtime deinitialized with no live handles".to_string())
            .context("deinitialize refused")
    };
    CheckResult::from_outcome(NAME, outcome)
}

#[derive(Debug, Serialize)]
pub struct VerifyReport {
    pub results: Vec<CheckResult>,
    /// Runtime call counts accumulated over the whole run.
    pub lifecycle: LifecycleCounts,
    pub generated_at: DateTime<Utc>,
}

impl VerifyReport {
    pub fn all_passed(&self) -> bool {
        self.results.iter().all(|r| r.status == CheckStatus::Pass)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub details: String,
}

impl CheckResult {
    pub(crate) fn from_outcome(name: &str, outcome: Result<String>) -> Self {
        match outcome {
            Ok(details) => Self {
                name: name.to_string(),
                status: CheckStatus::Pass,
                details,
            },
            Err(e) => Self {
                name: name.to_string(),
                status: CheckStatus::Fail,
                details: format!("{e:#}"),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum CheckStatus {
    Pass,
    Fail,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_default_run_passes() {
        let report = run(&PimBridgeConfig::default()).await.unwrap();
        for r in &report.results {
            assert_eq!(r.status, CheckStatus::Pass, "{}: {}", r.name, r.details);
        }
        assert!(report.all_passed());
        assert!(report.lifecycle.is_balanced());
        assert_eq!(report.lifecycle.initializations, 1);
        assert_eq!(report.lifecycle.deinitializations, 1);
    }

    #[tokio::test]
    async fn test_run_with_latency_and_threads() {
        let mut cfg = PimBridgeConfig::default();
        cfg.runtime.emulator_latency_us = 200;
        cfg.verify.threads = 8;
        let report = run(&cfg).await.unwrap();
        assert!(report.all_passed());
    }

    #[tokio::test]
    async fn test_int8_is_refused_up_front() {
        let mut cfg = PimBridgeConfig::default();
        cfg.runtime.precision = crate::accel::Precision::Int8;
        assert!(run(&cfg).await.is_err());
    }

    #[test]
    fn test_shutdown_check_refuses_shared_session() {
        let session = RuntimeSession::new(
            RecordingRuntime::new(SimRuntime::new()),
            crate::accel::RuntimeKind::Emulator,
            crate::accel::Precision::Fp16,
        )
        .unwrap();
        let client = AcceleratorClient::new(Arc::new(session));
        let other = client.clone();

        assert_eq!(shutdown(&client).status, CheckStatus::Fail);
        assert_eq!(client.runtime().counts().deinitializations, 0);

        drop(other);
        assert_eq!(shutdown(&client).status, CheckStatus::Pass);
        assert_eq!(client.runtime().counts().deinitializations, 1);
    }

    #[test]
    fn test_report_serializes() {
        let report = VerifyReport {
            results: vec![CheckResult::from_outcome(
                "x",
                Err(anyhow::anyhow!("boom")),
            )],
            lifecycle: LifecycleCounts::default(),
            generated_at: Utc::now(),
        };
        assert!(!report.all_passed());
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"Fail\""));
        assert!(json.contains("boom"));
    }
}
