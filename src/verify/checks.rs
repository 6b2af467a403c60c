//! Individual verification checks.

use std::sync::Arc;

use anyhow::{bail, ensure, Context, Result};
use tracing::debug;

use crate::accel::recording::RecordingRuntime;
use crate::accel::{Activation, PimRuntime};
use crate::layers::{DenseLayer, GemmLayer, PimOp};
use crate::ops::{AcceleratorClient, OpError, PendingGemm};
use crate::tensor::Tensor;

use super::reference;
use super::CheckResult;

type Client<R> = AcceleratorClient<RecordingRuntime<R>>;

/// Input/weight shape pairs covering every supported rank combination.
const GEMM_CASES: &[(&[usize], &[usize])] = &[
    (&[2, 4, 8], &[8, 16]),
    (&[2, 4, 8], &[2, 8, 16]),
    (&[3, 2, 4, 8], &[8, 16]),
    (&[3, 2, 4, 8], &[2, 8, 16]),
];

pub fn eltwise_regression<R: PimRuntime>(client: &Client<R>) -> CheckResult {
    CheckResult::from_outcome("Eltwise regression", eltwise_regression_inner(client))
}

fn eltwise_regression_inner<R: PimRuntime>(client: &Client<R>) -> Result<String> {
    let ones = Tensor::full(&[32], 1.0);
    let twos = Tensor::full(&[32], 2.0);

    let sum = client.add(&ones, &twos)?;
    if let Some(bad) = sum.to_f32_vec().into_iter().find(|v| *v != 3.0) {
        bail!("32 x (1 + 2) produced {bad}");
    }
    let product = client.mul(&twos, &twos)?;
    if let Some(bad) = product.to_f32_vec().into_iter().find(|v| *v != 4.0) {
        bail!("32 x (2 * 2) produced {bad}");
    }
    Ok("32 x (1 + 2) = 32 x 3, 32 x (2 * 2) = 32 x 4".into())
}

pub fn gemm_shapes<R: PimRuntime>(client: &Client<R>, seed: u64, tolerance: f32) -> CheckResult {
    CheckResult::from_outcome("GEMM shapes", gemm_shapes_inner(client, seed, tolerance))
}

fn gemm_shapes_inner<R: PimRuntime>(client: &Client<R>, seed: u64, tolerance: f32) -> Result<String> {
    let mut worst = 0.0f32;
    for (i, (input_shape, weight_shape)) in GEMM_CASES.iter().enumerate() {
        let base = seed.wrapping_add(i as u64 * 3);
        let out_width = weight_shape[weight_shape.len() - 1];
        let activation = if i % 2 == 0 {
            Activation::Relu
        } else {
            Activation::None
        };
        let layer = GemmLayer::new(
            Tensor::random(weight_shape, base.wrapping_add(1)),
            Tensor::random(&[out_width], base.wrapping_add(2)),
            activation,
        );
        let inputs = Tensor::random(input_shape, base);

        let got = layer
            .forward(client, &inputs)
            .with_context(|| format!("inputs {input_shape:?} x weights {weight_shape:?}"))?;
        let diff = reference::gemm(&inputs, &layer.weights, &layer.bias, activation)
            .and_then(|want| want.check(&got, tolerance))
            .with_context(|| format!("inputs {input_shape:?} x weights {weight_shape:?}"))?;
        debug!(?input_shape, ?weight_shape, diff, "gemm case verified");
        worst = worst.max(diff);
    }
    Ok(format!(
        "{} rank combinations, max abs diff {worst:.4}",
        GEMM_CASES.len()
    ))
}

pub fn dense_layers<R: PimRuntime>(client: &Client<R>, seed: u64, tolerance: f32) -> CheckResult {
    CheckResult::from_outcome("Dense layers", dense_layers_inner(client, seed, tolerance))
}

fn dense_layers_inner<R: PimRuntime>(client: &Client<R>, seed: u64, tolerance: f32) -> Result<String> {
    let weight = Tensor::random(&[8, 16], seed);
    let bias = Tensor::random(&[16], seed.wrapping_add(1));

    let with_bias = DenseLayer::new(weight.clone(), Some(bias)).with_activation(Activation::Relu);
    let batch = Tensor::random(&[4, 8], seed.wrapping_add(2));
    let got = with_bias.forward(client, &batch)?;
    ensure!(got.shape() == [4, 16], "dense output shape {:?}", got.shape());
    let bias = with_bias.bias.as_ref();
    let d1 = reference::dense(&batch, &with_bias.weight, bias, with_bias.activation)
        .and_then(|want| want.check(&got, tolerance))
        .context("dense with bias")?;

    let without_bias = DenseLayer::new(weight, None);
    let vector = Tensor::random(&[8], seed.wrapping_add(3));
    let got = without_bias.forward(client, &vector)?;
    ensure!(got.shape() == [16], "dense output shape {:?}", got.shape());
    let d2 = reference::dense(&vector, &without_bias.weight, None, Activation::None)
        .and_then(|want| want.check(&got, tolerance))
        .context("dense without bias")?;

    Ok(format!("with and without bias, max abs diff {:.4}", d1.max(d2)))
}

pub fn unsupported_ranks<R: PimRuntime>(client: &Client<R>) -> CheckResult {
    CheckResult::from_outcome("Unsupported ranks", unsupported_ranks_inner(client))
}

fn unsupported_ranks_inner<R: PimRuntime>(client: &Client<R>) -> Result<String> {
    let cases: &[(&[usize], &[usize])] = &[
        (&[4, 8], &[8, 4]),
        (&[1, 1, 2, 4, 8], &[8, 4]),
        (&[2, 4, 8], &[32]),
        (&[2, 4, 8], &[1, 2, 8, 4]),
    ];
    let bias = Tensor::zeros(&[4]);
    let before = client.runtime().counts();

    for (input_shape, weight_shape) in cases {
        let inputs = Tensor::zeros(input_shape);
        let weights = Tensor::zeros(weight_shape);
        match client.execute_gemm(&inputs, &weights, &bias, Activation::None, true) {
            Err(OpError::UnsupportedRank { .. }) => {}
            Err(other) => bail!("{input_shape:?} x {weight_shape:?}: unexpected error {other}"),
            Ok(_) => bail!("{input_shape:?} x {weight_shape:?} was accepted"),
        };
    }
    match client.execute_dense(&Tensor::zeros(&[1, 2, 8]), &Tensor::zeros(&[8, 4]), None, Activation::None) {
        Err(OpError::UnsupportedRank { .. }) => {}
        Err(other) => bail!("rank-3 dense input: unexpected error {other}"),
        Ok(_) => bail!("rank-3 dense input was accepted"),
    };

    let delta = client.runtime().counts().since(&before);
    ensure!(
        delta.is_untouched(),
        "rejected operands reached the runtime: {delta:?}"
    );
    Ok(format!("{} shapes rejected with zero runtime calls", cases.len() + 1))
}

/// Failure injected into one GEMM invocation.
#[derive(Debug, Clone, Copy)]
enum Fault {
    Execute,
    Completion,
    /// 1-based index of the buffer creation to fail.
    Buffer(usize),
}

impl Fault {
    fn arm<R: PimRuntime>(self, runtime: &RecordingRuntime<R>) {
        match self {
            Fault::Execute => runtime.fail_next_execute(),
            Fault::Completion => runtime.fail_next_completion(),
            Fault::Buffer(nth) => runtime.fail_buffer_creation(nth),
        }
    }
}

pub fn lifecycle<R: PimRuntime>(client: &Client<R>) -> CheckResult {
    CheckResult::from_outcome("Lifecycle audit", lifecycle_inner(client))
}

fn lifecycle_inner<R: PimRuntime>(client: &Client<R>) -> Result<String> {
    let runtime = client.runtime();
    let inputs = Tensor::random(&[1, 2, 4, 8], 11);
    let weights = Tensor::random(&[8, 4], 12);
    let bias = Tensor::zeros(&[4]);

    let faults = [
        Fault::Execute,
        Fault::Completion,
        Fault::Buffer(1),
        Fault::Buffer(2),
        Fault::Buffer(3),
        Fault::Buffer(4),
    ];

    let mut runs = 0;
    for fault in faults {
        for blocking in [true, false] {
            let before = runtime.counts();
            fault.arm(runtime);
            let result = client
                .execute_gemm(&inputs, &weights, &bias, Activation::None, blocking)
                .and_then(PendingGemm::wait);
            match result {
                Err(OpError::AcceleratorExecutionFailure(_)) => {}
                Err(other) => bail!("{fault:?} (blocking={blocking}): unexpected error {other}"),
                Ok(_) => bail!("{fault:?} (blocking={blocking}) was not reported"),
            }
            let delta = runtime.counts().since(&before);
            ensure!(
                delta.is_balanced(),
                "{fault:?} (blocking={blocking}) left handles behind: {delta:?}"
            );
            ensure!(
                runtime.live() == (0, 0),
                "{fault:?} (blocking={blocking}) left live handles {:?}",
                runtime.live()
            );
            runs += 1;
        }
    }

    let before = runtime.counts();
    client.gemm(&inputs, &weights, &bias, Activation::None)?;
    let delta = runtime.counts().since(&before);
    ensure!(
        delta.descriptors_created == 1 && delta.buffers_created == 4 && delta.is_balanced(),
        "successful gemm: {delta:?}"
    );

    Ok(format!("{runs} injected failures released every handle"))
}

pub fn non_blocking<R: PimRuntime>(client: &Client<R>, seed: u64, tolerance: f32) -> CheckResult {
    CheckResult::from_outcome("Queued GEMM", non_blocking_inner(client, seed, tolerance))
}

fn non_blocking_inner<R: PimRuntime>(client: &Client<R>, seed: u64, tolerance: f32) -> Result<String> {
    let runtime = client.runtime();
    let layer = GemmLayer::new(
        Tensor::random(&[2, 8, 16], seed.wrapping_add(21)),
        Tensor::random(&[16], seed.wrapping_add(22)),
        Activation::Relu,
    );
    let inputs = Tensor::random(&[2, 4, 8], seed.wrapping_add(20));

    let pending = client.execute_gemm(&inputs, &layer.weights, &layer.bias, layer.activation, false)?;
    ensure!(
        pending.output_shape() == [2, 4, 16],
        "pending output shape {:?}",
        pending.output_shape()
    );
    ensure!(
        runtime.live() == (1, 4),
        "queued gemm holds {:?} live handles",
        runtime.live()
    );
    let got = pending.wait()?;
    ensure!(
        runtime.live() == (0, 0),
        "handles outlived completion: {:?}",
        runtime.live()
    );
    let diff = reference::gemm(&inputs, &layer.weights, &layer.bias, layer.activation)?
        .check(&got, tolerance)?;
    Ok(format!("handles held until wait, max abs diff {diff:.4}"))
}

pub async fn concurrency<R: PimRuntime + 'static>(
    client: &Client<R>,
    threads: usize,
    seed: u64,
) -> CheckResult {
    CheckResult::from_outcome(
        "Concurrency",
        concurrency_inner(client, threads.max(1), seed).await,
    )
}

async fn concurrency_inner<R: PimRuntime + 'static>(
    client: &Client<R>,
    threads: usize,
    seed: u64,
) -> Result<String> {
    let inputs = Arc::new(Tensor::random(&[2, 2, 4, 8], seed.wrapping_add(30)));
    let weights = Arc::new(Tensor::random(&[2, 8, 16], seed.wrapping_add(31)));
    let bias = Arc::new(Tensor::random(&[16], seed.wrapping_add(32)));

    let serial = client.gemm(&inputs, &weights, &bias, Activation::Relu)?;
    let before = client.runtime().counts();

    let mut handles = Vec::with_capacity(threads);
    for _ in 0..threads {
        let client = client.clone();
        let (inputs, weights, bias) = (Arc::clone(&inputs), Arc::clone(&weights), Arc::clone(&bias));
        handles.push(tokio::task::spawn_blocking(move || {
            client.gemm(&inputs, &weights, &bias, Activation::Relu)
        }));
    }
    for (n, handle) in handles.into_iter().enumerate() {
        let out = handle.await.context("verification worker panicked")??;
        ensure!(
            out.data() == serial.data(),
            "worker {n} diverged from the serial result"
        );
    }

    let delta = client.runtime().counts().since(&before);
    ensure!(
        delta.is_balanced() && delta.descriptors_created == threads,
        "concurrent lifecycle counts: {delta:?}"
    );
    Ok(format!("{threads} concurrent GEMMs matched the serial result"))
}
