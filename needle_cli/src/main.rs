//! CLI demo for the needle autodiff engine.
//!
//! Runs the reference scenarios on the device and dtype chosen through the
//! environment, then checks a handful of operators against finite
//! differences.
//!
//! ```text
//! NEEDLE_DEVICE=cpu NEEDLE_DTYPE=float64 NEEDLE_EAGER=1 RUST_LOG=debug needle
//! ```

use std::env;
use std::process::ExitCode;

use log::{debug, error, info};
use rand::rngs::StdRng;
use rand::SeedableRng;

use needle_backend_cpu::default_registry;
use needle_tensor::{check_gradients, prelude::*};

const FD_EPS: f64 = 1e-6;
const FD_TOL: f64 = 1e-5;

fn main() -> ExitCode {
    env_logger::init();

    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{e}");
            eprintln!("error: {}", e.root_cause());
            ExitCode::FAILURE
        }
    }
}

/// Build the run configuration from `NEEDLE_DEVICE`, `NEEDLE_DTYPE` and
/// `NEEDLE_EAGER`.
fn config_from_env() -> Result<Config> {
    let registry = default_registry();
    let tag = env::var("NEEDLE_DEVICE").unwrap_or_else(|_| "cpu".to_string());
    let device = registry.get(&tag)?;
    if !device.is_enabled() {
        return Err(TensorError::invalid(format!("device `{tag}` is not enabled")));
    }

    let dtype = match env::var("NEEDLE_DTYPE") {
        Ok(value) => value.parse()?,
        Err(_) => DType::Float64,
    };
    let mode = match env::var("NEEDLE_EAGER") {
        Ok(value) if parse_bool(&value) => ExecutionMode::Eager,
        _ => ExecutionMode::Lazy,
    };
    debug!("available devices: {:?}", registry.tags().collect::<Vec<_>>());

    Ok(Config::new(device).with_dtype(dtype).with_mode(mode))
}

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn run() -> Result<bool> {
    let config = config_from_env()?;
    info!(
        "device={} dtype={} mode={:?}",
        config.device.name(),
        config.dtype,
        config.mode
    );

    println!("=== Reverse-Mode Autodiff Demo ===\n");
    scalar_regression(&config)?;
    diamond(&config)?;
    matmul_chain(&config)?;
    softmax_stability(&config)?;

    println!("=== Finite Difference Report (eps={FD_EPS:e}) ===\n");
    finite_difference_report(&config)
}

fn scalar_regression(config: &Config) -> Result<()> {
    println!("1. Scalar regression: loss = sum(x * x)");
    let x = Tensor::var(&[1.0, 2.0, 3.0], [3], config)?;
    let loss = (&x * &x)?.sum(None, false)?;
    loss.backward()?;

    println!("   At x = [1, 2, 3]:");
    println!("   loss = {:.10} (expected: 14)", loss.item()?);
    println!("   dloss/dx = {:?} (expected: [2, 4, 6])\n", x.grad()?.to_vec()?);
    Ok(())
}

fn diamond(config: &Config) -> Result<()> {
    println!("2. Diamond graph: y = (x * x) + (x * x)");
    let x = Tensor::var(&[1.5, -2.0], [2], config)?;
    let sq = (&x * &x)?;
    let y = (&sq + &sq)?.sum(None, false)?;
    let grads = y.backward()?;

    let dx = grads
        .wrt(&x)
        .ok_or(TensorError::GradientUnavailable { node: x.id().as_u64() })?
        .to_vec_f64()?;
    println!("   At x = [1.5, -2.0]:");
    println!("   dy/dx = {:?} (expected: 4x = [6, -8])\n", dx);
    Ok(())
}

fn matmul_chain(config: &Config) -> Result<()> {
    println!("3. Matmul chain: loss = sum(A @ B)");
    let a = Tensor::var(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], [2, 3], config)?;
    let b = Tensor::var(&[0.5, -1.0, 2.0, 0.25, -3.0, 1.5], [3, 2], config)?;
    let loss = a.matmul(&b)?.sum(None, false)?;
    loss.backward()?;

    let row_sums: Vec<f64> = b.to_vec()?.chunks(2).map(|r| r.iter().sum()).collect();
    println!("   loss = {:.10}", loss.item()?);
    println!("   dA = {:?}", a.grad()?.to_vec()?);
    println!("   row sums of B (each row of dA): {:?}", row_sums);

    let check = check_gradients(
        |xs: &[Tensor]| xs[0].matmul(&xs[1]),
        &[a.detach()?, b.detach()?],
        FD_EPS,
    )?;
    println!("   FD check: max relative error = {:.2e}\n", check.max_rel_error);
    Ok(())
}

fn softmax_stability(config: &Config) -> Result<()> {
    println!("4. Softmax stability: logits = [1, 2, 1000]");
    let logits = Tensor::constant(&[1.0, 2.0, 1000.0], [1, 3], config)?;
    let probs = logits.softmax(1)?.to_vec()?;
    let total: f64 = probs.iter().sum();

    println!("   softmax = {:?}", probs);
    println!("   sum = {:.10}, finite = {}\n", total, probs.iter().all(|p| p.is_finite()));
    Ok(())
}

/// Compare analytic and numerical gradients for a sample of operators.
/// Returns false if any check exceeds the tolerance.
fn finite_difference_report(config: &Config) -> Result<bool> {
    if config.dtype != DType::Float64 {
        println!("   skipped: tolerance {FD_TOL:e} needs float64 (NEEDLE_DTYPE={})", config.dtype);
        return Ok(true);
    }

    let mut rng = StdRng::seed_from_u64(0);
    let mut sample = |shape: &[usize], low: f64, high: f64| {
        Tensor::rand_uniform(shape.to_vec(), low, high, false, &mut rng, config)
    };

    let a = sample(&[3, 4], -1.0, 1.0)?;
    let b = sample(&[3, 4], -1.0, 1.0)?;
    let row = sample(&[4], -1.0, 1.0)?;
    let positive = sample(&[3, 4], 0.5, 2.0)?;
    let m = sample(&[4, 5], -1.0, 1.0)?;
    let image = sample(&[1, 4, 5, 5], -1.0, 1.0)?;
    let kernel = sample(&[4, 2, 3, 3], -1.0, 1.0)?;

    let cases = [
        case("add (broadcast)", |x| &x[0] + &x[1], [&a, &row]),
        case("mul", |x| &x[0] * &x[1], [&a, &b]),
        case("pow", |x| x[0].pow(&x[1]), [&positive, &b]),
        case("matmul", |x| x[0].matmul(&x[1]), [&a, &m]),
        case("exp", |x| x[0].exp(), [&a]),
        case("log", |x| x[0].log(), [&positive]),
        case("tanh", |x| x[0].tanh(), [&a]),
        case("reshape", |x| x[0].reshape([2, 6])?.mul(&x[0].reshape([2, 6])?), [&a]),
        case("sum(axis)", |x| x[0].mul(&x[0])?.sum(Some(&[1]), false), [&a]),
        case("conv2d (groups=2)", |x| x[0].conv2d(&x[1], 1, 1, 2), [&image, &kernel]),
    ];

    let mut all_passed = true;
    for (name, f, inputs) in &cases {
        let check = check_gradients(f, inputs, FD_EPS)?;
        let passed = check.passes(FD_TOL);
        all_passed &= passed;
        println!(
            "   {:<18} max abs {:.2e}  max rel {:.2e}  {}",
            name,
            check.max_abs_error,
            check.max_rel_error,
            if passed { "ok" } else { "FAIL" }
        );
    }

    println!();
    if all_passed {
        println!("PASS: all gradients within tolerance ({FD_TOL:e})");
    } else {
        println!("FAIL: some gradients exceed tolerance ({FD_TOL:e})");
    }
    Ok(all_passed)
}

type GradFn = Box<dyn Fn(&[Tensor]) -> Result<Tensor>>;

fn case<F, const N: usize>(
    name: &'static str,
    f: F,
    inputs: [&Tensor; N],
) -> (&'static str, GradFn, Vec<Tensor>)
where
    F: Fn(&[Tensor]) -> Result<Tensor> + 'static,
{
    (name, Box::new(f), inputs.into_iter().cloned().collect())
}
