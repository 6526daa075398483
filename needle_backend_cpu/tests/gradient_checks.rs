//! Analytic gradients against central finite differences, float64 throughout.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use needle_backend_cpu::cpu;
use needle_tensor::prelude::*;
use needle_tensor::check_gradients;

const EPS: f64 = 1e-6;
const TOL: f64 = 1e-5;

fn config() -> Config {
    Config::new(cpu()).with_dtype(DType::Float64)
}

fn uniform(shape: &[usize], low: f64, high: f64, rng: &mut StdRng) -> Tensor {
    Tensor::rand_uniform(shape, low, high, false, rng, &config()).unwrap()
}

/// Values bounded away from zero, for kinks like relu.
fn away_from_zero(shape: &[usize], rng: &mut StdRng) -> Tensor {
    let n: usize = shape.iter().product();
    let values: Vec<f64> = (0..n)
        .map(|_| {
            let magnitude = rng.gen_range(0.1..1.0);
            if rng.gen_bool(0.5) {
                magnitude
            } else {
                -magnitude
            }
        })
        .collect();
    Tensor::constant(&values, shape, &config()).unwrap()
}

fn random_shape(rng: &mut StdRng, ndim: usize) -> Vec<usize> {
    (0..ndim).map(|_| rng.gen_range(1..=4)).collect()
}

fn assert_check<F>(name: &str, f: F, inputs: &[Tensor])
where
    F: Fn(&[Tensor]) -> Result<Tensor>,
{
    let check = check_gradients(f, inputs, EPS).unwrap();
    assert!(
        check.passes(TOL),
        "{name}: max relative error {} (abs {})\nanalytic={:?}\nnumeric={:?}",
        check.max_rel_error,
        check.max_abs_error,
        check.analytic,
        check.numeric
    );
}

#[test]
fn test_elementwise_binary_ops() {
    let mut rng = StdRng::seed_from_u64(1);
    for _ in 0..5 {
        let shape = random_shape(&mut rng, 2);
        let a = uniform(&shape, -2.0, 2.0, &mut rng);
        let b = uniform(&shape, 0.5, 2.0, &mut rng);

        assert_check("add", |x| x[0].add(&x[1]), &[a.clone(), b.clone()]);
        assert_check("sub", |x| x[0].sub(&x[1]), &[a.clone(), b.clone()]);
        assert_check("mul", |x| x[0].mul(&x[1]), &[a.clone(), b.clone()]);
        assert_check("div", |x| x[0].div(&x[1]), &[a.clone(), b.clone()]);
    }
}

#[test]
fn test_broadcasting_binary_ops() {
    let mut rng = StdRng::seed_from_u64(2);
    let a = uniform(&[3, 1, 4], -1.0, 1.0, &mut rng);
    let b = uniform(&[2, 1], -1.0, 1.0, &mut rng);
    let s = uniform(&[], -1.0, 1.0, &mut rng);

    assert_check("add broadcast", |x| x[0].add(&x[1]), &[a.clone(), b.clone()]);
    assert_check("mul broadcast", |x| x[0].mul(&x[1]), &[a.clone(), b.clone()]);
    assert_check("mul by scalar tensor", |x| x[0].mul(&x[1]), &[a, s]);
}

#[test]
fn test_power() {
    let mut rng = StdRng::seed_from_u64(3);
    let base = uniform(&[2, 3], 0.5, 2.0, &mut rng);
    let exponent = uniform(&[2, 3], -1.5, 2.5, &mut rng);

    assert_check("powf", |x| x[0].powf(3.0), &[base.clone()]);
    assert_check("powf fractional", |x| x[0].powf(-0.5), &[base.clone()]);
    assert_check("pow", |x| x[0].pow(&x[1]), &[base, exponent]);
}

#[test]
fn test_matmul() {
    let mut rng = StdRng::seed_from_u64(4);
    for _ in 0..4 {
        let (m, n, p) = (
            rng.gen_range(1..=4),
            rng.gen_range(1..=4),
            rng.gen_range(1..=4),
        );
        let a = uniform(&[m, n], -1.0, 1.0, &mut rng);
        let b = uniform(&[n, p], -1.0, 1.0, &mut rng);
        assert_check("matmul", |x| x[0].matmul(&x[1]), &[a, b]);
    }
}

#[test]
fn test_batched_matmul_with_broadcast_batch() {
    let mut rng = StdRng::seed_from_u64(5);
    let a = uniform(&[2, 3, 4], -1.0, 1.0, &mut rng);
    let b = uniform(&[4, 2], -1.0, 1.0, &mut rng);
    assert_check("batched matmul", |x| x[0].matmul(&x[1]), &[a, b]);
}

#[test]
fn test_tiled_matmul_gradient() {
    let mut rng = StdRng::seed_from_u64(6);
    let a = uniform(&[8, 8], -1.0, 1.0, &mut rng);
    let b = uniform(&[8, 8], -1.0, 1.0, &mut rng);
    assert_check("tiled matmul", |x| x[0].matmul(&x[1])?.tanh(), &[a, b]);
}

#[test]
fn test_unary_ops() {
    let mut rng = StdRng::seed_from_u64(7);
    let shape = random_shape(&mut rng, 3);
    let x = uniform(&shape, -2.0, 2.0, &mut rng);
    let positive = uniform(&shape, 0.2, 3.0, &mut rng);
    let kinked = away_from_zero(&shape, &mut rng);

    assert_check("exp", |t| t[0].exp(), &[x.clone()]);
    assert_check("tanh", |t| t[0].tanh(), &[x.clone()]);
    assert_check("sigmoid", |t| t[0].sigmoid(), &[x.clone()]);
    assert_check("neg", |t| t[0].neg(), &[x]);
    assert_check("log", |t| t[0].log(), &[positive.clone()]);
    assert_check("sqrt", |t| t[0].sqrt(), &[positive]);
    assert_check("relu", |t| t[0].relu(), &[kinked]);
}

#[test]
fn test_scalar_ops() {
    let mut rng = StdRng::seed_from_u64(8);
    let x = uniform(&[4], -2.0, 2.0, &mut rng);
    assert_check(
        "scalar chain",
        |t| t[0].add_scalar(1.5)?.mul_scalar(-2.0)?.div_scalar(3.0),
        &[x],
    );
}

#[test]
fn test_maximum() {
    let a = Tensor::constant(&[0.1, -0.5, 2.0, 0.7], [4], &config()).unwrap();
    let b = Tensor::constant(&[0.4, -0.9, 1.0, 0.2], [4], &config()).unwrap();
    assert_check("maximum", |t| t[0].maximum(&t[1]), &[a, b]);
}

#[test]
fn test_reductions() {
    let mut rng = StdRng::seed_from_u64(9);
    let x = uniform(&[2, 3, 4], -1.0, 1.0, &mut rng);
    let w = uniform(&[2, 1, 4], -1.0, 1.0, &mut rng);

    // Weighted, so the gradient is not uniform.
    assert_check(
        "sum axis",
        |t| t[0].sum(Some(&[1]), true)?.mul(&t[1]),
        &[x.clone(), w.clone()],
    );
    assert_check("sum all", |t| t[0].mul(&t[0])?.sum(None, false), &[x.clone()]);
    assert_check(
        "mean",
        |t| t[0].mean(Some(&[0, 2]), false)?.exp(),
        &[x.clone()],
    );
    assert_check("max", |t| t[0].max(Some(&[2]), false)?.tanh(), &[x]);
}

#[test]
fn test_structural_ops() {
    let mut rng = StdRng::seed_from_u64(10);
    let x = uniform(&[2, 3, 4], -1.0, 1.0, &mut rng);
    let w = uniform(&[4, 3, 2], -1.0, 1.0, &mut rng);

    assert_check(
        "reshape",
        |t| t[0].reshape([6, 4])?.mul(&t[1].reshape([6, 4])?),
        &[x.clone(), w.clone()],
    );
    assert_check(
        "permute",
        |t| t[0].permute(&[2, 1, 0])?.mul(&t[1]),
        &[x.clone(), w],
    );
    assert_check(
        "slice",
        |t| {
            t[0].slice(&[
                SliceRange::full(2),
                SliceRange::new(1, 3, 1),
                SliceRange::new(0, 4, 3),
            ])?
            .exp()
        },
        &[x.clone()],
    );
    assert_check(
        "split and stack",
        |t| {
            let parts = t[0].split(1)?;
            Tensor::stack(&[parts[2].clone(), parts[0].mul(&parts[1])?], 0)
        },
        &[x.clone()],
    );
    assert_check(
        "broadcast_to",
        |t| t[0].sum(Some(&[0]), true)?.broadcast_to([5, 3, 4])?.tanh(),
        &[x],
    );
}

#[test]
fn test_softmax_composites() {
    let mut rng = StdRng::seed_from_u64(11);
    let x = uniform(&[3, 5], -3.0, 3.0, &mut rng);
    let target = uniform(&[3, 5], 0.0, 1.0, &mut rng);

    assert_check(
        "softmax",
        |t| t[0].softmax(1)?.mul(&t[1]),
        &[x.clone(), target.clone()],
    );
    assert_check(
        "log_softmax",
        |t| t[0].log_softmax(1)?.mul(&t[1]),
        &[x, target],
    );
}

#[test]
fn test_grouped_convolution() {
    let mut rng = StdRng::seed_from_u64(12);
    let x = uniform(&[2, 4, 5, 5], -1.0, 1.0, &mut rng);
    let w = uniform(&[6, 2, 3, 3], -1.0, 1.0, &mut rng);

    // "same" padding for k = 3
    assert_check(
        "conv2d groups=2",
        |t| t[0].conv2d(&t[1], 1, 1, 2)?.tanh(),
        &[x.clone(), w.clone()],
    );
    assert_check(
        "conv2d stride=2",
        |t| t[0].conv2d(&t[1], 2, 1, 2)?.tanh(),
        &[x.clone(), w],
    );

    let depthwise = uniform(&[4, 1, 3, 3], -1.0, 1.0, &mut rng);
    assert_check(
        "conv2d depthwise, no padding",
        |t| t[0].conv2d(&t[1], 1, 0, 4)?.tanh(),
        &[x, depthwise],
    );
}
