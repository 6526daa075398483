//! Integration tests for neural network training.
//!
//! Small end-to-end problems on the CPU backend, seeded for reproducibility.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use needle_backend_cpu::cpu;
use needle_nn::{
    binary_cross_entropy_with_logits, cross_entropy, log_softmax, mse_loss, softmax, Adam,
    ConvGp, ConvOptions, Gelu, Linear, Module, Optimizer, Relu, Sequential, Tanh, SGD,
};
use needle_tensor::prelude::*;

// ============================================================================
// Test Utilities
// ============================================================================

fn config() -> Config {
    Config::new(cpu()).with_dtype(DType::Float64)
}

fn argmax_rows(logits: &Tensor) -> Vec<usize> {
    let classes = logits.shape().dim(1);
    logits
        .to_vec()
        .unwrap()
        .chunks(classes)
        .map(|row| {
            row.iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(i, _)| i)
                .unwrap_or(0)
        })
        .collect()
}

fn mlp(sizes: &[usize], rng: &mut StdRng, config: &Config) -> Sequential {
    let mut model = Sequential::new();
    for (i, pair) in sizes.windows(2).enumerate() {
        model = model.add(Linear::new(pair[0], pair[1], true, rng, config).unwrap());
        if i + 2 < sizes.len() {
            model = model.add(Relu);
        }
    }
    model
}

// ============================================================================
// Test: Batch Linear Regression
// ============================================================================

#[test]
fn test_batch_linear_regression() {
    eprintln!("\n=== Batch Linear Regression ===");

    let mut rng = StdRng::seed_from_u64(789);

    // Linear function: y = 2*x1 + 3*x2 + 1
    let inputs: Vec<f64> = (0..40).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let targets: Vec<f64> = inputs.chunks(2).map(|x| 2.0 * x[0] + 3.0 * x[1] + 1.0).collect();
    let x = Tensor::constant(&inputs, [20, 2], &config()).unwrap();
    let y = Tensor::constant(&targets, [20, 1], &config()).unwrap();

    let mut layer = Linear::new(2, 1, true, &mut rng, &config()).unwrap();
    let mut opt = Adam::new(0.1);

    for epoch in 0..300 {
        let loss = mse_loss(&layer.forward(&x).unwrap(), &y).unwrap();
        loss.backward().unwrap();
        opt.step(&mut layer.parameters_mut()).unwrap();

        if epoch % 100 == 0 {
            eprintln!("  Epoch {:4}: loss = {:.6}", epoch, loss.item().unwrap());
        }
    }

    let w = layer.weight.to_vec().unwrap();
    let b = layer.bias.as_ref().unwrap().to_vec().unwrap();
    eprintln!("  Learned: w=[{:.3}, {:.3}], b={:.3}", w[0], w[1], b[0]);

    assert!((w[0] - 2.0).abs() < 0.1, "Weight[0] should be near 2.0, got {}", w[0]);
    assert!((w[1] - 3.0).abs() < 0.1, "Weight[1] should be near 3.0, got {}", w[1]);
    assert!((b[0] - 1.0).abs() < 0.1, "Bias should be near 1.0, got {}", b[0]);
}

// ============================================================================
// Test: Multi-class Classification (3 clusters)
// ============================================================================

#[test]
fn test_multiclass_classification() {
    eprintln!("\n=== Multi-class Classification (3 clusters) ===");

    let mut rng = StdRng::seed_from_u64(456);

    // Generate 3 well-separated clusters
    let centers = [(0.0, 3.0), (-2.5, -1.5), (2.5, -1.5)];
    let mut inputs = Vec::new();
    let mut labels = Vec::new();
    for (class_idx, &(cx, cy)) in centers.iter().enumerate() {
        for _ in 0..20 {
            inputs.push(cx + rng.gen_range(-0.3..0.3));
            inputs.push(cy + rng.gen_range(-0.3..0.3));
            labels.push(class_idx);
        }
    }
    let x = Tensor::constant(&inputs, [labels.len(), 2], &config()).unwrap();

    let mut model = mlp(&[2, 16, 3], &mut rng, &config());
    let mut opt = Adam::new(0.05);

    for epoch in 0..100 {
        let loss = cross_entropy(&model.forward(&x).unwrap(), &labels).unwrap();
        loss.backward().unwrap();
        opt.step(&mut model.parameters_mut()).unwrap();

        if epoch % 25 == 0 {
            eprintln!("  Epoch {:4}: loss = {:.4}", epoch, loss.item().unwrap());
        }
    }

    let predicted = argmax_rows(&model.forward(&x).unwrap());
    let correct = predicted.iter().zip(&labels).filter(|(p, l)| p == l).count();
    let accuracy = correct as f64 / labels.len() as f64 * 100.0;
    eprintln!("  Final accuracy: {:.1}%", accuracy);
    assert!(accuracy > 95.0, "Accuracy {} too low", accuracy);
}

// ============================================================================
// Test: XOR
// ============================================================================

#[test]
fn test_xor() {
    eprintln!("\n=== XOR Problem ===");

    let x = Tensor::constant(&[0.0, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0], [4, 2], &config()).unwrap();
    let targets = [0.0, 1.0, 1.0, 0.0];
    let y = Tensor::constant(&targets, [4, 1], &config()).unwrap();

    // Try multiple initializations
    let mut best_correct = 0;
    for attempt in 0..3 {
        let mut rng = StdRng::seed_from_u64(attempt);
        let mut model = Sequential::new()
            .add(Linear::new(2, 16, true, &mut rng, &config()).unwrap())
            .add(Tanh)
            .add(Linear::new(16, 1, true, &mut rng, &config()).unwrap());
        let mut opt = Adam::new(0.05);

        for _ in 0..500 {
            let loss = mse_loss(&model.forward(&x).unwrap(), &y).unwrap();
            loss.backward().unwrap();
            opt.step(&mut model.parameters_mut()).unwrap();
        }

        let outputs = model.forward(&x).unwrap().to_vec().unwrap();
        let correct = outputs
            .iter()
            .zip(targets)
            .filter(|&(&o, t)| (o > 0.5) == (t > 0.5))
            .count();
        best_correct = best_correct.max(correct);
        eprintln!("  Attempt {}: {}/4 correct, outputs {:.2?}", attempt + 1, correct, outputs);

        if correct == 4 {
            break;
        }
    }

    assert!(best_correct >= 3, "XOR should get at least 3/4 correct, got {}", best_correct);
}

// ============================================================================
// Test: SGD with momentum and weight decay
// ============================================================================

#[test]
fn test_sgd_momentum_regression() {
    eprintln!("\n=== SGD (momentum + weight decay) ===");

    let mut rng = StdRng::seed_from_u64(11);
    let inputs: Vec<f64> = (0..16).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let targets: Vec<f64> = inputs.iter().map(|v| 1.5 * v - 0.5).collect();
    let x = Tensor::constant(&inputs, [16, 1], &config()).unwrap();
    let y = Tensor::constant(&targets, [16, 1], &config()).unwrap();

    let mut layer = Linear::new(1, 1, true, &mut rng, &config()).unwrap();
    let mut opt = SGD::with_momentum(0.05, 0.9).weight_decay(1e-4);

    let initial = mse_loss(&layer.forward(&x).unwrap(), &y).unwrap().item().unwrap();
    for _ in 0..200 {
        let loss = mse_loss(&layer.forward(&x).unwrap(), &y).unwrap();
        loss.backward().unwrap();
        opt.step(&mut layer.parameters_mut()).unwrap();
    }
    let last = mse_loss(&layer.forward(&x).unwrap(), &y).unwrap().item().unwrap();
    eprintln!("  loss {:.6} -> {:.6}", initial, last);

    assert!(last < 1e-2, "SGD should fit a line, final loss {}", last);
}

// ============================================================================
// Test: Grouped Convolution Classifier
// ============================================================================

/// 4x4 single-channel images: vertical stripes (class 0) or horizontal (class 1).
fn stripes(rng: &mut StdRng, n: usize) -> (Vec<f64>, Vec<usize>) {
    let mut pixels = Vec::with_capacity(n * 16);
    let mut labels = Vec::with_capacity(n);
    for i in 0..n {
        let label = i % 2;
        for r in 0..4 {
            for c in 0..4 {
                let on = if label == 0 { c % 2 } else { r % 2 };
                pixels.push(on as f64 + rng.gen_range(-0.1..0.1));
            }
        }
        labels.push(label);
    }
    (pixels, labels)
}

#[test]
fn test_conv_classifier() {
    eprintln!("\n=== Grouped Convolution Classifier ===");

    let mut rng = StdRng::seed_from_u64(21);
    let (pixels, labels) = stripes(&mut rng, 8);
    let x = Tensor::constant(&pixels, [8, 1, 4, 4], &config()).unwrap();

    let mut stem = ConvGp::new(1, 4, 3, ConvOptions::default(), &mut rng, &config()).unwrap();
    let mut mixer = ConvGp::new(4, 4, 3, ConvOptions::default().groups(2), &mut rng, &config())
        .unwrap();
    let mut head = Linear::new(4, 2, true, &mut rng, &config()).unwrap();
    let mut opt = Adam::new(0.05);

    let forward = |stem: &ConvGp, mixer: &ConvGp, head: &Linear| -> Result<Tensor> {
        let h = Gelu.forward(&stem.forward(&x)?)?;
        let h = mixer.forward(&h)?.relu()?;
        // Global average pool: [8, 4, 4, 4] -> [8, 4]
        head.forward(&h.mean(Some(&[2, 3]), false)?)
    };

    let mut losses = Vec::new();
    for _ in 0..60 {
        let loss = cross_entropy(&forward(&stem, &mixer, &head).unwrap(), &labels).unwrap();
        loss.backward().unwrap();
        losses.push(loss.item().unwrap());

        let mut params = stem.parameters_mut();
        params.extend(mixer.parameters_mut());
        params.extend(head.parameters_mut());
        assert!(params.iter().all(|p| p.grad().is_some()));
        opt.step(&mut params).unwrap();
    }

    let (first, last) = (losses[0], losses[losses.len() - 1]);
    eprintln!("  loss {:.4} -> {:.4}", first, last);
    assert!(losses.iter().all(|l| l.is_finite()));
    assert!(last < first, "training should reduce the loss: {} -> {}", first, last);
}

// ============================================================================
// Test: Gradient Flow Through Deep Network
// ============================================================================

#[test]
fn test_gradient_flow_deep() {
    eprintln!("\n=== Gradient Flow Through 6-Layer Network ===");

    let mut rng = StdRng::seed_from_u64(5);
    let model = mlp(&[8, 8, 8, 8, 8, 8, 8], &mut rng, &config());
    assert_eq!(model.parameters().len(), 12);

    let x = Tensor::var(&[1.0; 8], [1, 8], &config()).unwrap();
    let loss = model.forward(&x).unwrap().sum(None, false).unwrap();
    loss.backward().unwrap();

    for (i, p) in model.parameters().iter().enumerate() {
        let g = p.grad().expect("every parameter receives a gradient");
        let grad_norm: f64 = g.to_vec_f64().unwrap().iter().map(|v| v * v).sum::<f64>().sqrt();
        eprintln!("  Parameter {} grad norm: {:.6}", i, grad_norm);
        assert!(grad_norm.is_finite() && grad_norm < 1e6, "parameter {} gradients exploded", i);
    }

    model.zero_grad();
    assert!(model.parameters().iter().all(|p| p.grad().is_none()));
}

// ============================================================================
// Test: Numerical Stability
// ============================================================================

#[test]
fn test_numerical_stability() {
    eprintln!("\n=== Numerical Stability ===");

    let logits = Tensor::var(&[1000.0, 0.0, -1000.0], [1, 3], &config()).unwrap();
    let probs = softmax(&logits).unwrap().to_vec().unwrap();
    assert!(probs.iter().all(|p| p.is_finite()));
    assert!((probs.iter().sum::<f64>() - 1.0).abs() < 1e-6);

    let log_probs = log_softmax(&logits).unwrap().to_vec().unwrap();
    assert!(log_probs.iter().all(|p| p.is_finite()));

    let loss = cross_entropy(&logits, &[2]).unwrap();
    loss.backward().unwrap();
    assert!(loss.item().unwrap().is_finite());
    assert!(logits.grad().unwrap().to_vec().unwrap().iter().all(|g| g.is_finite()));

    let extreme = Tensor::var(&[-50.0, 0.0, 50.0], [3], &config()).unwrap();
    let targets = Tensor::constant(&[0.0, 0.5, 1.0], [3], &config()).unwrap();
    let bce = binary_cross_entropy_with_logits(&extreme, &targets).unwrap();
    assert!(bce.item().unwrap().is_finite(), "BCE should be finite");
}

// ============================================================================
// Test: Execution modes and dtypes
// ============================================================================

fn train_steps(config: &Config, steps: usize) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(99);
    let mut model = mlp(&[3, 5, 1], &mut rng, config);
    let x = Tensor::constant(&[0.1, -0.4, 0.9, 0.3, 0.8, -0.2], [2, 3], config).unwrap();
    let y = Tensor::constant(&[1.0, -1.0], [2, 1], config).unwrap();
    let mut opt = SGD::new(0.1);

    (0..steps)
        .map(|_| {
            let loss = mse_loss(&model.forward(&x).unwrap(), &y).unwrap();
            loss.backward().unwrap();
            opt.step(&mut model.parameters_mut()).unwrap();
            loss.item().unwrap()
        })
        .collect()
}

#[test]
fn test_eager_matches_lazy() {
    let lazy = train_steps(&config(), 20);
    let eager = train_steps(&config().with_mode(ExecutionMode::Eager), 20);
    assert_eq!(lazy, eager);
    assert!(lazy[19] < lazy[0]);
}

#[test]
fn test_float32_training() {
    let single = train_steps(&Config::new(cpu()), 20);
    let double = train_steps(&config(), 20);
    assert!(single[19] < single[0]);
    for (s, d) in single.iter().zip(&double) {
        assert!((s - d).abs() < 1e-3, "f32 {} vs f64 {}", s, d);
    }
}
