//! XOR problem training example.
//!
//! Demonstrates training a simple MLP to learn the XOR function.
//! XOR is a classic non-linearly separable problem that requires hidden layers.

use rand::rngs::StdRng;
use rand::SeedableRng;

use needle_backend_cpu::cpu;
use needle_nn::{mse_loss, Linear, Module, Optimizer, Sequential, Tanh, SGD};
use needle_tensor::prelude::*;

fn main() -> Result<()> {
    let config = Config::new(cpu()).with_dtype(DType::Float64);
    let mut rng = StdRng::seed_from_u64(0);

    // XOR dataset as one batch of 4
    let x = Tensor::constant(&[0.0, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0], [4, 2], &config)?;
    let y = Tensor::constant(&[0.0, 1.0, 1.0, 0.0], [4, 1], &config)?;

    // 2 -> 16 -> 1
    let mut model = Sequential::new()
        .add(Linear::new(2, 16, true, &mut rng, &config)?)
        .add(Tanh)
        .add(Linear::new(16, 1, true, &mut rng, &config)?);
    let mut opt = SGD::with_momentum(0.1, 0.9);

    println!("Training XOR network ({} parameters)...\n", model.num_parameters());

    for epoch in 0..1000 {
        let loss = mse_loss(&model.forward(&x)?, &y)?;
        loss.backward()?;
        opt.step(&mut model.parameters_mut())?;

        if epoch % 200 == 0 {
            println!("Epoch {:4}: loss = {:.6}", epoch, loss.item()?);
        }
    }

    println!("\nFinal predictions:");
    let outputs = model.forward(&x)?.to_vec()?;
    let inputs = x.to_vec()?;
    for ((input, output), target) in inputs.chunks(2).zip(&outputs).zip(y.to_vec()?) {
        let predicted = if *output > 0.5 { 1.0 } else { 0.0 };
        println!(
            "  [{}, {}] -> {:.4} (predicted: {}, target: {})",
            input[0], input[1], output, predicted, target
        );
    }

    Ok(())
}
