//! XOR problem training example.
//!
//! Demonstrates training a small MLP to learn the XOR function, with the
//! whole dataset as one batch and memory reported before and after.
//! XOR is a classic non-linearly separable problem that requires hidden layers.

use tg_backend_cpu::cpu_engine_with;
use tg_nn::{mse_loss, Linear, Optimizer, Sgd};
use tg_tensor::prelude::*;

fn main() -> Result<()> {
    let e = cpu_engine_with(EngineConfig::from_env())?;
    println!("Backend: {}", e.backend_name());

    // XOR dataset, one row per example
    let x = e.tensor2d(&[0.0, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0], 4, 2)?;
    let y = e.tensor2d(&[0.0, 1.0, 1.0, 0.0], 4, 1)?;

    // 2 -> 16 -> 1
    let layer1 = Linear::new(&e, "hidden", 2, 16, true)?;
    let layer2 = Linear::new(&e, "output", 16, 1, true)?;
    let predict = |x: &Tensor| -> Result<Tensor> {
        let h = e.tanh(&layer1.forward(&e, x)?)?;
        layer2.forward(&e, &h)
    };

    let mut opt = Sgd::with_momentum(0.1, 0.9);
    println!("Training XOR network...\n");

    for epoch in 0..2000 {
        let cost = opt.minimize(&e, || mse_loss(&e, &predict(&x)?, &y), None, epoch % 200 == 0);
        if let Some(cost) = cost? {
            println!("Epoch {:4}: loss = {:.6}", epoch, e.item(&cost)?);
            e.dispose(&cost)?;
        }
    }
    println!("\nMemory after training: {:?}", e.memory());

    // Test the trained network
    println!("\nTesting trained network:");
    println!("========================");

    let outputs = e.tidy(|| predict(&x))?;
    let inputs = e.to_vec(&x)?;
    let targets = e.to_vec(&y)?;
    let mut correct = 0;
    for ((input, &target), output) in inputs.chunks(2).zip(&targets).zip(e.to_vec(&outputs)?) {
        println!(
            "Input: [{:.0}, {:.0}] -> Output: {:.4} (target: {:.0})",
            input[0], input[1], output, target
        );
        // output > 0.5 means 1, else 0
        let predicted_class = if output > 0.5 { 1.0 } else { 0.0 };
        if (predicted_class - target).abs() < 0.01 {
            correct += 1;
        }
    }

    println!("\nAccuracy: {}/4", correct);
    if correct == 4 {
        println!("Successfully learned XOR!");
    }

    opt.dispose(&e)?;
    layer1.dispose(&e)?;
    layer2.dispose(&e)?;
    e.dispose(&(x, y, outputs))?;
    println!("Memory after cleanup: {:?}", e.memory());
    Ok(())
}
