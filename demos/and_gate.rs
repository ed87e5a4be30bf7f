//! Train a 2-4-1 perceptron on the AND truth table and print the generated
//! kernels, the loss curve and the final predictions.
//!
//! ```bash
//! RUST_LOG=info cargo run --example and_gate
//! SHADERGRAD_DEVICE=cpu SHADERGRAD_DUMP_SHADERS=1 RUST_LOG=debug cargo run --example and_gate
//! ```

use shadergrad::{
    Graph, GraphConfig, Result, add, binary_cross_entropy, matmul, sigmoid, tanh,
};

const INPUTS: [f32; 8] = [0.0, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0];
const TARGETS: [f32; 4] = [0.0, 0.0, 0.0, 1.0];

fn main() -> Result<()> {
    env_logger::init();
    println!("=== AND Gate Example ===\n");

    let mut g = Graph::new(GraphConfig::default());
    let x = g.input(&[4, 2], "x")?;
    let y = g.input(&[4, 1], "y")?;
    let w1 = g.tensor(&[2, 4], "w1")?;
    let b1 = g.tensor(&[4], "b1")?;
    let w2 = g.tensor(&[4, 1], "w2")?;
    let b2 = g.tensor(&[1], "b2")?;
    g.xavier_init(w1)?;
    g.xavier_init(w2)?;
    g.set(x, &INPUTS)?;
    g.set(y, &TARGETS)?;

    // Input(2) -> Tanh(4) -> Sigmoid(1), per-sample binary cross-entropy
    let hidden = tanh(add(matmul(x, w1), b1));
    let pred = sigmoid(add(matmul(hidden, w2), b2));
    g.compile(binary_cross_entropy(&pred, y), &[4, 1])?;

    let sources = g.kernel_sources()?;
    println!(
        "Compiled {} kernels on the {} runtime:",
        sources.len(),
        g.runtime_name()?
    );
    for source in sources {
        println!(
            "  {:<14} reads {:?} writes {:?}",
            source.label, source.inputs, source.outputs
        );
    }
    println!();

    let num_epochs = 2000;
    let learning_rate = 0.01;
    for epoch in 0..num_epochs {
        let out = g.run()?;
        g.learn_all(learning_rate);
        if epoch % 500 == 499 {
            let loss = out.output.iter().sum::<f32>() / out.output.len() as f32;
            println!("Epoch {:4}: loss = {loss:.6}", epoch + 1);
        }
    }

    g.compile(&pred, &[4, 1])?;
    let predictions = g.infer()?;
    println!("\n=== Training Complete ===");
    for (i, p) in predictions.iter().enumerate() {
        println!(
            "  {} AND {} -> {p:.4} (target {})",
            INPUTS[2 * i],
            INPUTS[2 * i + 1],
            TARGETS[i]
        );
    }
    Ok(())
}
