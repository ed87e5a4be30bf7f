//! The wgpu runtime against the CPU interpreter on the same graphs.
//! Every test returns early when no adapter is available.
use shadergrad::*;

const TOL: f32 = 1e-4;

fn assert_close(gpu: &[f32], cpu: &[f32], what: &str) {
    assert_eq!(gpu.len(), cpu.len(), "{what}: length");
    for (i, (a, b)) in gpu.iter().zip(cpu).enumerate() {
        assert!(
            (a - b).abs() <= TOL * (1.0 + b.abs()),
            "{what}[{i}]: gpu {a} vs cpu {b}"
        );
    }
}

/// Build the same graph on both devices and compare one training run
fn compare(build: impl Fn(&mut Graph) -> (Builder, Vec<usize>)) {
    if !is_gpu_available() {
        println!("Skipping GPU test - no GPU available");
        return;
    }

    let mut results = Vec::new();
    for device in [Device::Gpu, Device::Cpu] {
        let config = GraphConfig::default().with_device(device).with_seed(5);
        let mut g = Graph::new(config);
        let (root, shape) = build(&mut g);
        g.compile(root, &shape).unwrap();
        let expected = if device == Device::Gpu { "gpu" } else { "cpu" };
        assert_eq!(g.runtime_name().unwrap(), expected);
        results.push((g.run().unwrap(), g.infer().unwrap()));
    }

    let (gpu, cpu) = (&results[0], &results[1]);
    assert_close(&gpu.0.output, &cpu.0.output, "output");
    assert_close(&gpu.1, &cpu.1, "inference");
    for (name, grad) in &cpu.0.gradients {
        assert_close(&gpu.0.gradients[name], grad, name);
    }
}

#[test]
fn test_gpu_available() {
    // Only checks that initialization does not panic
    let available = is_gpu_available();
    println!("GPU available: {available}");
    if let Some(ctx) = get_gpu_context() {
        println!("adapter: {}", ctx.device_name());
    }
}

#[test]
fn test_gpu_mlp_matches_cpu() {
    compare(|g| {
        let x = g.input(&[8, 3], "x").unwrap();
        let y = g.input(&[8, 2], "y").unwrap();
        let w1 = g.tensor(&[3, 5], "w1").unwrap();
        let b1 = g.tensor(&[5], "b1").unwrap();
        let w2 = g.tensor(&[5, 2], "w2").unwrap();
        g.init(x, Init::Uniform { low: -1.0, high: 1.0 }).unwrap();
        g.init(y, Init::Uniform { low: 0.0, high: 1.0 }).unwrap();
        g.xavier_init(w1).unwrap();
        g.fill(b1, 0.1).unwrap();
        g.he_init(w2).unwrap();

        let hidden = relu(add(matmul(x, w1), b1));
        let pred = sigmoid(matmul(hidden, w2));
        (binary_cross_entropy(pred, y), vec![8, 2])
    });
}

#[test]
fn test_gpu_softmax_and_norms_match_cpu() {
    compare(|g| {
        let x = g.tensor(&[4, 6], "x").unwrap();
        let gamma = g.tensor(&[6], "gamma").unwrap();
        let beta = g.tensor(&[6], "beta").unwrap();
        let c = g.input(&[4, 6], "c").unwrap();
        g.init(x, Init::Normal).unwrap();
        g.fill(gamma, 1.0).unwrap();
        g.init(c, Init::Uniform { low: -1.0, high: 1.0 }).unwrap();

        let normed = batch_norm(layer_norm(x, gamma, beta), gamma, beta);
        (mult(softmax(normed), c), vec![4, 6])
    });
}

#[test]
fn test_gpu_reductions_and_broadcasts_match_cpu() {
    compare(|g| {
        let w = g.tensor(&[5, 7], "w").unwrap();
        let col = g.tensor(&[5, 1], "col").unwrap();
        g.init(w, Init::Uniform { low: -1.0, high: 1.0 }).unwrap();
        g.init(col, Init::Uniform { low: -1.0, high: 1.0 }).unwrap();

        let shifted = sub(tanh(add(w, col)), mean_axis0(w));
        (add(transpose(shifted), 0.5), vec![7, 5])
    });
}

#[test]
fn test_gpu_large_output_spans_workgroups() {
    compare(|g| {
        let a = g.tensor(&[300], "a").unwrap();
        let b = g.tensor(&[300], "b").unwrap();
        g.init(a, Init::Uniform { low: 0.5, high: 2.0 }).unwrap();
        g.init(b, Init::Normal).unwrap();
        (mult(log(a), exp(b)), vec![300])
    });
}
