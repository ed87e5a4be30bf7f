use shadergrad::*;

fn approx_eq(a: f32, b: f32, epsilon: f32) -> bool {
    (a - b).abs() < epsilon
}

fn tensors_approx_eq(a: &[f32], b: &[f32], epsilon: f32) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b.iter())
        .all(|(x, y)| approx_eq(*x, *y, epsilon))
}

#[test]
fn test_identity_matmul_returns_input() {
    let mut g = Graph::new(GraphConfig::cpu());
    let x = g.input(&[2, 2], "x").unwrap();
    let w = g.tensor(&[2, 2], "w").unwrap();
    let b = g.tensor(&[2], "b").unwrap();
    g.set(x, &[1.0, 2.0, 3.0, 4.0]).unwrap();
    g.set(w, &[1.0, 0.0, 0.0, 1.0]).unwrap();
    g.fill(b, 0.0).unwrap();

    g.compile(add(matmul(x, w), b), &[2, 2]).unwrap();
    let out = g.run().unwrap();
    assert_eq!(out.output, vec![1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn test_matmul_values() {
    let mut g = Graph::new(GraphConfig::cpu());
    let a = g.input(&[2, 3], "a").unwrap();
    let b = g.input(&[3, 2], "b").unwrap();
    g.set(a, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
    g.set(b, &[7.0, 8.0, 9.0, 10.0, 11.0, 12.0]).unwrap();

    g.compile(matmul(a, b), &[2, 2]).unwrap();
    assert_eq!(g.infer().unwrap(), vec![58.0, 64.0, 139.0, 154.0]);
}

#[test]
fn test_sigmoid_bce_at_one_half() {
    let mut g = Graph::new(GraphConfig::cpu());
    let p = g.input(&[2], "p").unwrap();
    let y = g.input(&[2], "y").unwrap();
    g.set(p, &[0.5, 0.5]).unwrap();
    g.set(y, &[1.0, 0.0]).unwrap();

    g.compile(binary_cross_entropy(p, y), &[2]).unwrap();
    let out = g.run().unwrap();
    assert!(tensors_approx_eq(&out.output, &[0.693_147, 0.693_147], 1e-4));

    // Through a sigmoid of zero logits as well
    let logits = g.tensor(&[2], "logits").unwrap();
    g.compile(binary_cross_entropy(sigmoid(logits), y), &[2]).unwrap();
    let out = g.run().unwrap();
    assert!(tensors_approx_eq(&out.output, &[0.693_147, 0.693_147], 1e-4));
    // dL/dlogit = σ(z) - y
    assert!(tensors_approx_eq(&out.gradients["logits"], &[-0.5, 0.5], 1e-4));
}

#[test]
fn test_softmax_rows_sum_to_one() {
    let mut g = Graph::new(GraphConfig::cpu());
    let x = g.input(&[3, 4], "x").unwrap();
    g.set(
        x,
        &[1.0, 2.0, 3.0, 4.0, -1.0, 0.0, 1.0, 100.0, 0.5, 0.5, 0.5, 0.5],
    )
    .unwrap();

    g.compile(softmax(x), &[3, 4]).unwrap();
    let out = g.infer().unwrap();
    for row in out.chunks(4) {
        assert!(approx_eq(row.iter().sum::<f32>(), 1.0, 1e-5));
        assert!(row.iter().all(|v| (0.0..=1.0).contains(v)));
    }
    assert!(tensors_approx_eq(&out[8..], &[0.25; 4], 1e-6));
}

#[test]
fn test_reductions_and_broadcasts() {
    let mut g = Graph::new(GraphConfig::cpu());
    let x = g.input(&[2, 3], "x").unwrap();
    g.set(x, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();

    g.compile(sum(x), &[2, 1]).unwrap();
    assert_eq!(g.infer().unwrap(), vec![6.0, 15.0]);

    g.compile(mean_axis0(x), &[1, 3]).unwrap();
    assert_eq!(g.infer().unwrap(), vec![2.5, 3.5, 4.5]);

    // Column broadcast: subtract each row's mean
    g.compile(sub(x, mean(x)), &[2, 3]).unwrap();
    assert_eq!(g.infer().unwrap(), vec![-1.0, 0.0, 1.0, -1.0, 0.0, 1.0]);

    // Scalar broadcast from a constant
    g.compile(mult(2.0, x), &[2, 3]).unwrap();
    assert_eq!(g.infer().unwrap(), vec![2.0, 4.0, 6.0, 8.0, 10.0, 12.0]);
}

#[test]
fn test_transpose_and_reshape() {
    let mut g = Graph::new(GraphConfig::cpu());
    let x = g.input(&[2, 3], "x").unwrap();
    g.set(x, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();

    g.compile(transpose(x), &[3, 2]).unwrap();
    assert_eq!(g.infer().unwrap(), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);

    // A bare leaf root still comes out of a kernel
    g.compile(x, &[6]).unwrap();
    assert_eq!(g.infer().unwrap(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

    assert!(matches!(
        g.compile(reshape(x, &[4]), &[4]),
        Err(GraphError::ShapeMismatch { op: "reshape", .. })
    ));
}

#[test]
fn test_layer_norm_normalizes_rows() {
    let mut g = Graph::new(GraphConfig::cpu());
    let x = g.input(&[2, 4], "x").unwrap();
    let gamma = g.tensor(&[4], "gamma").unwrap();
    let beta = g.tensor(&[4], "beta").unwrap();
    g.set(x, &[1.0, 2.0, 3.0, 4.0, 10.0, 20.0, 30.0, 40.0]).unwrap();
    g.fill(gamma, 1.0).unwrap();
    g.fill(beta, 0.0).unwrap();

    g.compile(layer_norm(x, gamma, beta), &[2, 4]).unwrap();
    let out = g.infer().unwrap();
    for row in out.chunks(4) {
        let mean = row.iter().sum::<f32>() / 4.0;
        let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / 4.0;
        assert!(approx_eq(mean, 0.0, 1e-5));
        assert!(approx_eq(var, 1.0, 1e-2));
    }
}

#[test]
fn test_batch_norm_normalizes_columns() {
    let mut g = Graph::new(GraphConfig::cpu());
    let x = g.input(&[4, 2], "x").unwrap();
    let gamma = g.tensor(&[2], "gamma").unwrap();
    let beta = g.tensor(&[2], "beta").unwrap();
    g.set(x, &[1.0, 10.0, 2.0, 20.0, 3.0, 30.0, 4.0, 40.0]).unwrap();
    g.fill(gamma, 2.0).unwrap();
    g.fill(beta, 1.0).unwrap();

    g.compile(batch_norm(x, gamma, beta), &[4, 2]).unwrap();
    let out = g.infer().unwrap();
    for col in 0..2 {
        let values: Vec<f32> = out.iter().skip(col).step_by(2).copied().collect();
        let mean = values.iter().sum::<f32>() / 4.0;
        assert!(approx_eq(mean, 1.0, 1e-5));
    }
}

#[test]
fn test_dropout_masks_training_runs_only() {
    let mut g = Graph::new(GraphConfig::cpu().with_seed(3));
    let x = g.tensor(&[64], "x").unwrap();
    g.fill(x, 1.0).unwrap();
    g.compile(dropout(x, 0.5), &[64]).unwrap();

    assert_eq!(g.infer().unwrap(), vec![1.0; 64]);

    let out = g.run().unwrap();
    assert!(out.output.iter().all(|&v| v == 0.0 || v == 2.0));
    assert!(out.output.iter().any(|&v| v == 0.0));
    assert!(out.output.iter().any(|&v| v == 2.0));
    // d(x·m)/dx = m
    assert_eq!(out.gradients["x"], out.output);
}

#[test]
fn test_updated_inputs_are_uploaded() {
    let mut g = Graph::new(GraphConfig::cpu());
    let x = g.input(&[3], "x").unwrap();
    g.compile(exp(x), &[3]).unwrap();
    assert_eq!(g.infer().unwrap(), vec![1.0; 3]);

    g.update_input(x, &[1.0, 0.0, 2.0]).unwrap();
    let out = g.infer().unwrap();
    assert!(tensors_approx_eq(&out, &[1.0f32.exp(), 1.0, 2.0f32.exp()], 1e-5));
}
