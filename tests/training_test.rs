use shadergrad::*;

const AND_INPUTS: [f32; 8] = [0.0, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0];
const AND_TARGETS: [f32; 4] = [0.0, 0.0, 0.0, 1.0];

#[test]
fn test_and_gate_learns() {
    let mut g = Graph::new(GraphConfig::cpu().with_seed(42));
    let x = g.input(&[4, 2], "x").unwrap();
    let y = g.input(&[4, 1], "y").unwrap();
    let w1 = g.tensor(&[2, 4], "w1").unwrap();
    let b1 = g.tensor(&[4], "b1").unwrap();
    let w2 = g.tensor(&[4, 1], "w2").unwrap();
    let b2 = g.tensor(&[1], "b2").unwrap();
    g.xavier_init(w1).unwrap();
    g.xavier_init(w2).unwrap();
    g.set(x, &AND_INPUTS).unwrap();
    g.set(y, &AND_TARGETS).unwrap();

    let hidden = tanh(add(matmul(x, w1), b1));
    let pred = sigmoid(add(matmul(hidden, w2), b2));
    g.compile(binary_cross_entropy(&pred, y), &[4, 1]).unwrap();

    let mean_loss = |loss: &[f32]| loss.iter().sum::<f32>() / loss.len() as f32;
    let initial = mean_loss(&g.run().unwrap().output);

    let mut last = initial;
    for epoch in 0..2000 {
        let out = g.run().unwrap();
        last = mean_loss(&out.output);
        assert!(last.is_finite(), "loss diverged at epoch {epoch}");
        g.learn_all(0.01);
    }
    assert!(last < initial);
    assert!(last < 0.05, "final loss {last}");

    // Recompiling the prediction keeps the trained parameters
    g.compile(&pred, &[4, 1]).unwrap();
    let predictions = g.infer().unwrap();
    for (p, t) in predictions.iter().zip(AND_TARGETS) {
        assert_eq!(*p > 0.5, t > 0.5, "prediction {p} for target {t}");
    }
}

#[test]
fn test_learn_moves_against_the_gradient() {
    let mut g = Graph::new(GraphConfig::cpu());
    let w = g.tensor(&[3], "w").unwrap();
    let t = g.input(&[3], "t").unwrap();
    g.set(w, &[1.0, 2.0, 3.0]).unwrap();
    g.compile(mean_squared_error(w, t), &[3]).unwrap();

    g.run().unwrap();
    assert_eq!(g.gradient(w).unwrap(), &[2.0, 4.0, 6.0]);
    g.learn(w, 0.25).unwrap();
    assert_eq!(g.tensor_value(w).unwrap(), &[0.5, 1.0, 1.5]);

    // The step is uploaded before the next run
    let out = g.run().unwrap();
    assert_eq!(out.output, vec![0.25, 1.0, 2.25]);
}
