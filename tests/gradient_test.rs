//! Analytic gradients from the backward kernels against central differences
//! of the summed forward output.
use shadergrad::*;

const EPS: f32 = 1e-2;
const TOL: f32 = 1e-2;

fn summed(g: &mut Graph) -> f64 {
    g.infer().unwrap().iter().map(|&v| f64::from(v)).sum()
}

fn check_gradients(g: &mut Graph, params: &[TensorId]) {
    let analytic = g.run().unwrap().gradients;
    for &p in params {
        let name = g.get(p).unwrap().name.clone();
        let base = g.tensor_value(p).unwrap().to_vec();
        let grad = &analytic[&name];
        assert_eq!(grad.len(), base.len());

        for i in 0..base.len() {
            let mut shifted = base.clone();
            shifted[i] = base[i] + EPS;
            g.set(p, &shifted).unwrap();
            let plus = summed(g);
            shifted[i] = base[i] - EPS;
            g.set(p, &shifted).unwrap();
            let minus = summed(g);
            g.set(p, &base).unwrap();

            let numeric = ((plus - minus) / (2.0 * f64::from(EPS))) as f32;
            assert!(
                (grad[i] - numeric).abs() <= TOL * (1.0 + numeric.abs()),
                "{name}[{i}]: analytic {} vs numeric {numeric}",
                grad[i]
            );
        }
    }
}

fn seeded() -> Graph {
    Graph::new(GraphConfig::cpu().with_seed(7))
}

fn uniform(g: &mut Graph, id: TensorId, low: f32, high: f32) {
    g.init(id, Init::Uniform { low, high }).unwrap();
}

#[test]
fn test_linear_sigmoid_mse() {
    let mut g = seeded();
    let x = g.input(&[4, 3], "x").unwrap();
    let t = g.input(&[4, 2], "t").unwrap();
    let w = g.tensor(&[3, 2], "w").unwrap();
    let b = g.tensor(&[2], "b").unwrap();
    uniform(&mut g, x, -1.0, 1.0);
    uniform(&mut g, t, 0.0, 1.0);
    g.xavier_init(w).unwrap();
    uniform(&mut g, b, -0.1, 0.1);

    let pred = sigmoid(add(matmul(x, w), b));
    g.compile(mean_squared_error(pred, t), &[4, 2]).unwrap();
    check_gradients(&mut g, &[w, b]);
}

#[test]
fn test_mse_gradient_is_twice_the_error() {
    for batch in [2, 4] {
        let mut g = seeded();
        let p = g.tensor(&[batch, 1], "p").unwrap();
        let t = g.input(&[batch, 1], "t").unwrap();
        let pv: Vec<f32> = (0..batch).map(|i| i as f32 * 0.5).collect();
        let tv: Vec<f32> = (0..batch).map(|i| 1.0 - i as f32).collect();
        g.set(p, &pv).unwrap();
        g.set(t, &tv).unwrap();

        g.compile(mean_squared_error(p, t), &[batch, 1]).unwrap();
        let out = g.run().unwrap();
        for i in 0..batch {
            let expected = 2.0 * (pv[i] - tv[i]);
            assert!((out.gradients["p"][i] - expected).abs() < 1e-5);
        }
        // Inputs are never differentiated
        assert!(!out.gradients.contains_key("t"));
        assert!(g.gradient(t).unwrap().iter().all(|&v| v == 0.0));
    }
}

#[test]
fn test_transpose() {
    let mut g = seeded();
    let x = g.input(&[3, 4], "x").unwrap();
    let w = g.tensor(&[3, 2], "w").unwrap();
    let v = g.tensor(&[2, 3], "v").unwrap();
    uniform(&mut g, x, -1.0, 1.0);
    uniform(&mut g, w, -1.0, 1.0);
    uniform(&mut g, v, -1.0, 1.0);

    // Permuted reads of a leaf and of a computed node
    let leaf = tanh(matmul(transpose(w), x));
    let computed = mult(transpose(tanh(v)), w);
    g.compile(leaf, &[2, 4]).unwrap();
    check_gradients(&mut g, &[w]);

    g.compile(computed, &[3, 2]).unwrap();
    check_gradients(&mut g, &[w, v]);
}

#[test]
fn test_softmax_cross_entropy() {
    let mut g = seeded();
    let x = g.input(&[3, 2], "x").unwrap();
    let y = g.input(&[3, 4], "y").unwrap();
    let w = g.tensor(&[2, 4], "w").unwrap();
    uniform(&mut g, x, -1.0, 1.0);
    g.set(
        y,
        &[1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0],
    )
    .unwrap();
    g.xavier_init(w).unwrap();

    g.compile(cross_entropy(softmax(matmul(x, w)), y), &[3, 4]).unwrap();
    check_gradients(&mut g, &[w]);
}

#[test]
fn test_softmax_with_weighted_output() {
    let mut g = seeded();
    let z = g.tensor(&[2, 3], "z").unwrap();
    let c = g.input(&[2, 3], "c").unwrap();
    g.set(z, &[0.1, -0.4, 0.7, 1.2, 0.0, -0.3]).unwrap();
    g.set(c, &[1.0, 2.0, 3.0, -1.0, 0.5, 2.0]).unwrap();

    g.compile(mult(softmax(z), c), &[2, 3]).unwrap();
    check_gradients(&mut g, &[z]);
}

#[test]
fn test_layer_norm() {
    let mut g = seeded();
    let x = g.tensor(&[3, 4], "x").unwrap();
    let gamma = g.tensor(&[4], "gamma").unwrap();
    let beta = g.tensor(&[4], "beta").unwrap();
    let c = g.input(&[3, 4], "c").unwrap();
    g.set(
        x,
        &[0.9, -0.6, 0.3, -1.2, 1.5, 0.2, -0.7, 0.4, -1.0, 0.8, 1.1, -0.5],
    )
    .unwrap();
    g.set(gamma, &[1.0, 0.5, 1.5, 0.8]).unwrap();
    g.set(beta, &[0.1, -0.2, 0.0, 0.3]).unwrap();
    uniform(&mut g, c, -1.0, 1.0);

    // Weighted so the sum does not cancel the normalization
    g.compile(mult(layer_norm(x, gamma, beta), c), &[3, 4]).unwrap();
    check_gradients(&mut g, &[x, gamma, beta]);
}

#[test]
fn test_batch_norm() {
    let mut g = seeded();
    let x = g.tensor(&[4, 3], "x").unwrap();
    let gamma = g.tensor(&[3], "gamma").unwrap();
    let beta = g.tensor(&[3], "beta").unwrap();
    let c = g.input(&[4, 3], "c").unwrap();
    g.set(
        x,
        &[0.9, -0.6, 0.3, -1.2, 1.5, 0.2, -0.7, 0.4, -1.0, 0.8, 1.1, -0.5],
    )
    .unwrap();
    g.set(gamma, &[1.0, 0.5, 1.5]).unwrap();
    g.set(beta, &[0.1, -0.2, 0.0]).unwrap();
    uniform(&mut g, c, -1.0, 1.0);

    g.compile(mult(batch_norm(x, gamma, beta), c), &[4, 3]).unwrap();
    check_gradients(&mut g, &[x, gamma, beta]);
}

#[test]
fn test_reductions() {
    let mut g = seeded();
    let w = g.tensor(&[3, 4], "w").unwrap();
    let c = g.input(&[3, 4], "c").unwrap();
    uniform(&mut g, w, -1.0, 1.0);
    uniform(&mut g, c, -1.0, 1.0);

    g.compile(sum(mult(w, w)), &[3, 1]).unwrap();
    check_gradients(&mut g, &[w]);

    g.compile(exp(mean(tanh(w))), &[3, 1]).unwrap();
    check_gradients(&mut g, &[w]);

    g.compile(tanh(sum_axis0(mult(w, c))), &[1, 4]).unwrap();
    check_gradients(&mut g, &[w]);

    g.compile(mean_axis0(sigmoid(w)), &[1, 4]).unwrap();
    check_gradients(&mut g, &[w]);

    g.compile(dot(tanh(w), c), &[3, 1]).unwrap();
    check_gradients(&mut g, &[w]);
}

#[test]
fn test_div_and_sub() {
    let mut g = seeded();
    let a = g.tensor(&[2, 3], "a").unwrap();
    let b = g.tensor(&[2, 3], "b").unwrap();
    uniform(&mut g, a, -1.0, 1.0);
    uniform(&mut g, b, -1.0, 1.0);

    g.compile(div(sub(a, &sigmoid(b)), add(mult(b, b), 1.0)), &[2, 3])
        .unwrap();
    check_gradients(&mut g, &[a, b]);
}

#[test]
fn test_broadcast_gradients_fold_back() {
    let mut g = seeded();
    let w = g.tensor(&[3, 4], "w").unwrap();
    let col = g.tensor(&[3, 1], "col").unwrap();
    let row = g.tensor(&[4], "row").unwrap();
    let s = g.tensor(&[1], "s").unwrap();
    uniform(&mut g, w, -1.0, 1.0);
    uniform(&mut g, col, -1.0, 1.0);
    uniform(&mut g, row, -1.0, 1.0);
    g.set(s, &[0.7]).unwrap();

    g.compile(tanh(mult(add(add(w, col), row), s)), &[3, 4]).unwrap();
    check_gradients(&mut g, &[w, col, row, s]);

    // Broadcast operands produced inside the graph
    g.compile(sub(tanh(w), mean(tanh(w))), &[3, 4]).unwrap();
    check_gradients(&mut g, &[w]);
}

#[test]
fn test_residual_fan_in() {
    let mut g = seeded();
    let x = g.input(&[2, 3], "x").unwrap();
    let w1 = g.tensor(&[3, 3], "w1").unwrap();
    let w2 = g.tensor(&[3, 3], "w2").unwrap();
    uniform(&mut g, x, -1.0, 1.0);
    g.xavier_init(w1).unwrap();
    g.xavier_init(w2).unwrap();

    let h = tanh(matmul(x, w1));
    let root = sigmoid(add(matmul(&h, w2), &h));
    g.compile(root, &[2, 3]).unwrap();
    check_gradients(&mut g, &[w1, w2]);
}

#[test]
fn test_parameter_used_twice() {
    let mut g = seeded();
    let x = g.input(&[2, 2], "x").unwrap();
    let w = g.tensor(&[2, 2], "w").unwrap();
    uniform(&mut g, x, -1.0, 1.0);
    uniform(&mut g, w, -1.0, 1.0);

    g.compile(add(matmul(matmul(x, w), w), mult(w, 0.5)), &[2, 2]).unwrap();
    check_gradients(&mut g, &[w]);
}

#[test]
fn test_positive_domain_unaries() {
    let mut g = seeded();
    let w = g.tensor(&[2, 3], "w").unwrap();
    uniform(&mut g, w, 0.5, 2.0);

    g.compile(add(log(w), mult(sqrt(w), exp(w))), &[2, 3]).unwrap();
    check_gradients(&mut g, &[w]);
}

#[test]
fn test_relu_family_away_from_zero() {
    let mut g = seeded();
    let w = g.tensor(&[6], "w").unwrap();
    g.set(w, &[-1.5, -0.6, -0.2, 0.3, 0.8, 1.7]).unwrap();

    g.compile(add(mult(relu(w), w), leaky_relu(w, 0.1)), &[6]).unwrap();
    check_gradients(&mut g, &[w]);

    let out = g.run().unwrap();
    let expected = [0.1, 0.1, 0.1, 1.6, 2.6, 4.4];
    for (grad, e) in out.gradients["w"].iter().zip(expected) {
        assert!((grad - e).abs() < 1e-5);
    }
}

#[test]
fn test_dropout_gradient_follows_mask() {
    let mut g = Graph::new(GraphConfig::cpu().with_seed(11));
    let w = g.tensor(&[32], "w").unwrap();
    uniform(&mut g, w, -1.0, 1.0);

    g.compile(dropout(mult(w, w), 0.25), &[32]).unwrap();
    let out = g.run().unwrap();
    let value = g.tensor_value(w).unwrap();
    for i in 0..32 {
        let kept = out.output[i] != 0.0;
        let expected = if kept { 2.0 * value[i] / 0.75 } else { 0.0 };
        assert!((out.gradients["w"][i] - expected).abs() < 1e-4);
    }
}
