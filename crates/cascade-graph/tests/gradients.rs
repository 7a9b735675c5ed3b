//! Gradient graphs checked against central finite differences.

use cascade_core::{DType, Shape};
use cascade_device::Device;
use cascade_graph::{build_back_propagation_graph, ops, Context, ContextRef, NodeRef};

fn assert_close(a: &[f64], b: &[f64], tol: f64) {
    assert_eq!(a.len(), b.len(), "length mismatch: {:?} vs {:?}", a, b);
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        assert!(
            (x - y).abs() <= tol * (1.0 + y.abs()),
            "element {}: {} vs {} (tol {})",
            i,
            x,
            y,
            tol
        );
    }
}

fn eval_f64(ctx: &ContextRef, node: &NodeRef) -> Vec<f64> {
    ctx.eval(&[node.clone()]).unwrap()[0].to_f64_vec().unwrap()
}

/// d loss / d var by central differences, one element at a time.
fn numeric_gradient(ctx: &ContextRef, loss: &NodeRef, var: &NodeRef, value: &[f64]) -> Vec<f64> {
    let h = 1e-6;
    let mut grad = Vec::with_capacity(value.len());
    let mut shifted = value.to_vec();
    for i in 0..value.len() {
        shifted[i] = value[i] + h;
        ctx.init(var, &shifted, var.shape()).unwrap();
        let up = eval_f64(ctx, loss)[0];
        shifted[i] = value[i] - h;
        ctx.init(var, &shifted, var.shape()).unwrap();
        let down = eval_f64(ctx, loss)[0];
        shifted[i] = value[i];
        grad.push((up - down) / (2.0 * h));
    }
    ctx.init(var, value, var.shape()).unwrap();
    grad
}

fn setup() -> ContextRef {
    Context::make_for_device(&Device::host().unwrap())
}

#[test]
fn broadcast_gradient_sums_over_the_broadcast_dimension() {
    let ctx = setup();
    let x1 = ops::variable("x1", Shape::new(&[2, 3]), DType::F64);
    let x2 = ops::variable("x2", Shape::new(&[3]), DType::F64);
    let w = ops::variable("w", Shape::new(&[2, 3]), DType::F64);
    let y = ops::plus(&x1, &x2).unwrap();
    let loss = ops::reduce_sum(&ops::multiply(&y, &w).unwrap(), &[], false).unwrap();

    ctx.init(&x1, &[0.5f64, -1.0, 2.0, 3.0, 0.0, 1.5], x1.shape()).unwrap();
    ctx.init(&x2, &[1.0f64, 2.0, 3.0], x2.shape()).unwrap();
    ctx.init(&w, &[1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0], w.shape()).unwrap();

    let grads = build_back_propagation_graph(&loss, &[x1.clone(), x2.clone()]).unwrap();
    assert!(grads.get(&w).is_none());

    // dL/dy = w, so dL/dx2 is w summed over the leading dimension.
    let dx1 = eval_f64(&ctx, grads.get(&x1).unwrap());
    let dx2 = eval_f64(&ctx, grads.get(&x2).unwrap());
    assert_close(&dx1, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 0.0);
    assert_close(&dx2, &[5.0, 7.0, 9.0], 0.0);
}

#[test]
fn multiply_divide_chain_matches_finite_differences() {
    let ctx = setup();
    let x1 = ops::variable("x1", Shape::new(&[2, 3]), DType::F64);
    let x2 = ops::variable("x2", Shape::new(&[3]), DType::F64);
    let c = ops::fill(Shape::new(&[1]), DType::F64, 4.0);

    // mean(x1 * x2 / (x2 + 4) - x1 / x2)
    let num = ops::multiply(&x1, &x2).unwrap();
    let den = ops::plus(&x2, &c).unwrap();
    let ratio = ops::divide(&num, &den).unwrap();
    let y = ops::minus(&ratio, &ops::divide(&x1, &x2).unwrap()).unwrap();
    let loss = ops::reduce_mean(&y, &[], false).unwrap();

    let v1 = [0.3, -1.2, 2.0, 1.1, 0.7, -0.4];
    let v2 = [1.5, 2.5, -0.8];
    ctx.init(&x1, &v1, x1.shape()).unwrap();
    ctx.init(&x2, &v2, x2.shape()).unwrap();

    let grads = build_back_propagation_graph(&loss, &[x1.clone(), x2.clone()]).unwrap();
    let dx1 = eval_f64(&ctx, grads.get(&x1).unwrap());
    let dx2 = eval_f64(&ctx, grads.get(&x2).unwrap());

    assert_close(&dx1, &numeric_gradient(&ctx, &loss, &x1, &v1), 1e-5);
    assert_close(&dx2, &numeric_gradient(&ctx, &loss, &x2, &v2), 1e-5);
}

#[test]
fn unary_reshape_and_reductions_match_finite_differences() {
    let ctx = setup();
    let x = ops::variable("x", Shape::new(&[2, 3]), DType::F64);
    let s = ops::variable("s", Shape::scalar(), DType::F64);

    // sum(reduce_mean(reshape(-x * s, (3, 2)), [1]) * 0.5 / s)
    let scaled = ops::multiply(&ops::negate(&x), &s).unwrap();
    let reshaped = ops::reshape(&scaled, &[3, -1]).unwrap();
    let rows = ops::reduce_mean(&reshaped, &[1], true).unwrap();
    let halved = ops::scale(&rows, 0.5);
    let per_s = ops::divide(&halved, &s).unwrap();
    let loss = ops::reduce_sum(&ops::multiply(&per_s, &per_s).unwrap(), &[], false).unwrap();

    let vx = [1.0, 2.0, -0.5, 0.25, 3.0, -2.0];
    let vs = [1.7];
    ctx.init(&x, &vx, x.shape()).unwrap();
    ctx.init(&s, &vs, s.shape()).unwrap();

    let grads = build_back_propagation_graph(&loss, &[x.clone(), s.clone()]).unwrap();
    let dx = eval_f64(&ctx, grads.get(&x).unwrap());
    let ds = eval_f64(&ctx, grads.get(&s).unwrap());
    assert_eq!(grads.get(&s).unwrap().shape(), &Shape::scalar());

    assert_close(&dx, &numeric_gradient(&ctx, &loss, &x, &vx), 1e-5);
    assert_close(&ds, &numeric_gradient(&ctx, &loss, &s, &vs), 1e-5);
}

#[test]
fn repeated_operand_gradient() {
    let ctx = setup();
    let x = ops::variable("x", Shape::new(&[3]), DType::F64);
    // d/dx sum(x * x) = 2x
    let loss = ops::reduce_sum(&ops::multiply(&x, &x).unwrap(), &[], false).unwrap();
    ctx.init(&x, &[1.0f64, -2.0, 0.5], x.shape()).unwrap();
    let grads = build_back_propagation_graph(&loss, &[x.clone()]).unwrap();
    assert_close(&eval_f64(&ctx, grads.get(&x).unwrap()), &[2.0, -4.0, 1.0], 0.0);
}

#[test]
fn gradients_of_a_gradient_graph_evaluate_on_another_pass() {
    let ctx = setup();
    let x = ops::variable("x", Shape::new(&[2]), DType::F32);
    let loss = ops::reduce_sum(&ops::scale(&x, 3.0), &[], false).unwrap();
    ctx.init(&x, &[1.0f32, 1.0], x.shape()).unwrap();
    let grads = build_back_propagation_graph(&loss, &[x.clone()]).unwrap();
    let dx = grads.get(&x).unwrap().clone();

    // Loss and gradient evaluated together share one pass.
    let out = ctx.eval(&[loss, dx]).unwrap();
    assert_eq!(out[0].to_vec::<f32>().unwrap(), vec![6.0]);
    assert_eq!(out[1].to_vec::<f32>().unwrap(), vec![3.0, 3.0]);
}
