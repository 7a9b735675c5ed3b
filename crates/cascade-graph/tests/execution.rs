use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use cascade_core::{CascadeError, DType, Result, Shape};
use cascade_device::{Device, MultiArrayRef};
use cascade_graph::{
    build_back_propagation_graph, ops, Context, CustomOp, ExecutionCache, Executor, NodeRef,
};

/// Identity that counts how often it runs.
#[derive(Debug)]
struct Counted {
    calls: Arc<AtomicUsize>,
}

impl CustomOp for Counted {
    fn name(&self) -> &str {
        "counted"
    }

    fn forward(&self, device: &Device, inputs: &[MultiArrayRef]) -> Result<MultiArrayRef> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        cascade_device::ops::scale(device, &inputs[0], 1.0)
    }

    fn participates_in_differentiation(&self) -> bool {
        true
    }

    fn apply_chain_rule(
        &self,
        _index: usize,
        grad: &NodeRef,
        _inputs: &[NodeRef],
    ) -> Result<Option<NodeRef>> {
        Ok(Some(Arc::clone(grad)))
    }
}

fn counted(input: &NodeRef) -> (NodeRef, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let op = Arc::new(Counted {
        calls: Arc::clone(&calls),
    });
    let node = ops::custom(op, &[input.clone()], input.shape().clone(), input.dtype());
    (node, calls)
}

#[test]
fn shared_subexpression_runs_once_per_pass() {
    let ctx = Context::make_for_device(&Device::host().unwrap());
    let x = ops::variable("x", Shape::new(&[3]), DType::F32);
    ctx.init(&x, &[1.0f32, 2.0, 3.0], x.shape()).unwrap();

    let (shared, calls) = counted(&x);
    let left = ops::plus(&shared, &shared).unwrap();
    let right = ops::multiply(&shared, &x).unwrap();
    let total = ops::plus(&left, &right).unwrap();

    let exec = Executor::new(Arc::clone(&ctx), vec![total.clone(), left.clone()]);
    let out = exec.run().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(out[0].to_vec::<f32>().unwrap(), vec![3.0, 8.0, 15.0]);
    assert_eq!(out[1].to_vec::<f32>().unwrap(), vec![2.0, 4.0, 6.0]);

    exec.run().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn cache_spanning_runs_skips_recomputation() {
    let ctx = Context::make_for_device(&Device::host().unwrap());
    let x = ops::variable("x", Shape::new(&[2]), DType::F64);
    ctx.init(&x, &[1.0f64, 2.0], x.shape()).unwrap();
    let (shared, calls) = counted(&x);
    let y = ops::negate(&shared);

    let mut cache = ExecutionCache::new();
    let first = Executor::new(Arc::clone(&ctx), vec![shared.clone()]);
    first.run_with_cache(&[], &mut cache).unwrap();
    let second = Executor::new(Arc::clone(&ctx), vec![y]);
    let out = second.run_with_cache(&[], &mut cache).unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(out[0].to_vec::<f64>().unwrap(), vec![-1.0, -2.0]);
}

#[test]
fn custom_ops_take_part_in_back_propagation() {
    let ctx = Context::make_for_device(&Device::host().unwrap());
    let x = ops::variable("x", Shape::new(&[2]), DType::F64);
    ctx.init(&x, &[3.0f64, 4.0], x.shape()).unwrap();
    let (through, _) = counted(&x);
    let loss = ops::reduce_sum(&ops::multiply(&through, &x).unwrap(), &[], false).unwrap();
    let grads = build_back_propagation_graph(&loss, &[x.clone()]).unwrap();
    let dx = ctx.eval(&[grads.get(&x).unwrap().clone()]).unwrap();
    assert_eq!(dx[0].to_vec::<f64>().unwrap(), vec![6.0, 8.0]);
}

#[test]
fn shape_nodes_evaluate() {
    let ctx = Context::make_for_device(&Device::host().unwrap());
    let x = ops::variable("x", Shape::new(&[1, 2, 3, 4]), DType::F32);
    ctx.init(&x, &vec![0.5f32; 24], x.shape()).unwrap();

    let dims = ops::shape_of(&x);
    let count = ops::product_of_dims(&x, &[-1, 1], DType::F32).unwrap();
    let flat = ops::reshape(&x, &[-1]).unwrap();
    let passed = ops::no_back_prop(&flat);
    let out = ctx.eval(&[dims, count, passed]).unwrap();

    assert_eq!(out[0].to_vec::<i64>().unwrap(), vec![1, 2, 3, 4]);
    assert_eq!(out[1].to_vec::<f32>().unwrap(), vec![8.0]);
    assert_eq!(out[2].shape(), &Shape::new(&[24]));
    assert_eq!(
        out[2].buffer().block_id(),
        ctx.get(&x).unwrap().buffer().block_id()
    );
}

#[test]
fn unbound_variable_is_reported_on_evaluation() {
    let ctx = Context::make_for_device(&Device::host().unwrap());
    let x = ops::variable("x", Shape::new(&[2]), DType::F32);
    let y = ops::variable("weights", Shape::new(&[2]), DType::F32);
    ctx.init(&x, &[1.0f32, 2.0], x.shape()).unwrap();
    let sum = ops::plus(&x, &y).unwrap();
    assert_eq!(
        ctx.eval(&[sum]).unwrap_err(),
        CascadeError::UnboundVariable {
            name: "weights".into()
        }
    );
}

#[test]
fn device_failures_surface_when_results_are_read() {
    #[derive(Debug)]
    struct Broken;

    impl CustomOp for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn forward(&self, device: &Device, inputs: &[MultiArrayRef]) -> Result<MultiArrayRef> {
            let out = device.make_array(inputs[0].shape().clone(), inputs[0].dtype())?;
            out.set_completion_event(cascade_device::Event::failed(CascadeError::Device(
                "kernel launch failed".into(),
            )));
            Ok(out)
        }
    }

    let ctx = Context::make_for_device(&Device::host().unwrap());
    let x = ops::variable("x", Shape::new(&[2]), DType::F32);
    ctx.init(&x, &[1.0f32, 2.0], x.shape()).unwrap();
    let broken = ops::custom(Arc::new(Broken), &[x.clone()], x.shape().clone(), DType::F32);
    let y = ops::scale(&ops::plus(&broken, &x).unwrap(), 2.0);

    // Evaluation only enqueues work, so it succeeds.
    let out = ctx.eval(&[y]).unwrap();
    let err = out[0].to_vec::<f32>().unwrap_err();
    assert!(err.is_device_error());
}

#[test]
fn mean_over_an_empty_dimension_is_nan() {
    let ctx = Context::make_for_device(&Device::host().unwrap());
    let x = ops::variable("x", Shape::new(&[0, 3]), DType::F32);
    ctx.init::<f32>(&x, &[], x.shape()).unwrap();

    let mean = ops::reduce_mean(&x, &[0], false).unwrap();
    let sum = ops::reduce_sum(&x, &[0], false).unwrap();
    let out = ctx.eval(&[mean, sum]).unwrap();

    assert!(out[0].to_vec::<f32>().unwrap().iter().all(|v| v.is_nan()));
    assert_eq!(out[1].to_vec::<f32>().unwrap(), vec![0.0; 3]);
}
