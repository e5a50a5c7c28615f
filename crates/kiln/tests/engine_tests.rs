// Inference Engine Tests — support table, fusion, agreement

use kiln::prelude::*;
use kiln::Error;

fn ones(shape: &[usize]) -> CpuTensor {
    CpuTensor::ones(shape, DType::F32, &CpuDevice).unwrap()
}

fn accel(name: &str, graph: kiln::Graph) -> kiln::Result<Job<CpuBackend>> {
    JobBuilder::new(
        name,
        JobConfig::new().with_mode(ExecutionMode::Accelerated),
        graph,
    )
    .build(CpuDevice)
}

#[test]
fn rejects_layer_norm_grad_at_build_time() {
    let shape: &[usize] = &[2, 10, 2];
    let stats: &[usize] = &[2, 10];
    let mut g = GraphBuilder::new();
    let dy = g.placeholder("dy", shape, DType::F32).unwrap();
    let x = g.placeholder("x", shape, DType::F32).unwrap();
    let mean = g.placeholder("mean", stats, DType::F32).unwrap();
    let inv = g.placeholder("inv_variance", stats, DType::F32).unwrap();
    let dx = g.layer_norm_grad(dy, x, mean, inv, -1).unwrap();
    g.output("dx", dx).unwrap();

    let err = accel("lng", g.finish().unwrap()).unwrap_err();
    match err {
        Error::UnsupportedOp { engine, op } => {
            assert_eq!(engine, "inference");
            assert_eq!(op, "layer_norm_grad");
        }
        other => panic!("expected unsupported-op error, got {other}"),
    }
}

#[test]
fn rejects_reductions_at_build_time() {
    let mut g = GraphBuilder::new();
    let x = g.placeholder("x", (2, 4), DType::F32).unwrap();
    let m = g.mean(x, &[1], true).unwrap();
    g.output("m", m).unwrap();

    let err = accel("mean", g.finish().unwrap()).unwrap_err();
    assert!(matches!(err, Error::UnsupportedOp { .. }));
    assert!(err.to_string().contains("mean"));
}

#[test]
fn elementwise_chain_fuses_into_one_layer() {
    // x + y + x is two adds with a single-consumer intermediate: one fused
    // layer, one op fused away.
    let mut g = GraphBuilder::new();
    let x = g.placeholder("x", (1, 10), DType::F32).unwrap();
    let y = g.placeholder("y", (1, 10), DType::F32).unwrap();
    let sum = g.add(x, y).unwrap();
    let out = g.add(sum, x).unwrap();
    g.output("out", out).unwrap();

    let job = accel("add", g.finish().unwrap()).unwrap();
    let summary = job.engine_summary().unwrap();
    assert_eq!(summary.source_ops, 2);
    assert_eq!(summary.layers, 1);
    assert_eq!(summary.fused_away, 1);

    let batch = job.invoke(&[ones(&[1, 10]), ones(&[1, 10])]).unwrap();
    assert_eq!(
        batch.primary().unwrap().to_f64_vec().unwrap(),
        vec![3.0; 10]
    );
}

#[test]
fn long_chain_fuses_completely() {
    let mut g = GraphBuilder::new();
    let x = g.placeholder("x", 8, DType::F32).unwrap();
    let a = g.square(x).unwrap();
    let b = g.neg(a).unwrap();
    let c = g.sub(x, b).unwrap(); // x + x^2
    let d = g.sqrt(c).unwrap();
    let e = g.mul(d, x).unwrap();
    g.output("out", e).unwrap();

    let job = accel("chain", g.finish().unwrap()).unwrap();
    let summary = job.engine_summary().unwrap();
    assert_eq!(summary.source_ops, 5);
    assert_eq!(summary.layers, 1);
    assert_eq!(summary.fused_away, 4);
}

#[test]
fn shared_intermediate_materializes() {
    // `sum` feeds two consumers, so it must become a real layer output;
    // the plan has two layers instead of one.
    let mut g = GraphBuilder::new();
    let x = g.placeholder("x", 4, DType::F32).unwrap();
    let y = g.placeholder("y", 4, DType::F32).unwrap();
    let sum = g.add(x, y).unwrap();
    let a = g.square(sum).unwrap();
    let out = g.mul(a, sum).unwrap();
    g.output("out", out).unwrap();

    let job = accel("shared", g.finish().unwrap()).unwrap();
    let summary = job.engine_summary().unwrap();
    assert_eq!(summary.layers, 2);

    // (x+y)^2 * (x+y) = (x+y)^3; with ones, 2^3 = 8.
    let batch = job.invoke(&[ones(&[4]), ones(&[4])]).unwrap();
    assert_eq!(batch.primary().unwrap().to_f64_vec().unwrap(), vec![8.0; 4]);
}

#[test]
fn reshape_is_a_layer_boundary() {
    let mut g = GraphBuilder::new();
    let x = g.placeholder("x", (2, 4), DType::F32).unwrap();
    let doubled = g.add(x, x).unwrap();
    let flat = g.reshape(doubled, 8).unwrap();
    let out = g.square(flat).unwrap();
    g.output("out", out).unwrap();

    let job = accel("reshape", g.finish().unwrap()).unwrap();
    let summary = job.engine_summary().unwrap();
    // add | reshape | square — the reshape splits the elementwise ops.
    assert_eq!(summary.layers, 3);

    let batch = job.invoke(&[ones(&[2, 4])]).unwrap();
    let out = batch.primary().unwrap();
    assert_eq!(out.dims(), &[8]);
    assert_eq!(out.to_f64_vec().unwrap(), vec![4.0; 8]);
}

#[test]
fn broadcast_operands_fuse_correctly() {
    // [2, 1] and [1, 3] broadcast inside a fused layer.
    let mut g = GraphBuilder::new();
    let a = g.placeholder("a", (2, 1), DType::F32).unwrap();
    let b = g.placeholder("b", (1, 3), DType::F32).unwrap();
    let s = g.add(a, b).unwrap();
    let out = g.mul(s, a).unwrap();
    g.output("out", out).unwrap();

    let job = accel("bcast", g.finish().unwrap()).unwrap();
    let at = CpuTensor::from_f64_slice(&[1.0, 2.0], (2, 1), DType::F32, &CpuDevice).unwrap();
    let bt = CpuTensor::from_f64_slice(&[10.0, 20.0, 30.0], (1, 3), DType::F32, &CpuDevice).unwrap();
    let batch = job.invoke(&[at, bt]).unwrap();
    // (a + b) * a, row 0: (1+[10,20,30])*1; row 1: (2+[10,20,30])*2.
    assert_eq!(
        batch.primary().unwrap().to_f64_vec().unwrap(),
        vec![11.0, 21.0, 31.0, 24.0, 44.0, 64.0]
    );
}

#[test]
fn placeholder_passthrough_output() {
    let mut g = GraphBuilder::new();
    let x = g.placeholder("x", 4, DType::F32).unwrap();
    let s = g.square(x).unwrap();
    g.output("sq", s).unwrap();
    g.output("x", x).unwrap();

    let job = accel("pass", g.finish().unwrap()).unwrap();
    let input = CpuTensor::from_f64_slice(&[1.0, 2.0, 3.0, 4.0], 4, DType::F32, &CpuDevice).unwrap();
    let batch = job.invoke(&[input]).unwrap();
    assert_eq!(
        batch.get("sq").unwrap().to_f64_vec().unwrap(),
        vec![1.0, 4.0, 9.0, 16.0]
    );
    assert_eq!(
        batch.get("x").unwrap().to_f64_vec().unwrap(),
        vec![1.0, 2.0, 3.0, 4.0]
    );
}

#[test]
fn engine_agrees_with_baseline_on_random_inputs() {
    let mut g = GraphBuilder::new();
    let x = g.placeholder("x", (2, 5, 2, 2), DType::F32).unwrap();
    let y = g.placeholder("y", (2, 5, 2, 2), DType::F32).unwrap();
    let s = g.add(x, y).unwrap();
    let sq = g.square(s).unwrap();
    let out = g.div(sq, y).unwrap();
    g.output("out", out).unwrap();
    let graph = g.finish().unwrap();

    let cmp = BackendComparison::new()
        .with_modes(&[ExecutionMode::Baseline, ExecutionMode::Accelerated]);
    let mut session = Session::<CpuBackend>::new(CpuDevice);
    // y in [0,1) can sit near zero; shift it away before dividing.
    let y_raw = CpuTensor::rand(&[2usize, 5, 2, 2][..], DType::F32, &CpuDevice).unwrap();
    let one = CpuTensor::ones(&[2usize, 5, 2, 2][..], DType::F32, &CpuDevice).unwrap();
    let y_safe = y_raw.add(&one).unwrap();
    let x = CpuTensor::rand(&[2usize, 5, 2, 2][..], DType::F32, &CpuDevice).unwrap();
    cmp.check(&mut session, &graph, &[x, y_safe]).unwrap();
}
