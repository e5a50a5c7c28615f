// Backend Agreement Tests — every engine computes the same numbers
//
// One graph, identical inputs, one job per execution mode; outputs must
// agree with the baseline interpreter within rtol 1e-3 / atol 1e-5. Each
// scenario runs inside a session scope so compiled jobs never leak into
// the next scenario.

use kiln::prelude::*;

const SHAPES: &[&[usize]] = &[&[1, 10], &[2, 10, 2], &[2, 5, 2, 2]];

fn add_graph(shape: &[usize]) -> kiln::Graph {
    let mut g = GraphBuilder::new();
    let x = g.placeholder("x", shape, DType::F32).unwrap();
    let y = g.placeholder("y", shape, DType::F32).unwrap();
    let sum = g.add(x, y).unwrap();
    let out = g.add(sum, x).unwrap(); // x + y + x
    g.output("out", out).unwrap();
    g.finish().unwrap()
}

fn layer_norm_grad_graph(shape: &[usize]) -> kiln::Graph {
    let stats = &shape[..shape.len() - 1];
    let mut g = GraphBuilder::new();
    let dy = g.placeholder("dy", shape, DType::F32).unwrap();
    let x = g.placeholder("x", shape, DType::F32).unwrap();
    let mean = g.placeholder("mean", stats, DType::F32).unwrap();
    let inv_var = g.placeholder("inv_variance", stats, DType::F32).unwrap();
    let dx = g.layer_norm_grad(dy, x, mean, inv_var, -1).unwrap();
    g.output("dx", dx).unwrap();
    g.finish().unwrap()
}

fn ones(shape: &[usize]) -> CpuTensor {
    CpuTensor::ones(shape, DType::F32, &CpuDevice).unwrap()
}

fn uniform(shape: &[usize]) -> CpuTensor {
    CpuTensor::rand(shape, DType::F32, &CpuDevice).unwrap()
}

// Elementwise add: all three engines.

#[test]
fn add_agrees_on_ones_inputs() {
    let cmp = BackendComparison::new().with_modes(&[
        ExecutionMode::Baseline,
        ExecutionMode::Jit,
        ExecutionMode::Accelerated,
    ]);
    let mut session = Session::<CpuBackend>::new(CpuDevice);
    for &shape in SHAPES {
        let graph = add_graph(shape);
        cmp.check(&mut session, &graph, &[ones(shape), ones(shape)])
            .unwrap();
        assert!(session.is_empty(), "scenario leaked compiled jobs");
    }
}

#[test]
fn add_agrees_on_random_inputs() {
    let cmp = BackendComparison::new().with_modes(&[
        ExecutionMode::Baseline,
        ExecutionMode::Jit,
        ExecutionMode::Accelerated,
    ]);
    let mut session = Session::<CpuBackend>::new(CpuDevice);
    for &shape in SHAPES {
        let graph = add_graph(shape);
        cmp.check(&mut session, &graph, &[uniform(shape), uniform(shape)])
            .unwrap();
    }
}

#[test]
fn add_of_ones_is_three_everywhere() {
    // x + y + x with x = y = 1 is exactly 3 on every engine.
    let mut session = Session::<CpuBackend>::new(CpuDevice);
    for mode in [
        ExecutionMode::Baseline,
        ExecutionMode::Jit,
        ExecutionMode::Accelerated,
    ] {
        session.scope(|session| {
            let config = JobConfig::new().with_mode(mode);
            let graph = add_graph(&[2, 10, 2]);
            session
                .compile(JobBuilder::new("add", config, graph))
                .unwrap();
            let batch = session
                .job("add")
                .unwrap()
                .invoke(&[ones(&[2, 10, 2]), ones(&[2, 10, 2])])
                .unwrap();
            let out = batch.get("out").unwrap().to_f64_vec().unwrap();
            assert_eq!(out.len(), 40);
            assert!(out.iter().all(|&v| v == 3.0), "{mode}: expected all 3.0");
        });
    }
}

// Layer-norm gradient: baseline vs JIT. The inference engine refuses the
// op (covered in engine_tests).

#[test]
fn layer_norm_grad_agrees_on_ones_inputs() {
    let cmp = BackendComparison::new(); // Baseline vs Jit
    let mut session = Session::<CpuBackend>::new(CpuDevice);
    for &shape in SHAPES {
        let stats = &shape[..shape.len() - 1];
        let graph = layer_norm_grad_graph(shape);
        let inputs = [ones(shape), ones(shape), ones(stats), ones(stats)];
        cmp.check(&mut session, &graph, &inputs).unwrap();
    }
}

#[test]
fn layer_norm_grad_agrees_on_random_inputs() {
    let cmp = BackendComparison::new();
    let mut session = Session::<CpuBackend>::new(CpuDevice);
    for &shape in SHAPES {
        let stats = &shape[..shape.len() - 1];
        let graph = layer_norm_grad_graph(shape);
        let inputs = [uniform(shape), uniform(shape), uniform(stats), uniform(stats)];
        cmp.check(&mut session, &graph, &inputs).unwrap();
    }
}

#[test]
fn layer_norm_grad_of_uniform_ones_is_zero() {
    // dy = x = 1 and mean = inv_variance = 1: x_hat = 0 and dy is centered,
    // so the gradient vanishes identically.
    let mut session = Session::<CpuBackend>::new(CpuDevice);
    let shape: &[usize] = &[2, 5, 2, 2];
    let stats: &[usize] = &[2, 5, 2];
    session.scope(|session| {
        let graph = layer_norm_grad_graph(shape);
        session
            .compile(JobBuilder::new("lng", JobConfig::new(), graph))
            .unwrap();
        let batch = session
            .job("lng")
            .unwrap()
            .invoke(&[ones(shape), ones(shape), ones(stats), ones(stats)])
            .unwrap();
        let dx = batch.get("dx").unwrap().to_f64_vec().unwrap();
        assert!(dx.iter().all(|&v| v == 0.0));
    });
}

// Comparison driver behavior.

#[test]
fn comparison_reports_cover_each_non_reference_mode() {
    let cmp = BackendComparison::new().with_modes(&[
        ExecutionMode::Baseline,
        ExecutionMode::Jit,
        ExecutionMode::Accelerated,
    ]);
    let mut session = Session::<CpuBackend>::new(CpuDevice);
    let graph = add_graph(&[1, 10]);
    let reports = cmp
        .check(&mut session, &graph, &[ones(&[1, 10]), ones(&[1, 10])])
        .unwrap();
    let modes: Vec<ExecutionMode> = reports.iter().map(|(m, _)| *m).collect();
    assert_eq!(modes, vec![ExecutionMode::Jit, ExecutionMode::Accelerated]);
    assert!(reports.iter().all(|(_, r)| r.passed));
}

#[test]
fn comparison_requires_two_modes() {
    let cmp = BackendComparison::new().with_modes(&[ExecutionMode::Baseline]);
    let mut session = Session::<CpuBackend>::new(CpuDevice);
    let graph = add_graph(&[1, 10]);
    assert!(cmp
        .check(&mut session, &graph, &[ones(&[1, 10]), ones(&[1, 10])])
        .is_err());
}
