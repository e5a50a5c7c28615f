// Job Tests — declaration, contract enforcement, invocation semantics

use kiln::prelude::*;
use kiln::Error;

fn double_add_graph(shape: &[usize]) -> kiln::Graph {
    let mut g = GraphBuilder::new();
    let x = g.placeholder("x", shape, DType::F32).unwrap();
    let y = g.placeholder("y", shape, DType::F32).unwrap();
    let sum = g.add(x, y).unwrap();
    let out = g.add(sum, x).unwrap();
    g.output("out", out).unwrap();
    g.finish().unwrap()
}

fn ones(shape: &[usize]) -> CpuTensor {
    CpuTensor::ones(shape, DType::F32, &CpuDevice).unwrap()
}

fn build_job(mode: ExecutionMode, shape: &[usize]) -> Job<CpuBackend> {
    let config = JobConfig::new().with_mode(mode);
    JobBuilder::new("add", config, double_add_graph(shape))
        .build(CpuDevice)
        .unwrap()
}

#[test]
fn job_captures_its_config_at_build_time() {
    let config = JobConfig::new().with_mode(ExecutionMode::Jit);
    let job: Job<CpuBackend> =
        JobBuilder::new("add", config, double_add_graph(&[1, 10]))
            .build(CpuDevice)
            .unwrap();
    // Deriving further configs from the original cannot touch the job:
    // configs are plain values and the job owns its copy.
    let _other = config.with_mode(ExecutionMode::Accelerated);
    assert_eq!(job.mode(), ExecutionMode::Jit);
    assert_eq!(job.config().mode(), ExecutionMode::Jit);
}

#[test]
fn invoke_checks_arity() {
    let job = build_job(ExecutionMode::Baseline, &[1, 10]);
    let err = job.invoke(&[ones(&[1, 10])]).unwrap_err();
    match err {
        Error::InputArityMismatch { expected, got, .. } => {
            assert_eq!((expected, got), (2, 1));
        }
        other => panic!("expected arity error, got {other}"),
    }
}

#[test]
fn invoke_checks_declared_shape() {
    let job = build_job(ExecutionMode::Baseline, &[1, 10]);
    let err = job
        .invoke(&[ones(&[1, 10]), ones(&[2, 10])])
        .unwrap_err();
    match err {
        Error::PlaceholderViolation { placeholder, reason } => {
            assert_eq!(placeholder, "y");
            assert!(reason.contains("[1, 10]"));
        }
        other => panic!("expected placeholder violation, got {other}"),
    }
}

#[test]
fn invoke_checks_declared_dtype() {
    let job = build_job(ExecutionMode::Jit, &[1, 10]);
    let f64_input = CpuTensor::ones(&[1usize, 10][..], DType::F64, &CpuDevice).unwrap();
    let err = job.invoke(&[ones(&[1, 10]), f64_input]).unwrap_err();
    assert!(matches!(err, Error::PlaceholderViolation { .. }));
}

#[test]
fn contract_violations_abort_before_execution_on_every_engine() {
    for mode in [
        ExecutionMode::Baseline,
        ExecutionMode::Jit,
        ExecutionMode::Accelerated,
    ] {
        let job = build_job(mode, &[2, 5, 2, 2]);
        assert!(job.invoke(&[]).is_err());
        assert!(job
            .invoke(&[ones(&[2, 5, 2, 2]), ones(&[2, 5, 2])])
            .is_err());
    }
}

#[test]
fn repeated_invocation_is_reproducible() {
    // Same compiled job, same inputs → bit-identical host readback.
    for mode in [
        ExecutionMode::Baseline,
        ExecutionMode::Jit,
        ExecutionMode::Accelerated,
    ] {
        let job = build_job(mode, &[2, 10, 2]);
        let x = CpuTensor::rand(&[2usize, 10, 2][..], DType::F32, &CpuDevice).unwrap();
        let y = CpuTensor::rand(&[2usize, 10, 2][..], DType::F32, &CpuDevice).unwrap();
        let first = job
            .invoke(&[x.clone(), y.clone()])
            .unwrap()
            .primary()
            .unwrap()
            .to_f64_vec()
            .unwrap();
        for _ in 0..5 {
            let again = job
                .invoke(&[x.clone(), y.clone()])
                .unwrap()
                .primary()
                .unwrap()
                .to_f64_vec()
                .unwrap();
            assert_eq!(first, again, "{mode}: invocation not reproducible");
        }
    }
}

#[test]
fn output_batch_lookup() {
    let mut g = GraphBuilder::new();
    let x = g.placeholder("x", 4, DType::F32).unwrap();
    let y = g.placeholder("y", 4, DType::F32).unwrap();
    let sum = g.add(x, y).unwrap();
    let prod = g.mul(x, y).unwrap();
    g.output("sum", sum).unwrap();
    g.output("prod", prod).unwrap();
    let graph = g.finish().unwrap();

    let job: Job<CpuBackend> = JobBuilder::new("two_out", JobConfig::new(), graph)
        .build(CpuDevice)
        .unwrap();
    let a = CpuTensor::from_f64_slice(&[1.0, 2.0, 3.0, 4.0], 4, DType::F32, &CpuDevice).unwrap();
    let b = CpuTensor::from_f64_slice(&[2.0, 2.0, 2.0, 2.0], 4, DType::F32, &CpuDevice).unwrap();
    let batch = job.invoke(&[a, b]).unwrap();

    assert_eq!(batch.len(), 2);
    assert_eq!(
        batch.get("sum").unwrap().to_f64_vec().unwrap(),
        vec![3.0, 4.0, 5.0, 6.0]
    );
    assert_eq!(
        batch.get("prod").unwrap().to_f64_vec().unwrap(),
        vec![2.0, 4.0, 6.0, 8.0]
    );
    // primary() is the first declared output.
    assert_eq!(
        batch.primary().unwrap().to_f64_vec().unwrap(),
        vec![3.0, 4.0, 5.0, 6.0]
    );
    assert!(matches!(
        batch.get("nope"),
        Err(Error::UnknownOutput(_))
    ));
}

#[test]
fn dump_names_the_strategy() {
    let baseline = build_job(ExecutionMode::Baseline, &[1, 10]);
    assert!(baseline.dump().contains("Interpreted"));

    let jit = build_job(ExecutionMode::Jit, &[1, 10]);
    assert!(jit.dump().contains("JIT compiled"));
    assert!(jit.dump().contains("Outputs:"));

    let accel = build_job(ExecutionMode::Accelerated, &[1, 10]);
    assert!(accel.dump().contains("Inference engine"));
}
