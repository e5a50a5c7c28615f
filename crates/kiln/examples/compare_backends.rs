// Compare Backends — build one job per execution strategy and check that
// they agree.
//
// Run with: cargo run -p kiln --example compare_backends

use kiln::prelude::*;

fn main() -> kiln::Result<()> {
    // The job body: x + y + x over [2, 10, 2] f32 placeholders.
    let mut g = GraphBuilder::new();
    let x = g.placeholder("x", (2, 10, 2), DType::F32)?;
    let y = g.placeholder("y", (2, 10, 2), DType::F32)?;
    let sum = g.add(x, y)?;
    let out = g.add(sum, x)?;
    g.output("out", out)?;
    let graph = g.finish()?;

    let mut session = Session::<CpuBackend>::new(CpuDevice);

    // One job per strategy, each with its own fresh config.
    for mode in [
        ExecutionMode::Baseline,
        ExecutionMode::Jit,
        ExecutionMode::Accelerated,
    ] {
        let config = JobConfig::new().with_mode(mode);
        let name = format!("add_{}", mode);
        session.compile(JobBuilder::new(&name, config, graph.clone()))?;
        println!("{}", session.job(&name)?.dump());
        println!();
    }

    // Identical random inputs for every job.
    let xs = CpuTensor::rand((2, 10, 2), DType::F32, &CpuDevice)?;
    let ys = CpuTensor::rand((2, 10, 2), DType::F32, &CpuDevice)?;

    let baseline = session
        .job("add_baseline")?
        .invoke(&[xs.clone(), ys.clone()])?;
    let reference = baseline.primary()?.to_f64_vec()?;

    for name in ["add_jit", "add_accelerated"] {
        let batch = session.job(name)?.invoke(&[xs.clone(), ys.clone()])?;
        let got = batch.primary()?.to_f64_vec()?;
        let close = allclose(&got, &reference, DEFAULT_RTOL, DEFAULT_ATOL);
        println!("{} vs baseline: close = {}", name, close);
        assert!(close);
    }

    session.clear();
    Ok(())
}
