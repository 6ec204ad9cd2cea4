use clap::Parser;

fn main() -> anyhow::Result<()> {
    manifold_core::serve::init_tracing();
    let args = manifold_analytics::Args::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let result = runtime.block_on(manifold_analytics::run(args));
    runtime.shutdown_background();
    result
}
