use clap::Parser;

fn main() -> anyhow::Result<()> {
    manifold_core::serve::init_tracing();
    let args = manifold_cache::Args::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let result = runtime.block_on(manifold_cache::run(args));
    runtime.shutdown_background();
    result
}
