use clap::Parser;

fn main() -> anyhow::Result<()> {
    manifold_core::serve::init_tracing();
    let args = manifold_mqtt::Args::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let result = runtime.block_on(manifold_mqtt::run(args));
    runtime.shutdown_background();
    result
}
