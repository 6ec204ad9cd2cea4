fn main() -> Result<(), Box<dyn std::error::Error>> {
    let protos = [
        "proto/common.proto",
        "proto/object_store.proto",
        "proto/broker.proto",
        "proto/cache.proto",
        "proto/vector.proto",
        "proto/graph.proto",
        "proto/analytics.proto",
        "proto/relational.proto",
        "proto/mqtt.proto",
    ];

    for proto in protos {
        println!("cargo:rerun-if-changed={proto}");
    }

    // protox compiles the file descriptor set in-process, which avoids a
    // build-time dependency on a system `protoc`.
    let file_descriptor_set = protox::compile(protos, ["proto"])?;

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_fds(file_descriptor_set)?;

    Ok(())
}
