use std::env;
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    std::env::set_var(
        "PROTOC",
        protoc_bin_vendored::protoc_bin_path().expect("vendored protoc binary"),
    );

    // Get the path to the proto files
    let proto_root = PathBuf::from(env::var("CARGO_MANIFEST_DIR")?)
        .parent()
        .unwrap()
        .join("proto");

    // Configure the protobuf compiler
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        // Compile the proto files
        .compile_protos(
            &[proto_root.join("k2serve/v1/classify.proto")],
            &[proto_root],
        )?;

    Ok(())
}
