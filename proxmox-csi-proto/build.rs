//! Build script for generating Rust code from the CSI protobuf definition.

use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    let out_dir = PathBuf::from("src/generated");

    // Create output directory if it doesn't exist
    std::fs::create_dir_all(&out_dir)?;

    let proto = PathBuf::from("proto/csi.proto");
    println!("cargo:rerun-if-changed={}", proto.display());

    // Configure tonic-build
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .out_dir(&out_dir)
        .compile(&[proto], &[PathBuf::from("proto")])?;

    Ok(())
}
