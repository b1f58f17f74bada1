fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Compile CSI proto (subset of the official CSI v1 spec)
    tonic_prost_build::configure()
        .build_server(true)
        .build_client(false)
        .compile_protos(&["../proto/csi.proto"], &["../proto"])?;

    Ok(())
}
