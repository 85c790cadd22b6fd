fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Compile the Identity and Node parts of the CSI spec (server side only)
    tonic_prost_build::configure()
        .build_server(true)
        .build_client(false)
        .compile_protos(&["../proto/csi.proto"], &["../proto"])?;

    Ok(())
}
