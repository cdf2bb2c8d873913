fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Compile the Terraform plugin protocol definitions (protocol 6.x only;
    // protocol 5 providers are detected at handshake time and rejected).
    let mut config = prost_build::Config::new();
    config.disable_comments(["."]);

    tonic_build::configure()
        // The server side exists so tests can stand up an in-process provider.
        .build_server(true)
        .compile_protos_with_config(config, &["proto/tfplugin6.proto"], &["proto/"])?;
    Ok(())
}
