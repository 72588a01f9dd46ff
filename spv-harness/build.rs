use std::env;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/walletrpc.proto");
    println!("cargo:rerun-if-env-changed=PROTOC");

    // If caller already provides PROTOC, respect it. Otherwise fall back to
    // the vendored binary so builds do not depend on a system install.
    if env::var_os("PROTOC").is_none() {
        let vendored = protoc_bin_vendored::protoc_bin_path()?;
        env::set_var("PROTOC", vendored);
    }

    // Server stubs are generated too; the integration tests run a fake wallet.
    tonic_build::configure()
        .build_client(true)
        .build_server(true)
        .compile_protos(&["proto/walletrpc.proto"], &["proto"])?;
    Ok(())
}
