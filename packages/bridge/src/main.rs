fn main() {
    if let Err(err) = acp_bridge::cli::run_bridge() {
        tracing::error!(error = %err, "acp-bridge failed");
        std::process::exit(1);
    }
}
