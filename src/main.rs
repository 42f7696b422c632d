#[tokio::main]
async fn main() {
    if let Err(e) = bucket_telemetry::run_server().await {
        eprintln!("bucket-telemetry failed: {e:#}");
        std::process::exit(1);
    }
}
