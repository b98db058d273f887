#[tokio::main]
async fn main() {
    pi_cycle_backend::init_tracing();

    if let Err(error) = pi_cycle_backend::run().await {
        tracing::error!(%error, "pi cycle backend exited with an error");
        std::process::exit(1);
    }
}
