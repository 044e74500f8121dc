#[tokio::main]
async fn main() {
    std::process::exit(demix_cli::run().await);
}
