#[tokio::main]
async fn main() -> anyhow::Result<()> {
    servicemaster::sm::cli::run().await
}
