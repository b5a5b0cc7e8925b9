#[tokio::main]
async fn main() -> anyhow::Result<()> {
    walktest::run().await
}
