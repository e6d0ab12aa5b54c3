#[tokio::main]
async fn main() -> eyre::Result<()> {
    interlink::run().start().await
}
