#[tokio::main]
async fn main() -> anyhow::Result<()> {
    mcp_bridge::run().await
}
