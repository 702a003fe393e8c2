#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    accord_node::run().await?;
    Ok(())
}
