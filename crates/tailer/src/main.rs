use tailer::runtime::boot;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    boot::init_logging();
    let app = boot::boot().await?;
    app.run().await
}
