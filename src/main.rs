use torrust_downloader::console::app;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    app::run().await
}
