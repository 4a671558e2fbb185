use releves_ste::{app, config::Config, logging};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init();

    let config = Config::load();

    // Start the web application
    app::run(config).await?;

    Ok(())
}
