//! Query the `date` service once and print the answer.
//!
//! ```sh
//! cargo run --example date_query
//! ```

use cellaserv_client::Client;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let addr =
        std::env::var("CELLASERV_ADDR").unwrap_or_else(|_| "127.0.0.1:4200".to_string());

    let client = Client::builder().connect(&addr).await?;

    let timestamp: u64 = client.call("date", "time", &()).await?;
    println!("date.time = {timestamp}");

    client.close().await;
    Ok(())
}
