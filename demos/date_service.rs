//! A minimal service hosting `date.time`, which replies with the current
//! Unix timestamp in seconds.
//!
//! Run against a broker listening on 127.0.0.1:4200 (override with the
//! `CELLASERV_ADDR` environment variable):
//!
//! ```sh
//! cargo run --example date_service
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use cellaserv_client::Client;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let addr =
        std::env::var("CELLASERV_ADDR").unwrap_or_else(|_| "127.0.0.1:4200".to_string());

    let client = Client::builder()
        .register_method("date", "time", |_: ()| async {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_err(|e| e.to_string())?;
            Ok(now.as_secs())
        })?
        .connect(&addr)
        .await?;

    tracing::info!(%addr, "date service ready");
    client.wait_for_shutdown().await;
    Ok(())
}
