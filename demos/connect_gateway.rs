//! Connects with the token in `GATEWAY_TOKEN` and prints events as they arrive.
//!
//! `RUST_LOG=gateway_session=debug cargo run --example connect_gateway`

use std::time::Duration;

use gateway_session::gateway::events::MessageEvent;
use gateway_session::GatewayClient;
use secrecy::SecretString;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let token = std::env::var("GATEWAY_TOKEN")?;
    let mut client = GatewayClient::new(SecretString::new(token));
    if let Ok(api_base) = std::env::var("GATEWAY_API_BASE") {
        client = client.with_api_base(api_base);
    }

    let gateway = client.connect().await?;
    let mut announced_ready = false;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }

        if let Some(reason) = gateway.get_fatal_error() {
            eprintln!("gateway gave up: {reason}");
            break;
        }
        if !announced_ready && gateway.get_ready() {
            announced_ready = true;
            println!(
                "ready as {}: {} guilds, {} dms, {} unread",
                gateway.get_my_user_id().unwrap_or_default(),
                gateway.get_guilds().len(),
                gateway.get_dms().len(),
                gateway.get_unseen().len()
            );
        }

        while let Some(event) = gateway.get_message_event() {
            match event {
                MessageEvent::Created(message) => println!(
                    "[{}] {}: {}",
                    message.channel_id,
                    message.author.map(|author| author.username).unwrap_or_default(),
                    message.content.unwrap_or_default()
                ),
                other => println!("[{}] {:?}", other.channel_id(), other),
            }
        }
        while let Some(typing) = gateway.get_typing_event() {
            println!(
                "[{}] {} is typing",
                typing.channel_id,
                typing.username.unwrap_or(typing.user_id)
            );
        }
    }

    gateway.disconnect().await;
    Ok(())
}
