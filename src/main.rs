use anyhow::Result;

#[macro_use]
extern crate log;

#[tokio::main]
async fn main() -> Result<()> {
    pretty_env_logger::init();

    // tokio-tungstenite leaves picking a rustls crypto provider to us
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("A rustls crypto provider was already installed");
    }

    let config = partybot_rs::config::load().await?;
    info!("Remote audio service: {}", config.remote.url);

    #[cfg(feature = "discord")]
    {
        if let Some(discord_config) = &config.discord {
            partybot_rs::discord::init(&config, discord_config).await?;
        } else {
            warn!("No [discord] section in Config.toml, nothing to do");
        }
    }

    #[cfg(not(feature = "discord"))]
    warn!("Built without the discord feature, nothing to do");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    Ok(())
}
