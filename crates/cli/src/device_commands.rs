use std::path::PathBuf;

use {
    anyhow::{Context, Result},
    castle_config::CastleConfig,
    castle_gateway::{DeviceIdentity, DeviceTokenStore, identity::default_identity_path},
    clap::Subcommand,
};

#[derive(Subcommand)]
pub enum DeviceAction {
    /// Show this device's identity and whether a device token is stored.
    Show,
    /// Forget the stored device token. The next connect uses the static token.
    ClearToken,
}

pub fn handle_device(action: DeviceAction, config: &CastleConfig) -> Result<()> {
    match action {
        DeviceAction::Show => show(config),
        DeviceAction::ClearToken => clear_token(config),
    }
}

pub fn identity_path(config: &CastleConfig) -> Result<PathBuf> {
    config
        .gateway
        .identity_path
        .clone()
        .or_else(default_identity_path)
        .context("no home directory; set gateway.identity_path")
}

pub fn token_store(config: &CastleConfig) -> Result<DeviceTokenStore> {
    let path = config
        .gateway
        .device_token_path
        .clone()
        .or_else(DeviceTokenStore::default_path)
        .context("no home directory; set gateway.device_token_path")?;
    Ok(DeviceTokenStore::with_path(path))
}

fn show(config: &CastleConfig) -> Result<()> {
    let path = identity_path(config)?;
    let identity = DeviceIdentity::load_or_create(&path)?;
    let tokens = token_store(config)?;

    println!("device id:   {}", identity.device_id());
    println!("public key:  {}", identity.public_key());
    println!("identity:    {}", path.display());
    let token_state = if tokens.load().is_some() {
        "stored"
    } else {
        "none"
    };
    println!("device token: {token_state} ({})", tokens.path().display());
    Ok(())
}

fn clear_token(config: &CastleConfig) -> Result<()> {
    let tokens = token_store(config)?;
    tokens.clear()?;
    println!("Cleared device token at {}", tokens.path().display());
    Ok(())
}
