pub mod chat;
pub mod logging;

use anyhow::{Context, Result};
use nostr_sdk::Keys;
use nostrtc_config::Config;
use std::path::Path;

/// Load config from `path`, or the default location
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(&path.to_path_buf()),
        None => Config::load(),
    }
}

/// Identity from the keys file (by alias), or a fresh one. The flag is true when generated.
pub fn load_identity(alias: Option<&str>) -> Result<(Keys, bool)> {
    match nostrtc_config::read_key(alias) {
        Some(secret) => {
            let keys = Keys::parse(&secret).context("Invalid key in keys file")?;
            Ok((keys, false))
        }
        None if alias.is_some() => anyhow::bail!("No key with alias {:?} in keys file", alias),
        None => Ok((Keys::generate(), true)),
    }
}

/// Room keys from an explicit secret or the configured `channel_key`
pub fn room_keys(explicit: Option<&str>, config: &Config) -> Result<Keys> {
    let secret = explicit
        .or(config.signaling.channel_key.as_deref())
        .context("No room key: pass --room or set signaling.channel_key")?;
    Keys::parse(secret).context("Invalid room key")
}
