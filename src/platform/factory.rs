// ABOUTME: Provider factory: turns the configured provider kind into a ConnectionProvider
// ABOUTME: Discord is feature-gated; the memory platform is always available

use anyhow::Result;
use std::sync::Arc;

use parley_core::config::Config;
use parley_core::memory::MemoryPlatform;
use parley_core::ConnectionProvider;

/// Create the connection provider named by `config.provider.kind`.
pub fn create_provider(config: &Config) -> Result<Arc<dyn ConnectionProvider>> {
    match config.provider.kind.as_str() {
        #[cfg(feature = "discord")]
        "discord" => Ok(Arc::new(super::DiscordProvider::new())),
        #[cfg(not(feature = "discord"))]
        "discord" => {
            anyhow::bail!("Discord support not compiled. Build with --features discord")
        }
        "memory" => {
            tracing::warn!(
                "Using the in-process memory platform: no real chat traffic, bots must be registered in-process"
            );
            Ok(Arc::new(MemoryPlatform::new()))
        }
        other => anyhow::bail!("Unknown provider: {}", other),
    }
}
