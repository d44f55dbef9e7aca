// ABOUTME: Platform abstraction module for parley
// ABOUTME: Connection providers for the in-process memory platform and Discord

#[cfg(feature = "discord")]
pub mod discord;
pub mod factory;

#[cfg(feature = "discord")]
pub use discord::DiscordProvider;
pub use factory::create_provider;
pub use parley_core::memory::MemoryPlatform;
