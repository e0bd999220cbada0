//! Persisted user settings.

pub mod repository;

pub use repository::SettingsRepository;
