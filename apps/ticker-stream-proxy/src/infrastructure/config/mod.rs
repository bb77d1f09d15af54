//! Configuration Module
//!
//! Configuration loading for the ticker stream proxy.

mod settings;

pub use settings::{
    ConfigError, DEFAULT_PAGE_URL_TEMPLATE, DEFAULT_USER_AGENT, LiveSettings, SYMBOL_PLACEHOLDER,
    ServerSettings, SimulatedSettings, StreamConfig, parse_flag,
};
