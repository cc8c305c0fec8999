// dedrm-core - E-book DRM Removal Engine
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Subscriber setup for binaries
//!
//! The library only emits `tracing` events. Applications call
//! [`init_logging`] once; `RUST_LOG` takes precedence over the given filter.

use crate::error::{DeDrmError, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const DEFAULT_FILTER: &str = "dedrm_core=info";

/// Install a formatted stderr subscriber
///
/// # Errors
/// - `ConfigurationError` if the filter is invalid or a subscriber is already set
pub fn init_logging(filter: Option<&str>) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter.unwrap_or(DEFAULT_FILTER)))
        .map_err(|e| DeDrmError::ConfigurationError(format!("log filter: {}", e)))?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| DeDrmError::ConfigurationError(format!("logging: {}", e)))?;

    Ok(())
}
