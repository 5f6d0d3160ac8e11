//! LTI Bridge Library
//!
//! LTI 1.3 tool-side integration: lets an LMS (Canvas, Moodle, Blackboard,
//! ...) launch this tool, lets instructors pick content through Deep
//! Linking, and publishes grades back through Assignment and Grade Services.
//!
//! # Features
//!
//! - **OIDC third-party login**: state + single-use nonce, platform redirect
//! - **Launch validation**: platform JWKS, RS256, `aud`/`iss`/`exp`, replay protection
//! - **Deep Linking**: catalog filtering, signed `LtiDeepLinkingResponse`
//! - **AGS**: client-credentials tokens, line items, scores, results, bulk sync
//! - **Audit**: structured lifecycle events through `tracing`

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod ags;
pub mod audit;
pub mod cli;
pub mod config;
pub mod error;
pub mod lti;
pub mod server;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// LTI version implemented by this tool
pub const LTI_VERSION: &str = lti::claims::LTI_VERSION;

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(format!("tracing init failed: {e}")))?,
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(format!("tracing init failed: {e}")))?,
    }

    Ok(())
}
