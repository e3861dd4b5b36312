//! Status notifications to the remote controller ("control floor")
//!
//! Every notification is a form post to
//! `{base}/provider/device/status/{variant}`. The HTTP client logs in lazily
//! before its first post and keeps the session cookie afterwards. Failed
//! posts are logged and never retried.

use std::time::Duration;

use reqwest::redirect::Policy;
use reqwest::StatusCode;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::config::ControlFloorSettings;
use iprov_core::prelude::*;
use iprov_core::types::{AgentKind, DeviceInfo, ScreenSize};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A device status change reported to the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Exists { udid: String, size: ScreenSize },
    Info { udid: String, info: DeviceInfo },
    AgentStarted { udid: String, kind: AgentKind },
    AgentStopped { udid: String, kind: AgentKind },
    VideoStarted { udid: String },
    VideoStopped { udid: String },
    ProvisionStopped { udid: String },
}

impl Notification {
    pub fn udid(&self) -> &str {
        match self {
            Notification::Exists { udid, .. }
            | Notification::Info { udid, .. }
            | Notification::AgentStarted { udid, .. }
            | Notification::AgentStopped { udid, .. }
            | Notification::VideoStarted { udid }
            | Notification::VideoStopped { udid }
            | Notification::ProvisionStopped { udid } => udid,
        }
    }

    /// Last path segment of the status endpoint
    pub fn variant(&self) -> String {
        match self {
            Notification::Exists { .. } => "exists".to_string(),
            Notification::Info { .. } => "info".to_string(),
            Notification::AgentStarted { kind, .. } => format!("{}Started", kind.status_prefix()),
            Notification::AgentStopped { kind, .. } => format!("{}Stopped", kind.status_prefix()),
            Notification::VideoStarted { .. } => "videoStarted".to_string(),
            Notification::VideoStopped { .. } => "videoStopped".to_string(),
            Notification::ProvisionStopped { .. } => "provisionStopped".to_string(),
        }
    }

    /// Form fields posted with the notification
    pub fn form(&self) -> Vec<(&'static str, String)> {
        let mut form = vec![("udid", self.udid().to_string())];
        match self {
            Notification::Exists { size, .. } => {
                form.push(("width", size.width.to_string()));
                form.push(("height", size.height.to_string()));
                form.push(("clickWidth", size.click_width.to_string()));
                form.push(("clickHeight", size.click_height.to_string()));
            }
            Notification::Info { info, .. } => form.push(("info", info_json(info))),
            _ => {}
        }
        form
    }
}

/// Device info as the JSON object the controller expects
fn info_json(info: &DeviceInfo) -> String {
    let mut map: Map<String, Value> = info
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    let description = info
        .get("ProductType")
        .map(|t| product_name(t))
        .unwrap_or_else(|| "unknown".to_string());
    map.insert(
        "ArtworkDeviceProductDescription".to_string(),
        Value::String(description),
    );
    Value::Object(map).to_string()
}

#[rustfmt::skip]
const IPHONE_NAMES: &[(&str, &str)] = &[
    ("1,2", "3G"), ("2,1", "3GS"), ("3,1", "4"), ("3,2", "4"), ("3,3", "4"),
    ("4,1", "4S"), ("5,1", "5"), ("5,2", "5"), ("5,3", "5C"), ("5,4", "5C"),
    ("6,1", "5S"), ("6,2", "5S"), ("7,1", "6 Plus"), ("7,2", "6"), ("8,1", "6S"),
    ("8,2", "6S Plus"), ("8,4", "SE"), ("9,1", "7"), ("9,3", "7"), ("9,2", "7 Plus"),
    ("9,4", "7 Plus"), ("10,1", "8"), ("10,4", "8"), ("10,2", "8 Plus"), ("10,5", "8 Plus"),
    ("10,3", "X"), ("10,6", "X"), ("11,2", "Xs"), ("11,4", "Xs Max"), ("11,6", "Xs Max"),
    ("11,8", "XR"), ("12,1", "11"), ("12,3", "11 Pro"), ("12,5", "11 Pro Max"),
    ("12,8", "SE 2"), ("13,1", "12 mini"), ("13,2", "12"), ("13,3", "12 Pro"),
    ("13,4", "12 Pro Max"),
];

#[rustfmt::skip]
const IPAD_NAMES: &[(&str, &str)] = &[
    ("2,1", "2"), ("2,2", "2"), ("2,3", "2"), ("2,4", "2"), ("3,1", "3"), ("3,2", "3"),
    ("3,3", "3"), ("3,4", "4"), ("3,5", "4"), ("3,6", "4"), ("6,11", "5"), ("6,12", "5"),
    ("7,5", "6"), ("7,6", "6"), ("7,11", "7"), ("7,12", "7"), ("11,6", "8"), ("11,7", "8"),
    ("4,1", "Air"), ("4,2", "Air"), ("4,3", "Air"), ("5,3", "Air 2"), ("5,4", "Air 2"),
    ("11,3", "Air 3"), ("11,4", "Air 3"), ("13,1", "Air 4"), ("13,2", "Air 4"),
    ("2,5", "Mini"), ("2,6", "Mini"), ("2,7", "Mini"), ("4,4", "Mini 2"), ("4,5", "Mini 2"),
    ("4,6", "Mini 2"), ("4,7", "Mini 3"), ("4,8", "Mini 3"), ("4,9", "Mini 3"),
    ("5,1", "Mini 4"), ("5,2", "Mini 4"), ("11,1", "Mini 5"), ("11,2", "Mini 5"),
    ("6,3", "Pro 9.7in"), ("6,4", "Pro 9.7in"), ("7,3", "Pro 10.5in"), ("7,4", "Pro 10.5in"),
    ("8,1", "Pro 11in"), ("8,2", "Pro 11in"), ("8,3", "Pro 11in"), ("8,4", "Pro 11in"),
    ("8,9", "Pro 11in 2"), ("8,10", "Pro 11in 2"), ("6,7", "Pro 12.9in"), ("6,8", "Pro 12.9in"),
    ("7,1", "Pro 12.9in 2"), ("7,2", "Pro 12.9in 2"), ("8,5", "Pro 12.9in 3"),
    ("8,6", "Pro 12.9in 3"), ("8,7", "Pro 12.9in 3"), ("8,8", "Pro 12.9in 3"),
    ("8,11", "Pro 12.9in 4"), ("8,12", "Pro 12.9in 4"),
];

/// Marketing name for a `ProductType` such as `iPhone12,8`
pub fn product_name(product_type: &str) -> String {
    let lookup = |family: &str, model: &str, table: &[(&str, &str)]| {
        table
            .iter()
            .find(|(id, _)| *id == model)
            .map(|(_, name)| format!("{} {}", family, name))
    };

    let named = if let Some(model) = product_type.strip_prefix("iPhone") {
        lookup("iPhone", model, IPHONE_NAMES)
    } else if let Some(model) = product_type.strip_prefix("iPad") {
        lookup("iPad", model, IPAD_NAMES)
    } else {
        None
    };
    named.unwrap_or_else(|| product_type.to_string())
}

// ─────────────────────────────────────────────────────────
// Trait
// ─────────────────────────────────────────────────────────

/// Receiver of device status notifications
#[trait_variant::make(ControlFloor: Send)]
pub trait LocalControlFloor {
    /// Deliver one notification. Failures are logged, not returned.
    async fn notify(&self, notification: Notification);
}

// ─────────────────────────────────────────────────────────
// HTTP implementation
// ─────────────────────────────────────────────────────────

/// Control floor reached over HTTP with a cookie session
pub struct HttpControlFloor {
    base: String,
    username: String,
    password: String,
    client: reqwest::Client,
    logged_in: Mutex<bool>,
}

impl HttpControlFloor {
    pub fn new(settings: &ControlFloorSettings) -> Result<Self> {
        Self::with_base_url(settings, settings.base_url())
    }

    /// Use `base` instead of the URL derived from the settings
    pub fn with_base_url(settings: &ControlFloorSettings, base: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .redirect(Policy::none())
            .danger_accept_invalid_certs(settings.self_signed)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::control_floor(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base: base.into().trim_end_matches('/').to_string(),
            username: settings.username.clone(),
            password: settings.password.clone(),
            client,
            logged_in: Mutex::new(false),
        })
    }

    /// Log in and keep the session cookie
    ///
    /// The controller answers a good login with a redirect; a redirect
    /// carrying `fail=1` means the credentials were rejected.
    pub async fn login(&self) -> Result<()> {
        let url = format!("{}/provider/login", self.base);
        debug!("Logging in to control floor at {}", url);

        let resp = self
            .client
            .post(&url)
            .form(&[("user", self.username.as_str()), ("pass", self.password.as_str())])
            .send()
            .await
            .map_err(|e| Error::control_floor(format!("login request failed: {}", e)))?;

        let status = resp.status();
        if status != StatusCode::FOUND {
            return Err(Error::control_floor(format!("login failed (HTTP {})", status)));
        }

        let location = resp
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if location.contains("fail=1") {
            return Err(Error::control_floor("login rejected: bad credentials"));
        }

        info!("Logged in to control floor as {}", self.username);
        Ok(())
    }

    async fn ensure_login(&self) -> Result<()> {
        let mut logged_in = self.logged_in.lock().await;
        if !*logged_in {
            self.login().await?;
            *logged_in = true;
        }
        Ok(())
    }

    async fn forget_login(&self) {
        *self.logged_in.lock().await = false;
    }
}

impl ControlFloor for HttpControlFloor {
    async fn notify(&self, notification: Notification) {
        let variant = notification.variant();
        let udid = censor_udid(notification.udid());

        if let Err(e) = self.ensure_login().await {
            error!("Could not notify {} for {}: {}", variant, udid, e);
            return;
        }

        let url = format!("{}/provider/device/status/{}", self.base, variant);
        let resp = match self.client.post(&url).form(&notification.form()).send().await {
            Ok(resp) => resp,
            Err(e) => {
                error!("Notify {} for {} failed: {}", variant, udid, e);
                return;
            }
        };

        let status = resp.status();
        if status == StatusCode::OK {
            info!("Notified control floor of {} for {}", variant, udid);
            return;
        }

        error!("Notify {} for {} failed (HTTP {})", variant, udid, status);
        if status == StatusCode::UNAUTHORIZED || status.is_redirection() {
            self.forget_login().await;
        }
    }
}
