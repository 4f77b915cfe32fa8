//! Built-in tools
//!
//! Tools compiled into the binary. Both talk to a single HTTP endpoint and
//! report every recoverable problem back to the assistant as text.

use super::protocol::{ToolDeclaration, ToolImplementation};
use super::registry::PluginUnit;
use crate::config::{RealEstateConfig, ToolsConfig, ViewingConfig};
use crate::error::ToolDefect;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

pub const SEARCH_LISTINGS: &str = "search_real_estate_listings";
pub const SCHEDULE_VIEWING: &str = "schedule_property_viewing";

static EMAIL_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[^@]+@[^@]+\.[^@]+").unwrap());

/// Built-in tool provider
pub struct BuiltinTools;

impl BuiltinTools {
    /// Plugin units for every built-in tool whose backend is configured
    pub fn units(config: &ToolsConfig, client: reqwest::Client) -> Vec<PluginUnit> {
        let mut units = Vec::new();

        match ListingSearch::from_config(&config.real_estate, client.clone()) {
            Some(tool) => units.push(PluginUnit::single(ListingSearch::declaration(), Arc::new(tool))),
            None => warn!(
                "{} is not set; '{}' is disabled",
                config.real_estate.api_key_env, SEARCH_LISTINGS
            ),
        }

        match ViewingScheduler::from_config(&config.viewing, client) {
            Some(tool) => units.push(PluginUnit::single(ViewingScheduler::declaration(), Arc::new(tool))),
            None => warn!("tools.viewing.webhook_url is not set; '{}' is disabled", SCHEDULE_VIEWING),
        }

        units
    }

    /// Check if a tool is built in
    pub fn is_builtin(name: &str) -> bool {
        matches!(name, SEARCH_LISTINGS | SCHEDULE_VIEWING)
    }
}

/// Listing search against the for-sale listings API
pub struct ListingSearch {
    client: reqwest::Client,
    endpoint: String,
    host: String,
    api_key: String,
}

impl ListingSearch {
    pub fn new(client: reqwest::Client, endpoint: &str, host: &str, api_key: &str) -> Self {
        Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            host: host.to_string(),
            api_key: api_key.to_string(),
        }
    }

    fn from_config(config: &RealEstateConfig, client: reqwest::Client) -> Option<Self> {
        let api_key = std::env::var(&config.api_key_env).ok().filter(|k| !k.is_empty())?;
        Some(Self::new(client, &config.endpoint, &config.host, &api_key))
    }

    pub fn declaration() -> ToolDeclaration {
        ToolDeclaration::new(
            SEARCH_LISTINGS,
            "Search for real estate listings based on various parameters.",
            json!({
                "type": "object",
                "properties": {
                    "location": {
                        "type": "string",
                        "description": "Location to search (city, zip code, or address)."
                    },
                    "offset": {
                        "type": "number",
                        "description": "Offset results from the start, default is 0."
                    },
                    "limit": {
                        "type": "number",
                        "description": "Maximum number of results to return, default is 50."
                    }
                },
                "required": ["location"]
            }),
        )
    }

    async fn search(&self, query: &[(String, String)]) -> Result<Value, reqwest::Error> {
        self.client
            .get(format!("{}/for-sale", self.endpoint))
            .header("X-RapidAPI-Key", &self.api_key)
            .header("X-RapidAPI-Host", &self.host)
            .query(query)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }
}

#[async_trait]
impl ToolImplementation for ListingSearch {
    async fn invoke(&self, arguments: Value) -> Result<Value, ToolDefect> {
        let query = query_params(&arguments);
        debug!("Searching listings with {:?}", query);

        match self.search(&query).await {
            Ok(listings) => Ok(listings),
            Err(e) => Ok(Value::String(format!("Error: {}", e))),
        }
    }
}

/// Every non-null argument becomes a query parameter
fn query_params(arguments: &Value) -> Vec<(String, String)> {
    let Some(map) = arguments.as_object() else {
        return Vec::new();
    };
    map.iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| {
            let value = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), value)
        })
        .collect()
}

/// Viewing requests forwarded to a webhook
pub struct ViewingScheduler {
    client: reqwest::Client,
    webhook_url: String,
}

impl ViewingScheduler {
    pub fn new(client: reqwest::Client, webhook_url: &str) -> Self {
        Self {
            client,
            webhook_url: webhook_url.to_string(),
        }
    }

    fn from_config(config: &ViewingConfig, client: reqwest::Client) -> Option<Self> {
        let url = config.webhook_url.as_deref().filter(|u| !u.is_empty())?;
        Some(Self::new(client, url))
    }

    pub fn declaration() -> ToolDeclaration {
        ToolDeclaration::new(
            SCHEDULE_VIEWING,
            "Schedules a property viewing appointment for users.",
            json!({
                "type": "object",
                "properties": {
                    "full_name": {
                        "type": "string",
                        "description": "The full name of the user requesting the viewing."
                    },
                    "email": {
                        "type": "string",
                        "description": "The email address of the user for communication."
                    },
                    "property_id": {
                        "type": "string",
                        "description": "The unique identifier of the property to be viewed."
                    },
                    "date_time": {
                        "type": "string",
                        "description": "The preferred date and time for the viewing in YYYY-MM-DD HH:MM format."
                    }
                },
                "required": ["full_name", "email", "property_id", "date_time"]
            }),
        )
    }
}

#[async_trait]
impl ToolImplementation for ViewingScheduler {
    async fn invoke(&self, arguments: Value) -> Result<Value, ToolDefect> {
        let mut fields = Vec::with_capacity(4);
        for name in ["full_name", "email", "property_id", "date_time"] {
            match arguments.get(name).and_then(Value::as_str) {
                Some(value) => fields.push(value),
                None => return Ok(json!(format!("Missing required parameter: {}", name))),
            }
        }
        let (full_name, email, property_id, date_time) = (fields[0], fields[1], fields[2], fields[3]);

        if !EMAIL_PATTERN.is_match(email) {
            return Ok(json!("Invalid email format. Please provide a valid email address."));
        }

        if NaiveDateTime::parse_from_str(date_time, "%Y-%m-%d %H:%M").is_err() {
            return Ok(json!("Invalid date and time format. Please use YYYY-MM-DD HH:MM."));
        }

        let payload = json!({
            "full_name": full_name,
            "email": email,
            "property_id": property_id,
            "date_time": date_time,
        });

        let response = match self.client.post(&self.webhook_url).json(&payload).send().await {
            Ok(response) => response,
            Err(e) => return Ok(json!(format!("Failed to send data to the webhook: {}", e))),
        };

        let status = response.status().as_u16();
        if status == 200 || status == 201 {
            Ok(json!("Property viewing scheduled successfully."))
        } else {
            let body = response.text().await.unwrap_or_default();
            Ok(json!(format!("Error scheduling property viewing: {}", body)))
        }
    }
}
