//! Current-weather lookup for a list of cities.
//!
//! Each city is looked up in the configured sources in order (OpenWeather
//! first, WeatherAPI as fallback). A reading is accepted only if its
//! temperature lies within [`TEMPERATURE_RANGE`] and it has a description.
//! Readings carry the city's [`Region`] when the source reports where the
//! city is.

use crate::handler::{HandlerError, JobHandler};
use crate::region::Region;
use async_trait::async_trait;
use futures::future::join_all;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Accepted temperatures, in °C
pub const TEMPERATURE_RANGE: (f64, f64) = (-50.0, 50.0);

pub const OPENWEATHER_KEY_ENV: &str = "OPENWEATHER_API_KEY";
pub const WEATHERAPI_KEY_ENV: &str = "WEATHERAPI_KEY";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WeatherConfig {
    pub openweather_url: String,
    pub weatherapi_url: String,
    pub openweather_api_key: Option<String>,
    pub weatherapi_key: Option<String>,
    pub request_timeout_ms: u64,
}

impl Default for WeatherConfig {
    fn default() -> Self {
        WeatherConfig {
            openweather_url: "http://api.openweathermap.org/data/2.5".to_string(),
            weatherapi_url: "http://api.weatherapi.com/v1".to_string(),
            openweather_api_key: None,
            weatherapi_key: None,
            request_timeout_ms: 10_000,
        }
    }
}

impl WeatherConfig {
    /// Fill missing API keys from the environment
    pub fn with_env_keys(mut self) -> Self {
        if self.openweather_api_key.is_none() {
            self.openweather_api_key = std::env::var(OPENWEATHER_KEY_ENV).ok();
        }
        if self.weatherapi_key.is_none() {
            self.weatherapi_key = std::env::var(WEATHERAPI_KEY_ENV).ok();
        }
        self
    }

    /// HTTP sources for every provider with a key, primary first
    pub fn sources(&self) -> Result<Vec<Arc<dyn WeatherSource>>, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(self.request_timeout_ms))
            .build()?;

        let mut sources: Vec<Arc<dyn WeatherSource>> = Vec::new();
        match &self.openweather_api_key {
            Some(key) => sources.push(Arc::new(HttpWeatherSource::new(
                Provider::OpenWeather,
                client.clone(),
                &self.openweather_url,
                key,
            ))),
            None => warn!("{} not set, OpenWeather disabled", OPENWEATHER_KEY_ENV),
        }
        match &self.weatherapi_key {
            Some(key) => sources.push(Arc::new(HttpWeatherSource::new(
                Provider::WeatherApi,
                client,
                &self.weatherapi_url,
                key,
            ))),
            None => warn!("{} not set, WeatherAPI disabled", WEATHERAPI_KEY_ENV),
        }

        Ok(sources)
    }

    pub fn build_handler(&self) -> Result<WeatherHandler, reqwest::Error> {
        Ok(WeatherHandler::new(self.sources()?))
    }
}

/// A validated reading
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub temperature_c: f64,
    pub description: String,
    pub region: Option<Region>,
}

impl Observation {
    fn validate(self) -> Result<Self, SourceError> {
        let (low, high) = TEMPERATURE_RANGE;
        if !self.temperature_c.is_finite() || self.temperature_c < low || self.temperature_c > high {
            return Err(SourceError::Invalid(format!(
                "temperature {}°C outside valid range",
                self.temperature_c
            )));
        }
        if self.description.trim().is_empty() {
            return Err(SourceError::Invalid("empty description".to_string()));
        }
        Ok(self)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SourceError {
    #[error("city not found")]
    NotFound,

    /// The source answered but the reading is unusable
    #[error("invalid weather data: {0}")]
    Invalid(String),

    /// The source refused the request (bad key, bad query)
    #[error("request rejected: {0}")]
    Rejected(String),

    /// Network failure, timeout, rate limiting or server error
    #[error("source unavailable: {0}")]
    Transient(String),
}

#[async_trait]
pub trait WeatherSource: Send + Sync {
    fn name(&self) -> &str;

    async fn current(&self, city: &str) -> Result<Observation, SourceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    /// `GET {base}/weather?q=..&units=metric&appid=..`
    OpenWeather,
    /// `GET {base}/current.json?key=..&q=..`
    WeatherApi,
}

pub struct HttpWeatherSource {
    provider: Provider,
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpWeatherSource {
    pub fn new(provider: Provider, client: reqwest::Client, base_url: &str, api_key: &str) -> Self {
        HttpWeatherSource {
            provider,
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }
}

#[async_trait]
impl WeatherSource for HttpWeatherSource {
    fn name(&self) -> &str {
        match self.provider {
            Provider::OpenWeather => "openweather",
            Provider::WeatherApi => "weatherapi",
        }
    }

    async fn current(&self, city: &str) -> Result<Observation, SourceError> {
        let request = match self.provider {
            Provider::OpenWeather => self
                .client
                .get(format!("{}/weather", self.base_url))
                .query(&[("q", city), ("units", "metric"), ("appid", self.api_key.as_str())]),
            Provider::WeatherApi => self
                .client
                .get(format!("{}/current.json", self.base_url))
                .query(&[("key", self.api_key.as_str()), ("q", city)]),
        };

        let response = request
            .send()
            .await
            .map_err(|e| SourceError::Transient(e.to_string()))?;

        classify_status(response.status())?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| SourceError::Invalid(e.to_string()))?;

        match self.provider {
            Provider::OpenWeather => parse_openweather(&body),
            Provider::WeatherApi => parse_weatherapi(&body),
        }
    }
}

fn classify_status(status: StatusCode) -> Result<(), SourceError> {
    if status.is_success() {
        Ok(())
    } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Err(SourceError::Transient(format!("HTTP {}", status)))
    } else if status == StatusCode::NOT_FOUND || status == StatusCode::BAD_REQUEST {
        // WeatherAPI answers 400 for an unknown location
        Err(SourceError::NotFound)
    } else {
        Err(SourceError::Rejected(format!("HTTP {}", status)))
    }
}

fn parse_openweather(body: &Value) -> Result<Observation, SourceError> {
    let temperature_c = body["main"]["temp"]
        .as_f64()
        .ok_or_else(|| SourceError::Invalid("temperature is not a number".to_string()))?;
    let description = body["weather"][0]["description"]
        .as_str()
        .ok_or_else(|| SourceError::Invalid("description is not a string".to_string()))?;

    Observation {
        temperature_c,
        description: description.to_string(),
        region: body["sys"]["country"]
            .as_str()
            .and_then(Region::from_country_code),
    }
    .validate()
}

fn parse_weatherapi(body: &Value) -> Result<Observation, SourceError> {
    let temperature_c = body["current"]["temp_c"]
        .as_f64()
        .ok_or_else(|| SourceError::Invalid("temperature is not a number".to_string()))?;
    let description = body["current"]["condition"]["text"]
        .as_str()
        .ok_or_else(|| SourceError::Invalid("description is not a string".to_string()))?;

    Observation {
        temperature_c,
        description: description.to_lowercase(),
        region: body["location"]["tz_id"]
            .as_str()
            .and_then(Region::from_time_zone),
    }
    .validate()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherRequest {
    pub cities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CityWeather {
    pub city: String,
    /// Formatted as `<t>°C`
    pub temperature: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<Region>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherReport {
    pub cities: Vec<CityWeather>,
    /// Cities no source could resolve
    pub unresolved: Vec<String>,
}

impl WeatherReport {
    pub fn in_region(&self, region: Region) -> impl Iterator<Item = &CityWeather> {
        self.cities
            .iter()
            .filter(move |city| city.region == Some(region))
    }
}

impl WeatherRequest {
    /// Non-empty list of non-blank names
    pub fn validate(&self) -> Result<(), String> {
        if self.cities.is_empty() {
            return Err("at least one city is required".to_string());
        }
        if self.cities.iter().any(|city| city.trim().is_empty()) {
            return Err("city names must not be blank".to_string());
        }
        Ok(())
    }
}

enum Lookup {
    Found(Observation),
    Unresolved,
    Unavailable(String),
}

/// Handler registered under [`jobq_core::WEATHER_HANDLER`]
pub struct WeatherHandler {
    sources: Vec<Arc<dyn WeatherSource>>,
}

impl WeatherHandler {
    pub fn new(sources: Vec<Arc<dyn WeatherSource>>) -> Self {
        WeatherHandler { sources }
    }

    async fn lookup(&self, city: &str) -> Lookup {
        let mut transient = None;

        for source in &self.sources {
            match source.current(city).await {
                Ok(observation) => {
                    debug!(city, source = source.name(), "Resolved weather");
                    return Lookup::Found(observation);
                }
                Err(SourceError::Transient(e)) => {
                    warn!(city, source = source.name(), "Weather source unavailable: {}", e);
                    transient = Some(format!("{}: {}", source.name(), e));
                }
                Err(e) => {
                    info!(city, source = source.name(), "Falling back: {}", e);
                }
            }
        }

        match transient {
            Some(error) => Lookup::Unavailable(error),
            None => Lookup::Unresolved,
        }
    }
}

#[async_trait]
impl JobHandler for WeatherHandler {
    type Input = WeatherRequest;
    type Output = WeatherReport;

    async fn handle(&self, input: WeatherRequest) -> Result<WeatherReport, HandlerError> {
        input.validate().map_err(HandlerError::Unrecoverable)?;
        if self.sources.is_empty() {
            return Err(HandlerError::Unrecoverable(
                "no weather source configured".to_string(),
            ));
        }

        let cities: Vec<String> = input.cities.iter().map(|c| c.trim().to_string()).collect();
        let lookups = join_all(cities.iter().map(|city| self.lookup(city))).await;

        let mut report = WeatherReport {
            cities: Vec::new(),
            unresolved: Vec::new(),
        };
        for (city, lookup) in cities.into_iter().zip(lookups) {
            match lookup {
                Lookup::Found(observation) => report.cities.push(CityWeather {
                    city,
                    temperature: format!("{:.1}°C", observation.temperature_c),
                    description: observation.description,
                    region: observation.region,
                }),
                Lookup::Unresolved => report.unresolved.push(city),
                Lookup::Unavailable(error) => {
                    return Err(HandlerError::Recoverable(format!(
                        "weather lookup for {} failed: {}",
                        city, error
                    )))
                }
            }
        }

        if report.cities.is_empty() {
            return Err(HandlerError::Unrecoverable(format!(
                "no weather data for: {}",
                report.unresolved.join(", ")
            )));
        }

        Ok(report)
    }
}
