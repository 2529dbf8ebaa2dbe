pub mod config;
pub mod executor;
pub mod handler;
pub mod pool;
pub mod region;
pub mod weather;
mod worker;

pub use config::WorkerConfig;
pub use executor::JobExecutor;
pub use handler::{HandlerError, HandlerRegistry, JobHandler, RegistryError};
pub use pool::WorkerPool;
pub use region::Region;
pub use weather::{CityWeather, WeatherConfig, WeatherHandler, WeatherReport, WeatherRequest};
pub use worker::Worker;
