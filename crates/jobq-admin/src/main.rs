use anyhow::{anyhow, bail};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Table};
use jobq_core::WEATHER_HANDLER;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "jobq-admin")]
#[command(about = "Job queue admin CLI", long_about = None)]
struct Args {
    /// REST API address
    #[arg(long, env = "JOBQ_API", default_value = "http://127.0.0.1:8080")]
    api: String,

    /// Output format (json, table, yaml)
    #[arg(short, long, default_value = "table")]
    format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit a job
    Submit {
        /// Handler name
        #[arg(long, default_value = WEATHER_HANDLER)]
        handler: String,

        /// Inline JSON payload
        #[arg(short, long, conflicts_with = "payload_file")]
        payload: Option<String>,

        /// File holding the JSON payload
        #[arg(long)]
        payload_file: Option<String>,

        /// Attempt ceiling (broker default when omitted)
        #[arg(short, long)]
        max_attempts: Option<u32>,
    },

    /// Submit a weather lookup
    Weather {
        /// City names
        #[arg(required = true)]
        cities: Vec<String>,
    },

    /// Get job status
    Status {
        /// Job ID
        job_id: String,
    },

    /// Get the outcome of a finished job
    Result {
        /// Job ID
        job_id: String,
    },

    /// Wait until a job finishes
    Wait {
        /// Job ID
        job_id: String,

        /// Give up after this many seconds
        #[arg(short, long, default_value = "60")]
        timeout: u64,

        /// Poll interval in milliseconds
        #[arg(long, default_value = "500")]
        poll_ms: u64,
    },

    /// Show finished weather results for a region
    Region {
        /// Europe, Asia, America, Africa or Oceania
        region: String,
    },

    /// Show broker health and queue depth
    Health,
}

/// Thin wrapper over the broker REST API
struct ApiClient {
    base: String,
    http: reqwest::Client,
}

impl ApiClient {
    fn new(base: &str) -> Self {
        ApiClient {
            base: base.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    async fn get(&self, path: &str) -> anyhow::Result<(StatusCode, Value)> {
        let response = self.http.get(format!("{}{}", self.base, path)).send().await?;
        read_body(response).await
    }

    async fn post(&self, path: &str, body: &Value) -> anyhow::Result<(StatusCode, Value)> {
        let response = self
            .http
            .post(format!("{}{}", self.base, path))
            .json(body)
            .send()
            .await?;
        read_body(response).await
    }
}

async fn read_body(response: reqwest::Response) -> anyhow::Result<(StatusCode, Value)> {
    let status = response.status();
    let text = response.text().await?;
    let body = if text.is_empty() {
        Value::Null
    } else {
        serde_json::from_str(&text).unwrap_or(Value::String(text))
    };
    Ok((status, body))
}

/// Fail with the server's error message unless the status is a success
fn expect_success(status: StatusCode, body: Value) -> anyhow::Result<Value> {
    if status.is_success() {
        return Ok(body);
    }
    let message = body["error"]
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| body.to_string());
    Err(anyhow!("{} ({})", message, status))
}

fn parse_payload(inline: Option<String>, file: Option<String>) -> anyhow::Result<Value> {
    let text = match (inline, file) {
        (Some(inline), _) => inline,
        (None, Some(path)) => std::fs::read_to_string(&path)?,
        (None, None) => return Ok(Value::Null),
    };
    Ok(serde_json::from_str(&text)?)
}

fn parse_id(job_id: &str) -> anyhow::Result<Uuid> {
    Uuid::parse_str(job_id).map_err(|e| anyhow!("invalid job id '{}': {}", job_id, e))
}

/// Print `value` in the requested format; `rows` renders the table form
fn print_value(format: &str, value: &Value, rows: fn(&Value) -> Vec<(String, String)>) -> anyhow::Result<()> {
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(value)?),
        "yaml" => println!("{}", serde_yaml::to_string(value)?),
        _ => {
            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_header(vec!["Field", "Value"]);
            for (field, value) in rows(value) {
                table.add_row(vec![field, value]);
            }
            println!("{table}");
        }
    }
    Ok(())
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn submitted_rows(value: &Value) -> Vec<(String, String)> {
    vec![
        ("ID".to_string(), text(&value["id"])),
        ("State".to_string(), text(&value["state"])),
    ]
}

fn job_rows(job: &Value) -> Vec<(String, String)> {
    let mut rows = vec![
        ("ID".to_string(), text(&job["id"])),
        ("Handler".to_string(), text(&job["handler_name"])),
        ("State".to_string(), text(&job["state"])),
        (
            "Attempt".to_string(),
            format!("{} / {}", text(&job["attempt"]), text(&job["max_attempts"])),
        ),
        ("Runs".to_string(), text(&job["runs"])),
        ("Created".to_string(), text(&job["created_at"])),
        ("Updated".to_string(), text(&job["updated_at"])),
    ];
    for (label, key) in [
        ("Retry At", "retry_at"),
        ("Last Error", "last_error"),
        ("Error", "error"),
        ("Result", "result"),
    ] {
        if !job[key].is_null() {
            rows.push((label.to_string(), text(&job[key])));
        }
    }
    rows
}

fn result_rows(outcome: &Value) -> Vec<(String, String)> {
    let mut rows = vec![
        ("ID".to_string(), text(&outcome["id"])),
        ("State".to_string(), text(&outcome["state"])),
    ];
    if !outcome["result"].is_null() {
        rows.push(("Result".to_string(), text(&outcome["result"])));
    }
    if !outcome["error"].is_null() {
        rows.push(("Error".to_string(), text(&outcome["error"])));
    }
    rows
}

fn region_rows(view: &Value) -> Vec<(String, String)> {
    let empty = Vec::new();
    view["results"]
        .as_array()
        .unwrap_or(&empty)
        .iter()
        .map(|entry| {
            (
                text(&entry["city"]),
                format!("{} ({})", text(&entry["temperature"]), text(&entry["description"])),
            )
        })
        .collect()
}

fn health_rows(health: &Value) -> Vec<(String, String)> {
    vec![
        ("Status".to_string(), text(&health["status"])),
        ("Ready".to_string(), text(&health["queue"]["ready"])),
        ("Delayed".to_string(), text(&health["queue"]["delayed"])),
        ("Leased".to_string(), text(&health["queue"]["leased"])),
    ]
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let client = ApiClient::new(&args.api);

    match args.command {
        Commands::Submit {
            handler,
            payload,
            payload_file,
            max_attempts,
        } => {
            let mut body = json!({
                "handler_name": handler,
                "payload": parse_payload(payload, payload_file)?,
            });
            if let Some(max_attempts) = max_attempts {
                body["max_attempts"] = json!(max_attempts);
            }

            let (status, response) = client.post("/jobs", &body).await?;
            let response = expect_success(status, response)?;
            print_value(&args.format, &response, submitted_rows)?;
        }

        Commands::Weather { cities } => {
            let (status, response) = client.post("/weather", &json!({ "cities": cities })).await?;
            let response = expect_success(status, response)?;
            print_value(&args.format, &response, submitted_rows)?;
        }

        Commands::Status { job_id } => {
            let id = parse_id(&job_id)?;
            let (status, job) = client.get(&format!("/jobs/{}", id)).await?;
            let job = expect_success(status, job)?;
            print_value(&args.format, &job, job_rows)?;
        }

        Commands::Result { job_id } => {
            let id = parse_id(&job_id)?;
            let (status, outcome) = client.get(&format!("/jobs/{}/result", id)).await?;
            if status == StatusCode::CONFLICT {
                eprintln!("Job {} is not finished (state: {})", id, text(&outcome["state"]));
                std::process::exit(2);
            }
            let outcome = expect_success(status, outcome)?;
            print_value(&args.format, &outcome, result_rows)?;
        }

        Commands::Wait {
            job_id,
            timeout,
            poll_ms,
        } => {
            let id = parse_id(&job_id)?;
            let deadline = Instant::now() + Duration::from_secs(timeout);
            let poll = Duration::from_millis(poll_ms.max(10));

            let outcome = loop {
                let (status, body) = client.get(&format!("/jobs/{}/result", id)).await?;
                if status != StatusCode::CONFLICT {
                    break expect_success(status, body)?;
                }
                if Instant::now() >= deadline {
                    bail!(
                        "Timed out after {}s waiting for job {} (state: {})",
                        timeout,
                        id,
                        text(&body["state"])
                    );
                }
                tokio::time::sleep(poll).await;
            };
            print_value(&args.format, &outcome, result_rows)?;
        }

        Commands::Region { region } => {
            let (status, view) = client.get(&format!("/weather/regions/{}", region)).await?;
            let view = expect_success(status, view)?;
            print_value(&args.format, &view, region_rows)?;
        }

        Commands::Health => {
            let (status, health) = client.get("/health").await?;
            let health = expect_success(status, health)?;
            print_value(&args.format, &health, health_rows)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_payload_sources() {
        assert_eq!(
            parse_payload(Some(r#"{"cities": ["Rome"]}"#.into()), None).unwrap(),
            json!({"cities": ["Rome"]})
        );
        assert_eq!(parse_payload(None, None).unwrap(), Value::Null);
        assert!(parse_payload(Some("{not json".into()), None).is_err());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[1, 2]").unwrap();
        let path = file.path().to_str().unwrap().to_string();
        assert_eq!(parse_payload(None, Some(path)).unwrap(), json!([1, 2]));
    }

    #[test]
    fn test_expect_success_surfaces_server_error() {
        let err = expect_success(
            StatusCode::BAD_REQUEST,
            json!({"error": "Unknown handler: geocode"}),
        )
        .unwrap_err();
        assert!(err.to_string().contains("Unknown handler: geocode"));

        let ok = expect_success(StatusCode::ACCEPTED, json!({"id": "x"})).unwrap();
        assert_eq!(ok["id"], "x");
    }

    #[test]
    fn test_job_rows_skip_missing_fields() {
        let rows = job_rows(&json!({
            "id": "a",
            "handler_name": "weather",
            "state": "retrying",
            "attempt": 1,
            "max_attempts": 3,
            "runs": 1,
            "last_error": "upstream returned 503",
        }));

        assert!(rows.contains(&("Attempt".to_string(), "1 / 3".to_string())));
        assert!(rows.iter().any(|(field, _)| field == "Last Error"));
        assert!(!rows.iter().any(|(field, _)| field == "Result"));
    }

    #[test]
    fn test_region_rows() {
        let rows = region_rows(&json!({
            "region": "Europe",
            "results": [
                {"job_id": "a", "city": "Paris", "temperature": "21.0°C", "description": "clear sky", "region": "Europe"}
            ]
        }));
        assert_eq!(
            rows,
            vec![("Paris".to_string(), "21.0°C (clear sky)".to_string())]
        );
        assert!(region_rows(&json!({"region": "Asia"})).is_empty());
    }
}
