//! # hx - command line client for the HALLUX record hub
//!
//! - `hx list` / `hx search <term>` - page through your analyses.
//! - `hx dashboard` / `hx analytics` / `hx stats` - aggregated views.
//! - `hx import <file>` / `hx delete <ids..>` - bulk writes.
//! - `hx metrics` - the hub's query performance report.
//!
//! The hub address comes from `HX_BASE_URL`, the caller from `--user` or
//! `HX_USER_ID`.

use std::path::PathBuf;
use std::process::Command;

use clap::{Parser, Subcommand};
use hx_core::AnalysisResult;
use serde::Deserialize;
use tabled::{Table, Tabled};

const USER_HEADER: &str = "x-user-id";

/// HALLUX - hallucination analysis records.
#[derive(Parser)]
#[command(name = "hx", version, about, long_about = None)]
struct Cli {
    /// Caller id sent as `x-user-id` (falls back to HX_USER_ID).
    #[arg(long, global = true)]
    user: Option<String>,

    /// Print raw JSON instead of tables.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List analyses, newest first.
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Continue from a cursor printed by a previous page.
        #[arg(long)]
        cursor: Option<String>,
        /// low, medium, high or critical.
        #[arg(long)]
        risk: Option<String>,
        /// single, batch or scheduled.
        #[arg(long = "type")]
        kind: Option<String>,
        /// Follow cursors until the last page.
        #[arg(long)]
        all: bool,
    },

    /// Show one analysis.
    Show { id: String },

    /// Search content, full text and file names.
    Search {
        term: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Analyses belonging to a batch.
    Batch { id: String },

    /// Analyses produced by a scheduled scan.
    Scan { id: String },

    /// Recent analyses and the 30-day summary.
    Dashboard,

    /// Aggregated report with weekly rollup.
    Analytics {
        #[arg(long, default_value_t = 30)]
        days: i64,
    },

    /// Lifetime statistics.
    Stats,

    /// Save analyses from a JSON array file as one batch.
    Import { file: PathBuf },

    /// Delete analyses by id.
    Delete {
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Generate demo analyses on the hub.
    Simulate {
        #[arg(long, default_value_t = 100)]
        count: usize,
        #[arg(long, default_value_t = 30)]
        days: i64,
    },

    /// Query performance report of the hub.
    Metrics {
        /// Drop every retained sample.
        #[arg(long)]
        clear: bool,
        #[arg(long, default_value_t = 10)]
        recent: usize,
    },

    /// Launch the record hub.
    Hub {
        /// Server bind address.
        #[arg(long, default_value = "127.0.0.1:3000")]
        bind: String,

        /// Demo analyses generated at startup.
        #[arg(long, default_value_t = 0)]
        demo_rows: usize,
    },
}

// =============================================================================
// Output
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Page {
    data: Vec<AnalysisResult>,
    has_more: bool,
    next_cursor: Option<String>,
}

#[derive(Tabled)]
struct AnalysisRow {
    id: String,
    created: String,
    accuracy: String,
    risk: String,
    #[tabled(rename = "type")]
    kind: String,
    findings: usize,
    content: String,
}

impl From<&AnalysisResult> for AnalysisRow {
    fn from(r: &AnalysisResult) -> Self {
        Self {
            id: r.id.clone(),
            created: r.timestamp.format("%Y-%m-%d %H:%M").to_string(),
            accuracy: format!("{:.1}", r.accuracy),
            risk: r.risk_level.to_string(),
            kind: r.analysis_type.to_string(),
            findings: r.hallucinations.len(),
            content: truncate(&r.content, 48),
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let cut: String = s.chars().take(max.saturating_sub(1)).collect();
    format!("{}…", cut)
}

fn print_analyses(results: &[AnalysisResult]) {
    if results.is_empty() {
        println!("No analyses.");
        return;
    }
    let rows: Vec<AnalysisRow> = results.iter().map(AnalysisRow::from).collect();
    println!("{}", Table::new(rows));
}

fn print_json(value: &serde_json::Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(e) => eprintln!("Error: {}", e),
    }
}

// =============================================================================
// Entry
// =============================================================================

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Hub { bind, demo_rows } => {
            eprintln!("HALLUX: Launching record hub...");
            eprintln!("   Bind:      {}", bind);
            eprintln!("   Demo rows: {}", demo_rows);
            eprintln!();

            let demo = demo_rows.to_string();
            let status = Command::new("cargo")
                .args([
                    "run",
                    "-p",
                    "hx-hub",
                    "--",
                    "--bind",
                    &bind,
                    "--demo-rows",
                    &demo,
                ])
                .status();

            match status {
                Ok(s) if s.success() => {}
                Ok(s) => {
                    eprintln!("Hub exited with: {}", s);
                    std::process::exit(1);
                }
                Err(e) => {
                    eprintln!("Failed to launch hub: {}", e);
                    std::process::exit(1);
                }
            }
        }

        cmd => {
            let user = cli
                .user
                .or_else(|| std::env::var("HX_USER_ID").ok())
                .unwrap_or_default();
            if user.trim().is_empty() {
                eprintln!("Error: no user given (use --user or HX_USER_ID)");
                std::process::exit(2);
            }

            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    eprintln!("Failed to build tokio runtime: {}", e);
                    std::process::exit(1);
                }
            };

            let hub = HubClient::new(user);
            if let Err(e) = rt.block_on(async_main(&hub, cmd, cli.json)) {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
    }
}

async fn async_main(hub: &HubClient, cmd: Commands, raw: bool) -> Result<(), String> {
    match cmd {
        Commands::List {
            limit,
            mut cursor,
            risk,
            kind,
            all,
        } => loop {
            let mut query = vec![("limit", limit.to_string())];
            if let Some(c) = &cursor {
                query.push(("cursor", c.clone()));
            }
            if let Some(r) = &risk {
                query.push(("risk_level", r.to_lowercase()));
            }
            if let Some(k) = &kind {
                query.push(("analysis_type", k.to_lowercase()));
            }
            let value = hub.get("/api/analyses", &query).await?;
            let next = show_page(value, raw)?;
            match next {
                Some(c) if all => cursor = Some(c),
                _ => return Ok(()),
            }
        },

        Commands::Show { id } => {
            let value = hub.get_item(&["api", "analyses", &id]).await?;
            print_json(&value);
            Ok(())
        }

        Commands::Search { term, limit } => {
            let value = hub
                .get(
                    "/api/analyses/search",
                    &[("q", term), ("limit", limit.to_string())],
                )
                .await?;
            show_page(value, raw).map(|_| ())
        }

        Commands::Batch { id } => {
            let value = hub.get_item(&["api", "batches", &id]).await?;
            show_list(value, raw)
        }

        Commands::Scan { id } => {
            let value = hub.get_item(&["api", "scans", &id]).await?;
            show_list(value, raw)
        }

        Commands::Dashboard => {
            let value = hub.get("/api/dashboard", &[]).await?;
            if raw {
                print_json(&value);
                return Ok(());
            }
            if let Some(recent) = value.get("recent") {
                show_list(recent.clone(), false)?;
            }
            if let Some(summary) = value.get("summary") {
                println!("Last 30 days:");
                print_json(summary);
            }
            Ok(())
        }

        Commands::Analytics { days } => {
            let value = hub
                .get("/api/analytics", &[("days", days.to_string())])
                .await?;
            print_json(&value);
            Ok(())
        }

        Commands::Stats => {
            let value = hub.get("/api/statistics", &[]).await?;
            print_json(&value);
            Ok(())
        }

        Commands::Import { file } => {
            let content = std::fs::read_to_string(&file)
                .map_err(|e| format!("cannot read {}: {}", file.display(), e))?;
            let analyses: serde_json::Value = serde_json::from_str(&content)
                .map_err(|e| format!("{} is not JSON: {}", file.display(), e))?;
            if !analyses.is_array() {
                return Err(format!("{} must hold a JSON array", file.display()));
            }
            let payload = serde_json::json!({ "analyses": analyses });
            let value = hub.send(reqwest::Method::POST, "/api/analyses/batch", &payload).await?;
            print_json(&value);
            Ok(())
        }

        Commands::Delete { ids } => {
            let payload = serde_json::json!({ "ids": ids });
            let value = hub.send(reqwest::Method::DELETE, "/api/analyses", &payload).await?;
            print_json(&value);
            Ok(())
        }

        Commands::Simulate { count, days } => {
            let payload = serde_json::json!({ "count": count, "days": days });
            let value = hub.send(reqwest::Method::POST, "/api/simulate", &payload).await?;
            print_json(&value);
            Ok(())
        }

        Commands::Metrics { clear, recent } => {
            if clear {
                hub.delete("/api/metrics/queries").await?;
                println!("Query metrics cleared.");
                return Ok(());
            }
            let value = hub
                .get("/api/metrics/queries", &[("recent", recent.to_string())])
                .await?;
            print_json(&value);
            Ok(())
        }

        Commands::Hub { .. } => Ok(()),
    }
}

/// Print one page; returns the cursor of the next one.
fn show_page(value: serde_json::Value, raw: bool) -> Result<Option<String>, String> {
    if raw {
        print_json(&value);
    }
    let page: Page = serde_json::from_value(value).map_err(|e| e.to_string())?;
    if !raw {
        print_analyses(&page.data);
        if let (true, Some(c)) = (page.has_more, &page.next_cursor) {
            println!("More results: --cursor {}", c);
        }
    }
    Ok(page.next_cursor.filter(|_| page.has_more))
}

fn show_list(value: serde_json::Value, raw: bool) -> Result<(), String> {
    if raw {
        print_json(&value);
        return Ok(());
    }
    let results: Vec<AnalysisResult> = serde_json::from_value(value).map_err(|e| e.to_string())?;
    print_analyses(&results);
    Ok(())
}

// =============================================================================
// HTTP
// =============================================================================

struct HubClient {
    client: reqwest::Client,
    base_url: String,
    user: String,
}

impl HubClient {
    fn new(user: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: std::env::var("HX_BASE_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:3000".to_string()),
            user,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<serde_json::Value, String> {
        let req = self
            .client
            .get(self.url(path))
            .header(USER_HEADER, &self.user)
            .query(query);
        read_json(req.send().await).await
    }

    /// GET a resource addressed by path segments, each percent-encoded.
    async fn get_item(&self, segments: &[&str]) -> Result<serde_json::Value, String> {
        let url = self.segment_url(segments)?;
        let req = self.client.get(url).header(USER_HEADER, &self.user);
        read_json(req.send().await).await
    }

    fn segment_url(&self, segments: &[&str]) -> Result<reqwest::Url, String> {
        let mut url = reqwest::Url::parse(&self.base_url).map_err(|e| e.to_string())?;
        url.path_segments_mut()
            .map_err(|_| format!("{} cannot be a base URL", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send(
        &self,
        method: reqwest::Method,
        path: &str,
        json: &serde_json::Value,
    ) -> Result<serde_json::Value, String> {
        let req = self
            .client
            .request(method, self.url(path))
            .header(USER_HEADER, &self.user)
            .json(json);
        read_json(req.send().await).await
    }

    async fn delete(&self, path: &str) -> Result<(), String> {
        let resp = self
            .client
            .delete(self.url(path))
            .header(USER_HEADER, &self.user)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(format!("hub answered {}", resp.status()))
        }
    }
}

async fn read_json(
    resp: Result<reqwest::Response, reqwest::Error>,
) -> Result<serde_json::Value, String> {
    let resp = resp.map_err(|e| e.to_string())?;
    let status = resp.status();
    let body: serde_json::Value = resp.json().await.map_err(|e| e.to_string())?;
    if status.is_success() {
        Ok(body)
    } else {
        let message = body
            .get("error")
            .and_then(|e| e.as_str())
            .map(String::from)
            .unwrap_or_else(|| body.to_string());
        Err(format!("{} ({})", message, status))
    }
}
