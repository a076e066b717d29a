//! Load generator for a running `server_dispatch`.
//!
//! Connects `--drivers` simulated responders over the WebSocket (driver ids
//! 1..=N, which must exist in the server's fleet), streams location pings, and
//! files `--reports` reports as public users. Drivers answer each push by
//! accepting (or cancelling, per `--cancel-ratio`) and complete accepted jobs
//! after a short delay so they return to the fleet.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Base HTTP URL of the dispatch server
    #[clap(long, default_value = "http://127.0.0.1:3000")]
    base_url: String,

    /// Number of simulated drivers
    #[clap(long, default_value_t = 10)]
    drivers: i64,

    /// Number of reports to file
    #[clap(long, default_value_t = 100)]
    reports: u64,

    /// Fraction of pushes a driver cancels instead of accepting
    #[clap(long, default_value_t = 0.2)]
    cancel_ratio: f64,

    /// Milliseconds between filed reports
    #[clap(long, default_value_t = 50)]
    report_interval_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Push {
    #[serde(rename = "type")]
    msg_type: String,
    report_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Pending {
    assignment_id: i64,
    report_id: i64,
}

#[derive(Default)]
struct Stats {
    created: AtomicU64,
    no_capacity: AtomicU64,
    failed: AtomicU64,
    pushes: AtomicU64,
    accepted: AtomicU64,
    cancelled: AtomicU64,
    stale: AtomicU64,
    create_latency_ms: AtomicU64,
}

fn ws_url(base: &str) -> String {
    format!("{}/ws", base.replacen("http", "ws", 1))
}

async fn run_driver(args: Args, driver_id: i64, stats: Arc<Stats>) -> Result<()> {
    let mut request = ws_url(&args.base_url).into_client_request()?;
    request.headers_mut().insert("x-user-id", HeaderValue::from_str(&driver_id.to_string())?);
    request.headers_mut().insert("x-user-role", HeaderValue::from_static("Responder"));
    let (ws_stream, _) = connect_async(request)
        .await
        .with_context(|| format!("driver {driver_id} failed to connect"))?;
    let (mut write, mut read) = ws_stream.split();
    let http = reqwest::Client::new();

    let mut ping = tokio::time::interval(Duration::from_secs(2));
    let mut seq: u64 = 0;
    loop {
        tokio::select! {
            _ = ping.tick() => {
                // drift around the city centre
                let jitter = (driver_id as f64 * 0.003) + (seq % 10) as f64 * 0.0005;
                let msg = json!({ "type": "updateLocation", "latitude": 12.95 + jitter, "longitude": 77.58 + jitter });
                write.send(Message::Text(msg.to_string().into())).await?;
                seq += 1;
            }
            msg = read.next() => {
                let Some(Ok(Message::Text(text))) = msg else { break };
                let Ok(push) = serde_json::from_str::<Push>(text.as_str()) else { continue };
                if push.msg_type != "newReport" {
                    continue;
                }
                stats.pushes.fetch_add(1, Ordering::Relaxed);
                answer(&http, &args, driver_id, push.report_id, &stats).await?;
            }
        }
    }
    Ok(())
}

async fn answer(http: &reqwest::Client, args: &Args, driver_id: i64, report_id: i64, stats: &Stats) -> Result<()> {
    let pending: Vec<Pending> = http
        .get(format!("{}/api/driver/pending", args.base_url))
        .header("x-user-id", driver_id)
        .header("x-user-role", "Responder")
        .send()
        .await?
        .json()
        .await?;
    let Some(job) = pending.into_iter().find(|p| p.report_id == report_id) else {
        return Ok(());
    };

    let cancel = (job.assignment_id as f64 * 0.618).fract() < args.cancel_ratio;
    let action = if cancel { "cancel" } else { "accept" };
    let response = http
        .post(format!("{}/api/driver/assignment/{}", args.base_url, job.assignment_id))
        .header("x-user-id", driver_id)
        .header("x-user-role", "Responder")
        .json(&json!({ "action": action }))
        .send()
        .await?;

    match response.status().as_u16() {
        200 if cancel => {
            stats.cancelled.fetch_add(1, Ordering::Relaxed);
        }
        200 => {
            stats.accepted.fetch_add(1, Ordering::Relaxed);
            let http = http.clone();
            let base = args.base_url.clone();
            let assignment_id = job.assignment_id;
            tokio::spawn(async move {
                sleep(Duration::from_millis(500)).await;
                let _ = http
                    .post(format!("{base}/api/driver/assignment/{assignment_id}/complete"))
                    .header("x-user-id", driver_id)
                    .header("x-user-role", "Responder")
                    .send()
                    .await;
            });
        }
        409 => {
            stats.stale.fetch_add(1, Ordering::Relaxed);
        }
        other => println!("driver {driver_id}: unexpected status {other} for {action}"),
    }
    Ok(())
}

async fn file_reports(args: Args, stats: Arc<Stats>) {
    let http = reqwest::Client::new();
    for n in 0..args.reports {
        let body = json!({
            "type": "Booking",
            "latitude": 12.9 + (n % 20) as f64 * 0.005,
            "longitude": 77.6 + (n % 7) as f64 * 0.005,
            "destination": "City General Hospital",
            "description": format!("load test {n}"),
        });
        let started = Instant::now();
        let result = http
            .post(format!("{}/api/report/create", args.base_url))
            .header("x-user-id", 10_000 + n as i64)
            .header("x-user-role", "Public")
            .json(&body)
            .send()
            .await;
        stats
            .create_latency_ms
            .fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);
        match result.map(|r| r.status().as_u16()) {
            Ok(201) => stats.created.fetch_add(1, Ordering::Relaxed),
            Ok(409) => stats.no_capacity.fetch_add(1, Ordering::Relaxed),
            _ => stats.failed.fetch_add(1, Ordering::Relaxed),
        };
        sleep(Duration::from_millis(args.report_interval_ms)).await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let stats = Arc::new(Stats::default());

    println!("Connecting {} drivers to {}...", args.drivers, ws_url(&args.base_url));
    for driver_id in 1..=args.drivers {
        let (args, stats) = (args.clone(), Arc::clone(&stats));
        tokio::spawn(async move {
            if let Err(e) = run_driver(args, driver_id, stats).await {
                println!("driver {driver_id} stopped: {e:#}");
            }
        });
    }
    sleep(Duration::from_secs(1)).await;

    let started = Utc::now();
    file_reports(args.clone(), Arc::clone(&stats)).await;
    // let the last answers land
    sleep(Duration::from_secs(2)).await;

    let filed = args.reports.max(1);
    println!("\n----- Dispatch Load Summary -----");
    println!("Duration:        {}s", (Utc::now() - started).num_seconds());
    println!("Reports created: {}", stats.created.load(Ordering::Relaxed));
    println!("No capacity:     {}", stats.no_capacity.load(Ordering::Relaxed));
    println!("Failed:          {}", stats.failed.load(Ordering::Relaxed));
    println!("Pushes received: {}", stats.pushes.load(Ordering::Relaxed));
    println!("Accepted:        {}", stats.accepted.load(Ordering::Relaxed));
    println!("Cancelled:       {}", stats.cancelled.load(Ordering::Relaxed));
    println!("Stale answers:   {}", stats.stale.load(Ordering::Relaxed));
    println!("Avg create:      {} ms", stats.create_latency_ms.load(Ordering::Relaxed) / filed);
    println!("---------------------------------\n");
    Ok(())
}
