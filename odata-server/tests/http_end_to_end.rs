//! # HTTP End-to-End Tests
//!
//! Runs the server on a real socket and talks to it with an HTTP client, the
//! way an OData consumer would.
//!
//! Tests cover:
//! - JSON batch round trip over TCP
//! - Plain entity requests against the same store the batch wrote to

use std::sync::Arc;

use clap::Parser;
use odata_server::config::ServerConfig;
use odata_server::{router, AppState};
use serde_json::{json, Value};
use tokio::net::TcpListener;

/// Starts a server on an ephemeral port and returns its service root.
async fn start_server() -> anyhow::Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let root = format!("http://{}/odata/", listener.local_addr()?);

    let config = ServerConfig::try_parse_from(["odata-server", "--service-root", root.as_str()])?;
    let state = Arc::new(AppState::new(config, None)?);
    tokio::spawn(async move {
        let _ = axum::serve(listener, router(state)).await;
    });

    Ok(root)
}

#[tokio::test]
async fn test_json_batch_over_http() -> anyhow::Result<()> {
    let root = start_server().await?;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}$batch", root))
        .header("Content-Type", "application/json")
        .body(
            json!({
                "requests": [
                    {"id": "c", "method": "POST", "url": "Customers", "atomicityGroup": "g",
                     "body": {"CustomerID": "ALFKI", "City": "Berlin"}},
                    {"id": "o", "method": "POST", "url": "$c/Orders", "atomicityGroup": "g",
                     "body": {"OrderID": 1, "ShipCity": "Berlin"}},
                    {"id": "r", "method": "GET", "url": "$c/Orders"}
                ]
            })
            .to_string(),
        )
        .send()
        .await?;

    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["odata-version"], "4.0");
    let body: Value = response.json().await?;
    let statuses: Vec<u64> = body["responses"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["status"].as_u64().unwrap())
        .collect();
    assert_eq!(statuses, vec![201, 201, 200]);
    assert_eq!(
        body["responses"][0]["headers"]["location"],
        json!(format!("{}Customers('ALFKI')", root))
    );

    // The store is shared with plain requests
    let customer: Value = client
        .get(format!("{}Customers('ALFKI')", root))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(customer["City"], json!("Berlin"));

    let orders: Value = client
        .get(format!("{}Orders", root))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(orders["value"][0]["OrderID"], json!(1));

    Ok(())
}
