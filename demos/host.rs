//! Demo host driving a worker through the bridge.
//!
//! ```text
//! cargo build --bin echo-worker
//! RUST_LOG=worker_bridge=debug cargo run --example host -- ./target/debug/echo-worker
//! ```
//!
//! Any program that speaks the line protocol works, e.g. a Python worker:
//!
//! ```text
//! cargo run --example host -- python_server.py
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing_subscriber::EnvFilter;
use worker_bridge::{Bridge, BridgeBuilder};

#[derive(Serialize)]
struct EchoInput<'a> {
    message: &'a str,
}

#[derive(Deserialize, Debug)]
struct EchoOutput {
    echo: bool,
    seq: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("worker_bridge=info")),
        )
        .init();

    let program = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "./target/debug/echo-worker".to_string());

    let builder = if program.ends_with(".py") {
        BridgeBuilder::python(&program)
    } else {
        Bridge::builder(&program)
    };
    let bridge = builder
        .startup_delay(Duration::from_millis(100))
        .default_timeout(Duration::from_secs(10))
        .health_interval(Duration::from_secs(5))
        .on_memory_pressure(|| tracing::info!("Host asked to release caches"))
        .build();

    bridge.start(false).await?;

    // Fan out a few concurrent requests over the one pipe pair.
    let handles: Vec<_> = (0..5)
        .map(|i| {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.send_command("echo", json!({"n": i})).await })
        })
        .collect();
    for handle in handles {
        println!("echo -> {}", handle.await??);
    }

    let typed: EchoOutput = bridge
        .call("echo", &EchoInput { message: "hello" })
        .await?;
    println!("typed echo -> {:?}", typed);

    match bridge
        .send_command_timeout("ignore", json!({}), Duration::from_millis(200))
        .await
    {
        Ok(v) => println!("ignore -> {}", v),
        Err(e) => println!("ignore -> {}", e),
    }

    println!("healthy: {}", bridge.check_health().await);
    println!("{:#?}", bridge.status());

    bridge.stop().await?;
    Ok(())
}
