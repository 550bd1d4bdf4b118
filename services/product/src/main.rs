//! product-demo - 拦截链演示入口

use std::sync::Arc;

use anyhow::Context;
use product_service::{ProductClient, ProductService, demo};
use relay_bootstrap::{
    MetricsRecorder, client_channel, init_runtime, loopback_transport, pipeline_sink,
    server_builder, shutdown_signal,
};
use relay_config::AppConfig;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config_dir = std::env::args().nth(1).unwrap_or_else(|| "config".to_string());
    let config = AppConfig::load(&config_dir)
        .with_context(|| format!("failed to load config from {config_dir}"))?;
    let metrics = init_runtime(&config);

    let sink = pipeline_sink(&config);
    let server = ProductService::new()
        .register(server_builder(&config, sink.clone()))
        .build();
    let channel = client_channel(&config, loopback_transport(&config, Arc::new(server)), sink).build();
    let client = ProductClient::new(channel);

    tokio::select! {
        result = run(&client) => result?,
        _ = shutdown_signal() => info!("Demo interrupted"),
    }

    if let Some(metrics) = metrics {
        print_metrics(&metrics);
    }
    Ok(())
}

async fn run(client: &ProductClient) -> anyhow::Result<()> {
    let product = demo::call_unary_get_product(client, "1234")
        .await
        .context("GetProduct failed")?;
    println!("GetProduct: {} {}", product.name, product.price);

    let responses = demo::call_bidirectional_streaming(client, 5)
        .await
        .context("BidirectionalStreaming failed")?;
    for response in &responses {
        println!("Received: {} {}", response.name, response.price);
    }
    Ok(())
}

fn print_metrics(metrics: &MetricsRecorder) {
    println!("{}", metrics.render());
}
