// kagiband: standalone server entry point.

use anyhow::Context;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    kagiban_server::runtime::run().await.context("kagiban server terminated unexpectedly")
}
