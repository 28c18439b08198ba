//! Detail Consumer Service - Entry Point
//!
//! Enriches queued listings and archives them in S3.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    detail_consumer::run().await
}
