//! `assessment-sync [TYPE...]`

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let requested: Vec<String> = std::env::args().skip(1).collect();

    assessment_sync::run(requested).await?;
    Ok(())
}
