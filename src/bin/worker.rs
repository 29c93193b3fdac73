#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = edugrade_rust::run_worker().await {
        eprintln!("edugrade-worker fatal: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}
