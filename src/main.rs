//! Entry point. No CLI flags: a `.env` file (or the environment) drives the
//! whole run. Exits non-zero on fatal startup errors; per-item failures end
//! up in the report instead.

use std::path::Path;

use anyhow::Context;
use tracing::info;

use sn_facility_updater::browser::BrowserSession;
use sn_facility_updater::config::Config;
use sn_facility_updater::report::{self, Outcome, REPORT_FILE};
use sn_facility_updater::{sheet, workflow};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let _guard = sn_facility_updater::init_logging();

    let cfg = Config::from_env().context("invalid configuration")?;
    info!("Starting facility-type update against {}", cfg.instance_url);

    // Spreadsheet problems must surface before any browser exists.
    let values = sheet::read_identifiers(&cfg)?;
    match cfg.max_rows {
        Some(cap) => info!(
            "Items to process ({}): {} (capped at {})",
            cfg.excel_column,
            values.len(),
            cap
        ),
        None => info!("Items to process ({}): {}", cfg.excel_column, values.len()),
    }

    let session = BrowserSession::launch(&cfg).await?;
    let result = run(&session, &cfg, &values).await;
    // Released exactly once, whatever the loop did.
    session.close().await;

    let outcomes = result?;
    report::write_report(Path::new(REPORT_FILE), &outcomes)?;
    info!("Run complete");
    Ok(())
}

async fn run(
    session: &BrowserSession,
    cfg: &Config,
    values: &[String],
) -> anyhow::Result<Vec<Outcome>> {
    workflow::login(session, cfg)
        .await
        .context("login step failed")?;
    let outcomes = workflow::process_all(values, |value| async move {
        workflow::process_item(session, cfg, &value).await
    })
    .await;
    Ok(outcomes)
}
