use anyhow::Result;
use funnelsim::config::Config;
use funnelsim::control::SimService;
use funnelsim::fixtures;
use funnelsim::logging::{log, obj, v_num, v_str, Domain, Level};

/// Demo transport: start one run and print its event stream as JSON lines
/// on stdout. Logs go to stderr. Configuration is env-var driven; see
/// `Config::from_env`.
#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    let total_users = cfg.default_total_users;
    let trigger_interval = cfg.default_trigger_interval;
    let service = SimService::from_config(cfg)?;

    if fixtures::seed_defaults(service.store())? {
        log(Level::Info, Domain::System, "fresh_database_seeded", obj(&[]));
    }

    let run = service.start_run(total_users, Default::default(), trigger_interval)?;
    log(
        Level::Info,
        Domain::System,
        "streaming_run",
        obj(&[("run_id", v_num(run.id as f64)), ("status", v_str(run.status.as_str()))]),
    );

    let mut events = service.open_stream(run.id);
    while let Some(event) = events.recv().await {
        println!("{}", serde_json::to_string(&event)?);
    }
    Ok(())
}
