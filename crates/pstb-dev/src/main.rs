use clap::Parser;

mod config;
mod simulation;

use crate::config::{Config, SubCommand};

fn main() -> Result<(), anyhow::Error> {
    let tokio_rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let config = Config::parse();
    pstb::config::set_logger(None);
    tokio_rt.block_on(async move {
        match config.sub_command {
            SubCommand::Simulate(sim_config) => {
                let summary = tokio::select! {
                    _ = tokio::signal::ctrl_c() => anyhow::bail!("interrupted"),
                    summary = simulation::run(sim_config) => summary?,
                };
                println!("{summary}");
                Ok(())
            }
        }
    })
}
