use anyhow::Context;
use clap::Parser;
use pstb::{
    config::{set_logger, ConfigArgs},
    master::ExperimentMaster,
};

#[derive(clap::Parser, Debug)]
#[command(name = "pstb", version, about)]
struct Cli {
    #[command(subcommand)]
    sub_command: SubCommand,
}

#[derive(clap::Subcommand, Debug)]
enum SubCommand {
    /// Run the throughput master until the experiment converges.
    Master(ConfigArgs),
}

async fn run_master(args: ConfigArgs) -> anyhow::Result<()> {
    let config = args.build()?;
    let master =
        ExperimentMaster::bind(config.listen_addr, config.roster.clone(), config.settings).await?;
    let local_addr = master.local_addr();
    tracing::info!(%local_addr, context = %config.context, "Master listening");
    println!("{}", local_addr.port());
    if let Some(port_file) = &config.port_file {
        std::fs::write(port_file, local_addr.port().to_string())
            .with_context(|| format!("writing port file {}", port_file.display()))?;
    }

    let run = async {
        match config.timeout {
            Some(timeout) => tokio::time::timeout(timeout, master.run())
                .await
                .map_err(|_| anyhow::anyhow!("run did not finish within {timeout:?}"))?
                .map_err(anyhow::Error::from),
            None => master.run().await.map_err(anyhow::Error::from),
        }
    };
    let diary = tokio::select! {
        _ = tokio::signal::ctrl_c() => anyhow::bail!("interrupted"),
        diary = run => diary?,
    };

    let path = diary.save(&config.diary_dir, &config.context)?;
    println!("diary: {}", path.display());
    if let Some(final_throughput) = diary.final_throughput() {
        println!("final throughput: {final_throughput} msg/s");
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.sub_command {
        SubCommand::Master(args) => {
            set_logger(args.log_level);
            let rt = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            rt.block_on(run_master(args))
        }
    }
}
