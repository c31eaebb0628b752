use crate::simulation::SimulateConfig;

#[derive(clap::Parser, Clone)]
#[clap(name = "PSTB Development Tool")]
#[clap(version)]
pub struct Config {
    #[clap(subcommand)]
    pub sub_command: SubCommand,
}

#[derive(clap::Subcommand, Clone)]
pub enum SubCommand {
    /// Run a whole experiment in process against a simulated engine.
    Simulate(SimulateConfig),
}
