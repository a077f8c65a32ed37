use clap::Parser;

/// The command line args for the control plane daemon
#[derive(Parser, Debug, Clone)]
#[clap(version, author)]
pub struct Args {
    /// The path to load the config file from
    #[clap(short, long, default_value = "fleet.yml")]
    pub config: String,
    /// Don't actually call out to any back-end; exercise the engine
    /// against the in-memory repositories and a stub provider only
    #[clap(long, default_value_t)]
    pub dry_run: bool,
}
