use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use weft_core::config::{ClientConfig, ServerConfig};

/// Distribute resumable tasks across an elastic pool of worker nodes.
#[derive(Parser, Debug)]
#[command(name = "weft", about = "Distribute resumable tasks across worker nodes")]
pub struct CliArgs {
    /// Config profile; keys are read as {PROFILE}_{KEY} before {KEY}
    #[arg(long, env = "WEFT_PROFILE", default_value = "", global = true)]
    pub profile: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the coordinator
    Serve(ServeArgs),
    /// Run a worker node against a coordinator
    Work(WorkArgs),
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to listen on (overrides WEFT_LISTEN)
    #[arg(long)]
    pub listen: Option<String>,

    /// Seconds of silence before a node is dropped
    #[arg(long)]
    pub node_timeout_secs: Option<u64>,

    /// Fixed server identity instead of a random one
    #[arg(long)]
    pub server_id: Option<u64>,

    /// Submit this many demonstration tasks on startup
    #[arg(long, default_value_t = 0)]
    pub demo_tasks: u32,

    /// Count each demonstration task up to this value
    #[arg(long, default_value_t = 100)]
    pub demo_target: u64,

    /// Delay between demonstration task steps, in milliseconds
    #[arg(long, default_value_t = 500)]
    pub demo_step_ms: u64,
}

impl ServeArgs {
    pub fn apply(&self, config: &mut ServerConfig) {
        if let Some(listen) = &self.listen {
            config.listen = listen.clone();
        }
        if let Some(secs) = self.node_timeout_secs {
            config.node_timeout = Duration::from_secs(secs);
        }
        if self.server_id.is_some() {
            config.server_id = self.server_id;
        }
    }
}

#[derive(Args, Debug)]
pub struct WorkArgs {
    /// Coordinator base URL (overrides WEFT_SERVER_URL)
    #[arg(long)]
    pub server: Option<String>,

    /// Heartbeat interval when the task is slow to checkpoint
    #[arg(long)]
    pub resync_secs: Option<u64>,

    #[arg(long)]
    pub sites: Option<u32>,

    #[arg(long)]
    pub memory_mb: Option<u64>,

    #[arg(long)]
    pub cpus: Option<u32>,

    /// Expected node lifetime in seconds
    #[arg(long)]
    pub lifetime_secs: Option<u64>,
}

impl WorkArgs {
    pub fn apply(&self, config: &mut ClientConfig) {
        if let Some(server) = &self.server {
            config.server_url = server.clone();
        }
        if let Some(secs) = self.resync_secs {
            config.resync_interval = Duration::from_secs(secs);
        }
        let caps = &mut config.capabilities;
        if let Some(sites) = self.sites {
            caps.sites = sites;
        }
        if let Some(memory_mb) = self.memory_mb {
            caps.memory_mb = memory_mb;
        }
        if let Some(cpus) = self.cpus {
            caps.cpus = cpus;
        }
        if let Some(secs) = self.lifetime_secs {
            caps.lifetime = Some(Duration::from_secs(secs));
        }
    }
}
