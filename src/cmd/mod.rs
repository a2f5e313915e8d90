//! CLI command handlers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use tracing::{debug, warn};

use moat::config::Config;
use moat::creds::{FileCredentialStore, ProviderRegistry};
use moat::routes::RouteTable;
use moat::run::{CreateOptions, Manager, Run};
use moat::runtime::{DockerRuntime, Runtime, RuntimeKind};
use moat::services::ServiceRegistry;
use moat::store::Store;

#[derive(Subcommand)]
pub enum Commands {
    /// Create a run without starting it
    Create(RunArgs),
    /// Create and start a run
    Run(RunArgs),
    /// List runs, newest first
    List,
    /// Show a single run
    Get {
        /// Run id, id prefix, or name
        id: String,
    },
    /// Resolve an id, id prefix, or name to matching runs
    Resolve { arg: String },
    /// Stop a run
    Stop {
        /// Run id, id prefix, or name
        id: String,
    },
    /// Print a run's captured logs
    Logs {
        /// Run id, id prefix, or name
        id: String,
        /// Only print the last N lines
        #[arg(long)]
        tail: Option<usize>,
    },
    /// Remove a stopped run's record and artifacts
    Rm {
        /// Run id, id prefix, or name
        id: String,
    },
}

#[derive(Args, Clone)]
pub struct RunArgs {
    /// Human-friendly run name; unique among active runs
    #[arg(long)]
    pub name: Option<String>,

    /// Workspace directory mounted into the run
    #[arg(long, default_value = ".")]
    pub workspace: PathBuf,

    /// Capability grant (repeatable): e.g. github, aws, ssh, postgres, docker:host
    #[arg(long = "grant")]
    pub grants: Vec<String>,

    /// Command to run instead of the image default
    #[arg(long)]
    pub cmd: Option<String>,

    /// Extra environment (repeatable): KEY=VALUE
    #[arg(long = "env", value_parser = parse_key_val)]
    pub env: Vec<(String, String)>,

    /// Endpoint port (repeatable): NAME=CONTAINER_PORT
    #[arg(long = "port", value_parser = parse_port)]
    pub ports: Vec<(String, u16)>,

    /// Agent flavor whose config gets injected (claude, codex, gemini)
    #[arg(long, default_value = "claude")]
    pub agent: String,

    /// Override the run image
    #[arg(long)]
    pub image: Option<String>,

    /// Rebuild the run image before starting
    #[arg(long)]
    pub rebuild: bool,

    /// Keep the container around after the run stops
    #[arg(long)]
    pub keep: bool,

    /// Interactive run (stdin attached)
    #[arg(long, short)]
    pub interactive: bool,

    /// Allocate a TTY
    #[arg(long, short)]
    pub tty: bool,

    /// Container runtime to use
    #[arg(long)]
    pub runtime: Option<RuntimeKind>,

    /// Skip the pre-run workspace snapshot
    #[arg(long)]
    pub disable_pre_run_snapshot: bool,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {:?}", s))
}

fn parse_port(s: &str) -> Result<(String, u16), String> {
    let (name, port) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=PORT, got {:?}", s))?;
    let port = port
        .parse()
        .map_err(|_| format!("invalid port in {:?}", s))?;
    Ok((name.to_string(), port))
}

pub async fn execute(command: Commands, config: Config) -> Result<()> {
    let runtime_kind = match &command {
        Commands::Create(args) | Commands::Run(args) => {
            args.runtime.unwrap_or(config.runtime)
        }
        _ => config.runtime,
    };

    let runtime = build_runtime(runtime_kind)?;
    let manager = build_manager(runtime, &config).await?;

    match command {
        Commands::Create(args) => {
            let run = manager.create(create_options(args)?).await?;
            println!("{}  {}", run.id, run.name);
        }
        Commands::Run(args) => {
            let interactive = args.interactive;
            let run = manager.create(create_options(args)?).await?;
            manager.start(&run.id).await?;
            if interactive {
                manager.attach(&run.id).await?;
                manager.stop(&run.id).await?;
            }
            println!("{}  {}  {}", run.id, run.name, run.state());
        }
        Commands::List => {
            println!(
                "{:<18} {:<20} {:<9} {:<24} {}",
                "ID", "NAME", "STATE", "CREATED", "IMAGE"
            );
            for run in manager.list() {
                println!(
                    "{:<18} {:<20} {:<9} {:<24} {}",
                    run.id,
                    run.name,
                    run.state().to_string(),
                    run.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
                    run.image,
                );
            }
        }
        Commands::Get { id } => {
            let run = resolve_one(&manager, &id)?;
            print_run(&run);
        }
        Commands::Resolve { arg } => {
            for run in manager.resolve(&arg)? {
                println!("{}  {}  {}", run.id, run.name, run.state());
            }
        }
        Commands::Stop { id } => {
            let run = resolve_one(&manager, &id)?;
            manager.stop(&run.id).await?;
            println!("{} stopped", run.id);
        }
        Commands::Logs { id, tail } => {
            let run = resolve_one(&manager, &id)?;
            print!("{}", manager.logs(&run.id, tail)?);
        }
        Commands::Rm { id } => {
            let run = resolve_one(&manager, &id)?;
            manager.remove(&run.id).await?;
            println!("{} removed", run.id);
        }
    }

    Ok(())
}

fn build_runtime(kind: RuntimeKind) -> Result<Arc<dyn Runtime>> {
    match kind {
        RuntimeKind::Docker => Ok(Arc::new(
            DockerRuntime::connect().context("cannot connect to the Docker daemon")?,
        )),
        RuntimeKind::Apple => {
            bail!("the apple container runtime is only available on macOS hosts")
        }
    }
}

async fn build_manager(runtime: Arc<dyn Runtime>, config: &Config) -> Result<Manager> {
    let store = Store::new(&config.state_dir)?;
    let routes = RouteTable::load(&config.routes_dir)?;
    let creds = Arc::new(FileCredentialStore::load(
        config
            .state_dir
            .parent()
            .unwrap_or(&config.state_dir),
    )?);

    let manager = Manager::new(
        runtime,
        store,
        routes,
        creds,
        ProviderRegistry::builtin(),
        ServiceRegistry::builtin(),
        Arc::new(config.clone()),
    )
    .await?;
    Ok(manager)
}

fn create_options(args: RunArgs) -> Result<CreateOptions> {
    if args.rebuild {
        // Image builds are handled by the image builder before create.
        debug!("--rebuild has no effect without a configured image builder");
    }

    let workspace = args
        .workspace
        .canonicalize()
        .with_context(|| format!("workspace {} does not exist", args.workspace.display()))?;

    Ok(CreateOptions {
        name: args.name,
        workspace,
        grants: args.grants,
        agent: args.agent,
        image: args.image,
        cmd: args.cmd,
        env: args.env.into_iter().collect::<HashMap<_, _>>(),
        ports: args.ports.into_iter().collect::<HashMap<_, _>>(),
        interactive: args.interactive,
        tty: args.tty,
        keep_container: args.keep,
        disable_pre_run_snapshot: args.disable_pre_run_snapshot,
    })
}

fn resolve_one(manager: &Manager, arg: &str) -> Result<Arc<Run>> {
    let mut matches = manager.resolve(arg)?;
    if matches.len() > 1 {
        warn!("{} runs match {:?}; using the newest", matches.len(), arg);
        for run in &matches {
            warn!("  {}  {}  {}", run.id, run.name, run.state());
        }
    }
    Ok(matches.remove(0))
}

fn print_run(run: &Run) {
    println!("id:         {}", run.id);
    println!("name:       {}", run.name);
    println!("state:      {}", run.state());
    println!("agent:      {}", run.agent);
    println!("image:      {}", run.image);
    println!("workspace:  {}", run.workspace.display());
    if !run.grants.is_empty() {
        println!("grants:     {}", run.grants.join(", "));
    }
    if let Some(container_id) = run.container_id() {
        println!("container:  {}", container_id);
    }
    println!("created:    {}", run.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    if let Some(started) = run.started_at() {
        println!("started:    {}", started.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(stopped) = run.stopped_at() {
        println!("stopped:    {}", stopped.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(error) = run.error() {
        println!("error:      {}", error);
    }
    let host_ports = run.host_ports();
    if !host_ports.is_empty() {
        for (endpoint, port) in host_ports {
            println!("endpoint:   {} -> 127.0.0.1:{}", endpoint, port);
        }
    }
}
