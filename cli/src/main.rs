mod client;
mod view;
mod watch;

use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use reqwest::Method;
use serde_json::Value;

use crate::client::{ApiClient, CliError};
use crate::view::{READY, RUNNING, SimulationSummary};

const WATCH_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "devsim-cli", about = "Console for the devsim IoT device simulator")]
struct Cli {
    #[arg(long, env = "DEVSIM_BASE_URL", default_value = "http://127.0.0.1:6001")]
    base_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// IoT Central applications.
    Target(TargetCommand),
    /// Device models.
    Model(ModelCommand),
    /// Simulations.
    Sim(SimCommand),
    Config(ConfigCommand),
}

#[derive(Args, Debug)]
struct TargetCommand {
    #[command(subcommand)]
    command: TargetSubcommand,
}

#[derive(Subcommand, Debug)]
enum TargetSubcommand {
    List,
    Get {
        id: String,
    },
    Add {
        #[arg(long)]
        file: String,
        /// Import the application's device templates as models.
        #[arg(long, default_value_t = false)]
        import_models: bool,
    },
    Update {
        #[arg(long)]
        file: String,
    },
    Delete {
        id: String,
    },
    /// Import device templates from an existing application.
    Import {
        id: String,
    },
}

#[derive(Args, Debug)]
struct ModelCommand {
    #[command(subcommand)]
    command: ModelSubcommand,
}

#[derive(Subcommand, Debug)]
enum ModelSubcommand {
    List,
    Get {
        id: String,
    },
    Add {
        #[arg(long)]
        file: String,
    },
    Update {
        #[arg(long)]
        file: String,
    },
    Delete {
        id: String,
    },
}

#[derive(Args, Debug)]
struct SimCommand {
    #[command(subcommand)]
    command: SimSubcommand,
}

#[derive(Subcommand, Debug)]
enum SimSubcommand {
    List,
    Get {
        id: String,
    },
    Add {
        #[arg(long)]
        file: String,
    },
    Update {
        #[arg(long)]
        file: String,
    },
    Delete {
        id: String,
    },
    Start {
        id: String,
    },
    Stop {
        id: String,
    },
    /// Download the seed script that recreates the simulation.
    Export {
        id: String,
        #[arg(long, help = "Output file, default loadData-<id>.sh")]
        out: Option<String>,
    },
    /// Set the number of provisioned devices per model.
    Provision {
        id: String,
        #[arg(long = "count", value_name = "MODEL=N", required = true, num_args = 1..)]
        counts: Vec<String>,
    },
    /// Refresh the simulation table every 5 seconds until Ctrl-C.
    Watch {
        id: Option<String>,
    },
}

#[derive(Args, Debug)]
struct ConfigCommand {
    #[command(subcommand)]
    command: ConfigSubcommand,
}

#[derive(Subcommand, Debug)]
enum ConfigSubcommand {
    Get,
    MetricsStatus,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let result = match ApiClient::new(&cli.base_url) {
        Ok(client) => run(&client, cli.command).await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run(client: &ApiClient, command: Command) -> Result<(), CliError> {
    match command {
        Command::Target(target) => run_target(client, target).await,
        Command::Model(model) => run_model(client, model).await,
        Command::Sim(sim) => run_sim(client, sim).await,
        Command::Config(config) => run_config(client, config).await,
    }
}

async fn run_target(client: &ApiClient, target: TargetCommand) -> Result<(), CliError> {
    match target.command {
        TargetSubcommand::List => list_targets(client).await,
        TargetSubcommand::Get { id } => {
            let json: Value = client.get_json(&format!("/target/{id}"), "error getting application").await?;
            print_json(&json)
        }
        TargetSubcommand::Add { file, import_models } => {
            let mut body = read_json(&file)?;
            if import_models {
                if let Some(map) = body.as_object_mut() {
                    map.insert("importModels".to_owned(), Value::Bool(true));
                }
            }
            client.send(Method::POST, "/target", Some(&body), "error adding application").await?;
            list_targets(client).await
        }
        TargetSubcommand::Update { file } => {
            let body = read_json(&file)?;
            client.send(Method::PUT, "/target", Some(&body), "error updating application").await?;
            list_targets(client).await
        }
        TargetSubcommand::Delete { id } => {
            client.send(Method::DELETE, &format!("/target/{id}"), None, "error deleting application").await?;
            list_targets(client).await
        }
        TargetSubcommand::Import { id } => {
            client.send(Method::POST, &format!("/target/{id}/import"), None, "error importing device models").await?;
            list_models(client).await
        }
    }
}

async fn run_model(client: &ApiClient, model: ModelCommand) -> Result<(), CliError> {
    match model.command {
        ModelSubcommand::List => list_models(client).await,
        ModelSubcommand::Get { id } => {
            let json: Value = client.get_json(&format!("/model/{id}"), "error getting device model").await?;
            print_json(&json)
        }
        ModelSubcommand::Add { file } => {
            let body = read_json(&file)?;
            client.send(Method::POST, "/model", Some(&body), "error adding device model").await?;
            list_models(client).await
        }
        ModelSubcommand::Update { file } => {
            let body = read_json(&file)?;
            client.send(Method::PUT, "/model", Some(&body), "error updating device model").await?;
            list_models(client).await
        }
        ModelSubcommand::Delete { id } => {
            client.send(Method::DELETE, &format!("/model/{id}"), None, "error deleting device model").await?;
            list_models(client).await
        }
    }
}

async fn run_sim(client: &ApiClient, sim: SimCommand) -> Result<(), CliError> {
    match sim.command {
        SimSubcommand::List => list_simulations(client).await,
        SimSubcommand::Get { id } => {
            let json: Value = client.get_json(&format!("/simulation/{id}"), "error getting simulation").await?;
            print_json(&json)
        }
        SimSubcommand::Add { file } => {
            let body = read_json(&file)?;
            client.send(Method::POST, "/simulation", Some(&body), "error adding simulation").await?;
            list_simulations(client).await
        }
        SimSubcommand::Update { file } => {
            let body = read_json(&file)?;
            if let Some(id) = body.get("id").and_then(Value::as_str) {
                view::require_status(&fetch_simulation(client, id).await?, READY, "updated")?;
            }
            client.send(Method::PUT, "/simulation", Some(&body), "error updating simulation").await?;
            list_simulations(client).await
        }
        SimSubcommand::Delete { id } => {
            view::require_status(&fetch_simulation(client, &id).await?, READY, "deleted")?;
            let message =
                client.send(Method::DELETE, &format!("/simulation/{id}"), None, "error deleting simulation").await?;
            print_message(&message);
            list_simulations(client).await
        }
        SimSubcommand::Start { id } => {
            view::require_status(&fetch_simulation(client, &id).await?, READY, "started")?;
            client.send(Method::POST, &format!("/simulation/{id}/start"), None, "error starting simulation").await?;
            list_simulations(client).await
        }
        SimSubcommand::Stop { id } => {
            view::require_status(&fetch_simulation(client, &id).await?, RUNNING, "stopped")?;
            client.send(Method::POST, &format!("/simulation/{id}/stop"), None, "error stopping simulation").await?;
            list_simulations(client).await
        }
        SimSubcommand::Export { id, out } => {
            let script = client
                .send(Method::GET, &format!("/simulation/{id}/export"), None, "error exporting simulation")
                .await?;
            let path = out.unwrap_or_else(|| format!("loadData-{id}.sh"));
            tokio::fs::write(&path, script).await.map_err(|source| CliError::Io { path: path.clone(), source })?;
            println!("wrote {path}");
            Ok(())
        }
        SimSubcommand::Provision { id, counts } => {
            let counts = view::parse_counts(&counts)?;
            let sim = fetch_simulation(client, &id).await?;
            if sim.status != READY {
                return Err(CliError::Rejected(format!(
                    "Devices cannot be provisioned while the simulation is in '{}' status.",
                    sim.status
                )));
            }
            let body = serde_json::to_value(view::provisioning_request(&sim, &counts))?;
            let message = client
                .send(Method::POST, &format!("/simulation/{id}/provision"), Some(&body), "error provisioning devices")
                .await?;
            print_message(&message);
            list_simulations(client).await
        }
        SimSubcommand::Watch { id } => watch(client, id.as_deref()).await,
    }
}

async fn run_config(client: &ApiClient, config: ConfigCommand) -> Result<(), CliError> {
    let (path, default) = match config.command {
        ConfigSubcommand::Get => ("/config", "error getting configuration"),
        ConfigSubcommand::MetricsStatus => ("/config/metricsStatus", "error getting metrics status"),
    };
    let json: Value = client.get_json(path, default).await?;
    print_json(&json)
}

// =============================================================================
// COLLECTIONS
// =============================================================================

async fn list_targets(client: &ApiClient) -> Result<(), CliError> {
    let json: Value = client.get_json("/target", "error listing applications").await?;
    print_json(&json)
}

async fn list_models(client: &ApiClient) -> Result<(), CliError> {
    let json: Value = client.get_json("/model", "error listing device models").await?;
    print_json(&json)
}

async fn list_simulations(client: &ApiClient) -> Result<(), CliError> {
    let sims: Vec<SimulationSummary> = client.get_json("/simulation", "error listing simulations").await?;
    print!("{}", view::render_table(&sims));
    Ok(())
}

async fn fetch_simulation(client: &ApiClient, id: &str) -> Result<SimulationSummary, CliError> {
    client.get_json(&format!("/simulation/{id}"), "error getting simulation").await
}

async fn watch(client: &ApiClient, id: Option<&str>) -> Result<(), CliError> {
    let mut stdout = std::io::stdout();
    watch::run(client, id, WATCH_INTERVAL, tokio::signal::ctrl_c(), &mut stdout).await
}

// =============================================================================
// OUTPUT
// =============================================================================

fn read_json(path: &str) -> Result<Value, CliError> {
    let raw = std::fs::read_to_string(path).map_err(|source| CliError::Io { path: path.to_owned(), source })?;
    Ok(serde_json::from_str(&raw)?)
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}

fn print_message(message: &str) {
    if !message.trim().is_empty() {
        println!("{}", message.trim());
    }
}
