mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use cli::handlers;

#[derive(Parser)]
#[command(name = "flowpilot")]
#[command(version)]
#[command(about = "Workflow orchestration with human-in-the-loop checkpoints and triggers")]
#[command(
    help_template = "{name} - {version}\n{about}\n\n{usage-heading}\n  {usage}\n\n{all-args}{options}\n"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the flowpilot server (engine, HIL coordinator, scheduler and HTTP API)
    Serve {
        /// Server bind address (overrides the config file)
        #[arg(long)]
        host: Option<String>,

        /// Server port number (overrides the config file)
        #[arg(short, long)]
        port: Option<u16>,

        /// Directory of YAML workflow definitions to load at startup
        #[arg(short, long)]
        workflows: Option<String>,

        /// Path to configuration file
        #[arg(long, default_value = handlers::DEFAULT_CONFIG_FILE)]
        config_file: String,
    },

    /// Validate a YAML workflow definition against the built-in handlers
    ///
    /// Examples:
    ///   flowpilot validate workflows/support.yaml
    ///   flowpilot validate workflows/support.yaml --json
    Validate {
        /// Workflow definition file
        workflow_file: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Show the next fire times of a cron expression (UTC)
    ///
    /// Examples:
    ///   flowpilot cron "*/15 9-17 * * 1-5"
    ///   flowpilot cron "0 2 * * *" --count 3
    Cron {
        /// Five-field cron expression
        expression: String,

        /// Number of fire times to print
        #[arg(short, long, default_value = "5")]
        count: usize,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Show the health summary of a running server
    Status {
        /// Server URL
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        server: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// List pending human-in-the-loop requests
    Pending {
        /// Only show requests of this workflow
        #[arg(short, long)]
        workflow: Option<String>,

        /// Server URL
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        server: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Resolve a pending human-in-the-loop request
    ///
    /// Examples:
    ///   flowpilot respond <request-id> approve
    ///   flowpilot respond <request-id> modify --data '{"amount": 90}'
    Respond {
        /// Request ID (UUID)
        request_id: String,

        /// Decision: approve, reject or modify
        decision: String,

        /// Replacement data (JSON) for a modify decision
        #[arg(short, long)]
        data: Option<String>,

        /// Free-form comment stored with the response
        #[arg(long)]
        comments: Option<String>,

        /// Name recorded as the responder
        #[arg(long, default_value = "cli")]
        operator: String,

        /// Server URL
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        server: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Fire a schedule manually
    Trigger {
        /// Schedule ID (UUID)
        schedule_id: String,

        /// Input (JSON) replacing the schedule's configured input
        #[arg(short, long)]
        input: Option<String>,

        /// Seconds to wait for the execution to finish
        #[arg(short, long)]
        wait: Option<u64>,

        /// Server URL
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        server: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Configure flowpilot settings interactively
    Config {
        /// Start interactive configuration setup
        #[arg(long)]
        init: bool,

        /// Path to configuration file
        #[arg(long, default_value = handlers::DEFAULT_CONFIG_FILE)]
        config_file: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            host,
            port,
            workflows,
            config_file,
        } => handlers::handle_serve(host, port, workflows, config_file).await,
        Commands::Validate {
            workflow_file,
            json,
        } => handlers::handle_validate(workflow_file, json).await,
        Commands::Cron {
            expression,
            count,
            json,
        } => handlers::handle_cron(expression, count, json).await,
        Commands::Status { server, json } => handlers::handle_status(server, json).await,
        Commands::Pending {
            workflow,
            server,
            json,
        } => handlers::handle_pending(server, workflow, json).await,
        Commands::Respond {
            request_id,
            decision,
            data,
            comments,
            operator,
            server,
            json,
        } => {
            handlers::handle_respond(server, request_id, decision, data, comments, operator, json)
                .await
        }
        Commands::Trigger {
            schedule_id,
            input,
            wait,
            server,
            json,
        } => handlers::handle_trigger(server, schedule_id, input, wait, json).await,
        Commands::Config { init, config_file } => {
            if init {
                handlers::handle_config_init(config_file).await
            } else {
                println!("Use --init to start interactive configuration setup");
                Ok(())
            }
        }
    }
}
