//! Command handlers for the flowpilot CLI

use crate::cli::client::FlowClient;
use anyhow::{Context, Result};
use chrono::Utc;
use flowpilot_core::models::configuration::{Configuration, LogLevel};
use flowpilot_core::models::hil::{HilResolution, HilStatus};
use flowpilot_core::models::workflow::WorkflowDefinition;
use flowpilot_core::runtime::FlowRuntime;
use flowpilot_core::scheduler::CronExpression;
use flowpilot_core::server::FlowServer;
use flowpilot_core::services::init_logging;
use flowpilot_core::workflow::handler::HandlerRegistry;
use flowpilot_core::workflow::validator::WorkflowValidator;
use serde_json::Value;
use std::io::{self, Write};
use std::path::PathBuf;
use uuid::Uuid;

/// Default value of the `--config-file` flags
pub const DEFAULT_CONFIG_FILE: &str = "~/.config/flowpilot/config.toml";

/// Expand `~/` and map the default flag value to the platform config dir
pub fn resolve_config_path(config_file: &str) -> Result<PathBuf> {
    if config_file == DEFAULT_CONFIG_FILE {
        return Configuration::default_config_path()
            .map_err(|e| anyhow::anyhow!("Failed to get default config path: {}", e));
    }
    if let Some(rest) = config_file.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?;
        return Ok(home.join(rest));
    }
    Ok(PathBuf::from(config_file))
}

fn load_config(config_file: &str) -> Result<Configuration> {
    let path = resolve_config_path(config_file)?;
    Configuration::load_from_file(&path)
        .map_err(|e| anyhow::anyhow!("Failed to load {}: {}", path.display(), e))
}

fn parse_json_arg(raw: Option<String>, what: &str) -> Result<Option<Value>> {
    raw.map(|raw| {
        serde_json::from_str::<Value>(&raw).with_context(|| format!("{} is not valid JSON", what))
    })
    .transpose()
}

/// Handle the 'serve' command
pub async fn handle_serve(
    host: Option<String>,
    port: Option<u16>,
    workflows: Option<String>,
    config_file: String,
) -> Result<()> {
    let mut config = load_config(&config_file)?;
    if let Some(host) = host {
        config.server_host = host;
    }
    if let Some(port) = port {
        config.server_port = port;
    }
    if let Some(dir) = workflows {
        config.workflows_dir = Some(PathBuf::from(dir));
    }
    if let Err(errors) = config.validate() {
        return Err(anyhow::anyhow!(
            "Invalid configuration:\n  - {}",
            errors.join("\n  - ")
        ));
    }

    if let Err(e) = init_logging(config.log_level.clone()) {
        eprintln!("Warning: failed to initialize logging: {}", e);
    }

    let runtime = FlowRuntime::new(config, HandlerRegistry::with_builtins())
        .context("Failed to start flowpilot runtime")?;
    FlowServer::new(runtime).start().await
}

/// Handle the 'validate' command
pub async fn handle_validate(workflow_file: String, json: bool) -> Result<()> {
    let content = std::fs::read_to_string(&workflow_file)
        .with_context(|| format!("Failed to read {}", workflow_file))?;
    let definition = WorkflowDefinition::from_yaml_str(&content)?;
    let result = WorkflowValidator::validate_workflow(&definition, &HandlerRegistry::with_builtins());

    if json {
        let output = serde_json::json!({
            "workflow_id": definition.id,
            "valid": result.is_valid(),
            "errors": result
                .errors
                .iter()
                .map(|e| serde_json::json!({"field": e.field, "message": e.message}))
                .collect::<Vec<_>>(),
            "warnings": result.warnings,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else if result.is_valid() {
        println!("✅ Workflow '{}' is valid", definition.id);
        println!("   Steps: {}", definition.steps.len());
        println!("   Entry: {}", definition.entry_step);
        for warning in &result.warnings {
            println!("   ⚠️  {}", warning);
        }
    } else {
        println!("❌ Workflow '{}' is invalid:", definition.id);
        for error in &result.errors {
            println!("   - {}: {}", error.field, error.message);
        }
    }

    if result.is_valid() {
        Ok(())
    } else {
        Err(anyhow::anyhow!("Workflow validation failed"))
    }
}

/// Handle the 'cron' command
pub async fn handle_cron(expression: String, count: usize, json: bool) -> Result<()> {
    let cron = CronExpression::parse(&expression)?;
    let upcoming = cron.upcoming(Utc::now(), count);

    if json {
        let output = serde_json::json!({
            "expression": cron.as_str(),
            "upcoming": upcoming.iter().map(|t| t.to_rfc3339()).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("Next runs for '{}' (UTC):", cron);
        if upcoming.is_empty() {
            println!("  (none within the search horizon)");
        }
        for time in upcoming {
            println!("  {}", time.format("%Y-%m-%d %H:%M %a"));
        }
    }
    Ok(())
}

/// Handle the 'status' command
pub async fn handle_status(server: String, json: bool) -> Result<()> {
    let client = FlowClient::new(&server)?;
    let health = client.health().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&health)?);
        return Ok(());
    }
    println!("🟢 flowpilot {} at {}", health["version"].as_str().unwrap_or("?"), server);
    println!("   Workflows: {}", health["workflows"]);
    println!("   Pending requests: {}", health["pending_requests"]);
    println!("   Schedules: {}", health["schedules"]);
    Ok(())
}

/// Handle the 'pending' command
pub async fn handle_pending(server: String, workflow: Option<String>, json: bool) -> Result<()> {
    let client = FlowClient::new(&server)?;
    let pending = client.list_pending(workflow.as_deref()).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&pending)?);
        return Ok(());
    }
    if pending.is_empty() {
        println!("No pending requests");
        return Ok(());
    }
    println!("Pending HIL requests ({})", pending.len());
    println!("========================");
    for request in pending {
        println!(
            "[{:?}] {}  {}",
            request.priority, request.id, request.title
        );
        println!(
            "        workflow: {}  step: {}  since {}",
            request.workflow_id,
            request.step_id,
            request.created_at.format("%Y-%m-%d %H:%M:%S")
        );
        if !request.description.is_empty() {
            println!("        {}", request.description);
        }
    }
    Ok(())
}

/// Map a CLI decision word to a response status
pub fn parse_decision(decision: &str) -> Result<HilStatus> {
    match decision.to_lowercase().as_str() {
        "approve" | "approved" => Ok(HilStatus::Approved),
        "reject" | "rejected" | "deny" => Ok(HilStatus::Rejected),
        "modify" | "modified" => Ok(HilStatus::Modified),
        other => Err(anyhow::anyhow!(
            "Unknown decision '{}' (expected approve, reject or modify)",
            other
        )),
    }
}

/// Handle the 'respond' command
pub async fn handle_respond(
    server: String,
    request_id: String,
    decision: String,
    data: Option<String>,
    comments: Option<String>,
    operator: String,
    json: bool,
) -> Result<()> {
    let request_id =
        Uuid::parse_str(&request_id).context("Invalid request ID format (expected UUID)")?;
    let status = parse_decision(&decision)?;
    let data = parse_json_arg(data, "--data")?;
    if status == HilStatus::Modified && data.is_none() {
        return Err(anyhow::anyhow!("A 'modify' decision needs --data"));
    }

    let mut resolution = HilResolution::new(status).by(operator);
    if let Some(data) = data {
        resolution = resolution.with_data(data);
    }
    if let Some(comments) = comments {
        resolution = resolution.with_comments(comments);
    }

    let client = FlowClient::new(&server)?;
    let response = client.respond(request_id, &resolution).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        println!(
            "✅ Request {} resolved as {:?} by {}",
            response.request_id, response.status, response.responded_by
        );
        println!("   Execution {} will resume", response.execution_id);
    }
    Ok(())
}

/// Handle the 'trigger' command
pub async fn handle_trigger(
    server: String,
    schedule_id: String,
    input: Option<String>,
    wait: Option<u64>,
    json: bool,
) -> Result<()> {
    let schedule_id =
        Uuid::parse_str(&schedule_id).context("Invalid schedule ID format (expected UUID)")?;
    let input = parse_json_arg(input, "--input")?;

    let client = FlowClient::new(&server)?;
    let execution = client.trigger(schedule_id, input, wait).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&execution)?);
    } else {
        println!("🚀 Triggered schedule {}", schedule_id);
        if let Some(execution_id) = execution.execution_id {
            println!("   Execution ID: {}", execution_id);
        }
        println!("   Status: {:?}", execution.status);
        if let Some(error) = &execution.error {
            println!("   Error: {}", error);
        }
    }
    Ok(())
}

/// Synchronous stdin line read for the interactive prompts
fn read_user_input_sync() -> Result<String> {
    let mut buffer = String::new();
    io::stdin()
        .read_line(&mut buffer)
        .context("Failed to read from stdin")?;
    Ok(buffer)
}

fn prompt(label: &str, current: &str) -> Result<String> {
    print!("{} [{}]: ", label, current);
    io::stdout().flush()?;
    Ok(read_user_input_sync()?.trim().to_string())
}

fn parse_log_level(input: &str) -> Option<LogLevel> {
    match input.to_lowercase().as_str() {
        "error" => Some(LogLevel::Error),
        "warn" => Some(LogLevel::Warn),
        "info" => Some(LogLevel::Info),
        "debug" => Some(LogLevel::Debug),
        "trace" => Some(LogLevel::Trace),
        _ => None,
    }
}

/// Handle the 'config' command
pub async fn handle_config_init(config_file: String) -> Result<()> {
    println!("⚙️  Initializing flowpilot configuration");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let config_path = resolve_config_path(&config_file)?;
    println!("📄 Config file: {}", config_path.display());

    let mut config = if config_path.exists() {
        println!("⚠️  Configuration file already exists. Loading existing values...");
        Configuration::load_from_file(&config_path)
            .map_err(|e| anyhow::anyhow!("Failed to load existing config: {}", e))?
    } else {
        println!("✨ Creating new configuration with defaults...");
        Configuration::default()
    };

    println!("\n📝 Please answer the following questions (press Enter to use default):\n");

    let input = prompt(
        "Log level (error/warn/info/debug/trace)",
        &format!("{:?}", config.log_level).to_lowercase(),
    )?;
    if !input.is_empty() {
        match parse_log_level(&input) {
            Some(level) => config.log_level = level,
            None => println!("⚠️  Invalid log level, using default"),
        }
    }

    let input = prompt("Server bind address", &config.server_host)?;
    if !input.is_empty() {
        config.server_host = input;
    }

    let input = prompt("Server port", &config.server_port.to_string())?;
    if !input.is_empty() {
        match input.parse::<u16>() {
            Ok(port) => config.server_port = port,
            Err(_) => println!("⚠️  Invalid port number, using default"),
        }
    }

    let current_store = config
        .store_path
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "memory".to_string());
    let input = prompt("Checkpoint file (or 'memory')", &current_store)?;
    if !input.is_empty() {
        config.store_path = if input == "memory" {
            None
        } else {
            Some(resolve_config_path(&input)?)
        };
    }

    let current_dir = config
        .workflows_dir
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    let input = prompt("Workflows directory", &current_dir)?;
    if !input.is_empty() {
        config.workflows_dir = Some(resolve_config_path(&input)?);
    }

    let input = prompt(
        "Max steps per execution",
        &config.engine.max_iterations.to_string(),
    )?;
    if !input.is_empty() {
        match input.parse::<u32>() {
            Ok(max) => config.engine.max_iterations = max,
            Err(_) => println!("⚠️  Invalid number, using default"),
        }
    }

    println!("\n🔍 Validating configuration...");
    match config.validate() {
        Ok(()) => println!("✅ Configuration is valid"),
        Err(errors) => {
            println!("❌ Configuration validation failed:");
            for error in &errors {
                println!("   - {}", error);
            }
            return Err(anyhow::anyhow!("Configuration validation failed"));
        }
    }

    println!("\n💾 Saving configuration to {}...", config_path.display());
    config
        .save_to_file(&config_path)
        .map_err(|e| anyhow::anyhow!("Failed to save configuration: {}", e))?;

    println!("✅ Configuration saved successfully!");
    println!("\n📋 Configuration summary:");
    println!("   Log level: {:?}", config.log_level);
    println!("   Server: {}:{}", config.server_host, config.server_port);
    println!("   Checkpoints: {}", current_store_label(&config));
    println!("   Max steps: {}", config.engine.max_iterations);
    println!(
        "   Scheduler: {} (tick {}s)",
        if config.scheduler.enabled { "enabled" } else { "disabled" },
        config.scheduler.tick_seconds
    );
    Ok(())
}

fn current_store_label(config: &Configuration) -> String {
    config
        .store_path
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "in memory".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_decision() {
        assert_eq!(parse_decision("approve").unwrap(), HilStatus::Approved);
        assert_eq!(parse_decision("Rejected").unwrap(), HilStatus::Rejected);
        assert_eq!(parse_decision("modify").unwrap(), HilStatus::Modified);
        assert!(parse_decision("timeout").is_err());
    }

    #[test]
    fn test_resolve_config_path() {
        let path = resolve_config_path("/tmp/flowpilot.toml").unwrap();
        assert_eq!(path, PathBuf::from("/tmp/flowpilot.toml"));

        if let Some(home) = dirs::home_dir() {
            assert_eq!(
                resolve_config_path("~/fp/config.toml").unwrap(),
                home.join("fp/config.toml")
            );
        }
    }

    #[test]
    fn test_parse_json_arg() {
        assert_eq!(parse_json_arg(None, "--data").unwrap(), None);
        assert_eq!(
            parse_json_arg(Some(r#"{"a":1}"#.to_string()), "--data").unwrap(),
            Some(serde_json::json!({"a": 1}))
        );
        assert!(parse_json_arg(Some("{".to_string()), "--data").is_err());
    }

    #[tokio::test]
    async fn test_validate_reports_missing_handler() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("wf.yaml");
        std::fs::write(
            &file,
            "id: broken\nentry_step: a\nsteps:\n  - id: a\n    handler: nope\n",
        )
        .unwrap();
        assert!(handle_validate(file.display().to_string(), true).await.is_err());

        std::fs::write(
            &file,
            "id: fine\nentry_step: a\nsteps:\n  - id: a\n    handler: echo\n",
        )
        .unwrap();
        assert!(handle_validate(file.display().to_string(), true).await.is_ok());
    }
}
