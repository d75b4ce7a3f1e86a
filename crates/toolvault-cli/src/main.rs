//! toolvault - sandbox and lifecycle manager for agent tools
//!
//! The `toolvault` command administers the tool registry and runs tools.
//!
//! ## Commands
//!
//! - `import`, `approve`, `install`, `enable`, `disable`, `revoke`, `repropose`:
//!   lifecycle
//! - `grant`, `permissions`: the permission registry
//! - `exec`: run one invocation in the sandbox
//! - `ledger`, `execution`, `summary`, `audit`: history
//! - `state`: per-tool persistent state
//! - `discover`: the capability-gap queue
//! - `reconcile`: close executions orphaned by a crashed manager

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};

use toolvault_core::{
    InvocationRequest, ManifestDocument, PermissionGrant, Resolution, ToolVault, VaultConfig,
};
use toolvault_state::{
    DiscoveryRequestId, DiscoveryStatus, ExecutionFilter, ExecutionId, ExecutionStatus,
    PermissionKind, ToolId, ToolManifest, ToolStatus,
};

#[derive(Parser)]
#[command(name = "toolvault")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Sandbox and lifecycle manager for agent tools", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Format of command results on stdout
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    output: OutputFormat,

    /// TOML configuration file
    #[arg(short, long, global = true, env = "TOOLVAULT_CONFIG")]
    config: Option<PathBuf>,

    /// Identity recorded in the audit log
    #[arg(long, global = true, env = "TOOLVAULT_ACTOR", default_value = "cli")]
    actor: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Import a manifest file (.json or .toml) as pending approval
    Import {
        /// Path to the manifest
        path: PathBuf,
    },

    /// List tools
    List {
        /// Only tools in this status (pending_approval, approved, active, disabled, revoked)
        #[arg(long, value_parser = parse_tool_status)]
        status: Option<ToolStatus>,
    },

    /// Show one tool's manifest, grants and volume
    Show {
        /// Tool name or id
        tool: String,
    },

    /// Approve a pending tool, seeding its grants
    Approve {
        /// Tool name or id
        tool: String,

        /// Grant as kind=value, e.g. memory_limit=512 (repeatable)
        #[arg(long = "grant", value_parser = parse_grant)]
        grants: Vec<PermissionGrant>,
    },

    /// Install an approved tool
    Install { tool: String },

    /// Re-enable a disabled tool
    Enable { tool: String },

    /// Disable an active tool
    Disable { tool: String },

    /// Revoke a tool; it can never run again
    Revoke {
        tool: String,

        /// Also destroy its persistent state and volume
        #[arg(long)]
        purge: bool,
    },

    /// Create a fresh pending manifest from a revoked tool
    Repropose { tool: String },

    /// Grant or change one permission
    Grant {
        tool: String,

        /// network_access, storage_quota, cpu_limit or memory_limit
        #[arg(value_parser = parse_permission_kind)]
        kind: PermissionKind,

        value: String,
    },

    /// List a tool's grants and effective limits
    Permissions { tool: String },

    /// Run one invocation
    Exec {
        tool: String,

        /// Input parameters as JSON
        #[arg(short, long, default_value = "{}")]
        params: String,

        /// Capability to invoke
        #[arg(long)]
        capability: Option<String>,

        /// Timeout override in seconds
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Conversation id for correlation
        #[arg(long)]
        conversation: Option<String>,

        /// Turn id for correlation
        #[arg(long)]
        turn: Option<String>,
    },

    /// List execution records
    Ledger {
        /// Only this tool (name or id)
        #[arg(long)]
        tool: Option<String>,

        /// Only this status (running, success, failure, timeout, cancelled)
        #[arg(long, value_parser = parse_execution_status)]
        status: Option<ExecutionStatus>,

        /// Maximum number of records
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show one execution record
    Execution { id: String },

    /// Aggregate execution counts
    Summary {
        #[arg(long)]
        tool: Option<String>,
    },

    /// Per-tool persistent state
    State {
        #[command(subcommand)]
        action: StateAction,
    },

    /// Capability-gap discovery queue
    Discover {
        #[command(subcommand)]
        action: DiscoverAction,
    },

    /// Mark executions left running by a crashed manager as failed
    Reconcile,

    /// Show the lifecycle audit log
    Audit {
        #[arg(long)]
        tool: Option<String>,
    },
}

#[derive(Subcommand)]
enum StateAction {
    /// Read one key
    Get { tool: String, key: String },
    /// Write one key (value is JSON)
    Set {
        tool: String,
        key: String,
        value: String,
    },
    /// Delete one key
    Delete { tool: String, key: String },
    /// List keys
    Keys { tool: String },
}

#[derive(Subcommand)]
enum DiscoverAction {
    /// Record a capability gap
    Enqueue {
        description: String,

        #[arg(long, default_value = "agent")]
        requested_by: String,
    },
    /// List requests
    List {
        #[arg(long, value_parser = parse_discovery_status)]
        status: Option<DiscoveryStatus>,
    },
    /// Claim the oldest pending request
    Claim,
    /// Resolve a request with a candidate manifest file
    Resolve { id: String, manifest: PathBuf },
    /// Close a request as failed
    Fail { id: String, reason: String },
    /// Close a request as rejected
    Reject { id: String, reason: String },
}

fn parse_tool_status(s: &str) -> std::result::Result<ToolStatus, String> {
    ToolStatus::from_str(s).map_err(|e| e.to_string())
}

fn parse_execution_status(s: &str) -> std::result::Result<ExecutionStatus, String> {
    ExecutionStatus::from_str(s).map_err(|e| e.to_string())
}

fn parse_discovery_status(s: &str) -> std::result::Result<DiscoveryStatus, String> {
    DiscoveryStatus::from_str(s).map_err(|e| e.to_string())
}

fn parse_permission_kind(s: &str) -> std::result::Result<PermissionKind, String> {
    PermissionKind::from_str(s).map_err(|e| e.to_string())
}

/// Parse `kind=value` into a validated grant.
fn parse_grant(s: &str) -> std::result::Result<PermissionGrant, String> {
    let (kind, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected kind=value, got '{s}'"))?;
    let kind = parse_permission_kind(kind.trim())?;
    PermissionGrant::parse(kind, value).map_err(|e| e.to_string())
}

/// Shared state of one command invocation.
struct Ctx {
    vault: ToolVault,
    actor: String,
    output: OutputFormat,
}

impl Ctx {
    /// Print `value` as JSON, or run `text` for the human format.
    fn emit<T: Serialize>(&self, value: &T, text: impl FnOnce()) -> Result<()> {
        match self.output {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
            OutputFormat::Text => text(),
        }
        Ok(())
    }

    /// Find a tool by name first, then by id.
    async fn resolve_tool(&self, reference: &str) -> Result<ToolManifest> {
        let store = self.vault.store();
        if let Some(manifest) = store.find_manifest_by_name(reference).await? {
            return Ok(manifest);
        }
        store
            .get_manifest(&ToolId::from(reference))
            .await
            .with_context(|| format!("no tool named or identified by '{reference}'"))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    toolvault_core::init_tracing(cli.json, level);

    let config = VaultConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let vault = ToolVault::open(&config)
        .await
        .context("Failed to open the toolvault store")?;
    let ctx = Ctx {
        vault,
        actor: cli.actor,
        output: cli.output,
    };

    run(&ctx, cli.command).await
}

async fn run(ctx: &Ctx, command: Commands) -> Result<()> {
    match command {
        Commands::Import { path } => cmd_import(ctx, &path).await,
        Commands::List { status } => cmd_list(ctx, status).await,
        Commands::Show { tool } => cmd_show(ctx, &tool).await,
        Commands::Approve { tool, grants } => cmd_approve(ctx, &tool, &grants).await,
        Commands::Install { tool } => cmd_transition(ctx, &tool, Transition::Install).await,
        Commands::Enable { tool } => cmd_transition(ctx, &tool, Transition::Enable).await,
        Commands::Disable { tool } => cmd_transition(ctx, &tool, Transition::Disable).await,
        Commands::Revoke { tool, purge } => cmd_revoke(ctx, &tool, purge).await,
        Commands::Repropose { tool } => cmd_repropose(ctx, &tool).await,
        Commands::Grant { tool, kind, value } => cmd_grant(ctx, &tool, kind, &value).await,
        Commands::Permissions { tool } => cmd_permissions(ctx, &tool).await,
        Commands::Exec {
            tool,
            params,
            capability,
            timeout_secs,
            conversation,
            turn,
        } => {
            cmd_exec(
                ctx,
                &tool,
                &params,
                capability,
                timeout_secs,
                conversation,
                turn,
            )
            .await
        }
        Commands::Ledger {
            tool,
            status,
            limit,
        } => cmd_ledger(ctx, tool.as_deref(), status, limit).await,
        Commands::Execution { id } => cmd_execution(ctx, &id).await,
        Commands::Summary { tool } => cmd_summary(ctx, tool.as_deref()).await,
        Commands::State { action } => cmd_state(ctx, action).await,
        Commands::Discover { action } => cmd_discover(ctx, action).await,
        Commands::Reconcile => cmd_reconcile(ctx).await,
        Commands::Audit { tool } => cmd_audit(ctx, tool.as_deref()).await,
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

fn print_manifest_line(m: &ToolManifest) {
    println!(
        "{:<32} {:<10} {:<17} {}",
        m.name,
        m.version,
        m.status.as_str(),
        m.id
    );
}

/// Import a manifest file
async fn cmd_import(ctx: &Ctx, path: &Path) -> Result<()> {
    let manifest = ctx
        .vault
        .lifecycle()
        .import_path(path, &ctx.actor)
        .await
        .with_context(|| format!("Failed to import {}", path.display()))?;
    ctx.emit(&manifest, || {
        println!("Imported {} {} as {}", manifest.name, manifest.version, manifest.id);
        println!("Status: {}", manifest.status);
        for req in &manifest.requested_permissions {
            println!("  requests {}={}", req.kind, req.value);
        }
    })
}

async fn cmd_list(ctx: &Ctx, status: Option<ToolStatus>) -> Result<()> {
    let manifests = ctx.vault.store().list_manifests(status).await?;
    ctx.emit(&manifests, || {
        if manifests.is_empty() {
            println!("No tools found.");
            return;
        }
        for m in &manifests {
            print_manifest_line(m);
        }
    })
}

#[derive(Serialize)]
struct ShowView {
    manifest: ToolManifest,
    permissions: Vec<toolvault_state::Permission>,
    volume: Option<toolvault_state::ToolVolume>,
}

async fn cmd_show(ctx: &Ctx, tool: &str) -> Result<()> {
    let manifest = ctx.resolve_tool(tool).await?;
    let permissions = ctx.vault.permissions().list(&manifest.id).await?;
    let volume = ctx.vault.state().volume(&manifest.id).await?;
    let view = ShowView {
        manifest,
        permissions,
        volume,
    };
    ctx.emit(&view, || {
        let m = &view.manifest;
        println!("{} {} ({})", m.name, m.version, m.id);
        println!("Status:      {}", m.status);
        println!("Source:      {} {}", m.source_type, m.source_location);
        println!("Image:       {}", m.execution.image);
        println!("Timeout:     {}s", m.execution.default_timeout_secs);
        println!("Description: {}", m.description);
        for cap in &m.capabilities {
            let net = if cap.requires_network { " [network]" } else { "" };
            println!("  capability {}{net}: {}", cap.name, cap.description);
        }
        for p in &view.permissions {
            println!("  grant {}={} by {}", p.kind, p.value, p.granted_by);
        }
        if let Some(v) = &view.volume {
            println!("Volume:      {} at {} ({} MB)", v.volume_name, v.host_path, v.quota_mb);
        }
        if let Some(next) = &m.superseded_by {
            println!("Superseded by {next}");
        }
    })
}

async fn cmd_approve(ctx: &Ctx, tool: &str, grants: &[PermissionGrant]) -> Result<()> {
    let manifest = ctx.resolve_tool(tool).await?;
    let approved = ctx
        .vault
        .lifecycle()
        .approve(&manifest.id, grants, &ctx.actor)
        .await
        .with_context(|| format!("Failed to approve '{}'", manifest.name))?;
    ctx.emit(&approved, || println!("Approved {}", approved.name))
}

#[derive(Clone, Copy)]
enum Transition {
    Install,
    Enable,
    Disable,
}

async fn cmd_transition(ctx: &Ctx, tool: &str, transition: Transition) -> Result<()> {
    let manifest = ctx.resolve_tool(tool).await?;
    let lifecycle = ctx.vault.lifecycle();
    let updated = match transition {
        Transition::Install => lifecycle.install(&manifest.id, &ctx.actor).await,
        Transition::Enable => lifecycle.enable(&manifest.id, &ctx.actor).await,
        Transition::Disable => lifecycle.disable(&manifest.id, &ctx.actor).await,
    }
    .with_context(|| format!("Failed to update '{}'", manifest.name))?;
    ctx.emit(&updated, || println!("{} is now {}", updated.name, updated.status))
}

async fn cmd_revoke(ctx: &Ctx, tool: &str, purge: bool) -> Result<()> {
    let manifest = ctx.resolve_tool(tool).await?;
    let report = ctx
        .vault
        .lifecycle()
        .revoke(&manifest.id, purge, &ctx.actor)
        .await
        .with_context(|| format!("Failed to revoke '{}'", manifest.name))?;
    ctx.emit(&report, || {
        println!("Revoked {}", report.manifest.name);
        if let Some(p) = &report.purged {
            println!(
                "Purged {} state entries; volume removed: {}",
                p.state_entries_removed, p.volume_removed
            );
        }
    })
}

async fn cmd_repropose(ctx: &Ctx, tool: &str) -> Result<()> {
    let manifest = ctx.resolve_tool(tool).await?;
    let successor = ctx
        .vault
        .lifecycle()
        .repropose(&manifest.id, &ctx.actor)
        .await
        .with_context(|| format!("Failed to re-propose '{}'", manifest.name))?;
    ctx.emit(&successor, || {
        println!(
            "Re-proposed {} as {} ({}), pending approval",
            manifest.name, successor.name, successor.id
        )
    })
}

// ---------------------------------------------------------------------------
// Permissions
// ---------------------------------------------------------------------------

async fn cmd_grant(ctx: &Ctx, tool: &str, kind: PermissionKind, value: &str) -> Result<()> {
    let manifest = ctx.resolve_tool(tool).await?;
    let stored = ctx
        .vault
        .permissions()
        .grant(&manifest.id, kind, value, &ctx.actor)
        .await
        .with_context(|| format!("Failed to grant {kind} to '{}'", manifest.name))?;
    ctx.emit(&stored, || {
        println!("Granted {}={} to {}", stored.kind, stored.value, manifest.name)
    })
}

async fn cmd_permissions(ctx: &Ctx, tool: &str) -> Result<()> {
    let manifest = ctx.resolve_tool(tool).await?;
    let grants = ctx.vault.permissions().list(&manifest.id).await?;
    let resolved = ctx.vault.permissions().check_and_resolve(&manifest.id).await?;
    ctx.emit(
        &serde_json::json!({ "grants": grants, "effective": resolved }),
        || {
            for g in &grants {
                println!("{:<16} {:<16} by {} at {}", g.kind.as_str(), g.value, g.granted_by, g.granted_at);
            }
            println!(
                "effective: network={} storage={}MB cpu={}% memory={}MB",
                resolved.network, resolved.storage_quota_mb, resolved.cpu_percent, resolved.memory_mb
            );
        },
    )
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

async fn cmd_exec(
    ctx: &Ctx,
    tool: &str,
    params: &str,
    capability: Option<String>,
    timeout_secs: Option<u64>,
    conversation: Option<String>,
    turn: Option<String>,
) -> Result<()> {
    let manifest = ctx.resolve_tool(tool).await?;
    let params: Value = serde_json::from_str(params).context("--params is not valid JSON")?;

    let mut request = InvocationRequest::new(manifest.id.clone(), params);
    request.capability = capability;
    request.timeout = timeout_secs.map(Duration::from_secs);
    request.correlation.conversation_id = conversation;
    request.correlation.turn_id = turn;

    let cancel = cancel_on_interrupt("execution");
    let result = ctx
        .vault
        .engine()
        .execute(request, cancel)
        .await
        .with_context(|| format!("Execution of '{}' was rejected", manifest.name))?;
    ctx.emit(&result, || {
        println!("execution {} ({})", result.execution_id, result.status);
        if let Some(output) = &result.output {
            println!("{output}");
        }
        if let Some(msg) = &result.error_message {
            println!("error: {msg}");
        }
        println!(
            "duration: {}ms, attempts: {}",
            result.resource_usage.duration_ms, result.attempts
        );
    })?;
    if !result.is_success() {
        bail!(
            "execution {} ended with status {}",
            result.execution_id,
            result.status
        );
    }
    Ok(())
}

async fn cmd_ledger(
    ctx: &Ctx,
    tool: Option<&str>,
    status: Option<ExecutionStatus>,
    limit: usize,
) -> Result<()> {
    let tool_id = match tool {
        Some(t) => Some(ctx.resolve_tool(t).await?.id),
        None => None,
    };
    let filter = ExecutionFilter {
        tool_id,
        status,
        limit: Some(limit),
        ..ExecutionFilter::default()
    };
    let records = ctx.vault.ledger().list(&filter).await?;
    ctx.emit(&records, || {
        if records.is_empty() {
            println!("No executions found.");
            return;
        }
        for r in &records {
            println!(
                "{} {} {:<9} {:>8} {}",
                r.started_at.format("%Y-%m-%d %H:%M:%S"),
                r.execution_id,
                r.status.as_str(),
                r.duration_ms.map(|d| format!("{d}ms")).unwrap_or_default(),
                r.error_kind.map(|k| k.as_str()).unwrap_or("")
            );
        }
    })
}

async fn cmd_execution(ctx: &Ctx, id: &str) -> Result<()> {
    let record = ctx
        .vault
        .ledger()
        .get(&ExecutionId::from(id))
        .await
        .with_context(|| format!("No execution '{id}'"))?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

async fn cmd_summary(ctx: &Ctx, tool: Option<&str>) -> Result<()> {
    let tool_id = match tool {
        Some(t) => Some(ctx.resolve_tool(t).await?.id),
        None => None,
    };
    let summary = ctx.vault.ledger().summarize(tool_id.as_ref()).await?;
    ctx.emit(&summary, || {
        println!("total: {}", summary.total);
        for (status, count) in &summary.by_status {
            println!("  {status}: {count}");
        }
        if let Some(mean) = summary.mean_duration_ms {
            println!("mean duration: {mean:.1}ms");
        }
        if let Some(rate) = summary.success_rate {
            println!("success rate: {:.1}%", rate * 100.0);
        }
    })
}

async fn cmd_reconcile(ctx: &Ctx) -> Result<()> {
    let closed = ctx.vault.reconcile().await?;
    ctx.emit(&serde_json::json!({ "closed": closed }), || {
        println!("Closed {closed} orphaned execution(s)")
    })
}

// ---------------------------------------------------------------------------
// State, discovery, audit
// ---------------------------------------------------------------------------

/// A token cancelled by Ctrl-C.
fn cancel_on_interrupt(what: &'static str) -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, cancelling {what}");
            trigger.cancel();
        }
    });
    cancel
}

async fn cmd_state(ctx: &Ctx, action: StateAction) -> Result<()> {
    let state = ctx.vault.state();
    match action {
        StateAction::Get { tool, key } => {
            let manifest = ctx.resolve_tool(&tool).await?;
            match state.get_state(&manifest.id, &key).await? {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => bail!("no state key '{key}' for {}", manifest.name),
            }
        }
        StateAction::Set { tool, key, value } => {
            let manifest = ctx.resolve_tool(&tool).await?;
            let value: Value = serde_json::from_str(&value).context("value is not valid JSON")?;
            state
                .set_state(&manifest.id, &key, value, &cancel_on_interrupt("state write"))
                .await?;
            println!("Set {key} for {}", manifest.name);
        }
        StateAction::Delete { tool, key } => {
            let manifest = ctx.resolve_tool(&tool).await?;
            let cancel = cancel_on_interrupt("state write");
            if state.delete_state(&manifest.id, &key, &cancel).await? {
                println!("Deleted {key}");
            } else {
                println!("No key {key}");
            }
        }
        StateAction::Keys { tool } => {
            let manifest = ctx.resolve_tool(&tool).await?;
            let keys = state.list_state_keys(&manifest.id).await?;
            let used = state.usage_bytes(&manifest.id).await?;
            ctx.emit(&keys, || {
                for k in &keys {
                    println!("{k}");
                }
                println!("({} keys, {used} bytes)", keys.len());
            })?;
        }
    }
    Ok(())
}

async fn cmd_discover(ctx: &Ctx, action: DiscoverAction) -> Result<()> {
    let queue = ctx.vault.discovery();
    match action {
        DiscoverAction::Enqueue {
            description,
            requested_by,
        } => {
            let id = queue.enqueue(&description, &requested_by).await?;
            ctx.emit(&id, || println!("Request {id}"))
        }
        DiscoverAction::List { status } => {
            let requests = queue.list(status).await?;
            ctx.emit(&requests, || {
                for r in &requests {
                    println!(
                        "{} {:<9} {}",
                        r.request_id,
                        r.status.as_str(),
                        r.capability_description
                    );
                }
            })
        }
        DiscoverAction::Claim => match queue.claim().await? {
            Some(r) => ctx.emit(&r, || {
                println!("Claimed {}: {}", r.request_id, r.capability_description)
            }),
            None => ctx.emit(&Value::Null, || println!("Nothing pending.")),
        },
        DiscoverAction::Resolve { id, manifest } => {
            let document = ManifestDocument::from_path(&manifest)
                .with_context(|| format!("Failed to read {}", manifest.display()))?;
            let done = queue
                .resolve(
                    &DiscoveryRequestId::from(id.as_str()),
                    Resolution::Candidate(document),
                    &ctx.actor,
                )
                .await?;
            ctx.emit(&done, || match &done.resulting_tool_id {
                Some(tool) => println!("Request {} found tool {tool}", done.request_id),
                None => println!(
                    "Request {} failed: {}",
                    done.request_id,
                    done.error_message.as_deref().unwrap_or("")
                ),
            })
        }
        DiscoverAction::Fail { id, reason } => {
            let done = queue
                .resolve(
                    &DiscoveryRequestId::from(id.as_str()),
                    Resolution::Failed(reason),
                    &ctx.actor,
                )
                .await?;
            ctx.emit(&done, || println!("Request {} failed", done.request_id))
        }
        DiscoverAction::Reject { id, reason } => {
            let done = queue
                .resolve(
                    &DiscoveryRequestId::from(id.as_str()),
                    Resolution::Rejected(reason),
                    &ctx.actor,
                )
                .await?;
            ctx.emit(&done, || println!("Request {} rejected", done.request_id))
        }
    }
}

async fn cmd_audit(ctx: &Ctx, tool: Option<&str>) -> Result<()> {
    let tool_id = match tool {
        Some(t) => Some(ctx.resolve_tool(t).await?.id),
        None => None,
    };
    let entries = ctx.vault.store().list_audit(tool_id.as_ref()).await?;
    ctx.emit(&entries, || {
        for e in &entries {
            let verdict = if e.accepted { "ok " } else { "REJ" };
            let from = e.from_status.map(|s| s.as_str()).unwrap_or("-");
            let to = e.to_status.map(|s| s.as_str()).unwrap_or("-");
            println!(
                "{} {verdict} {:<10} {from} -> {to} by {}: {}",
                e.at.format("%Y-%m-%d %H:%M:%S"),
                e.action,
                e.actor,
                e.detail
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use toolvault_core::{FsVolumeBackend, ScriptedRuntime, ScriptedStep};
    use toolvault_state::fakes::MemoryToolStore;

    fn test_ctx(volumes: &Path) -> (Ctx, Arc<ScriptedRuntime>) {
        let runtime = Arc::new(ScriptedRuntime::new());
        let vault = ToolVault::new(
            Arc::new(MemoryToolStore::new()),
            runtime.clone(),
            Arc::new(FsVolumeBackend::new(volumes)),
            &VaultConfig::default(),
        );
        let ctx = Ctx {
            vault,
            actor: "tester".to_string(),
            output: OutputFormat::Json,
        };
        (ctx, runtime)
    }

    fn write_manifest(dir: &Path) -> PathBuf {
        let path = dir.join("echo.toml");
        std::fs::write(
            &path,
            r#"
name = "echo"
version = "1.0.0"
description = "Echo the input"

[execution]
image = "registry.local/echo:1"
"#,
        )
        .unwrap();
        path
    }

    #[test]
    fn test_parse_grant() {
        assert_eq!(
            parse_grant("memory_limit=512").unwrap(),
            PermissionGrant::MemoryLimit(512)
        );
        assert!(parse_grant("memory_limit").is_err());
        assert!(parse_grant("gpu=1").is_err());
        assert!(parse_grant("cpu_limit=0").is_err());
    }

    #[test]
    fn test_cli_parses_approve_with_grants() {
        let cli = Cli::try_parse_from([
            "toolvault",
            "--output",
            "json",
            "approve",
            "weather",
            "--grant",
            "network_access=isolated-bridge",
            "--grant",
            "memory_limit=256",
        ])
        .unwrap();
        assert_eq!(cli.output, OutputFormat::Json);
        match cli.command {
            Commands::Approve { tool, grants } => {
                assert_eq!(tool, "weather");
                assert_eq!(grants.len(), 2);
            }
            _ => panic!("expected approve"),
        }
    }

    #[tokio::test]
    async fn test_import_to_exec_flow() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, runtime) = test_ctx(dir.path());
        let path = write_manifest(dir.path());

        cmd_import(&ctx, &path).await.unwrap();
        cmd_approve(&ctx, "echo", &[]).await.unwrap();
        cmd_transition(&ctx, "echo", Transition::Install).await.unwrap();

        runtime.push(ScriptedStep::ok(serde_json::json!({"echo": 1})));
        cmd_exec(&ctx, "echo", r#"{"x": 1}"#, None, None, None, None)
            .await
            .unwrap();

        runtime.push(ScriptedStep::fail(1, "nope"));
        let err = cmd_exec(&ctx, "echo", "{}", None, None, None, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failure"));

        let manifest = ctx.resolve_tool("echo").await.unwrap();
        assert_eq!(manifest.status, ToolStatus::Active);
        // Lookup by id works too.
        ctx.resolve_tool(manifest.id.as_str()).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_tool_reference() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _) = test_ctx(dir.path());
        let err = cmd_show(&ctx, "missing").await.unwrap_err();
        assert!(err.to_string().contains("missing"));
    }
}
