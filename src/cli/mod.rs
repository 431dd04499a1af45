//! CLI commands for agent-mail using clap.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::config::Config;
use crate::identity::Identity;
use crate::mailbox::{Mailbox, PollResult, Registration, SendRequest};
use crate::memory::recorder_for;
use crate::protocol::{Agent, Message, MessageStatus};
use crate::transport::simplex::PROCESSED_DIR;

/// agent-mail - SQLite mailbox for coordinating agents, with optional
/// SimpleX and Matrix relays between machines.
#[derive(Parser)]
#[command(name = "agent-mail")]
#[command(version)]
#[command(about = "Inter-agent mailbox with store-and-forward relays", long_about = None)]
pub struct Commands {
    /// Act as this agent instead of the detected identity
    #[arg(long, global = true)]
    pub agent: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Send a message
    Send {
        /// Recipient agent id, or "all" to broadcast
        #[arg(long)]
        to: Option<String>,

        /// Message type: task_dispatch, status_report, discovery, request, broadcast
        #[arg(long = "type")]
        message_type: Option<String>,

        /// Message body
        #[arg(long)]
        payload: Option<String>,

        /// Priority: high, normal, low
        #[arg(long)]
        priority: Option<String>,

        /// Convoy (batch of related work) this message belongs to
        #[arg(long)]
        convoy: Option<String>,

        /// Sender id (defaults to this agent)
        #[arg(long)]
        from: Option<String>,

        /// Relay: local, simplex, matrix, all
        #[arg(long)]
        transport: Option<String>,
    },

    /// List this agent's inbox
    Check {
        /// Only unread messages
        #[arg(long)]
        unread_only: bool,

        /// Print JSON
        #[arg(long)]
        json: bool,
    },

    /// Show a message and mark it read
    Read {
        /// Message ID
        id: String,

        /// Print JSON
        #[arg(long)]
        json: bool,
    },

    /// Archive a message
    Archive {
        /// Message ID
        id: String,
    },

    /// Report on (or with --force, delete) old messages
    Prune {
        /// Capture, archive, delete and compact
        #[arg(long)]
        force: bool,

        /// Age threshold in days
        #[arg(long)]
        older_than_days: Option<u32>,
    },

    /// Show mailbox status
    Status,

    /// Register (or refresh) an agent
    Register {
        /// Agent ID (defaults to this agent)
        #[arg(long)]
        id: Option<String>,

        /// Role
        #[arg(long)]
        role: Option<String>,

        /// Git branch
        #[arg(long)]
        branch: Option<String>,

        /// Worktree path
        #[arg(long)]
        worktree: Option<String>,
    },

    /// Mark an agent inactive
    Deregister {
        /// Agent ID (defaults to this agent)
        #[arg(long)]
        id: Option<String>,
    },

    /// List known agents
    Agents {
        /// Only active agents
        #[arg(long)]
        active_only: bool,

        /// Print JSON
        #[arg(long)]
        json: bool,
    },

    /// Pull relayed messages into the local mailbox
    Receive {
        /// Transport to poll: simplex, matrix, all (default all)
        #[arg(long)]
        transport: Option<String>,

        /// Keep polling until interrupted
        #[arg(long)]
        watch: bool,

        /// Seconds between polls with --watch
        #[arg(long, default_value_t = 60)]
        interval: u64,
    },

    /// Show transport availability
    TransportStatus,

    /// Import messages from the legacy file-based inbox
    Migrate {
        /// Legacy directory (defaults to <home>/legacy)
        #[arg(long)]
        from: Option<PathBuf>,
    },
}

impl Commands {
    /// Run the command.
    pub async fn run(&self, config: Config) -> Result<()> {
        let explicit = self.agent.as_deref().or(config.settings.agent_id.as_deref());
        let mailbox = Mailbox::open(&config, Identity::resolve(explicit))?;

        match &self.command {
            Command::Send {
                to,
                message_type,
                payload,
                priority,
                convoy,
                from,
                transport,
            } => {
                let request = SendRequest {
                    to: to.clone(),
                    message_type: message_type.clone(),
                    payload: payload.clone(),
                    priority: priority.clone(),
                    convoy: convoy.clone(),
                    from: from.clone(),
                    transport: transport.clone(),
                };
                cmd_send(&mailbox, request).await
            }
            Command::Check { unread_only, json } => cmd_check(&mailbox, *unread_only, *json),
            Command::Read { id, json } => cmd_read(&mailbox, id, *json),
            Command::Archive { id } => cmd_archive(&mailbox, id),
            Command::Prune {
                force,
                older_than_days,
            } => {
                let days = older_than_days.unwrap_or(config.settings.prune_days);
                cmd_prune(&mailbox, &config, *force, days).await
            }
            Command::Status => cmd_status(&mailbox),
            Command::Register {
                id,
                role,
                branch,
                worktree,
            } => {
                let registration = Registration {
                    id: id.clone(),
                    role: role.clone(),
                    branch: branch.clone(),
                    worktree: worktree.clone(),
                };
                cmd_register(&mailbox, registration)
            }
            Command::Deregister { id } => cmd_deregister(&mailbox, id.as_deref()),
            Command::Agents { active_only, json } => cmd_agents(&mailbox, *active_only, *json),
            Command::Receive {
                transport,
                watch,
                interval,
            } => cmd_receive(&mailbox, transport.as_deref(), *watch, *interval).await,
            Command::TransportStatus => cmd_transport_status(&mailbox, &config),
            Command::Migrate { from } => {
                let dir = from.clone().unwrap_or_else(|| config.legacy_dir());
                cmd_migrate(&mailbox, dir)
            }
        }
    }
}

// Command implementations

async fn cmd_send(mailbox: &Mailbox, request: SendRequest) -> Result<()> {
    let outcome = mailbox.send(request).await?;

    for id in &outcome.ids {
        println!("{}", id);
    }
    for relay in &outcome.relays {
        match &relay.error {
            None => println!("  relayed via {}", relay.transport),
            Some(e) => println!("  relay via {} failed: {}", relay.transport, e),
        }
    }
    Ok(())
}

fn format_line(message: &Message) -> String {
    let marker = match message.status {
        MessageStatus::Unread => "*",
        MessageStatus::Read => " ",
        MessageStatus::Archived => "a",
    };
    let preview: String = message
        .payload
        .lines()
        .next()
        .unwrap_or_default()
        .chars()
        .take(60)
        .collect();
    format!(
        "{} [{}] {}  {} -> {}  {}  {}",
        marker,
        message.priority,
        message.id,
        message.from_agent,
        message.to_agent,
        message.message_type,
        preview
    )
}

fn cmd_check(mailbox: &Mailbox, unread_only: bool, json: bool) -> Result<()> {
    let inbox = mailbox.check(None, unread_only)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&inbox)?);
        return Ok(());
    }

    println!(
        "Inbox for {} ({} message(s), {} unread)",
        inbox.agent_id, inbox.total, inbox.unread
    );
    if inbox.messages.is_empty() {
        println!("  (empty)");
    }
    for message in &inbox.messages {
        println!("  {}", format_line(message));
    }
    Ok(())
}

fn cmd_read(mailbox: &Mailbox, id: &str, json: bool) -> Result<()> {
    let message = mailbox.read(id)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&message)?);
        return Ok(());
    }

    println!("ID:       {}", message.id);
    println!("From:     {}", message.from_agent);
    println!("To:       {}", message.to_agent);
    println!("Type:     {}", message.message_type);
    println!("Priority: {}", message.priority);
    println!("Convoy:   {}", message.convoy);
    println!("Status:   {}", message.status);
    println!("Created:  {}", message.created_at);
    println!();
    println!("{}", message.payload);
    Ok(())
}

fn cmd_archive(mailbox: &Mailbox, id: &str) -> Result<()> {
    let message = mailbox.archive(id)?;
    println!("Archived {}", message.id);
    Ok(())
}

async fn cmd_prune(mailbox: &Mailbox, config: &Config, force: bool, days: u32) -> Result<()> {
    let report = mailbox.prune_report(days)?;
    let stats = &report.stats;

    println!("Mailbox: {} message(s)", stats.total);
    println!(
        "  unread={} read={} archived={}",
        stats.unread, stats.read, stats.archived
    );
    for (kind, count) in &stats.by_type {
        println!("  {}: {}", kind, count);
    }
    if let (Some(oldest), Some(newest)) = (&stats.oldest, &stats.newest) {
        println!("  oldest {}  newest {}", oldest, newest);
    }
    println!("Threshold: {} day(s) (before {})", report.threshold_days, report.cutoff);
    println!("  prunable (archived): {}", report.prunable);
    println!("  archivable (read):   {}", report.archivable);
    println!("  database size: {} bytes", report.db_bytes);

    if !force {
        println!("\nRun with --force to prune.");
        return Ok(());
    }

    let recorder = recorder_for(config.settings.memory_command.as_deref());
    let outcome = mailbox.prune_force(recorder.as_ref(), days).await?;
    println!();
    println!("Remembered {} message(s)", outcome.remembered);
    if outcome.remember_failures > 0 {
        println!("  {} could not be recorded (see log)", outcome.remember_failures);
    }
    println!("Auto-archived {} read message(s)", outcome.auto_archived);
    println!("Deleted {} archived message(s)", outcome.deleted);
    println!(
        "Database size: {} -> {} bytes",
        outcome.bytes_before, outcome.bytes_after
    );
    Ok(())
}

fn cmd_status(mailbox: &Mailbox) -> Result<()> {
    let status = mailbox.status()?;

    println!("Agent:     {}", status.agent_id);
    match &status.db_path {
        Some(path) => println!("Database:  {} ({} bytes)", path.display(), status.db_bytes),
        None => println!("Database:  (in memory)"),
    }
    println!("Transport: {}", status.default_transport);
    println!(
        "\nInbox: {} message(s), {} unread",
        status.inbox.total, status.inbox.unread
    );
    println!(
        "Store: total={} unread={} read={} archived={}",
        status.store.total, status.store.unread, status.store.read, status.store.archived
    );
    println!("Active agents: {}", status.active_agents);
    Ok(())
}

fn print_agent(agent: &Agent) {
    println!(
        "  {} [{}] role={} branch={} last_seen={}",
        agent.id,
        agent.status,
        agent.role,
        agent.branch.as_deref().unwrap_or("-"),
        agent.last_seen_at
    );
}

fn cmd_register(mailbox: &Mailbox, registration: Registration) -> Result<()> {
    let agent = mailbox.register(registration)?;
    println!("Registered:");
    print_agent(&agent);
    Ok(())
}

fn cmd_deregister(mailbox: &Mailbox, id: Option<&str>) -> Result<()> {
    let agent = mailbox.deregister(id)?;
    println!("Deregistered {}", agent.id);
    Ok(())
}

fn cmd_agents(mailbox: &Mailbox, active_only: bool, json: bool) -> Result<()> {
    let agents = mailbox.agents(active_only)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&agents)?);
        return Ok(());
    }

    println!("Agents:");
    if agents.is_empty() {
        println!("  (none)");
    }
    for agent in &agents {
        print_agent(agent);
    }
    Ok(())
}

async fn cmd_receive(
    mailbox: &Mailbox,
    transport: Option<&str>,
    watch: bool,
    interval: u64,
) -> Result<()> {
    if watch {
        mailbox
            .watch(transport, Duration::from_secs(interval.max(1)))
            .await?;
        return Ok(());
    }

    let report = mailbox.receive(transport).await?;
    for (name, result) in &report.transports {
        match result {
            PollResult::Skipped => println!("  {}: nothing to poll", name),
            PollResult::Polled { fetched, ingested } => {
                println!("  {}: {} envelope(s), {} new", name, fetched, ingested)
            }
            PollResult::Failed { error } => println!("  {}: failed: {}", name, error),
        }
    }
    println!("Received {} new message(s)", report.ingested);
    Ok(())
}

fn cmd_transport_status(mailbox: &Mailbox, config: &Config) -> Result<()> {
    println!("Default transport: {}", mailbox.default_transport());
    println!("\nTransports:");
    for adapter in mailbox.transports().all() {
        let state = if adapter.available() {
            "available"
        } else {
            "unavailable"
        };
        let receive = if adapter.can_receive() { "yes" } else { "no" };
        println!(
            "  {:<8} {:<12} receive={:<3} {}",
            adapter.name(),
            state,
            receive,
            adapter.describe()
        );
    }

    let spool = config.spool_dir();
    if spool.is_dir() {
        let pending = std::fs::read_dir(&spool)?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file())
            .count();
        println!(
            "\nSimpleX spool: {} pending file(s) ({} consumed into {}/)",
            pending,
            spool.join(PROCESSED_DIR).read_dir().map(|d| d.count()).unwrap_or(0),
            PROCESSED_DIR
        );
    }
    Ok(())
}

fn cmd_migrate(mailbox: &Mailbox, dir: PathBuf) -> Result<()> {
    let report = crate::migrate::migrate(mailbox.store(), &dir)?;
    println!(
        "Imported {} message(s) from {} ({} already present, {} skipped)",
        report.imported,
        dir.display(),
        report.duplicates,
        report.skipped
    );
    Ok(())
}
