//! vm-state CLI - Manage portable MicroVM states

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use vm_state::backend::LocalZfsBackend;
use vm_state::config::LifecycleKind;
use vm_state::workflow::{self, MigrateOptions, DELETE_CONFIRMATION};
use vm_state::{
    lifecycle, Config, Error, MigrateStep, Result, Slot, SlotLifecycle, Snapshot, State,
    StateProvider,
};

#[derive(Parser)]
#[command(name = "vm-state")]
#[command(about = "Manage portable MicroVM states", long_about = None)]
#[command(version)]
struct Cli {
    /// JSON config file (default: /etc/vm-state.json if present)
    #[arg(long, global = true, env = "VM_STATE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the ZFS pool
    #[arg(long, global = true)]
    pool: Option<String>,

    /// Service-manager client: systemctl or busctl
    #[arg(long, global = true)]
    lifecycle: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// List all states and slot assignments
    List,

    /// Show the status of one slot
    Status {
        /// Slot to inspect (slot1-slot5)
        slot: String,
    },

    /// Create a new empty state
    Create {
        /// Name for the new state
        name: String,
    },

    /// Snapshot current slot's state
    Snapshot {
        /// Slot to snapshot (slot1-slot5)
        slot: String,
        /// Name for the snapshot
        name: String,
    },

    /// Assign a state to a slot
    Assign {
        /// Slot to assign to (slot1-slot5)
        slot: String,
        /// State to assign
        state: String,
        /// Allow a state that another slot already uses
        #[arg(long)]
        force: bool,
    },

    /// Clone a state to a new name
    Clone {
        /// Source state to clone
        source: String,
        /// Destination state name
        destination: String,
    },

    /// Delete a state (must not be in use)
    Delete {
        /// State to delete
        name: String,
        /// Skip the in-use check
        #[arg(long)]
        force: bool,
    },

    /// Delete a single snapshot
    DeleteSnapshot {
        /// State the snapshot belongs to
        state: String,
        /// Snapshot name
        snapshot: String,
    },

    /// Stop slot, assign state, start slot
    Migrate {
        /// State to migrate
        state: String,
        /// Slot to migrate to (slot1-slot5)
        slot: String,
        /// Allow a state that another slot already uses
        #[arg(long)]
        force: bool,
    },

    /// Restore a snapshot to a new state
    Restore {
        /// Snapshot name to restore
        snapshot: String,
        /// New state name
        state: String,
    },

    /// Start a slot
    Start {
        /// Slot to start (slot1-slot5)
        slot: String,
    },

    /// Stop a slot
    Stop {
        /// Slot to stop (slot1-slot5)
        slot: String,
    },

    /// Restart a slot
    Restart {
        /// Slot to restart (slot1-slot5)
        slot: String,
    },
}

impl Commands {
    /// Reads are allowed unprivileged, everything else needs root
    fn requires_root(&self) -> bool {
        !matches!(self, Commands::List | Commands::Status { .. })
    }

    /// Commands that hold the assignment lock from start to finish
    fn holds_lock(&self) -> bool {
        matches!(
            self,
            Commands::Create { .. }
                | Commands::Snapshot { .. }
                | Commands::Assign { .. }
                | Commands::Clone { .. }
                | Commands::DeleteSnapshot { .. }
                | Commands::Migrate { .. }
                | Commands::Restore { .. }
        )
    }
}

/// Everything a command needs
struct Context {
    config: Config,
    states: StateProvider<LocalZfsBackend>,
    lifecycle: Box<dyn SlotLifecycle>,
}

fn info(msg: &str) {
    println!("{} {}", "[INFO]".blue(), msg);
}

fn success(msg: &str) {
    println!("{} {}", "[OK]".green(), msg);
}

fn warn(msg: &str) {
    println!("{} {}", "[WARN]".yellow(), msg);
}

fn error(msg: &str) {
    eprintln!("{} {}", "[ERROR]".red(), msg);
}

fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.1}T", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.1}G", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1}M", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1}K", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

fn cmd_list(ctx: &Context) -> Result<()> {
    info("States and assignments:");
    println!();
    println!(
        "{:<15} {:<15} {:<10} {}",
        "SLOT", "STATE", "RUNNING", "ZFS DATASET"
    );
    println!(
        "{:<15} {:<15} {:<10} {}",
        "----", "-----", "-------", "-----------"
    );

    for (slot, name) in ctx.states.list_assignment_names()? {
        let status = ctx.lifecycle.status(slot)?;
        let dataset = match State::new(&name) {
            Ok(state) => match ctx.states.get_state_info(&state)? {
                Some(state_info) => state_info.zfs_dataset,
                None => "(not found)".to_string(),
            },
            Err(_) => "(invalid name)".to_string(),
        };
        println!(
            "{:<15} {:<15} {:<10} {}",
            slot.as_str(),
            name,
            status.to_string(),
            dataset
        );
    }

    println!();
    info("Available states (ZFS datasets):");
    let states = ctx.states.list_states()?;
    if states.is_empty() {
        println!("  (no states created yet)");
    } else {
        for state_info in states {
            println!(
                "  {:<20} used: {:<8} avail: {}",
                state_info.state.name(),
                format_size(state_info.used_bytes),
                format_size(state_info.available_bytes)
            );
        }
    }

    println!();
    info("Snapshots:");
    let snapshots = ctx.states.list_snapshots(None)?;
    if snapshots.is_empty() {
        println!("  (no snapshots)");
    } else {
        for snap in snapshots.iter().take(20) {
            println!(
                "  {:<50} {}",
                snap.full_name,
                format_size(snap.referenced_bytes)
            );
        }
        if snapshots.len() > 20 {
            println!("  ... and {} more", snapshots.len() - 20);
        }
    }

    Ok(())
}

fn cmd_status(ctx: &Context, slot_str: &str) -> Result<()> {
    let slot: Slot = slot_str.parse()?;
    let details = ctx.lifecycle.details(slot)?;
    let state = ctx.states.get_slot_state(slot)?;

    println!("{:<10} {}", "SLOT", details.slot);
    println!("{:<10} {}", "UNIT", details.unit);
    println!("{:<10} {}", "IP", details.ip);
    println!("{:<10} {}", "RUNNING", details.status);
    println!("{:<10} {}", "STATE", state);

    Ok(())
}

fn cmd_create(ctx: &Context, name: &str) -> Result<()> {
    let state = State::new(name)?;

    info(&format!("Creating state '{}'...", state));
    ctx.states.create_state(&state)?;
    success(&format!(
        "State '{}' created at {}",
        state,
        ctx.states.state_dir(&state).display()
    ));
    info(&format!("Assign it to a slot with: vm-state assign <slot> {}", state));

    Ok(())
}

fn cmd_snapshot(ctx: &Context, slot_str: &str, name: &str) -> Result<()> {
    let slot: Slot = slot_str.parse()?;
    let snapshot = Snapshot::new(name)?;

    if ctx.lifecycle.is_running(slot)? {
        warn(&format!(
            "{} is running - snapshot will be crash-consistent",
            slot
        ));
        warn(&format!(
            "For a clean snapshot, stop the slot first: vm-state stop {}",
            slot
        ));
    }

    info(&format!("Creating snapshot '{}' of {}...", snapshot, slot));
    let state = ctx.states.snapshot_slot(slot, &snapshot)?;
    success(&format!(
        "Snapshot created: {}@{}",
        ctx.states.dataset_path(&state),
        snapshot
    ));

    Ok(())
}

fn cmd_assign(ctx: &Context, slot_str: &str, state_str: &str, force: bool) -> Result<()> {
    let slot: Slot = slot_str.parse()?;
    let state = State::new(state_str)?;

    let was_running = ctx.lifecycle.is_running(slot)?;
    if was_running {
        warn(&format!(
            "{} is currently running. Assignment will take effect after restart.",
            slot
        ));
    }

    if !ctx.states.state_exists(&state)? {
        warn(&format!("State '{}' doesn't exist yet. Creating it...", state));
    }

    ctx.states.assign_state(slot, &state, force)?;

    info(&format!(
        "Created symlink: {} -> {}",
        ctx.states.slot_data_img(slot).display(),
        ctx.states.state_data_img(&state).display()
    ));
    success(&format!("Assigned state '{}' to {}", state, slot));

    if was_running {
        info(&format!(
            "Restart the slot to use the new state: vm-state restart {}",
            slot
        ));
    } else {
        info(&format!("Start the slot with: vm-state start {}", slot));
    }

    Ok(())
}

fn cmd_clone(ctx: &Context, source: &str, destination: &str) -> Result<()> {
    let src = State::new(source)?;
    let dst = State::new(destination)?;

    info(&format!("Cloning state '{}' to '{}'...", src, dst));
    ctx.states.clone_state(&src, &dst)?;
    success(&format!("State '{}' cloned to '{}'", src, dst));
    info(&format!("Assign it to a slot with: vm-state assign <slot> {}", dst));

    Ok(())
}

/// Ask for the confirmation token on stdin
fn prompt_delete(state: &State) -> Result<String> {
    warn(&format!(
        "This will permanently delete state '{}' and all its data!",
        state
    ));
    print!("Type '{}' to confirm: ", DELETE_CONFIRMATION);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input)
}

fn cmd_delete(ctx: &Context, name: &str, force: bool) -> Result<()> {
    let state = State::new(name)?;

    if force {
        warn("Skipping the in-use check (--force)");
    }
    workflow::delete_confirmed(&ctx.states, &state, force, prompt_delete)?;
    success(&format!("State '{}' deleted", state));

    Ok(())
}

fn cmd_delete_snapshot(ctx: &Context, state_str: &str, snapshot_str: &str) -> Result<()> {
    let state = State::new(state_str)?;
    let snapshot = Snapshot::new(snapshot_str)?;

    info(&format!("Deleting snapshot '{}@{}'...", state, snapshot));
    ctx.states.delete_snapshot(&state, &snapshot)?;
    success(&format!("Snapshot '{}@{}' deleted", state, snapshot));

    Ok(())
}

fn cmd_migrate(ctx: &Context, state_str: &str, slot_str: &str, force: bool) -> Result<()> {
    let slot: Slot = slot_str.parse()?;
    let state = State::new(state_str)?;

    info(&format!("Migrating state '{}' to {}...", state, slot));

    let options = MigrateOptions {
        settle_delay: ctx.config.settle_delay(),
        force,
    };
    match workflow::migrate(&ctx.states, ctx.lifecycle.as_ref(), &state, slot, &options) {
        Ok(outcome) => {
            if outcome.was_running {
                info(&format!("Stopped {} (was running '{}')", slot, outcome.previous));
            }
            if outcome.created {
                info(&format!("Created new state '{}'", state));
            }
            success(&format!(
                "Migration complete. {} is now running state '{}'",
                slot, state
            ));
            Ok(())
        }
        Err(e) => {
            if let Error::MigrationFailed { step, .. } = &e {
                match step {
                    MigrateStep::Stop => {}
                    MigrateStep::Assign => warn(&format!(
                        "{} is stopped and still assigned to its previous state",
                        slot
                    )),
                    MigrateStep::Start => warn(&format!(
                        "{} is stopped with state '{}' assigned. Start it with: vm-state start {}",
                        slot, state, slot
                    )),
                }
            }
            Err(e)
        }
    }
}

fn cmd_restore(ctx: &Context, snapshot_str: &str, state_str: &str) -> Result<()> {
    let snapshot = Snapshot::new(snapshot_str)?;
    let state = State::new(state_str)?;

    info(&format!(
        "Restoring snapshot '{}' to state '{}'...",
        snapshot, state
    ));
    ctx.states.restore_snapshot(&snapshot, &state)?;
    success(&format!("Snapshot restored to state '{}'", state));
    info(&format!("Assign it to a slot with: vm-state assign <slot> {}", state));

    Ok(())
}

fn cmd_start(ctx: &Context, slot_str: &str) -> Result<()> {
    let slot: Slot = slot_str.parse()?;

    info(&format!("Starting {}...", slot));
    ctx.lifecycle.start(slot)?;
    success(&format!("{} started", slot));

    Ok(())
}

fn cmd_stop(ctx: &Context, slot_str: &str) -> Result<()> {
    let slot: Slot = slot_str.parse()?;

    info(&format!("Stopping {}...", slot));
    ctx.lifecycle.stop(slot)?;
    success(&format!("{} stopped", slot));

    Ok(())
}

fn cmd_restart(ctx: &Context, slot_str: &str) -> Result<()> {
    let slot: Slot = slot_str.parse()?;

    info(&format!("Restarting {}...", slot));
    ctx.lifecycle.restart(slot)?;
    success(&format!("{} restarted", slot));

    Ok(())
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(pool) = &cli.pool {
        config.zfs_pool = pool.clone();
    }
    if let Some(kind) = &cli.lifecycle {
        config.lifecycle = kind.parse::<LifecycleKind>()?;
    }
    Ok(config)
}

/// Refuse privileged commands before any backend is touched
fn check_privilege(command: &Commands, is_root: bool) -> Result<()> {
    if command.requires_root() && !is_root {
        return Err(Error::PermissionDenied);
    }
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    let default = Commands::List;
    let command = cli.command.as_ref().unwrap_or(&default);

    check_privilege(command, nix::unistd::geteuid().is_root())?;

    let config = load_config(&cli)?;
    tracing::debug!(?config, "configuration");

    let ctx = Context {
        states: StateProvider::new(LocalZfsBackend::new(), &config),
        lifecycle: lifecycle::from_config(&config),
        config,
    };

    let _lock = if command.holds_lock() {
        Some(ctx.states.lock()?)
    } else {
        None
    };

    match command {
        Commands::List => cmd_list(&ctx),
        Commands::Status { slot } => cmd_status(&ctx, slot),
        Commands::Create { name } => cmd_create(&ctx, name),
        Commands::Snapshot { slot, name } => cmd_snapshot(&ctx, slot, name),
        Commands::Assign { slot, state, force } => cmd_assign(&ctx, slot, state, *force),
        Commands::Clone { source, destination } => cmd_clone(&ctx, source, destination),
        Commands::Delete { name, force } => cmd_delete(&ctx, name, *force),
        Commands::DeleteSnapshot { state, snapshot } => {
            cmd_delete_snapshot(&ctx, state, snapshot)
        }
        Commands::Migrate { state, slot, force } => cmd_migrate(&ctx, state, slot, *force),
        Commands::Restore { snapshot, state } => cmd_restore(&ctx, snapshot, state),
        Commands::Start { slot } => cmd_start(&ctx, slot),
        Commands::Stop { slot } => cmd_stop(&ctx, slot),
        Commands::Restart { slot } => cmd_restart(&ctx, slot),
    }
}

/// Initialize the tracing subscriber.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("vm_state=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    init_logging();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::debug!(error = ?e, kind = ?e.kind(), "command failed");
            error(&e.to_string());
            ExitCode::FAILURE
        }
    }
}
