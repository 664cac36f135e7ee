//! Command-line administration for a rollcall store.
//!
//! The binary opens the store with every collaborator left at its default:
//! all operations are permitted, nothing is provisioned, and stops are
//! acknowledged at once. Removals are therefore applied before the command
//! returns.
//!
//! # Configuration Sources
//!
//! - A JSON file given with `--config` (`ROLLCALL_CONFIG`)
//! - `--data-dir` (`ROLLCALL_DATA_DIR`) and `--max-users`
//!   (`ROLLCALL_MAX_USERS`), which override the file
//! - Default values

#![warn(missing_docs)]

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use rollcall_registry::{
    Collaborators, RegistryConfig, RemovalRequest, SerialNumber, UserFlags, UserId, UserRecord,
    UserRegistry, WriteStatus,
};

/// Command-line arguments.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "rollcall",
    about = "Inspect and administer a rollcall identity store",
    version
)]
pub struct Cli {
    /// Root of the store
    #[arg(long, env = "ROLLCALL_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Maximum number of identities, primary included
    #[arg(long, env = "ROLLCALL_MAX_USERS")]
    pub max_users: Option<usize>,

    /// JSON configuration file
    #[arg(long, env = "ROLLCALL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Command to run
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// List every identity
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Show one identity
    Show {
        /// Identity id
        id: UserId,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Create an identity
    Create {
        /// Display name
        name: String,
        /// Grant administrative rights
        #[arg(long)]
        admin: bool,
        /// Create a guest identity
        #[arg(long)]
        guest: bool,
        /// Restrict the identity
        #[arg(long)]
        restricted: bool,
    },
    /// Change the display name of an identity
    Rename {
        /// Identity id
        id: UserId,
        /// New display name
        name: String,
    },
    /// Remove an identity
    Remove {
        /// Identity id
        id: UserId,
    },
    /// Enable or disable the guest identity
    Guest {
        /// New state
        #[arg(value_enum)]
        state: Toggle,
    },
    /// Mark first-time setup of an identity as complete
    Initialize {
        /// Identity id
        id: UserId,
    },
    /// Print the serial number of an identity
    Serial {
        /// Identity id
        id: UserId,
    },
    /// Find the identity carrying a serial number
    LookupSerial {
        /// Serial number
        serial: SerialNumber,
    },
}

/// On or off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Toggle {
    /// Enable
    On,
    /// Disable
    Off,
}

impl Cli {
    /// Resolve the registry configuration from the file, flags and
    /// environment.
    pub fn registry_config(&self) -> Result<RegistryConfig> {
        let mut config = match &self.config {
            Some(path) => RegistryConfig::from_json_file(path)?,
            None => RegistryConfig::default(),
        };
        if let Some(data_dir) = &self.data_dir {
            config = config.with_data_dir(data_dir);
        }
        if let Some(max_users) = self.max_users {
            config = config.with_max_users(max_users);
        }
        config.validate()?;
        Ok(config)
    }
}

/// Run one command, writing its output to `out`.
pub fn run(cli: &Cli, out: &mut impl Write) -> Result<()> {
    let config = cli.registry_config()?;
    tracing::debug!("Opening store at {}", config.data_dir.display());

    let registry = UserRegistry::open(config, Collaborators::default())
        .context("failed to open user store")?;
    let mut stop_events = registry
        .take_stop_events()
        .context("stop events already taken")?;

    match &cli.command {
        Command::List { json } => {
            let users = registry.list()?;
            if *json {
                writeln!(out, "{}", serde_json::to_string_pretty(&users)?)?;
            } else {
                for user in &users {
                    writeln!(out, "{}", format_row(user))?;
                }
            }
        }
        Command::Show { id, json } => {
            let Some(user) = registry.get(*id)? else {
                bail!("user {id} not found");
            };
            if *json {
                writeln!(out, "{}", serde_json::to_string_pretty(&user)?)?;
            } else {
                write!(out, "{}", format_details(&user))?;
            }
        }
        Command::Create {
            name,
            admin,
            guest,
            restricted,
        } => {
            let mut flags = UserFlags::empty();
            flags.set(UserFlags::ADMIN, *admin);
            flags.set(UserFlags::GUEST, *guest);
            flags.set(UserFlags::RESTRICTED, *restricted);

            let user = registry.create(name, flags)?;
            writeln!(
                out,
                "Created user {} (serial {})",
                user.id, user.serial_number
            )?;
        }
        Command::Rename { id, name } => match registry.rename(*id, name.as_str())? {
            WriteStatus::Unchanged if registry.exists(*id) => {
                writeln!(out, "User {id} already named {name:?}")?;
            }
            WriteStatus::Unchanged => bail!("user {id} not found"),
            WriteStatus::Persisted => writeln!(out, "Renamed user {id}")?,
            WriteStatus::NotPersisted => bail!("renamed user {id} but failed to save it"),
        },
        Command::Remove { id } => {
            match registry.request_removal(*id)? {
                RemovalRequest::Accepted => {}
                RemovalRequest::AlreadyPending => {
                    writeln!(out, "Removal of user {id} already pending")?;
                }
            }
            stop_events.drain(&registry);
            if registry.exists(*id) {
                writeln!(out, "User {id} is waiting to be stopped")?;
            } else {
                writeln!(out, "Removed user {id}")?;
            }
        }
        Command::Guest { state } => {
            registry.set_guest_enabled(*state == Toggle::On)?;
            stop_events.drain(&registry);
            writeln!(
                out,
                "Guest user {}",
                if registry.is_guest_enabled() {
                    "enabled"
                } else {
                    "disabled"
                }
            )?;
        }
        Command::Initialize { id } => match registry.make_initialized(*id)? {
            WriteStatus::Unchanged if registry.exists(*id) => {
                writeln!(out, "User {id} already initialized")?;
            }
            WriteStatus::Unchanged => bail!("user {id} not found"),
            WriteStatus::Persisted => writeln!(out, "Initialized user {id}")?,
            WriteStatus::NotPersisted => bail!("initialized user {id} but failed to save it"),
        },
        Command::Serial { id } => match registry.serial_number(*id) {
            Some(serial) => writeln!(out, "{serial}")?,
            None => bail!("user {id} not found"),
        },
        Command::LookupSerial { serial } => match registry.id_from_serial(*serial) {
            Some(id) => writeln!(out, "{id}")?,
            None => bail!("no user with serial number {serial}"),
        },
    }

    Ok(())
}

fn flag_names(flags: UserFlags) -> String {
    let names: Vec<String> = flags
        .iter_names()
        .map(|(name, _)| name.to_lowercase())
        .collect();
    if names.is_empty() {
        "-".to_string()
    } else {
        names.join(",")
    }
}

/// One table row: id, serial, flags, name.
pub fn format_row(user: &UserRecord) -> String {
    format!(
        "{:>5}  {:>6}  {:<24}  {}",
        user.id,
        user.serial_number,
        flag_names(user.flags),
        user.name
    )
}

/// Multi-line description of one identity.
pub fn format_details(user: &UserRecord) -> String {
    let icon = user
        .icon_path
        .as_ref()
        .map_or_else(|| "-".to_string(), |path| path.display().to_string());
    format!(
        "id:      {}\nserial:  {}\nname:    {}\nflags:   {} ({:#x})\nicon:    {}\n",
        user.id,
        user.serial_number,
        user.name,
        flag_names(user.flags),
        user.flags.bits(),
        icon
    )
}
