//! Command-line argument parsing for the rekey operator tool

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// rekey: rotate the master encryption secret across every secret store
#[derive(Parser, Debug)]
#[command(name = "rekey")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file (defaults to ./rekey.toml when present)
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// JSON state file holding accounts and certificate records
    #[arg(long = "state-file", global = true)]
    pub state_file: Option<PathBuf>,

    /// File holding the current master secret
    #[arg(long = "master-secret-file", global = true)]
    pub master_secret_file: Option<PathBuf>,

    /// Divergence journal (JSON lines)
    #[arg(long = "journal-file", global = true)]
    pub journal_file: Option<PathBuf>,

    /// Log level or filter directive; RUST_LOG takes precedence
    #[arg(long = "log-level", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Manage the master secret file
    #[command(subcommand)]
    Master(MasterCommand),

    /// Manage accounts whose credential hash protects their certificates
    #[command(subcommand)]
    Account(AccountCommand),

    /// Manage project certificate keystore passwords
    #[command(subcommand)]
    Cert(CertCommand),

    /// Rotate the master secret
    Rotate(RotateArgs),

    /// Show records left divergent by failed rollbacks
    Journal,
}

#[derive(Subcommand, Debug)]
pub enum MasterCommand {
    /// Write the initial master secret
    Init {
        /// Master secret
        #[arg(long = "secret", env = "REKEY_MASTER_SECRET", hide_env_values = true)]
        secret: String,

        /// Overwrite an existing master secret file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum AccountCommand {
    /// Register or replace an account
    Add {
        /// Username
        username: String,

        /// Credential hash used as the entity factor
        #[arg(long = "credential-hash")]
        credential_hash: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum CertCommand {
    /// Store a certificate password encrypted under the current master secret
    Add {
        /// Project name
        project: String,

        /// Owning username
        username: String,

        /// Keystore password
        #[arg(long = "password", env = "REKEY_CERT_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// List stored certificate records
    List,

    /// Decrypt and print a certificate password
    Reveal {
        /// Project name
        project: String,

        /// Owning username
        username: String,
    },
}

#[derive(Args, Debug)]
pub struct RotateArgs {
    /// Current master secret
    #[arg(long = "old-secret", env = "REKEY_OLD_SECRET", hide_env_values = true)]
    pub old_secret: String,

    /// Replacement master secret
    #[arg(long = "new-secret", env = "REKEY_NEW_SECRET", hide_env_values = true)]
    pub new_secret: String,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}
