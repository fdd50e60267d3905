//! Command implementations

use anyhow::{Context, bail};
use rekey_rotation::prelude::*;
use rekey_rotation::{DivergenceJournal, EntityFactor, RotationError};
use std::sync::Arc;
use tracing::info;

use crate::cli::{AccountCommand, CertCommand, Command, MasterCommand, RotateArgs};
use crate::config::CliConfig;
use crate::state::{FileMasterSecretStore, FileStateStore};

pub async fn run(command: Command, config: &CliConfig) -> anyhow::Result<()> {
    match command {
        Command::Master(MasterCommand::Init { secret, force }) => {
            master_init(config, secret, force).await
        }
        Command::Account(AccountCommand::Add {
            username,
            credential_hash,
        }) => account_add(config, &username, &credential_hash).await,
        Command::Cert(CertCommand::Add {
            project,
            username,
            password,
        }) => cert_add(config, &project, &username, &password).await,
        Command::Cert(CertCommand::List) => cert_list(config).await,
        Command::Cert(CertCommand::Reveal { project, username }) => {
            cert_reveal(config, &project, &username).await
        }
        Command::Rotate(args) => rotate(config, args).await,
        Command::Journal => journal(config).await,
    }
}

async fn open_state(config: &CliConfig) -> anyhow::Result<Arc<FileStateStore>> {
    FileStateStore::open(&config.state_file)
        .await
        .with_context(|| format!("failed to open state file {}", config.state_file.display()))
}

fn cipher(config: &CliConfig) -> anyhow::Result<Arc<AesGcmCipher>> {
    let cipher = AesGcmCipher::new(config.cipher).context("invalid cipher configuration")?;
    Ok(Arc::new(cipher))
}

async fn current_master(config: &CliConfig) -> anyhow::Result<MasterSecret> {
    FileMasterSecretStore::new(&config.master_secret_file)
        .current()
        .await
        .context("failed to read the current master secret")
}

async fn factor(state: &FileStateStore, username: &str) -> anyhow::Result<EntityFactor> {
    state
        .credential_factor(username)
        .await
        .with_context(|| format!("no account for user '{username}'; run `rekey account add` first"))
}

async fn master_init(config: &CliConfig, secret: String, force: bool) -> anyhow::Result<()> {
    let master = FileMasterSecretStore::new(&config.master_secret_file);
    if master.exists() && !force {
        bail!(
            "master secret already exists at {}; use `rekey rotate` to change it",
            master.path().display()
        );
    }
    let secret = MasterSecret::from(secret);
    if secret.is_empty() {
        bail!("master secret must not be empty");
    }

    master
        .set_current(secret)
        .await
        .context("failed to write the master secret")?;
    info!(path = %master.path().display(), "Master secret initialized");
    println!("master secret written to {}", master.path().display());
    Ok(())
}

async fn account_add(config: &CliConfig, username: &str, credential_hash: &str) -> anyhow::Result<()> {
    if credential_hash.is_empty() {
        bail!("credential hash must not be empty");
    }
    let state = open_state(config).await?;
    let existed = state.has_account(username);
    state
        .add_account(username, credential_hash)
        .await
        .context("failed to save account")?;
    if existed {
        println!("account '{username}' updated");
    } else {
        println!("account '{username}' saved");
    }
    Ok(())
}

async fn cert_add(config: &CliConfig, project: &str, username: &str, password: &str) -> anyhow::Result<()> {
    let key = RecordKey::new(project, username).context("invalid certificate key")?;
    let state = open_state(config).await?;
    let factor = factor(&state, username).await?;
    let master = current_master(config).await?;

    let encrypted = cipher(config)?
        .encrypt(&master, &factor, password.as_bytes())
        .context("failed to encrypt certificate password")?;
    state
        .persist(SecretRecord::new(key.clone(), encrypted))
        .await
        .context("failed to save certificate record")?;

    println!("certificate password stored for {key}");
    Ok(())
}

async fn cert_list(config: &CliConfig) -> anyhow::Result<()> {
    let state = open_state(config).await?;
    for record in state.list_all().await? {
        println!("{}", record.key);
    }
    Ok(())
}

async fn cert_reveal(config: &CliConfig, project: &str, username: &str) -> anyhow::Result<()> {
    let key = RecordKey::new(project, username).context("invalid certificate key")?;
    let state = open_state(config).await?;
    let record = state
        .find_by_key(&key)
        .await
        .with_context(|| format!("no certificate record {key}"))?;
    let factor = factor(&state, username).await?;
    let master = current_master(config).await?;

    let plaintext = cipher(config)?
        .decrypt(&master, &factor, &record.encrypted_secret)
        .with_context(|| format!("failed to decrypt {key} under the current master secret"))?;
    println!("{}", String::from_utf8_lossy(&plaintext));
    Ok(())
}

async fn rotate(config: &CliConfig, args: RotateArgs) -> anyhow::Result<()> {
    let state = open_state(config).await?;
    let handler = Arc::new(CertificateSecretHandler::new(state.clone(), cipher(config)?));
    let journal = DivergenceJournal::new(&config.journal_file);

    let coordinator = RotationCoordinator::builder(FileMasterSecretStore::new(&config.master_secret_file))
        .handler_with_store(handler, state)
        .observer(Arc::new(TracingObserver))
        .observer(Arc::new(journal.clone()))
        .config(config.coordinator)
        .build()
        .context("failed to assemble the rotation coordinator")?;

    let old = MasterSecret::from(args.old_secret);
    let new = MasterSecret::from(args.new_secret);

    match coordinator.rotate(&old, &new).await {
        Ok(report) => {
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "rotation {} committed: {} record(s) re-encrypted",
                    report.attempt_id,
                    report.records_updated()
                );
            }
            Ok(())
        }
        Err(err) => {
            if let RotationError::RollbackPartialFailure(failure) = &err {
                eprintln!("records left divergent (see {}):", journal.path().display());
                for (handler, record) in failure.divergent() {
                    eprintln!("  {handler}: {} ({})", record.key, record.reason);
                }
                for reason in &failure.undelivered_alerts {
                    eprintln!("warning: divergence alert not recorded: {reason}");
                }
            }
            Err(err).context("master secret rotation failed")
        }
    }
}

async fn journal(config: &CliConfig) -> anyhow::Result<()> {
    let journal = DivergenceJournal::new(&config.journal_file);
    let entries = journal
        .entries()
        .await
        .with_context(|| format!("failed to read journal {}", journal.path().display()))?;

    if entries.is_empty() {
        println!("no divergent records");
        return Ok(());
    }
    for entry in entries {
        println!(
            "{} attempt={} handler={} record={} prior={} reason={}",
            entry.recorded_at.to_rfc3339(),
            entry.attempt_id,
            entry.handler,
            entry.key,
            entry.prior.to_base64(),
            entry.reason
        );
    }
    Ok(())
}
