// dedrm-core - E-book DRM Removal Engine
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


use anyhow::{bail, Context};
use base64::Engine;
use clap::{Args, Parser, Subcommand};
use dedrm_core::config::default_config_dir;
use dedrm_core::keys::generate::{barnes_noble_key, ereader_key, generated_key, kindle_pid};
use dedrm_core::keys::AddOutcome;
use dedrm_core::logging::init_logging;
use dedrm_core::{CandidateKey, Config, DeDrmError, DecryptOutcome, KeyScheme, Session};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "dedrm-cli")]
#[command(about = "Remove DRM from EPUB, PDF, Mobipocket and eReader books", long_about = None)]
struct Cli {
    /// Configuration directory (defaults to $DEDRM_CONFIG_DIR or ~/.config/dedrm)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Log filter, e.g. `dedrm_core=debug`
    #[arg(long, global = true)]
    log: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decrypt one book
    Decrypt {
        /// Protected book
        file: PathBuf,
        /// Output path (defaults to `<name>_nodrm.<ext>` next to the input)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Manage stored keys
    #[command(subcommand)]
    Keys(KeyCommands),
}

#[derive(Subcommand)]
enum KeyCommands {
    /// List stored keys (names only)
    List,
    /// Add a key
    Add(AddKey),
    /// Remove a key by name
    Remove {
        #[arg(short, long)]
        scheme: String,
        #[arg(short, long)]
        name: String,
    },
    /// Generate and store a Barnes & Noble key from name and card number
    BnGenerate(AccountKey),
    /// Generate and store an eReader key from name and card number
    EreaderGenerate(AccountKey),
    /// Print the Kindle PID of an e-ink device serial
    KindlePid {
        #[arg(short, long)]
        serial: String,
    },
}

#[derive(Args)]
struct AddKey {
    #[arg(short, long)]
    scheme: String,
    #[arg(short, long)]
    name: String,
    #[arg(long, group = "material")]
    hex: Option<String>,
    #[arg(long, group = "material")]
    base64: Option<String>,
    /// Key in the scheme's usual text form
    #[arg(long, group = "material")]
    text: Option<String>,
    /// Key file as written by key retrieval tools
    #[arg(long, group = "material")]
    file: Option<PathBuf>,
}

#[derive(Args)]
struct AccountKey {
    /// Name on the account
    #[arg(short, long)]
    name: String,
    /// Credit card number used for the purchase
    #[arg(short, long)]
    card: String,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_logging(cli.log.as_deref()) {
        eprintln!("{}", e);
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<DeDrmError>() {
                Some(err) => eprintln!("Error: {}", err.user_message()),
                None => eprintln!("Error: {:#}", e),
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let dir = cli.config_dir.unwrap_or_else(default_config_dir);
    let config = Config::load(&dir)?;
    let mut session = Session::initialize(config)?;

    match cli.command {
        Commands::Decrypt { file, output } => {
            match session.decrypt_file(&file)? {
                DecryptOutcome::Decrypted(artifact) => {
                    let written = artifact.write(&file, output.as_deref())?;
                    println!("Decrypted: {}", written.display());
                }
                DecryptOutcome::PassThrough(reason) => println!("Unchanged: {}", reason),
            }
        }
        Commands::Keys(command) => keys(&mut session, command)?,
    }
    Ok(())
}

fn keys(session: &mut Session, command: KeyCommands) -> anyhow::Result<()> {
    match command {
        KeyCommands::List => {
            let store = session.key_store();
            if store.is_empty() {
                println!("No keys stored");
            }
            for scheme in store.schemes() {
                println!("{}:", scheme.display_name());
                for key in store.keys(scheme) {
                    println!("  {} ({})", key.masked_name(), key.fingerprint());
                }
            }
        }
        KeyCommands::Add(add) => {
            let scheme: KeyScheme = add.scheme.parse()?;
            let material = if let Some(hex) = add.hex {
                hex::decode(hex.trim()).context("invalid hex")?
            } else if let Some(b64) = add.base64 {
                base64::engine::general_purpose::STANDARD
                    .decode(b64.trim())
                    .context("invalid base64")?
            } else if let Some(text) = add.text {
                scheme.parse_material(&text)?
            } else if let Some(path) = add.file {
                let contents = std::fs::read(&path)
                    .with_context(|| format!("reading {}", path.display()))?;
                scheme.material_from_file(&contents)?
            } else {
                bail!("one of --hex, --base64, --text or --file is required");
            };
            store_key(session, CandidateKey::new(scheme, add.name, material))?;
        }
        KeyCommands::Remove { scheme, name } => {
            let scheme: KeyScheme = scheme.parse()?;
            if !session.key_store_mut().remove(scheme, &name) {
                bail!("no {} key named {}", scheme.display_name(), name);
            }
            session.key_store_mut().save()?;
            println!("Removed");
        }
        KeyCommands::BnGenerate(account) => {
            let material = barnes_noble_key(&account.name, &account.card)?;
            println!(
                "Key: {}",
                base64::engine::general_purpose::STANDARD.encode(&material)
            );
            store_key(
                session,
                generated_key(KeyScheme::BarnesNoble, &account.name, material),
            )?;
        }
        KeyCommands::EreaderGenerate(account) => {
            let material = ereader_key(&account.name, &account.card)?;
            println!("Key: {}", hex::encode(&material));
            store_key(
                session,
                generated_key(KeyScheme::EReader, &account.name, material),
            )?;
        }
        KeyCommands::KindlePid { serial } => {
            println!("{}", kindle_pid(&serial)?);
        }
    }
    Ok(())
}

fn store_key(session: &mut Session, key: CandidateKey) -> anyhow::Result<()> {
    let name = key.masked_name();
    match session.key_store_mut().add(key) {
        AddOutcome::Added => {
            session.key_store_mut().save()?;
            println!("Added key {}", name);
        }
        AddOutcome::DuplicateMaterial => println!("This key is already stored"),
        AddOutcome::NameTaken => bail!("a key named {} already exists", name),
    }
    Ok(())
}
