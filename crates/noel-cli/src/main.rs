use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use noel_core::Embedding;
use noel_store::{CheckinStore, IdentityRegistry, NewIdentity, SqliteStore};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "noel", about = "Noel check-in registry and history CLI")]
struct Cli {
    /// Path to the Noel database
    #[arg(long, env = "NOEL_DB_PATH", default_value_os_t = noel_store::default_db_path())]
    db: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a new identity from an embedding file
    Enroll {
        /// Display name shown on check-in
        #[arg(short, long)]
        name: String,
        /// Avatar image reference
        #[arg(short, long, default_value = "")]
        avatar: String,
        /// JSON file holding the embedding (array or {"embedding": [...]})
        #[arg(short, long)]
        embedding: PathBuf,
    },
    /// List enrolled identities
    List,
    /// Remove an enrolled identity
    Remove {
        /// Identity ID to remove
        id: String,
    },
    /// Show recent check-ins, newest first
    Checkins {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Show registry and history totals
    Stats,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EmbeddingFile {
    Bare(Vec<f32>),
    Wrapped { embedding: Vec<f32> },
}

fn parse_embedding(json: &str) -> Result<Embedding> {
    let values = match serde_json::from_str::<EmbeddingFile>(json)
        .context("expected a JSON number array or an object with an \"embedding\" array")?
    {
        EmbeddingFile::Bare(values) | EmbeddingFile::Wrapped { embedding: values } => values,
    };
    let embedding = Embedding::new(values);
    if !embedding.is_well_formed() {
        bail!("embedding must be non-empty with finite values");
    }
    Ok(embedding)
}

fn load_embedding(path: &Path) -> Result<Embedding> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    parse_embedding(&json).with_context(|| format!("parsing {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let store = SqliteStore::open(&cli.db)
        .await
        .with_context(|| format!("opening {}", cli.db.display()))?;

    match cli.command {
        Commands::Enroll {
            name,
            avatar,
            embedding,
        } => {
            let embedding = load_embedding(&embedding)?;
            let dim = embedding.dim();
            let identity = store
                .register_identity(NewIdentity {
                    display_name: name,
                    avatar_ref: avatar,
                    embedding,
                })
                .await?;
            println!(
                "Enrolled {} ({}), {dim}-dim embedding",
                identity.display_name, identity.id
            );
            println!("A running noeld picks this up at its next gallery refresh.");
        }
        Commands::List => {
            let identities = store.list_identities().await?;
            if identities.is_empty() {
                println!("No identities enrolled");
            }
            for identity in identities {
                println!(
                    "{}  {:<24} dim={:<4} registered {}",
                    identity.id,
                    identity.display_name,
                    identity.embedding.dim(),
                    identity.registered_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        Commands::Remove { id } => {
            if store.remove_identity(&id).await? {
                println!("Removed {id}");
            } else {
                bail!("no identity with id {id}");
            }
        }
        Commands::Checkins { limit } => {
            let checkins = store.recent_checkins(limit).await?;
            if checkins.is_empty() {
                println!("No check-ins recorded");
            }
            for stored in checkins {
                let event = stored.event;
                println!(
                    "#{:<6} {}  {:<24} similarity={:.3}",
                    stored.id,
                    event.occurred_at.format("%Y-%m-%d %H:%M:%S"),
                    event.display_name,
                    event.similarity
                );
            }
        }
        Commands::Stats => {
            let identities = store.count_identities().await?;
            let checkins = store.count_checkins().await?;
            let latest = store.recent_checkins(1).await?;
            let summary = serde_json::json!({
                "totalIdentities": identities,
                "totalCheckins": checkins,
                "lastCheckin": latest.first().map(|c| c.event.occurred_at.to_rfc3339()),
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_and_wrapped_embeddings() {
        assert_eq!(parse_embedding("[0.1, 0.2, 0.3]").unwrap().dim(), 3);
        assert_eq!(
            parse_embedding(r#"{"embedding": [1, 0]}"#).unwrap().values,
            vec![1.0, 0.0]
        );
    }

    #[test]
    fn test_parse_rejects_empty_and_garbage() {
        assert!(parse_embedding("[]").is_err());
        assert!(parse_embedding(r#"{"faces": []}"#).is_err());
        assert!(parse_embedding("not json").is_err());
    }

    #[test]
    fn test_cli_parses_enroll() {
        let cli = Cli::try_parse_from([
            "noel", "--db", "/tmp/x.db", "enroll", "--name", "Alice", "--embedding", "a.json",
        ])
        .unwrap();
        assert_eq!(cli.db, PathBuf::from("/tmp/x.db"));
        assert!(matches!(cli.command, Commands::Enroll { ref name, .. } if name == "Alice"));
    }
}
