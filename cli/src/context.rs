use crate::workdir::Workdir;
use anyhow::{anyhow, Result};
use coffre_core::cache::Cache;
use coffre_core::crypto::{Keypair, Secret};
use coffre_core::Repository;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Everything a command needs besides its own flags: workdir, cache
/// location, target repository and provenance fields.
pub struct Context {
    pub workdir_path: PathBuf,
    pub cache_path: PathBuf,
    pub repository: String,
    pub no_cache: bool,
    pub passphrase: Option<String>,

    pub username: String,
    pub hostname: String,
    pub machine_id: String,
    pub command_line: String,
}

impl Context {
    pub fn new(
        workdir: Option<PathBuf>,
        repository: Option<String>,
        no_cache: bool,
        passphrase: Option<String>,
    ) -> Result<Self> {
        let home = std::env::var("HOME").map_err(|_| anyhow!("HOME is not set"))?;
        let workdir_path = workdir.unwrap_or_else(|| PathBuf::from(&home).join(".coffre"));
        let cache_path = workdir_path.join("cache");
        let repository = repository.unwrap_or_else(|| {
            workdir_path.join("repository").to_string_lossy().into_owned()
        });

        let username = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".to_string());
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string());
        let machine_id = Uuid::new_v5(&Uuid::NAMESPACE_DNS, hostname.as_bytes()).to_string();
        let command_line = std::env::args().collect::<Vec<_>>().join(" ");

        Ok(Self {
            workdir_path,
            cache_path,
            repository,
            no_cache,
            passphrase,
            username,
            hostname,
            machine_id,
            command_line,
        })
    }

    pub fn workdir(&self) -> Result<Workdir> {
        Workdir::open(&self.workdir_path)
            .map_err(|_| anyhow!("no workdir at {}, run `coffre init` first", self.workdir_path.display()))
    }

    pub async fn open_repository(&self) -> Result<Arc<Repository>> {
        self.open_repository_at(&self.repository).await
    }

    /// Open a repository and thread the secret, cache and provenance into
    /// the handle.
    pub async fn open_repository_at(&self, location: &str) -> Result<Arc<Repository>> {
        debug!(location, "opening repository");
        let mut repository = coffre_backends::open(location).await?;

        let config = repository.configuration();
        if config.encrypted() {
            let workdir = self.workdir()?;
            let keypair = self.unlock_keypair(&workdir)?;

            let secret_uuid = Uuid::parse_str(&config.encryption)
                .map_err(|_| anyhow!("repository has a malformed secret uuid"))?;
            let sealed = workdir.load_secret(secret_uuid)?;
            let secret = Secret::open(&keypair, &sealed)
                .map_err(|_| anyhow!("could not unwrap master secret {}", secret_uuid))?;
            if secret.uuid != secret_uuid {
                return Err(anyhow!("secret {} does not match repository", secret.uuid));
            }

            repository.set_secret(Some(secret));
            repository.set_keypair(Some(keypair));
        }

        if !self.no_cache {
            repository.set_cache(Some(Cache::create(&self.cache_path).await?));
        }
        repository.set_username(&self.username);
        repository.set_hostname(&self.hostname);
        repository.set_command_line(&self.command_line);
        repository.set_machine_id(&self.machine_id);

        Ok(Arc::new(repository))
    }

    /// Load the keypair, prompting for the passphrase until it opens.
    pub fn unlock_keypair(&self, workdir: &Workdir) -> Result<Keypair> {
        let sealed = workdir.load_keypair()?;

        if let Some(passphrase) = &self.passphrase {
            return Keypair::open(passphrase.as_bytes(), &sealed)
                .map_err(|_| anyhow!("bad passphrase"));
        }

        loop {
            eprint!("passphrase: ");
            std::io::stderr().flush()?;
            let passphrase = rpassword::read_password()?;
            match Keypair::open(passphrase.as_bytes(), &sealed) {
                Ok(keypair) => return Ok(keypair),
                Err(e) => eprintln!("{}", e),
            }
        }
    }

    /// Prompt twice for a new passphrase until both entries agree.
    pub fn new_passphrase(&self) -> Result<String> {
        if let Some(passphrase) = &self.passphrase {
            return Ok(passphrase.clone());
        }

        loop {
            eprint!("passphrase: ");
            std::io::stderr().flush()?;
            let first = rpassword::read_password()?;
            if first.is_empty() {
                eprintln!("passphrase must not be empty");
                continue;
            }
            eprint!("passphrase (confirm): ");
            std::io::stderr().flush()?;
            let second = rpassword::read_password()?;
            if first == second {
                return Ok(first);
            }
            eprintln!("passphrases do not match");
        }
    }
}
