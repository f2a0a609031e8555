use anyhow::{anyhow, Context as _, Result};
use std::path::{Path, PathBuf};
use uuid::Uuid;

const KEYPAIR_FILE: &str = "keypair";

/// The user's key material directory (`~/.coffre` by default): one
/// passphrase-wrapped keypair plus, per repository secret UUID, the
/// keypair-wrapped master secret.
pub struct Workdir {
    root: PathBuf,
}

impl Workdir {
    pub fn create(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if root.join(KEYPAIR_FILE).exists() {
            return Err(anyhow!("workdir already initialized at {}", root.display()));
        }
        std::fs::create_dir_all(root.join("secrets"))?;
        Ok(Self { root })
    }

    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(anyhow!("no workdir at {}", root.display()));
        }
        Ok(Self { root })
    }

    pub fn save_keypair(&self, sealed: &[u8]) -> Result<()> {
        std::fs::write(self.root.join(KEYPAIR_FILE), sealed)?;
        Ok(())
    }

    pub fn load_keypair(&self) -> Result<Vec<u8>> {
        std::fs::read(self.root.join(KEYPAIR_FILE))
            .with_context(|| format!("no keypair in {}, run `coffre init`", self.root.display()))
    }

    pub fn save_secret(&self, uuid: Uuid, sealed: &[u8]) -> Result<()> {
        let dir = self.root.join("secrets");
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(uuid.to_string()), sealed)?;
        Ok(())
    }

    pub fn load_secret(&self, uuid: Uuid) -> Result<Vec<u8>> {
        std::fs::read(self.root.join("secrets").join(uuid.to_string()))
            .with_context(|| format!("no master secret {} in workdir", uuid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = Workdir::create(dir.path().join("wd")).unwrap();
        workdir.save_keypair(b"sealed-keypair").unwrap();

        let uuid = Uuid::new_v4();
        workdir.save_secret(uuid, b"sealed-secret").unwrap();

        let reopened = Workdir::open(dir.path().join("wd")).unwrap();
        assert_eq!(reopened.load_keypair().unwrap(), b"sealed-keypair");
        assert_eq!(reopened.load_secret(uuid).unwrap(), b"sealed-secret");
        assert!(reopened.load_secret(Uuid::new_v4()).is_err());
    }

    #[test]
    fn create_refuses_initialized_workdir() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = Workdir::create(dir.path().join("wd")).unwrap();
        workdir.save_keypair(b"sealed").unwrap();
        assert!(Workdir::create(dir.path().join("wd")).is_err());
    }
}
