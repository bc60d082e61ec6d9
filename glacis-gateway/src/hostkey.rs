//! Stable SSH host key: generated once at first boot, persisted with
//! permissions 0600.

use anyhow::{Context, Result};
use russh::keys::{decode_secret_key, Algorithm, PrivateKey};
use std::path::Path;
use tracing::info;

pub fn load_or_generate(path: &Path) -> Result<PrivateKey> {
    if path.exists() {
        let pem = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read host key {}", path.display()))?;
        let key = decode_secret_key(&pem, None)
            .with_context(|| format!("corrupt host key {}", path.display()))?;
        return Ok(key);
    }

    info!(path = %path.display(), "generating SSH host key");
    let key = PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519)
        .context("host key generation failed")?;
    let pem = key
        .to_openssh(Default::default())
        .context("host key encoding failed")?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    write_private(path, pem.as_bytes())?;
    Ok(key)
}

fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    file.write_all(contents)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_then_reload_same_key() {
        let dir = std::env::temp_dir().join(format!("glacis-hostkey-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let path = dir.join("host_key");

        let generated = load_or_generate(&path).expect("generate");
        let reloaded = load_or_generate(&path).expect("reload");
        assert_eq!(
            generated.public_key().to_openssh().expect("pub"),
            reloaded.public_key().to_openssh().expect("pub")
        );

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_key_file_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = std::env::temp_dir().join(format!("glacis-hostkey-mode-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let path = dir.join("host_key");

        let _ = load_or_generate(&path).expect("generate");
        let mode = std::fs::metadata(&path).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
