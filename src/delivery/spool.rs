use super::{Deliver, DeliveryError, Envelope};
use crate::message::OutgoingMessage;
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static SPOOL_SEQUENCE: AtomicU64 = AtomicU64::new(0);

fn unique_name(hostname: &str) -> String {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    format!(
        "{}.{:06}.{}.{}.{}",
        now.as_secs(),
        now.subsec_micros(),
        std::process::id(),
        SPOOL_SEQUENCE.fetch_add(1, Ordering::Relaxed),
        hostname.replace('/', "_")
    )
}

/// Message with the envelope recorded as leading headers.
fn with_envelope(message: &OutgoingMessage, envelope: &Envelope) -> OutgoingMessage {
    let mut spooled = message.clone();
    spooled.prepend_header("X-Envelope-To", &envelope.recipient);
    spooled.prepend_header("X-Envelope-From", &format!("<{}>", envelope.sender));
    spooled
}

/// Write into `directory` under a hidden name, then rename so the consumer
/// never sees a partial file.
fn drop_file(directory: &Path, hostname: &str, content: &[u8], mode: u32) -> Result<PathBuf, DeliveryError> {
    let name = unique_name(hostname);
    let tmp_path = directory.join(format!(".{name}.tmp"));
    let final_path = directory.join(&name);

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&tmp_path)
        .map_err(DeliveryError::io(format!("creating {}", tmp_path.display())))?;
    let written = file
        .write_all(content)
        .and_then(|_| file.sync_all())
        .and_then(|_| fs::set_permissions(&tmp_path, fs::Permissions::from_mode(mode)));
    drop(file);
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp_path);
        return Err(DeliveryError::Io {
            context: format!("writing {}", tmp_path.display()),
            source: e,
        });
    }

    fs::rename(&tmp_path, &final_path).map_err(|source| {
        let _ = fs::remove_file(&tmp_path);
        DeliveryError::Io {
            context: format!("moving spool file into {}", directory.display()),
            source,
        }
    })?;
    Ok(final_path)
}

/// Direct drop into the MTA's incoming queue directory, handing the file to
/// the queue owner.
pub struct QueueBackend {
    directory: PathBuf,
    owner_uid: Option<u32>,
    owner_gid: Option<u32>,
    hostname: String,
}

impl QueueBackend {
    pub fn new(directory: PathBuf, owner_uid: Option<u32>, owner_gid: Option<u32>, hostname: &str) -> Self {
        Self {
            directory,
            owner_uid,
            owner_gid,
            hostname: hostname.to_string(),
        }
    }
}

impl Deliver for QueueBackend {
    fn name(&self) -> &'static str {
        "queue-drop"
    }

    fn deliver(&self, message: &OutgoingMessage, envelope: &Envelope) -> Result<(), DeliveryError> {
        let content = with_envelope(message, envelope).to_bytes();
        let path = drop_file(&self.directory, &self.hostname, &content, 0o600)?;
        if self.owner_uid.is_some() || self.owner_gid.is_some() {
            std::os::unix::fs::chown(&path, self.owner_uid, self.owner_gid).map_err(|source| {
                let _ = fs::remove_file(&path);
                DeliveryError::Io {
                    context: format!("changing owner of {}", path.display()),
                    source,
                }
            })?;
        }
        log::debug!("Queued {} for {}", path.display(), envelope.recipient);
        Ok(())
    }
}

/// Drop into a world-readable pickup directory scanned by the MTA.
pub struct PickupBackend {
    directory: PathBuf,
    hostname: String,
}

impl PickupBackend {
    pub fn new(directory: PathBuf, hostname: &str) -> Self {
        Self {
            directory,
            hostname: hostname.to_string(),
        }
    }
}

impl Deliver for PickupBackend {
    fn name(&self) -> &'static str {
        "pickup"
    }

    fn deliver(&self, message: &OutgoingMessage, envelope: &Envelope) -> Result<(), DeliveryError> {
        let content = with_envelope(message, envelope).to_bytes();
        let path = drop_file(&self.directory, &self.hostname, &content, 0o644)?;
        log::debug!("Dropped {} for pickup", path.display());
        Ok(())
    }
}
